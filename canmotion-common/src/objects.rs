//! Object dictionary values
//!
//! The objects handled by the master are fixed width integers of 8, 16 or 32 bits. Whether a
//! value is signed is a property of the drive's object, not of the bytes on the bus, so an
//! [`ObjectValue`] stores the raw bits and its width, and the reader picks the interpretation.

use snafu::Snafu;

/// Width of an object dictionary value
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjectSize {
    /// 8-bit value
    Bits8,
    /// 16-bit value
    Bits16,
    /// 32-bit value
    Bits32,
}

impl ObjectSize {
    /// Get the size from a number of bits, as stored in PDO mapping entries
    pub const fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            8 => Some(Self::Bits8),
            16 => Some(Self::Bits16),
            32 => Some(Self::Bits32),
            _ => None,
        }
    }

    /// Get the size from a number of bytes
    pub const fn from_bytes(bytes: usize) -> Option<Self> {
        match bytes {
            1 => Some(Self::Bits8),
            2 => Some(Self::Bits16),
            4 => Some(Self::Bits32),
            _ => None,
        }
    }

    /// Number of bytes
    pub const fn bytes(&self) -> usize {
        match self {
            Self::Bits8 => 1,
            Self::Bits16 => 2,
            Self::Bits32 => 4,
        }
    }

    /// Number of bits
    pub const fn bits(&self) -> u8 {
        self.bytes() as u8 * 8
    }

    const fn mask(&self) -> u32 {
        match self {
            Self::Bits8 => 0xFF,
            Self::Bits16 => 0xFFFF,
            Self::Bits32 => 0xFFFF_FFFF,
        }
    }
}

/// Error returned when a byte slice cannot be converted to an [`ObjectValue`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Snafu)]
#[snafu(display("{len} bytes is not a valid object size"))]
pub struct InvalidObjectSizeError {
    /// The length of the offending slice
    pub len: usize,
}

/// A fixed width integer value of an object dictionary entry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObjectValue {
    raw: u32,
    size: ObjectSize,
}

impl ObjectValue {
    /// Create a value from raw bits. Bits above `size` are discarded.
    pub const fn new(raw: u32, size: ObjectSize) -> Self {
        Self {
            raw: raw & size.mask(),
            size,
        }
    }

    /// Decode a little endian value of 1, 2 or 4 bytes
    pub fn from_le_bytes(bytes: &[u8]) -> Result<Self, InvalidObjectSizeError> {
        let size = ObjectSize::from_bytes(bytes.len())
            .ok_or(InvalidObjectSizeSnafu { len: bytes.len() }.build())?;
        let mut buf = [0u8; 4];
        buf[..bytes.len()].copy_from_slice(bytes);
        Ok(Self::new(u32::from_le_bytes(buf), size))
    }

    /// Encode the value as little endian bytes
    ///
    /// Only the first `size().bytes()` bytes of the returned buffer are meaningful
    pub fn to_le_bytes(&self) -> ([u8; 4], usize) {
        (self.raw.to_le_bytes(), self.size.bytes())
    }

    /// The width of the value
    pub const fn size(&self) -> ObjectSize {
        self.size
    }

    /// The value, zero extended to 32 bits
    pub const fn as_u32(&self) -> u32 {
        self.raw
    }

    /// The value interpreted as signed, sign extended to 32 bits
    pub const fn as_i32(&self) -> i32 {
        match self.size {
            ObjectSize::Bits8 => self.raw as u8 as i8 as i32,
            ObjectSize::Bits16 => self.raw as u16 as i16 as i32,
            ObjectSize::Bits32 => self.raw as i32,
        }
    }

    /// The value truncated to 16 bits
    pub const fn as_u16(&self) -> u16 {
        self.raw as u16
    }

    /// The value truncated to 8 bits
    pub const fn as_u8(&self) -> u8 {
        self.raw as u8
    }

    /// The value truncated to 16 bits, as signed
    pub const fn as_i16(&self) -> i16 {
        self.raw as u16 as i16
    }

    /// The value truncated to 8 bits, as signed
    pub const fn as_i8(&self) -> i8 {
        self.raw as u8 as i8
    }
}

macro_rules! impl_from_int {
    ($type: ty, $size: expr, $unsigned: ty) => {
        impl From<$type> for ObjectValue {
            fn from(value: $type) -> Self {
                Self::new(value as $unsigned as u32, $size)
            }
        }
    };
}

impl_from_int!(u8, ObjectSize::Bits8, u8);
impl_from_int!(i8, ObjectSize::Bits8, u8);
impl_from_int!(u16, ObjectSize::Bits16, u16);
impl_from_int!(i16, ObjectSize::Bits16, u16);
impl_from_int!(u32, ObjectSize::Bits32, u32);
impl_from_int!(i32, ObjectSize::Bits32, u32);

impl core::fmt::Display for ObjectValue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "0x{:0width$X}", self.raw, width = self.size.bytes() * 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_extension() {
        let v = ObjectValue::from(-2i16);
        assert_eq!(ObjectSize::Bits16, v.size());
        assert_eq!(0xFFFE, v.as_u32());
        assert_eq!(-2, v.as_i32());

        let v = ObjectValue::from(-1000i32);
        assert_eq!(-1000, v.as_i32());

        let v = ObjectValue::from(200u8);
        assert_eq!(200, v.as_u32());
        assert_eq!(-56, v.as_i32());
    }

    #[test]
    fn test_bytes() {
        let v = ObjectValue::from_le_bytes(&[0x3F, 0x00]).unwrap();
        assert_eq!(ObjectValue::from(0x3Fu16), v);
        let (bytes, len) = ObjectValue::from(0x12345678u32).to_le_bytes();
        assert_eq!([0x78, 0x56, 0x34, 0x12], bytes);
        assert_eq!(4, len);
        assert_eq!(
            Err(InvalidObjectSizeError { len: 3 }),
            ObjectValue::from_le_bytes(&[1, 2, 3])
        );
    }

    #[test]
    fn test_new_masks_high_bits() {
        let v = ObjectValue::new(0x1_0203, ObjectSize::Bits16);
        assert_eq!(0x0203, v.as_u32());
    }
}
