//! Definitions and data types related to PDOs

use crate::objects::ObjectSize;

/// The number of PDO channels in each direction
pub const PDO_CHANNELS: u8 = 4;

/// The most entries a single PDO can map, since each must be at least 8 bits
pub const MAX_MAPPED_ENTRIES: usize = 8;

/// The most bits a single PDO can carry
pub const MAX_MAPPED_BITS: u32 = 64;

/// Represents a PDO mapping
///
/// Each mapping specifies one sub-object to be included in the PDO data bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "std",
    derive(serde::Deserialize),
    serde(deny_unknown_fields)
)]
pub struct PdoMapping {
    /// The object index
    pub index: u16,
    /// The object sub index
    pub sub: u8,
    /// The size of the object to map, in **bits**
    pub size: u8,
}

impl PdoMapping {
    /// Create a new mapping for an object of the given width
    pub const fn new(index: u16, sub: u8, size: ObjectSize) -> Self {
        Self {
            index,
            sub,
            size: size.bits(),
        }
    }

    /// Convert a PdoMapping object to the u32 representation stored in the PdoMapping object
    pub fn to_object_value(&self) -> u32 {
        ((self.index as u32) << 16) | ((self.sub as u32) << 8) | (self.size as u32)
    }

    /// Create a PdoMapping object from the raw u32 representation stored in the PdoMapping object
    pub fn from_object_value(value: u32) -> Self {
        let index = (value >> 16) as u16;
        let sub = ((value >> 8) & 0xff) as u8;
        let size = (value & 0xff) as u8;
        Self { index, sub, size }
    }

    /// The width of the mapped object, if it is one of the supported integer widths
    pub fn object_size(&self) -> Option<ObjectSize> {
        ObjectSize::from_bits(self.size)
    }
}

/// Total number of bits carried by a list of mappings
pub fn mapped_bits(mappings: &[PdoMapping]) -> u32 {
    mappings.iter().map(|m| m.size as u32).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_object_value() {
        let m = PdoMapping::new(0x6064, 0, ObjectSize::Bits32);
        assert_eq!(0x6064_0020, m.to_object_value());
        assert_eq!(m, PdoMapping::from_object_value(0x6064_0020));
        assert_eq!(Some(ObjectSize::Bits32), m.object_size());
    }

    #[test]
    fn test_mapped_bits() {
        let maps = [
            PdoMapping::new(0x6041, 0, ObjectSize::Bits16),
            PdoMapping::new(0x6064, 0, ObjectSize::Bits32),
        ];
        assert_eq!(48, mapped_bits(&maps));
    }
}
