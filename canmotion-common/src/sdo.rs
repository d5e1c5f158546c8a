//! SDO protocol messages
//!
//! Only the expedited transfer is implemented. A server which answers an upload with a segmented
//! transfer can be detected (`e == false` on [`SdoResponse::ConfirmUpload`]) but not followed.

use int_enum::IntEnum;
use snafu::Snafu;

/// Client command specifiers
mod ccs {
    pub const INITIATE_DOWNLOAD: u8 = 1;
    pub const INITIATE_UPLOAD: u8 = 2;
    pub const ABORT: u8 = 4;
}

/// Server command specifiers
mod scs {
    pub const UPLOAD_RESPONSE: u8 = 2;
    pub const DOWNLOAD_RESPONSE: u8 = 3;
    pub const ABORT: u8 = 4;
}

/// SDO abort codes, as defined by CiA 301
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
#[derive(IntEnum)]
pub enum AbortCode {
    /// Toggle bit not alternated
    ToggleNotAlternated = 0x0503_0000,
    /// SDO protocol timed out
    SdoTimeout = 0x0504_0000,
    /// Client/server command specifier not valid or unknown
    InvalidCommandSpecifier = 0x0504_0001,
    /// Invalid block size
    InvalidBlockSize = 0x0504_0002,
    /// Invalid sequence number
    InvalidSequenceNumber = 0x0504_0003,
    /// CRC error
    CrcError = 0x0504_0004,
    /// Out of memory
    OutOfMemory = 0x0504_0005,
    /// Unsupported access to an object
    UnsupportedAccess = 0x0601_0000,
    /// Attempt to read a write only object
    WriteOnly = 0x0601_0001,
    /// Attempt to write a read only object
    ReadOnly = 0x0601_0002,
    /// Object does not exist in the object dictionary
    NoSuchObject = 0x0602_0000,
    /// Object cannot be mapped to the PDO
    UnmappablePdo = 0x0604_0041,
    /// The number and length of the objects to be mapped would exceed PDO length
    PdoTooLong = 0x0604_0042,
    /// General parameter incompatibility reason
    IncompatibleParameter = 0x0604_0043,
    /// General internal incompatibility in the device
    InternalIncompatibility = 0x0604_0047,
    /// Access failed due to a hardware error
    HardwareError = 0x0606_0000,
    /// Data type does not match, length of service parameter does not match
    DataTypeMismatch = 0x0607_0010,
    /// Data type does not match, length of service parameter too high
    DataTypeMismatchLengthHigh = 0x0607_0012,
    /// Data type does not match, length of service parameter too low
    DataTypeMismatchLengthLow = 0x0607_0013,
    /// Sub-index does not exist
    NoSuchSubIndex = 0x0609_0011,
    /// Invalid value for parameter (download only)
    InvalidValue = 0x0609_0030,
    /// Value of parameter written too high
    ValueTooHigh = 0x0609_0031,
    /// Value of parameter written too low
    ValueTooLow = 0x0609_0032,
    /// Resource not available: SDO connection
    ResourceNotAvailable = 0x060A_0023,
    /// General error
    GeneralError = 0x0800_0000,
    /// Data cannot be transferred or stored to the application
    CantStore = 0x0800_0020,
    /// Data cannot be transferred or stored because of local control
    CantStoreLocalControl = 0x0800_0021,
    /// Data cannot be transferred or stored because of the present device state
    CantStoreDeviceState = 0x0800_0022,
    /// No data available
    NoData = 0x0800_0024,
}

/// Error returned when SDO bytes cannot be parsed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Snafu)]
pub enum SdoParseError {
    /// SDO frames always carry 8 bytes
    #[snafu(display("SDO frame has {len} bytes, expected 8"))]
    WrongLength {
        /// The received length
        len: usize,
    },
    /// The command specifier is not one handled by this implementation
    #[snafu(display("Unsupported SDO command byte 0x{byte:02X}"))]
    UnsupportedCommand {
        /// The command byte
        byte: u8,
    },
}

fn check_len(bytes: &[u8]) -> Result<(), SdoParseError> {
    if bytes.len() != 8 {
        WrongLengthSnafu { len: bytes.len() }.fail()
    } else {
        Ok(())
    }
}

fn index_sub(bytes: &[u8]) -> (u16, u8) {
    (u16::from_le_bytes([bytes[1], bytes[2]]), bytes[3])
}

fn data4(bytes: &[u8]) -> [u8; 4] {
    [bytes[4], bytes[5], bytes[6], bytes[7]]
}

fn encode(cmd: u8, index: u16, sub: u8, data: [u8; 4]) -> [u8; 8] {
    let idx = index.to_le_bytes();
    [cmd, idx[0], idx[1], sub, data[0], data[1], data[2], data[3]]
}

/// Number of payload bytes of an expedited transfer, from the size indicator and `n`
fn expedited_len(s: bool, n: u8) -> usize {
    if s {
        4 - n as usize
    } else {
        4
    }
}

/// An SDO request, sent by a client to a server
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SdoRequest {
    /// Download (write) up to 4 bytes in a single frame
    ExpeditedDownload {
        /// Object index
        index: u16,
        /// Object sub index
        sub: u8,
        /// Data bytes, of which `len` are valid
        data: [u8; 4],
        /// Number of valid data bytes
        len: u8,
    },
    /// Start a segmented download. Only ever parsed, never sent by this library.
    InitiateDownload {
        /// Object index
        index: u16,
        /// Object sub index
        sub: u8,
        /// The total transfer size, when indicated
        size: Option<u32>,
    },
    /// Upload (read) an object
    InitiateUpload {
        /// Object index
        index: u16,
        /// Object sub index
        sub: u8,
    },
    /// Abort a transfer
    Abort {
        /// Object index
        index: u16,
        /// Object sub index
        sub: u8,
        /// Abort code
        abort_code: u32,
    },
}

impl SdoRequest {
    /// Create an expedited download request
    ///
    /// # Panics
    /// Panics if data is empty or longer than 4 bytes
    pub fn expedited_download(index: u16, sub: u8, data: &[u8]) -> Self {
        assert!(!data.is_empty() && data.len() <= 4);
        let mut buf = [0u8; 4];
        buf[..data.len()].copy_from_slice(data);
        Self::ExpeditedDownload {
            index,
            sub,
            data: buf,
            len: data.len() as u8,
        }
    }

    /// Create an upload request
    pub fn initiate_upload(index: u16, sub: u8) -> Self {
        Self::InitiateUpload { index, sub }
    }

    /// Create an abort request
    pub fn abort(index: u16, sub: u8, abort_code: AbortCode) -> Self {
        Self::Abort {
            index,
            sub,
            abort_code: abort_code.into(),
        }
    }

    /// The object addressed by the request
    pub fn object(&self) -> (u16, u8) {
        match *self {
            SdoRequest::ExpeditedDownload { index, sub, .. }
            | SdoRequest::InitiateDownload { index, sub, .. }
            | SdoRequest::InitiateUpload { index, sub }
            | SdoRequest::Abort { index, sub, .. } => (index, sub),
        }
    }

    /// Serialize the request to frame bytes
    pub fn to_bytes(&self) -> [u8; 8] {
        match *self {
            SdoRequest::ExpeditedDownload {
                index,
                sub,
                data,
                len,
            } => {
                let n = 4 - len;
                let cmd = (ccs::INITIATE_DOWNLOAD << 5) | (n << 2) | 0b11;
                encode(cmd, index, sub, data)
            }
            SdoRequest::InitiateDownload { index, sub, size } => {
                let cmd = (ccs::INITIATE_DOWNLOAD << 5) | size.is_some() as u8;
                encode(cmd, index, sub, size.unwrap_or(0).to_le_bytes())
            }
            SdoRequest::InitiateUpload { index, sub } => {
                encode(ccs::INITIATE_UPLOAD << 5, index, sub, [0; 4])
            }
            SdoRequest::Abort {
                index,
                sub,
                abort_code,
            } => encode(ccs::ABORT << 5, index, sub, abort_code.to_le_bytes()),
        }
    }
}

impl TryFrom<&[u8]> for SdoRequest {
    type Error = SdoParseError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        check_len(bytes)?;
        let cmd = bytes[0];
        let (index, sub) = index_sub(bytes);
        match cmd >> 5 {
            ccs::INITIATE_DOWNLOAD => {
                let e = cmd & 0b10 != 0;
                let s = cmd & 0b01 != 0;
                if e {
                    let n = (cmd >> 2) & 0b11;
                    Ok(SdoRequest::ExpeditedDownload {
                        index,
                        sub,
                        data: data4(bytes),
                        len: expedited_len(s, n) as u8,
                    })
                } else {
                    let size = s.then(|| u32::from_le_bytes(data4(bytes)));
                    Ok(SdoRequest::InitiateDownload { index, sub, size })
                }
            }
            ccs::INITIATE_UPLOAD => Ok(SdoRequest::InitiateUpload { index, sub }),
            ccs::ABORT => Ok(SdoRequest::Abort {
                index,
                sub,
                abort_code: u32::from_le_bytes(data4(bytes)),
            }),
            _ => UnsupportedCommandSnafu { byte: cmd }.fail(),
        }
    }
}

/// An SDO response, sent by a server to a client
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SdoResponse {
    /// A download was accepted
    ConfirmDownload {
        /// Object index
        index: u16,
        /// Object sub index
        sub: u8,
    },
    /// Response to an upload request
    ConfirmUpload {
        /// Number of bytes in data which do not contain data (valid when `e` and `s` are set)
        n: u8,
        /// Expedited flag
        e: bool,
        /// Size indicated flag
        s: bool,
        /// Object index
        index: u16,
        /// Object sub index
        sub: u8,
        /// Data bytes (expedited) or size (segmented)
        data: [u8; 4],
    },
    /// The server aborted the transfer
    Abort {
        /// Object index
        index: u16,
        /// Object sub index
        sub: u8,
        /// Abort code
        abort_code: u32,
    },
}

impl SdoResponse {
    /// Create a download confirmation
    pub fn download_acknowledge(index: u16, sub: u8) -> Self {
        Self::ConfirmDownload { index, sub }
    }

    /// Create an expedited upload response
    ///
    /// # Panics
    /// Panics if data is empty or longer than 4 bytes
    pub fn expedited_upload(index: u16, sub: u8, data: &[u8]) -> Self {
        assert!(!data.is_empty() && data.len() <= 4);
        let mut buf = [0u8; 4];
        buf[..data.len()].copy_from_slice(data);
        Self::ConfirmUpload {
            n: (4 - data.len()) as u8,
            e: true,
            s: true,
            index,
            sub,
            data: buf,
        }
    }

    /// Create an abort response
    pub fn abort(index: u16, sub: u8, abort_code: AbortCode) -> Self {
        Self::Abort {
            index,
            sub,
            abort_code: abort_code.into(),
        }
    }

    /// The object the response refers to
    pub fn object(&self) -> (u16, u8) {
        match *self {
            SdoResponse::ConfirmDownload { index, sub }
            | SdoResponse::ConfirmUpload { index, sub, .. }
            | SdoResponse::Abort { index, sub, .. } => (index, sub),
        }
    }

    /// The valid data bytes of an expedited upload response
    pub fn expedited_data(&self) -> Option<&[u8]> {
        match self {
            SdoResponse::ConfirmUpload {
                n, e: true, s, data, ..
            } => Some(&data[..expedited_len(*s, *n)]),
            _ => None,
        }
    }

    /// Serialize the response to frame bytes
    pub fn to_bytes(&self) -> [u8; 8] {
        match *self {
            SdoResponse::ConfirmDownload { index, sub } => {
                encode(scs::DOWNLOAD_RESPONSE << 5, index, sub, [0; 4])
            }
            SdoResponse::ConfirmUpload {
                n,
                e,
                s,
                index,
                sub,
                data,
            } => {
                let cmd = (scs::UPLOAD_RESPONSE << 5) | ((n & 0b11) << 2) | ((e as u8) << 1) | s as u8;
                encode(cmd, index, sub, data)
            }
            SdoResponse::Abort {
                index,
                sub,
                abort_code,
            } => encode(scs::ABORT << 5, index, sub, abort_code.to_le_bytes()),
        }
    }
}

impl TryFrom<&[u8]> for SdoResponse {
    type Error = SdoParseError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        check_len(bytes)?;
        let cmd = bytes[0];
        let (index, sub) = index_sub(bytes);
        match cmd >> 5 {
            scs::DOWNLOAD_RESPONSE => Ok(SdoResponse::ConfirmDownload { index, sub }),
            scs::UPLOAD_RESPONSE => Ok(SdoResponse::ConfirmUpload {
                n: (cmd >> 2) & 0b11,
                e: cmd & 0b10 != 0,
                s: cmd & 0b01 != 0,
                index,
                sub,
                data: data4(bytes),
            }),
            scs::ABORT => Ok(SdoResponse::Abort {
                index,
                sub,
                abort_code: u32::from_le_bytes(data4(bytes)),
            }),
            _ => UnsupportedCommandSnafu { byte: cmd }.fail(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expedited_download_bytes() {
        let req = SdoRequest::expedited_download(0x6040, 0, &[0x3F, 0x00]);
        assert_eq!([0x2B, 0x40, 0x60, 0x00, 0x3F, 0x00, 0, 0], req.to_bytes());
        let req = SdoRequest::expedited_download(0x1017, 0, &[0xE8, 0x03, 0, 0]);
        assert_eq!(0x23, req.to_bytes()[0]);
        let req = SdoRequest::expedited_download(0x6060, 0, &[3]);
        assert_eq!(0x2F, req.to_bytes()[0]);
        assert_eq!(
            req,
            SdoRequest::try_from(&req.to_bytes()[..]).unwrap()
        );
    }

    #[test]
    fn test_upload_response() {
        let bytes = [0x4B, 0x41, 0x60, 0x00, 0x37, 0x06, 0, 0];
        let resp = SdoResponse::try_from(&bytes[..]).unwrap();
        assert_eq!((0x6041, 0), resp.object());
        assert_eq!(Some(&[0x37, 0x06][..]), resp.expedited_data());
        assert_eq!(bytes, resp.to_bytes());
    }

    #[test]
    fn test_segmented_upload_is_not_expedited() {
        let bytes = [0x41, 0x08, 0x10, 0x00, 20, 0, 0, 0];
        let resp = SdoResponse::try_from(&bytes[..]).unwrap();
        assert_eq!(None, resp.expedited_data());
    }

    #[test]
    fn test_abort() {
        let resp = SdoResponse::abort(0x2000, 1, AbortCode::NoSuchObject);
        assert_eq!(
            [0x80, 0x00, 0x20, 0x01, 0x00, 0x00, 0x02, 0x06],
            resp.to_bytes()
        );
        assert_eq!(Ok(AbortCode::NoSuchObject), AbortCode::try_from(0x0602_0000));
        assert!(AbortCode::try_from(0x1234).is_err());
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            Err(SdoParseError::WrongLength { len: 3 }),
            SdoResponse::try_from(&[0x60, 0, 0][..])
        );
        assert_eq!(
            Err(SdoParseError::UnsupportedCommand { byte: 0xA0 }),
            SdoResponse::try_from(&[0xA0, 0, 0, 0, 0, 0, 0, 0][..])
        );
    }
}
