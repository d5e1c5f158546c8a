//! Error types
//!
//! Every failure the master reports is a [`MasterError`], which falls into exactly one of three
//! classes: something went wrong locally, a node aborted an SDO transfer, or a drive reported a
//! fault of its own. Wire level bits are decoded once, where the frame is received, so callers
//! match on variants instead of testing bits.

use canmotion_common::{
    messages::EmergencyMessage, nmt::NmtState, sdo::AbortCode, sdo::SdoResponse,
};
use snafu::Snafu;

use crate::pdo::PdoChannel;

/// A wrapper around the AbortCode enum to allow for unknown values
///
/// Although the library should "know" all the abort codes, it is possible to receive other values
/// and this allows those to be captured and exposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawAbortCode {
    /// A recognized abort code
    Valid(AbortCode),
    /// An unrecognized abort code
    Unknown(u32),
}

impl RawAbortCode {
    /// The numeric abort code
    pub fn raw(&self) -> u32 {
        match self {
            RawAbortCode::Valid(code) => (*code).into(),
            RawAbortCode::Unknown(code) => *code,
        }
    }
}

impl std::fmt::Display for RawAbortCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RawAbortCode::Valid(abort_code) => write!(f, "{abort_code:?}"),
            RawAbortCode::Unknown(code) => write!(f, "{code:X}"),
        }
    }
}

impl From<u32> for RawAbortCode {
    fn from(value: u32) -> Self {
        match AbortCode::try_from(value) {
            Ok(code) => Self::Valid(code),
            Err(_) => Self::Unknown(value),
        }
    }
}

/// Errors originating in the master itself
#[derive(Clone, Debug, PartialEq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum LocalError {
    /// The configuration supplied by the caller is not usable
    #[snafu(display("Invalid configuration: {message}"))]
    InvalidConfig {
        /// What is wrong with it
        message: String,
    },
    /// An operation named a node which was not registered when the master was created
    #[snafu(display("Node {node} is not registered with the master"))]
    UnknownNode {
        /// The requested node ID
        node: u8,
    },
    /// Failed to write a message to the transport
    #[snafu(display("Failed to send CAN message: {message}"))]
    SocketSendFailed {
        /// A string describing the error reason
        message: String,
    },
    /// Timeout while awaiting an SDO response
    #[snafu(display("No SDO response from node {node} accessing 0x{index:X}sub{sub}"))]
    SdoTimeout {
        /// The addressed node
        node: u8,
        /// Object index
        index: u16,
        /// Object sub index
        sub: u8,
    },
    /// Received a valid SdoResponse, but with an unexpected command specifier
    #[snafu(display("Unexpected SDO response from node {node}. Expected {expecting}, got {response:?}"))]
    UnexpectedResponse {
        /// The responding node
        node: u8,
        /// The type of response which was expected
        expecting: String,
        /// The response which was received
        response: SdoResponse,
    },
    /// The node answered an upload with a segmented transfer, which is not supported
    #[snafu(display("Node {node} requires a segmented transfer for 0x{index:X}sub{sub}"))]
    SegmentedTransfer {
        /// The responding node
        node: u8,
        /// Object index
        index: u16,
        /// Object sub index
        sub: u8,
    },
    /// An upload returned a number of bytes that is not 1, 2 or 4
    #[snafu(display("Node {node} returned {len} bytes for 0x{index:X}sub{sub}"))]
    UnexpectedSize {
        /// The responding node
        node: u8,
        /// Object index
        index: u16,
        /// Object sub index
        sub: u8,
        /// The number of bytes returned
        len: usize,
    },
    /// A node did not report the requested NMT state before the timeout
    #[snafu(display("Node {node} did not confirm NMT state {state}"))]
    NmtConfirmationTimeout {
        /// The node which failed to confirm
        node: u8,
        /// The requested state
        state: NmtState,
    },
    /// A PDO channel was remapped while still active
    #[snafu(display("Node {node} {channel} must be disabled before it is remapped"))]
    ChannelActive {
        /// The node
        node: u8,
        /// The channel
        channel: PdoChannel,
    },
    /// A PDO write used a channel which is not currently configured
    #[snafu(display("Node {node} {channel} is not active"))]
    ChannelInactive {
        /// The node
        node: u8,
        /// The channel
        channel: PdoChannel,
    },
    /// Another task is writing the mapping of this channel
    #[snafu(display("Node {node} {channel} is already being configured"))]
    ChannelBusy {
        /// The node
        node: u8,
        /// The channel
        channel: PdoChannel,
    },
    /// The name is already given to another channel of the node
    #[snafu(display("Node {node}: PDO name {name:?} is already used by {other}"))]
    DuplicateChannelName {
        /// The node
        node: u8,
        /// The requested name
        name: String,
        /// The channel holding the name
        other: PdoChannel,
    },
    /// No PDO channel with this name has been configured
    #[snafu(display("Node {node} has no PDO channel named {name:?}"))]
    UnknownChannel {
        /// The node
        node: u8,
        /// The requested name
        name: String,
    },
    /// A PDO mapping or PDO write is not compatible with the channel
    #[snafu(display("Node {node} {channel}: {reason}"))]
    InvalidMapping {
        /// The node
        node: u8,
        /// The channel
        channel: PdoChannel,
        /// Explanation
        reason: String,
    },
}

/// The three classes of error a [`MasterError`] can belong to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Master side: configuration, transport, timeouts
    Master,
    /// An SDO abort returned by a node
    Sdo,
    /// A fault reported by a drive, independent of any transaction
    Drive,
}

/// The error type returned by all master operations
#[derive(Clone, Debug, PartialEq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum MasterError {
    /// An error raised by the master itself
    #[snafu(context(false), display("{source}"))]
    Local {
        /// The local error
        source: LocalError,
    },
    /// A node aborted an SDO transfer
    #[snafu(display("Node {node} aborted access to 0x{index:X}sub{sub}: {abort_code}"))]
    SdoAbort {
        /// The node which aborted
        node: u8,
        /// Index of the SDO access which was aborted
        index: u16,
        /// Sub index of the SDO access which was aborted
        sub: u8,
        /// Reason for the abort
        abort_code: RawAbortCode,
    },
    /// A drive reported a fault through an emergency message
    #[snafu(display(
        "Node {node} reported error 0x{error_code:04X} (error register 0x{error_register:02X})"
    ))]
    Drive {
        /// The reporting node
        node: u8,
        /// The emergency error code
        error_code: u16,
        /// The node's error register
        error_register: u8,
        /// Manufacturer specific bytes
        vendor: [u8; 5],
    },
}

impl MasterError {
    /// Which of the three error classes this error belongs to
    pub fn class(&self) -> ErrorClass {
        match self {
            MasterError::Local { .. } => ErrorClass::Master,
            MasterError::SdoAbort { .. } => ErrorClass::Sdo,
            MasterError::Drive { .. } => ErrorClass::Drive,
        }
    }

    /// The raw code carried by remote errors: the SDO abort code, or the emergency error code
    pub fn raw_code(&self) -> Option<u32> {
        match self {
            MasterError::Local { .. } => None,
            MasterError::SdoAbort { abort_code, .. } => Some(abort_code.raw()),
            MasterError::Drive { error_code, .. } => Some(*error_code as u32),
        }
    }

    /// The local error, if this is a master side error
    pub fn as_local(&self) -> Option<&LocalError> {
        match self {
            MasterError::Local { source } => Some(source),
            _ => None,
        }
    }
}

impl From<EmergencyMessage> for MasterError {
    fn from(emcy: EmergencyMessage) -> Self {
        MasterError::Drive {
            node: emcy.node,
            error_code: emcy.error_code,
            error_register: emcy.error_register,
            vendor: emcy.vendor,
        }
    }
}

/// Result type used throughout the master
pub type Result<T> = std::result::Result<T, MasterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let local: MasterError = LocalError::SdoTimeout {
            node: 1,
            index: 0x6040,
            sub: 0,
        }
        .into();
        assert_eq!(ErrorClass::Master, local.class());
        assert_eq!(None, local.raw_code());

        let abort = MasterError::SdoAbort {
            node: 1,
            index: 0x6040,
            sub: 0,
            abort_code: 0x0601_0002.into(),
        };
        assert_eq!(ErrorClass::Sdo, abort.class());
        assert_eq!(Some(0x0601_0002), abort.raw_code());

        let drive: MasterError = EmergencyMessage {
            node: 1,
            error_code: 0x8611,
            error_register: 0x20,
            vendor: [0; 5],
        }
        .into();
        assert_eq!(ErrorClass::Drive, drive.class());
        assert_eq!(Some(0x8611), drive.raw_code());
    }

    #[test]
    fn test_unknown_abort_code_survives() {
        let code = RawAbortCode::from(0x1234_5678);
        assert_eq!(RawAbortCode::Unknown(0x1234_5678), code);
        assert_eq!(0x1234_5678, code.raw());
        assert_eq!(
            RawAbortCode::Valid(AbortCode::ReadOnly),
            RawAbortCode::from(0x0601_0002)
        );
    }
}
