//! CAN frame types, COB-ID classification and the fixed-format CANopen messages
//!
//! Everything here is a plain value type. SDO payloads are handled in [`crate::sdo`].

use int_enum::IntEnum;
use snafu::Snafu;

use crate::constants::cob_ids;
use crate::nmt::NmtState;
use crate::sdo::{SdoRequest, SdoResponse};

/// A CAN identifier, either 11-bit standard or 29-bit extended
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CanId {
    /// An 11-bit standard identifier
    Std(u16),
    /// A 29-bit extended identifier
    Extended(u32),
}

impl CanId {
    /// Create a standard ID
    pub const fn std(id: u16) -> Self {
        Self::Std(id)
    }

    /// Create an extended ID
    pub const fn extended(id: u32) -> Self {
        Self::Extended(id)
    }

    /// Get the raw numeric value of the ID
    pub const fn raw(&self) -> u32 {
        match self {
            CanId::Std(id) => *id as u32,
            CanId::Extended(id) => *id,
        }
    }

    /// Returns true for 29-bit identifiers
    pub const fn is_extended(&self) -> bool {
        matches!(self, CanId::Extended(_))
    }
}

impl core::fmt::Display for CanId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            CanId::Std(id) => write!(f, "0x{id:03X}"),
            CanId::Extended(id) => write!(f, "0x{id:08X}x"),
        }
    }
}

/// The NMT command COB-ID
pub const NMT_CMD_ID: CanId = CanId::Std(cob_ids::NMT);
/// The SYNC COB-ID
pub const SYNC_ID: CanId = CanId::Std(cob_ids::SYNC_EMCY);

/// A classic CAN frame, with up to 8 data bytes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CanMessage {
    /// The frame identifier
    pub id: CanId,
    data: [u8; 8],
    dlc: u8,
    rtr: bool,
}

impl CanMessage {
    /// Create a new data frame
    ///
    /// # Panics
    /// Panics if `data` is longer than 8 bytes
    pub fn new(id: CanId, data: &[u8]) -> Self {
        assert!(data.len() <= 8, "CAN frames carry at most 8 bytes");
        let mut buf = [0u8; 8];
        buf[..data.len()].copy_from_slice(data);
        Self {
            id,
            data: buf,
            dlc: data.len() as u8,
            rtr: false,
        }
    }

    /// Create a remote transmission request frame
    pub fn new_rtr(id: CanId) -> Self {
        Self {
            id,
            data: [0; 8],
            dlc: 0,
            rtr: true,
        }
    }

    /// The frame identifier
    pub fn id(&self) -> CanId {
        self.id
    }

    /// The payload bytes
    pub fn data(&self) -> &[u8] {
        &self.data[..self.dlc as usize]
    }

    /// The data length code
    pub fn dlc(&self) -> u8 {
        self.dlc
    }

    /// True if this is a remote request frame
    pub fn is_rtr(&self) -> bool {
        self.rtr
    }
}

/// Bus level errors reported by a CAN controller
#[derive(Clone, Copy, Debug, PartialEq, Eq, Snafu)]
pub enum CanError {
    /// The controller lost arbitration or saw a bit error
    Bit,
    /// A bit stuffing error was detected
    Stuff,
    /// A frame format error was detected
    Form,
    /// A transmitted frame was not acknowledged
    Ack,
    /// A CRC error was detected
    Crc,
    /// Any other error, with the raw error bits
    #[snafu(display("CAN error 0x{raw:02X}"))]
    Other {
        /// Raw error bits as reported by the interface
        raw: u8,
    },
}

impl CanError {
    /// Convert raw error class bits into a CanError
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0x01 => Self::Bit,
            0x02 => Self::Stuff,
            0x04 => Self::Form,
            0x08 => Self::Ack,
            0x10 => Self::Crc,
            raw => Self::Other { raw },
        }
    }
}

/// The function code portion of a COB-ID, as used by the predefined connection set
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FunctionCode {
    /// Network management command
    Nmt,
    /// SYNC object
    Sync,
    /// Emergency object
    Emergency,
    /// Transmit PDO (node -> master), channel 1-4
    Tpdo(u8),
    /// Receive PDO (master -> node), channel 1-4
    Rpdo(u8),
    /// SDO response (server -> client)
    SdoResponse,
    /// SDO request (client -> server)
    SdoRequest,
    /// Heartbeat / boot-up
    Heartbeat,
}

impl FunctionCode {
    /// Split a COB-ID into function code and node ID
    ///
    /// Returns None for extended IDs and for IDs which are not part of the predefined connection
    /// set. The node ID is 0 for the broadcast objects (NMT and SYNC).
    pub fn classify(id: CanId) -> Option<(FunctionCode, u8)> {
        let CanId::Std(raw) = id else {
            return None;
        };
        if raw == cob_ids::NMT {
            return Some((FunctionCode::Nmt, 0));
        }
        if raw == cob_ids::SYNC_EMCY {
            return Some((FunctionCode::Sync, 0));
        }
        let node = (raw & 0x7F) as u8;
        if node == 0 {
            return None;
        }
        let function = match raw & 0x780 {
            0x080 => FunctionCode::Emergency,
            0x180 => FunctionCode::Tpdo(1),
            0x200 => FunctionCode::Rpdo(1),
            0x280 => FunctionCode::Tpdo(2),
            0x300 => FunctionCode::Rpdo(2),
            0x380 => FunctionCode::Tpdo(3),
            0x400 => FunctionCode::Rpdo(3),
            0x480 => FunctionCode::Tpdo(4),
            0x500 => FunctionCode::Rpdo(4),
            0x580 => FunctionCode::SdoResponse,
            0x600 => FunctionCode::SdoRequest,
            0x700 => FunctionCode::Heartbeat,
            _ => return None,
        };
        Some((function, node))
    }

    /// Build the COB-ID for this function code addressed to `node`
    ///
    /// For PDOs, the channel number must be in 1..=4.
    pub fn cob_id(&self, node: u8) -> CanId {
        let base = match self {
            FunctionCode::Nmt => return NMT_CMD_ID,
            FunctionCode::Sync => return SYNC_ID,
            FunctionCode::Emergency => cob_ids::SYNC_EMCY,
            FunctionCode::Tpdo(n) => cob_ids::TPDO1 + (*n as u16 - 1) * 0x100,
            FunctionCode::Rpdo(n) => cob_ids::RPDO1 + (*n as u16 - 1) * 0x100,
            FunctionCode::SdoResponse => cob_ids::SDO_RESPONSE,
            FunctionCode::SdoRequest => cob_ids::SDO_REQUEST,
            FunctionCode::Heartbeat => cob_ids::HEARTBEAT,
        };
        CanId::Std(base + node as u16)
    }
}

/// The NMT command specifier byte
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
#[derive(IntEnum)]
pub enum NmtCommandSpecifier {
    /// Enter Operational
    Start = 0x01,
    /// Enter Stopped
    Stop = 0x02,
    /// Enter Pre-Operational
    EnterPreOp = 0x80,
    /// Reset the application (full reset, followed by boot-up)
    ResetApp = 0x81,
    /// Reset communication parameters (followed by boot-up)
    ResetComm = 0x82,
}

impl NmtCommandSpecifier {
    /// The NMT state a node reports once it has executed this command
    ///
    /// Both resets are confirmed by a boot-up message, which carries the Initialisation state.
    pub fn resulting_state(&self) -> NmtState {
        match self {
            NmtCommandSpecifier::Start => NmtState::Operational,
            NmtCommandSpecifier::Stop => NmtState::Stopped,
            NmtCommandSpecifier::EnterPreOp => NmtState::PreOperational,
            NmtCommandSpecifier::ResetApp | NmtCommandSpecifier::ResetComm => {
                NmtState::Initialisation
            }
        }
    }

    /// The command which requests a transition into `state`
    pub fn for_state(state: NmtState) -> Self {
        match state {
            NmtState::Initialisation => NmtCommandSpecifier::ResetComm,
            NmtState::Stopped => NmtCommandSpecifier::Stop,
            NmtState::Operational => NmtCommandSpecifier::Start,
            NmtState::PreOperational => NmtCommandSpecifier::EnterPreOp,
        }
    }
}

/// An NMT command message
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NmtCommand {
    /// The command to execute
    pub cs: NmtCommandSpecifier,
    /// The node the command is addressed to, 0 for all nodes
    pub node: u8,
}

impl From<NmtCommand> for CanMessage {
    fn from(cmd: NmtCommand) -> Self {
        CanMessage::new(NMT_CMD_ID, &[cmd.cs as u8, cmd.node])
    }
}

/// A heartbeat (or boot-up) message
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Heartbeat {
    /// The producing node
    pub node: u8,
    /// Toggle bit, only used by node guarding
    pub toggle: bool,
    /// The producer's NMT state
    pub state: NmtState,
}

impl Heartbeat {
    /// True if this is a boot-up message
    pub fn is_boot_up(&self) -> bool {
        self.state == NmtState::Initialisation
    }
}

impl From<Heartbeat> for CanMessage {
    fn from(hb: Heartbeat) -> Self {
        let byte = (hb.state as u8) | ((hb.toggle as u8) << 7);
        CanMessage::new(FunctionCode::Heartbeat.cob_id(hb.node), &[byte])
    }
}

/// An emergency message
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EmergencyMessage {
    /// The producing node
    pub node: u8,
    /// The emergency error code. Zero means "error reset / no error".
    pub error_code: u16,
    /// Value of the node's error register (object 0x1001)
    pub error_register: u8,
    /// Manufacturer specific error bytes
    pub vendor: [u8; 5],
}

impl EmergencyMessage {
    /// True when this message signals the end of an error condition
    pub fn is_error_reset(&self) -> bool {
        self.error_code == 0
    }
}

impl From<EmergencyMessage> for CanMessage {
    fn from(emcy: EmergencyMessage) -> Self {
        let mut data = [0u8; 8];
        data[0..2].copy_from_slice(&emcy.error_code.to_le_bytes());
        data[2] = emcy.error_register;
        data[3..8].copy_from_slice(&emcy.vendor);
        CanMessage::new(FunctionCode::Emergency.cob_id(emcy.node), &data)
    }
}

/// The zero length SYNC message
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyncMessage;

impl From<SyncMessage> for CanMessage {
    fn from(_: SyncMessage) -> Self {
        CanMessage::new(SYNC_ID, &[])
    }
}

/// Error returned when converting a [`CanMessage`] into a [`CanOpenMessage`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Snafu)]
pub enum MessageError {
    /// The ID is not part of the predefined connection set
    #[snafu(display("Unrecognized COB-ID {id}"))]
    UnrecognizedId {
        /// The offending ID
        id: CanId,
    },
    /// The payload length or content is not valid for the message type
    #[snafu(display("Malformed message on COB-ID {id}"))]
    MalformedMessage {
        /// The ID of the malformed message
        id: CanId,
    },
}

/// A parsed CANopen message
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CanOpenMessage {
    /// NMT command
    NmtCommand(NmtCommand),
    /// SYNC
    Sync,
    /// Emergency
    Emergency(EmergencyMessage),
    /// Heartbeat or boot-up
    Heartbeat(Heartbeat),
    /// SDO request from a client to node `node`
    SdoRequest {
        /// The addressed SDO server node
        node: u8,
        /// The request
        req: SdoRequest,
    },
    /// SDO response from node `node`
    SdoResponse {
        /// The responding SDO server node
        node: u8,
        /// The response
        resp: SdoResponse,
    },
    /// Transmit PDO from a node
    Tpdo {
        /// The producing node
        node: u8,
        /// Channel 1-4
        channel: u8,
        /// The raw frame
        msg: CanMessage,
    },
    /// Receive PDO addressed to a node
    Rpdo {
        /// The consuming node
        node: u8,
        /// Channel 1-4
        channel: u8,
        /// The raw frame
        msg: CanMessage,
    },
}

impl TryFrom<CanMessage> for CanOpenMessage {
    type Error = MessageError;

    fn try_from(msg: CanMessage) -> Result<Self, Self::Error> {
        let id = msg.id();
        let (function, node) =
            FunctionCode::classify(id).ok_or(UnrecognizedIdSnafu { id }.build())?;
        let data = msg.data();
        let malformed = MalformedMessageSnafu { id };
        match function {
            FunctionCode::Nmt => {
                if data.len() != 2 {
                    return malformed.fail();
                }
                let cs = NmtCommandSpecifier::try_from(data[0]).map_err(|_| malformed.build())?;
                Ok(CanOpenMessage::NmtCommand(NmtCommand { cs, node: data[1] }))
            }
            FunctionCode::Sync => Ok(CanOpenMessage::Sync),
            FunctionCode::Emergency => {
                if data.len() != 8 {
                    return malformed.fail();
                }
                let mut vendor = [0u8; 5];
                vendor.copy_from_slice(&data[3..8]);
                Ok(CanOpenMessage::Emergency(EmergencyMessage {
                    node,
                    error_code: u16::from_le_bytes([data[0], data[1]]),
                    error_register: data[2],
                    vendor,
                }))
            }
            FunctionCode::Heartbeat => {
                if data.len() != 1 {
                    return malformed.fail();
                }
                let state = NmtState::try_from(data[0] & 0x7F).map_err(|_| malformed.build())?;
                Ok(CanOpenMessage::Heartbeat(Heartbeat {
                    node,
                    toggle: data[0] & 0x80 != 0,
                    state,
                }))
            }
            FunctionCode::SdoRequest => {
                let req = SdoRequest::try_from(data).map_err(|_| malformed.build())?;
                Ok(CanOpenMessage::SdoRequest { node, req })
            }
            FunctionCode::SdoResponse => {
                let resp = SdoResponse::try_from(data).map_err(|_| malformed.build())?;
                Ok(CanOpenMessage::SdoResponse { node, resp })
            }
            FunctionCode::Tpdo(channel) => Ok(CanOpenMessage::Tpdo { node, channel, msg }),
            FunctionCode::Rpdo(channel) => Ok(CanOpenMessage::Rpdo { node, channel, msg }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assertables::assert_contains;

    #[test]
    fn test_classify() {
        assert_eq!(
            Some((FunctionCode::Nmt, 0)),
            FunctionCode::classify(CanId::std(0))
        );
        assert_eq!(
            Some((FunctionCode::Sync, 0)),
            FunctionCode::classify(CanId::std(0x80))
        );
        assert_eq!(
            Some((FunctionCode::Emergency, 3)),
            FunctionCode::classify(CanId::std(0x83))
        );
        assert_eq!(
            Some((FunctionCode::Tpdo(2), 1)),
            FunctionCode::classify(CanId::std(0x281))
        );
        assert_eq!(
            Some((FunctionCode::Rpdo(4), 127)),
            FunctionCode::classify(CanId::std(0x57F))
        );
        assert_eq!(
            Some((FunctionCode::SdoResponse, 5)),
            FunctionCode::classify(CanId::std(0x585))
        );
        assert_eq!(
            Some((FunctionCode::Heartbeat, 127)),
            FunctionCode::classify(CanId::std(0x77F))
        );
        // LSS, node 0 on a node addressed object, and extended IDs are not ours
        assert_eq!(None, FunctionCode::classify(CanId::std(0x7E5)));
        assert_eq!(None, FunctionCode::classify(CanId::std(0x180)));
        assert_eq!(None, FunctionCode::classify(CanId::extended(0x181)));
    }

    #[test]
    fn test_cob_id_inverts_classify() {
        for function in [
            FunctionCode::Emergency,
            FunctionCode::Tpdo(1),
            FunctionCode::Tpdo(4),
            FunctionCode::Rpdo(3),
            FunctionCode::SdoRequest,
            FunctionCode::SdoResponse,
            FunctionCode::Heartbeat,
        ] {
            let id = function.cob_id(42);
            assert_eq!(Some((function, 42)), FunctionCode::classify(id));
        }
    }

    #[test]
    fn test_heartbeat_parse() {
        let msg = CanMessage::new(CanId::std(0x701), &[0x7F]);
        let parsed: CanOpenMessage = msg.try_into().unwrap();
        assert_eq!(
            CanOpenMessage::Heartbeat(Heartbeat {
                node: 1,
                toggle: false,
                state: NmtState::PreOperational
            }),
            parsed
        );

        let bad = CanMessage::new(CanId::std(0x701), &[0x33]);
        assert_eq!(
            Err(MessageError::MalformedMessage {
                id: CanId::std(0x701)
            }),
            CanOpenMessage::try_from(bad)
        );
    }

    #[test]
    fn test_emergency_parse() {
        let emcy = EmergencyMessage {
            node: 2,
            error_code: 0x8611,
            error_register: 0x21,
            vendor: [1, 2, 3, 4, 5],
        };
        let msg: CanMessage = emcy.into();
        assert_eq!(CanId::std(0x82), msg.id());
        assert_eq!(&[0x11, 0x86, 0x21, 1, 2, 3, 4, 5], msg.data());
        assert_eq!(
            CanOpenMessage::Emergency(emcy),
            CanOpenMessage::try_from(msg).unwrap()
        );
    }

    #[test]
    fn test_nmt_and_sync_frames() {
        let msg: CanMessage = NmtCommand {
            cs: NmtCommandSpecifier::EnterPreOp,
            node: 0,
        }
        .into();
        assert_eq!(NMT_CMD_ID, msg.id());
        assert_eq!(&[0x80, 0], msg.data());

        let sync: CanMessage = SyncMessage.into();
        assert_eq!(SYNC_ID, sync.id());
        assert_eq!(0, sync.dlc());
    }

    #[test]
    fn test_malformed_frames() {
        // Heartbeat with no state byte
        let err = CanOpenMessage::try_from(CanMessage::new(CanId::std(0x705), &[])).unwrap_err();
        assert_eq!(
            MessageError::MalformedMessage {
                id: CanId::std(0x705)
            },
            err
        );
        assert_contains!(err.to_string(), "0x705");

        // Unknown NMT command specifier
        let err = CanOpenMessage::try_from(CanMessage::new(NMT_CMD_ID, &[0x33, 1])).unwrap_err();
        assert_contains!(err.to_string(), "Malformed");

        let err = CanOpenMessage::try_from(CanMessage::new(CanId::extended(0x1234), &[]))
            .unwrap_err();
        assert_contains!(err.to_string(), "Unrecognized");
    }
}
