//! Constants defining standard object indices and COB-ID bases
//!

/// Object indices for standard communication objects
pub mod object_ids {
    /// The error register object index
    pub const ERROR_REGISTER: u16 = 0x1001;
    /// The consumer heartbeat time object index
    ///
    /// Each sub-index holds `(node_id << 16) | time_ms` for one monitored producer.
    pub const HEARTBEAT_CONSUMER_TIME: u16 = 0x1016;
    /// The heartbeat producer time object index
    pub const HEARTBEAT_PRODUCER_TIME: u16 = 0x1017;

    /// The first RPDO communication parameter index
    pub const RPDO_COMM_BASE: u16 = 0x1400;
    /// The first RPDO mapping parameter index
    pub const RPDO_MAP_BASE: u16 = 0x1600;
    /// The first TPDO communication parameter index
    pub const TPDO_COMM_BASE: u16 = 0x1800;
    /// The first TPDO mapping parameter index
    pub const TPDO_MAP_BASE: u16 = 0x1A00;

    /// Sub index of the COB-ID in a PDO communication parameter record
    pub const PDO_COMM_COB_ID_SUB: u8 = 1;
    /// Sub index of the transmission type in a PDO communication parameter record
    pub const PDO_COMM_TRANSMISSION_TYPE_SUB: u8 = 2;
    /// Sub index of the inhibit time in a PDO communication parameter record
    pub const PDO_COMM_INHIBIT_TIME_SUB: u8 = 3;
}

/// COB-ID base values of the CiA 301 predefined connection set
pub mod cob_ids {
    /// NMT command, always sent with node 0
    pub const NMT: u16 = 0x000;
    /// SYNC (with no node added) and EMCY (node added)
    pub const SYNC_EMCY: u16 = 0x080;
    /// TPDO1 base. TPDO n lives at `TPDO1 + (n - 1) * 0x100`
    pub const TPDO1: u16 = 0x180;
    /// RPDO1 base. RPDO n lives at `RPDO1 + (n - 1) * 0x100`
    pub const RPDO1: u16 = 0x200;
    /// SDO server -> client responses
    pub const SDO_RESPONSE: u16 = 0x580;
    /// SDO client -> server requests
    pub const SDO_REQUEST: u16 = 0x600;
    /// NMT error control (heartbeat and boot-up)
    pub const HEARTBEAT: u16 = 0x700;
}

/// Special values for PDO communication parameters
pub mod values {
    /// Bit 31 of a PDO COB-ID: set when the PDO does not exist / is not valid
    pub const PDO_COB_ID_INVALID: u32 = 1 << 31;
    /// Bit 30 of a PDO COB-ID: set when RTR is not allowed on the PDO
    pub const PDO_COB_ID_NO_RTR: u32 = 1 << 30;
    /// Transmission type used for synchronous (SYNC gated) PDOs: act on every SYNC
    pub const TRANSMISSION_TYPE_SYNC: u8 = 1;
    /// Transmission type used for asynchronous (event driven) PDOs, device profile specific
    pub const TRANSMISSION_TYPE_ASYNC: u8 = 255;
}
