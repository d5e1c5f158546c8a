pub mod sim_bus;
pub mod sim_drive;
pub mod utils;

pub mod prelude {
    pub use super::sim_bus::{SimBus, SimBusReceiver, SimBusSender};
    pub use super::sim_drive::{SimDrive, SimEvent};
    pub use super::utils::{node_id, BusLogger, TestNetwork};
    pub use canmotion_common::{
        nmt::NmtState, pdo::PdoMapping, sdo::AbortCode, NodeId, ObjectSize, ObjectValue,
    };
    pub use canmotion_master::{
        ErrorClass, Liveness, Master, MasterConfig, MasterError, MasterEvent, NmtTarget,
        NodeConfig, PdoChannel, PdoChannelConfig, RawAbortCode, TransmissionMode,
    };
}
