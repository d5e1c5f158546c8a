//! A CANopen master for coordinating positioning drives
//!
//! canmotion-master runs on a host controller and manages a fixed set of CANopen drives over one
//! CAN bus. It provides the following:
//!
//! * An *object dictionary cache* per node, fed by SDO transfers and transmit PDOs.
//! * An expedited *SDO* client, with one transaction in flight per node.
//! * A *PDO* mapper, which writes channel mappings to a node and records them so PDO frames can
//!   be packed and decoded by name.
//! * An *NMT* controller, which confirms every state transition with the node's own heartbeat.
//! * A *heartbeat* producer, and a consumer which reports nodes going silent.
//! * *SYNC* production, for starting coordinated motion on several drives at once.
//! * A receiver *dispatcher*, which routes every received frame to the node it came from.
//!
//! # Getting Started
//!
//! The master does not own the bus. It is given the sending half of a transport, and received
//! frames are handed to its [`Dispatcher`]. With the `socketcan` feature, a socketcan interface
//! can be opened with [`common::open_socketcan`].
//!
//! ```ignore
//! use canmotion_master::{common::open_socketcan, Master, MasterConfig, NmtTarget};
//!
//! let config = MasterConfig::load_from_file("master.toml")?;
//! let (tx, rx) = open_socketcan("can0")?;
//! let master = Master::new(config, tx)?;
//! master.spawn_dispatcher(rx);
//! master.spawn_heartbeat_producer();
//!
//! master.enter_preop(NmtTarget::All).await?;
//! for id in master.node_ids() {
//!     master.node(id)?.setup_pdos().await?;
//! }
//! master.start(NmtTarget::All).await?;
//! ```
//!
//! # Errors
//!
//! Every operation returns a [`MasterError`], which is either a local error, an SDO abort from a
//! node, or a fault reported by a drive. See [`ErrorClass`].
#![warn(missing_docs, missing_copy_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod heartbeat;
mod master;
pub mod nmt;
mod node;
pub mod object_cache;
pub mod pdo;
mod sdo_client;
mod sync;

pub use canmotion_common as common;

pub use config::{MasterConfig, NodeConfig, PdoChannelConfig};
pub use dispatcher::{Dispatched, Dispatcher};
pub use error::{ErrorClass, MasterError, RawAbortCode};
pub use heartbeat::Liveness;
pub use master::{Master, MasterEvent, NodeHandle};
pub use nmt::NmtTarget;
pub use object_cache::CacheEntry;
pub use pdo::{PdoChannel, PdoDirection, TransmissionMode};
