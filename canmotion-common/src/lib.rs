//! Common CANopen protocol types shared among the canmotion crates.
//!
//! Most users will have no reason to depend on this crate directly, as it is re-exported by
//! `canmotion-master`.
#![cfg_attr(not(feature = "std"), no_std)]
#![warn(missing_docs, missing_copy_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod constants;
pub mod messages;
pub mod nmt;
pub mod node_id;
pub mod objects;
pub mod pdo;
pub mod sdo;
pub mod traits;

#[cfg(feature = "socketcan")]
mod socketcan;

#[cfg(feature = "socketcan")]
#[cfg_attr(docsrs, doc(cfg(feature = "socketcan")))]
pub use self::socketcan::{open_socketcan, SocketCanReceiver, SocketCanSender};

pub use messages::{CanError, CanId, CanMessage};
pub use node_id::NodeId;
pub use objects::{ObjectSize, ObjectValue};
