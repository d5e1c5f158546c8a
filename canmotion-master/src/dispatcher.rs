//! Receiver dispatcher
//!
//! Every frame received from the bus goes through [`Dispatcher::handle_message`], which decodes
//! it once and routes it to the state of the node it came from. Frames from nodes which are not
//! registered, and frames of kinds the master does not consume, are dropped.

use std::sync::Arc;
use std::time::Duration;

use canmotion_common::{
    messages::{CanOpenMessage, EmergencyMessage, Heartbeat},
    nmt::NmtState,
    sdo::SdoResponse,
    traits::AsyncCanReceiver,
    CanMessage,
};
use log::{error, info, trace, warn};
use tokio::time::Instant;

use crate::{
    error::MasterError,
    master::MasterEvent,
    nmt::NmtReport,
    node::{lock, Registry, RemoteNode},
    pdo::{PdoChannel, PdoDirection},
};

/// What the dispatcher did with a frame
#[derive(Clone, Debug, PartialEq)]
pub enum Dispatched {
    /// An SDO response completed the node's pending transaction
    SdoResponse {
        /// The responding node
        node: u8,
    },
    /// An SDO response matched no pending transaction, usually because it timed out
    UnmatchedSdoResponse {
        /// The responding node
        node: u8,
    },
    /// A TxPDO was decoded into the cache
    Pdo {
        /// The producing node
        node: u8,
        /// The channel it arrived on
        channel: PdoChannel,
    },
    /// A heartbeat or boot-up message was recorded
    Heartbeat {
        /// The producing node
        node: u8,
        /// The reported state
        state: NmtState,
    },
    /// A drive reported a fault
    Fault(MasterError),
    /// A drive reported that its error condition has ended
    EmergencyCleared {
        /// The reporting node
        node: u8,
    },
    /// The frame was not for this master
    Dropped,
}

/// Routes received frames to node state
///
/// Cloning is cheap; all clones share the same nodes.
#[derive(Clone, Debug)]
pub struct Dispatcher {
    registry: Arc<Registry>,
    receive_wait: Duration,
}

impl Dispatcher {
    pub(crate) fn new(registry: Arc<Registry>, receive_wait: Duration) -> Self {
        Self {
            registry,
            receive_wait,
        }
    }

    /// Handle one received frame
    pub fn handle_message(&self, msg: CanMessage) -> Dispatched {
        let parsed = match CanOpenMessage::try_from(msg) {
            Ok(parsed) => parsed,
            Err(e) => {
                trace!("Dropping frame: {e}");
                return Dispatched::Dropped;
            }
        };

        match parsed {
            CanOpenMessage::SdoResponse { node, resp } => {
                self.with_node(node, |remote| Self::handle_sdo_response(remote, resp))
            }
            CanOpenMessage::Tpdo { node, channel, msg } => {
                self.with_node(node, |remote| Self::handle_tpdo(remote, channel, &msg))
            }
            CanOpenMessage::Heartbeat(hb) => {
                self.with_node(hb.node, |remote| self.handle_heartbeat(remote, hb))
            }
            CanOpenMessage::Emergency(emcy) => {
                self.with_node(emcy.node, |_| self.handle_emergency(emcy))
            }
            other => {
                trace!("Dropping {other:?}");
                Dispatched::Dropped
            }
        }
    }

    fn with_node(&self, node: u8, f: impl FnOnce(&RemoteNode) -> Dispatched) -> Dispatched {
        match self.registry.get(node) {
            Some(remote) => f(remote),
            None => {
                trace!("Dropping frame from unregistered node {node}");
                Dispatched::Dropped
            }
        }
    }

    fn handle_sdo_response(remote: &RemoteNode, resp: SdoResponse) -> Dispatched {
        let node = remote.id().raw();
        let (index, sub) = resp.object();
        let pending = {
            let mut slot = lock(&remote.pending_sdo);
            let matched = slot.as_ref().is_some_and(|p| p.matches(&resp));
            if matched {
                slot.take()
            } else {
                None
            }
        };
        // The issuer may have timed out between taking the slot and sending
        let delivered = match pending {
            Some(pending) => pending.tx.send(resp).is_ok(),
            None => false,
        };
        if delivered {
            Dispatched::SdoResponse { node }
        } else {
            warn!("Discarding unmatched SDO response from node {node} for 0x{index:04X}sub{sub}");
            Dispatched::UnmatchedSdoResponse { node }
        }
    }

    fn handle_tpdo(remote: &RemoteNode, number: u8, msg: &CanMessage) -> Dispatched {
        let node = remote.id().raw();
        let Some(channel) = PdoChannel::new(PdoDirection::Tx, number) else {
            return Dispatched::Dropped;
        };
        let values = {
            let map = remote.pdo_map();
            let state = map.channel(channel);
            if !state.active {
                trace!("Dropping {channel} from node {node}: channel not active");
                return Dispatched::Dropped;
            }
            match state.unpack(msg.data()) {
                Some(values) => values,
                None => {
                    warn!(
                        "Node {node} {channel}: {} bytes received, mapping needs {}",
                        msg.data().len(),
                        state.payload_len()
                    );
                    return Dispatched::Dropped;
                }
            }
        };
        let now = Instant::now();
        let mut cache = remote.cache_mut();
        for (mapping, value) in values {
            cache.store(mapping.index, mapping.sub, value, now);
        }
        Dispatched::Pdo { node, channel }
    }

    fn handle_heartbeat(&self, remote: &RemoteNode, hb: Heartbeat) -> Dispatched {
        let node = hb.node;
        let now = Instant::now();
        let was_lost = remote.heartbeat().seen(now);

        if hb.is_boot_up() {
            info!("Node {node} booted");
            remote.cache_mut().invalidate_all();
            remote.pdo_map_mut().deactivate_all();
            self.registry.emit(MasterEvent::BootUp { node });
        }
        if was_lost {
            info!("Heartbeat restored from node {node}");
            self.registry.emit(MasterEvent::LivenessRestored { node });
        }
        remote.nmt.send_replace(Some(NmtReport {
            state: hb.state,
            received: now,
        }));
        Dispatched::Heartbeat {
            node,
            state: hb.state,
        }
    }

    fn handle_emergency(&self, emcy: EmergencyMessage) -> Dispatched {
        if emcy.is_error_reset() {
            info!("Node {}: emergency cleared", emcy.node);
            self.registry
                .emit(MasterEvent::EmergencyCleared { node: emcy.node });
            return Dispatched::EmergencyCleared { node: emcy.node };
        }
        let fault = MasterError::from(emcy);
        warn!("{fault}");
        self.registry.emit(MasterEvent::Fault(fault.clone()));
        Dispatched::Fault(fault)
    }

    /// Receive and dispatch frames until the task is dropped
    ///
    /// Each receive is bounded by the configured receive wait, so the loop never blocks
    /// indefinitely on a silent bus. Receive errors are logged and retried after a short pause.
    pub async fn run<R: AsyncCanReceiver>(self, mut receiver: R) {
        loop {
            match tokio::time::timeout(self.receive_wait, receiver.recv()).await {
                Ok(Ok(msg)) => {
                    self.handle_message(msg);
                }
                Ok(Err(e)) => {
                    error!("Error reading from CAN bus: {e:?}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Err(_) => trace!("No frame within {:?}", self.receive_wait),
            }
        }
    }
}
