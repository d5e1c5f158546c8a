//! The master context
//!
//! A [`Master`] owns the sending half of the bus and the set of nodes it manages. All
//! subsystems reach the bus and node state through it; there is no global state, so several
//! masters (for several buses, or several tests) can exist in one process.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use canmotion_common::{
    constants::object_ids,
    nmt::NmtState,
    traits::{AsyncCanReceiver, AsyncCanSender, CanSendError as _},
    CanMessage, NodeId, ObjectValue,
};
use paste::paste;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::{
    config::{MasterConfig, Timing},
    dispatcher::Dispatcher,
    error::{MasterError, Result, SocketSendFailedSnafu, UnknownNodeSnafu},
    heartbeat::Liveness,
    node::{lock, Registry, RemoteNode},
    object_cache::CacheEntry,
    sdo_client::SdoClient,
};

/// A condition published to subscribers of [`Master::subscribe`]
///
/// Events are reports only. The master never reacts to them by itself.
#[derive(Clone, Debug, PartialEq)]
pub enum MasterEvent {
    /// A drive reported a fault through an emergency message
    Fault(MasterError),
    /// A drive signalled the end of its error condition
    EmergencyCleared {
        /// The reporting node
        node: u8,
    },
    /// A monitored node's heartbeat timed out
    LivenessLost {
        /// The silent node
        node: u8,
    },
    /// A heartbeat arrived from a node previously reported lost
    LivenessRestored {
        /// The node
        node: u8,
    },
    /// A node sent a boot-up message. Its cache and PDO channels are no longer valid.
    BootUp {
        /// The node
        node: u8,
    },
}

/// The sending half of the bus, shared by every task using the master
///
/// Frames are passed to the sender one at a time, in the order the lock is acquired.
#[derive(Debug)]
pub(crate) struct Bus<S> {
    sender: tokio::sync::Mutex<S>,
}

impl<S: AsyncCanSender> Bus<S> {
    fn new(sender: S) -> Self {
        Self {
            sender: tokio::sync::Mutex::new(sender),
        }
    }

    pub async fn send(&self, msg: CanMessage) -> Result<()> {
        let mut sender = self.sender.lock().await;
        sender.send(msg).await.map_err(|e| {
            log::error!("Failed to send frame on {}: {}", msg.id(), e.message());
            SocketSendFailedSnafu {
                message: e.message(),
            }
            .build()
            .into()
        })
    }
}

#[derive(Debug)]
struct Shared<S> {
    bus: Bus<S>,
    registry: Arc<Registry>,
    timing: Timing,
    node_id: NodeId,
    own_state: Mutex<NmtState>,
}

/// A CANopen master managing a fixed set of nodes
///
/// Cloning is cheap; all clones share the same bus and nodes.
#[derive(Debug)]
pub struct Master<S> {
    shared: Arc<Shared<S>>,
}

impl<S> Clone for Master<S> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<S: AsyncCanSender> Master<S> {
    /// Create a master from a configuration and the sending half of a bus
    ///
    /// Frames must be fed to the returned master's [`Dispatcher`], usually by
    /// [`Self::spawn_dispatcher`], before any request can be answered.
    pub fn new(config: MasterConfig, sender: S) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(Registry::new(
            config.nodes.iter().cloned(),
            config.event_capacity.max(1),
        ));
        Ok(Self {
            shared: Arc::new(Shared {
                bus: Bus::new(sender),
                registry,
                timing: config.timing(),
                node_id: config.node_id,
                own_state: Mutex::new(NmtState::Operational),
            }),
        })
    }

    pub(crate) fn bus(&self) -> &Bus<S> {
        &self.shared.bus
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.shared.registry
    }

    pub(crate) fn timing(&self) -> &Timing {
        &self.shared.timing
    }

    /// The master's own node ID
    pub fn node_id(&self) -> NodeId {
        self.shared.node_id
    }

    /// The NMT state the master reports in its own heartbeat
    pub fn own_state(&self) -> NmtState {
        *lock(&self.shared.own_state)
    }

    /// Change the NMT state the master reports in its own heartbeat
    pub fn set_own_state(&self, state: NmtState) {
        *lock(&self.shared.own_state) = state;
    }

    /// IDs of all managed nodes
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.registry().nodes().map(|n| n.id()).collect()
    }

    /// Get a handle for accessing one managed node
    pub fn node(&self, id: NodeId) -> Result<NodeHandle<S>> {
        let node = self
            .registry()
            .get(id.raw())
            .cloned()
            .ok_or_else(|| UnknownNodeSnafu { node: id.raw() }.build())?;
        Ok(NodeHandle {
            master: self.clone(),
            node,
        })
    }

    /// Subscribe to faults, liveness changes and boot-ups
    ///
    /// Only events published after the call are received.
    pub fn subscribe(&self) -> broadcast::Receiver<MasterEvent> {
        self.registry().subscribe()
    }

    /// Get a dispatcher which routes received frames to this master's nodes
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(self.shared.registry.clone(), self.timing().receive_wait)
    }

    /// Run the dispatcher on a tokio task, reading from `receiver`
    pub fn spawn_dispatcher<R>(&self, receiver: R) -> JoinHandle<()>
    where
        R: AsyncCanReceiver + 'static,
    {
        tokio::spawn(self.dispatcher().run(receiver))
    }

    /// Send a frame on the bus
    pub async fn send(&self, msg: CanMessage) -> Result<()> {
        self.bus().send(msg).await
    }
}

impl<S: AsyncCanSender + Sync + 'static> Master<S> {
    /// Run the heartbeat producer on a tokio task
    pub fn spawn_heartbeat_producer(&self) -> JoinHandle<()> {
        let master = self.clone();
        tokio::spawn(async move { master.run_heartbeat_producer().await })
    }
}

macro_rules! access_methods {
    ($type: ty) => {
        paste! {
            #[doc = concat!("Read a ", stringify!($type), " object, from the cache when it is fresh enough")]
            pub async fn [<read_ $type>](&self, index: u16, sub: u8) -> Result<$type> {
                Ok(self.read(index, sub).await?.[<as_ $type>]())
            }

            #[doc = concat!("Read a ", stringify!($type), " object from the node, bypassing the cache")]
            pub async fn [<read_fresh_ $type>](&self, index: u16, sub: u8) -> Result<$type> {
                Ok(self.read_fresh(index, sub).await?.[<as_ $type>]())
            }

            #[doc = concat!("Write a ", stringify!($type), " object on the node")]
            pub async fn [<write_ $type>](&self, index: u16, sub: u8, value: $type) -> Result<()> {
                self.write(index, sub, ObjectValue::from(value)).await
            }
        }
    };
}

/// Access to one managed node
///
/// Obtained from [`Master::node`]. Cloning is cheap.
#[derive(Debug)]
pub struct NodeHandle<S> {
    master: Master<S>,
    node: Arc<RemoteNode>,
}

impl<S> Clone for NodeHandle<S> {
    fn clone(&self) -> Self {
        Self {
            master: self.master.clone(),
            node: self.node.clone(),
        }
    }
}

impl<S: AsyncCanSender> NodeHandle<S> {
    pub(crate) fn node(&self) -> &RemoteNode {
        &self.node
    }

    pub(crate) fn timing(&self) -> &Timing {
        self.master.timing()
    }

    pub(crate) async fn send(&self, msg: CanMessage) -> Result<()> {
        self.master.bus().send(msg).await
    }

    fn sdo(&self) -> SdoClient<'_, S> {
        let timing = self.timing();
        SdoClient::new(
            self.master.bus(),
            &self.node,
            timing.sdo_timeout,
            timing.sdo_quiet,
        )
    }

    /// The node's ID
    pub fn id(&self) -> NodeId {
        self.node.id()
    }

    /// The master this node belongs to
    pub fn master(&self) -> &Master<S> {
        &self.master
    }

    /// Write an object with an SDO download
    ///
    /// Waits for the node to confirm, or for the SDO timeout. Only one SDO transaction per node
    /// is in flight at a time; concurrent calls queue in the order they were made. On success the
    /// cache holds the written value. On failure the cache is unchanged.
    pub async fn write(&self, index: u16, sub: u8, value: ObjectValue) -> Result<()> {
        self.sdo().download(index, sub, value).await
    }

    /// Read an object, from the cache when possible
    ///
    /// The cached value is returned when it is valid and either an active TxPDO maps the object,
    /// or it was updated within the node's cache max age. Otherwise the object is uploaded.
    pub async fn read(&self, index: u16, sub: u8) -> Result<ObjectValue> {
        if let Some(entry) = self.cached(index, sub) {
            let fed = self.node.pdo_map().is_fed_by_tpdo(index, sub);
            let max_age = self.node.config().cache_max_age();
            if entry.valid && (fed || entry.is_fresh(max_age, Instant::now())) {
                return Ok(entry.value);
            }
        }
        self.read_fresh(index, sub).await
    }

    /// Read an object with an SDO upload, ignoring the cache
    ///
    /// On success the cache is updated. On failure the cache is unchanged.
    pub async fn read_fresh(&self, index: u16, sub: u8) -> Result<ObjectValue> {
        self.sdo().upload(index, sub).await
    }

    /// Read an object, falling back to the last cached value if the read fails
    ///
    /// The returned entry's `valid` flag is false when the value did not come from a successful
    /// read, and must be checked before the value is used.
    pub async fn read_entry(&self, index: u16, sub: u8) -> CacheEntry {
        match self.read(index, sub).await {
            Ok(_) => self.cached(index, sub).unwrap_or_else(CacheEntry::missing),
            Err(e) => {
                log::debug!("Read of node {} 0x{index:04X}sub{sub} failed: {e}", self.id());
                let mut entry = self.cached(index, sub).unwrap_or_else(CacheEntry::missing);
                entry.valid = false;
                entry
            }
        }
    }

    /// Look at the cache without any bus traffic
    pub fn cached(&self, index: u16, sub: u8) -> Option<CacheEntry> {
        self.node.cache().get(index, sub)
    }

    access_methods!(u8);
    access_methods!(i8);
    access_methods!(u16);
    access_methods!(i16);
    access_methods!(u32);
    access_methods!(i32);

    /// Register a heartbeat consumer for this node on the master
    pub fn set_consumer(&self, timeout: Duration) -> Result<()> {
        self.master.set_consumer(self.id(), timeout)
    }

    /// True if this node's heartbeat is monitored and current
    pub fn is_alive(&self) -> bool {
        self.master.is_alive(self.id())
    }

    /// This node's liveness
    pub fn liveness(&self) -> Liveness {
        self.master.liveness(self.id())
    }

    /// The last NMT state this node reported
    pub fn nmt_state(&self) -> Option<NmtState> {
        self.master.nmt_state(self.id())
    }

    /// Configure the node to consume the master's heartbeat
    ///
    /// Writes the first entry of the node's consumer heartbeat time object, so the node detects
    /// a lost master after `timeout_ms`.
    pub async fn set_remote_heartbeat_consumer(&self, master: NodeId, timeout_ms: u16) -> Result<()> {
        let value = ((master.raw() as u32) << 16) | timeout_ms as u32;
        self.write_u32(object_ids::HEARTBEAT_CONSUMER_TIME, 1, value)
            .await
    }

    /// Set the node's own heartbeat producer period. Zero disables the node's heartbeat.
    pub async fn set_heartbeat_producer_time(&self, period_ms: u16) -> Result<()> {
        self.write_u16(object_ids::HEARTBEAT_PRODUCER_TIME, 0, period_ms)
            .await
    }
}
