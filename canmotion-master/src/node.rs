//! Per node state shared between the dispatcher and the application
//!
//! Each remote node has its own locks, so traffic for one node never waits on another.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use canmotion_common::NodeId;
use tokio::sync::{broadcast, watch};

use crate::{
    config::NodeConfig,
    heartbeat::HeartbeatRecord,
    master::MasterEvent,
    nmt::NmtReport,
    object_cache::ObjectCache,
    pdo::PdoMap,
    sdo_client::PendingSdo,
};

// No critical section on node state spans more than one field update, so poisoned locks are
// recovered rather than propagated.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

/// State for one remote node
#[derive(Debug)]
pub(crate) struct RemoteNode {
    id: NodeId,
    config: NodeConfig,
    cache: RwLock<ObjectCache>,
    pdo_map: RwLock<PdoMap>,
    /// Held for the whole of an SDO transaction. tokio's mutex is fair, so queued requests run
    /// in the order they were issued.
    pub(crate) sdo_lock: tokio::sync::Mutex<()>,
    pub(crate) pending_sdo: Mutex<Option<PendingSdo>>,
    pub(crate) nmt: watch::Sender<Option<NmtReport>>,
    pub(crate) heartbeat: Mutex<HeartbeatRecord>,
}

impl RemoteNode {
    pub fn new(config: NodeConfig) -> Self {
        let (nmt, _) = watch::channel(None);
        Self {
            id: config.node_id,
            heartbeat: Mutex::new(HeartbeatRecord::new(config.heartbeat_timeout())),
            config,
            cache: RwLock::new(ObjectCache::new()),
            pdo_map: RwLock::new(PdoMap::default()),
            sdo_lock: tokio::sync::Mutex::new(()),
            pending_sdo: Mutex::new(None),
            nmt,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn cache(&self) -> RwLockReadGuard<'_, ObjectCache> {
        read(&self.cache)
    }

    pub fn cache_mut(&self) -> RwLockWriteGuard<'_, ObjectCache> {
        write(&self.cache)
    }

    pub fn pdo_map(&self) -> RwLockReadGuard<'_, PdoMap> {
        read(&self.pdo_map)
    }

    pub fn pdo_map_mut(&self) -> RwLockWriteGuard<'_, PdoMap> {
        write(&self.pdo_map)
    }

    pub fn heartbeat(&self) -> MutexGuard<'_, HeartbeatRecord> {
        lock(&self.heartbeat)
    }

    /// Remove the pending SDO transaction, if any
    pub fn take_pending_sdo(&self) -> Option<PendingSdo> {
        lock(&self.pending_sdo).take()
    }
}

/// The set of nodes known to a master, fixed when the master is created
#[derive(Debug)]
pub(crate) struct Registry {
    nodes: BTreeMap<u8, Arc<RemoteNode>>,
    events: broadcast::Sender<MasterEvent>,
}

impl Registry {
    pub fn new(nodes: impl IntoIterator<Item = NodeConfig>, event_capacity: usize) -> Self {
        let nodes = nodes
            .into_iter()
            .map(|cfg| (cfg.node_id.raw(), Arc::new(RemoteNode::new(cfg))))
            .collect();
        let (events, _) = broadcast::channel(event_capacity);
        Self { nodes, events }
    }

    pub fn get(&self, node: u8) -> Option<&Arc<RemoteNode>> {
        self.nodes.get(&node)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Arc<RemoteNode>> {
        self.nodes.values()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MasterEvent> {
        self.events.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: MasterEvent) {
        self.events.send(event).ok();
    }
}
