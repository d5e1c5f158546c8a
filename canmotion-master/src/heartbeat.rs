//! Heartbeat production and consumption
//!
//! Liveness is derived from the time of the last heartbeat whenever it is asked for. There is no
//! timer per node: the producer task sweeps all consumers once per period to report losses.

use std::time::Duration;

use canmotion_common::{messages::Heartbeat, traits::AsyncCanSender, NodeId};
use log::{info, warn};
use tokio::time::{Instant, MissedTickBehavior};

use crate::{
    error::{Result, UnknownNodeSnafu},
    master::{Master, MasterEvent},
};

/// Liveness of a node, as seen by the master's heartbeat consumer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Liveness {
    /// No consumer timeout is configured for the node
    Unmonitored,
    /// A consumer is configured, but no heartbeat has been received yet
    Pending,
    /// The last heartbeat arrived less than the timeout ago
    Alive,
    /// The last heartbeat is at least the timeout old
    Lost,
}

/// The consumer record for one node
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct HeartbeatRecord {
    timeout: Option<Duration>,
    last_seen: Option<Instant>,
    lost_reported: bool,
}

impl HeartbeatRecord {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            ..Default::default()
        }
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
        self.lost_reported = false;
    }

    pub fn last_seen(&self) -> Option<Instant> {
        self.last_seen
    }

    pub fn liveness(&self, now: Instant) -> Liveness {
        let Some(timeout) = self.timeout else {
            return Liveness::Unmonitored;
        };
        match self.last_seen {
            None => Liveness::Pending,
            Some(seen) if now.saturating_duration_since(seen) < timeout => Liveness::Alive,
            Some(_) => Liveness::Lost,
        }
    }

    /// Record a heartbeat. Returns true if the node had been reported lost.
    pub fn seen(&mut self, now: Instant) -> bool {
        self.last_seen = Some(now);
        std::mem::take(&mut self.lost_reported)
    }

    /// Returns true exactly once for each transition into [`Liveness::Lost`]
    pub fn check_lost(&mut self, now: Instant) -> bool {
        if self.liveness(now) == Liveness::Lost && !self.lost_reported {
            self.lost_reported = true;
            true
        } else {
            false
        }
    }
}

impl<S: AsyncCanSender> Master<S> {
    /// Register a heartbeat consumer for a node
    ///
    /// Replaces any previous timeout. The node reads as [`Liveness::Pending`] until its next
    /// heartbeat if none has been seen yet.
    pub fn set_consumer(&self, node: NodeId, timeout: Duration) -> Result<()> {
        let remote = self
            .registry()
            .get(node.raw())
            .ok_or_else(|| UnknownNodeSnafu { node: node.raw() }.build())?;
        remote.heartbeat().set_timeout(Some(timeout));
        info!("Heartbeat consumer for node {node}: {timeout:?}");
        Ok(())
    }

    /// True if the node is monitored and its last heartbeat is younger than the consumer timeout
    pub fn is_alive(&self, node: NodeId) -> bool {
        self.liveness(node) == Liveness::Alive
    }

    /// The liveness of a node. Unregistered nodes are [`Liveness::Unmonitored`].
    pub fn liveness(&self, node: NodeId) -> Liveness {
        match self.registry().get(node.raw()) {
            Some(remote) => remote.heartbeat().liveness(Instant::now()),
            None => Liveness::Unmonitored,
        }
    }

    /// When the last heartbeat or boot-up message from a node was received
    pub fn last_heartbeat(&self, node: NodeId) -> Option<Instant> {
        self.registry()
            .get(node.raw())
            .and_then(|remote| remote.heartbeat().last_seen())
    }

    /// Check all consumers and report nodes which became lost since the last check
    ///
    /// Each loss is logged, published as [`MasterEvent::LivenessLost`] and returned, once.
    pub fn check_liveness(&self) -> Vec<NodeId> {
        let now = Instant::now();
        let mut lost = Vec::new();
        for remote in self.registry().nodes() {
            if remote.heartbeat().check_lost(now) {
                warn!("Heartbeat lost from node {}", remote.id());
                self.registry().emit(MasterEvent::LivenessLost {
                    node: remote.id().raw(),
                });
                lost.push(remote.id());
            }
        }
        lost
    }

    /// Send one heartbeat with the master's node ID and NMT state
    pub async fn send_heartbeat(&self) -> Result<()> {
        let msg = Heartbeat {
            node: self.node_id().raw(),
            toggle: false,
            state: self.own_state(),
        };
        self.bus().send(msg.into()).await
    }

    /// Produce heartbeats forever, at the configured period
    ///
    /// A period which is missed because the task was not scheduled in time is skipped rather than
    /// made up with a burst. After each heartbeat, consumer timeouts are checked with
    /// [`Self::check_liveness`].
    pub async fn run_heartbeat_producer(&self) {
        let mut interval = tokio::time::interval(self.timing().heartbeat_period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            if let Err(e) = self.send_heartbeat().await {
                warn!("Failed to send heartbeat: {e}");
            }
            self.check_liveness();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_liveness_boundaries() {
        let t = Duration::from_millis(1500);
        let mut record = HeartbeatRecord::new(Some(t));
        assert_eq!(Liveness::Pending, record.liveness(Instant::now()));

        record.seen(Instant::now());
        tokio::time::advance(Duration::from_millis(1499)).await;
        assert_eq!(Liveness::Alive, record.liveness(Instant::now()));
        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(Liveness::Lost, record.liveness(Instant::now()));

        assert!(record.check_lost(Instant::now()));
        assert!(!record.check_lost(Instant::now()));
        // A heartbeat after the loss reports the recovery, once
        assert!(record.seen(Instant::now()));
        assert!(!record.seen(Instant::now()));
    }

    #[test]
    fn test_unmonitored() {
        let mut record = HeartbeatRecord::new(None);
        record.seen(Instant::now());
        assert_eq!(Liveness::Unmonitored, record.liveness(Instant::now()));
        assert!(!record.check_lost(Instant::now()));
    }
}
