//! NMT state control
//!
//! NMT commands are never acknowledged by the protocol. A confirmed transition waits until the
//! node's own heartbeat (or boot-up message, for resets) reports the requested state.

use canmotion_common::{
    messages::{NmtCommand, NmtCommandSpecifier},
    nmt::NmtState,
    traits::AsyncCanSender,
    NodeId,
};
use futures::future::join_all;
use log::{info, warn};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::{
    error::{NmtConfirmationTimeoutSnafu, Result, UnknownNodeSnafu},
    master::Master,
    node::RemoteNode,
};

/// The addressee of an NMT command
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NmtTarget {
    /// Every node on the bus (node ID 0 on the wire)
    All,
    /// A single node
    Node(NodeId),
}

impl NmtTarget {
    /// The node byte of the command frame
    pub fn raw(&self) -> u8 {
        match self {
            NmtTarget::All => 0,
            NmtTarget::Node(id) => id.raw(),
        }
    }
}

impl From<NodeId> for NmtTarget {
    fn from(id: NodeId) -> Self {
        NmtTarget::Node(id)
    }
}

/// The last state reported by a node
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NmtReport {
    /// The reported state
    pub state: NmtState,
    /// When the report was received
    pub received: Instant,
}

async fn wait_for_state(
    mut rx: watch::Receiver<Option<NmtReport>>,
    state: NmtState,
) -> std::result::Result<(), watch::error::RecvError> {
    loop {
        rx.changed().await?;
        let report = *rx.borrow_and_update();
        if report.map(|r| r.state) == Some(state) {
            return Ok(());
        }
    }
}

impl<S: AsyncCanSender> Master<S> {
    /// Send an NMT command without waiting for any confirmation
    pub async fn nmt_command(&self, target: NmtTarget, cs: NmtCommandSpecifier) -> Result<()> {
        let cmd = NmtCommand {
            cs,
            node: target.raw(),
        };
        self.bus().send(cmd.into()).await
    }

    /// Command a transition and wait until every addressed node reports the resulting state
    ///
    /// [`NmtTarget::All`] is confirmed by every registered node; unregistered nodes on the bus
    /// are commanded but not waited for. Each node is given the NMT timeout to answer, and the
    /// first node to miss it is reported as an error.
    pub async fn nmt_command_confirmed(
        &self,
        target: NmtTarget,
        cs: NmtCommandSpecifier,
    ) -> Result<()> {
        let state = cs.resulting_state();
        let nodes: Vec<&RemoteNode> = match target {
            NmtTarget::All => self.registry().nodes().map(|n| n.as_ref()).collect(),
            NmtTarget::Node(id) => {
                let node = self
                    .registry()
                    .get(id.raw())
                    .ok_or_else(|| UnknownNodeSnafu { node: id.raw() }.build())?;
                vec![node.as_ref()]
            }
        };

        // Subscribe before sending, so a report which arrives immediately is not missed
        let receivers: Vec<_> = nodes
            .iter()
            .map(|n| {
                let mut rx = n.nmt.subscribe();
                rx.mark_unchanged();
                (n.id(), rx)
            })
            .collect();

        self.nmt_command(target, cs).await?;

        let timeout = self.timing().nmt_timeout;
        let results = join_all(receivers.into_iter().map(|(id, rx)| async move {
            match tokio::time::timeout(timeout, wait_for_state(rx, state)).await {
                Ok(Ok(())) => Ok(()),
                _ => {
                    warn!("Node {id} did not confirm NMT state {state}");
                    Err(NmtConfirmationTimeoutSnafu {
                        node: id.raw(),
                        state,
                    }
                    .build())
                }
            }
        }))
        .await;
        results.into_iter().collect::<std::result::Result<Vec<_>, _>>()?;

        match target {
            NmtTarget::All => info!("All nodes entered {state}"),
            NmtTarget::Node(id) => info!("Node {id} entered {state}"),
        }
        Ok(())
    }

    /// Request a node (or all nodes) to enter an NMT state, and wait for confirmation
    ///
    /// Requesting [`NmtState::Initialisation`] resets communication, and is confirmed by the
    /// boot-up message.
    pub async fn transition(&self, target: NmtTarget, state: NmtState) -> Result<()> {
        self.nmt_command_confirmed(target, NmtCommandSpecifier::for_state(state))
            .await
    }

    /// Start the node(s): enter Operational
    pub async fn start(&self, target: NmtTarget) -> Result<()> {
        self.transition(target, NmtState::Operational).await
    }

    /// Stop the node(s)
    pub async fn stop(&self, target: NmtTarget) -> Result<()> {
        self.transition(target, NmtState::Stopped).await
    }

    /// Enter Pre-Operational
    pub async fn enter_preop(&self, target: NmtTarget) -> Result<()> {
        self.transition(target, NmtState::PreOperational).await
    }

    /// Reset the application of the node(s), and wait for the boot-up message
    pub async fn reset_node(&self, target: NmtTarget) -> Result<()> {
        self.nmt_command_confirmed(target, NmtCommandSpecifier::ResetApp)
            .await
    }

    /// Reset the communication parameters of the node(s), and wait for the boot-up message
    pub async fn reset_communication(&self, target: NmtTarget) -> Result<()> {
        self.nmt_command_confirmed(target, NmtCommandSpecifier::ResetComm)
            .await
    }

    /// The last NMT state reported by a node, if any
    pub fn nmt_state(&self, node: NodeId) -> Option<NmtState> {
        self.registry()
            .get(node.raw())
            .and_then(|n| (*n.nmt.borrow()).map(|r| r.state))
    }
}
