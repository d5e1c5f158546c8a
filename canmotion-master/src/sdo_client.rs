//! Expedited SDO client
//!
//! A transaction is a request frame sent by the issuing task and a response frame delivered by
//! the dispatcher. The issuer parks a [`PendingSdo`] holding a oneshot sender on the node before
//! sending; the dispatcher takes it when a response of the expected kind for the same object
//! arrives. On timeout the issuer takes it back and aborts the transfer on the bus, then keeps the
//! node's SDO lock for a quiet period. A late response arriving in that window finds nothing to
//! complete and is dropped, and cannot be mistaken for the answer to the next transaction.

use std::time::Duration;

use canmotion_common::{
    messages::FunctionCode,
    sdo::{AbortCode, SdoRequest, SdoResponse},
    traits::AsyncCanSender,
    CanMessage, ObjectValue,
};
use log::{debug, warn};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::{
    error::{
        Result, SdoAbortSnafu, SdoTimeoutSnafu, SegmentedTransferSnafu, UnexpectedResponseSnafu,
        UnexpectedSizeSnafu,
    },
    master::Bus,
    node::{lock, RemoteNode},
};

/// The kind of transfer a transaction started
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Transfer {
    Download,
    Upload,
}

/// An SDO transaction waiting for its response
#[derive(Debug)]
pub(crate) struct PendingSdo {
    pub index: u16,
    pub sub: u8,
    pub transfer: Transfer,
    pub tx: oneshot::Sender<SdoResponse>,
}

impl PendingSdo {
    /// True if `resp` answers this transaction
    ///
    /// An abort for the object always answers it; a confirmation only if it is of the kind the
    /// request asked for.
    pub fn matches(&self, resp: &SdoResponse) -> bool {
        if resp.object() != (self.index, self.sub) {
            return false;
        }
        match resp {
            SdoResponse::ConfirmDownload { .. } => self.transfer == Transfer::Download,
            SdoResponse::ConfirmUpload { .. } => self.transfer == Transfer::Upload,
            SdoResponse::Abort { .. } => true,
        }
    }
}

/// Convenience macro for expecting a particular variant of a response and erroring on abort or
/// an unexpected variant
macro_rules! match_response  {
    ($self: ident, $resp: ident, $expecting: literal, $($match:pat => $code : expr),*) => {
        match $resp {
            $($match => $code,)*
            SdoResponse::Abort {
                index,
                sub,
                abort_code,
            } => {
                return Err(SdoAbortSnafu {
                    node: $self.node.id().raw(),
                    index,
                    sub,
                    abort_code,
                }
                .build())
            }
            _ => {
                return Err(UnexpectedResponseSnafu {
                    node: $self.node.id().raw(),
                    expecting: $expecting,
                    response: $resp,
                }
                .build()
                .into())
            }
        }
    };
}

/// Issues SDO transactions to a single node
pub(crate) struct SdoClient<'a, S> {
    bus: &'a Bus<S>,
    node: &'a RemoteNode,
    timeout: Duration,
    quiet: Duration,
}

impl<'a, S: AsyncCanSender> SdoClient<'a, S> {
    pub fn new(bus: &'a Bus<S>, node: &'a RemoteNode, timeout: Duration, quiet: Duration) -> Self {
        Self {
            bus,
            node,
            timeout,
            quiet,
        }
    }

    fn request_frame(&self, req: &SdoRequest) -> CanMessage {
        CanMessage::new(
            FunctionCode::SdoRequest.cob_id(self.node.id().raw()),
            &req.to_bytes(),
        )
    }

    /// Send a request and wait for its response
    ///
    /// Holds the node's SDO lock throughout, so at most one transaction per node is on the bus.
    async fn transact(&self, req: SdoRequest, transfer: Transfer) -> Result<SdoResponse> {
        let _guard = self.node.sdo_lock.lock().await;
        let node = self.node.id().raw();
        let (index, sub) = req.object();

        let (tx, rx) = oneshot::channel();
        *lock(&self.node.pending_sdo) = Some(PendingSdo {
            index,
            sub,
            transfer,
            tx,
        });

        if let Err(e) = self.bus.send(self.request_frame(&req)).await {
            self.node.take_pending_sdo();
            return Err(e);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            // Either the wait elapsed, or the pending slot was dropped without an answer
            _ => {
                self.node.take_pending_sdo();
                debug!("SDO timeout: node {node} 0x{index:04X}sub{sub}");
                let abort = SdoRequest::abort(index, sub, AbortCode::SdoTimeout);
                if let Err(e) = self.bus.send(self.request_frame(&abort)).await {
                    warn!("Failed to abort SDO transfer to node {node}: {e}");
                }
                tokio::time::sleep(self.quiet).await;
                Err(SdoTimeoutSnafu { node, index, sub }.build().into())
            }
        }
    }

    /// Write an object with an expedited download
    ///
    /// On confirmation the cache entry is updated and marked valid.
    pub async fn download(&self, index: u16, sub: u8, value: ObjectValue) -> Result<()> {
        let (bytes, len) = value.to_le_bytes();
        let resp = self
            .transact(
                SdoRequest::expedited_download(index, sub, &bytes[..len]),
                Transfer::Download,
            )
            .await?;
        match_response!(
            self,
            resp,
            "ConfirmDownload",
            SdoResponse::ConfirmDownload { .. } => {}
        );
        self.node
            .cache_mut()
            .store(index, sub, value, Instant::now());
        debug!(
            "SDO write: node {} 0x{index:04X}sub{sub} = {value}",
            self.node.id()
        );
        Ok(())
    }

    /// Read an object with an expedited upload
    ///
    /// On success the cache entry is updated and marked valid.
    pub async fn upload(&self, index: u16, sub: u8) -> Result<ObjectValue> {
        let node = self.node.id().raw();
        let resp = self
            .transact(SdoRequest::initiate_upload(index, sub), Transfer::Upload)
            .await?;
        let data = match_response!(
            self,
            resp,
            "ConfirmUpload",
            SdoResponse::ConfirmUpload { .. } => match resp.expedited_data() {
                Some(data) => data,
                None => return Err(SegmentedTransferSnafu { node, index, sub }.build().into()),
            }
        );
        let value = ObjectValue::from_le_bytes(data).map_err(|e| {
            UnexpectedSizeSnafu {
                node,
                index,
                sub,
                len: e.len,
            }
            .build()
        })?;
        self.node
            .cache_mut()
            .store(index, sub, value, Instant::now());
        debug!("SDO read: node {node} 0x{index:04X}sub{sub} = {value}");
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(transfer: Transfer) -> (PendingSdo, oneshot::Receiver<SdoResponse>) {
        let (tx, rx) = oneshot::channel();
        let pending = PendingSdo {
            index: 0x6040,
            sub: 0,
            transfer,
            tx,
        };
        (pending, rx)
    }

    #[test]
    fn test_response_must_match_transfer_kind() {
        let (download, _rx) = pending(Transfer::Download);
        assert!(download.matches(&SdoResponse::download_acknowledge(0x6040, 0)));
        assert!(!download.matches(&SdoResponse::download_acknowledge(0x6040, 1)));
        assert!(!download.matches(&SdoResponse::expedited_upload(0x6040, 0, &[6, 0])));
        assert!(download.matches(&SdoResponse::abort(0x6040, 0, AbortCode::DataTypeMismatch)));

        let (upload, _rx) = pending(Transfer::Upload);
        assert!(upload.matches(&SdoResponse::expedited_upload(0x6040, 0, &[6, 0])));
        assert!(!upload.matches(&SdoResponse::download_acknowledge(0x6040, 0)));
        assert!(!upload.matches(&SdoResponse::abort(0x6041, 0, AbortCode::NoSuchObject)));
    }
}
