//! SYNC production

use canmotion_common::{messages::SyncMessage, traits::AsyncCanSender};
use log::trace;

use crate::{error::Result, master::Master};

impl<S: AsyncCanSender> Master<S> {
    /// Send a SYNC frame
    ///
    /// Every synchronous RxPDO written before this call is applied by its node when the node
    /// processes this frame. Frames to the bus are sent in call order, so any [`write_pdo`] which
    /// returned before `broadcast_sync` was called is included, and any issued after is not.
    ///
    /// Returning only means the frame was sent. Whether a node acted on it is visible in its
    /// subsequent TxPDOs or SDO reads.
    ///
    /// [`write_pdo`]: crate::NodeHandle::write_pdo
    pub async fn broadcast_sync(&self) -> Result<()> {
        self.bus().send(SyncMessage.into()).await?;
        trace!("SYNC sent");
        Ok(())
    }
}
