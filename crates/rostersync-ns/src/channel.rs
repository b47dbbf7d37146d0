//! Notification channel over an async byte stream

use std::sync::atomic::{AtomicU32, Ordering};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::trace;

use rostersync_core::domain::TransactionId;
use rostersync_core::ports::{INotificationChannel, WireCommand};

use crate::frame::encode_command;

/// [`INotificationChannel`] writing framed commands to `W`
///
/// Transaction ids start at 1 and only grow. Frames are written whole under
/// a mutex so concurrent senders never interleave.
pub struct NsChannel<W> {
    writer: Mutex<W>,
    next_trid: AtomicU32,
}

impl<W> NsChannel<W>
where
    W: AsyncWrite + Unpin + Send,
{
    /// Wraps the write half of a connection
    pub fn new(writer: W) -> Self {
        Self::starting_at(writer, 1)
    }

    /// Wraps a connection whose next transaction id is `first`
    ///
    /// Used when the sign-in exchange already consumed some ids.
    pub fn starting_at(writer: W, first: u32) -> Self {
        Self {
            writer: Mutex::new(writer),
            next_trid: AtomicU32::new(first.max(1)),
        }
    }

    /// Consumes the channel and returns the writer
    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[async_trait::async_trait]
impl<W> INotificationChannel for NsChannel<W>
where
    W: AsyncWrite + Unpin + Send,
{
    fn next_transaction_id(&self) -> TransactionId {
        TransactionId::new(self.next_trid.fetch_add(1, Ordering::SeqCst))
    }

    async fn send_command(
        &self,
        command: WireCommand,
        trid: TransactionId,
        payload: &str,
    ) -> anyhow::Result<()> {
        let frame = encode_command(command, trid, payload);
        let mut writer = self.writer.lock().await;
        writer.write_all(frame.as_bytes()).await?;
        writer.flush().await?;
        trace!(%command, %trid, bytes = frame.len(), "Frame written");
        Ok(())
    }
}
