//! Reply reading and dispatch
//!
//! [`spawn_reply_reader`] turns the read half of the connection into a
//! stream of [`ServerReply`] values. [`spawn_dispatcher`] feeds that stream
//! into a [`RosterEngine`]: acknowledgments and error replies settle pending
//! batches, and server-initiated list changes are handed to a refresh
//! worker so that no reply waits behind a remote fetch.

use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use rostersync_core::config::Config;
use rostersync_core::ports::Scenario;
use rostersync_sync::{RosterEngine, SyncError};

use crate::frame::{parse_payload_header, parse_reply, ServerReply};
use crate::NsError;

/// Reads the next reply, skipping blank lines
///
/// Returns `Ok(None)` at end of stream.
pub async fn read_reply<R>(reader: &mut R) -> Result<Option<ServerReply>, NsError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }

        if let Some(header) = parse_payload_header(&line)? {
            let mut body = vec![0; header.length];
            reader.read_exact(&mut body).await?;
            let payload = String::from_utf8(body).map_err(|_| {
                NsError::MalformedReply(format!("non UTF-8 payload for {}", header.command))
            })?;
            return Ok(Some(ServerReply::Notification {
                command: header.command,
                trid: header.trid,
                payload,
            }));
        }

        if let Some(reply) = parse_reply(&line)? {
            return Ok(Some(reply));
        }
    }
}

/// Spawns a task reading replies from `reader` until `shutdown` fires or
/// the stream ends
///
/// Malformed lines are logged and skipped; I/O errors end the task. The
/// receiver yields `None` once the task is gone.
pub fn spawn_reply_reader<R>(
    reader: R,
    shutdown: CancellationToken,
    buffer: usize,
) -> mpsc::Receiver<ServerReply>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(buffer.max(1));
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Reply reader stopped");
                    break;
                }
                next = read_reply(&mut reader) => next,
            };

            match next {
                Ok(Some(reply)) => {
                    if tx.send(reply).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    info!("Notification server closed the connection");
                    break;
                }
                Err(NsError::MalformedReply(line)) => {
                    warn!(%line, "Skipping malformed reply");
                }
                Err(err) => {
                    warn!(error = %err, "Reply stream failed");
                    break;
                }
            }
        }
    });
    rx
}

/// Coalescing handle to a refresh worker
///
/// At most one request is queued behind the refresh in flight; further
/// requests merge into it.
#[derive(Debug, Clone)]
pub struct RefreshRequests {
    tx: mpsc::Sender<()>,
}

impl RefreshRequests {
    /// Asks for a refresh; returns `false` if one was already queued
    pub fn request(&self) -> bool {
        match self.tx.try_send(()) {
            Ok(()) => true,
            Err(TrySendError::Full(())) => {
                debug!("Refresh already queued");
                false
            }
            Err(TrySendError::Closed(())) => false,
        }
    }
}

/// Spawns a task running `refresh_address_book(Timer)` on request
///
/// The task ends once every [`RefreshRequests`] handle is dropped.
pub fn spawn_refresh_worker(engine: Arc<RosterEngine>) -> (RefreshRequests, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel(1);
    let handle = tokio::spawn(async move {
        while rx.recv().await.is_some() {
            match engine.refresh_address_book(Scenario::Timer).await {
                Ok(changes) => debug!(changes = changes.len(), "Server-requested refresh finished"),
                Err(err) if err.is_cancelled() => debug!("Refresh for a signed-off session"),
                Err(SyncError::Domain(err)) => debug!(error = %err, "Refresh skipped"),
                Err(err) => warn!(error = %err, "Server-requested refresh failed"),
            }
        }
        debug!("Refresh worker stopped");
    });
    (RefreshRequests { tx }, handle)
}

/// Applies one reply to the engine
///
/// Never waits on the membership service: list changes announced by the
/// server only queue a refresh on `refresh`.
pub async fn dispatch(
    engine: &RosterEngine,
    reply: ServerReply,
    refresh: &RefreshRequests,
) -> Result<(), SyncError> {
    match reply {
        ServerReply::Acknowledged { command, trid } => {
            debug!(%command, %trid, "Command acknowledged");
            engine.on_command_acknowledged(trid).await?;
        }
        ServerReply::Error { code, trid } => {
            engine.on_command_rejected(trid, code).await?;
        }
        ServerReply::Notification { command, .. } if command == "ADL" || command == "RML" => {
            debug!(%command, "Server list change, requesting refresh");
            refresh.request();
        }
        ServerReply::Notification { command, .. } => {
            debug!(%command, "Ignoring server notification");
        }
        ServerReply::Other(line) => {
            debug!(%line, "Ignoring reply");
        }
    }
    Ok(())
}

/// Spawns a task applying every reply to `engine`
///
/// The task owns a refresh worker and waits for it once the reply stream
/// ends.
pub fn spawn_dispatcher(
    engine: Arc<RosterEngine>,
    mut replies: mpsc::Receiver<ServerReply>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let (refresh, worker) = spawn_refresh_worker(Arc::clone(&engine));
        while let Some(reply) = replies.recv().await {
            match dispatch(&engine, reply, &refresh).await {
                Ok(()) => {}
                Err(err) if err.is_cancelled() => debug!("Reply for a signed-off session"),
                Err(SyncError::Domain(err)) => debug!(error = %err, "Reply ignored"),
                Err(err) => warn!(error = %err, "Failed to apply reply"),
            }
        }
        drop(refresh);
        if let Err(err) = worker.await {
            warn!(error = %err, "Refresh worker failed");
        }
        debug!("Reply dispatcher stopped");
    })
}

/// Wires the read half of a connection to `engine`
///
/// Starts the reply reader with the configured buffer and a dispatcher
/// consuming it. The returned handle completes once `shutdown` fires or the
/// server closes the connection.
pub fn attach<R>(
    engine: Arc<RosterEngine>,
    reader: R,
    shutdown: CancellationToken,
    config: &Config,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let replies = spawn_reply_reader(reader, shutdown, config.notification.reply_buffer);
    spawn_dispatcher(engine, replies)
}
