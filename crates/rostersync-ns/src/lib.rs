//! rostersync NS - Notification server channel adapter
//!
//! Implements [`INotificationChannel`](rostersync_core::ports::INotificationChannel)
//! over any `tokio` byte stream and parses the server's replies.
//!
//! ## Modules
//!
//! - [`frame`] - Command framing and reply parsing
//! - [`channel`] - The outbound channel
//! - [`reader`] - Reply reader task and dispatch into the engine

pub mod channel;
pub mod frame;
pub mod reader;

pub use channel::NsChannel;
pub use frame::{encode_command, parse_reply, ServerReply};
pub use reader::{
    attach, dispatch, read_reply, spawn_dispatcher, spawn_refresh_worker, spawn_reply_reader,
    RefreshRequests,
};

use thiserror::Error;

/// Errors raised while reading from the notification server
#[derive(Debug, Error)]
pub enum NsError {
    /// Reading from the connection failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A line did not follow the reply grammar
    #[error("Malformed reply: {0}")]
    MalformedReply(String),

    /// A payload header announced more than the accepted maximum
    #[error("Payload of {0} bytes exceeds the limit")]
    PayloadTooLarge(usize),
}
