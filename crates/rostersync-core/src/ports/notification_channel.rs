//! Notification channel port (driven/secondary port)
//!
//! The notification server receives list-membership commands tagged with a
//! transaction id and acknowledges them by the same id. This port covers the
//! outbound half; acknowledgments are delivered to the engine through
//! `RosterEngine::on_command_acknowledged`.

use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::domain::newtypes::TransactionId;

/// List-membership command carried on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WireCommand {
    /// Add to list
    Adl,
    /// Remove from list
    Rml,
}

impl WireCommand {
    /// Returns the three-letter command name
    pub fn as_str(&self) -> &'static str {
        match self {
            WireCommand::Adl => "ADL",
            WireCommand::Rml => "RML",
        }
    }

    /// Parses a three-letter command name
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ADL" => Some(WireCommand::Adl),
            "RML" => Some(WireCommand::Rml),
            _ => None,
        }
    }
}

impl Display for WireCommand {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Port trait for the outbound notification channel
///
/// ## Implementation Notes
///
/// - `next_transaction_id` must hand out strictly increasing ids; the
///   engine relies on it to order the contact batch before the circle batch.
/// - `send_command` returns once the frame is written, not when the server
///   acknowledges it.
#[async_trait::async_trait]
pub trait INotificationChannel: Send + Sync {
    /// Allocates the next transaction id
    fn next_transaction_id(&self) -> TransactionId;

    /// Frames and sends a command
    async fn send_command(
        &self,
        command: WireCommand,
        trid: TransactionId,
        payload: &str,
    ) -> anyhow::Result<()>;
}
