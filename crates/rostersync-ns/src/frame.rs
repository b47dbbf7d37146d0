//! Command framing and reply parsing
//!
//! Outbound commands carry a payload whose byte length is announced on the
//! command line:
//!
//! ```text
//! ADL 12 42\r\n<ml l="1"><d n="example.com">...</d></ml>
//! ```
//!
//! The server answers each command on a line of its own, either
//! `ADL 12 OK` or a three-digit error code followed by the transaction id
//! (`241 12`). Server-initiated list changes use the same payload framing
//! as outbound commands.

use rostersync_core::domain::TransactionId;
use rostersync_core::ports::WireCommand;

use crate::NsError;

/// Line terminator used by the protocol
pub const CRLF: &str = "\r\n";

/// Largest payload accepted from the server
pub const MAX_INBOUND_PAYLOAD: usize = 64 * 1024;

/// Server commands whose third token is a payload length
const PAYLOAD_COMMANDS: [&str; 5] = ["ADL", "RML", "NOT", "UBX", "GCF"];

/// Frames an outbound command
pub fn encode_command(command: WireCommand, trid: TransactionId, payload: &str) -> String {
    format!("{command} {trid} {}{CRLF}{payload}", payload.len())
}

/// A parsed line from the notification server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerReply {
    /// The command with this transaction id was accepted
    Acknowledged {
        /// Echoed command name
        command: String,
        /// Transaction id of the command
        trid: TransactionId,
    },
    /// The command with this transaction id was rejected
    Error {
        /// Three-digit server error code
        code: u16,
        /// Transaction id of the command
        trid: TransactionId,
    },
    /// A server-initiated command carrying a payload
    Notification {
        /// Command name
        command: String,
        /// Transaction id (0 for unsolicited commands)
        trid: TransactionId,
        /// Payload body
        payload: String,
    },
    /// Any other line
    Other(String),
}

/// Header of a line announcing a payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadHeader {
    /// Command name
    pub command: String,
    /// Transaction id
    pub trid: TransactionId,
    /// Payload length in bytes
    pub length: usize,
}

/// Parses a reply line without its terminator
///
/// Returns `Ok(None)` for an empty line.
pub fn parse_reply(line: &str) -> Result<Option<ServerReply>, NsError> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return Ok(None);
    }

    let tokens: Vec<&str> = line.split_whitespace().collect();
    match tokens.as_slice() {
        [code, trid] if is_error_code(code) => Ok(Some(ServerReply::Error {
            code: code
                .parse()
                .map_err(|_| NsError::MalformedReply(line.to_string()))?,
            trid: parse_trid(trid, line)?,
        })),
        [command, trid, "OK", ..] if is_command(command) => Ok(Some(ServerReply::Acknowledged {
            command: (*command).to_string(),
            trid: parse_trid(trid, line)?,
        })),
        _ => Ok(Some(ServerReply::Other(line.to_string()))),
    }
}

/// Recognises a `CMD trid length` line
pub fn parse_payload_header(line: &str) -> Result<Option<PayloadHeader>, NsError> {
    let line = line.trim_end_matches(['\r', '\n']);
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let [command, trid, length] = tokens.as_slice() else {
        return Ok(None);
    };
    if !PAYLOAD_COMMANDS.contains(command) || !length.bytes().all(|b| b.is_ascii_digit()) {
        return Ok(None);
    }

    let length: usize = length
        .parse()
        .map_err(|_| NsError::MalformedReply(line.to_string()))?;
    if length > MAX_INBOUND_PAYLOAD {
        return Err(NsError::PayloadTooLarge(length));
    }
    Ok(Some(PayloadHeader {
        command: (*command).to_string(),
        trid: parse_trid(trid, line)?,
        length,
    }))
}

fn is_error_code(token: &str) -> bool {
    token.len() == 3 && token.bytes().all(|b| b.is_ascii_digit())
}

fn is_command(token: &str) -> bool {
    token.len() == 3 && token.bytes().all(|b| b.is_ascii_uppercase())
}

fn parse_trid(token: &str, line: &str) -> Result<TransactionId, NsError> {
    token
        .parse::<u32>()
        .map(TransactionId::new)
        .map_err(|_| NsError::MalformedReply(line.to_string()))
}
