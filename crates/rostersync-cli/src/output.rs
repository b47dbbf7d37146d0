//! Terminal rendering for rostersync commands
//!
//! [`Printer`] routes status lines to a human or JSON consumer. The free
//! functions render the roster entities and wire documents the commands
//! print, so `cache show` and `batch` lay out rows the same way.

use serde_json::{json, Value};

use rostersync_core::domain::{Circle, Contact};
use rostersync_sync::batch::WireBatch;

/// Output format selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Human,
    Json,
}

impl OutputFormat {
    pub fn is_json(self) -> bool {
        matches!(self, OutputFormat::Json)
    }
}

/// Writes command results in the selected format
///
/// Human mode prints status lines and ignores documents; JSON mode prints
/// only documents, plus a `{"success": false}` object on failure.
#[derive(Debug, Clone, Copy)]
pub struct Printer {
    format: OutputFormat,
}

impl Printer {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    pub fn is_json(&self) -> bool {
        self.format.is_json()
    }

    pub fn done(&self, message: &str) {
        if !self.is_json() {
            println!("\u{2713} {message}");
        }
    }

    pub fn failed(&self, message: &str) {
        if self.is_json() {
            eprintln!("{}", json!({ "success": false, "error": message }));
        } else {
            eprintln!("\u{2717} {message}");
        }
    }

    /// Indented detail line, human mode only
    pub fn line(&self, message: &str) {
        if !self.is_json() {
            println!("  {message}");
        }
    }

    /// Verbatim block, human mode only
    pub fn block(&self, text: &str) {
        if !self.is_json() {
            println!("{text}");
        }
    }

    /// Pretty-printed document, JSON mode only
    pub fn document(&self, value: &Value) {
        if self.is_json() {
            match serde_json::to_string_pretty(value) {
                Ok(text) => println!("{text}"),
                Err(e) => eprintln!("{}", json!({ "success": false, "error": e.to_string() })),
            }
        }
    }
}

/// `1 document`, `3 documents`
pub fn count(n: usize, singular: &str, plural: &str) -> String {
    format!("{n} {}", if n == 1 { singular } else { plural })
}

// ============================================================================
// Roster entities
// ============================================================================

pub fn contact_row(contact: &Contact) -> String {
    let hash = contact.hash().to_string();
    match contact.display_name() {
        "" => format!("{hash:<40} {}", contact.lists().short_names()),
        name => format!("{hash:<40} {:<14} {name}", contact.lists().short_names()),
    }
}

pub fn contact_json(contact: &Contact) -> Value {
    json!({
        "hash": contact.hash().to_string(),
        "display_name": contact.display_name(),
        "lists": contact.lists().short_names(),
    })
}

pub fn circle_row(circle: &Circle) -> String {
    format!(
        "{:<40} circle {:?} ({})",
        circle.display_name(),
        circle.state(),
        count(circle.members().len(), "member", "members")
    )
}

pub fn circle_json(circle: &Circle) -> Value {
    json!({
        "id": circle.id().to_string(),
        "name": circle.display_name(),
        "accepted": circle.is_accepted(),
        "members": circle.members().len(),
    })
}

// ============================================================================
// Wire documents
// ============================================================================

/// Heading printed above document `index` (zero-based)
pub fn batch_heading(index: usize, batch: &WireBatch) -> String {
    format!(
        "#{} ({} chars, {})",
        index + 1,
        batch.payload.len(),
        count(batch.contacts.len(), "contact", "contacts")
    )
}

pub fn batch_json(batch: &WireBatch) -> Value {
    let contacts: Vec<String> = batch.contacts.iter().map(ToString::to_string).collect();
    json!({
        "chars": batch.payload.len(),
        "contacts": contacts,
        "payload": batch.payload,
    })
}
