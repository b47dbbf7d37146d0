//! Batch command - Preview the list documents sent to the notification server
//!
//! Reads a JSON object mapping contact hashes (`"1:alice@example.com"`) to
//! list names and prints the `<ml>` documents the engine would send for it.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use tracing::debug;

use rostersync_core::domain::{ContactHash, RoleLists};
use rostersync_sync::batch::{build_wire_batches, MAX_PAYLOAD_CHARS};

use crate::output::{batch_heading, batch_json, count, OutputFormat, Printer};

#[derive(Debug, Args)]
pub struct BatchCommand {
    /// JSON file of `{"<type>:<account>": ["allow", "forward", ...]}`
    pub file: PathBuf,

    /// Build documents for the initial announcement
    #[arg(long)]
    pub initial: bool,
}

impl BatchCommand {
    pub async fn execute(&self, format: OutputFormat) -> Result<()> {
        let printer = Printer::new(format);

        let content = tokio::fs::read_to_string(&self.file)
            .await
            .with_context(|| format!("Failed to read {}", self.file.display()))?;
        let entries = parse_entries(&content)?;
        debug!(entries = entries.len(), initial = self.initial, "Building batches");

        let batches = build_wire_batches(&entries, self.initial);

        if printer.is_json() {
            let documents: Vec<serde_json::Value> = batches.iter().map(batch_json).collect();
            printer.document(&serde_json::json!({
                "initial": self.initial,
                "max_chars": MAX_PAYLOAD_CHARS,
                "batches": documents,
            }));
        } else {
            printer.done(&format!(
                "{} for {}",
                count(batches.len(), "document", "documents"),
                count(entries.len(), "entry", "entries")
            ));
            for (index, batch) in batches.iter().enumerate() {
                printer.line("");
                printer.line(&batch_heading(index, batch));
                printer.block(&batch.payload);
            }
        }

        Ok(())
    }
}

/// Parses the input object into builder entries
///
/// The list names of one entry are OR-ed together.
fn parse_entries(content: &str) -> Result<BTreeMap<ContactHash, RoleLists>> {
    let raw: BTreeMap<String, Vec<String>> =
        serde_json::from_str(content).context("Expected a JSON object of string arrays")?;

    let mut entries = BTreeMap::new();
    for (hash, names) in raw {
        let hash: ContactHash = hash.parse()?;
        let mut lists = RoleLists::empty();
        for name in &names {
            lists |= RoleLists::from_list_name(name)
                .with_context(|| format!("Invalid list for {hash}"))?;
        }
        *entries.entry(hash).or_insert_with(RoleLists::empty) |= lists;
    }
    Ok(entries)
}
