//! Cache command - Inspect or discard the persisted roster of an account

use anyhow::{Context, Result};
use clap::Subcommand;
use tracing::info;

use rostersync_cache::{RosterDatabase, SqliteRosterStore};
use rostersync_core::config::Config;
use rostersync_core::domain::Account;
use rostersync_core::ports::{IRosterStore, LoadOutcome, StoredRoster};

use crate::output::{circle_json, circle_row, contact_json, contact_row, OutputFormat, Printer};

#[derive(Debug, Subcommand)]
pub enum CacheCommand {
    /// Show the stored roster of an account
    Show {
        /// Owner account (e.g. "owner@example.com")
        #[arg(long)]
        account: String,
    },
    /// Delete the stored roster of an account
    Clear {
        /// Owner account (e.g. "owner@example.com")
        #[arg(long)]
        account: String,
    },
}

impl CacheCommand {
    pub async fn execute(&self, config: &Config, format: OutputFormat) -> Result<()> {
        let database = RosterDatabase::open(&config.storage.database)
            .await
            .context("Failed to open the roster database")?;
        let store = database.store();

        let result = match self {
            CacheCommand::Show { account } => {
                show(&store, &parse_account(account)?, format).await
            }
            CacheCommand::Clear { account } => {
                clear(&store, &parse_account(account)?, format).await
            }
        };
        database.close().await;
        result
    }
}

fn parse_account(account: &str) -> Result<Account> {
    Account::new(account).with_context(|| format!("Invalid account '{account}'"))
}

async fn show(store: &SqliteRosterStore, account: &Account, format: OutputFormat) -> Result<()> {
    let printer = Printer::new(format);
    let outcome = store.load(account).await?;
    let last_saved = store.last_saved(account).await?;

    if format.is_json() {
        let mut json = describe(&outcome);
        json["account"] = serde_json::json!(account.as_str());
        json["last_saved"] = serde_json::json!(last_saved);
        printer.document(&json);
        return Ok(());
    }

    match &outcome {
        LoadOutcome::Absent => {
            printer.line(&format!("No roster stored for {account}"));
        }
        LoadOutcome::Unreadable { reason } => {
            printer.failed(&format!("Stored roster for {account} is unreadable: {reason}"));
            printer.line("Run 'rostersync cache clear' to discard it.");
        }
        LoadOutcome::Loaded(StoredRoster { cache, journal }) => {
            printer.done(&format!("Roster for {account}"));
            if let Some(saved) = &last_saved {
                printer.line(&format!("Saved:        {saved}"));
            }
            printer.line(&format!(
                "Membership:   {}",
                cache.membership_last_change().to_rfc3339()
            ));
            printer.line(&format!("Deltas:       {}", journal.deltas_applied()));
            printer.line(&format!(
                "Contacts: {}  Groups: {}  Circles: {}",
                cache.contacts().len(),
                cache.groups().len(),
                cache.circles().len()
            ));
            printer.line("");
            for contact in cache.contacts().values() {
                printer.line(&contact_row(contact));
            }
            for circle in cache.circles().values() {
                printer.line(&circle_row(circle));
            }
        }
    }
    Ok(())
}

async fn clear(store: &SqliteRosterStore, account: &Account, format: OutputFormat) -> Result<()> {
    let printer = Printer::new(format);
    store.discard(account).await?;
    info!(account = %account, "Stored roster discarded");

    if format.is_json() {
        printer.document(&serde_json::json!({
            "success": true,
            "account": account.as_str(),
        }));
    } else {
        printer.done(&format!("Discarded the stored roster of {account}"));
    }
    Ok(())
}

/// JSON summary of a load outcome
fn describe(outcome: &LoadOutcome) -> serde_json::Value {
    match outcome {
        LoadOutcome::Absent => serde_json::json!({ "status": "absent" }),
        LoadOutcome::Unreadable { reason } => {
            serde_json::json!({ "status": "unreadable", "reason": reason })
        }
        LoadOutcome::Loaded(StoredRoster { cache, journal }) => {
            let contacts: Vec<serde_json::Value> =
                cache.contacts().values().map(contact_json).collect();
            let circles: Vec<serde_json::Value> =
                cache.circles().values().map(circle_json).collect();
            serde_json::json!({
                "status": "loaded",
                "membership_last_change": cache.membership_last_change().to_rfc3339(),
                "deltas_applied": journal.deltas_applied(),
                "groups": cache.groups().len(),
                "contacts": contacts,
                "circles": circles,
            })
        }
    }
}
