use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use console::style;

use stride_core::config::StrideConfig;
use stride_core::store::TransactionStore;

use super::{connect_store, header};

/// Delete checkpoints whose retention has elapsed.
#[derive(Parser)]
pub struct PurgeCommand {}

impl PurgeCommand {
    pub async fn execute(self, config: &StrideConfig) -> Result<()> {
        header("Purge");

        let (db, store) = connect_store(config).await?;
        let purged = store.purge_expired(Utc::now()).await?;
        db.close().await;

        println!(
            "  {} Removed {} expired checkpoint(s)",
            style("✓").green(),
            purged
        );
        println!();
        Ok(())
    }
}
