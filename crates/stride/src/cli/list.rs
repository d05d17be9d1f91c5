use anyhow::Result;
use clap::Parser;
use console::style;

use stride_core::config::StrideConfig;
use stride_core::store::{CheckpointSummary, TransactionStore};
use stride_core::workflow::TransactionState;

use super::{connect_store, header, styled_state};

/// List stored transactions, most recently updated first.
#[derive(Parser)]
pub struct ListCommand {
    /// Only show transactions of this workflow.
    #[arg(short, long)]
    pub workflow: Option<String>,

    /// Only show transactions in this state (e.g. waiting, failed).
    #[arg(short, long)]
    pub state: Option<String>,

    /// Maximum number of rows to print.
    #[arg(short, long, default_value = "50")]
    pub limit: usize,
}

impl ListCommand {
    pub async fn execute(self, config: &StrideConfig) -> Result<()> {
        let state = self
            .state
            .as_deref()
            .map(|s| s.parse::<TransactionState>().map_err(anyhow::Error::msg))
            .transpose()?;

        let (db, store) = connect_store(config).await?;
        let entries = store.list().await?;
        db.close().await;

        header("Transactions");

        let rows = filter(entries, self.workflow.as_deref(), state, self.limit);
        if rows.is_empty() {
            println!("  {} No transactions found", style("ℹ").blue());
            println!();
            return Ok(());
        }

        for row in &rows {
            let expires = row
                .expires_at
                .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "  {} {:<12} v{:<4} {} {} {}",
                style(&row.key).cyan(),
                styled_state(row.state),
                row.version,
                row.updated_at.format("%Y-%m-%d %H:%M:%S"),
                style("expires").dim(),
                expires
            );
        }

        println!();
        println!("  {} {} transaction(s)", style("ℹ").blue(), rows.len());
        println!();
        Ok(())
    }
}

fn filter(
    mut entries: Vec<CheckpointSummary>,
    workflow: Option<&str>,
    state: Option<TransactionState>,
    limit: usize,
) -> Vec<CheckpointSummary> {
    entries.retain(|e| {
        workflow.map_or(true, |w| e.key.workflow_id == w) && state.map_or(true, |s| e.state == s)
    });
    entries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    entries.truncate(limit);
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use stride_core::workflow::CheckpointKey;

    fn summary(workflow: &str, tx: &str, state: TransactionState, age: i64) -> CheckpointSummary {
        CheckpointSummary {
            key: CheckpointKey::new(workflow, tx),
            state,
            version: 1,
            updated_at: Utc::now() - Duration::seconds(age),
            expires_at: None,
        }
    }

    #[test]
    fn test_filter_and_order() {
        let entries = vec![
            summary("checkout", "a", TransactionState::Done, 30),
            summary("checkout", "b", TransactionState::Waiting, 10),
            summary("refund", "c", TransactionState::Waiting, 20),
        ];

        let all = filter(entries.clone(), None, None, 50);
        let ids: Vec<_> = all.iter().map(|e| e.key.transaction_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);

        let waiting = filter(entries.clone(), None, Some(TransactionState::Waiting), 50);
        assert_eq!(waiting.len(), 2);

        let checkout = filter(entries.clone(), Some("checkout"), None, 1);
        assert_eq!(checkout.len(), 1);
        assert_eq!(checkout[0].key.transaction_id, "b");
    }
}
