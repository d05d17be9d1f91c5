use anyhow::{anyhow, Result};
use clap::Parser;
use console::style;

use stride_core::config::StrideConfig;
use stride_core::store::TransactionStore;
use stride_core::workflow::{CheckpointKey, DistributedTransaction, StepState, TransactionStep};

use super::{connect_store, header, styled_state};

/// Show the stored checkpoint of one transaction.
#[derive(Parser)]
pub struct InspectCommand {
    /// Workflow id.
    pub workflow: String,

    /// Transaction id.
    pub transaction: String,

    /// Print the raw checkpoint as JSON.
    #[arg(long)]
    pub json: bool,
}

impl InspectCommand {
    pub async fn execute(self, config: &StrideConfig) -> Result<()> {
        let key = CheckpointKey::new(&self.workflow, &self.transaction);

        let (db, store) = connect_store(config).await?;
        let checkpoint = store.get(key.clone()).await?;
        db.close().await;

        let checkpoint = checkpoint.ok_or_else(|| anyhow!("Transaction {} not found", key))?;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&checkpoint)?);
            return Ok(());
        }

        let tx = DistributedTransaction::from(checkpoint);
        header(&key.to_string());

        println!("  {:<10} {}", style("state").dim(), styled_state(tx.state()));
        println!("  {:<10} {}", style("version").dim(), tx.version);
        println!(
            "  {:<10} {}",
            style("created").dim(),
            tx.created_at.format("%Y-%m-%d %H:%M:%S")
        );
        println!(
            "  {:<10} {}",
            style("updated").dim(),
            tx.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
        if tx.cancelled {
            println!("  {} cancelled", style("!").yellow());
        }
        if tx.timed_out {
            println!("  {} timed out", style("!").yellow());
        }

        println!();
        println!("  {}", style("Steps").bold());
        for step in &tx.steps {
            println!("    {}", step_line(step));
            if let Some(error) = &step.last_error {
                println!("      {} {}", style("└").dim(), style(&error.message).red());
            }
        }

        if !tx.errors.is_empty() {
            println!();
            println!("  {}", style("Errors").bold());
            for error in &tx.errors {
                println!(
                    "    {} {} #{} {}",
                    style(&error.action).cyan(),
                    error.handler_type.as_str(),
                    error.attempt,
                    error.error
                );
            }
        }

        println!();
        Ok(())
    }
}

fn step_line(step: &TransactionStep) -> String {
    let state = match step.state {
        StepState::Done => style(step.state.as_str()).green(),
        StepState::Reverted | StepState::Skipped => style(step.state.as_str()).yellow(),
        StepState::Failed => style(step.state.as_str()).red(),
        _ => style(step.state.as_str()).cyan(),
    };
    format!(
        "{:<20} {:<12} {:<10} attempts={}",
        step.id,
        state,
        step.phase.as_str(),
        step.attempts
    )
}
