use std::path::Path;

use anyhow::Result;
use clap::{Parser, Subcommand};
use console::style;

use stride_core::config::StrideConfig;
use stride_runtime::db::Database;
use stride_runtime::migrations::{load_migrations_from_dir, Migration, MigrationRunner};

use super::header;

/// Manage database migrations.
#[derive(Parser)]
pub struct MigrateCommand {
    #[command(subcommand)]
    pub action: MigrateAction,

    /// Directory with additional migrations, applied after the built-in ones.
    #[arg(short, long, global = true)]
    pub migrations_dir: Option<String>,
}

#[derive(Subcommand)]
pub enum MigrateAction {
    /// Run all pending migrations.
    Up,

    /// Show migration status.
    Status,
}

impl MigrateCommand {
    pub async fn execute(self, config: &StrideConfig) -> Result<()> {
        let extra = self.extra_migrations()?;

        let db = Database::from_config(&config.database).await?;
        let runner = MigrationRunner::new(db.pool().clone());

        match self.action {
            MigrateAction::Up => {
                header("Migrations");
                println!("  {} Running pending migrations...", style("→").dim());

                let applied = runner.run(extra).await?;
                if applied.is_empty() {
                    println!("  {} Database is up to date", style("ℹ").blue());
                } else {
                    for name in &applied {
                        println!("  {} Applied: {}", style("✓").green(), style(name).cyan());
                    }
                    println!();
                    println!(
                        "  {} Applied {} migration(s)",
                        style("✓").green(),
                        applied.len()
                    );
                }
                println!();
            }

            MigrateAction::Status => {
                header("Migration Status");

                let status = runner.status(extra).await?;
                let (applied, pending): (Vec<_>, Vec<_>) =
                    status.iter().partition(|m| m.is_applied());

                if !applied.is_empty() {
                    println!("  {} Applied:", style("✓").green());
                    for m in &applied {
                        if let Some(at) = m.applied_at {
                            println!(
                                "    {} {} ({})",
                                style(&m.name).cyan(),
                                style("at").dim(),
                                at.format("%Y-%m-%d %H:%M:%S")
                            );
                        }
                    }
                }

                if !pending.is_empty() {
                    if !applied.is_empty() {
                        println!();
                    }
                    println!("  {} Pending:", style("○").yellow());
                    for m in &pending {
                        println!("    {} {}", style("→").dim(), style(&m.name).yellow());
                    }
                }

                println!();
                println!(
                    "  {} {} applied, {} pending",
                    style("ℹ").blue(),
                    applied.len(),
                    pending.len()
                );
                println!();
            }
        }

        db.close().await;
        Ok(())
    }

    fn extra_migrations(&self) -> Result<Vec<Migration>> {
        match &self.migrations_dir {
            Some(dir) => {
                let path = Path::new(dir);
                if !path.exists() {
                    anyhow::bail!("Migrations directory not found: {}", dir);
                }
                Ok(load_migrations_from_dir(path)?)
            }
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extra_migrations_from_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("0001_orders.sql"), "CREATE TABLE orders (id INT);")
            .unwrap();

        let cmd = MigrateCommand {
            action: MigrateAction::Status,
            migrations_dir: Some(dir.path().to_string_lossy().to_string()),
        };
        let migrations = cmd.extra_migrations().unwrap();
        assert_eq!(migrations.len(), 1);
        assert_eq!(migrations[0].name, "0001_orders");
    }

    #[test]
    fn test_missing_migrations_dir() {
        let cmd = MigrateCommand {
            action: MigrateAction::Up,
            migrations_dir: Some("/nonexistent/migrations".into()),
        };
        assert!(cmd.extra_migrations().is_err());

        let cmd = MigrateCommand {
            action: MigrateAction::Up,
            migrations_dir: None,
        };
        assert!(cmd.extra_migrations().unwrap().is_empty());
    }
}
