mod inspect;
mod list;
mod migrate;
mod purge;

pub use inspect::InspectCommand;
pub use list::ListCommand;
pub use migrate::MigrateCommand;
pub use purge::PurgeCommand;

use std::path::Path;

use anyhow::Result;
use clap::{Parser, Subcommand};
use console::{style, StyledObject};
use tracing_subscriber::EnvFilter;

use stride_core::config::{LoggingConfig, StrideConfig};
use stride_core::workflow::TransactionState;
use stride_runtime::db::Database;
use stride_runtime::store::PgTransactionStore;

/// Stride - durable saga orchestration
#[derive(Parser)]
#[command(name = "stride")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path.
    #[arg(short, long, default_value = "stride.toml", global = true)]
    pub config: String,

    #[command(subcommand)]
    pub command: Commands,
}

/// CLI commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Manage database migrations.
    Migrate(MigrateCommand),

    /// List stored transactions.
    List(ListCommand),

    /// Show one transaction in detail.
    Inspect(InspectCommand),

    /// Delete transactions whose retention has elapsed.
    Purge(PurgeCommand),
}

impl Cli {
    /// Execute the CLI command.
    pub async fn execute(self) -> Result<()> {
        let config = load_config(&self.config)?;
        init_logging(&config.observability.logging);

        match self.command {
            Commands::Migrate(cmd) => cmd.execute(&config).await,
            Commands::List(cmd) => cmd.execute(&config).await,
            Commands::Inspect(cmd) => cmd.execute(&config).await,
            Commands::Purge(cmd) => cmd.execute(&config).await,
        }
    }
}

/// Load `.env`, then the configuration file.
fn load_config(path: &str) -> Result<StrideConfig> {
    dotenvy::dotenv().ok();

    if !Path::new(path).exists() {
        anyhow::bail!("Configuration file not found: {}", path);
    }
    Ok(StrideConfig::from_file(path)?)
}

/// `RUST_LOG` wins over the configured level.
fn init_logging(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let result = if config.json_format {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init()
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).try_init()
    };

    if let Err(e) = result {
        eprintln!("Failed to initialize logging: {}", e);
    }
}

async fn connect_store(config: &StrideConfig) -> Result<(Database, PgTransactionStore)> {
    let db = Database::from_config(&config.database).await?;
    let store = PgTransactionStore::new(db.pool().clone());
    Ok((db, store))
}

fn header(title: &str) {
    println!();
    println!("  {} {}", style("STRIDE").bold().cyan(), style(title).bold());
    println!();
}

fn styled_state(state: TransactionState) -> StyledObject<&'static str> {
    let name = style(state.as_str());
    match state {
        TransactionState::Done => name.green(),
        TransactionState::Reverted => name.yellow(),
        TransactionState::Failed => name.red().bold(),
        _ => name.cyan(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse() {
        let cli = Cli::try_parse_from(["stride", "list"]).unwrap();
        assert_eq!(cli.config, "stride.toml");
        assert!(matches!(cli.command, Commands::List(_)));
    }

    #[test]
    fn test_cli_parse_inspect() {
        let cli = Cli::try_parse_from([
            "stride", "inspect", "checkout", "tx-1", "--json", "-c", "other.toml",
        ])
        .unwrap();
        assert_eq!(cli.config, "other.toml");
        match cli.command {
            Commands::Inspect(cmd) => {
                assert_eq!(cmd.workflow, "checkout");
                assert_eq!(cmd.transaction, "tx-1");
                assert!(cmd.json);
            }
            _ => panic!("expected inspect"),
        }
    }

    #[test]
    fn test_cli_parse_migrate() {
        assert!(Cli::try_parse_from(["stride", "migrate", "up"]).is_ok());
        assert!(Cli::try_parse_from(["stride", "migrate", "status"]).is_ok());
        assert!(Cli::try_parse_from(["stride", "migrate", "down"]).is_err());
    }

    #[test]
    fn test_load_config() {
        assert!(load_config("/nonexistent/stride.toml").is_err());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stride.toml");
        std::fs::write(
            &path,
            r#"
            [database]
            url = "postgres://localhost/stride"
            "#,
        )
        .unwrap();

        let config = load_config(path.to_str().unwrap()).unwrap();
        assert_eq!(config.database.url, "postgres://localhost/stride");
    }
}
