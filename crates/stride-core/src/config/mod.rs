mod database;
mod engine;
mod observability;

pub use database::DatabaseConfig;
pub use engine::{BusConfig, OrchestratorConfig, SchedulerConfig};
pub use observability::{LoggingConfig, ObservabilityConfig};

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Result, StrideError};

/// Root configuration for Stride.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrideConfig {
    /// Project metadata.
    #[serde(default)]
    pub project: ProjectConfig,

    /// Database configuration.
    pub database: DatabaseConfig,

    /// Node configuration.
    #[serde(default)]
    pub node: NodeConfig,

    /// Orchestrator configuration.
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Delayed job scheduler configuration.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Event bus configuration.
    #[serde(default)]
    pub bus: BusConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl StrideConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| StrideError::Config(format!("Failed to read config file: {}", e)))?;

        tracing::debug!(path = %path.display(), "Loading configuration");
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse_toml(content: &str) -> Result<Self> {
        let content = substitute_env_vars(content);

        toml::from_str(&content)
            .map_err(|e| StrideError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load configuration with defaults.
    pub fn default_with_database_url(url: &str) -> Self {
        Self {
            project: ProjectConfig::default(),
            database: DatabaseConfig {
                url: url.to_string(),
                ..Default::default()
            },
            node: NodeConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            scheduler: SchedulerConfig::default(),
            bus: BusConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

/// Project metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Project name.
    #[serde(default = "default_project_name")]
    pub name: String,

    /// Project version.
    #[serde(default = "default_version")]
    pub version: String,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            name: default_project_name(),
            version: default_version(),
        }
    }
}

fn default_project_name() -> String {
    "stride-app".to_string()
}

fn default_version() -> String {
    "0.1.0".to_string()
}

/// Node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Human-readable instance name, used as the event origin.
    /// A random id is generated when unset.
    pub instance_name: Option<String>,

    /// Whether this node runs the delayed job scheduler.
    #[serde(default = "default_true")]
    pub run_scheduler: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            instance_name: None,
            run_scheduler: default_true(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// Substitute environment variables in the format ${VAR_NAME}.
fn substitute_env_vars(content: &str) -> String {
    let mut result = content.to_string();
    let re = match regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}") {
        Ok(re) => re,
        Err(_) => return result,
    };

    for cap in re.captures_iter(content) {
        let var_name = &cap[1];
        if let Ok(value) = std::env::var(var_name) {
            result = result.replace(&cap[0], &value);
        }
    }

    result
}
