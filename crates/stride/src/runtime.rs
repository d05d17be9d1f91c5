//! Stride runtime: one process wired from configuration.
//!
//! Connects to PostgreSQL, applies migrations, builds the checkpoint store,
//! the LISTEN/NOTIFY event bus and the orchestrator service, and runs the
//! delayed job scheduler in the background.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use stride_core::config::StrideConfig;
use stride_core::error::{Result, StrideError};
use stride_core::workflow::Workflow;
use stride_runtime::bus::{PgEventBus, PgEventBusConfig};
use stride_runtime::db::Database;
use stride_runtime::migrations::{load_migrations_from_dir, Migration, MigrationRunner};
use stride_runtime::orchestrator::{JobScheduler, WorkflowRegistry};
use stride_runtime::service::OrchestratorService;
use stride_runtime::store::PgTransactionStore;

/// Prelude module for common imports.
pub mod prelude {
    pub use serde_json::{json, Value};

    pub use stride_core::config::StrideConfig;
    pub use stride_core::error::{Result, StrideError};
    pub use stride_core::workflow::{
        FnStep, IdempotencyKey, LifecycleEvent, StepDefinition, StepError, StepHandler,
        StepOutcome, StepPayload, TransactionState, Workflow,
    };
    pub use stride_runtime::service::{CallbackOptions, OrchestratorService, RunOptions};

    pub use crate::{Stride, StrideBuilder};
}

/// A running Stride node.
pub struct Stride {
    config: StrideConfig,
    db: Database,
    bus: PgEventBus,
    service: OrchestratorService,
    shutdown: CancellationToken,
    scheduler: Option<JoinHandle<()>>,
}

impl Stride {
    /// Create a new builder for configuring Stride.
    pub fn builder() -> StrideBuilder {
        StrideBuilder::new()
    }

    pub fn config(&self) -> &StrideConfig {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// The service used to run workflows and deliver callbacks.
    pub fn service(&self) -> &OrchestratorService {
        &self.service
    }

    pub fn registry(&self) -> &Arc<WorkflowRegistry> {
        self.service.registry()
    }

    /// Serve until Ctrl-C or [`Stride::shutdown`], then stop.
    pub async fn run(self) -> Result<()> {
        tracing::info!(
            instance_id = %self.service.instance_id(),
            workflows = ?self.registry().list(),
            "Stride node running"
        );

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received shutdown signal");
            }
            _ = self.shutdown.cancelled() => {
                tracing::info!("Received shutdown notification");
            }
        }

        self.stop().await;
        Ok(())
    }

    /// Request shutdown.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Stop background tasks and close connections.
    pub async fn stop(mut self) {
        tracing::info!("Starting graceful shutdown...");
        self.shutdown.cancel();

        if let Some(scheduler) = self.scheduler.take() {
            let _ = scheduler.await;
        }
        self.service.shutdown().await;
        self.bus.stop();
        self.db.close().await;

        tracing::info!("Stride node stopped");
    }
}

/// Builder for configuring the Stride runtime.
pub struct StrideBuilder {
    config: Option<StrideConfig>,
    registry: Arc<WorkflowRegistry>,
    migrations_dir: Option<PathBuf>,
    extra_migrations: Vec<Migration>,
}

impl StrideBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            registry: Arc::new(WorkflowRegistry::new()),
            migrations_dir: None,
            extra_migrations: Vec::new(),
        }
    }

    /// Set the configuration.
    pub fn config(mut self, config: StrideConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Register a workflow.
    pub fn workflow(self, workflow: Workflow) -> Self {
        self.registry.register(workflow);
        self
    }

    /// Use an existing registry.
    pub fn registry(mut self, registry: Arc<WorkflowRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Load additional migrations from a directory, applied after the built-in ones.
    pub fn migrations_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.migrations_dir = Some(path.into());
        self
    }

    /// Add a migration programmatically.
    pub fn migration(mut self, name: impl Into<String>, sql: impl Into<String>) -> Self {
        self.extra_migrations.push(Migration::new(name, sql));
        self
    }

    /// Connect, migrate and start the node.
    pub async fn start(self) -> Result<Stride> {
        let config = self
            .config
            .ok_or_else(|| StrideError::Config("Configuration is required".to_string()))?;

        let db = Database::from_config(&config.database).await?;
        db.health_check().await?;
        let pool = db.pool().clone();
        tracing::info!("Connected to database");

        let mut migrations = match &self.migrations_dir {
            Some(dir) => load_migrations_from_dir(dir)?,
            None => Vec::new(),
        };
        migrations.extend(self.extra_migrations);

        let applied = MigrationRunner::new(pool.clone()).run(migrations).await?;
        tracing::info!(applied = applied.len(), "Migrations completed");

        let store = Arc::new(PgTransactionStore::new(pool.clone()));
        let bus = PgEventBus::new(pool, PgEventBusConfig::from(&config.bus));

        let service = OrchestratorService::builder(store.clone(), Arc::new(bus.clone()))
            .registry(self.registry)
            .instance_id(instance_name(&config))
            .orchestrator_config(config.orchestrator.clone())
            .bus_config(config.bus.clone())
            .build();
        service.start();

        let shutdown = CancellationToken::new();
        let scheduler = config.node.run_scheduler.then(|| {
            let scheduler = JobScheduler::new(
                store,
                Arc::new(service.clone()),
                config.scheduler.clone(),
            );
            let token = shutdown.clone();
            tokio::spawn(async move { scheduler.run(token).await })
        });

        tracing::info!(
            instance_id = %service.instance_id(),
            scheduler = scheduler.is_some(),
            "Stride node started"
        );

        Ok(Stride {
            config,
            db,
            bus,
            service,
            shutdown,
            scheduler,
        })
    }
}

impl Default for StrideBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Configured instance name, or the hostname with a random suffix.
fn instance_name(config: &StrideConfig) -> String {
    if let Some(name) = &config.node.instance_name {
        return name.clone();
    }

    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "stride".to_string());
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", host, &suffix[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_builder_requires_config() {
        let result = StrideBuilder::new().start().await;
        assert!(matches!(result, Err(StrideError::Config(_))));
    }

    #[test]
    fn test_builder_registers_workflows() {
        let workflow = Workflow::builder("greet")
            .step(
                stride_core::workflow::StepDefinition::new("hello"),
                stride_core::workflow::FnStep::new(|_| async {
                    Ok(stride_core::workflow::StepOutcome::Completed(
                        serde_json::Value::Null,
                    ))
                }),
            )
            .build()
            .unwrap();

        let builder = StrideBuilder::new().workflow(workflow);
        assert_eq!(builder.registry.list(), vec!["greet"]);
    }

    #[test]
    fn test_instance_name() {
        let mut config = StrideConfig::default_with_database_url("postgres://localhost/test");
        let generated = instance_name(&config);
        assert_ne!(generated, instance_name(&config));

        config.node.instance_name = Some("node-a".into());
        assert_eq!(instance_name(&config), "node-a");
    }
}
