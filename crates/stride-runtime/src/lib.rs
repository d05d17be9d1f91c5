pub mod bus;
pub mod db;
pub mod migrations;
pub mod orchestrator;
pub mod service;
pub mod store;

pub use bus::{MemoryEventBus, PgEventBus, PgEventBusConfig};
pub use db::Database;
pub use migrations::{MigrationRunner, MigrationStatus};
pub use orchestrator::{
    CallbackOutcome, JobDispatcher, JobScheduler, TransactionOrchestrator, WorkflowRegistry,
};
pub use service::{
    Acknowledgement, CallbackOptions, OrchestratorService, RunOptions, RunResult,
    ServiceBuilder, SubscriberId, WorkflowRef,
};
pub use store::{MemoryTransactionStore, PgTransactionStore};
