pub mod bus;
pub mod config;
pub mod error;
pub mod store;
pub mod workflow;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use bus::{BusMessage, EventBus};
pub use config::StrideConfig;
pub use error::{Result, StrideError};
pub use store::{CheckpointSummary, JobType, ScheduledJob, TransactionStore};
pub use workflow::{
    CheckpointKey, DistributedTransaction, EventKind, FnStep, IdempotencyKey, LifecycleEvent,
    StepAction, StepDefinition, StepError, StepHandler, StepOutcome, StepPayload, StepState,
    TransactionCheckpoint, TransactionState, Workflow, WorkflowBuilder, WorkflowDefinition,
};
