mod builder;
mod checkpoint;
mod definition;
mod events;
mod handler;
mod key;
mod step;
mod transaction;

pub use builder::{Workflow, WorkflowBuilder};
pub use checkpoint::{CheckpointKey, TransactionCheckpoint, TransactionFlow};
pub use definition::{StepDefinition, WorkflowDefinition};
pub use events::{EventKind, LifecycleEvent};
pub use handler::{
    FnStep, PayloadMetadata, StepError, StepErrorKind, StepHandler, StepOutcome, StepPayload,
};
pub use key::IdempotencyKey;
pub use step::{StepAction, StepState, TransactionStep};
pub use transaction::{
    new_transaction_id, validate_transaction_id, DistributedTransaction, TransactionContext,
    TransactionError, TransactionState,
};
