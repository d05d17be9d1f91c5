mod emitter;
mod executor;
mod registry;
mod scheduler;

pub use emitter::EventEmitter;
pub use executor::{ActivePasses, CallbackOutcome, TransactionOrchestrator};
pub use registry::WorkflowRegistry;
pub use scheduler::{JobDispatcher, JobScheduler};
