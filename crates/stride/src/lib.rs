//! Stride - durable saga orchestration.
//!
//! Workflows are graphs of steps with compensations. Transactions are
//! checkpointed after every transition, retries and timeouts are durable
//! jobs, and lifecycle events are shared between instances.

mod runtime;

pub use stride_core;
pub use stride_runtime;

#[cfg(feature = "testing")]
pub use stride_core::{
    assert_err, assert_err_variant, assert_ok, assert_step_state, assert_transaction_state,
};

pub use runtime::prelude;
pub use runtime::{Stride, StrideBuilder};
