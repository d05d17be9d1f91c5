//! Testing utilities for Stride workflows.
//!
//! - assertion macros for results, step states and transaction states
//! - [`MockStep`], a scripted step handler recording calls into a [`CallJournal`]
//! - helpers for inspecting recorded lifecycle events
//!
//! # Example
//!
//! ```ignore
//! use stride_core::testing::*;
//!
//! let journal = CallJournal::new();
//! let workflow = Workflow::builder("checkout")
//!     .step(StepDefinition::new("reserve"), MockStep::completing(json!(1)).with_journal(journal.clone()))
//!     .build()?;
//! ```

pub mod assertions;
pub mod mock_step;

pub use assertions::*;
pub use mock_step::{CallJournal, CallRecord, MockBehavior, MockStep};

use std::time::Duration;

/// Default test timeout.
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(30);
