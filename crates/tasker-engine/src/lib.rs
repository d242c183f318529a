//! Tasker Engine
//!
//! This crate runs task code durably:
//! - [`TaskExecutor`] runs or replays a task run and parks it when task code
//!   reaches a call without a recorded result.
//! - [`StackProcessor`] performs those calls, records their results and
//!   resumes the task runs that were waiting on them.
//! - [`TaskService`] ties both to one store and exposes the submission
//!   operations (submit, execute, process, status, functions, keystore).

mod error;
mod executor;
mod processor;
mod result;
mod service;

pub use error::EngineError;
pub use executor::TaskExecutor;
pub use processor::{ProcessSummary, StackProcessor};
pub use result::{ExecutionOutcome, NestedOutcome, SuspensionData};
pub use service::TaskService;
