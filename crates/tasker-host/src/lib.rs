//! Host-call boundary for tasker task code.
//!
//! This crate provides:
//! - [`Interceptor`] / [`HostCalls`]: the replay boundary task code calls
//!   through. A call either returns a memoized result or halts execution.
//! - [`ServiceRegistry`]: the dispatch table the stack processor uses to
//!   perform calls, keyed by service name.
//! - [`KeystoreHandler`]: the built-in `keystore` service.

mod error;
mod interceptor;
mod keystore;
mod registry;

pub use error::{CallError, ServiceError};
pub use interceptor::{Halt, HostCalls, Interceptor, Suspension, TASK_SERVICE};
pub use keystore::{KEYSTORE_SERVICE, KeystoreHandler};
pub use registry::{CallContext, FnHandler, ServiceHandler, ServiceRegistry, string_arg};
