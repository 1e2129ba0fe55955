//! jobplane executor
//!
//! The isolated execution plane. Workers hold no long-lived credential and
//! expose no listener: each one receives an [`Assignment`] carrying two
//! pre-signed URLs (read the input, write the output) and a callback token
//! bound to its task, runs the handler registered for the task's pipeline
//! reference, and exits.
//!
//! Access to the pool itself is gated by a two-factor check
//! ([`WorkerAuthPolicy`]): the caller's network origin must be allow-listed
//! and it must present a valid time-based one-time code.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let pool = LocalWorkerPool::new(config, policy, HandlerRegistry::with_builtins(), transfer, clock);
//! if let Authorization::Authorized(grant) = pool.authorize(&auth).await {
//!     let run = pool.assign(&grant, assignment).await?;
//!     let outcome = run.outcome().await;
//! }
//! ```

pub mod auth;
pub mod config;
pub mod error;
pub mod execute;
pub mod handler;
pub mod pool;
pub mod reporter;
pub mod transfer;
pub mod types;

pub use auth::{Authorization, DenialReason, PoolGrant, Totp, WorkerAuth, WorkerAuthPolicy};
pub use config::{WorkerConfig, WorkerTransport};
pub use error::ExecutorError;
pub use execute::execute;
pub use handler::{HandlerContext, HandlerRegistry, TaskHandler};
pub use pool::{LocalWorkerPool, WorkerOutcome, WorkerPool, WorkerRun};
pub use reporter::{HttpStatusReporter, StatusReporter};
pub use transfer::{HttpTransfer, LocalTransfer, ObjectTransfer};
pub use types::{Assignment, BearerToken, ExecutionResult};
