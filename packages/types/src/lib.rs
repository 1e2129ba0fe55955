//! Shared data model for the jobplane control and data planes.
//!
//! Everything that crosses a component boundary lives here: the [`Task`]
//! record owned by the job queue, its [`TaskStatus`] lifecycle, the
//! [`ErrorKind`] taxonomy used in status reports, and the injectable
//! [`Clock`] every time-dependent component is constructed with.

pub mod clock;
pub mod status;
pub mod task;

pub use anyhow::{Error, Result, anyhow, bail};
pub use async_trait::async_trait;
pub use base64;
pub use bytes;
pub use chrono;
pub use serde_json::{self as json, Value};
pub use tokio;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use status::{ErrorKind, StatusReport, TaskError};
pub use task::{NewTask, Task, TaskId, TaskStatus};

/// Generate a fresh, globally unique identifier.
pub fn create_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
