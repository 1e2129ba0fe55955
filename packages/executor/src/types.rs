use jobplane_storage::PresignedUrl;
use jobplane_types::{
    chrono::{DateTime, Utc},
    TaskId,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Bearer credential handed to a worker. Renders redacted.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BearerToken(String);

impl BearerToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix: String = self.0.chars().take(8).collect();
        write!(f, "BearerToken({}…)", prefix)
    }
}

/// Everything a worker receives for one attempt of a task.
///
/// The worker holds no other credential: input and output are reachable only
/// through the two pre-signed URLs, and the callback token authorizes status
/// reports for this task alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub task_id: TaskId,
    pub attempt: u32,
    pub pipeline_ref: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
    pub input: PresignedUrl,
    pub output: PresignedUrl,
    pub callback_token: BearerToken,
    pub lease_expires_at: DateTime<Utc>,
}

/// Result of a completed execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub task_id: TaskId,
    pub attempt: u32,
    /// Object the output was written to
    pub output_locator: String,
    /// BLAKE3 digest of the written output, hex encoded
    pub output_digest: String,
    pub bytes_written: u64,
    /// Execution duration in milliseconds
    pub duration_ms: u64,
}
