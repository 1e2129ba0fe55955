use jobplane_types::{async_trait, StatusReport};
use std::time::Duration;

use crate::{config::WorkerConfig, error::ExecutorError, types::BearerToken};

/// Worker-side status callback. The token authorizes reports for the one
/// task it is bound to.
#[async_trait]
pub trait StatusReporter: Send + Sync {
    async fn report(&self, token: &BearerToken, report: &StatusReport) -> Result<(), ExecutorError>;
}

/// Posts reports to `{base_url}/tasks/{task_id}/status` with bounded retries.
#[derive(Debug, Clone)]
pub struct HttpStatusReporter {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
    retries: u32,
}

impl HttpStatusReporter {
    pub fn new(base_url: impl Into<String>, config: &WorkerConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout: config.callback_timeout(),
            retries: config.callback_retries,
        }
    }
}

#[async_trait]
impl StatusReporter for HttpStatusReporter {
    async fn report(&self, token: &BearerToken, report: &StatusReport) -> Result<(), ExecutorError> {
        let url = format!("{}/tasks/{}/status", self.base_url, report.task_id);

        for attempt in 0..=self.retries {
            let result = self
                .client
                .post(&url)
                .bearer_auth(token.expose())
                .timeout(self.timeout)
                .json(report)
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) if response.status().is_client_error() => {
                    // Rejected reports will not succeed on retry.
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    return Err(ExecutorError::Callback(format!("{}: {}", status, body)));
                }
                Ok(response) => {
                    let status = response.status();
                    tracing::warn!(attempt, status = %status, "Status callback failed");
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "Status callback error");
                }
            }

            if attempt < self.retries {
                tokio::time::sleep(Duration::from_millis(100 * (attempt as u64 + 1))).await;
            }
        }

        Err(ExecutorError::Callback(format!(
            "Failed after {} retries",
            self.retries
        )))
    }
}
