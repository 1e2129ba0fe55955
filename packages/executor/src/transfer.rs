use jobplane_storage::{ObjectGateway, PresignedUrl, TransferError};
use jobplane_types::{async_trait, bytes::Bytes};
use std::time::Duration;

/// How a worker moves bytes. Implementations only ever see pre-signed URLs.
#[async_trait]
pub trait ObjectTransfer: Send + Sync {
    async fn fetch(&self, url: &PresignedUrl) -> Result<Bytes, TransferError>;
    async fn store(&self, url: &PresignedUrl, data: Bytes) -> Result<(), TransferError>;
}

/// In-process transfer through the object gateway. The gateway still verifies
/// every URL, so a worker in the same process gains no extra reach.
#[derive(Debug, Clone)]
pub struct LocalTransfer {
    gateway: ObjectGateway,
}

impl LocalTransfer {
    pub fn new(gateway: ObjectGateway) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl ObjectTransfer for LocalTransfer {
    async fn fetch(&self, url: &PresignedUrl) -> Result<Bytes, TransferError> {
        self.gateway.read(&url.url).await
    }

    async fn store(&self, url: &PresignedUrl, data: Bytes) -> Result<(), TransferError> {
        self.gateway.write(&url.url, data).await
    }
}

/// Transfer over HTTP, for workers running outside the control-plane process.
#[derive(Debug, Clone)]
pub struct HttpTransfer {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpTransfer {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }
}

fn map_status(status: reqwest::StatusCode, path: &str) -> TransferError {
    match status.as_u16() {
        410 => TransferError::AccessExpired,
        403 => TransferError::AccessDenied(format!("gateway refused {}", path)),
        404 => TransferError::NotFound(path.to_string()),
        _ => TransferError::Transport(format!("gateway returned {} for {}", status, path)),
    }
}

#[async_trait]
impl ObjectTransfer for HttpTransfer {
    async fn fetch(&self, url: &PresignedUrl) -> Result<Bytes, TransferError> {
        let response = self
            .client
            .get(&url.url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| TransferError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(map_status(response.status(), &url.path));
        }

        response
            .bytes()
            .await
            .map_err(|e| TransferError::Transport(e.to_string()))
    }

    async fn store(&self, url: &PresignedUrl, data: Bytes) -> Result<(), TransferError> {
        let response = self
            .client
            .put(&url.url)
            .timeout(self.timeout)
            .body(data)
            .send()
            .await
            .map_err(|e| TransferError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(map_status(response.status(), &url.path));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_statuses_map_to_taxonomy() {
        assert!(matches!(
            map_status(reqwest::StatusCode::GONE, "o"),
            TransferError::AccessExpired
        ));
        assert!(matches!(
            map_status(reqwest::StatusCode::FORBIDDEN, "o"),
            TransferError::AccessDenied(_)
        ));
        assert!(matches!(
            map_status(reqwest::StatusCode::BAD_GATEWAY, "o"),
            TransferError::Transport(_)
        ));
    }
}
