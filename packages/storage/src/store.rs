use jobplane_types::{SharedClock, bytes::Bytes, chrono::Duration};
use object_store::{ObjectStore, PutPayload, local::LocalFileSystem, memory::InMemory, path::Path};
use std::sync::Arc;

use crate::{
    error::TransferError,
    presign::{Operation, PresignedUrl, SignedQuery, UrlSigner},
};

#[derive(Clone, Debug)]
pub enum JobplaneStore {
    Local(Arc<LocalFileSystem>),
    Memory(Arc<InMemory>),
    Other(Arc<dyn ObjectStore>),
}

impl JobplaneStore {
    pub fn memory() -> Self {
        JobplaneStore::Memory(Arc::new(InMemory::new()))
    }

    pub fn local(root: impl AsRef<std::path::Path>) -> Result<Self, TransferError> {
        std::fs::create_dir_all(root.as_ref())
            .map_err(|e| TransferError::Transport(format!("Failed to create store root: {}", e)))?;
        let store = LocalFileSystem::new_with_prefix(root.as_ref())?;
        Ok(JobplaneStore::Local(Arc::new(store)))
    }

    pub fn as_generic(&self) -> Arc<dyn ObjectStore> {
        match self {
            JobplaneStore::Local(store) => store.clone() as Arc<dyn ObjectStore>,
            JobplaneStore::Memory(store) => store.clone() as Arc<dyn ObjectStore>,
            JobplaneStore::Other(store) => store.clone(),
        }
    }
}

/// Parse an object locator into a store path. Locators are relative,
/// slash-separated and may not escape the store root.
pub fn parse_locator(locator: &str) -> Result<Path, TransferError> {
    let trimmed = locator.trim_matches('/');
    if trimmed.is_empty() {
        return Err(TransferError::InvalidLocator("empty locator".into()));
    }
    Path::parse(trimmed).map_err(|e| TransferError::InvalidLocator(e.to_string()))
}

/// Object storage reachable only through pre-signed URLs.
///
/// The gateway is the single place where URLs are minted and redeemed. Workers
/// never see the store or the signing secret.
#[derive(Clone, Debug)]
pub struct ObjectGateway {
    store: JobplaneStore,
    signer: UrlSigner,
    clock: SharedClock,
}

impl ObjectGateway {
    pub fn new(store: JobplaneStore, signer: UrlSigner, clock: SharedClock) -> Self {
        Self {
            store,
            signer,
            clock,
        }
    }

    pub fn store(&self) -> &JobplaneStore {
        &self.store
    }

    pub fn base_url(&self) -> &str {
        self.signer.base_url()
    }

    pub fn presign(
        &self,
        locator: &str,
        operation: Operation,
        ttl: Duration,
    ) -> Result<PresignedUrl, TransferError> {
        let path = parse_locator(locator)?;
        let expires_at = self.clock.now() + ttl;
        let url = self.signer.sign(&path, operation, expires_at);
        tracing::debug!(path = %path, operation = %operation, expires_at = %url.expires_at, "Pre-signed object URL");
        Ok(url)
    }

    #[tracing::instrument(name = "gateway.read", skip(self, url))]
    pub async fn read(&self, url: &str) -> Result<Bytes, TransferError> {
        let path = self.signer.verify(url, Operation::Read, self.clock.now())?;
        self.fetch(&path).await
    }

    #[tracing::instrument(name = "gateway.write", skip(self, url, data), fields(size = data.len()))]
    pub async fn write(&self, url: &str, data: Bytes) -> Result<(), TransferError> {
        let path = self.signer.verify(url, Operation::Write, self.clock.now())?;
        self.store_bytes(&path, data).await
    }

    /// Redeem already-split URL components, as received by the HTTP routes.
    pub async fn read_parts(&self, raw_path: &str, query: &SignedQuery) -> Result<Bytes, TransferError> {
        let path = self
            .signer
            .verify_parts(raw_path, query, Operation::Read, self.clock.now())?;
        self.fetch(&path).await
    }

    pub async fn write_parts(
        &self,
        raw_path: &str,
        query: &SignedQuery,
        data: Bytes,
    ) -> Result<(), TransferError> {
        let path = self
            .signer
            .verify_parts(raw_path, query, Operation::Write, self.clock.now())?;
        self.store_bytes(&path, data).await
    }

    /// Direct write for trusted control-plane callers (seeding inputs).
    pub async fn put_object(&self, locator: &str, data: Bytes) -> Result<(), TransferError> {
        let path = parse_locator(locator)?;
        self.store_bytes(&path, data).await
    }

    /// Direct read for trusted control-plane callers.
    pub async fn get_object(&self, locator: &str) -> Result<Bytes, TransferError> {
        let path = parse_locator(locator)?;
        self.fetch(&path).await
    }

    async fn fetch(&self, path: &Path) -> Result<Bytes, TransferError> {
        let result = self.store.as_generic().get(path).await.map_err(|e| match e {
            object_store::Error::NotFound { .. } => TransferError::NotFound(path.to_string()),
            other => TransferError::Storage(other),
        })?;
        Ok(result.bytes().await?)
    }

    // Writes replace the object in full, so a redelivered task that writes the
    // same output leaves the same object behind.
    async fn store_bytes(&self, path: &Path, data: Bytes) -> Result<(), TransferError> {
        self.store
            .as_generic()
            .put(path, PutPayload::from(data))
            .await?;
        Ok(())
    }
}
