use std::sync::Arc;

use jobplane_types::{ErrorKind, TaskStatus, chrono::Duration};

use super::queue::{ClaimedTask, DeliveryReceipt, JobQueue, NackOutcome, QueueError};
use crate::credentials::{AccessToken, Scope};
use crate::identity::{Identity, IdentityVerifier};

/// Queue facade for the dispatcher. Every call presents an access token that
/// is verified and checked for the operation's scope before it reaches the
/// queue.
#[derive(Clone)]
pub struct AuthorizedQueue {
    queue: Arc<dyn JobQueue>,
    verifier: Arc<IdentityVerifier>,
}

impl AuthorizedQueue {
    pub fn new(queue: Arc<dyn JobQueue>, verifier: Arc<IdentityVerifier>) -> Self {
        Self { queue, verifier }
    }

    pub fn inner(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    async fn authorize(&self, token: &AccessToken, scope: Scope) -> Result<Identity, QueueError> {
        let identity = self.verifier.verify_token(token).await?;
        identity.require(scope)?;
        Ok(identity)
    }

    pub async fn claim(
        &self,
        token: &AccessToken,
        visibility_timeout: Duration,
    ) -> Result<Option<ClaimedTask>, QueueError> {
        self.authorize(token, Scope::QueueClaim).await?;
        self.queue.claim(visibility_timeout).await
    }

    pub async fn ack(&self, token: &AccessToken, receipt: &DeliveryReceipt) -> Result<(), QueueError> {
        self.authorize(token, Scope::QueueAck).await?;
        self.queue.ack(receipt).await
    }

    pub async fn extend(
        &self,
        token: &AccessToken,
        receipt: &DeliveryReceipt,
        by: Duration,
    ) -> Result<DeliveryReceipt, QueueError> {
        self.authorize(token, Scope::QueueExtend).await?;
        self.queue.extend(receipt, by).await
    }

    pub async fn nack(
        &self,
        token: &AccessToken,
        receipt: &DeliveryReceipt,
        kind: ErrorKind,
        message: &str,
    ) -> Result<NackOutcome, QueueError> {
        self.authorize(token, Scope::QueueNack).await?;
        self.queue.nack(receipt, kind, message).await
    }

    /// Status progress of a leased task is part of holding the claim.
    pub async fn mark(
        &self,
        token: &AccessToken,
        receipt: &DeliveryReceipt,
        status: TaskStatus,
    ) -> Result<(), QueueError> {
        self.authorize(token, Scope::QueueClaim).await?;
        self.queue.mark(receipt, status).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerting::MemoryAlertSink;
    use crate::config::{CredentialConfig, IdentityConfig, QueueConfig};
    use crate::credentials::{CredentialVendor, DISPATCHER_SCOPES, Role, SigningKey, Subject, USER_SCOPES};
    use crate::execution::queue::InMemoryQueue;
    use jobplane_types::{ManualClock, NewTask};

    fn setup() -> (ManualClock, Arc<CredentialVendor>, AuthorizedQueue) {
        let clock = ManualClock::starting_now();
        let vendor = Arc::new(CredentialVendor::new(
            SigningKey::generate("k1").unwrap(),
            CredentialConfig::default(),
            clock.shared(),
        ));
        let verifier = Arc::new(IdentityVerifier::new(
            vendor.clone(),
            IdentityConfig::default(),
            clock.shared(),
        ));
        let queue = Arc::new(InMemoryQueue::new(
            QueueConfig::default(),
            clock.shared(),
            Arc::new(MemoryAlertSink::default()),
        ));
        (clock, vendor, AuthorizedQueue::new(queue, verifier))
    }

    async fn seed(queue: &AuthorizedQueue) {
        queue
            .inner()
            .enqueue(NewTask {
                pipeline_ref: "builtin/echo".into(),
                parameters: serde_json::Value::Null,
                input_locator: "in".into(),
                output_locator: "out".into(),
                priority: 0,
                owner: "alice".into(),
                dedup_key: None,
                expected_duration_secs: None,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn dispatcher_token_may_claim() {
        let (_, vendor, queue) = setup();
        seed(&queue).await;
        let token = vendor
            .issue(&Subject::new("dispatcher", Role::Dispatcher), DISPATCHER_SCOPES)
            .unwrap();

        let claimed = queue.claim(&token, Duration::seconds(30)).await.unwrap().unwrap();
        queue.ack(&token, &claimed.receipt).await.unwrap();
    }

    #[tokio::test]
    async fn user_token_cannot_claim() {
        let (_, vendor, queue) = setup();
        seed(&queue).await;
        let token = vendor.issue(&Subject::new("alice", Role::User), USER_SCOPES).unwrap();

        let err = queue.claim(&token, Duration::seconds(30)).await.unwrap_err();
        assert!(matches!(err, QueueError::Capability(_)));
        assert_eq!(err.kind(), ErrorKind::AuthDenied);
    }

    #[tokio::test]
    async fn expired_token_is_refused_before_the_queue() {
        let (clock, vendor, queue) = setup();
        seed(&queue).await;
        let token = vendor
            .issue(&Subject::new("dispatcher", Role::Dispatcher), &[Scope::QueueClaim])
            .unwrap();

        clock.advance(Duration::minutes(10));
        assert!(matches!(
            queue.claim(&token, Duration::seconds(30)).await,
            Err(QueueError::Auth(_))
        ));
        assert_eq!(queue.inner().stats().await.unwrap().ready, 1);
    }
}
