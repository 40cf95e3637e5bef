//! In-process interfaces: the request-solver seam and the pub/sub seam.
//!
//! Components never talk to the transport. When one of them needs a value
//! from elsewhere in the tree (e.g. a resource handle loading filter names),
//! it goes through an [`InternalClient`], which calls the root solver
//! directly and tags the request with a service-user identity so the access
//! gate can recognize in-process traffic.

use async_trait::async_trait;
use ocs_common::{now_ts, Address, RequestType, User, ValueRequest, ValueResponse};
use std::sync::Weak;

/// Implemented by the root request solver; the only way back into the tree
/// from inside it.
#[async_trait]
pub trait InternalRequests: Send + Sync {
    /// Resolve a batch of in-process requests. Responses come back in request
    /// order; a failed sub-task is represented by an error response, never by
    /// a missing slot.
    async fn get_answer_internal(
        &self,
        requests: Vec<ValueRequest>,
        timeout: Option<f64>,
    ) -> Vec<ValueResponse>;
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("pub/sub connection is not open")]
    NotConnected,
    #[error("pub/sub publish failed: {0}")]
    Backend(String),
    #[error("pub/sub publish timed out")]
    Timeout,
}

/// Opaque pub/sub client carried on the tree data record. Publish failures
/// are reported to the caller, which logs and swallows them; they never
/// propagate into the resolver path.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish_json(
        &self,
        subject: &str,
        payload: serde_json::Value,
    ) -> Result<(), PublishError>;

    fn is_connected(&self) -> bool;
}

/// Publisher for trees wired up without a pub/sub connection (tests, tools).
pub struct NoopPublisher;

#[async_trait]
impl Publisher for NoopPublisher {
    async fn publish_json(
        &self,
        _subject: &str,
        _payload: serde_json::Value,
    ) -> Result<(), PublishError> {
        Err(PublishError::NotConnected)
    }

    fn is_connected(&self) -> bool {
        false
    }
}

/// Facade for issuing requests back into the same tree without traversing
/// the external transport.
pub struct InternalClient {
    solver: Weak<dyn InternalRequests>,
    user: User,
}

impl InternalClient {
    pub fn new(solver: Weak<dyn InternalRequests>, user_name: &str) -> Self {
        Self {
            solver,
            user: User::service(user_name),
        }
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    /// Send a request batch. Requests without a user are tagged with this
    /// client's service identity; the batch deadline is the shortest
    /// per-request deadline. Returns `None` when the tree is gone.
    pub async fn send(&self, mut requests: Vec<ValueRequest>) -> Option<Vec<ValueResponse>> {
        let solver = self.solver.upgrade()?;
        let mut shortest: Option<f64> = None;
        for request in &mut requests {
            if request.request_timeout > 0.0
                && shortest.is_none_or(|s| request.request_timeout < s)
            {
                shortest = Some(request.request_timeout);
            }
            if request.user.is_none() {
                request.user = Some(self.user.clone());
            }
        }
        Some(solver.get_answer_internal(requests, shortest).await)
    }

    /// One-shot read of a dotted address with a relative timeout.
    pub async fn get(&self, address: &str, timeout_secs: f64) -> Option<ValueResponse> {
        let address = Address::parse(address).ok()?;
        let now = now_ts();
        let request = ValueRequest::new(address, now)
            .with_type(RequestType::Get)
            .with_timeout(now + timeout_secs);
        self.send(vec![request]).await?.into_iter().next()
    }
}
