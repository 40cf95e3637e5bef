//! Pub/sub messenger.
//!
//! One connection per tree, opened during `run_tree` and closed during
//! `stop_tree`, carried on the shared tree data record as an opaque
//! [`Publisher`]. Messages are JSON `{data, meta}` envelopes on configurable
//! subjects.

use async_trait::async_trait;
use ocs_tree::internal::{PublishError, Publisher};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum MessengerError {
    #[error("can not connect to the pub/sub server: {0}")]
    Connect(String),
    #[error("pub/sub connection attempt timed out")]
    ConnectTimeout,
}

#[derive(Default)]
pub struct Messenger {
    client: RwLock<Option<async_nats::Client>>,
}

impl Messenger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn open(&self, host: &str, port: u16, wait: Duration) -> Result<(), MessengerError> {
        let url = format!("nats://{host}:{port}");
        let connect = tokio::time::timeout(wait, async_nats::connect(url.clone()))
            .await
            .map_err(|_| MessengerError::ConnectTimeout)?;
        let client = connect.map_err(|error| MessengerError::Connect(error.to_string()))?;
        info!(%url, "pub/sub connection open");
        *self.client.write().await = Some(client);
        Ok(())
    }

    pub async fn close(&self) {
        if let Some(client) = self.client.write().await.take() {
            let _ = client.flush().await;
            info!("pub/sub connection closed");
        }
    }
}

#[async_trait]
impl Publisher for Messenger {
    async fn publish_json(
        &self,
        subject: &str,
        payload: serde_json::Value,
    ) -> Result<(), PublishError> {
        let client = self
            .client
            .read()
            .await
            .clone()
            .ok_or(PublishError::NotConnected)?;
        let bytes = serde_json::to_vec(&payload)
            .map_err(|error| PublishError::Backend(error.to_string()))?;
        client
            .publish(subject.to_owned(), bytes.into())
            .await
            .map_err(|error| PublishError::Backend(error.to_string()))?;
        client
            .flush()
            .await
            .map_err(|error| PublishError::Backend(error.to_string()))
    }

    fn is_connected(&self) -> bool {
        // Connection state is tracked by presence; the client reconnects on
        // its own once it exists.
        self.client.try_read().map(|c| c.is_some()).unwrap_or(false)
    }
}

/// Fill the telescope id into a `{}`-templated subject name.
pub fn format_stream(template: &str, telescope_id: &str) -> String {
    template.replacen("{}", telescope_id, 1)
}
