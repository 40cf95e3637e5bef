//! HTTP client for the device protocol.
//!
//! Every call carries a random per-process client id and a monotonically
//! increasing transaction id. The response envelope is
//! `{"Value": ..., "ErrorNumber": n, "ErrorMessage": "..."}`; a non-zero
//! `ErrorNumber` is a device-level failure even when the HTTP status is 200.

use rand::Rng;
use serde::Deserialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum AlpacaError {
    #[error("device service returned HTTP 400: {0}")]
    Http400(String),
    #[error("device service returned HTTP 500: {0}")]
    Http500(String),
    #[error("device service returned HTTP {status}: {reason}")]
    HttpStatus { status: u16, reason: String },
    #[error("device service returned a non-JSON body")]
    ContentType,
    #[error("device error {number}: {message}")]
    Device { number: i64, message: String },
    #[error("connection to device service failed: {0}")]
    Connection(String),
    #[error("device service did not answer before the deadline")]
    Timeout,
}

#[derive(Debug, Deserialize)]
struct DeviceResponse {
    #[serde(rename = "Value", default)]
    value: serde_json::Value,
    #[serde(rename = "ErrorNumber", default)]
    error_number: i64,
    #[serde(rename = "ErrorMessage", default)]
    error_message: String,
}

pub struct AlpacaClient {
    client_id: u32,
    transaction_id: AtomicU32,
    /// Long-lived session opened during `run`; calls fall back to a
    /// throwaway client while it is absent.
    session: RwLock<Option<reqwest::Client>>,
}

impl AlpacaClient {
    pub fn new() -> Self {
        let client_id = rand::thread_rng().gen_range(0..=65_535);
        info!(client_id, "device protocol client created");
        Self {
            client_id,
            transaction_id: AtomicU32::new(0),
            session: RwLock::new(None),
        }
    }

    /// Open the permanent HTTP session. Idempotent; failures leave the
    /// client in on-demand mode.
    pub async fn open_session(&self) -> bool {
        let mut session = self.session.write().await;
        if session.is_some() {
            warn!("a session already exists, close it before creating a new one");
            return true;
        }
        match reqwest::Client::builder().build() {
            Ok(client) => {
                *session = Some(client);
                true
            }
            Err(error) => {
                warn!(%error, "can not create a permanent http session");
                false
            }
        }
    }

    pub async fn close_session(&self) {
        let mut session = self.session.write().await;
        if session.take().is_some() {
            info!("http session closed");
        }
    }

    pub async fn is_session_open(&self) -> bool {
        self.session.read().await.is_some()
    }

    async fn client(&self) -> reqwest::Client {
        if let Some(client) = self.session.read().await.clone() {
            return client;
        }
        reqwest::Client::new()
    }

    fn base_params(&self) -> [(String, String); 2] {
        let transaction = self.transaction_id.fetch_add(1, Ordering::Relaxed) + 1;
        [
            ("ClientID".to_owned(), self.client_id.to_string()),
            ("ClientTransactionID".to_owned(), transaction.to_string()),
        ]
    }

    pub async fn get(
        &self,
        url: &str,
        mut params: Vec<(String, String)>,
        budget: Duration,
    ) -> Result<serde_json::Value, AlpacaError> {
        params.extend(self.base_params());
        let response = self
            .client()
            .await
            .get(url)
            .query(&params)
            .timeout(budget)
            .send()
            .await
            .map_err(map_transport_error)?;
        decode(response).await
    }

    pub async fn put(
        &self,
        url: &str,
        mut params: Vec<(String, String)>,
        budget: Duration,
    ) -> Result<serde_json::Value, AlpacaError> {
        params.extend(self.base_params());
        let response = self
            .client()
            .await
            .put(url)
            .form(&params)
            .timeout(budget)
            .send()
            .await
            .map_err(map_transport_error)?;
        decode(response).await
    }
}

impl Default for AlpacaClient {
    fn default() -> Self {
        Self::new()
    }
}

fn map_transport_error(error: reqwest::Error) -> AlpacaError {
    if error.is_timeout() {
        AlpacaError::Timeout
    } else {
        AlpacaError::Connection(error.to_string())
    }
}

async fn decode(response: reqwest::Response) -> Result<serde_json::Value, AlpacaError> {
    let status = response.status();
    let reason = status.canonical_reason().unwrap_or("").to_owned();
    match status.as_u16() {
        400 => return Err(AlpacaError::Http400(reason)),
        500 => return Err(AlpacaError::Http500(reason)),
        code if !status.is_success() => {
            return Err(AlpacaError::HttpStatus {
                status: code,
                reason,
            });
        }
        _ => {}
    }
    let envelope: DeviceResponse = response.json().await.map_err(|error| {
        if error.is_decode() {
            AlpacaError::ContentType
        } else {
            AlpacaError::Connection(error.to_string())
        }
    })?;
    if envelope.error_number != 0 {
        return Err(AlpacaError::Device {
            number: envelope.error_number,
            message: envelope.error_message,
        });
    }
    Ok(envelope.value)
}
