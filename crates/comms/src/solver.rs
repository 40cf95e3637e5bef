//! Request solver: the root of the tree.
//!
//! Owns the component graph, fans request batches into independent tasks,
//! and runs the tree lifecycle (pub/sub connection, component `run`/`stop`,
//! configuration snapshot publish).

use crate::nats::Messenger;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{Datelike, Timelike, Utc};
use ocs_common::{
    Address, ResponseError, Settings, Severity, ValueRequest, ValueResponse,
};
use ocs_tree::component::{DynComponent, TreeData};
use ocs_tree::internal::InternalRequests;
use ocs_tree::Publisher;
use ocs_tree::TreeAlpacaObservatory;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{error, info, warn};

pub struct RequestSolver {
    data_provider: DynComponent,
    messenger: Arc<Messenger>,
    settings: Arc<Settings>,
}

impl RequestSolver {
    /// Build the solver around a fully constructed tree and run post-init:
    /// the shared tree data record (with a weak back-reference to this
    /// solver) is distributed top-down and every node's path is fixed.
    pub fn new(data_provider: DynComponent, settings: Arc<Settings>) -> Arc<Self> {
        let messenger = Arc::new(Messenger::new());
        Arc::new_cyclic(|weak: &Weak<RequestSolver>| {
            let target_requests: Weak<dyn InternalRequests> = weak.clone();
            let tree_data = TreeData {
                target_requests,
                messenger: messenger.clone(),
            };
            data_provider.post_init(&tree_data, "");
            Self {
                data_provider,
                messenger,
                settings,
            }
        })
    }

    /// Resolve a batch of serialized requests, one independent task per
    /// payload. Every slot gets an answer: undecodable payloads and panicked
    /// sub-tasks are padded with a critical error response.
    pub async fn get_answer(
        self: Arc<Self>,
        requests: Vec<Bytes>,
        socket_id: Bytes,
        timeout: Option<f64>,
    ) -> Vec<Bytes> {
        let count = requests.len();
        // JoinSet so that cancelling the router task aborts every sub-task
        // with it.
        let mut tasks = tokio::task::JoinSet::new();
        for (slot, raw) in requests.into_iter().enumerate() {
            let solver = Arc::clone(&self);
            let socket_id = socket_id.clone();
            tasks.spawn(async move {
                (slot, solver.get_single_answer(raw, socket_id, timeout).await)
            });
        }
        let mut responses: Vec<Option<Bytes>> = vec![None; count];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((slot, bytes)) => {
                    if let Some(entry) = responses.get_mut(slot) {
                        *entry = Some(bytes);
                    }
                }
                Err(join_error) => {
                    error!(%join_error, "a request sub-task failed unexpectedly");
                }
            }
        }
        // Clients always see one response slot per request.
        responses
            .into_iter()
            .map(|slot| slot.unwrap_or_else(|| encode_or_empty(&placeholder_response())))
            .collect()
    }

    pub async fn get_single_answer(
        &self,
        raw: Bytes,
        socket_id: Bytes,
        timeout: Option<f64>,
    ) -> Bytes {
        let mut request = match ValueRequest::from_bytes(&raw) {
            Ok(request) => request,
            Err(error) => {
                info!(%error, "can not build a request from the ordered data");
                let response = ValueResponse::fail(
                    Address::default(),
                    ResponseError::new(
                        4001,
                        "can not build a request from the ordered data",
                        "request_solver",
                        Severity::Critical,
                    ),
                );
                return encode_or_empty(&response);
            }
        };
        if let Some(user) = &mut request.user {
            user.set_socket_id(socket_id.to_vec());
        }
        // The envelope deadline is authoritative over whatever the payload
        // claims.
        if let Some(timeout) = timeout {
            if request.request_timeout != timeout {
                request.request_timeout = timeout;
            }
        }
        let response = self.data_provider.get_response(request).await;
        encode_or_empty(&response)
    }

    /// Open the pub/sub connection, start the tree and publish the device
    /// configuration snapshot.
    pub async fn run_tree(&self) {
        let nats = self.settings.nats();
        if let Err(error) = self
            .messenger
            .open(&nats.host, nats.port, Duration::from_secs(10))
            .await
        {
            // The resolver path works without pub/sub; only the snapshot and
            // status streams go dark.
            error!(%error, host = %nats.host, port = nats.port, "can not open the pub/sub connection");
        }
        self.data_provider.run().await;
        self.publish_device_configuration().await;
    }

    /// Stop the tree, then the pub/sub connection, no matter which side
    /// failed first.
    pub async fn stop_tree(&self) {
        self.data_provider.stop().await;
        self.messenger.close().await;
    }

    pub fn tree_configuration(&self) -> serde_json::Value {
        self.data_provider.configuration()
    }

    async fn publish_device_configuration(&self) {
        let nats = self.settings.nats();
        let configuration = self.tree_configuration();
        let mut telescopes = serde_json::Map::new();
        collect_adapter_configs(&configuration, &mut telescopes);
        let site = self
            .settings
            .subtree_json(&["site"])
            .unwrap_or_else(|| serde_json::json!({}));

        let payload = serde_json::json!({
            "data": {
                "version": "",
                "published": utc_now_array(),
                "config": {"telescopes": telescopes, "site": site},
            },
            "meta": {
                "message_type": "config",
                "tags": ["config_alpaca"],
                "sender": "observatory control server",
            },
        });
        if let Err(error) = self
            .messenger
            .publish_json(&nats.alpaca_config_stream, payload)
            .await
        {
            error!(%error, subject = %nats.alpaca_config_stream, "can not publish the device configuration");
        }
    }
}

#[async_trait]
impl InternalRequests for RequestSolver {
    async fn get_answer_internal(
        &self,
        requests: Vec<ValueRequest>,
        timeout: Option<f64>,
    ) -> Vec<ValueResponse> {
        let resolutions = requests.into_iter().map(|mut request| {
            if let Some(user) = request.user.take() {
                if !user.is_service() {
                    warn!(
                        user = user.name(),
                        "internal request carried a client identity, re-tagging as a service user"
                    );
                    request.user = Some(user.into_service());
                } else {
                    request.user = Some(user);
                }
            }
            if let Some(timeout) = timeout {
                if request.request_timeout != timeout {
                    request.request_timeout = timeout;
                }
            }
            self.data_provider.get_response(request)
        });
        futures::future::join_all(resolutions).await
    }
}

fn placeholder_response() -> ValueResponse {
    ValueResponse::fail(
        Address::default(),
        ResponseError::new(
            4001,
            "there were unexpected problems trying to respond to the request",
            "request_solver",
            Severity::Critical,
        ),
    )
}

fn encode_or_empty(response: &ValueResponse) -> Bytes {
    match response.to_bytes() {
        Ok(bytes) => Bytes::from(bytes),
        Err(error) => {
            error!(%error, "can not serialize a response");
            Bytes::new()
        }
    }
}

/// Walk the configuration tree collecting every hardware adapter's
/// observatory block, keyed by its configured name.
fn collect_adapter_configs(
    node: &serde_json::Value,
    out: &mut serde_json::Map<String, serde_json::Value>,
) {
    let Some(map) = node.as_object() else {
        return;
    };
    for (name, entry) in map {
        let entry_type = entry.get("type").and_then(serde_json::Value::as_str);
        if entry_type == Some(TreeAlpacaObservatory::TYPE_NAME) {
            let config = entry.get("config");
            let key = config
                .and_then(|c| c.get("observatory_config_name"))
                .and_then(serde_json::Value::as_str)
                .unwrap_or(name);
            let observatory = config
                .and_then(|c| c.get("observatory_config"))
                .cloned()
                .unwrap_or(serde_json::Value::Null);
            out.insert(key.to_owned(), observatory);
        } else if let Some(children) = entry.get("child") {
            collect_adapter_configs(children, out);
        }
    }
}

fn utc_now_array() -> serde_json::Value {
    let now = Utc::now();
    serde_json::json!([
        now.year(),
        now.month(),
        now.day(),
        now.hour(),
        now.minute(),
        now.second(),
        now.timestamp_subsec_micros(),
    ])
}
