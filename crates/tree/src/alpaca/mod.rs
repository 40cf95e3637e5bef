//! Terminal hardware-adapter component.
//!
//! Translates the residual address path (`device... attribute`) into an HTTP
//! call against the external device service, enforces a per-request budget
//! derived from the request deadline, and maps protocol failures into the
//! shared error taxonomy.

pub mod client;
pub mod coords;
pub mod devices;

use crate::component::{
    error_response, ok_response, NodeCore, ProvidesResponse, TreeData,
};
use crate::resources::{ResourceManager, ResourceSeed};
use async_trait::async_trait;
use client::{AlpacaClient, AlpacaError};
use devices::{DeviceConfigError, DeviceNode, Direction};
use ocs_common::{
    now_ts, RequestType, Settings, Severity, TreeError, Value, ValueRequest, ValueResponse,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct TreeAlpacaObservatory {
    node: NodeCore,
    observatory_name: String,
    root: DeviceNode,
    /// Raw `observatory` config block, republished in the configuration
    /// snapshot.
    raw_config: serde_json::Value,
    client: AlpacaClient,
    /// Fraction of the remaining request budget granted to the HTTP call,
    /// so the adapter always times out before the router's envelope timer.
    timeout_multiplier: f64,
    resource_manager: tokio::sync::Mutex<Option<Arc<ResourceManager>>>,
}

impl TreeAlpacaObservatory {
    pub const TYPE_NAME: &'static str = "TreeAlpacaObservatory";
    const DEFAULT_TIMEOUT_MULTIPLIER: f64 = 0.8;

    pub fn new(
        component_name: &str,
        observatory_name: Option<&str>,
        settings: &Settings,
    ) -> Result<Self, DeviceConfigError> {
        let observatory_name = observatory_name.unwrap_or(component_name).to_owned();
        let raw_config = settings
            .subtree_json(&["tree", component_name, "observatory"])
            .unwrap_or(serde_json::Value::Null);
        let root = DeviceNode::observatory_root(&raw_config)?;
        if let Some(protocol) = root.protocol() {
            if protocol != "alpaca" {
                warn!(component = component_name, protocol, "unknown device protocol, using alpaca");
            }
        }

        let mut timeout_multiplier = settings.component_or(
            component_name,
            Self::TYPE_NAME,
            "timeout_multiplier",
            Self::DEFAULT_TIMEOUT_MULTIPLIER,
        );
        if !(0.0 < timeout_multiplier && timeout_multiplier < 1.0) {
            warn!(
                component = component_name,
                timeout_multiplier,
                default = Self::DEFAULT_TIMEOUT_MULTIPLIER,
                "timeout_multiplier must lie in (0, 1), using the default"
            );
            timeout_multiplier = Self::DEFAULT_TIMEOUT_MULTIPLIER;
        }

        Ok(Self {
            node: NodeCore::new(component_name),
            observatory_name,
            root,
            raw_config,
            client: AlpacaClient::new(),
            timeout_multiplier,
            resource_manager: tokio::sync::Mutex::new(None),
        })
    }

    pub fn observatory_name(&self) -> &str {
        &self.observatory_name
    }

    fn resolve(&self, request: &ValueRequest) -> Result<(&DeviceNode, String), TreeError> {
        let residual = request.address.residual_segments();
        let Some((attribute, device_path)) = residual.split_last() else {
            debug!(
                component = self.node.name(),
                address = %request.address,
                "incoming address is too short"
            );
            return Err(TreeError::address_msg(1001, "incoming address is too short"));
        };
        if device_path.is_empty() {
            return Err(TreeError::address_msg(
                1002,
                "the device driver does not have such a method",
            ));
        }
        let node = self.root.descend(device_path).ok_or_else(|| {
            TreeError::address_msg(1002, "the device driver does not have such a method")
        })?;
        Ok((node, attribute.clone()))
    }

    async fn call(&self, request: &ValueRequest) -> Result<Value, TreeError> {
        let (node, attribute) = self.resolve(request)?;
        let direction = match request.request_type {
            RequestType::Get => Direction::Get,
            RequestType::Put => Direction::Put,
        };
        let plan = devices::plan_call(node, &attribute, direction, &request.request_data)?;

        let remaining = request.request_timeout - now_ts();
        if !remaining.is_finite() || remaining <= 0.0 {
            return Err(self.unresponsive(request));
        }
        let budget = Duration::from_secs_f64(remaining * self.timeout_multiplier);

        let base = node.base_url().ok_or_else(|| {
            TreeError::value_msg(2002, "no device service address is configured for this device")
        })?;
        let url = format!("{base}/{}/{}/{}", plan.kind, node.device_number, plan.attribute);

        let params = plan.params.clone();
        let raw = match plan.method {
            Direction::Get => self.client.get(&url, params, budget).await,
            Direction::Put => self.client.put(&url, params, budget).await,
        };
        let raw = raw.map_err(|error| self.map_client_error(request, error))?;
        let payload = plan.finish(raw)?;
        Ok(Value::new(payload, now_ts()))
    }

    fn unresponsive(&self, request: &ValueRequest) -> TreeError {
        TreeError::other_with_severity(
            4005,
            format!("device service is not responding at {}", request.address),
            Severity::Temporary,
        )
    }

    fn map_client_error(&self, request: &ValueRequest, error: AlpacaError) -> TreeError {
        match error {
            AlpacaError::Http400(_)
            | AlpacaError::Http500(_)
            | AlpacaError::HttpStatus { .. }
            | AlpacaError::ContentType
            | AlpacaError::Device { .. } => {
                warn!(address = %request.address, %error, "device service rejected the request");
                TreeError::value_msg(2002, error.to_string())
            }
            AlpacaError::Connection(_) | AlpacaError::Timeout => {
                warn!(address = %request.address, %error, "device service is not responding");
                self.unresponsive(request)
            }
        }
    }

    fn resource_seeds(&self) -> Vec<ResourceSeed> {
        self.root
            .children
            .iter()
            .map(|(name, node)| {
                let mut properties = node.options.clone();
                properties.insert(
                    "observatory_name".to_owned(),
                    serde_json::Value::String(self.observatory_name.clone()),
                );
                ResourceSeed {
                    id_name: format!("{name}_RESOURCE"),
                    source_name: name.clone(),
                    kind: node.kind.clone(),
                    nr: node.device_number,
                    properties,
                }
            })
            .collect()
    }

    /// Typed device handles for the plan runner, built lazily on first use.
    pub async fn resource_manager(&self) -> Option<Arc<ResourceManager>> {
        let mut slot = self.resource_manager.lock().await;
        if slot.is_none() {
            let tree_data = self.node.tree_data()?;
            let manager = ResourceManager::initiate(
                tree_data.target_requests.clone(),
                self.node.tree_path(),
                &self.observatory_name,
                self.resource_seeds(),
            )
            .await;
            *slot = Some(Arc::new(manager));
        }
        slot.clone()
    }
}

#[async_trait]
impl ProvidesResponse for TreeAlpacaObservatory {
    async fn get_response(&self, request: ValueRequest) -> ValueResponse {
        match self.call(&request).await {
            Ok(value) => ok_response(request.address, Some(value)),
            Err(error) => error_response(self.node.name(), request.address, error),
        }
    }

    fn component_name(&self) -> &str {
        self.node.name()
    }

    fn post_init(&self, tree_data: &TreeData, parent_path: &str) {
        self.node.init(tree_data, parent_path.to_owned());
    }

    async fn run(&self) {
        if self.client.open_session().await {
            info!(component = self.node.name(), "permanent http session created");
        } else {
            warn!(
                component = self.node.name(),
                "no permanent http session, falling back to on-demand sessions"
            );
        }
    }

    async fn stop(&self) {
        self.client.close_session().await;
    }

    fn configuration(&self) -> serde_json::Value {
        serde_json::json!({
            self.node.name(): {
                "type": Self::TYPE_NAME,
                "child": {},
                "config": {
                    "observatory_config": self.raw_config,
                    "observatory_config_name": self.observatory_name,
                },
            }
        })
    }

    fn resources(&self) -> Vec<(String, Vec<String>)> {
        // Only the first device level is advertised; duplicates pointing at
        // the same hardware are not checked.
        self.root
            .children
            .iter()
            .map(|(name, _)| (format!("{name}_RESOURCE"), vec![name.clone()]))
            .collect()
    }
}

pub use devices::kinds;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, RawForm};
    use axum::routing::{get, put};
    use ocs_common::Address;
    use serde_json::json;
    use std::net::SocketAddr;
    use std::sync::Arc as StdArc;
    use std::sync::Mutex as StdMutex;
    use std::time::Instant;

    #[derive(Default)]
    struct Seen {
        puts: Vec<(String, String)>,
    }

    async fn spawn_device_stub(seen: StdArc<StdMutex<Seen>>) -> SocketAddr {
        let app = axum::Router::new()
            .route(
                "/api/v1/telescope/0/rightascension",
                get(|| async {
                    axum::Json(json!({"Value": 12.5, "ErrorNumber": 0, "ErrorMessage": ""}))
                }),
            )
            .route(
                "/api/v1/telescope/0/parked",
                get(|| async {
                    axum::Json(json!({"Value": null, "ErrorNumber": 1031, "ErrorMessage": "not parked"}))
                }),
            )
            .route(
                "/api/v1/telescope/0/{attribute}",
                put(move |Path(attribute): Path<String>, RawForm(body): RawForm| {
                    let seen = seen.clone();
                    async move {
                        if let Ok(mut guard) = seen.lock() {
                            guard
                                .puts
                                .push((attribute, String::from_utf8_lossy(&body).into_owned()));
                        }
                        axum::Json(json!({"Value": null, "ErrorNumber": 0, "ErrorMessage": ""}))
                    }
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        addr
    }

    fn adapter_for(base: &str) -> TreeAlpacaObservatory {
        let settings = Settings::from_yaml_str(&format!(
            r#"
tree:
  zb08_adapter:
    timeout_multiplier: 1.8
    observatory:
      address: "{base}"
      protocol: alpaca
      components:
        telescope:
          kind: telescope
          device_number: 0
"#
        ))
        .unwrap();
        TreeAlpacaObservatory::new("zb08_adapter", Some("zb08"), &settings).unwrap()
    }

    fn request(path: &str, timeout_in: f64) -> ValueRequest {
        ValueRequest::new(Address::parse(path).unwrap(), now_ts())
            .with_timeout(now_ts() + timeout_in)
    }

    #[tokio::test]
    async fn reads_decode_the_protocol_envelope_and_postprocess() {
        let seen = StdArc::new(StdMutex::new(Seen::default()));
        let addr = spawn_device_stub(seen).await;
        let adapter = adapter_for(&format!("http://{addr}/api/v1"));
        // timeout_multiplier 1.8 is outside (0, 1) and must fall back.
        assert_eq!(adapter.timeout_multiplier, 0.8);

        let response = adapter
            .get_response(request("telescope.rightascension", 5.0))
            .await;
        assert!(response.status, "{:?}", response.error);
        // Hour angle 12.5 from the wire becomes 187.5 degrees.
        assert_eq!(response.value.unwrap().v, json!(187.5));
    }

    #[tokio::test]
    async fn writes_send_form_parameters() {
        let seen = StdArc::new(StdMutex::new(Seen::default()));
        let addr = spawn_device_stub(seen.clone()).await;
        let adapter = adapter_for(&format!("http://{addr}/api/v1"));

        let req = request("telescope.slewtocoordinates", 5.0)
            .with_type(RequestType::Put)
            .with_data("RightAscension", json!("12:00:00"))
            .with_data("Declination", json!(-30.0));
        let response = adapter.get_response(req).await;
        assert!(response.status, "{:?}", response.error);

        let guard = seen.lock().unwrap();
        let (attribute, body) = &guard.puts[0];
        assert_eq!(attribute, "slewtocoordinates");
        assert!(body.contains("RightAscension=12"), "{body}");
        assert!(body.contains("ClientTransactionID="), "{body}");
    }

    #[tokio::test]
    async fn device_errors_map_to_2002() {
        let seen = StdArc::new(StdMutex::new(Seen::default()));
        let addr = spawn_device_stub(seen).await;
        let adapter = adapter_for(&format!("http://{addr}/api/v1"));

        let response = adapter.get_response(request("telescope.parked", 5.0)).await;
        let error = response.error.unwrap();
        assert_eq!(error.code, 2002);
        assert!(error.message.contains("1031"), "{}", error.message);
    }

    #[tokio::test]
    async fn unknown_devices_and_short_addresses_are_address_errors() {
        let adapter = adapter_for("http://127.0.0.1:1/api/v1");

        let response = adapter.get_response(request("spectrograph.temp", 5.0)).await;
        assert_eq!(response.error.unwrap().code, 1002);

        let response = adapter.get_response(request("onlyattr", 5.0)).await;
        assert_eq!(response.error.unwrap().code, 1002);
    }

    #[tokio::test]
    async fn unreachable_service_is_4005_before_the_deadline() {
        // Nothing listens on port 1.
        let adapter = adapter_for("http://127.0.0.1:1/api/v1");
        let started = Instant::now();
        let response = adapter.get_response(request("telescope.rightascension", 1.0)).await;
        let error = response.error.unwrap();
        assert_eq!(error.code, 4005);
        assert_eq!(error.severity, Severity::Temporary);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
