//! Typed device handles for the observation-plan machinery.
//!
//! The adapter enumerates its device sub-tree into handles; each handle
//! carries the device's options and an asynchronous exclusive lock the plan
//! runner takes while it owns the device. The filter-wheel handle lazily
//! loads its filter-name -> position map, either from configuration or by
//! querying the device through the internal client; that initialization is
//! idempotent and retried on demand when it failed.

use crate::alpaca::kinds;
use crate::internal::{InternalClient, InternalRequests};
use serde_json::{Map, Value as Json};
use std::collections::HashMap;
use std::sync::Weak;
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tracing::{info, warn};

/// Flat description of one device as enumerated by the adapter.
#[derive(Debug, Clone)]
pub struct ResourceSeed {
    pub id_name: String,
    pub source_name: String,
    pub kind: String,
    pub nr: u32,
    pub properties: Map<String, Json>,
}

/// Kind-specific data attached to a handle.
#[derive(Debug)]
pub enum ResourceDetail {
    Mount {
        latitude: f64,
        longitude: f64,
        elevation: f64,
        epoch: String,
        min_alt: f64,
    },
    Focuser {
        focus_tolerance: f64,
    },
    FilterWheel(RwLock<FilterState>),
    Generic,
}

#[derive(Debug, Default)]
pub struct FilterState {
    pub filters: HashMap<String, i64>,
    /// Whether the last load attempt succeeded; a failed load is retried on
    /// the next [`ResourceHandle::filters`] call.
    pub loaded: bool,
}

pub struct ResourceHandle {
    kind: String,
    source_name: String,
    id_name: String,
    nr: u32,
    telescope_id: String,
    address: String,
    properties: Map<String, Json>,
    lock: Mutex<()>,
    detail: ResourceDetail,
}

impl ResourceHandle {
    fn new(seed: ResourceSeed, address_path: &str) -> Self {
        let address = if address_path.is_empty() {
            seed.source_name.clone()
        } else {
            format!("{address_path}.{}", seed.source_name)
        };
        let telescope_id = seed
            .properties
            .get("observatory_name")
            .and_then(Json::as_str)
            .unwrap_or("ID_UNDEFINED")
            .to_owned();
        let detail = match seed.kind.as_str() {
            kinds::MOUNT => ResourceDetail::Mount {
                latitude: prop_f64(&seed.properties, "lat", 0.0),
                longitude: prop_f64(&seed.properties, "lon", 0.0),
                elevation: prop_f64(&seed.properties, "elev", 0.0),
                epoch: seed
                    .properties
                    .get("epoch")
                    .and_then(Json::as_str)
                    .unwrap_or("2000")
                    .to_owned(),
                min_alt: prop_f64(&seed.properties, "min_alt", 10.0),
            },
            kinds::FOCUSER => ResourceDetail::Focuser {
                focus_tolerance: prop_f64(&seed.properties, "focus_tolerance", 5.0),
            },
            kinds::FILTERWHEEL => ResourceDetail::FilterWheel(RwLock::new(FilterState::default())),
            _ => ResourceDetail::Generic,
        };
        Self {
            kind: seed.kind,
            source_name: seed.source_name,
            id_name: seed.id_name,
            nr: seed.nr,
            telescope_id,
            address,
            properties: seed.properties,
            lock: Mutex::new(()),
            detail,
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn nr(&self) -> u32 {
        self.nr
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    /// Unique handle name.
    pub fn id_name(&self) -> &str {
        &self.id_name
    }

    pub fn telescope_id(&self) -> &str {
        &self.telescope_id
    }

    /// Full dotted tree address of the device.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn properties(&self) -> &Map<String, Json> {
        &self.properties
    }

    pub fn detail(&self) -> &ResourceDetail {
        &self.detail
    }

    /// Exclusive ownership of the device for the duration of the guard.
    pub async fn exclusive(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().await
    }

    /// Load kind-specific state. Idempotent; only the filter wheel has work
    /// to do.
    pub async fn a_init(&self, api: &InternalClient) {
        if let ResourceDetail::FilterWheel(state) = &self.detail {
            let mut state = state.write().await;
            self.load_filters(&mut state, api).await;
        }
    }

    async fn load_filters(&self, state: &mut FilterState, api: &InternalClient) {
        state.loaded = true;
        match self.properties.get("filters") {
            Some(Json::Object(map)) => {
                warn!(
                    device = %self.source_name,
                    "filters configured as a name->position mapping; this form is obsolete, use a list of entries"
                );
                state.filters = map
                    .iter()
                    .filter_map(|(name, pos)| pos.as_i64().map(|p| (name.clone(), p)))
                    .collect();
                return;
            }
            Some(Json::Array(entries)) => {
                state.filters = entries
                    .iter()
                    .filter_map(|entry| {
                        let name = entry.get("name")?.as_str()?;
                        let position = entry.get("position")?.as_i64()?;
                        Some((name.to_owned(), position))
                    })
                    .collect();
                info!(device = %self.source_name, filters = ?state.filters, "filters loaded from configuration");
                return;
            }
            _ => {}
        }

        // Not configured: ask the device for its filter names.
        let response = api.get(&format!("{}.names", self.address), 10.0).await;
        match response {
            Some(response) if response.status => {
                let names = response
                    .value
                    .as_ref()
                    .and_then(|value| value.v.as_array().cloned());
                match names {
                    Some(names) => {
                        state.filters = names
                            .iter()
                            .enumerate()
                            .filter_map(|(position, name)| {
                                Some((name.as_str()?.to_owned(), position as i64))
                            })
                            .collect();
                    }
                    None => {
                        warn!(device = %self.source_name, "device returned no usable filter list");
                        state.loaded = false;
                    }
                }
            }
            _ => {
                warn!(device = %self.source_name, "can not get the filter list while initializing the handle");
                state.loaded = false;
            }
        }
    }

    /// Filter-name -> position map; retries a failed load before answering.
    pub async fn filters(&self, api: &InternalClient) -> HashMap<String, i64> {
        let ResourceDetail::FilterWheel(state) = &self.detail else {
            return HashMap::new();
        };
        if !state.read().await.loaded {
            info!(device = %self.source_name, "retrying filter-wheel initialization");
            self.a_init(api).await;
        }
        state.read().await.filters.clone()
    }
}

fn prop_f64(properties: &Map<String, Json>, key: &str, default: f64) -> f64 {
    properties.get(key).and_then(Json::as_f64).unwrap_or(default)
}

/// Enumerates the adapter's device sub-tree and hands out typed handles.
pub struct ResourceManager {
    observatory_name: String,
    api: InternalClient,
    resources: Vec<std::sync::Arc<ResourceHandle>>,
}

impl ResourceManager {
    pub async fn initiate(
        target: Weak<dyn InternalRequests>,
        address_path: &str,
        observatory_name: &str,
        seeds: Vec<ResourceSeed>,
    ) -> Self {
        let api = InternalClient::new(target, "resource_manager_init_client");
        let resources: Vec<_> = seeds
            .into_iter()
            .map(|seed| std::sync::Arc::new(ResourceHandle::new(seed, address_path)))
            .collect();
        for resource in &resources {
            resource.a_init(&api).await;
        }
        Self {
            observatory_name: observatory_name.to_owned(),
            api,
            resources,
        }
    }

    pub fn observatory_name(&self) -> &str {
        &self.observatory_name
    }

    pub fn api(&self) -> &InternalClient {
        &self.api
    }

    /// Handle lookup by device kind and number; kinds may repeat per
    /// telescope (two filter wheels), numbers disambiguate.
    pub fn get_resource(&self, kind: &str, nr: u32) -> Option<std::sync::Arc<ResourceHandle>> {
        self.resources
            .iter()
            .find(|r| r.kind() == kind && r.nr() == nr)
            .cloned()
    }

    pub fn get_resource_by_source_name(
        &self,
        source_name: &str,
        kind: Option<&str>,
    ) -> Option<std::sync::Arc<ResourceHandle>> {
        self.resources
            .iter()
            .find(|r| r.source_name() == source_name && kind.is_none_or(|k| r.kind() == k))
            .cloned()
    }

    pub fn resources(&self) -> &[std::sync::Arc<ResourceHandle>] {
        &self.resources
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn seed(kind: &str, source: &str, properties: Json) -> ResourceSeed {
        ResourceSeed {
            id_name: format!("{source}_RESOURCE"),
            source_name: source.to_owned(),
            kind: kind.to_owned(),
            nr: 0,
            properties: properties.as_object().cloned().unwrap_or_default(),
        }
    }

    #[tokio::test]
    async fn mount_handles_expose_site_options() {
        let seeds = vec![seed(
            kinds::MOUNT,
            "telescope",
            json!({"lat": -24.6, "lon": -70.2, "elev": 2800.0, "observatory_name": "zb08"}),
        )];
        let manager =
            ResourceManager::initiate(Weak::<NeverSolver>::new(), "zb08", "zb08", seeds).await;

        let mount = manager.get_resource(kinds::MOUNT, 0).unwrap();
        assert_eq!(mount.address(), "zb08.telescope");
        assert_eq!(mount.telescope_id(), "zb08");
        match mount.detail() {
            ResourceDetail::Mount { latitude, min_alt, .. } => {
                assert_eq!(*latitude, -24.6);
                assert_eq!(*min_alt, 10.0);
            }
            other => panic!("expected a mount detail, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn filter_wheel_loads_from_configuration() {
        let seeds = vec![seed(
            kinds::FILTERWHEEL,
            "filterwheel",
            json!({"filters": [
                {"name": "V", "position": 0},
                {"name": "B", "position": 1},
            ]}),
        )];
        let manager =
            ResourceManager::initiate(Weak::<NeverSolver>::new(), "zb08", "zb08", seeds).await;
        let wheel = manager
            .get_resource_by_source_name("filterwheel", Some(kinds::FILTERWHEEL))
            .unwrap();
        let filters = wheel.filters(manager.api()).await;
        assert_eq!(filters.get("V"), Some(&0));
        assert_eq!(filters.get("B"), Some(&1));
    }

    #[tokio::test]
    async fn unconfigured_filter_wheel_marks_itself_unloaded_when_the_tree_is_gone() {
        let seeds = vec![seed(kinds::FILTERWHEEL, "filterwheel", json!({}))];
        let manager =
            ResourceManager::initiate(Weak::<NeverSolver>::new(), "zb08", "zb08", seeds).await;
        let wheel = manager.get_resource(kinds::FILTERWHEEL, 0).unwrap();
        if let ResourceDetail::FilterWheel(state) = wheel.detail() {
            assert!(!state.read().await.loaded);
        }
    }

    #[tokio::test]
    async fn exclusive_lock_serializes_owners() {
        let seeds = vec![seed(kinds::DOME, "dome", json!({}))];
        let manager =
            ResourceManager::initiate(Weak::<NeverSolver>::new(), "", "zb08", seeds).await;
        let dome = manager.get_resource(kinds::DOME, 0).unwrap();
        let guard = dome.exclusive().await;
        assert!(dome.lock.try_lock().is_err());
        drop(guard);
        assert!(dome.lock.try_lock().is_ok());
    }

    /// Stand-in solver type for dead Weak references in tests.
    struct NeverSolver;

    #[async_trait::async_trait]
    impl InternalRequests for NeverSolver {
        async fn get_answer_internal(
            &self,
            _requests: Vec<ocs_common::ValueRequest>,
            _timeout: Option<f64>,
        ) -> Vec<ocs_common::ValueResponse> {
            Vec::new()
        }
    }
}
