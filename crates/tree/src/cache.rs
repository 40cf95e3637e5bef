use crate::component::{
    ok_response, DynComponent, NodeCore, ProvidesResponse, TreeData,
};
use async_trait::async_trait;
use ocs_common::{Address, RequestType, Settings, Value, ValueRequest, ValueResponse};
use regex::Regex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

/// Last-value cache with refresh coalescing.
///
/// One entry per address, created on the first cacheable lookup and kept for
/// the lifetime of the tree. A fresh-enough value answers the request without
/// touching the downstream tree. On a miss, the first caller installs an
/// in-flight marker and refreshes through the subcontractor; concurrent
/// callers park on the marker and re-evaluate when the refresher finishes
/// (or is cancelled), so a slow upstream is asked exactly once per address.
pub struct TreeCache {
    node: NodeCore,
    subcontractor: DynComponent,
    entries: Mutex<HashMap<Address, CacheEntry>>,
    next_refresh_id: AtomicU64,
    max_recall: u32,
    no_cachable: Vec<Regex>,
    changes: broadcast::Sender<()>,
}

struct CacheEntry {
    value: Option<Value>,
    /// Timestamp at which the stored payload last differed from its
    /// predecessor. Timestamp-only refreshes do not move it.
    change_time: f64,
    in_flight: Option<InFlight>,
}

struct InFlight {
    id: u64,
    done: watch::Receiver<bool>,
}

/// Snapshot of a cache entry handed to the conditional freezer.
#[derive(Debug, Clone)]
pub struct CachedState {
    pub value: Option<Value>,
    pub change_time: f64,
}

enum Lookup<'a> {
    Hit(Value),
    Join(watch::Receiver<bool>),
    Claimed(RefreshTicket<'a>),
}

/// Claim on an entry's in-flight slot. Dropping the ticket clears the marker
/// (only if it is still ours) and wakes the waiters; this also runs when the
/// refreshing task is cancelled, so parked peers are never deadlocked.
struct RefreshTicket<'a> {
    cache: &'a TreeCache,
    address: Address,
    id: u64,
    done: Option<watch::Sender<bool>>,
}

impl Drop for RefreshTicket<'_> {
    fn drop(&mut self) {
        let mut entries = self
            .cache
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.get_mut(&self.address) {
            if entry.in_flight.as_ref().is_some_and(|f| f.id == self.id) {
                entry.in_flight = None;
            }
        }
        drop(entries);
        if let Some(done) = self.done.take() {
            let _ = done.send(true);
        }
    }
}

impl TreeCache {
    pub const TYPE_NAME: &'static str = "TreeCache";

    pub fn new(component_name: &str, subcontractor: DynComponent, settings: &Settings) -> Self {
        let mut max_recall: u32 =
            settings.component_or(component_name, Self::TYPE_NAME, "max_recall", 1);
        if max_recall < 1 {
            warn!(
                component = component_name,
                "max_recall below one is unacceptable, forcing 1"
            );
            max_recall = 1;
        }
        let patterns: Vec<String> = settings
            .component(component_name, Self::TYPE_NAME, "no_cachable_regex")
            .unwrap_or_default();
        let no_cachable = patterns
            .iter()
            .filter_map(|pattern| {
                // Patterns are anchored at the start of the dotted address.
                match Regex::new(&format!("^(?:{pattern})")) {
                    Ok(regex) => Some(regex),
                    Err(error) => {
                        warn!(component = component_name, %pattern, %error, "skipping invalid no_cachable_regex");
                        None
                    }
                }
            })
            .collect();
        let (changes, _) = broadcast::channel(64);
        Self {
            node: NodeCore::new(component_name),
            subcontractor,
            entries: Mutex::new(HashMap::new()),
            next_refresh_id: AtomicU64::new(1),
            max_recall,
            no_cachable,
            changes,
        }
    }

    /// Whether this request may be answered from (and recorded into) the
    /// cache: reads only, and only for addresses outside the configured
    /// non-cacheable patterns.
    pub fn is_cachable(&self, request: &ValueRequest) -> bool {
        if request.request_type != RequestType::Get {
            return false;
        }
        let path = request.address.to_string();
        !self.no_cachable.iter().any(|regex| regex.is_match(&path))
    }

    /// Channel signaled on every true payload change; the freezer parks its
    /// subscribers on it.
    pub fn change_notifier(&self) -> broadcast::Sender<()> {
        self.changes.clone()
    }

    pub fn known_value(&self, address: &Address) -> Option<CachedState> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get(address).map(|entry| CachedState {
            value: entry.value.clone(),
            change_time: entry.change_time,
        })
    }

    fn lookup(&self, address: &Address, request: &ValueRequest) -> Lookup<'_> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.entry(address.clone()).or_insert_with(|| CacheEntry {
            value: None,
            change_time: 0.0,
            in_flight: None,
        });

        if let Some(value) = &entry.value {
            if !value.is_expired(request.time_of_data, request.time_of_data_tolerance) {
                return Lookup::Hit(value.clone());
            }
        }

        if let Some(in_flight) = &entry.in_flight {
            let still_running = !*in_flight.done.borrow() && in_flight.done.has_changed().is_ok();
            if still_running {
                return Lookup::Join(in_flight.done.clone());
            }
        }

        let id = self.next_refresh_id.fetch_add(1, Ordering::Relaxed);
        let (done_tx, done_rx) = watch::channel(false);
        entry.in_flight = Some(InFlight { id, done: done_rx });
        Lookup::Claimed(RefreshTicket {
            cache: self,
            address: address.clone(),
            id,
            done: Some(done_tx),
        })
    }

    /// Record a subcontractor response. Failures are never stored; stale
    /// timestamps are discarded; only a payload change moves `change_time`
    /// and wakes the freezer's subscribers.
    fn absorb(&self, address: &Address, response: &ValueResponse) {
        if !response.status {
            return;
        }
        let Some(value) = &response.value else {
            return;
        };
        let mut changed = false;
        {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            let entry = entries.entry(address.clone()).or_insert_with(|| CacheEntry {
                value: None,
                change_time: 0.0,
                in_flight: None,
            });
            match &entry.value {
                None => {
                    entry.value = Some(value.clone());
                    entry.change_time = value.ts;
                }
                Some(current) if value.ts > current.ts => {
                    if !value.same_payload(current) {
                        entry.change_time = value.ts;
                        changed = true;
                    }
                    entry.value = Some(value.clone());
                }
                Some(_) => {}
            }
        }
        if changed {
            // The update above happens-before this send, so a woken waiter
            // always observes the new entry.
            let _ = self.changes.send(());
        }
    }
}

#[async_trait]
impl ProvidesResponse for TreeCache {
    async fn get_response(&self, request: ValueRequest) -> ValueResponse {
        if !self.is_cachable(&request) {
            return self.subcontractor.get_response(request).await;
        }
        let address = request.address.clone();
        let mut recall: u32 = 0;
        loop {
            match self.lookup(&address, &request) {
                Lookup::Hit(value) => return ok_response(request.address, Some(value)),
                Lookup::Join(mut done) => {
                    if recall >= self.max_recall {
                        info!(
                            component = self.node.name(),
                            address = %address,
                            "stop waiting for the other refresher, asking on our own"
                        );
                        let response = self.subcontractor.get_response(request).await;
                        self.absorb(&address, &response);
                        return response;
                    }
                    recall += 1;
                    // Completes on the refresher finishing or being
                    // cancelled (sender dropped).
                    let _ = done.wait_for(|finished| *finished).await;
                }
                Lookup::Claimed(ticket) => {
                    let response = self.subcontractor.get_response(request).await;
                    self.absorb(&address, &response);
                    drop(ticket);
                    return response;
                }
            }
        }
    }

    fn component_name(&self) -> &str {
        self.node.name()
    }

    fn post_init(&self, tree_data: &TreeData, parent_path: &str) {
        self.node.init(tree_data, parent_path.to_owned());
        self.subcontractor.post_init(tree_data, parent_path);
    }

    async fn run(&self) {
        self.subcontractor.run().await;
    }

    async fn stop(&self) {
        self.subcontractor.stop().await;
    }

    fn configuration(&self) -> serde_json::Value {
        let mut children = serde_json::Map::new();
        if let serde_json::Value::Object(map) = self.subcontractor.configuration() {
            children.extend(map);
        }
        serde_json::json!({
            self.node.name(): {"type": Self::TYPE_NAME, "child": children, "config": {}}
        })
    }

    fn resources(&self) -> Vec<(String, Vec<String>)> {
        self.subcontractor.resources()
    }
}
