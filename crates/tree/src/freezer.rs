use crate::cache::{CachedState, TreeCache};
use crate::component::{
    error_response, ok_response, NodeCore, ProvidesResponse, TreeData,
};
use async_trait::async_trait;
use ocs_common::{
    now_ts, request::keys, Severity, TreeError, Value, ValueRequest, ValueResponse,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Subscription engine over the cache.
///
/// A read with `cycle_query` set is parked here until the cached value's
/// change time passes what the client has already seen, or until the alarm
/// margin before the request deadline is reached. Parked subscribers are
/// woken by the cache's change channel, never by polling; when nobody else
/// refreshes the value in time, the freezer triggers its own refresh under a
/// bounded retry budget.
pub struct TreeConditionalFreezer {
    node: NodeCore,
    cache: Arc<TreeCache>,
    changes: broadcast::Sender<()>,
    max_unsuccessful_refreshes: u32,
    /// Safety margin reserved before the deadline so the client always gets
    /// an answer before its own envelope timer fires.
    alarm_timeout_offset: f64,
    min_time_of_data_tolerance: f64,
}

impl TreeConditionalFreezer {
    pub const TYPE_NAME: &'static str = "TreeConditionalFreezer";

    pub fn new(component_name: &str, cache: Arc<TreeCache>, settings: &ocs_common::Settings) -> Self {
        Self {
            changes: cache.change_notifier(),
            max_unsuccessful_refreshes: settings.component_or(
                component_name,
                Self::TYPE_NAME,
                "max_unsuccessful_refreshes",
                3,
            ),
            alarm_timeout_offset: settings.component_or(
                component_name,
                Self::TYPE_NAME,
                "alarm_timeout",
                1.0,
            ),
            min_time_of_data_tolerance: settings.component_or(
                component_name,
                Self::TYPE_NAME,
                "min_time_of_data_tolerance",
                0.5,
            ),
            node: NodeCore::new(component_name),
            cache,
        }
    }

    async fn freeze(&self, request: &ValueRequest) -> Result<Value, TreeError> {
        let address = request.address.clone();
        let time_of_known_change = request.data_f64(keys::TIME_OF_KNOWN_CHANGE);

        let mut tolerance = request.time_of_data_tolerance;
        if tolerance < self.min_time_of_data_tolerance {
            warn!(
                address = %address,
                tolerance,
                minimum = self.min_time_of_data_tolerance,
                "time_of_data_tolerance too short, clamping up"
            );
            tolerance = self.min_time_of_data_tolerance;
        }

        // Carried across subscription renewals so a failing upstream does
        // not get a fresh budget on every reconnect.
        let mut unsuccessful_refreshes = request
            .data_u32(keys::NR_OF_UNSUCCESSFUL_REFRESHES)?
            .unwrap_or(0);
        if !request.request_timeout.is_finite() {
            return Err(TreeError::other_msg(4001, "wrong request timeout in request"));
        }
        let waiting_timeout = request.request_timeout - self.alarm_timeout_offset;
        let no_send_before = request.data_f64(keys::NO_SEND_BEFORE).unwrap_or(0.0);
        self.pace(no_send_before, waiting_timeout).await;

        let mut error_backoff: f64 = 0.0;
        let mut highest_severity: Option<Severity> = None;

        loop {
            // Subscribe before reading the entry so an update landing in
            // between is not missed.
            let mut changes = self.changes.subscribe();
            let known = self
                .cache
                .known_value(&address)
                .filter(|state| state.value.is_some());

            if let Some(state) = &known {
                let fresh = time_of_known_change.is_none_or(|seen| seen < state.change_time);
                if fresh {
                    if let Some(value) = state.value.clone() {
                        return Ok(value.with_tag("from_cf", serde_json::Value::Bool(true)));
                    }
                }
            }

            if unsuccessful_refreshes >= self.max_unsuccessful_refreshes {
                info!(address = %address, "too many failed attempts to refresh the value");
                return Err(TreeError::value_with_severity(
                    2003,
                    highest_severity.unwrap_or_default(),
                ));
            }

            tokio::task::yield_now().await;
            let signaled = self
                .wait_for_change(
                    &mut changes,
                    known.as_ref(),
                    tolerance,
                    waiting_timeout,
                    error_backoff,
                )
                .await;
            if signaled {
                // Another task refreshed the entry; re-evaluate it.
                continue;
            }

            self.check_alarm(waiting_timeout, unsuccessful_refreshes)?;

            debug!(address = %address, "refreshing value");
            let mut refresh = request.clone();
            refresh.time_of_data = now_ts();
            let budget = Duration::from_secs_f64((waiting_timeout - now_ts()).max(0.0));
            match tokio::time::timeout(budget, self.cache.get_response(refresh)).await {
                Err(_elapsed) => {
                    self.check_alarm(waiting_timeout, unsuccessful_refreshes)?;
                    error!(
                        address = %address,
                        "refresh interrupted by timeout although the alarm condition was not met"
                    );
                    return Err(TreeError::other_with_severity(
                        4006,
                        format!("refresh of {address} was interrupted by a miscalculated timeout"),
                        Severity::Critical,
                    ));
                }
                Ok(response) if response.status => {
                    error_backoff = 0.0;
                    unsuccessful_refreshes = 0;
                    highest_severity = None;
                }
                Ok(response) => {
                    info!(address = %address, "can not update value in cache");
                    error_backoff = tolerance;
                    unsuccessful_refreshes += 1;
                    if let Some(err) = response.error {
                        if highest_severity.is_none_or(|seen| err.severity > seen) {
                            highest_severity = Some(err.severity);
                        }
                    }
                }
            }
        }
    }

    /// Park on the change channel until the stored value ages past the
    /// tolerance window, capped by the alarm deadline. Returns `true` when
    /// woken by a change signal, `false` when it is time to act.
    async fn wait_for_change(
        &self,
        changes: &mut broadcast::Receiver<()>,
        known: Option<&CachedState>,
        tolerance: f64,
        waiting_timeout: f64,
        mut min_wait: f64,
    ) -> bool {
        loop {
            let now = now_ts();
            let mut waiting_time = match known.and_then(|state| state.value.as_ref()) {
                Some(value) => value.ts + tolerance - now,
                None => 0.0,
            };
            if min_wait != 0.0 {
                if waiting_time < min_wait {
                    waiting_time = min_wait;
                }
                // The back-off floor applies only to the first pass.
                min_wait = 0.0;
            }
            if waiting_time <= 0.0 {
                return false;
            }
            let time_to_timeout = waiting_timeout - now;
            if time_to_timeout <= 0.0 {
                return false;
            }
            if time_to_timeout < waiting_time {
                waiting_time = time_to_timeout;
            }
            match tokio::time::timeout(Duration::from_secs_f64(waiting_time), changes.recv()).await
            {
                Ok(Ok(())) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => return true,
                Ok(Err(broadcast::error::RecvError::Closed)) => return false,
                Err(_elapsed) => {
                    // Recompute; with an unchanged entry the next pass
                    // returns false and triggers a refresh.
                }
            }
        }
    }

    /// Give up with the alarm response when the deadline margin is reached,
    /// returning the refresh counter so the client can resume the
    /// subscription without resetting its budget.
    fn check_alarm(&self, waiting_timeout: f64, unsuccessful_refreshes: u32) -> Result<(), TreeError> {
        if waiting_timeout - now_ts() <= 0.0 {
            return Err(TreeError::alarm_timeout(unsuccessful_refreshes));
        }
        Ok(())
    }

    /// Honor `no_send_before` pacing without overshooting the alarm margin.
    async fn pace(&self, no_send_before: f64, waiting_timeout: f64) {
        let now = now_ts();
        if now >= no_send_before {
            return;
        }
        let until = no_send_before.min(waiting_timeout);
        if until > now {
            tokio::time::sleep(Duration::from_secs_f64(until - now)).await;
        }
    }
}

#[async_trait]
impl ProvidesResponse for TreeConditionalFreezer {
    async fn get_response(&self, request: ValueRequest) -> ValueResponse {
        if !request.cycle_query {
            // One-shot requests pass straight down.
            return self.cache.get_response(request).await;
        }
        if !self.cache.is_cachable(&request) {
            info!(address = %request.address, "cycle query for a non-cacheable value");
            return error_response(self.node.name(), request.address, TreeError::other(4003));
        }
        match self.freeze(&request).await {
            Ok(value) => ok_response(request.address, Some(value)),
            Err(error) => error_response(self.node.name(), request.address, error),
        }
    }

    fn component_name(&self) -> &str {
        self.node.name()
    }

    fn post_init(&self, tree_data: &TreeData, parent_path: &str) {
        self.node.init(tree_data, parent_path.to_owned());
        self.cache.post_init(tree_data, parent_path);
    }

    async fn run(&self) {
        self.cache.run().await;
    }

    async fn stop(&self) {
        self.cache.stop().await;
    }

    fn configuration(&self) -> serde_json::Value {
        let mut children = serde_json::Map::new();
        if let serde_json::Value::Object(map) = self.cache.configuration() {
            children.extend(map);
        }
        serde_json::json!({
            self.node.name(): {"type": Self::TYPE_NAME, "child": children, "config": {}}
        })
    }

    fn resources(&self) -> Vec<(String, Vec<String>)> {
        self.cache.resources()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedProvider;
    use ocs_common::{Address, RequestType, Settings};
    use serde_json::json;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Instant;

    fn settings(alarm: f64, min_tolerance: f64, max_refreshes: u32) -> Settings {
        Settings::from_yaml_str(&format!(
            r#"
data_collection:
  TreeConditionalFreezer:
    alarm_timeout: {alarm}
    min_time_of_data_tolerance: {min_tolerance}
    max_unsuccessful_refreshes: {max_refreshes}
"#
        ))
        .unwrap()
    }

    fn stack(
        leaf: Arc<ScriptedProvider>,
        alarm: f64,
        min_tolerance: f64,
        max_refreshes: u32,
    ) -> Arc<TreeConditionalFreezer> {
        let cfg = settings(alarm, min_tolerance, max_refreshes);
        let cache = Arc::new(TreeCache::new("cache", leaf, &cfg));
        Arc::new(TreeConditionalFreezer::new("freezer", cache, &cfg))
    }

    fn cycle_request(path: &str, tolerance: f64, timeout_in: f64, known_change: f64) -> ValueRequest {
        let now = now_ts();
        ValueRequest::new(Address::parse(path).unwrap(), now)
            .with_timeout(now + timeout_in)
            .with_tolerance(tolerance)
            .with_cycle_query()
            .with_data(keys::TIME_OF_KNOWN_CHANGE, json!(known_change))
    }

    #[tokio::test]
    async fn unchanged_value_raises_the_alarm_inside_the_margin() {
        let leaf = Arc::new(ScriptedProvider::constant("leaf", "dev", json!("static")));
        let freezer = stack(leaf, 0.2, 0.2, 10);

        // Seed the cache so change_time predates the subscription.
        let seed = ValueRequest::new(Address::parse("dev.val").unwrap(), now_ts())
            .with_timeout(now_ts() + 5.0);
        assert!(freezer.get_response(seed).await.status);

        let started = Instant::now();
        let request = cycle_request("dev.val", 0.2, 1.0, now_ts());
        let response = freezer.get_response(request).await;
        let elapsed = started.elapsed().as_secs_f64();

        let error = response.error.expect("alarm response expected");
        assert_eq!(error.code, 4004);
        assert!(error.unsuccessful_refreshes.is_some());
        assert!((0.7..=1.05).contains(&elapsed), "alarm at {elapsed}s");
    }

    #[tokio::test]
    async fn subscriber_wakes_when_the_payload_changes() {
        let counter = Arc::new(AtomicU64::new(0));
        let leaf = {
            let counter = counter.clone();
            Arc::new(ScriptedProvider::new("leaf", "dev", move |_req| {
                let n = counter.load(Ordering::SeqCst);
                Ok(Some(Value::new(json!(n), now_ts())))
            }))
        };
        let freezer = stack(leaf, 0.2, 0.2, 10);

        // Seed, then subscribe past the seeded change.
        let seed = ValueRequest::new(Address::parse("dev.val").unwrap(), now_ts())
            .with_timeout(now_ts() + 5.0);
        assert!(freezer.get_response(seed).await.status);
        let known_change = freezer
            .cache
            .known_value(&Address::parse("dev.val").unwrap())
            .unwrap()
            .change_time;

        let subscriber = {
            let freezer = freezer.clone();
            tokio::spawn(async move {
                freezer
                    .get_response(cycle_request("dev.val", 1.0, 5.0, known_change))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        // Mutate the upstream payload; the subscriber's own refresh loop (or
        // any concurrent reader) records the change and signals it.
        counter.store(42, Ordering::SeqCst);

        let response = tokio::time::timeout(Duration::from_secs(4), subscriber)
            .await
            .unwrap()
            .unwrap();
        assert!(response.status);
        let value = response.value.unwrap();
        assert_eq!(value.v, json!(42));
        assert_eq!(value.tags.get("from_cf"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn non_cacheable_cycle_requests_are_rejected() {
        let leaf = Arc::new(ScriptedProvider::constant("leaf", "dev", json!(1)));
        let freezer = stack(leaf, 0.2, 0.2, 10);

        let request = cycle_request("dev.val", 0.5, 2.0, now_ts()).with_type(RequestType::Put);
        let response = freezer.get_response(request).await;
        assert_eq!(response.error.unwrap().code, 4003);
    }

    #[tokio::test]
    async fn failing_upstream_exhausts_the_refresh_budget() {
        let leaf = Arc::new(ScriptedProvider::failing(
            "leaf",
            "dev",
            TreeError::other(4005),
        ));
        let freezer = stack(leaf, 0.2, 0.2, 2);

        let request = cycle_request("dev.val", 0.2, 10.0, now_ts());
        let response = tokio::time::timeout(Duration::from_secs(8), freezer.get_response(request))
            .await
            .unwrap();
        let error = response.error.unwrap();
        assert_eq!(error.code, 2003);
        // Highest severity seen across failed refreshes was the adapter's
        // TEMPORARY.
        assert_eq!(error.severity, Severity::Temporary);
    }

    #[tokio::test]
    async fn resumed_subscription_keeps_its_retry_budget() {
        let leaf = Arc::new(ScriptedProvider::failing(
            "leaf",
            "dev",
            TreeError::other(4005),
        ));
        let freezer = stack(leaf, 0.2, 0.2, 2);

        // Resuming with the counter already at the limit fails immediately,
        // without new refresh attempts.
        let request = cycle_request("dev.val", 0.2, 10.0, now_ts())
            .with_data(keys::NR_OF_UNSUCCESSFUL_REFRESHES, json!(2));
        let started = Instant::now();
        let response = freezer.get_response(request).await;
        assert_eq!(response.error.unwrap().code, 2003);
        assert!(started.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn malformed_refresh_counter_is_1003() {
        let leaf = Arc::new(ScriptedProvider::constant("leaf", "dev", json!(1)));
        let freezer = stack(leaf, 0.2, 0.2, 2);
        let request = cycle_request("dev.val", 0.2, 2.0, now_ts())
            .with_data(keys::NR_OF_UNSUCCESSFUL_REFRESHES, json!("many"));
        let response = freezer.get_response(request).await;
        assert_eq!(response.error.unwrap().code, 1003);
    }
}
