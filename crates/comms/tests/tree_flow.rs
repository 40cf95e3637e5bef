//! End-to-end flows through the full stack: scripted leaf under the access
//! gate, grantor, default-target broker, cache, conditional freezer and site
//! provider, resolved through the request solver.

use bytes::Bytes;
use ocs_comms::RequestSolver;
use ocs_common::{
    now_ts, request::keys, Address, RequestType, Settings, User, Value, ValueRequest,
    ValueResponse,
};
use ocs_tree::component::{DynAddressed, DynComponent};
use ocs_tree::internal::InternalRequests;
use ocs_tree::testing::ScriptedProvider;
use ocs_tree::{
    TreeAccessGrantor, TreeBroker, TreeBrokerDefaultTarget, TreeCache, TreeConditionalFreezer,
    TreeProvider, TreeRequestBlocker,
};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const SETTINGS: &str = r#"
data_collection:
  TreeConditionalFreezer:
    alarm_timeout: 0.2
    min_time_of_data_tolerance: 0.2
    max_unsuccessful_refreshes: 3
tree:
  zb08_blocker:
    max_control_time: 120
    default_control_time: 60
"#;

/// Standard telescope stack over the given leaf, addressed as `zb08.…`.
fn solver_over(leaf: Arc<ScriptedProvider>) -> Arc<RequestSolver> {
    let settings = Arc::new(Settings::from_yaml_str(SETTINGS).unwrap());
    let blocker = Arc::new(TreeRequestBlocker::new("zb08_blocker", leaf, &settings));
    let grantor: DynAddressed = Arc::new(TreeAccessGrantor::new(
        "zb08_grantor",
        "access",
        blocker.clone(),
    ));
    let broker = Arc::new(TreeBrokerDefaultTarget::new(
        "zb08_broker",
        vec![grantor],
        blocker,
    ));
    let cache = Arc::new(TreeCache::new("zb08_cache", broker, &settings));
    let freezer = Arc::new(TreeConditionalFreezer::new("zb08_freezer", cache, &settings));
    let provider: DynAddressed = Arc::new(TreeProvider::new("zb08_provider", "zb08", freezer));
    let front: DynComponent = Arc::new(TreeBroker::new("front_broker", vec![provider]));
    RequestSolver::new(front, Arc::new(Settings::from_yaml_str(SETTINGS).unwrap()))
}

fn read(path: &str, tolerance: f64, timeout_in: f64) -> ValueRequest {
    let now = now_ts();
    ValueRequest::new(Address::parse(path).unwrap(), now)
        .with_timeout(now + timeout_in)
        .with_tolerance(tolerance)
        .with_user(User::client("alice"))
}

fn write(path: &str, user: &str) -> ValueRequest {
    read(path, 0.0, 5.0)
        .with_type(RequestType::Put)
        .with_user(User::client(user))
}

async fn resolve(solver: &Arc<RequestSolver>, request: ValueRequest) -> ValueResponse {
    let raw = Bytes::from(request.to_bytes().unwrap());
    let answers = Arc::clone(solver)
        .get_answer(vec![raw], Bytes::from_static(b"sock-1"), None)
        .await;
    ValueResponse::from_bytes(&answers[0]).unwrap()
}

#[tokio::test]
async fn concurrent_reads_coalesce_into_one_device_call() {
    let leaf = Arc::new(
        ScriptedProvider::constant("device", "telescope", json!(187.5))
            .with_delay(Duration::from_secs(1)),
    );
    let solver = solver_over(leaf.clone());

    let started = Instant::now();
    let requests: Vec<Bytes> = (0..3)
        .map(|_| {
            Bytes::from(
                read("zb08.telescope.rightascension", 10.0, 5.0)
                    .to_bytes()
                    .unwrap(),
            )
        })
        .collect();
    let answers = Arc::clone(&solver)
        .get_answer(requests, Bytes::from_static(b"sock-1"), None)
        .await;

    assert_eq!(answers.len(), 3);
    for raw in &answers {
        let response = ValueResponse::from_bytes(raw).unwrap();
        assert!(response.status, "{:?}", response.error);
        assert_eq!(response.value.unwrap().v, json!(187.5));
    }
    assert_eq!(leaf.calls(), 1, "the device must be asked exactly once");
    assert!(started.elapsed() < Duration::from_millis(1500));
}

#[tokio::test]
async fn gate_enforcement_round_trip() {
    let leaf = Arc::new(ScriptedProvider::constant("device", "telescope", json!(true)));
    let solver = solver_over(leaf);

    // No reservation: the write is denied.
    let response = resolve(&solver, write("zb08.telescope.tracking", "alice")).await;
    assert_eq!(response.error.unwrap().code, 1004);

    // take_control opens the gate for alice only.
    let response = resolve(&solver, write("zb08.access.take_control", "alice")).await;
    assert_eq!(response.value.unwrap().v, json!(true));

    let response = resolve(&solver, write("zb08.telescope.tracking", "alice")).await;
    assert!(response.status, "{:?}", response.error);

    let response = resolve(&solver, write("zb08.telescope.tracking", "bob")).await;
    assert_eq!(response.error.unwrap().code, 1004);

    // return_control closes it again.
    let response = resolve(&solver, write("zb08.access.return_control", "alice")).await;
    assert_eq!(response.value.unwrap().v, json!(true));
    let response = resolve(&solver, write("zb08.telescope.tracking", "alice")).await;
    assert_eq!(response.error.unwrap().code, 1004);
}

#[tokio::test]
async fn unchanged_subscription_alarms_before_the_deadline() {
    let leaf = Arc::new(ScriptedProvider::constant("device", "telescope", json!("still")));
    let solver = solver_over(leaf);

    // Seed the cache so the subscription has something unchanged to watch.
    let seeded = resolve(&solver, read("zb08.telescope.azimuth", 0.0, 5.0)).await;
    assert!(seeded.status);

    let now = now_ts();
    let request = read("zb08.telescope.azimuth", 0.2, 1.0)
        .with_cycle_query()
        .with_data(keys::TIME_OF_KNOWN_CHANGE, json!(now));
    let started = Instant::now();
    let response = resolve(&solver, request).await;
    let elapsed = started.elapsed().as_secs_f64();

    let error = response.error.unwrap();
    assert_eq!(error.code, 4004);
    assert!(
        (0.7..=1.1).contains(&elapsed),
        "alarm must fire inside the margin, got {elapsed}s"
    );
}

#[tokio::test]
async fn both_subscribers_see_the_same_change() {
    let payload = Arc::new(AtomicU64::new(1));
    let leaf = {
        let payload = payload.clone();
        Arc::new(ScriptedProvider::new("device", "telescope", move |_req| {
            Ok(Some(Value::new(
                json!(payload.load(Ordering::SeqCst)),
                now_ts(),
            )))
        }))
    };
    let solver = solver_over(leaf);

    let seeded = resolve(&solver, read("zb08.telescope.altitude", 0.0, 5.0)).await;
    assert!(seeded.status);
    let known = now_ts();

    let subscribe = |tolerance: f64| {
        let solver = solver.clone();
        tokio::spawn(async move {
            let request = read("zb08.telescope.altitude", tolerance, 6.0)
                .with_cycle_query()
                .with_data(keys::TIME_OF_KNOWN_CHANGE, json!(known));
            let started = Instant::now();
            let response = resolve(&solver, request).await;
            (response, started.elapsed())
        })
    };
    let fast = subscribe(0.2);
    let slow = subscribe(1.0);

    tokio::time::sleep(Duration::from_millis(300)).await;
    payload.store(2, Ordering::SeqCst);

    let (fast_response, fast_elapsed) = fast.await.unwrap();
    let (slow_response, slow_elapsed) = slow.await.unwrap();

    for response in [&fast_response, &slow_response] {
        assert!(response.status, "{:?}", response.error);
        let value = response.value.as_ref().unwrap();
        assert_eq!(value.v, json!(2));
        assert_eq!(value.tags.get("from_cf"), Some(&json!(true)));
    }
    // The fast subscriber's refresh wakes the slow one through the change
    // channel; the slow one must not be left waiting out its own tolerance.
    let margin = Duration::from_millis(300);
    assert!(
        slow_elapsed <= fast_elapsed + margin,
        "slow {slow_elapsed:?} must follow fast {fast_elapsed:?} promptly"
    );
}

#[tokio::test]
async fn service_users_bypass_the_gate_with_the_flag() {
    let leaf = Arc::new(ScriptedProvider::constant("device", "telescope", json!(1)));
    let solver = solver_over(leaf);

    // Internal requests are re-tagged as service users by the solver, so the
    // special-permission flag opens the gate without a reservation.
    let request = write("zb08.telescope.park", "planner")
        .with_data(keys::SPECIAL_PERMISSION, json!(true));
    let responses = solver.get_answer_internal(vec![request], None).await;
    assert!(responses[0].status, "{:?}", responses[0].error);
}
