//! Scripted value leaf for exercising the tree in tests: configurable
//! payload, artificial upstream latency and an upstream-call counter.

use crate::component::{
    child_path, error_response, ok_response, Addressed, NodeCore, ProvidesResponse, SourceNames,
    TreeData,
};
use async_trait::async_trait;
use ocs_common::{now_ts, TreeError, Value, ValueRequest, ValueResponse};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

type Script = Box<dyn Fn(&ValueRequest) -> Result<Option<Value>, TreeError> + Send + Sync>;

pub struct ScriptedProvider {
    node: NodeCore,
    names: SourceNames,
    delay: Duration,
    calls: AtomicU32,
    script: Script,
}

impl ScriptedProvider {
    pub fn new(
        component_name: &str,
        source_name: &str,
        script: impl Fn(&ValueRequest) -> Result<Option<Value>, TreeError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            node: NodeCore::new(component_name),
            names: SourceNames::new(source_name),
            delay: Duration::ZERO,
            calls: AtomicU32::new(0),
            script: Box::new(script),
        }
    }

    /// Leaf that always answers with the same payload, freshly timestamped.
    pub fn constant(component_name: &str, source_name: &str, payload: serde_json::Value) -> Self {
        Self::new(component_name, source_name, move |_req| {
            Ok(Some(Value::new(payload.clone(), now_ts())))
        })
    }

    /// Leaf that always fails with the given error.
    pub fn failing(component_name: &str, source_name: &str, error: TreeError) -> Self {
        Self::new(component_name, source_name, move |_req| Err(error.clone()))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of times the upstream script was actually invoked.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Addressed for ScriptedProvider {
    fn source_name(&self) -> &str {
        self.names.main()
    }

    fn source_names(&self) -> &[String] {
        self.names.all()
    }
}

#[async_trait]
impl ProvidesResponse for ScriptedProvider {
    async fn get_response(&self, mut request: ValueRequest) -> ValueResponse {
        let Some(segment) = request.address.current() else {
            return error_response(self.node.name(), request.address, TreeError::value(2002));
        };
        if !self.is_named(segment, true) {
            return error_response(self.node.name(), request.address, TreeError::address(1002));
        }
        request.address.advance();

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        match (self.script)(&request) {
            Ok(value) => ok_response(request.address, value),
            Err(error) => error_response(self.node.name(), request.address, error),
        }
    }

    fn component_name(&self) -> &str {
        self.node.name()
    }

    fn post_init(&self, tree_data: &TreeData, parent_path: &str) {
        self.node
            .init(tree_data, child_path(parent_path, Some(self.names.main())));
    }

    async fn run(&self) {}

    async fn stop(&self) {}
}
