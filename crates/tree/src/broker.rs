use crate::component::{
    child_path, error_response, Addressed, DynAddressed, DynComponent, NodeCore,
    ProvidesResponse, SourceNames, TreeData,
};
use async_trait::async_trait;
use ocs_common::{TreeError, ValueRequest, ValueResponse};
use tracing::{info, warn};

/// Routes a request to the child whose source names contain the segment
/// under the cursor. The broker itself does not own a segment; named
/// children consume their own segment when they accept the request.
pub struct TreeBroker {
    node: NodeCore,
    providers: Vec<DynAddressed>,
}

impl TreeBroker {
    pub fn new(component_name: &str, providers: Vec<DynAddressed>) -> Self {
        Self {
            node: NodeCore::new(component_name),
            providers: dedup_by_source_names(component_name, providers),
        }
    }

    fn find_provider(&self, request: &ValueRequest) -> Result<Option<&DynAddressed>, TreeError> {
        let segment = request
            .address
            .current()
            .ok_or_else(|| TreeError::address(1001))?;
        Ok(self.providers.iter().find(|p| p.is_named(segment, false)))
    }

    async fn route(&self, request: ValueRequest) -> ValueResponse {
        match self.find_provider(&request) {
            Ok(Some(provider)) => provider.get_response(request).await,
            Ok(None) => {
                info!(
                    component = self.node.name(),
                    address = %request.address,
                    level = request.address.index,
                    "unrecognised provider"
                );
                error_response(self.node.name(), request.address, TreeError::address(1002))
            }
            Err(error) => {
                info!(
                    component = self.node.name(),
                    address = %request.address,
                    "wrong format request address"
                );
                error_response(self.node.name(), request.address, error)
            }
        }
    }
}

fn dedup_by_source_names(component_name: &str, providers: Vec<DynAddressed>) -> Vec<DynAddressed> {
    let mut accepted: Vec<DynAddressed> = Vec::with_capacity(providers.len());
    for provider in providers {
        let clash = accepted
            .iter()
            .any(|p| provider.source_names().iter().any(|n| p.is_named(n, false)));
        if clash {
            warn!(
                component = component_name,
                child = provider.source_name(),
                "dropping child with a duplicate source name"
            );
        } else {
            accepted.push(provider);
        }
    }
    accepted
}

#[async_trait]
impl ProvidesResponse for TreeBroker {
    async fn get_response(&self, request: ValueRequest) -> ValueResponse {
        self.route(request).await
    }

    fn component_name(&self) -> &str {
        self.node.name()
    }

    fn post_init(&self, tree_data: &TreeData, parent_path: &str) {
        self.node.init(tree_data, parent_path.to_owned());
        for provider in &self.providers {
            provider.post_init(tree_data, parent_path);
        }
    }

    async fn run(&self) {
        for provider in &self.providers {
            provider.run().await;
        }
    }

    async fn stop(&self) {
        for provider in &self.providers {
            provider.stop().await;
        }
    }

    fn configuration(&self) -> serde_json::Value {
        let mut children = serde_json::Map::new();
        for provider in &self.providers {
            if let serde_json::Value::Object(map) = provider.configuration() {
                children.extend(map);
            }
        }
        serde_json::json!({
            self.node.name(): {"type": "TreeBroker", "child": children, "config": {}}
        })
    }

    fn resources(&self) -> Vec<(String, Vec<String>)> {
        self.providers.iter().flat_map(|p| p.resources()).collect()
    }
}

/// Broker with a nominated fallback child: when no named child matches (or
/// the address is already exhausted) the request goes to the default child
/// with the cursor untouched, so the fallback sees the unmatched segment.
pub struct TreeBrokerDefaultTarget {
    broker: TreeBroker,
    default_provider: DynComponent,
}

impl TreeBrokerDefaultTarget {
    pub fn new(
        component_name: &str,
        providers: Vec<DynAddressed>,
        default_provider: DynComponent,
    ) -> Self {
        Self {
            broker: TreeBroker::new(component_name, providers),
            default_provider,
        }
    }
}

#[async_trait]
impl ProvidesResponse for TreeBrokerDefaultTarget {
    async fn get_response(&self, request: ValueRequest) -> ValueResponse {
        match self.broker.find_provider(&request) {
            Ok(Some(provider)) => provider.get_response(request).await,
            // No named match, or nothing left to match on: the default
            // child decides.
            Ok(None) | Err(_) => self.default_provider.get_response(request).await,
        }
    }

    fn component_name(&self) -> &str {
        self.broker.node.name()
    }

    fn post_init(&self, tree_data: &TreeData, parent_path: &str) {
        self.broker.post_init(tree_data, parent_path);
        self.default_provider.post_init(tree_data, parent_path);
    }

    async fn run(&self) {
        self.broker.run().await;
        self.default_provider.run().await;
    }

    async fn stop(&self) {
        self.broker.stop().await;
        self.default_provider.stop().await;
    }

    fn configuration(&self) -> serde_json::Value {
        let mut tree = self.broker.configuration();
        if let Some(children) = tree
            .get_mut(self.broker.node.name())
            .and_then(|n| n.get_mut("child"))
            .and_then(serde_json::Value::as_object_mut)
        {
            if let serde_json::Value::Object(map) = self.default_provider.configuration() {
                children.extend(map);
            }
        }
        tree
    }

    fn resources(&self) -> Vec<(String, Vec<String>)> {
        let mut out = self.broker.resources();
        out.extend(self.default_provider.resources());
        out
    }
}

/// A broker that also owns an address segment: it asserts the segment under
/// the cursor names it, consumes it, then routes like [`TreeBroker`].
pub struct TreeNamedBroker {
    broker: TreeBroker,
    names: SourceNames,
}

impl TreeNamedBroker {
    pub fn new(component_name: &str, source_name: &str, providers: Vec<DynAddressed>) -> Self {
        Self {
            broker: TreeBroker::new(component_name, providers),
            names: SourceNames::new(source_name),
        }
    }
}

impl Addressed for TreeNamedBroker {
    fn source_name(&self) -> &str {
        self.names.main()
    }

    fn source_names(&self) -> &[String] {
        self.names.all()
    }
}

#[async_trait]
impl ProvidesResponse for TreeNamedBroker {
    async fn get_response(&self, mut request: ValueRequest) -> ValueResponse {
        let accepted = request
            .address
            .current()
            .is_some_and(|segment| self.is_named(segment, false));
        if !accepted {
            warn!(
                component = self.broker.node.name(),
                address = %request.address,
                "request routed to a block not contained in the address"
            );
            return error_response(
                self.broker.node.name(),
                request.address,
                TreeError::address(1002),
            );
        }
        request.address.advance();
        self.broker.route(request).await
    }

    fn component_name(&self) -> &str {
        self.broker.node.name()
    }

    fn post_init(&self, tree_data: &TreeData, parent_path: &str) {
        let path = child_path(parent_path, Some(self.names.main()));
        self.broker.node.init(tree_data, path.clone());
        for provider in &self.broker.providers {
            provider.post_init(tree_data, &path);
        }
    }

    async fn run(&self) {
        self.broker.run().await;
    }

    async fn stop(&self) {
        self.broker.stop().await;
    }

    fn configuration(&self) -> serde_json::Value {
        self.broker.configuration()
    }

    fn resources(&self) -> Vec<(String, Vec<String>)> {
        vec![(
            format!("{}_RESOURCE", self.broker.node.name()),
            self.names.all().to_vec(),
        )]
    }
}
