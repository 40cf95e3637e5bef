use crate::component::{
    child_path, error_response, Addressed, DynComponent, NodeCore, ProvidesResponse, SourceNames,
    TreeData,
};
use async_trait::async_trait;
use ocs_common::{TreeError, ValueRequest, ValueResponse};
use tracing::{info, warn};

/// Named pass-through node: consumes exactly one address segment (its own
/// source name) and delegates the rest of the request to its single
/// subcontractor.
pub struct TreeProvider {
    node: NodeCore,
    names: SourceNames,
    subcontractor: DynComponent,
}

impl TreeProvider {
    pub fn new(component_name: &str, source_name: &str, subcontractor: DynComponent) -> Self {
        Self {
            node: NodeCore::new(component_name),
            names: SourceNames::new(source_name),
            subcontractor,
        }
    }

    pub fn with_aliases(
        component_name: &str,
        source_name: &str,
        aliases: Vec<String>,
        subcontractor: DynComponent,
    ) -> Self {
        Self {
            node: NodeCore::new(component_name),
            names: SourceNames::with_aliases(source_name, aliases),
            subcontractor,
        }
    }
}

impl Addressed for TreeProvider {
    fn source_name(&self) -> &str {
        self.names.main()
    }

    fn source_names(&self) -> &[String] {
        self.names.all()
    }
}

#[async_trait]
impl ProvidesResponse for TreeProvider {
    async fn get_response(&self, mut request: ValueRequest) -> ValueResponse {
        let Some(segment) = request.address.current() else {
            info!(
                component = self.node.name(),
                address = %request.address,
                "address is exhausted before reaching this provider"
            );
            return error_response(
                self.node.name(),
                request.address,
                TreeError::value_msg(
                    2002,
                    format!(
                        "the address is too short to call this provider; expected one of: {}",
                        self.names.all().join(".")
                    ),
                ),
            );
        };
        if !self.is_named(segment, true) {
            warn!(
                component = self.node.name(),
                address = %request.address,
                "request routed to a block not contained in the address"
            );
            let msg = format!(
                "the request was passed to a block ({}) not contained in the address ({})",
                self.names.all().join("."),
                request.address
            );
            return error_response(
                self.node.name(),
                request.address,
                TreeError::address_msg(1002, msg),
            );
        }
        request.address.advance();
        self.subcontractor.get_response(request).await
    }

    fn component_name(&self) -> &str {
        self.node.name()
    }

    fn post_init(&self, tree_data: &TreeData, parent_path: &str) {
        let path = child_path(parent_path, Some(self.names.main()));
        self.node.init(tree_data, path.clone());
        self.subcontractor.post_init(tree_data, &path);
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
            self.node.name(): {"type": "TreeProvider", "child": children, "config": {}}
        })
    }

    fn resources(&self) -> Vec<(String, Vec<String>)> {
        let mut out = vec![(
            format!("{}_RESOURCE", self.node.name()),
            self.names.all().to_vec(),
        )];
        out.extend(self.subcontractor.resources());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedProvider;
    use ocs_common::{now_ts, Address};
    use serde_json::json;
    use std::sync::Arc;

    fn request(path: &str) -> ValueRequest {
        ValueRequest::new(Address::parse(path).unwrap(), now_ts()).with_timeout(now_ts() + 5.0)
    }

    fn provider() -> TreeProvider {
        let leaf = Arc::new(ScriptedProvider::constant("leaf", "inner", json!(3)));
        TreeProvider::new("site_provider", "zb08", leaf)
    }

    #[tokio::test]
    async fn consumes_its_segment_then_delegates() {
        let response = provider().get_response(request("zb08.inner.val")).await;
        assert!(response.status);
        assert_eq!(response.value.unwrap().v, json!(3));
    }

    #[tokio::test]
    async fn wrong_segment_is_1002() {
        let response = provider().get_response(request("other.inner.val")).await;
        assert_eq!(response.error.unwrap().code, 1002);
    }

    #[tokio::test]
    async fn exhausted_address_is_2002_not_a_crash() {
        let mut req = request("zb08");
        req.address.advance();
        let response = provider().get_response(req).await;
        let error = response.error.unwrap();
        assert_eq!(error.code, 2002);
        assert_eq!(error.source, "site_provider");
    }
}
