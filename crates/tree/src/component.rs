use crate::internal::{InternalClient, InternalRequests, Publisher};
use async_trait::async_trait;
use ocs_common::{Address, ResponseError, TreeError, Value, ValueRequest, ValueResponse};
use std::sync::{Arc, OnceLock, Weak};
use tracing::warn;

pub type DynComponent = Arc<dyn ProvidesResponse>;
pub type DynAddressed = Arc<dyn AddressedResponder>;

/// Tree-global record distributed top-down during post-init: a back-reference
/// to the root request solver (for in-process requests) and the pub/sub
/// handle. The back-reference is weak so the tree never keeps its own owner
/// alive.
#[derive(Clone)]
pub struct TreeData {
    pub target_requests: Weak<dyn InternalRequests>,
    pub messenger: Arc<dyn Publisher>,
}

/// Result of a value-producing hook: either a value is ready (possibly
/// empty), or the component declines and the request is forwarded to the next
/// component down. `Delegate` is a control signal, never an error, and never
/// reaches the wire.
#[derive(Debug)]
pub enum ValueOutcome {
    Ready(Option<Value>),
    Delegate,
}

/// A node in the request resolution tree.
#[async_trait]
pub trait ProvidesResponse: Send + Sync {
    /// Resolve a request into a response. Implementations must not panic;
    /// every failure becomes an error response carrying the request address.
    async fn get_response(&self, request: ValueRequest) -> ValueResponse;

    /// Instance name, used in logs and as the error `source`.
    fn component_name(&self) -> &str;

    /// Distribute [`TreeData`] and compute this node's dotted path. Called
    /// exactly once, top-down, after the tree is fully built.
    fn post_init(&self, tree_data: &TreeData, parent_path: &str);

    /// Open long-lived resources and cascade to children.
    async fn run(&self);

    /// Release resources opened by [`run`](Self::run) and cascade to
    /// children.
    async fn stop(&self);

    /// This node's structure and options as published in the configuration
    /// snapshot: `{<name>: {"type": ..., "child": {...}, "config": {...}}}`.
    fn configuration(&self) -> serde_json::Value {
        serde_json::json!({
            self.component_name(): {
                "type": "TreeComponent",
                "child": {},
                "config": {},
            }
        })
    }

    /// Addressable resources below this node as `(resource id, source names)`
    /// pairs; consumed by the resource manager.
    fn resources(&self) -> Vec<(String, Vec<String>)> {
        Vec::new()
    }
}

/// A component that owns one or more address segments.
pub trait Addressed {
    fn source_name(&self) -> &str;

    fn source_names(&self) -> &[String];

    fn is_named(&self, name: &str, only_main_name: bool) -> bool {
        if only_main_name {
            self.source_name() == name
        } else {
            self.source_names().iter().any(|n| n == name)
        }
    }
}

pub trait AddressedResponder: ProvidesResponse + Addressed {}

impl<T: ProvidesResponse + Addressed> AddressedResponder for T {}

/// Main source name plus auxiliary aliases a component answers to.
#[derive(Debug, Clone)]
pub struct SourceNames {
    main: String,
    all: Vec<String>,
}

impl SourceNames {
    pub fn new(main: impl Into<String>) -> Self {
        let main = main.into();
        Self {
            all: vec![main.clone()],
            main,
        }
    }

    pub fn with_aliases(main: impl Into<String>, aliases: Vec<String>) -> Self {
        let main = main.into();
        let mut all = aliases;
        if !all.contains(&main) {
            all.push(main.clone());
        }
        Self { main, all }
    }

    pub fn main(&self) -> &str {
        &self.main
    }

    pub fn all(&self) -> &[String] {
        &self.all
    }
}

/// Per-node state shared by every component implementation: the instance
/// name plus the post-init payload (tree data and the node's dotted path),
/// both written exactly once.
pub struct NodeCore {
    name: String,
    tree_data: OnceLock<TreeData>,
    tree_path: OnceLock<String>,
}

impl NodeCore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tree_data: OnceLock::new(),
            tree_path: OnceLock::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn init(&self, tree_data: &TreeData, tree_path: String) {
        if self.tree_data.set(tree_data.clone()).is_err() {
            warn!(component = %self.name, "tree post-init ran twice, keeping the first wiring");
        }
        let _ = self.tree_path.set(tree_path);
    }

    pub fn tree_data(&self) -> Option<&TreeData> {
        self.tree_data.get()
    }

    pub fn tree_path(&self) -> &str {
        self.tree_path.get().map(String::as_str).unwrap_or("")
    }

    /// In-process client bound to this node's identity; `None` before
    /// post-init.
    pub fn api(&self) -> Option<InternalClient> {
        let tree_data = self.tree_data.get()?;
        Some(InternalClient::new(
            tree_data.target_requests.clone(),
            &format!("{}_client", self.name),
        ))
    }
}

/// Dotted path of a child node: unnamed components inherit the parent path,
/// named ones append their source name.
pub fn child_path(parent_path: &str, source_name: Option<&str>) -> String {
    match source_name {
        None => parent_path.to_owned(),
        Some(name) if parent_path.is_empty() => name.to_owned(),
        Some(name) => format!("{parent_path}.{name}"),
    }
}

pub fn ok_response(address: Address, value: Option<Value>) -> ValueResponse {
    ValueResponse::ok(address, value)
}

pub fn error_response(component: &str, address: Address, error: TreeError) -> ValueResponse {
    ValueResponse::fail(address, ResponseError::from_tree_error(component, error))
}

/// Shared frame for components that may delegate: convert a hook outcome into
/// a response, forwarding `Delegate` to the subcontractor (3001 when there is
/// none).
pub async fn resolve_outcome(
    component: &str,
    outcome: Result<ValueOutcome, TreeError>,
    subcontractor: Option<&DynComponent>,
    request: ValueRequest,
) -> ValueResponse {
    match outcome {
        Ok(ValueOutcome::Ready(value)) => ok_response(request.address, value),
        Ok(ValueOutcome::Delegate) => match subcontractor {
            Some(sub) => sub.get_response(request).await,
            None => error_response(component, request.address, TreeError::other(3001)),
        },
        Err(error) => error_response(component, request.address, error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_names_deduplicate_the_main_name() {
        let names = SourceNames::with_aliases("tel", vec!["mount".to_owned(), "tel".to_owned()]);
        assert_eq!(names.main(), "tel");
        assert_eq!(names.all(), &["mount".to_owned(), "tel".to_owned()]);
    }

    #[test]
    fn child_paths_append_only_named_components() {
        assert_eq!(child_path("", Some("zb08")), "zb08");
        assert_eq!(child_path("zb08", None), "zb08");
        assert_eq!(child_path("zb08", Some("access")), "zb08.access");
    }
}
