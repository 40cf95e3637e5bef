use crate::access::TreeRequestBlocker;
use crate::component::{
    child_path, error_response, ok_response, Addressed, NodeCore, ProvidesResponse, SourceNames,
    TreeData,
};
use async_trait::async_trait;
use ocs_common::{
    now_ts, request::keys, RequestType, TreeError, Value, ValueRequest, ValueResponse,
};
use serde_json::json;
use std::sync::Arc;
use tracing::info;

/// Command leaf that manipulates a sibling gate's reservation.
///
/// Commands: `take_control`, `return_control`, `break_control` (writes) and
/// `current_user`, `timeout_current_control`, `is_access` (reads).
pub struct TreeAccessGrantor {
    node: NodeCore,
    names: SourceNames,
    target_blocker: Arc<TreeRequestBlocker>,
}

impl TreeAccessGrantor {
    pub const TYPE_NAME: &'static str = "TreeAccessGrantor";

    pub fn new(
        component_name: &str,
        source_name: &str,
        target_blocker: Arc<TreeRequestBlocker>,
    ) -> Self {
        Self {
            node: NodeCore::new(component_name),
            names: SourceNames::new(source_name),
            target_blocker,
        }
    }

    fn command(&self, request: &ValueRequest) -> Result<Value, TreeError> {
        let Some(user) = request.user.clone() else {
            return Err(TreeError::other_msg(4001, "no user in request"));
        };
        let Some(command) = request.address.current() else {
            return Err(TreeError::address_msg(
                1001,
                "the address does not contain a command",
            ));
        };

        match (command, request.request_type) {
            ("take_control", RequestType::Put) => {
                let expires_at = request.data_f64(keys::TIMEOUT_RESERVATION);
                match self.target_blocker.make_reservation(&user, expires_at) {
                    Ok(()) => {
                        info!(user = user.name(), "user took control of the blocker");
                        Ok(Value::new(json!(true), now_ts()))
                    }
                    Err(error) => {
                        info!(user = user.name(), %error, "user failed to take control of the blocker");
                        Ok(Value::new(json!(false), now_ts()))
                    }
                }
            }
            ("break_control", RequestType::Put) => {
                match self.target_blocker.current_user() {
                    None => {
                        info!(user = user.name(), "break_control on a free blocker");
                    }
                    Some(current) => {
                        info!(
                            user = user.name(),
                            holder = current.name(),
                            "user cancelled the current control of the blocker"
                        );
                        self.target_blocker.cancel_reservation();
                    }
                }
                Ok(Value::new(json!(true), now_ts()))
            }
            ("return_control", RequestType::Put) => {
                let current = self.target_blocker.current_user();
                if current.is_none() || current.as_ref() == Some(&user) {
                    info!(user = user.name(), "user returned control of the blocker");
                    self.target_blocker.cancel_reservation();
                    Ok(Value::new(json!(true), now_ts()))
                } else {
                    info!(user = user.name(), "user failed to return control of the blocker");
                    Ok(Value::new(json!(false), now_ts()))
                }
            }
            ("current_user", RequestType::Get) => {
                // Read the expiry first: reading the user second can only
                // make the pair more conservative when it lapses in between.
                let timeout_control = self.target_blocker.reservation_timeout();
                let current = self.target_blocker.current_user();
                let payload = match current {
                    Some(current) => json!({
                        "name": current.name(),
                        "login_date": current.login_date(),
                        "timeout_control": timeout_control,
                    }),
                    None => json!({
                        "name": null,
                        "login_date": null,
                        "timeout_control": null,
                    }),
                };
                Ok(Value::new(payload, now_ts()))
            }
            ("timeout_current_control", RequestType::Get) => {
                let timeout_control = self.target_blocker.reservation_timeout();
                Ok(Value::new(json!(timeout_control), now_ts()))
            }
            ("is_access", RequestType::Get) => {
                let has_access = self
                    .target_blocker
                    .current_user()
                    .is_some_and(|current| current == user);
                Ok(Value::new(json!(has_access), now_ts()))
            }
            _ => Err(TreeError::address_msg(
                1002,
                format!("unrecognised command for module {}", self.node.name()),
            )),
        }
    }
}

impl Addressed for TreeAccessGrantor {
    fn source_name(&self) -> &str {
        self.names.main()
    }

    fn source_names(&self) -> &[String] {
        self.names.all()
    }
}

#[async_trait]
impl ProvidesResponse for TreeAccessGrantor {
    async fn get_response(&self, mut request: ValueRequest) -> ValueResponse {
        let Some(segment) = request.address.current() else {
            return error_response(self.node.name(), request.address, TreeError::value(2002));
        };
        if !self.is_named(segment, true) {
            return error_response(self.node.name(), request.address, TreeError::address(1002));
        }
        request.address.advance();

        match self.command(&request) {
            Ok(value) => ok_response(request.address, Some(value)),
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

    fn configuration(&self) -> serde_json::Value {
        serde_json::json!({
            self.node.name(): {"type": Self::TYPE_NAME, "child": {}, "config": {}}
        })
    }

    fn resources(&self) -> Vec<(String, Vec<String>)> {
        vec![(
            format!("{}_RESOURCE", self.node.name()),
            self.names.all().to_vec(),
        )]
    }
}
