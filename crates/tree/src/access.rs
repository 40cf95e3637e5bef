use crate::component::{
    DynComponent, NodeCore, ProvidesResponse, TreeData, ValueOutcome,
};
use crate::component::resolve_outcome;
use async_trait::async_trait;
use ocs_common::{
    now_ts, request::keys, RequestType, Settings, TreeError, User, ValueRequest,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

/// Why a reservation attempt was refused.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ReservationError {
    #[error("the gate is already reserved by another user")]
    Occupied,
    #[error("requested reservation exceeds the maximum control time")]
    TooLong,
}

/// Single-holder reservation slot. Expiry is computed lazily at read time,
/// so a stale holder is treated as absent without a background janitor.
#[derive(Debug, Default)]
struct Reservation {
    holder: Option<User>,
    expires_at: f64,
}

impl Reservation {
    fn live_holder(&mut self) -> Option<&User> {
        if self.holder.is_some() && self.expires_at <= now_ts() {
            self.holder = None;
            self.expires_at = 0.0;
        }
        self.holder.as_ref()
    }
}

/// Request-admission gate.
///
/// Reads pass through; writes are admitted only for the reservation holder,
/// white-listed residual addresses, or service users carrying the explicit
/// special-permission flag. Black-listed residual addresses are refused for
/// everyone. The sibling [`TreeAccessGrantor`](crate::grantor::TreeAccessGrantor)
/// manipulates the reservation slot.
pub struct TreeRequestBlocker {
    node: NodeCore,
    subcontractor: DynComponent,
    reservation: Mutex<Reservation>,
    white_lists: HashMap<RequestType, HashSet<String>>,
    black_lists: HashMap<RequestType, HashSet<String>>,
    default_control_time: f64,
    max_control_time: f64,
}

impl TreeRequestBlocker {
    pub const TYPE_NAME: &'static str = "TreeRequestBlocker";

    pub fn new(component_name: &str, subcontractor: DynComponent, settings: &Settings) -> Self {
        Self {
            white_lists: load_lists(settings, component_name, "white_list"),
            black_lists: load_lists(settings, component_name, "black_list"),
            default_control_time: settings.component_or(
                component_name,
                Self::TYPE_NAME,
                "default_control_time",
                0.0,
            ),
            max_control_time: settings.component_or(
                component_name,
                Self::TYPE_NAME,
                "max_control_time",
                60.0,
            ),
            node: NodeCore::new(component_name),
            subcontractor,
            reservation: Mutex::new(Reservation::default()),
        }
    }

    /// Reserve the gate for `user` until `expires_at` (absolute; defaults to
    /// now + the configured control time). The current holder may refresh
    /// their own reservation.
    pub fn make_reservation(
        &self,
        user: &User,
        expires_at: Option<f64>,
    ) -> Result<(), ReservationError> {
        let mut slot = self
            .reservation
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.live_holder().is_some_and(|holder| holder != user) {
            return Err(ReservationError::Occupied);
        }
        let expires_at = expires_at.unwrap_or_else(|| now_ts() + self.default_control_time);
        if expires_at - now_ts() > self.max_control_time {
            return Err(ReservationError::TooLong);
        }
        slot.holder = Some(user.clone());
        slot.expires_at = expires_at;
        Ok(())
    }

    pub fn cancel_reservation(&self) {
        let mut slot = self
            .reservation
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        slot.holder = None;
        slot.expires_at = 0.0;
    }

    pub fn current_user(&self) -> Option<User> {
        let mut slot = self
            .reservation
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        slot.live_holder().cloned()
    }

    /// Absolute expiry of the live reservation, `None` when the gate is
    /// free.
    pub fn reservation_timeout(&self) -> Option<f64> {
        let mut slot = self
            .reservation
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        slot.live_holder()?;
        Some(slot.expires_at)
    }

    fn on_list(
        lists: &HashMap<RequestType, HashSet<String>>,
        residual: &str,
        request_type: RequestType,
    ) -> bool {
        lists
            .get(&request_type)
            .is_some_and(|set| set.contains(residual))
    }

    fn decide(&self, request: &ValueRequest) -> Result<ValueOutcome, TreeError> {
        let residual = request.address.residual();

        if Self::on_list(&self.black_lists, &residual, request.request_type) {
            return Err(TreeError::address(1004));
        }
        if request.request_type == RequestType::Get {
            return Ok(ValueOutcome::Delegate);
        }
        // Anything that is neither a read nor a write never passes.
        if request.request_type != RequestType::Put {
            return Err(TreeError::other_msg(4001, "unrecognized request type"));
        }
        if Self::on_list(&self.white_lists, &residual, request.request_type) {
            return Ok(ValueOutcome::Delegate);
        }
        let is_service = request.user.as_ref().is_some_and(User::is_service);
        if request.data_flag(keys::SPECIAL_PERMISSION) && is_service {
            debug!(
                component = self.node.name(),
                "request with special-permission flag bypassed the gate"
            );
            return Ok(ValueOutcome::Delegate);
        }
        let holder_matches = match (self.current_user(), &request.user) {
            (Some(holder), Some(user)) => holder == *user,
            _ => false,
        };
        if holder_matches {
            return Ok(ValueOutcome::Delegate);
        }
        Err(TreeError::address(1004))
    }
}

fn load_lists(
    settings: &Settings,
    component_name: &str,
    key: &str,
) -> HashMap<RequestType, HashSet<String>> {
    let raw: HashMap<String, Vec<String>> = settings
        .component(component_name, TreeRequestBlocker::TYPE_NAME, key)
        .unwrap_or_default();
    let mut lists: HashMap<RequestType, HashSet<String>> = HashMap::new();
    lists.insert(RequestType::Get, HashSet::new());
    lists.insert(RequestType::Put, HashSet::new());
    for (type_name, addresses) in raw {
        let request_type = match type_name.as_str() {
            "GET" => RequestType::Get,
            "PUT" => RequestType::Put,
            _ => continue,
        };
        if let Some(set) = lists.get_mut(&request_type) {
            set.extend(addresses);
        }
    }
    lists
}

#[async_trait]
impl ProvidesResponse for TreeRequestBlocker {
    async fn get_response(&self, request: ValueRequest) -> ocs_common::ValueResponse {
        let outcome = self.decide(&request);
        resolve_outcome(
            self.node.name(),
            outcome,
            Some(&self.subcontractor),
            request,
        )
        .await
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
