use crate::{Address, ResponseError, TreeError, User, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Request direction. `Get` reads a value, `Put` mutates device state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestType {
    #[default]
    Get,
    Put,
}

impl std::fmt::Display for RequestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestType::Get => f.write_str("GET"),
            RequestType::Put => f.write_str("PUT"),
        }
    }
}

/// Keys recognized inside [`ValueRequest::request_data`].
pub mod keys {
    /// Newest change timestamp the subscriber has already seen.
    pub const TIME_OF_KNOWN_CHANGE: &str = "time_of_known_change";
    /// Retry counter carried across subscription renewals.
    pub const NR_OF_UNSUCCESSFUL_REFRESHES: &str = "nr_of_unsuccessful_refreshes";
    /// Earliest moment at which the freezer may answer.
    pub const NO_SEND_BEFORE: &str = "no_send_before";
    /// Absolute expiry requested for a reservation.
    pub const TIMEOUT_RESERVATION: &str = "timeout_reservation";
    /// Gate bypass flag, honored only for service users.
    pub const SPECIAL_PERMISSION: &str = "request_special_permission_param";
}

/// An addressed value request traversing the tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValueRequest {
    pub address: Address,
    #[serde(default)]
    pub request_type: RequestType,
    /// Absolute deadline, epoch seconds. The single source of truth every
    /// downstream stage derives its own budget from.
    pub request_timeout: f64,
    /// The client's reference timestamp; cache freshness is computed
    /// relative to it.
    pub time_of_data: f64,
    /// How stale a cached value may be, in seconds.
    #[serde(default)]
    pub time_of_data_tolerance: f64,
    /// Opts into subscription semantics served by the conditional freezer.
    #[serde(default)]
    pub cycle_query: bool,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub request_data: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
}

impl ValueRequest {
    pub fn new(address: Address, time_of_data: f64) -> Self {
        Self {
            address,
            request_type: RequestType::Get,
            request_timeout: 0.0,
            time_of_data,
            time_of_data_tolerance: 0.0,
            cycle_query: false,
            request_data: HashMap::new(),
            user: None,
        }
    }

    pub fn with_type(mut self, request_type: RequestType) -> Self {
        self.request_type = request_type;
        self
    }

    pub fn with_timeout(mut self, request_timeout: f64) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.time_of_data_tolerance = tolerance;
        self
    }

    pub fn with_cycle_query(mut self) -> Self {
        self.cycle_query = true;
        self
    }

    pub fn with_user(mut self, user: User) -> Self {
        self.user = Some(user);
        self
    }

    pub fn with_data(mut self, key: &str, value: serde_json::Value) -> Self {
        self.request_data.insert(key.to_owned(), value);
        self
    }

    /// Numeric request-data parameter, `None` when absent or null.
    pub fn data_f64(&self, key: &str) -> Option<f64> {
        self.request_data.get(key).and_then(serde_json::Value::as_f64)
    }

    /// Counter-typed request-data parameter. A present but non-integer value
    /// is a malformed request (1003), unlike a missing one.
    pub fn data_u32(&self, key: &str) -> Result<Option<u32>, TreeError> {
        match self.request_data.get(key) {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(raw) => match raw.as_u64() {
                Some(n) => Ok(Some(n as u32)),
                None => Err(TreeError::address(1003)),
            },
        }
    }

    pub fn data_flag(&self, key: &str) -> bool {
        self.request_data
            .get(key)
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }
}

/// Answer to a [`ValueRequest`]. Either a value (`status == true`, no error)
/// or a typed failure (`status == false`, no value); the address always
/// echoes the request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValueResponse {
    pub address: Address,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    pub status: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

impl ValueResponse {
    pub fn ok(address: Address, value: Option<Value>) -> Self {
        Self {
            address,
            value,
            status: true,
            error: None,
        }
    }

    pub fn fail(address: Address, error: ResponseError) -> Self {
        Self {
            address,
            value: None,
            status: false,
            error: Some(error),
        }
    }
}
