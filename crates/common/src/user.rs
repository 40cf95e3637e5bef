use crate::time::now_ts;
use serde::{Deserialize, Serialize};

/// Identity attached to every request reaching the tree.
///
/// `Client` users arrive over the external transport and additionally carry
/// the socket id the transport assigned to their connection. `Service` users
/// are in-process identities created by the internal client facade; the
/// access gate only honors the special-permission flag for them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum User {
    Client {
        name: String,
        login_date: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        socket_id: Option<Vec<u8>>,
    },
    Service {
        name: String,
        login_date: f64,
    },
}

impl User {
    pub fn client(name: impl Into<String>) -> Self {
        User::Client {
            name: name.into(),
            login_date: now_ts(),
            socket_id: None,
        }
    }

    pub fn service(name: impl Into<String>) -> Self {
        User::Service {
            name: name.into(),
            login_date: now_ts(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            User::Client { name, .. } | User::Service { name, .. } => name,
        }
    }

    pub fn login_date(&self) -> f64 {
        match self {
            User::Client { login_date, .. } | User::Service { login_date, .. } => *login_date,
        }
    }

    pub fn is_service(&self) -> bool {
        matches!(self, User::Service { .. })
    }

    pub fn set_socket_id(&mut self, id: Vec<u8>) {
        if let User::Client { socket_id, .. } = self {
            *socket_id = Some(id);
        }
    }

    /// Re-tag an externally sourced identity as an in-process one, keeping
    /// the name. Used when a request enters through the internal facade.
    pub fn into_service(self) -> Self {
        match self {
            User::Client { name, login_date, .. } => User::Service { name, login_date },
            service => service,
        }
    }
}

// Reservation bookkeeping compares who a user is, not when or where they
// logged in.
impl PartialEq for User {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (User::Client { name: a, .. }, User::Client { name: b, .. }) => a == b,
            (User::Service { name: a, .. }, User::Service { name: b, .. }) => a == b,
            _ => false,
        }
    }
}

impl Eq for User {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_is_by_variant_and_name() {
        let a = User::client("alice");
        let b = User::client("alice");
        let c = User::client("bob");
        let s = User::service("alice");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, s);
    }

    #[test]
    fn into_service_keeps_the_name() {
        let mut user = User::client("watcher");
        user.set_socket_id(vec![1, 2]);
        let service = user.into_service();
        assert!(service.is_service());
        assert_eq!(service.name(), "watcher");
    }
}
