use serde::{Deserialize, Serialize};

/// How worried an operator should be about a failure.
///
/// The ordering matters: the freezer keeps the *highest* severity seen across
/// a run of failed refreshes and reports that one.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    /// Transient or client-induced, no systemic concern.
    #[default]
    Normal,
    /// Upstream momentarily unavailable, clients may retry.
    Temporary,
    /// Tree-level defect, operators should be notified.
    Critical,
}

/// Typed failure raised by a value-producing component.
///
/// Each variant maps to a numeric code range on the wire:
/// - `1001..=1099` address errors (malformed or non-routable address,
///   missing command, wrong argument types),
/// - `2001..=2099` value errors (producer declined to yield a value),
/// - `4001..=4099` infrastructure errors (unknown request type, alarm
///   timeout, upstream unavailable, ...).
///
/// Note that "delegate downward" is *not* an error: components signal it
/// through a dedicated result variant in the tree crate and it never reaches
/// the wire.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum TreeError {
    #[error("address error {code}: {message}")]
    Address {
        code: u16,
        message: String,
        severity: Severity,
    },
    #[error("value error {code}: {message}")]
    Value {
        code: u16,
        message: String,
        severity: Severity,
    },
    #[error("error {code}: {message}")]
    Other {
        code: u16,
        message: String,
        severity: Severity,
        /// Attached to alarm-timeout (4004) responses so a client can resume
        /// its subscription without resetting the retry budget.
        unsuccessful_refreshes: Option<u32>,
    },
}

impl TreeError {
    pub fn address(code: u16) -> Self {
        Self::address_msg(code, default_message(code))
    }

    pub fn address_msg(code: u16, message: impl Into<String>) -> Self {
        TreeError::Address {
            code,
            message: message.into(),
            severity: default_severity(code),
        }
    }

    pub fn value(code: u16) -> Self {
        Self::value_msg(code, default_message(code))
    }

    pub fn value_msg(code: u16, message: impl Into<String>) -> Self {
        TreeError::Value {
            code,
            message: message.into(),
            severity: default_severity(code),
        }
    }

    pub fn value_with_severity(code: u16, severity: Severity) -> Self {
        TreeError::Value {
            code,
            message: default_message(code).to_owned(),
            severity,
        }
    }

    pub fn other(code: u16) -> Self {
        Self::other_msg(code, default_message(code))
    }

    pub fn other_msg(code: u16, message: impl Into<String>) -> Self {
        TreeError::Other {
            code,
            message: message.into(),
            severity: default_severity(code),
            unsuccessful_refreshes: None,
        }
    }

    pub fn other_with_severity(code: u16, message: impl Into<String>, severity: Severity) -> Self {
        TreeError::Other {
            code,
            message: message.into(),
            severity,
            unsuccessful_refreshes: None,
        }
    }

    /// The 4004 alarm raised by the freezer shortly before the request
    /// deadline, carrying the refresh counter accumulated so far.
    pub fn alarm_timeout(unsuccessful_refreshes: u32) -> Self {
        TreeError::Other {
            code: 4004,
            message: default_message(4004).to_owned(),
            severity: Severity::Normal,
            unsuccessful_refreshes: Some(unsuccessful_refreshes),
        }
    }

    pub fn code(&self) -> u16 {
        match self {
            TreeError::Address { code, .. }
            | TreeError::Value { code, .. }
            | TreeError::Other { code, .. } => *code,
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            TreeError::Address { severity, .. }
            | TreeError::Value { severity, .. }
            | TreeError::Other { severity, .. } => *severity,
        }
    }
}

fn default_severity(code: u16) -> Severity {
    match code {
        3001 | 3002 | 4002 | 4006 => Severity::Critical,
        4005 => Severity::Temporary,
        _ => Severity::Normal,
    }
}

fn default_message(code: u16) -> &'static str {
    match code {
        1001 => "the address is too short to name a command",
        1002 => "no component answers this address",
        1003 => "wrong argument types",
        1004 => "access denied",
        2002 => "can not create value",
        2003 => "too many failed attempts to refresh the value",
        3001 => "no next component to delegate to",
        3002 => "next component can not respond",
        4001 => "unrecognized request type",
        4002 => "request resolver unavailable",
        4003 => "cycle request for a non-cacheable address",
        4004 => "request timed out before a fresh value arrived",
        4005 => "upstream device service is not responding",
        4006 => "value refresh was interrupted",
        4007 => "missing request parameter",
        _ => "unexpected error",
    }
}

/// Wire shape of a failure: code, message, the name of the component that
/// produced it and the severity tag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseError {
    pub code: u16,
    #[serde(rename = "msg")]
    pub message: String,
    pub source: String,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsuccessful_refreshes: Option<u32>,
}

impl ResponseError {
    pub fn new(code: u16, message: impl Into<String>, source: impl Into<String>, severity: Severity) -> Self {
        Self {
            code,
            message: message.into(),
            source: source.into(),
            severity,
            unsuccessful_refreshes: None,
        }
    }

    pub fn from_tree_error(source: &str, error: TreeError) -> Self {
        let severity = error.severity();
        let code = error.code();
        let (message, refreshes) = match error {
            TreeError::Address { message, .. } | TreeError::Value { message, .. } => (message, None),
            TreeError::Other {
                message,
                unsuccessful_refreshes,
                ..
            } => (message, unsuccessful_refreshes),
        };
        Self {
            code,
            message,
            source: source.to_owned(),
            severity,
            unsuccessful_refreshes: refreshes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_is_ordered_for_highest_seen_tracking() {
        assert!(Severity::Normal < Severity::Temporary);
        assert!(Severity::Temporary < Severity::Critical);
    }

    #[test]
    fn codes_get_default_messages_and_severities() {
        let err = TreeError::other(4005);
        assert_eq!(err.code(), 4005);
        assert_eq!(err.severity(), Severity::Temporary);
        assert_eq!(TreeError::other(4006).severity(), Severity::Critical);
        assert_eq!(TreeError::address(1002).severity(), Severity::Normal);
    }

    #[test]
    fn alarm_timeout_carries_the_refresh_counter() {
        let wire = ResponseError::from_tree_error("freezer", TreeError::alarm_timeout(2));
        assert_eq!(wire.code, 4004);
        assert_eq!(wire.unsuccessful_refreshes, Some(2));
    }

    #[test]
    fn wire_error_serializes_severity_uppercase() {
        let wire = ResponseError::new(4005, "down", "adapter", Severity::Temporary);
        let json = serde_json::to_value(&wire).unwrap();
        assert_eq!(json["severity"], "TEMPORARY");
        assert_eq!(json["msg"], "down");
    }
}
