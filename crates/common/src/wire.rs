//! Payload byte codec.
//!
//! Requests and responses travel as individually serialized frames inside the
//! multipart envelope. The encoding is MessagePack with string keys, so any
//! implementation that agrees on the field names can talk to this server.

use crate::{ValueRequest, ValueResponse};
use serde::{de::DeserializeOwned, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("can not encode payload: {0}")]
    Encode(String),
    #[error("can not decode payload: {0}")]
    Decode(String),
}

pub fn to_bytes<T: Serialize>(payload: &T) -> Result<Vec<u8>, WireError> {
    rmp_serde::to_vec_named(payload).map_err(|error| WireError::Encode(error.to_string()))
}

pub fn from_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, WireError> {
    rmp_serde::from_slice(bytes).map_err(|error| WireError::Decode(error.to_string()))
}

impl ValueRequest {
    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        to_bytes(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        from_bytes(bytes)
    }
}

impl ValueResponse {
    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        to_bytes(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        from_bytes(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{request::keys, Address, RequestType, User, Value};
    use serde_json::json;

    #[test]
    fn request_round_trips_through_messagepack() {
        let request = ValueRequest::new(Address::parse("zb08.telescope.azimuth").unwrap(), 10.0)
            .with_type(RequestType::Put)
            .with_timeout(12.0)
            .with_tolerance(0.5)
            .with_user(User::client("alice"))
            .with_data(keys::TIMEOUT_RESERVATION, json!(42.0));

        let bytes = request.to_bytes().unwrap();
        let back = ValueRequest::from_bytes(&bytes).unwrap();
        assert_eq!(back.address, request.address);
        assert_eq!(back.request_type, RequestType::Put);
        assert_eq!(back.request_timeout, 12.0);
        assert_eq!(back.user, Some(User::client("alice")));
        assert_eq!(back.data_f64(keys::TIMEOUT_RESERVATION), Some(42.0));
    }

    #[test]
    fn response_round_trips_with_tags() {
        let value = Value::new(json!({"ra": 123.4}), 5.0).with_tag("from_cf", json!(true));
        let response =
            ValueResponse::ok(Address::parse("zb08.telescope.rightascension").unwrap(), Some(value));
        let back = ValueResponse::from_bytes(&response.to_bytes().unwrap()).unwrap();
        assert!(back.status);
        let value = back.value.unwrap();
        assert_eq!(value.tags.get("from_cf"), Some(&json!(true)));
    }

    #[test]
    fn damaged_payload_is_a_decode_error() {
        assert!(matches!(
            ValueRequest::from_bytes(b"\x00garbage"),
            Err(WireError::Decode(_))
        ));
    }
}
