//! Shared data model for the observatory control server: addresses, values,
//! requests and responses, user identities, the error taxonomy, the payload
//! byte codec and the configuration reader.

pub mod address;
pub mod error;
pub mod request;
pub mod settings;
pub mod time;
pub mod user;
pub mod value;
pub mod wire;

pub use address::Address;
pub use error::{ResponseError, Severity, TreeError};
pub use request::{RequestType, ValueRequest, ValueResponse};
pub use settings::Settings;
pub use time::now_ts;
pub use user::User;
pub use value::Value;
