//! Label codec.
//!
//! Instances carry flat `key=value` labels such as
//! `traefik.http.services.web.loadbalancer.server.port=8080`. `decode` turns the
//! labels under a set of filter prefixes into any `Deserialize` type, `encode`
//! flattens any `Serialize` value back into labels.
//!
//! Struct field names are matched case-insensitively, map keys (entity names)
//! are kept verbatim. Unknown fields are ignored.

mod decode;
mod encode;
mod tree;

pub use decode::decode;
pub use encode::encode;

use std::fmt::Display;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("invalid label key {0:?}")]
    InvalidKey(String),

    #[error("label {0:?} is both a value and a parent of other labels")]
    Conflict(String),

    #[error("invalid value {value:?} for {path}: expected {expected}")]
    InvalidValue {
        path: String,
        value: String,
        expected: &'static str,
    },

    #[error("{0}")]
    Message(String),
}

impl serde::de::Error for DecodeError {
    fn custom<T: Display>(msg: T) -> Self {
        DecodeError::Message(msg.to_string())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum EncodeError {
    #[error("could not serialize value: {0}")]
    Serialize(#[from] serde_json::Error),
}
