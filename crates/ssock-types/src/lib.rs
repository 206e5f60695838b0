#![forbid(unsafe_code)]
#![doc = "Status codes and error types for the ssock secure-stream session layer."]

pub mod error;

pub use error::{SecurityError, SecurityStatus, SessionError};
