//! Errors raised before a fleet is allowed to start.
//!
//! Anything in here is detected synchronously by `launch_fleet`; when one of
//! these is returned no bot has been launched.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("channel not found: {0}")]
    ChannelNotFound(String),

    #[error("channel {channel} does not support authentication, but {requested} was requested")]
    AuthUnsupported { channel: String, requested: String },

    #[error("credential table has {records} records, fleet needs {required}")]
    CredentialTableTooShort { records: usize, required: usize },

    #[error("no records found in credential table {}", path.display())]
    EmptyCredentialTable { path: PathBuf },

    #[error("invalid auth value {0:?} (expected new, next or id:password)")]
    InvalidAuth(String),

    #[error("invalid stagger interval: {0}")]
    InvalidStagger(String),
}
