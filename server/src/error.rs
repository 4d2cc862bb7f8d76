//! Error kinds emitted by the hub core.
//!
//! Admission errors are returned synchronously to the joining caller;
//! per-connection send errors are carried in the delivery result list and fed
//! to the error hook; cache/push errors in the fallback path are reported via
//! the error hook only.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HubError {
    /// The registry already holds the maximum number of online users.
    #[error("too many users")]
    TooManyUsers,

    /// The user's connection slot is full.
    #[error("too many connections under this user")]
    TooManyConnForThisUser,

    /// The global connection cap for the service is exceeded.
    #[error("too many connections")]
    TooManyConns,

    /// A connection was offered to a center it does not belong to.
    #[error("invalid connection type")]
    InvalidConnType,

    /// Username is empty or contains `:` or a newline.
    #[error("invalid username {0:?}")]
    InvalidUsername(String),

    /// The peer went away or the connection was closed locally.
    #[error("connection closed")]
    ConnectionClosed,

    /// The service center's event loop is no longer running.
    #[error("service center is shut down")]
    HubClosed,

    #[error("cache error: {0}")]
    Cache(String),

    #[error("push error: {0}")]
    Push(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redis::RedisError> for HubError {
    fn from(err: redis::RedisError) -> Self {
        HubError::Cache(err.to_string())
    }
}

impl From<reqwest::Error> for HubError {
    fn from(err: reqwest::Error) -> Self {
        HubError::Push(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, HubError>;
