//! courier message-delivery hub library.
//! This crate exposes internal modules for integration testing.
//! The binary entry point is in main.rs.

pub mod cache;
pub mod config;
pub mod conn;
pub mod error;
pub mod hooks;
pub mod hub;
pub mod message;
pub mod push;
pub mod routes;
pub mod state;

pub use config::{Config, ConfigError};
pub use conn::{Conn, WsConn};
pub use error::HubError;
pub use hub::{DeliveryResult, MessageHub, ServiceCenter, ServiceConfig};
pub use message::{ForwardRequest, Message, SubscribeRequest};
pub use state::AppState;
