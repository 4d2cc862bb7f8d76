//! The connection surface the hub routes over.
//!
//! The hub never sees transport details; it holds `Arc<dyn Conn>` and drives
//! delivery, teardown and the per-connection read loop through this trait.

pub mod ws;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::cache::MessageCache;
use crate::error::Result;
use crate::message::{ForwardRequest, Message, SubscribeRequest};

pub use ws::WsConn;

/// A live client connection.
///
/// Identity accessors are immutable for the connection's lifetime; `uniq_id`
/// is unique within the process. The channel/cache setters take `&self` and
/// are called once during admission, before the hub starts reading.
#[async_trait]
pub trait Conn: Send + Sync {
    fn service(&self) -> &str;
    fn username(&self) -> &str;
    fn uniq_id(&self) -> &str;
    fn remote_addr(&self) -> &str;

    /// Whether delivery to this connection counts as reaching the user.
    /// Background or administrative side-channels report false.
    fn visible(&self) -> bool;

    /// Deliver a message to the peer. Returns a transport-assigned message id.
    async fn send_message(
        &self,
        msg: &Message,
        extra: Option<&HashMap<String, String>>,
        ttl: Duration,
    ) -> Result<String>;

    /// Read the next inbound message. Any error terminates the connection's
    /// read loop and becomes its leave cause.
    async fn read_message(&self) -> Result<Message>;

    /// Shut the connection down. Safe to call from the hub exactly once.
    async fn close(&self);

    /// Attach the hub's forward-request channel.
    fn set_forward_channel(&self, tx: mpsc::Sender<ForwardRequest>);

    /// Attach the hub's subscribe-request channel.
    fn set_subscribe_channel(&self, tx: mpsc::Sender<SubscribeRequest>);

    /// Attach the service's message cache.
    fn set_message_cache(&self, cache: Arc<dyn MessageCache>);
}
