//! Offline message cache.
//!
//! When a message reaches no visible connection, the hub stores one copy per
//! push delivery point and hands the assigned ids to the push backend, so the
//! receiving device can fetch the payload out of band.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::OnceCell;

use crate::error::Result;
use crate::message::Message;

#[async_trait]
pub trait MessageCache: Send + Sync {
    /// Store a copy of the message and return the cache-assigned id.
    /// `ttl` of zero means no expiry.
    async fn cache_message(
        &self,
        service: &str,
        username: &str,
        msg: &Message,
        ttl: Duration,
    ) -> Result<String>;
}

/// Redis-backed cache. Ids are allocated from a per-user counter; the message
/// is stored as JSON under `mcache:{service}:{username}:{id}`.
pub struct RedisMessageCache {
    client: redis::Client,
    manager: OnceCell<ConnectionManager>,
}

impl RedisMessageCache {
    /// `db` is the numeric redis database index. The connection itself is
    /// established lazily on first use.
    pub fn new(addr: &str, password: &str, db: i64) -> Result<Self> {
        let url = if password.is_empty() {
            format!("redis://{}/{}", addr, db)
        } else {
            format!("redis://:{}@{}/{}", password, addr, db)
        };
        Ok(Self {
            client: redis::Client::open(url)?,
            manager: OnceCell::new(),
        })
    }

    async fn conn(&self) -> Result<ConnectionManager> {
        let manager = self
            .manager
            .get_or_try_init(|| self.client.get_connection_manager())
            .await?;
        Ok(manager.clone())
    }
}

#[async_trait]
impl MessageCache for RedisMessageCache {
    async fn cache_message(
        &self,
        service: &str,
        username: &str,
        msg: &Message,
        ttl: Duration,
    ) -> Result<String> {
        let mut conn = self.conn().await?;
        let counter_key = format!("mcache:{}:{}:counter", service, username);
        let id: u64 = conn.incr(&counter_key, 1u64).await?;

        let key = format!("mcache:{}:{}:{}", service, username, id);
        let data = serde_json::to_vec(msg)?;
        if ttl > Duration::ZERO {
            let _: () = conn.set_ex(&key, data, ttl.as_secs()).await?;
        } else {
            let _: () = conn.set(&key, data).await?;
        }
        Ok(id.to_string())
    }
}
