//! Out-of-band event hooks.
//!
//! Every hook is optional. Notification hooks (login, logout, message, error,
//! unsubscribe) are fire-and-forget; decision hooks (forward, push,
//! subscribe, authenticate) return a boolean the hub acts on. The event loop
//! must never block on a notification hook, so callers spawn them.

pub mod webhook;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::message::{ForwardRequest, Message};

#[async_trait]
pub trait LoginHandler: Send + Sync {
    async fn on_login(&self, service: &str, username: &str, conn_id: &str, addr: &str);
}

#[async_trait]
pub trait LogoutHandler: Send + Sync {
    async fn on_logout(
        &self,
        service: &str,
        username: &str,
        conn_id: &str,
        addr: &str,
        reason: &str,
    );
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_message(&self, conn_id: &str, msg: &Message);
}

#[async_trait]
pub trait ErrorHandler: Send + Sync {
    async fn on_error(
        &self,
        service: &str,
        username: &str,
        conn_id: &str,
        addr: &str,
        reason: &str,
    );
}

/// Decides whether a relay request may proceed, and bounds its TTL.
#[async_trait]
pub trait ForwardRequestHandler: Send + Sync {
    async fn should_forward(&self, req: &ForwardRequest) -> bool;
    fn max_ttl(&self) -> Duration;
}

#[async_trait]
pub trait SubscribeHandler: Send + Sync {
    async fn should_subscribe(
        &self,
        service: &str,
        username: &str,
        info: &HashMap<String, String>,
    ) -> bool;
}

#[async_trait]
pub trait UnsubscribeHandler: Send + Sync {
    async fn on_unsubscribe(&self, service: &str, username: &str, info: &HashMap<String, String>);
}

/// Decides whether an unreached message warrants a push-notification fan-out.
#[async_trait]
pub trait PushHandler: Send + Sync {
    async fn should_push(
        &self,
        service: &str,
        username: &str,
        info: &HashMap<String, String>,
    ) -> bool;
}

/// Validates a connecting client's credentials during the handshake.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(
        &self,
        service: &str,
        username: &str,
        token: &str,
        addr: &str,
    ) -> Result<bool>;
}
