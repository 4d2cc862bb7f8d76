//! JSON-over-HTTP webhook implementations of the event hooks.
//!
//! Each hook POSTs a JSON body to its URL. A blank URL or the literal
//! `"none"` disables the hook; it then always reports its configured default.
//! Transport failures and non-2xx handling follow one rule: status 200 means
//! accept, anything else (including failure to reach the remote) falls back
//! to the hook's default status.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use super::{
    Authenticator, ErrorHandler, ForwardRequestHandler, LoginHandler, LogoutHandler,
    MessageHandler, PushHandler, SubscribeHandler, UnsubscribeHandler,
};
use crate::error::Result;
use crate::message::{ForwardRequest, Message};

const STATUS_ALLOW: u16 = 200;
const STATUS_DENY: u16 = 404;

/// Shared webhook transport: URL, timeout and default status.
#[derive(Debug, Clone)]
pub struct Webhook {
    url: String,
    default_status: u16,
    client: reqwest::Client,
}

impl Webhook {
    /// Build a webhook. `default_allow` selects the status reported when the
    /// remote cannot be reached: true maps to 200, false to 404.
    pub fn new(
        url: impl Into<String>,
        timeout: Duration,
        default_allow: bool,
    ) -> std::result::Result<Self, reqwest::Error> {
        let mut builder = reqwest::Client::builder();
        if timeout > Duration::ZERO {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            url: url.into(),
            default_status: if default_allow { STATUS_ALLOW } else { STATUS_DENY },
            client: builder.build()?,
        })
    }

    fn disabled(&self) -> bool {
        self.url.is_empty() || self.url == "none"
    }

    /// POST the payload and return the response status, or the default on any
    /// transport failure.
    async fn post<T: Serialize + ?Sized>(&self, payload: &T) -> u16 {
        if self.disabled() {
            return self.default_status;
        }
        match self.client.post(&self.url).json(payload).send().await {
            Ok(resp) => resp.status().as_u16(),
            Err(err) => {
                tracing::debug!(url = %self.url, error = %err, "webhook post failed");
                self.default_status
            }
        }
    }

    async fn accepted<T: Serialize + ?Sized>(&self, payload: &T) -> bool {
        self.post(payload).await == STATUS_ALLOW
    }
}

#[derive(Serialize)]
struct ConnEvent<'a> {
    service: &'a str,
    username: &'a str,
    #[serde(rename = "connId")]
    conn_id: &'a str,
    addr: &'a str,
}

#[derive(Serialize)]
struct ConnReasonEvent<'a> {
    service: &'a str,
    username: &'a str,
    #[serde(rename = "connId")]
    conn_id: &'a str,
    addr: &'a str,
    reason: &'a str,
}

#[derive(Serialize)]
struct MessageEvent<'a> {
    #[serde(rename = "connId")]
    conn_id: &'a str,
    msg: &'a Message,
}

#[derive(Serialize)]
struct AuthEvent<'a> {
    service: &'a str,
    username: &'a str,
    token: &'a str,
    addr: &'a str,
}

#[derive(Serialize)]
struct PushRelatedEvent<'a> {
    service: &'a str,
    username: &'a str,
    info: &'a HashMap<String, String>,
}

pub struct WebhookLoginHandler {
    pub hook: Webhook,
}

#[async_trait]
impl LoginHandler for WebhookLoginHandler {
    async fn on_login(&self, service: &str, username: &str, conn_id: &str, addr: &str) {
        self.hook
            .post(&ConnEvent {
                service,
                username,
                conn_id,
                addr,
            })
            .await;
    }
}

pub struct WebhookLogoutHandler {
    pub hook: Webhook,
}

#[async_trait]
impl LogoutHandler for WebhookLogoutHandler {
    async fn on_logout(
        &self,
        service: &str,
        username: &str,
        conn_id: &str,
        addr: &str,
        reason: &str,
    ) {
        self.hook
            .post(&ConnReasonEvent {
                service,
                username,
                conn_id,
                addr,
                reason,
            })
            .await;
    }
}

pub struct WebhookMessageHandler {
    pub hook: Webhook,
}

#[async_trait]
impl MessageHandler for WebhookMessageHandler {
    async fn on_message(&self, conn_id: &str, msg: &Message) {
        self.hook.post(&MessageEvent { conn_id, msg }).await;
    }
}

pub struct WebhookErrorHandler {
    pub hook: Webhook,
}

#[async_trait]
impl ErrorHandler for WebhookErrorHandler {
    async fn on_error(
        &self,
        service: &str,
        username: &str,
        conn_id: &str,
        addr: &str,
        reason: &str,
    ) {
        self.hook
            .post(&ConnReasonEvent {
                service,
                username,
                conn_id,
                addr,
                reason,
            })
            .await;
    }
}

pub struct WebhookForwardHandler {
    pub hook: Webhook,
    pub max_ttl: Duration,
}

#[async_trait]
impl ForwardRequestHandler for WebhookForwardHandler {
    async fn should_forward(&self, req: &ForwardRequest) -> bool {
        self.hook.accepted(req).await
    }

    fn max_ttl(&self) -> Duration {
        self.max_ttl
    }
}

pub struct WebhookSubscribeHandler {
    pub hook: Webhook,
}

#[async_trait]
impl SubscribeHandler for WebhookSubscribeHandler {
    async fn should_subscribe(
        &self,
        service: &str,
        username: &str,
        info: &HashMap<String, String>,
    ) -> bool {
        self.hook
            .accepted(&PushRelatedEvent {
                service,
                username,
                info,
            })
            .await
    }
}

pub struct WebhookUnsubscribeHandler {
    pub hook: Webhook,
}

#[async_trait]
impl UnsubscribeHandler for WebhookUnsubscribeHandler {
    async fn on_unsubscribe(&self, service: &str, username: &str, info: &HashMap<String, String>) {
        self.hook
            .post(&PushRelatedEvent {
                service,
                username,
                info,
            })
            .await;
    }
}

pub struct WebhookPushHandler {
    pub hook: Webhook,
}

#[async_trait]
impl PushHandler for WebhookPushHandler {
    async fn should_push(
        &self,
        service: &str,
        username: &str,
        info: &HashMap<String, String>,
    ) -> bool {
        self.hook
            .accepted(&PushRelatedEvent {
                service,
                username,
                info,
            })
            .await
    }
}

pub struct WebhookAuthenticator {
    pub hook: Webhook,
}

#[async_trait]
impl Authenticator for WebhookAuthenticator {
    async fn authenticate(
        &self,
        service: &str,
        username: &str,
        token: &str,
        addr: &str,
    ) -> Result<bool> {
        Ok(self
            .hook
            .accepted(&AuthEvent {
                service,
                username,
                token,
                addr,
            })
            .await)
    }
}
