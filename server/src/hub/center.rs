//! Per-service message center.
//!
//! All registry mutation is serialized through a single event-loop task that
//! owns the `ConnRegistry` and the live-connection counter. Callers talk to
//! the loop through bounded channels and oneshot replies; the only state
//! shared outside the loop is the push-service slot, guarded by a read-write
//! lock so in-flight fallback tasks can read it while subscribe events
//! update delivery points.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, RwLock};

use super::registry::ConnRegistry;
use crate::cache::MessageCache;
use crate::conn::Conn;
use crate::error::{HubError, Result};
use crate::hooks::{
    ErrorHandler, ForwardRequestHandler, LoginHandler, LogoutHandler, MessageHandler, PushHandler,
    SubscribeHandler, UnsubscribeHandler,
};
use crate::message::{ForwardRequest, Message, SubscribeRequest};
use crate::push::PushService;

/// Runtime configuration snapshot for one service. Everything but the
/// push-service slot is read-only after construction.
#[derive(Default)]
pub struct ServiceConfig {
    /// Global cap on live connections for the service; 0 = unlimited.
    pub max_conns: usize,
    /// Cap on users with at least one connection; 0 = unlimited.
    pub max_users: usize,
    /// Cap on connections per user; 0 = unlimited.
    pub max_conns_per_user: usize,

    pub msg_cache: Option<Arc<dyn MessageCache>>,

    pub login_handler: Option<Arc<dyn LoginHandler>>,
    pub logout_handler: Option<Arc<dyn LogoutHandler>>,
    pub message_handler: Option<Arc<dyn MessageHandler>>,
    pub forward_handler: Option<Arc<dyn ForwardRequestHandler>>,
    pub error_handler: Option<Arc<dyn ErrorHandler>>,

    pub subscribe_handler: Option<Arc<dyn SubscribeHandler>>,
    pub unsubscribe_handler: Option<Arc<dyn UnsubscribeHandler>>,
    pub push_handler: Option<Arc<dyn PushHandler>>,

    pub push_service: RwLock<Option<Arc<dyn PushService>>>,
}

impl ServiceConfig {
    /// Swap the push backend. The write lock serializes against fallback
    /// tasks holding the read side.
    pub async fn set_push_service(&self, push: Option<Arc<dyn PushService>>) {
        *self.push_service.write().await = push;
    }
}

/// Outcome of one delivery attempt to one connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
    #[serde(default, rename = "connId", skip_serializing_if = "Option::is_none")]
    pub conn_id: Option<String>,
    pub visible: bool,
}

struct JoinEvent {
    conn: Arc<dyn Conn>,
    reply: oneshot::Sender<Result<()>>,
}

struct LeaveEvent {
    conn: Arc<dyn Conn>,
    cause: HubError,
}

struct WriteRequest {
    username: String,
    msg: Message,
    extra: Option<HashMap<String, String>>,
    ttl: Duration,
    reply: oneshot::Sender<Vec<DeliveryResult>>,
}

/// Handle to a service's event loop. Cheap to clone; all operations are safe
/// from any task.
#[derive(Clone)]
pub struct ServiceCenter {
    service: String,
    config: Arc<ServiceConfig>,
    fwd_tx: mpsc::Sender<ForwardRequest>,
    join_tx: mpsc::Sender<JoinEvent>,
    leave_tx: mpsc::Sender<LeaveEvent>,
    write_tx: mpsc::Sender<WriteRequest>,
    sub_tx: mpsc::Sender<SubscribeRequest>,
}

impl ServiceCenter {
    /// Build the center and start its event loop.
    pub fn new(
        service: impl Into<String>,
        config: Arc<ServiceConfig>,
        fwd_tx: mpsc::Sender<ForwardRequest>,
    ) -> Self {
        let service = service.into();
        let (join_tx, join_rx) = mpsc::channel(1);
        let (leave_tx, leave_rx) = mpsc::channel(1);
        let (write_tx, write_rx) = mpsc::channel(1);
        let (sub_tx, sub_rx) = mpsc::channel(1);

        tokio::spawn(run_event_loop(
            service.clone(),
            config.clone(),
            join_rx,
            leave_rx,
            write_rx,
            sub_rx,
            leave_tx.clone(),
        ));

        Self {
            service,
            config,
            fwd_tx,
            join_tx,
            leave_tx,
            write_tx,
            sub_tx,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn config(&self) -> &Arc<ServiceConfig> {
        &self.config
    }

    /// Admit a connection. On success the center owns the connection's read
    /// loop and teardown; the caller must not read from it again.
    pub async fn new_conn(&self, conn: Arc<dyn Conn>) -> Result<()> {
        let username = conn.username().to_string();
        if username.is_empty() || username.contains(':') || username.contains('\n') {
            return Err(HubError::InvalidUsername(username));
        }
        if conn.service() != self.service {
            return Err(HubError::InvalidConnType);
        }

        if let Some(cache) = &self.config.msg_cache {
            conn.set_message_cache(cache.clone());
        }
        conn.set_forward_channel(self.fwd_tx.clone());
        conn.set_subscribe_channel(self.sub_tx.clone());

        let (reply_tx, reply_rx) = oneshot::channel();
        self.join_tx
            .send(JoinEvent {
                conn: conn.clone(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| HubError::HubClosed)?;
        reply_rx.await.map_err(|_| HubError::HubClosed)??;

        tokio::spawn(serve_conn(
            conn.clone(),
            self.config.clone(),
            self.leave_tx.clone(),
        ));

        if let Some(handler) = &self.config.login_handler {
            let handler = handler.clone();
            let service = self.service.clone();
            let conn = conn.clone();
            tokio::spawn(async move {
                handler
                    .on_login(&service, conn.username(), conn.uniq_id(), conn.remote_addr())
                    .await;
            });
        }

        tracing::info!(
            service = %self.service,
            username = %username,
            conn_id = conn.uniq_id(),
            addr = conn.remote_addr(),
            "connection admitted"
        );
        Ok(())
    }

    /// Deliver a message to every live connection of the user. The returned
    /// list holds one entry per connection at service time; an empty list
    /// means the user had no connections (or the center is gone).
    pub async fn send_message(
        &self,
        username: &str,
        msg: Message,
        extra: Option<HashMap<String, String>>,
        ttl: Duration,
    ) -> Vec<DeliveryResult> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let req = WriteRequest {
            username: username.to_string(),
            msg,
            extra,
            ttl,
            reply: reply_tx,
        };
        if self.write_tx.send(req).await.is_err() {
            tracing::warn!(service = %self.service, username, "write dropped, center is gone");
            return Vec::new();
        }
        reply_rx.await.unwrap_or_default()
    }

    /// Evaluate a relay request against the forward hook and, when allowed,
    /// dispatch it as a normal send with the TTL clamped to the hook's bound.
    pub async fn receive_forward(&self, mut req: ForwardRequest) {
        let Some(handler) = &self.config.forward_handler else {
            return;
        };
        let should = handler.should_forward(&req).await;
        let max_ttl = handler.max_ttl();
        if req.ttl < Duration::from_secs(1) || req.ttl > max_ttl {
            req.ttl = max_ttl;
        }
        if !should {
            return;
        }

        let receiver = req.receiver;
        let mut msg = req.msg;
        let mut extra = HashMap::new();
        push_info(&mut msg, &mut extra, true);
        self.send_message(&receiver, msg, Some(extra), req.ttl).await;
    }
}

/// Build the push-notification info map from a message.
///
/// Copies `notif.`-prefixed headers into `extra`, skipping the reserved
/// `notif.uniqush.` namespace. In forward mode the copied headers are removed
/// from the message and the sender identity is recorded. The `title` header
/// becomes `notif.msg` unless already set, and the payload size is always
/// recorded. Re-invoking with the same message and map is a no-op.
pub fn push_info(msg: &mut Message, extra: &mut HashMap<String, String>, fwd: bool) {
    if fwd {
        let keys: Vec<String> = msg
            .header
            .keys()
            .filter(|k| k.starts_with("notif."))
            .cloned()
            .collect();
        for key in keys {
            if key.starts_with("notif.uniqush.") {
                continue;
            }
            if let Some(value) = msg.header.remove(&key) {
                extra.insert(key, value);
            }
        }
        extra.insert("uniqush.sender".to_string(), msg.sender.clone());
        extra.insert(
            "uniqush.sender-service".to_string(),
            msg.sender_service.clone(),
        );
    }
    if let Some(title) = msg.title() {
        if !extra.contains_key("notif.msg") {
            extra.insert("notif.msg".to_string(), title.to_string());
        }
    }
    extra.insert(
        "notif.uniqush.msgsize".to_string(),
        msg.size().to_string(),
    );
}

/// Read inbound messages until the connection fails, then post its leave.
async fn serve_conn(
    conn: Arc<dyn Conn>,
    config: Arc<ServiceConfig>,
    leave_tx: mpsc::Sender<LeaveEvent>,
) {
    let cause = loop {
        match conn.read_message().await {
            Ok(msg) => {
                if let Some(handler) = &config.message_handler {
                    let handler = handler.clone();
                    let conn_id = conn.uniq_id().to_string();
                    tokio::spawn(async move {
                        handler.on_message(&conn_id, &msg).await;
                    });
                }
            }
            Err(err) => break err,
        }
    };
    let _ = leave_tx.send(LeaveEvent { conn, cause }).await;
}

#[allow(clippy::too_many_arguments)]
async fn run_event_loop(
    service: String,
    config: Arc<ServiceConfig>,
    mut join_rx: mpsc::Receiver<JoinEvent>,
    mut leave_rx: mpsc::Receiver<LeaveEvent>,
    mut write_rx: mpsc::Receiver<WriteRequest>,
    mut sub_rx: mpsc::Receiver<SubscribeRequest>,
    leave_tx: mpsc::Sender<LeaveEvent>,
) {
    let mut registry = ConnRegistry::new();
    let mut nr_conns: usize = 0;

    // The loop keeps its own leave sender alive for error-set teardown, so
    // shutdown is driven by the join/write/subscribe sides closing.
    loop {
        tokio::select! {
            evt = join_rx.recv() => {
                let Some(evt) = evt else { break };
                handle_join(evt, &mut registry, &mut nr_conns, &config);
            }
            evt = leave_rx.recv() => {
                if let Some(evt) = evt {
                    handle_leave(evt, &mut registry, &mut nr_conns, &service, &config).await;
                }
            }
            req = sub_rx.recv() => {
                let Some(req) = req else { break };
                handle_subscribe(req, &config).await;
            }
            req = write_rx.recv() => {
                let Some(req) = req else { break };
                handle_write(req, &registry, &service, &config, &leave_tx).await;
            }
        }
    }
    tracing::debug!(service, "service center event loop stopped");
}

fn handle_join(
    evt: JoinEvent,
    registry: &mut ConnRegistry,
    nr_conns: &mut usize,
    config: &ServiceConfig,
) {
    if config.max_conns > 0 && *nr_conns >= config.max_conns {
        let _ = evt.reply.send(Err(HubError::TooManyConns));
        return;
    }
    let before = registry.nr_conns();
    match registry.add_conn(evt.conn, config.max_conns_per_user, config.max_users) {
        Ok(()) => {
            // Idempotent re-adds leave the registry, and the counter, alone.
            if registry.nr_conns() > before {
                *nr_conns += 1;
            }
            let _ = evt.reply.send(Ok(()));
        }
        Err(err) => {
            let _ = evt.reply.send(Err(err));
        }
    }
}

async fn handle_leave(
    evt: LeaveEvent,
    registry: &mut ConnRegistry,
    nr_conns: &mut usize,
    service: &str,
    config: &ServiceConfig,
) {
    let deleted = registry.del_conn(evt.conn.as_ref());
    tracing::debug!(
        service,
        username = evt.conn.username(),
        conn_id = evt.conn.uniq_id(),
        deleted,
        cause = %evt.cause,
        "connection leaving"
    );
    // del_conn returning false means another leave already tore this
    // connection down; close and logout fire at most once.
    if !deleted {
        return;
    }
    evt.conn.close().await;
    *nr_conns -= 1;
    if let Some(handler) = &config.logout_handler {
        let handler = handler.clone();
        let service = service.to_string();
        let conn = evt.conn;
        let reason = evt.cause.to_string();
        tokio::spawn(async move {
            handler
                .on_logout(
                    &service,
                    conn.username(),
                    conn.uniq_id(),
                    conn.remote_addr(),
                    &reason,
                )
                .await;
        });
    }
}

async fn handle_subscribe(req: SubscribeRequest, config: &ServiceConfig) {
    if req.subscribe {
        if let Some(handler) = &config.subscribe_handler {
            if !handler
                .should_subscribe(&req.service, &req.username, &req.params)
                .await
            {
                return;
            }
        }
    }

    {
        let guard = config.push_service.write().await;
        let Some(push) = guard.as_ref() else { return };
        let result = if req.subscribe {
            push.subscribe(&req.service, &req.username, &req.params).await
        } else {
            push.unsubscribe(&req.service, &req.username, &req.params)
                .await
        };
        if let Err(err) = result {
            tracing::warn!(
                service = %req.service,
                username = %req.username,
                subscribe = req.subscribe,
                error = %err,
                "push backend subscription update failed"
            );
        }
    }

    if !req.subscribe {
        if let Some(handler) = &config.unsubscribe_handler {
            let handler = handler.clone();
            tokio::spawn(async move {
                handler
                    .on_unsubscribe(&req.service, &req.username, &req.params)
                    .await;
            });
        }
    }
}

async fn handle_write(
    req: WriteRequest,
    registry: &ConnRegistry,
    service: &str,
    config: &Arc<ServiceConfig>,
    leave_tx: &mpsc::Sender<LeaveEvent>,
) {
    // Recipients are exactly the registry snapshot at service time.
    let conns: Vec<Arc<dyn Conn>> = registry.get_conn(&req.username).to_vec();
    let mut results = Vec::with_capacity(conns.len());
    let mut err_conns: Vec<(Arc<dyn Conn>, HubError)> = Vec::new();
    let mut reached = 0usize;

    for conn in conns {
        match conn.send_message(&req.msg, req.extra.as_ref(), req.ttl).await {
            Ok(_) => {
                results.push(DeliveryResult {
                    err: None,
                    conn_id: Some(conn.uniq_id().to_string()),
                    visible: conn.visible(),
                });
                if conn.visible() {
                    reached += 1;
                }
            }
            Err(err) => {
                results.push(DeliveryResult {
                    err: Some(err.to_string()),
                    conn_id: Some(conn.uniq_id().to_string()),
                    visible: conn.visible(),
                });
                report_error(config, service, &conn, &err);
                err_conns.push((conn, err));
            }
        }
    }

    if reached == 0 {
        spawn_push_fallback(
            service,
            config,
            req.username.clone(),
            req.msg.clone(),
            req.extra.clone(),
            req.ttl,
        );
    }

    let _ = req.reply.send(results);

    // Tear the errored connections down through the leave channel from a
    // separate task, so the loop is free to service the leaves.
    if !err_conns.is_empty() {
        let leave_tx = leave_tx.clone();
        tokio::spawn(async move {
            for (conn, cause) in err_conns {
                let _ = leave_tx.send(LeaveEvent { conn, cause }).await;
            }
        });
    }
}

fn report_error(config: &ServiceConfig, service: &str, conn: &Arc<dyn Conn>, err: &HubError) {
    if let Some(handler) = &config.error_handler {
        let handler = handler.clone();
        let service = service.to_string();
        let conn = conn.clone();
        let reason = err.to_string();
        tokio::spawn(async move {
            handler
                .on_error(
                    &service,
                    conn.username(),
                    conn.uniq_id(),
                    conn.remote_addr(),
                    &reason,
                )
                .await;
        });
    }
}

/// Best-effort path for a message that reached no visible connection: cache
/// one copy per delivery point, then hand the ids to the push backend.
fn spawn_push_fallback(
    service: &str,
    config: &Arc<ServiceConfig>,
    username: String,
    msg: Message,
    extra: Option<HashMap<String, String>>,
    ttl: Duration,
) {
    let fwd = !msg.sender.is_empty()
        && !msg.sender_service.is_empty()
        && (msg.sender != username || msg.sender_service != service);
    let service = service.to_string();
    let config = config.clone();

    tokio::spawn(async move {
        let mut msg = msg;
        let mut info = extra.unwrap_or_default();
        push_info(&mut msg, &mut info, fwd);

        let Some(push_hook) = &config.push_handler else {
            return;
        };
        if !push_hook.should_push(&service, &username, &info).await {
            return;
        }

        let guard = config.push_service.read().await;
        let Some(push) = guard.as_ref() else { return };
        let n = push.nr_delivery_points(&service, &username).await;
        if n == 0 {
            return;
        }
        let Some(cache) = &config.msg_cache else { return };

        let mut msg_ids = Vec::with_capacity(n);
        for _ in 0..n {
            match cache.cache_message(&service, &username, &msg, ttl).await {
                Ok(id) => msg_ids.push(id),
                Err(err) => {
                    // A single failed allocation abandons the whole fan-out.
                    tracing::warn!(
                        service,
                        username,
                        error = %err,
                        "message cache failed, dropping push fallback"
                    );
                    return;
                }
            }
        }

        if let Err(err) = push.push(&service, &username, &info, &msg_ids).await {
            if let Some(handler) = &config.error_handler {
                handler
                    .on_error(&service, &username, "", "", &err.to_string())
                    .await;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg_with_headers(pairs: &[(&str, &str)]) -> Message {
        let mut msg = Message::new(b"hello".to_vec());
        for (k, v) in pairs {
            msg.header.insert(k.to_string(), v.to_string());
        }
        msg
    }

    #[test]
    fn forward_copies_notif_headers_and_strips_them() {
        let mut msg = msg_with_headers(&[
            ("notif.sound", "ding"),
            ("notif.uniqush.internal", "x"),
            ("other", "kept"),
        ]);
        msg.sender = "alice".to_string();
        msg.sender_service = "web".to_string();
        let mut extra = HashMap::new();
        push_info(&mut msg, &mut extra, true);

        assert_eq!(extra.get("notif.sound").map(String::as_str), Some("ding"));
        assert!(!extra.contains_key("notif.uniqush.internal"));
        assert_eq!(extra.get("uniqush.sender").map(String::as_str), Some("alice"));
        assert_eq!(
            extra.get("uniqush.sender-service").map(String::as_str),
            Some("web")
        );
        // Copied headers leave the message; reserved and unrelated ones stay.
        assert!(!msg.header.contains_key("notif.sound"));
        assert!(msg.header.contains_key("notif.uniqush.internal"));
        assert!(msg.header.contains_key("other"));
    }

    #[test]
    fn title_fills_notif_msg_unless_set() {
        let mut msg = msg_with_headers(&[("title", "greetings")]);
        let mut extra = HashMap::new();
        push_info(&mut msg, &mut extra, false);
        assert_eq!(extra.get("notif.msg").map(String::as_str), Some("greetings"));

        let mut msg = msg_with_headers(&[("title", "greetings")]);
        let mut extra = HashMap::new();
        extra.insert("notif.msg".to_string(), "preset".to_string());
        push_info(&mut msg, &mut extra, false);
        assert_eq!(extra.get("notif.msg").map(String::as_str), Some("preset"));
    }

    #[test]
    fn msgsize_always_recorded() {
        let mut msg = Message::new(vec![0u8; 42]);
        let mut extra = HashMap::new();
        push_info(&mut msg, &mut extra, false);
        assert_eq!(
            extra.get("notif.uniqush.msgsize").map(String::as_str),
            Some("42")
        );
    }

    #[test]
    fn synthesis_is_idempotent() {
        let mut msg = msg_with_headers(&[("notif.sound", "ding"), ("title", "hi")]);
        msg.sender = "alice".to_string();
        msg.sender_service = "web".to_string();
        let mut extra = HashMap::new();

        push_info(&mut msg, &mut extra, true);
        let first = extra.clone();
        let header_first = msg.header.clone();

        push_info(&mut msg, &mut extra, true);
        assert_eq!(extra, first);
        assert_eq!(msg.header, header_first);
    }
}
