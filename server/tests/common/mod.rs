//! Shared test doubles for the hub integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use courier_server::cache::MessageCache;
use courier_server::conn::Conn;
use courier_server::error::{HubError, Result};
use courier_server::hooks::{
    Authenticator, ErrorHandler, ForwardRequestHandler, LoginHandler, LogoutHandler,
    MessageHandler, PushHandler,
};
use courier_server::message::{ForwardRequest, Message, SubscribeRequest};
use courier_server::push::PushService;

/// In-memory connection driven by the test: inbound messages are fed through
/// the returned sender, outbound deliveries are recorded.
pub struct MockConn {
    service: String,
    username: String,
    uniq_id: String,
    visible: bool,
    fail_sends: AtomicBool,
    pub sent: Mutex<Vec<(Message, Option<HashMap<String, String>>, Duration)>>,
    pub close_count: AtomicUsize,
    pub fwd_tx: Mutex<Option<mpsc::Sender<ForwardRequest>>>,
    pub sub_tx: Mutex<Option<mpsc::Sender<SubscribeRequest>>>,
    read_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>,
}

impl MockConn {
    /// Returns the connection and the sender that feeds its inbound stream.
    /// Dropping the sender terminates the connection's read loop.
    pub fn new(
        service: &str,
        username: &str,
        uniq_id: &str,
        visible: bool,
    ) -> (Arc<Self>, mpsc::UnboundedSender<Message>) {
        let (read_tx, read_rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Self {
            service: service.to_string(),
            username: username.to_string(),
            uniq_id: uniq_id.to_string(),
            visible,
            fail_sends: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            close_count: AtomicUsize::new(0),
            fwd_tx: Mutex::new(None),
            sub_tx: Mutex::new(None),
            read_rx: tokio::sync::Mutex::new(read_rx),
        });
        (conn, read_tx)
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn closes(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Conn for MockConn {
    fn service(&self) -> &str {
        &self.service
    }
    fn username(&self) -> &str {
        &self.username
    }
    fn uniq_id(&self) -> &str {
        &self.uniq_id
    }
    fn remote_addr(&self) -> &str {
        "127.0.0.1:9"
    }
    fn visible(&self) -> bool {
        self.visible
    }

    async fn send_message(
        &self,
        msg: &Message,
        extra: Option<&HashMap<String, String>>,
        ttl: Duration,
    ) -> Result<String> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(HubError::ConnectionClosed);
        }
        self.sent
            .lock()
            .unwrap()
            .push((msg.clone(), extra.cloned(), ttl));
        Ok(format!("{}-{}", self.uniq_id, self.sent_count()))
    }

    async fn read_message(&self) -> Result<Message> {
        let mut rx = self.read_rx.lock().await;
        rx.recv().await.ok_or(HubError::ConnectionClosed)
    }

    async fn close(&self) {
        self.close_count.fetch_add(1, Ordering::SeqCst);
    }

    fn set_forward_channel(&self, tx: mpsc::Sender<ForwardRequest>) {
        *self.fwd_tx.lock().unwrap() = Some(tx);
    }

    fn set_subscribe_channel(&self, tx: mpsc::Sender<SubscribeRequest>) {
        *self.sub_tx.lock().unwrap() = Some(tx);
    }

    fn set_message_cache(&self, _cache: Arc<dyn MessageCache>) {}
}

/// Cache that hands out sequential ids, optionally failing every call.
#[derive(Default)]
pub struct MockCache {
    counter: AtomicUsize,
    pub fail: AtomicBool,
    pub stored: Mutex<Vec<(String, String, Duration)>>,
}

impl MockCache {
    pub fn cached_count(&self) -> usize {
        self.stored.lock().unwrap().len()
    }
}

#[async_trait]
impl MessageCache for MockCache {
    async fn cache_message(
        &self,
        service: &str,
        username: &str,
        _msg: &Message,
        ttl: Duration,
    ) -> Result<String> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(HubError::Cache("cache down".to_string()));
        }
        let id = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.stored
            .lock()
            .unwrap()
            .push((service.to_string(), username.to_string(), ttl));
        Ok(id.to_string())
    }
}

/// Push backend with a configurable delivery-point count.
pub struct MockPush {
    pub nr_dp: AtomicUsize,
    pub pushes: Mutex<Vec<(String, String, HashMap<String, String>, Vec<String>)>>,
    pub subscriptions: Mutex<Vec<(String, String, bool)>>,
}

impl MockPush {
    pub fn new(nr_dp: usize) -> Arc<Self> {
        Arc::new(Self {
            nr_dp: AtomicUsize::new(nr_dp),
            pushes: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
        })
    }

    pub fn push_count(&self) -> usize {
        self.pushes.lock().unwrap().len()
    }
}

#[async_trait]
impl PushService for MockPush {
    async fn subscribe(
        &self,
        service: &str,
        username: &str,
        _params: &HashMap<String, String>,
    ) -> Result<()> {
        self.subscriptions
            .lock()
            .unwrap()
            .push((service.to_string(), username.to_string(), true));
        Ok(())
    }

    async fn unsubscribe(
        &self,
        service: &str,
        username: &str,
        _params: &HashMap<String, String>,
    ) -> Result<()> {
        self.subscriptions
            .lock()
            .unwrap()
            .push((service.to_string(), username.to_string(), false));
        Ok(())
    }

    async fn nr_delivery_points(&self, _service: &str, _username: &str) -> usize {
        self.nr_dp.load(Ordering::SeqCst)
    }

    async fn push(
        &self,
        service: &str,
        username: &str,
        info: &HashMap<String, String>,
        msg_ids: &[String],
    ) -> Result<()> {
        self.pushes.lock().unwrap().push((
            service.to_string(),
            username.to_string(),
            info.clone(),
            msg_ids.to_vec(),
        ));
        Ok(())
    }
}

/// Fixed-answer push decision hook.
pub struct StaticPushHandler {
    pub allow: bool,
}

#[async_trait]
impl PushHandler for StaticPushHandler {
    async fn should_push(
        &self,
        _service: &str,
        _username: &str,
        _info: &HashMap<String, String>,
    ) -> bool {
        self.allow
    }
}

/// Fixed-answer forward decision hook with a configurable TTL bound.
pub struct StaticForwardHandler {
    pub allow: bool,
    pub max_ttl: Duration,
}

#[async_trait]
impl ForwardRequestHandler for StaticForwardHandler {
    async fn should_forward(&self, _req: &ForwardRequest) -> bool {
        self.allow
    }

    fn max_ttl(&self) -> Duration {
        self.max_ttl
    }
}

/// Records logout events as (conn_id, reason).
#[derive(Default)]
pub struct RecordingLogoutHandler {
    pub events: Mutex<Vec<(String, String)>>,
}

impl RecordingLogoutHandler {
    pub fn count(&self) -> usize {
        self.events.lock().unwrap().len()
    }
}

#[async_trait]
impl LogoutHandler for RecordingLogoutHandler {
    async fn on_logout(
        &self,
        _service: &str,
        _username: &str,
        conn_id: &str,
        _addr: &str,
        reason: &str,
    ) {
        self.events
            .lock()
            .unwrap()
            .push((conn_id.to_string(), reason.to_string()));
    }
}

/// Records login events as conn ids.
#[derive(Default)]
pub struct RecordingLoginHandler {
    pub events: Mutex<Vec<String>>,
}

#[async_trait]
impl LoginHandler for RecordingLoginHandler {
    async fn on_login(&self, _service: &str, _username: &str, conn_id: &str, _addr: &str) {
        self.events.lock().unwrap().push(conn_id.to_string());
    }
}

/// Records error events as (conn_id, reason).
#[derive(Default)]
pub struct RecordingErrorHandler {
    pub events: Mutex<Vec<(String, String)>>,
}

impl RecordingErrorHandler {
    pub fn count(&self) -> usize {
        self.events.lock().unwrap().len()
    }
}

#[async_trait]
impl ErrorHandler for RecordingErrorHandler {
    async fn on_error(
        &self,
        _service: &str,
        _username: &str,
        conn_id: &str,
        _addr: &str,
        reason: &str,
    ) {
        self.events
            .lock()
            .unwrap()
            .push((conn_id.to_string(), reason.to_string()));
    }
}

/// Records inbound-message events as (conn_id, body).
#[derive(Default)]
pub struct RecordingMessageHandler {
    pub events: Mutex<Vec<(String, Vec<u8>)>>,
}

#[async_trait]
impl MessageHandler for RecordingMessageHandler {
    async fn on_message(&self, conn_id: &str, msg: &Message) {
        self.events
            .lock()
            .unwrap()
            .push((conn_id.to_string(), msg.body.clone()));
    }
}

/// Authenticator that accepts or rejects everyone.
pub struct StaticAuthenticator {
    pub allow: bool,
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn authenticate(
        &self,
        _service: &str,
        _username: &str,
        _token: &str,
        _addr: &str,
    ) -> Result<bool> {
        Ok(self.allow)
    }
}

/// Poll until the condition holds, panicking after a second.
pub async fn wait_for(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}
