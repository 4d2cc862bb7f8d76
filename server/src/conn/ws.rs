//! WebSocket-backed connection.
//!
//! The socket is split on admission: a writer task owns the sink and forwards
//! frames from an mpsc channel, so any part of the system can deliver to the
//! client by cloning the sender; the hub's per-connection reader drives the
//! stream half through `read_message`. Frames are JSON, tagged by `type`.
//! Forward and subscribe frames never surface to the hub as messages; they
//! are dispatched to the center's channels from inside the read loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::Conn;
use crate::cache::MessageCache;
use crate::error::{HubError, Result};
use crate::message::{duration_secs, ForwardRequest, Message, SubscribeRequest};

/// Wire frames exchanged with the client.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Frame {
    /// Payload delivery, in either direction. `id` and `extra` are only set
    /// on server-to-client frames.
    Message {
        #[serde(default, skip_serializing_if = "String::is_empty")]
        id: String,
        msg: Message,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        extra: HashMap<String, String>,
    },
    /// Client-initiated relay towards another user.
    Forward {
        receiver: String,
        #[serde(default)]
        receiver_service: String,
        #[serde(with = "duration_secs")]
        ttl: Duration,
        msg: Message,
    },
    Subscribe {
        #[serde(default)]
        params: HashMap<String, String>,
    },
    Unsubscribe {
        #[serde(default)]
        params: HashMap<String, String>,
    },
}

pub struct WsConn {
    service: String,
    username: String,
    uniq_id: String,
    remote_addr: String,
    visible: bool,
    out_tx: mpsc::UnboundedSender<WsMessage>,
    reader: tokio::sync::Mutex<SplitStream<WebSocket>>,
    fwd_tx: Mutex<Option<mpsc::Sender<ForwardRequest>>>,
    sub_tx: Mutex<Option<mpsc::Sender<SubscribeRequest>>>,
    msg_cache: Mutex<Option<Arc<dyn MessageCache>>>,
    closed: AtomicBool,
}

impl WsConn {
    pub fn new(
        socket: WebSocket,
        service: impl Into<String>,
        username: impl Into<String>,
        remote_addr: impl Into<String>,
        visible: bool,
    ) -> Arc<Self> {
        let (sink, stream) = socket.split();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(sink, out_rx));

        Arc::new(Self {
            service: service.into(),
            username: username.into(),
            uniq_id: uuid::Uuid::new_v4().to_string(),
            remote_addr: remote_addr.into(),
            visible,
            out_tx,
            reader: tokio::sync::Mutex::new(stream),
            fwd_tx: Mutex::new(None),
            sub_tx: Mutex::new(None),
            msg_cache: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    fn send_frame(&self, frame: &Frame) -> Result<()> {
        let text = serde_json::to_string(frame)?;
        self.out_tx
            .send(WsMessage::Text(text.into()))
            .map_err(|_| HubError::ConnectionClosed)
    }

    /// Stamp the server-authoritative sender identity onto an inbound message.
    fn stamp_sender(&self, msg: &mut Message) {
        msg.sender = self.username.clone();
        msg.sender_service = self.service.clone();
    }

    async fn dispatch_frame(&self, frame: Frame) -> Option<Message> {
        match frame {
            Frame::Message { mut msg, .. } => {
                self.stamp_sender(&mut msg);
                Some(msg)
            }
            Frame::Forward {
                receiver,
                receiver_service,
                ttl,
                mut msg,
            } => {
                self.stamp_sender(&mut msg);
                let req = ForwardRequest {
                    receiver,
                    receiver_service: if receiver_service.is_empty() {
                        self.service.clone()
                    } else {
                        receiver_service
                    },
                    ttl,
                    msg,
                };
                let tx = self.fwd_tx.lock().expect("forward slot poisoned").clone();
                if let Some(tx) = tx {
                    let _ = tx.send(req).await;
                }
                None
            }
            Frame::Subscribe { params } => {
                self.send_subscribe(true, params).await;
                None
            }
            Frame::Unsubscribe { params } => {
                self.send_subscribe(false, params).await;
                None
            }
        }
    }

    /// Close with a specific code and reason, for handshake refusals.
    /// Does nothing when the connection is already closed.
    pub fn close_with(&self, code: u16, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.out_tx.send(WsMessage::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })));
    }

    async fn send_subscribe(&self, subscribe: bool, params: HashMap<String, String>) {
        let req = SubscribeRequest {
            service: self.service.clone(),
            username: self.username.clone(),
            subscribe,
            params,
        };
        let tx = self.sub_tx.lock().expect("subscribe slot poisoned").clone();
        if let Some(tx) = tx {
            let _ = tx.send(req).await;
        }
    }
}

#[async_trait]
impl Conn for WsConn {
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
        &self.remote_addr
    }

    fn visible(&self) -> bool {
        self.visible
    }

    async fn send_message(
        &self,
        msg: &Message,
        extra: Option<&HashMap<String, String>>,
        _ttl: Duration,
    ) -> Result<String> {
        if self.closed.load(Ordering::Acquire) {
            return Err(HubError::ConnectionClosed);
        }
        let id = uuid::Uuid::new_v4().to_string();
        self.send_frame(&Frame::Message {
            id: id.clone(),
            msg: msg.clone(),
            extra: extra.cloned().unwrap_or_default(),
        })?;
        Ok(id)
    }

    async fn read_message(&self) -> Result<Message> {
        let mut stream = self.reader.lock().await;
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(HubError::ConnectionClosed);
            }
            let frame = match stream.next().await {
                Some(Ok(WsMessage::Text(text))) => match serde_json::from_str::<Frame>(&text) {
                    Ok(frame) => frame,
                    Err(err) => {
                        tracing::debug!(
                            conn_id = %self.uniq_id,
                            error = %err,
                            "ignoring malformed frame"
                        );
                        continue;
                    }
                },
                Some(Ok(WsMessage::Binary(data))) => match serde_json::from_slice::<Frame>(&data) {
                    Ok(frame) => frame,
                    Err(err) => {
                        tracing::debug!(
                            conn_id = %self.uniq_id,
                            error = %err,
                            "ignoring malformed frame"
                        );
                        continue;
                    }
                },
                // tungstenite answers pings on its own.
                Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => continue,
                Some(Ok(WsMessage::Close(_))) | None => return Err(HubError::ConnectionClosed),
                Some(Err(err)) => return Err(HubError::Io(std::io::Error::other(err))),
            };
            if let Some(msg) = self.dispatch_frame(frame).await {
                return Ok(msg);
            }
        }
    }

    async fn close(&self) {
        // The writer task sends the close frame and stops.
        self.close_with(1000, "");
    }

    fn set_forward_channel(&self, tx: mpsc::Sender<ForwardRequest>) {
        *self.fwd_tx.lock().expect("forward slot poisoned") = Some(tx);
    }

    fn set_subscribe_channel(&self, tx: mpsc::Sender<SubscribeRequest>) {
        *self.sub_tx.lock().expect("subscribe slot poisoned") = Some(tx);
    }

    fn set_message_cache(&self, cache: Arc<dyn MessageCache>) {
        *self.msg_cache.lock().expect("cache slot poisoned") = Some(cache);
    }
}

/// Ping interval: the writer pings every 30 seconds so broken transports
/// surface as send errors instead of leaking the connection.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Forward queued frames to the socket sink until it fails, the channel
/// closes, or a close frame goes out.
async fn write_loop(
    mut sink: SplitSink<WebSocket, WsMessage>,
    mut rx: mpsc::UnboundedReceiver<WsMessage>,
) {
    let mut ping_timer = tokio::time::interval(PING_INTERVAL);
    // Skip the first immediate tick.
    ping_timer.tick().await;

    loop {
        tokio::select! {
            msg = rx.recv() => {
                let Some(msg) = msg else { break };
                let is_close = matches!(msg, WsMessage::Close(_));
                if sink.send(msg).await.is_err() {
                    break;
                }
                if is_close {
                    break;
                }
            }
            _ = ping_timer.tick() => {
                if sink.send(WsMessage::Ping(vec![1, 2, 3, 4].into())).await.is_err() {
                    break;
                }
            }
        }
    }
}
