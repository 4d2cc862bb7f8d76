//! The message hub: one event-serialized center per service.
//!
//! Centers are created lazily from the configuration the first time a
//! service is touched. All centers share one forward-request channel; a
//! routing task dispatches each relay to the receiver service's center.

pub mod center;
pub mod registry;

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::conn::Conn;
use crate::error::Result;
use crate::message::{ForwardRequest, Message};

pub use center::{push_info, DeliveryResult, ServiceCenter, ServiceConfig};
pub use registry::ConnRegistry;

pub struct MessageHub {
    config: Arc<Config>,
    centers: DashMap<String, ServiceCenter>,
    fwd_tx: mpsc::Sender<ForwardRequest>,
}

impl MessageHub {
    pub fn new(config: Arc<Config>) -> Arc<Self> {
        let (fwd_tx, fwd_rx) = mpsc::channel(1);
        let hub = Arc::new(Self {
            config,
            centers: DashMap::new(),
            fwd_tx,
        });
        tokio::spawn(route_forwards(Arc::downgrade(&hub), fwd_rx));
        hub
    }

    /// The center for a service, created on first use. Services without an
    /// explicit configuration share the default service config.
    pub fn center(&self, service: &str) -> ServiceCenter {
        self.centers
            .entry(service.to_string())
            .or_insert_with(|| {
                tracing::info!(service, "starting service center");
                ServiceCenter::new(
                    service,
                    self.config.service_config(service),
                    self.fwd_tx.clone(),
                )
            })
            .clone()
    }

    /// Admit a connection to the center of its own service.
    pub async fn new_conn(&self, conn: Arc<dyn Conn>) -> Result<()> {
        self.center(conn.service()).new_conn(conn).await
    }

    /// Deliver a message to every live connection of the user in a service.
    pub async fn send_message(
        &self,
        service: &str,
        username: &str,
        msg: Message,
        extra: Option<HashMap<String, String>>,
        ttl: Duration,
    ) -> Vec<DeliveryResult> {
        self.center(service)
            .send_message(username, msg, extra, ttl)
            .await
    }

    /// Service names with an explicit configuration.
    pub fn all_services(&self) -> Vec<String> {
        self.config.all_services()
    }
}

/// Dispatch relay requests to the receiver service's center. Holds the hub
/// weakly so dropping the last handle shuts the router down.
async fn route_forwards(hub: Weak<MessageHub>, mut fwd_rx: mpsc::Receiver<ForwardRequest>) {
    while let Some(req) = fwd_rx.recv().await {
        let Some(hub) = hub.upgrade() else { break };
        if req.receiver_service.is_empty() {
            tracing::debug!(receiver = %req.receiver, "forward request without a service, dropped");
            continue;
        }
        let center = hub.center(&req.receiver_service);
        center.receive_forward(req).await;
    }
}
