use std::sync::Arc;

use crate::config::Config;
use crate::hub::MessageHub;

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// Per-service message centers.
    pub hub: Arc<MessageHub>,
    /// Resolved configuration, including the authenticator and the top-level
    /// error hook.
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            hub: MessageHub::new(config.clone()),
            config,
        }
    }
}
