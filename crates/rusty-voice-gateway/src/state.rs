//! Gateway shared state.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use rusty_voice_core::config::Config;

use crate::pipeline::PipelineFactory;

/// Shared gateway state accessible from all connections and handlers.
pub struct GatewayState {
    pub config: Arc<Config>,
    pub pipeline: Arc<PipelineFactory>,
    pub sessions: RwLock<HashMap<String, SessionInfo>>,
    #[cfg(feature = "prometheus")]
    pub prometheus: Option<metrics_exporter_prometheus::PrometheusHandle>,
}

/// Per-connection bookkeeping for `/health`.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub conn_id: String,
    pub session_id: String,
    pub connected_at: DateTime<Utc>,
}

impl GatewayState {
    pub fn new(config: Arc<Config>, pipeline: Arc<PipelineFactory>) -> Self {
        Self {
            config,
            pipeline,
            sessions: RwLock::new(HashMap::new()),
            #[cfg(feature = "prometheus")]
            prometheus: None,
        }
    }

    /// Attach a Prometheus handle so `/metrics` can render it.
    #[cfg(feature = "prometheus")]
    pub fn with_prometheus(
        mut self,
        handle: metrics_exporter_prometheus::PrometheusHandle,
    ) -> Self {
        self.prometheus = Some(handle);
        self
    }

    pub async fn active_sessions(&self) -> usize {
        self.sessions.read().await.len()
    }
}
