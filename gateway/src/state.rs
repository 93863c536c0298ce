//! Shared application state handed to every handler.

use std::sync::Arc;
use std::time::Instant;

use crate::config::GatewayConfig;
use crate::core::engine::TtsEngine;
use crate::metrics::Metrics;
use crate::session::{RegistryConfig, SessionRegistry};

pub struct AppState {
    pub config: GatewayConfig,
    pub engine: Arc<dyn TtsEngine>,
    pub registry: Arc<SessionRegistry>,
    pub metrics: Arc<Metrics>,
    started_at: Instant,
}

impl AppState {
    pub fn new(config: GatewayConfig, engine: Arc<dyn TtsEngine>) -> Arc<Self> {
        let registry = Arc::new(SessionRegistry::new(RegistryConfig {
            max_sessions: config.max_sessions,
            max_sessions_per_key: config.max_sessions_per_key,
            resume_grace: config.resume_grace,
        }));
        Arc::new(Self {
            config,
            engine,
            registry,
            metrics: Arc::new(Metrics::new()),
            started_at: Instant::now(),
        })
    }

    pub fn uptime_s(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::engine::{DummyEngine, DummyEngineConfig};

    #[test]
    fn test_state_wires_registry_from_config() {
        let config = GatewayConfig {
            max_sessions: 7,
            max_sessions_per_key: 3,
            ..GatewayConfig::default()
        };
        let engine = Arc::new(DummyEngine::new(DummyEngineConfig::default()));
        let state = AppState::new(config, engine);
        assert_eq!(state.registry.config().max_sessions, 7);
        assert_eq!(state.registry.config().max_sessions_per_key, 3);
        assert_eq!(state.registry.active_count(), 0);
        assert!(state.uptime_s() >= 0.0);
    }
}
