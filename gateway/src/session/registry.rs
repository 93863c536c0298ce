//! Process-wide session registry with admission control and orphan reaping.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, info};

use super::{AdoptError, RetainedChunk, Session, SessionState};

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Global cap on concurrent sessions.
    pub max_sessions: usize,
    /// Cap per API key (unauthenticated sessions share one bucket).
    pub max_sessions_per_key: usize,
    /// How long an ORPHAN may wait for `resume`.
    pub resume_grace: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_sessions: 1000,
            max_sessions_per_key: 50,
            resume_grace: Duration::from_secs(30),
        }
    }
}

/// Why a new session was refused at the front door.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("session capacity exhausted")]
    CapacityExhausted,
    #[error("session_id '{0}' already active")]
    DuplicateSession(String),
}

/// Bucket key for per-key admission counting.
const ANONYMOUS_KEY: &str = "";

pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
    per_key: DashMap<String, usize>,
    config: RegistryConfig,
}

impl SessionRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            per_key: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    /// Registers a new session, enforcing the global and per-key caps.
    pub fn insert(&self, session: Arc<Session>) -> Result<(), AdmissionError> {
        if self.sessions.len() >= self.config.max_sessions {
            return Err(AdmissionError::CapacityExhausted);
        }

        let key = session
            .api_key_id
            .clone()
            .unwrap_or_else(|| ANONYMOUS_KEY.to_string());
        {
            let mut count = self.per_key.entry(key.clone()).or_insert(0);
            if *count >= self.config.max_sessions_per_key {
                return Err(AdmissionError::CapacityExhausted);
            }
            *count += 1;
        }

        match self.sessions.entry(session.session_id.clone()) {
            Entry::Occupied(_) => {
                self.release_key(&key);
                Err(AdmissionError::DuplicateSession(session.session_id.clone()))
            }
            Entry::Vacant(slot) => {
                debug!(session_id = %session.session_id, "session registered");
                slot.insert(session);
                Ok(())
            }
        }
    }

    pub fn lookup(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    /// Atomically re-attaches an orphaned session: returns the session and
    /// the retained chunks to replay, or the reason adoption is impossible.
    pub fn adopt(
        &self,
        session_id: &str,
        last_unit_index: u64,
    ) -> Result<(Arc<Session>, Vec<RetainedChunk>), AdoptError> {
        let session = self.lookup(session_id).ok_or(AdoptError::NotFound)?;
        let replay = session.try_adopt(last_unit_index)?;
        info!(
            session_id,
            replay_chunks = replay.len(),
            "orphaned session adopted"
        );
        Ok((session, replay))
    }

    /// Drops a session from the registry, releasing its admission slot.
    pub fn remove(&self, session_id: &str) {
        if let Some((_, session)) = self.sessions.remove(session_id) {
            let key = session
                .api_key_id
                .clone()
                .unwrap_or_else(|| ANONYMOUS_KEY.to_string());
            self.release_key(&key);
            debug!(session_id, "session removed from registry");
        }
    }

    /// Sweeps orphans whose grace window expired; returns how many died.
    pub fn reap_expired(&self) -> usize {
        let grace = self.config.resume_grace;
        let expired: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .filter(|entry| {
                entry.value().state() == SessionState::Orphan
                    && entry.value().orphan_expired(grace)
            })
            .map(|entry| entry.value().clone())
            .collect();

        for session in &expired {
            info!(session_id = %session.session_id, "reaping expired orphan");
            session.force_close();
            self.remove(&session.session_id);
        }
        expired.len()
    }

    /// Spawns the periodic orphan sweep.
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                registry.reap_expired();
            }
        })
    }

    fn release_key(&self, key: &str) {
        if let Some(mut count) = self.per_key.get_mut(key) {
            *count = count.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::audio::{AudioFormat, AudioSpec};
    use crate::session::RetentionRing;
    use tokio::sync::mpsc;

    fn make_session(id: &str, key: Option<&str>) -> Arc<Session> {
        let (out_tx, _out_rx) = mpsc::channel(4);
        let (text_tx, _text_rx) = mpsc::channel(4);
        // Keep receivers alive in tests that only exercise the registry.
        std::mem::forget(_out_rx);
        std::mem::forget(_text_rx);
        Arc::new(Session::new(
            id.to_string(),
            key.map(str::to_string),
            AudioSpec {
                audio_format: AudioFormat::Pcm16Raw,
                sample_rate: 16000,
                channels: 1,
            },
            out_tx,
            text_tx,
            RetentionRing::new(8, Duration::from_secs(30)),
        ))
    }

    fn registry(max_sessions: usize, per_key: usize) -> SessionRegistry {
        SessionRegistry::new(RegistryConfig {
            max_sessions,
            max_sessions_per_key: per_key,
            resume_grace: Duration::from_secs(30),
        })
    }

    #[test]
    fn test_insert_lookup_remove() {
        let registry = registry(10, 10);
        registry.insert(make_session("a", None)).unwrap();
        assert_eq!(registry.active_count(), 1);
        assert!(registry.lookup("a").is_some());
        registry.remove("a");
        assert!(registry.lookup("a").is_none());
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn test_duplicate_session_rejected() {
        let registry = registry(10, 10);
        registry.insert(make_session("a", None)).unwrap();
        let err = registry.insert(make_session("a", None)).unwrap_err();
        assert_eq!(err, AdmissionError::DuplicateSession("a".into()));
        // The failed insert must not leak an admission slot.
        registry.remove("a");
        for i in 0..10 {
            registry
                .insert(make_session(&format!("s{i}"), None))
                .unwrap();
        }
    }

    #[test]
    fn test_global_cap() {
        let registry = registry(2, 10);
        registry.insert(make_session("a", None)).unwrap();
        registry.insert(make_session("b", None)).unwrap();
        assert_eq!(
            registry.insert(make_session("c", None)).unwrap_err(),
            AdmissionError::CapacityExhausted
        );
        registry.remove("a");
        registry.insert(make_session("c", None)).unwrap();
    }

    #[test]
    fn test_per_key_cap_isolated_between_keys() {
        let registry = registry(100, 1);
        registry.insert(make_session("a", Some("alice"))).unwrap();
        assert_eq!(
            registry.insert(make_session("b", Some("alice"))).unwrap_err(),
            AdmissionError::CapacityExhausted
        );
        // Other keys are unaffected.
        registry.insert(make_session("c", Some("bob"))).unwrap();
    }

    #[test]
    fn test_adopt_unknown_session() {
        let registry = registry(10, 10);
        assert_eq!(registry.adopt("ghost", 0).err(), Some(AdoptError::NotFound));
    }

    #[test]
    fn test_reap_only_expired_orphans() {
        let registry = registry(10, 10);
        let live = make_session("live", None);
        live.transition_to(SessionState::Running);
        registry.insert(live).unwrap();

        let orphan = make_session("orphan", None);
        orphan.transition_to(SessionState::Running);
        orphan.mark_orphan();
        registry.insert(orphan.clone()).unwrap();

        // Grace has not passed for a fresh orphan.
        assert_eq!(registry.reap_expired(), 0);

        let registry_zero_grace = SessionRegistry::new(RegistryConfig {
            resume_grace: Duration::ZERO,
            ..RegistryConfig::default()
        });
        registry_zero_grace.insert(orphan.clone()).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(registry_zero_grace.reap_expired(), 1);
        assert_eq!(orphan.state(), SessionState::Closed);
        assert!(orphan.cancel.is_cancelled());
    }
}
