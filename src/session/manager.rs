//! LIFO pool of per-orchestrator sessions for one stream.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::SessionPoolConfig;
use crate::traits::StorageSession;
use crate::types::OrchestratorInfo;

/// A handle to one orchestrator for the duration of a stream.
#[derive(Clone)]
pub struct BroadcastSession {
    pub orchestrator: OrchestratorInfo,
    pub broadcaster_storage: Arc<dyn StorageSession>,
    pub orchestrator_storage: Option<Arc<dyn StorageSession>>,
}

impl BroadcastSession {
    pub fn transport_addr(&self) -> &str {
        &self.orchestrator.transport_addr
    }
}

/// Pluggable callback that fetches fresh sessions from orchestrator
/// discovery. Kept out of this module because actually doing so requires
/// network I/O and ticket issuance that live outside this core.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create_sessions(&self, count: usize) -> Vec<BroadcastSession>;
}

struct Inner {
    sess_list: Vec<BroadcastSession>,
    sess_map: HashMap<String, BroadcastSession>,
    refreshing: bool,
    finished: bool,
}

/// Owns the live pool of [`BroadcastSession`]s for one stream.
pub struct SessionManager {
    inner: Mutex<Inner>,
    config: SessionPoolConfig,
    factory: Arc<dyn SessionFactory>,
}

impl SessionManager {
    pub fn new(config: SessionPoolConfig, factory: Arc<dyn SessionFactory>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                sess_list: Vec::new(),
                sess_map: HashMap::new(),
                refreshing: false,
                finished: false,
            }),
            config,
            factory,
        })
    }

    /// Pops the most recently completed session (LIFO), triggering an
    /// asynchronous refresh if the pool has dropped below half of its
    /// target size. Returns `None` if the pool is empty.
    pub fn select_session(self: &Arc<Self>) -> Option<BroadcastSession> {
        let (popped, below_threshold) = {
            let mut inner = self.inner.lock().expect("session manager mutex poisoned");
            let popped = inner.sess_list.pop();
            let below = inner.sess_list.len() < self.config.refresh_threshold();
            if popped.is_some() {
                debug!(
                    remaining = inner.sess_list.len(),
                    "selected session from pool"
                );
            }
            (popped, below)
        };
        if below_threshold {
            self.spawn_refresh();
        }
        popped
    }

    fn spawn_refresh(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.refresh_sessions().await;
        });
    }

    /// Returns `session` to the tail of the pool iff it is still a member of
    /// `sess_map` (i.e. was not concurrently removed).
    pub fn complete_session(&self, session: BroadcastSession) {
        let mut inner = self.inner.lock().expect("session manager mutex poisoned");
        if inner.sess_map.contains_key(session.transport_addr()) {
            inner.sess_list.push(session);
        } else {
            debug!("dropping completed session removed concurrently");
        }
    }

    /// Removes a session from the membership map. Orphaned pool entries are
    /// filtered out lazily at `complete_session` time.
    pub fn remove_session(&self, session: &BroadcastSession) {
        let mut inner = self.inner.lock().expect("session manager mutex poisoned");
        inner.sess_map.remove(session.transport_addr());
    }

    /// Fetches fresh sessions via the pluggable factory without holding the
    /// lock across that call, then merges in any that aren't already
    /// members.
    pub async fn refresh_sessions(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock().expect("session manager mutex poisoned");
            if inner.refreshing || inner.finished {
                return;
            }
            inner.refreshing = true;
        }

        let fetched = self.factory.create_sessions(self.config.target_pool_size()).await;

        let mut inner = self.inner.lock().expect("session manager mutex poisoned");
        inner.refreshing = false;
        if inner.finished || fetched.is_empty() {
            return;
        }
        let mut added = 0;
        for session in fetched.into_iter().rev() {
            let addr = session.transport_addr().to_string();
            if inner.sess_map.contains_key(&addr) {
                continue;
            }
            inner.sess_map.insert(addr, session.clone());
            inner.sess_list.insert(0, session);
            added += 1;
        }
        if added > 0 {
            debug!(added, "refreshed session pool");
        } else {
            warn!("refresh returned only sessions already in the pool");
        }
    }

    /// Tears the pool down: no further sessions will be selected, completed,
    /// or refreshed.
    pub fn cleanup(&self) {
        let mut inner = self.inner.lock().expect("session manager mutex poisoned");
        inner.finished = true;
        inner.sess_list.clear();
        inner.sess_map = HashMap::new();
    }

    pub fn current_sessions(&self) -> usize {
        self.inner.lock().expect("session manager mutex poisoned").sess_list.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    struct NoopStorage;

    #[async_trait]
    impl StorageSession for NoopStorage {
        async fn save(&self, name: &str, _data: Bytes) -> Result<String, crate::error::DispatchError> {
            Ok(name.to_string())
        }
        async fn fetch(&self, uri: &str) -> Result<Bytes, crate::error::DispatchError> {
            Ok(Bytes::from(uri.to_string()))
        }
        fn is_external(&self) -> bool {
            false
        }
        fn is_own(&self, _uri: &str) -> bool {
            true
        }
    }

    fn session(addr: &str) -> BroadcastSession {
        BroadcastSession {
            orchestrator: OrchestratorInfo {
                transport_addr: addr.to_string(),
                preferred_storage: None,
                payment_session_id: None,
            },
            broadcaster_storage: Arc::new(NoopStorage),
            orchestrator_storage: None,
        }
    }

    struct FixedFactory(Vec<String>);

    #[async_trait]
    impl SessionFactory for FixedFactory {
        async fn create_sessions(&self, _count: usize) -> Vec<BroadcastSession> {
            self.0.iter().map(|addr| session(addr)).collect()
        }
    }

    struct EmptyFactory;

    #[async_trait]
    impl SessionFactory for EmptyFactory {
        async fn create_sessions(&self, _count: usize) -> Vec<BroadcastSession> {
            Vec::new()
        }
    }

    #[tokio::test]
    async fn select_on_empty_pool_returns_none() {
        let mgr = SessionManager::new(SessionPoolConfig::default(), Arc::new(EmptyFactory));
        assert!(mgr.select_session().is_none());
    }

    #[tokio::test]
    async fn complete_then_select_round_trips_a_session() {
        let mgr = SessionManager::new(SessionPoolConfig::default(), Arc::new(EmptyFactory));
        let s = session("orch-1");
        // Simulate the session having been created and registered by a refresh.
        mgr.refresh_sessions().await; // no-op, establishes baseline
        {
            let mut inner = mgr.inner.lock().unwrap();
            inner.sess_map.insert(s.transport_addr().to_string(), s.clone());
        }
        mgr.complete_session(s.clone());
        let selected = mgr.select_session();
        assert!(selected.is_some());
        assert_eq!(selected.unwrap().transport_addr(), "orch-1");
    }

    #[tokio::test]
    async fn completing_a_removed_session_is_dropped_silently() {
        let mgr = SessionManager::new(SessionPoolConfig::default(), Arc::new(EmptyFactory));
        let s = session("orch-1");
        mgr.complete_session(s);
        assert_eq!(mgr.current_sessions(), 0);
    }

    #[tokio::test]
    async fn refresh_merges_only_unknown_sessions() {
        let factory = Arc::new(FixedFactory(vec!["a".into(), "b".into()]));
        let mgr = SessionManager::new(SessionPoolConfig::default(), factory);
        mgr.refresh_sessions().await;
        assert_eq!(mgr.current_sessions(), 2);
        mgr.refresh_sessions().await;
        assert_eq!(mgr.current_sessions(), 2, "re-refresh must not duplicate entries");
    }

    #[tokio::test]
    async fn cleanup_prevents_further_refresh_mutation() {
        let factory = Arc::new(FixedFactory(vec!["a".into()]));
        let mgr = SessionManager::new(SessionPoolConfig::default(), factory);
        mgr.cleanup();
        mgr.refresh_sessions().await;
        assert_eq!(mgr.current_sessions(), 0);
    }
}
