//! Durable per-client state that outlives individual connections.
//!
//! A [`SessionContext`] is keyed by the client's self-chosen id. Closing a
//! socket only detaches it; the context stays in the [`SessionStore`] so a
//! reconnect with the same id picks up its authorization and scope. Detached
//! contexts are evicted once they have been idle longer than the configured
//! window, or removed explicitly with [`SessionStore::destroy`].

use crate::error::ProcedureError;
use log::info;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Authorization {
    pub host: bool,
}

/// Which simulation objects the client is currently looking at.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Scope {
    pub simulation: Option<String>,
    pub viewpoint: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SessionContext {
    client_id: String,
    pub authorization: Authorization,
    pub scope: Scope,
    created_at: Instant,
    attached: usize,
    detached_since: Option<Instant>,
}

impl SessionContext {
    pub fn new(client_id: impl Into<String>, authorization: Authorization) -> Self {
        Self {
            client_id: client_id.into(),
            authorization,
            scope: Scope::default(),
            created_at: Instant::now(),
            attached: 0,
            detached_since: Some(Instant::now()),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn is_host(&self) -> bool {
        self.authorization.host
    }

    pub fn require_host(&self) -> Result<(), ProcedureError> {
        if self.authorization.host {
            Ok(())
        } else {
            Err(ProcedureError::Unauthorized(format!(
                "client `{}` is not the host",
                self.client_id
            )))
        }
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn attached_connections(&self) -> usize {
        self.attached
    }

    fn is_idle_for(&self, window: Duration, now: Instant) -> bool {
        match self.detached_since {
            Some(since) if self.attached == 0 => now.saturating_duration_since(since) > window,
            _ => false,
        }
    }
}

/// Who gets host authorization when a new context is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostPolicy {
    /// The first client ever to identify becomes host.
    FirstClient,
    /// Only the listed client ids are hosts.
    Listed(HashSet<String>),
}

impl HostPolicy {
    pub fn from_ids(ids: Vec<String>) -> Self {
        if ids.is_empty() {
            HostPolicy::FirstClient
        } else {
            HostPolicy::Listed(ids.into_iter().collect())
        }
    }
}

pub struct SessionStore {
    sessions: HashMap<String, SessionContext>,
    idle_timeout: Option<Duration>,
    host_policy: HostPolicy,
    host_assigned: bool,
}

impl SessionStore {
    pub fn new(idle_timeout: Option<Duration>, host_policy: HostPolicy) -> Self {
        Self {
            sessions: HashMap::new(),
            idle_timeout,
            host_policy,
            host_assigned: false,
        }
    }

    /// Attaches a connection to the context for `client_id`, creating the
    /// context on first contact. Returns the context and whether it already
    /// existed.
    pub fn attach(&mut self, client_id: &str) -> (&mut SessionContext, bool) {
        let resumed = self.sessions.contains_key(client_id);

        let host = !resumed
            && match &self.host_policy {
                HostPolicy::FirstClient => !self.host_assigned,
                HostPolicy::Listed(ids) => ids.contains(client_id),
            };
        if host {
            self.host_assigned = true;
        }

        let session = self
            .sessions
            .entry(client_id.to_string())
            .or_insert_with(|| {
                info!("Created session for client {} (host: {})", client_id, host);
                SessionContext::new(client_id, Authorization { host })
            });
        session.attached += 1;
        session.detached_since = None;
        (session, resumed)
    }

    /// Detaches one connection. The context itself is kept.
    pub fn detach(&mut self, client_id: &str) {
        if let Some(session) = self.sessions.get_mut(client_id) {
            session.attached = session.attached.saturating_sub(1);
            if session.attached == 0 {
                session.detached_since = Some(Instant::now());
            }
        }
    }

    /// Administrative removal. Returns true if a context was dropped.
    pub fn destroy(&mut self, client_id: &str) -> bool {
        let removed = self.sessions.remove(client_id).is_some();
        if removed {
            info!("Destroyed session for client {}", client_id);
        }
        removed
    }

    /// Drops contexts that have had no connection for longer than the idle
    /// window and returns their client ids.
    pub fn evict_idle(&mut self, now: Instant) -> Vec<String> {
        let window = match self.idle_timeout {
            Some(window) => window,
            None => return Vec::new(),
        };

        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, session)| session.is_idle_for(window, now))
            .map(|(id, _)| id.clone())
            .collect();

        for client_id in &expired {
            self.sessions.remove(client_id);
            info!("Evicted idle session for client {}", client_id);
        }

        expired
    }

    pub fn get(&self, client_id: &str) -> Option<&SessionContext> {
        self.sessions.get(client_id)
    }

    pub fn get_mut(&mut self, client_id: &str) -> Option<&mut SessionContext> {
        self.sessions.get_mut(client_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SessionStore {
        SessionStore::new(Some(Duration::from_secs(60)), HostPolicy::FirstClient)
    }

    #[test]
    fn test_first_contact_creates_session() {
        let mut store = store();
        let (session, resumed) = store.attach("alice");

        assert!(!resumed);
        assert_eq!(session.client_id(), "alice");
        assert_eq!(session.attached_connections(), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_reattach_keeps_scope_and_authorization() {
        let mut store = store();
        {
            let (session, _) = store.attach("alice");
            session.scope.viewpoint = Some("station-7".to_string());
        }
        store.detach("alice");

        let (session, resumed) = store.attach("alice");
        assert!(resumed);
        assert!(session.is_host());
        assert_eq!(session.scope.viewpoint.as_deref(), Some("station-7"));
    }

    #[test]
    fn test_first_client_policy_makes_one_host() {
        let mut store = store();
        assert!(store.attach("alice").0.is_host());
        assert!(!store.attach("bob").0.is_host());

        // Host stays assigned even after the host's session is gone
        store.destroy("alice");
        assert!(!store.attach("carol").0.is_host());
    }

    #[test]
    fn test_listed_policy() {
        let mut store = SessionStore::new(None, HostPolicy::from_ids(vec!["bob".to_string()]));
        assert!(!store.attach("alice").0.is_host());
        assert!(store.attach("bob").0.is_host());
    }

    #[test]
    fn test_require_host() {
        let host = SessionContext::new("h", Authorization { host: true });
        let guest = SessionContext::new("g", Authorization::default());

        assert!(host.require_host().is_ok());
        match guest.require_host() {
            Err(ProcedureError::Unauthorized(msg)) => assert!(msg.contains("`g`")),
            other => panic!("Unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_attached_sessions_are_never_evicted() {
        let mut store = store();
        store.attach("alice");

        let later = Instant::now() + Duration::from_secs(3600);
        assert!(store.evict_idle(later).is_empty());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_detached_sessions_evicted_after_window() {
        let mut store = store();
        store.attach("alice");
        store.attach("bob");
        store.detach("alice");

        let soon = Instant::now() + Duration::from_secs(10);
        assert!(store.evict_idle(soon).is_empty());

        let later = Instant::now() + Duration::from_secs(120);
        assert_eq!(store.evict_idle(later), vec!["alice".to_string()]);
        assert!(store.get("alice").is_none());
        assert!(store.get("bob").is_some());
    }

    #[test]
    fn test_two_connections_one_session() {
        let mut store = store();
        store.attach("alice");
        store.attach("alice");
        store.detach("alice");

        let later = Instant::now() + Duration::from_secs(120);
        assert!(store.evict_idle(later).is_empty());
        assert_eq!(store.get("alice").unwrap().attached_connections(), 1);
    }

    #[test]
    fn test_no_idle_timeout_retains_forever() {
        let mut store = SessionStore::new(None, HostPolicy::FirstClient);
        store.attach("alice");
        store.detach("alice");

        let much_later = Instant::now() + Duration::from_secs(86_400);
        assert!(store.evict_idle(much_later).is_empty());
    }

    #[test]
    fn test_destroy() {
        let mut store = store();
        store.attach("alice");
        assert!(store.destroy("alice"));
        assert!(!store.destroy("alice"));
        assert!(store.is_empty());
    }
}
