//! Session registry
//!
//! A session is one editor tab: the name of the connection it is bound to, a
//! generation counter bumped by every query start, and the cancellation token
//! of its in-flight query. Each session has its own lock; critical sections
//! never span an await.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio_util::sync::CancellationToken;

/// Identifier of a session, chosen by the UI
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Handed out when a query starts; identifies it for the rest of its life
#[derive(Debug, Clone)]
pub struct QueryTicket {
    pub session: SessionId,
    /// Connection the session was bound to when the query started
    pub connection: String,
    pub generation: u64,
    /// Fires on explicit cancel, on supersede and on unbind
    pub cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct SessionState {
    connection: Option<String>,
    generation: u64,
    cancel: Option<CancellationToken>,
}

impl SessionState {
    /// Cancel the in-flight query, if any, and invalidate its generation
    fn supersede(&mut self) -> bool {
        match self.cancel.take() {
            Some(token) => {
                token.cancel();
                self.generation += 1;
                true
            }
            None => false,
        }
    }
}

/// All sessions of the process
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<Mutex<SessionState>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn session(&self, id: &SessionId) -> Option<Arc<Mutex<SessionState>>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    fn session_or_create(&self, id: &SessionId) -> Arc<Mutex<SessionState>> {
        if let Some(session) = self.session(id) {
            return session;
        }
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(sessions.entry(id.clone()).or_default())
    }

    /// Point a session at a connection, or detach it with `None`
    ///
    /// A query still running against another connection is cancelled.
    /// Returns the previously bound connection.
    pub fn bind(&self, id: &SessionId, connection: Option<String>) -> Option<String> {
        let session = self.session_or_create(id);
        let mut state = lock(&session);

        if state.connection != connection && state.supersede() {
            tracing::debug!(session = %id, "Cancelled query of rebound session");
        }
        std::mem::replace(&mut state.connection, connection)
    }

    /// Connection the session is bound to
    pub fn connection_of(&self, id: &SessionId) -> Option<String> {
        self.session(id).and_then(|session| lock(&session).connection.clone())
    }

    /// Start a query, superseding the one in flight
    ///
    /// # Returns
    ///
    /// A ticket carrying the new generation, or [`Error::NotConnected`] when
    /// the session is unknown or unbound
    pub fn begin_query(&self, id: &SessionId) -> Result<QueryTicket> {
        let session = self
            .session(id)
            .ok_or_else(|| Error::NotConnected(format!("session '{id}' is not bound")))?;
        let mut state = lock(&session);

        let connection = state
            .connection
            .clone()
            .ok_or_else(|| Error::NotConnected(format!("session '{id}' is not bound")))?;

        if let Some(previous) = state.cancel.take() {
            previous.cancel();
            tracing::debug!(session = %id, generation = state.generation, "Superseded in-flight query");
        }

        state.generation += 1;
        let cancel = CancellationToken::new();
        state.cancel = Some(cancel.clone());

        Ok(QueryTicket {
            session: id.clone(),
            connection,
            generation: state.generation,
            cancel,
        })
    }

    /// Whether `generation` is still the session's current query
    pub fn is_current(&self, id: &SessionId, generation: u64) -> bool {
        self.session(id)
            .map(|session| lock(&session).generation == generation)
            .unwrap_or(false)
    }

    /// Mark a query as done
    ///
    /// # Returns
    ///
    /// Whether the ticket was still current; a stale ticket changes nothing
    /// and its result must be discarded
    pub fn finish(&self, ticket: &QueryTicket) -> bool {
        let Some(session) = self.session(&ticket.session) else {
            return false;
        };
        let mut state = lock(&session);

        if state.generation != ticket.generation {
            tracing::debug!(
                session = %ticket.session,
                generation = ticket.generation,
                current = state.generation,
                "Discarding stale completion"
            );
            return false;
        }
        state.cancel = None;
        true
    }

    /// Cancel the in-flight query of a session
    ///
    /// Returns whether there was one. The generation is kept so the cancelled
    /// query still finishes as the current one.
    pub fn cancel(&self, id: &SessionId) -> bool {
        let Some(session) = self.session(id) else {
            return false;
        };
        let state = lock(&session);
        match &state.cancel {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Detach every session bound to `connection`; returns the detached ids
    pub fn unbind_connection(&self, connection: &str) -> Vec<SessionId> {
        let sessions: Vec<_> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, session)| (id.clone(), Arc::clone(session)))
            .collect();

        let mut detached = Vec::new();
        for (id, session) in sessions {
            let mut state = lock(&session);
            if state.connection.as_deref() == Some(connection) {
                state.supersede();
                state.connection = None;
                detached.push(id);
            }
        }
        detached.sort();
        detached
    }

    /// Forget a session, cancelling its query
    pub fn remove(&self, id: &SessionId) -> bool {
        let removed = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        match removed {
            Some(session) => {
                lock(&session).supersede();
                true
            }
            None => false,
        }
    }
}

fn lock(session: &Mutex<SessionState>) -> MutexGuard<'_, SessionState> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bound(name: &str) -> (SessionRegistry, SessionId) {
        let registry = SessionRegistry::new();
        let id = SessionId::new("tab-1");
        registry.bind(&id, Some(name.to_string()));
        (registry, id)
    }

    #[test]
    fn test_unbound_session_is_not_connected() {
        let registry = SessionRegistry::new();
        let id = SessionId::new("tab-1");
        assert!(matches!(registry.begin_query(&id), Err(Error::NotConnected(_))));

        registry.bind(&id, None);
        assert!(matches!(registry.begin_query(&id), Err(Error::NotConnected(_))));
    }

    #[test]
    fn test_new_query_supersedes_old_one() {
        let (registry, id) = bound("local");

        let first = registry.begin_query(&id).unwrap();
        let second = registry.begin_query(&id).unwrap();

        assert_eq!(second.generation, first.generation + 1);
        assert!(first.cancel.is_cancelled());
        assert!(!second.cancel.is_cancelled());

        // The first query completes late: its result is discarded
        assert!(!registry.finish(&first));
        assert!(registry.is_current(&id, second.generation));
        assert!(registry.finish(&second));
    }

    #[test]
    fn test_cancel_fires_token_without_bumping_generation() {
        let (registry, id) = bound("local");
        let ticket = registry.begin_query(&id).unwrap();

        assert!(registry.cancel(&id));
        assert!(ticket.cancel.is_cancelled());
        assert!(registry.is_current(&id, ticket.generation));
        assert!(registry.finish(&ticket));

        // Nothing left in flight
        assert!(!registry.cancel(&id));
    }

    #[test]
    fn test_rebind_cancels_in_flight_query() {
        let (registry, id) = bound("local");
        let ticket = registry.begin_query(&id).unwrap();

        assert_eq!(registry.bind(&id, Some("local".into())), Some("local".into()));
        assert!(!ticket.cancel.is_cancelled());

        assert_eq!(registry.bind(&id, Some("reports".into())), Some("local".into()));
        assert!(ticket.cancel.is_cancelled());
        assert!(!registry.finish(&ticket));
        assert_eq!(registry.connection_of(&id).as_deref(), Some("reports"));
    }

    #[test]
    fn test_unbind_connection_detaches_sessions() {
        let registry = SessionRegistry::new();
        let a = SessionId::new("a");
        let b = SessionId::new("b");
        let c = SessionId::new("c");
        registry.bind(&a, Some("prod".into()));
        registry.bind(&b, Some("prod".into()));
        registry.bind(&c, Some("local".into()));
        let running = registry.begin_query(&b).unwrap();

        assert_eq!(registry.unbind_connection("prod"), vec![a.clone(), b.clone()]);
        assert!(running.cancel.is_cancelled());
        assert_eq!(registry.connection_of(&a), None);
        assert_eq!(registry.connection_of(&c).as_deref(), Some("local"));
        assert!(matches!(registry.begin_query(&b), Err(Error::NotConnected(_))));
    }

    #[test]
    fn test_remove_session() {
        let (registry, id) = bound("local");
        let ticket = registry.begin_query(&id).unwrap();
        assert!(registry.remove(&id));
        assert!(ticket.cancel.is_cancelled());
        assert!(!registry.finish(&ticket));
        assert!(!registry.remove(&id));
    }
}
