//! Registry of the sessions owned by one session loop.

use std::collections::HashMap;

use crate::event_loop::LoopToken;
use crate::protocol::SessionId;
use crate::session::{Session, SessionKey, Side};

/// Errors raised by [`SessionRegistry`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    /// A session with this key is already registered.
    #[error("session {0} is already registered")]
    Duplicate(SessionKey),
}

/// Sessions keyed by [`SessionKey`].
///
/// Every mutation takes a [`LoopToken`], so only the owning loop can change
/// membership.
pub struct SessionRegistry<P> {
    sessions: HashMap<SessionKey, Session<P>>,
}

impl<P: Send + 'static> SessionRegistry<P> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
        }
    }

    /// Add a session. A duplicate key is refused and the offered session is
    /// dropped.
    pub fn register(&mut self, session: Session<P>, _token: &LoopToken) -> Result<(), RegistryError> {
        let key = session.key().clone();
        if self.sessions.contains_key(&key) {
            return Err(RegistryError::Duplicate(key));
        }
        self.sessions.insert(key, session);
        Ok(())
    }

    /// Remove a session. Removing an absent key is a no-op.
    pub fn remove(&mut self, key: &SessionKey, _token: &LoopToken) -> Option<Session<P>> {
        self.sessions.remove(key)
    }

    /// Whether `key` is registered.
    pub fn contains(&self, key: &SessionKey) -> bool {
        self.sessions.contains_key(key)
    }

    /// Session registered under `key`.
    pub fn get(&self, key: &SessionKey) -> Option<&Session<P>> {
        self.sessions.get(key)
    }

    pub(crate) fn get_mut(&mut self, key: &SessionKey) -> Option<&mut Session<P>> {
        self.sessions.get_mut(key)
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Session<P>> {
        self.sessions.values_mut()
    }

    /// Session with this id, preferring the initiator half when both halves
    /// of a co-located pair are registered.
    pub fn lookup(&self, session_id: &SessionId) -> Option<&Session<P>> {
        [Side::Initiator, Side::Acceptor]
            .into_iter()
            .find_map(|side| self.sessions.get(&SessionKey::new(session_id.clone(), side)))
    }

    /// Registered keys, in no particular order.
    pub fn keys(&self) -> Vec<SessionKey> {
        self.sessions.keys().cloned().collect()
    }

    /// Number of sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl<P: Send + 'static> Default for SessionRegistry<P> {
    fn default() -> Self {
        Self::new()
    }
}
