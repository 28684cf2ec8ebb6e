use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::network::Session;
use crate::{AppError, AppResult};

/// Live sessions keyed by session id.
///
/// Shared by the accept loop, every receive loop and every sender; all
/// operations are safe to call concurrently without outside locking.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    sessions: DashMap<String, Arc<Session>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, session: Arc<Session>) -> AppResult<()> {
        match self.sessions.entry(session.id().to_string()) {
            Entry::Occupied(entry) => Err(AppError::IllegalStateError(format!(
                "session {} is already registered",
                entry.key()
            ))),
            Entry::Vacant(entry) => {
                entry.insert(session);
                Ok(())
            }
        }
    }

    /// Returns the session only to the first caller, so exactly one caller
    /// ever tears a given session down.
    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.remove(id).map(|(_, session)| session)
    }

    pub fn try_get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    /// Sessions registered at the time of the call.
    ///
    /// No shard lock is held once this returns, so callers may add or remove
    /// sessions while walking the result.
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<Session>),
    {
        for session in self.snapshot() {
            f(&session);
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
