//! The session table keyed by opaque client id.

use dashmap::DashMap;

use crate::protocol::random_token;
use crate::{Error, Result};

/// A session created by `open`, looked up by every subsequent op, and
/// destroyed by `close`.
#[derive(Debug, Clone)]
pub struct Session {
    pub client_id: String,
    pub bucket: String,
}

/// Concurrent `client_id -> Session` map.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    sessions: DashMap<String, Session>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Allocate a fresh 16-character client id for `bucket` and register it.
    pub fn create(&self, bucket: String) -> Session {
        let client_id = random_token();
        let session = Session {
            client_id: client_id.clone(),
            bucket,
        };
        self.sessions.insert(client_id, session.clone());
        session
    }

    pub fn find(&self, client_id: &str) -> Result<Session> {
        self.sessions
            .get(client_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| Error::NotFound(format!("client {client_id}")))
    }

    pub fn remove(&self, client_id: &str) -> Result<()> {
        self.sessions
            .remove(client_id)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("client {client_id}")))
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }
}
