//! The session layer: connection-id issuance for the external command
//! surface. Out of the matching-engine's scope proper (§1 names it an
//! external collaborator) but every adapter needs one, so it lives here
//! rather than in the core modules.

use std::collections::HashMap;
use std::sync::Mutex;

use uuid::Uuid;

use crate::errors::{ExchangeError, ExchangeResult};

struct ConnectionTableInner {
    by_user: HashMap<String, Uuid>,
    by_connection: HashMap<Uuid, String>,
}

/// Maps `user ↔ connection_id` for the lifetime of one session. A user may
/// hold at most one connection at a time.
pub struct ConnectionTable {
    inner: Mutex<ConnectionTableInner>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ConnectionTableInner {
                by_user: HashMap::new(),
                by_connection: HashMap::new(),
            }),
        }
    }

    pub fn connect(&self, user: &str) -> ExchangeResult<Uuid> {
        let mut inner = self.inner.lock().expect("connection table poisoned");
        if inner.by_user.contains_key(user) {
            return Err(ExchangeError::AlreadyConnected(user.to_string()));
        }
        let id = Uuid::new_v4();
        inner.by_user.insert(user.to_string(), id);
        inner.by_connection.insert(id, user.to_string());
        Ok(id)
    }

    pub fn disconnect(&self, user: &str, connection_id: Uuid) -> ExchangeResult<()> {
        let mut inner = self.inner.lock().expect("connection table poisoned");
        match inner.by_user.get(user) {
            Some(id) if *id == connection_id => {
                inner.by_user.remove(user);
                inner.by_connection.remove(&connection_id);
                Ok(())
            }
            Some(_) => Err(ExchangeError::InvalidConnectionId(connection_id.to_string())),
            None => Err(ExchangeError::UserNotConnected(user.to_string())),
        }
    }

    pub fn require_connected(&self, user: &str, connection_id: Uuid) -> ExchangeResult<()> {
        let inner = self.inner.lock().expect("connection table poisoned");
        match inner.by_user.get(user) {
            Some(id) if *id == connection_id => Ok(()),
            Some(_) => Err(ExchangeError::InvalidConnectionId(connection_id.to_string())),
            None => Err(ExchangeError::UserNotConnected(user.to_string())),
        }
    }
}

impl Default for ConnectionTable {
    fn default() -> Self {
        Self::new()
    }
}
