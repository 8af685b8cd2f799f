use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// At most one in-flight operation per path.
///
/// A second `acquire` for a busy path fails with [`Error::ConflictingOperation`]; callers
/// are never queued.
#[derive(Debug, Default, Clone)]
pub(crate) struct SingleFlight {
    active: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

/// Held for the duration of one operation; releases the path on drop.
#[derive(Debug)]
pub(crate) struct FlightGuard {
    path: String,
    token: CancellationToken,
    active: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl SingleFlight {
    pub(crate) fn acquire(&self, path: &str, parent: &CancellationToken) -> Result<FlightGuard> {
        let mut active = self.active.lock();
        if active.contains_key(path) {
            return Err(Error::ConflictingOperation(path.to_string()));
        }
        let token = parent.child_token();
        active.insert(path.to_string(), token.clone());
        Ok(FlightGuard {
            path: path.to_string(),
            token,
            active: Arc::clone(&self.active),
        })
    }

    /// Cancels the operation running for `path`, if any.
    pub(crate) fn cancel(&self, path: &str) -> bool {
        match self.active.lock().get(path) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub(crate) fn is_active(&self, path: &str) -> bool {
        self.active.lock().contains_key(path)
    }
}

impl FlightGuard {
    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        // The entry can only have been inserted by this guard.
        self.active.lock().remove(&self.path);
    }
}
