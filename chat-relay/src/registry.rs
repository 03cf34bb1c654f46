//! The set of Active sessions and broadcast fan-out.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::warn;

use crate::id::ClientId;
use crate::session::{CloseReason, Delivery, SessionHandle};

/// Maps identifiers to the handles of Active sessions.
///
/// Sessions add themselves after negotiation and remove themselves when they
/// end; the only other remover is the shutdown sweep ([`Registry::drain`]).
/// The lock is held only to copy or mutate the map, never while delivering.
#[derive(Debug, Default)]
pub struct Registry {
    sessions: Mutex<HashMap<ClientId, Arc<SessionHandle>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, session: Arc<SessionHandle>) {
        self.lock().insert(session.id().clone(), session);
    }

    pub fn remove(&self, id: &ClientId) -> Option<Arc<SessionHandle>> {
        self.lock().remove(id)
    }

    pub fn contains(&self, id: &ClientId) -> bool {
        self.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copies the current membership.
    pub fn snapshot(&self) -> Vec<Arc<SessionHandle>> {
        self.lock().values().cloned().collect()
    }

    /// Empties the registry and returns everything it held.
    pub fn drain(&self) -> Vec<Arc<SessionHandle>> {
        self.lock().drain().map(|(_, session)| session).collect()
    }

    /// Offers `line` to every registered session. Returns how many queued it.
    pub fn broadcast(&self, line: &str) -> usize {
        dispatch(self.snapshot(), line)
    }

    /// Offers `line` to every registered session except `sender`.
    pub fn broadcast_except(&self, sender: &ClientId, line: &str) -> usize {
        let recipients = self
            .lock()
            .values()
            .filter(|session| session.id() != sender)
            .cloned()
            .collect();
        dispatch(recipients, line)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ClientId, Arc<SessionHandle>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Delivers to each recipient independently. A recipient that cannot take the
/// line is told to close; the others are unaffected.
fn dispatch(recipients: Vec<Arc<SessionHandle>>, line: &str) -> usize {
    let mut queued = 0;
    for session in recipients {
        match session.send_message(line) {
            Ok(Delivery::Queued) => queued += 1,
            Ok(Delivery::Skipped) => {}
            Err(err) => {
                warn!(client = %session.id(), error = %err, "evicting unresponsive client");
                session.close(CloseReason::Evicted);
            }
        }
    }
    queued
}
