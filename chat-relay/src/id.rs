//! Client identifiers and the allocator that hands them out.
//!
//! Identifiers are short decimal tokens drawn at random from a small bounded
//! range. Because the range is small, a drawn candidate can collide with an
//! identifier that is still held, so allocation checks the in-use set and
//! retries until it finds a free one.

use std::collections::HashSet;
use std::fmt;
use std::ops::RangeInclusive;
use std::sync::{Mutex, MutexGuard, PoisonError};

use rand::Rng;

use crate::error::AllocError;

/// Token that tags every broadcast line sent on behalf of a client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(String);

impl ClientId {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<u32> for ClientId {
    fn from(value: u32) -> Self {
        Self(value.to_string())
    }
}

/// Hands out identifiers unique among the currently connected clients.
///
/// The in-use set is the only shared state and sits behind a `Mutex`; the
/// check-and-insert for a candidate happens under a single lock acquisition,
/// so concurrent accept paths can never receive the same identifier.
pub struct IdAllocator {
    range: RangeInclusive<u32>,
    in_use: Mutex<HashSet<ClientId>>,
}

impl IdAllocator {
    pub fn new(range: RangeInclusive<u32>) -> Self {
        Self {
            range,
            in_use: Mutex::new(HashSet::new()),
        }
    }

    /// Number of distinct identifiers the range can produce.
    pub fn capacity(&self) -> usize {
        if self.range.is_empty() {
            return 0;
        }
        (*self.range.end() - *self.range.start()) as usize + 1
    }

    /// Draws a free identifier and marks it as in use.
    ///
    /// # Errors
    /// Returns [`AllocError::ExhaustedSpace`] when every identifier in the
    /// range is already held. This is a capacity condition, not a bug.
    pub fn allocate(&self) -> Result<ClientId, AllocError> {
        let capacity = self.capacity();
        let mut in_use = self.lock();
        if in_use.len() >= capacity {
            return Err(AllocError::ExhaustedSpace { capacity });
        }

        let mut rng = rand::thread_rng();
        loop {
            let candidate = ClientId::from(rng.gen_range(self.range.clone()));
            if in_use.insert(candidate.clone()) {
                return Ok(candidate);
            }
        }
    }

    /// Returns an identifier to the pool. Releasing an identifier that is not
    /// held is a no-op.
    pub fn release(&self, id: &ClientId) {
        self.lock().remove(id);
    }

    pub fn is_in_use(&self, id: &ClientId) -> bool {
        self.lock().contains(id)
    }

    pub fn in_use_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<ClientId>> {
        self.in_use.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
