//! Counter registry
//!
//! In-memory mapping from request type to its number of active slots. This
//! is the only state shared between connections, so every read-modify-write
//! happens under one lock.
//!
//! The limit is supplied per call and never stored: admission compares the
//! shared running count against whatever limit the current caller passed.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Active slot counts per request type
#[derive(Debug, Default)]
pub struct CounterRegistry {
    counts: Mutex<HashMap<String, u32>>,
}

impl CounterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take one slot of `request_type` if fewer than `limit` are active.
    ///
    /// Returns `false` without touching the count when the limit is reached.
    pub fn try_admit(&self, request_type: &str, limit: u32) -> bool {
        let mut counts = self.lock();
        let current = counts.get(request_type).copied().unwrap_or(0);

        if current >= limit {
            debug!(request_type, current, limit, "Admission rejected");
            return false;
        }

        counts.insert(request_type.to_string(), current + 1);
        debug!(request_type, count = current + 1, limit, "Admission granted");
        true
    }

    /// Give back one slot. Releasing a type with no active slots is a no-op.
    pub fn release(&self, request_type: &str) {
        let mut counts = self.lock();

        match counts.get_mut(request_type) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                counts.remove(request_type);
            }
            None => {}
        }
    }

    /// Current number of active slots, 0 for unknown types
    pub fn count(&self, request_type: &str) -> u32 {
        self.lock().get(request_type).copied().unwrap_or(0)
    }

    /// Number of request types with at least one active slot
    pub fn active_types(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, u32>> {
        // Counts are plain integers; a panic mid-update cannot leave them torn.
        self.counts.lock().unwrap_or_else(|e| e.into_inner())
    }
}
