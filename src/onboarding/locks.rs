//! Per-member async locks.
//!
//! Events for the same member are handled one at a time; events for
//! different members never wait on each other. A slot is dropped from the
//! map as soon as nobody holds or waits on it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::OwnedMutexGuard;

type Slot = Arc<tokio::sync::Mutex<()>>;

#[derive(Default)]
pub struct MemberLocks {
    slots: Mutex<HashMap<String, Slot>>,
}

/// Holds the lock for one member until dropped.
pub struct MemberGuard<'a> {
    locks: &'a MemberLocks,
    member_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl MemberLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `member_id`.
    pub async fn acquire(&self, member_id: &str) -> MemberGuard<'_> {
        let slot = self
            .slots()
            .entry(member_id.to_string())
            .or_default()
            .clone();
        let guard = slot.lock_owned().await;
        MemberGuard {
            locks: self,
            member_id: member_id.to_string(),
            guard: Some(guard),
        }
    }

    /// Number of members with a live slot.
    #[cfg(test)]
    fn active(&self) -> usize {
        self.slots().len()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        // The map is only touched in short non-panicking sections.
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for MemberGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut slots = self.locks.slots();
        if let Some(slot) = slots.get(&self.member_id) {
            // Only the map still references it: no holder, no waiter.
            if Arc::strong_count(slot) == 1 {
                slots.remove(&self.member_id);
            }
        }
    }
}
