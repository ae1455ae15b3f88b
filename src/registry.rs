//! # Cancellation and Completion Registry
//!
//! Shared bookkeeping consulted from every pipeline stage: the set of cancelled scan ids
//! and the number of results each scan attempt still has to publish.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use thiserror::Error;
use tracing::{debug, info};

use crate::scan::{AttemptId, ScanId};

/// Sorted, grow-only set of cancelled scan ids.
#[derive(Debug, Default)]
pub struct Cancellation {
    ids: RwLock<Vec<ScanId>>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a scan as cancelled. Returns `false` when it already was.
    pub fn cancel(&self, scan_id: ScanId) -> bool {
        let mut ids = self.ids.write().unwrap_or_else(PoisonError::into_inner);
        match ids.binary_search(&scan_id) {
            Ok(_) => false,
            Err(pos) => {
                ids.insert(pos, scan_id);
                info!("scan_id={scan_id} added to blacklist entries={}", ids.len());
                true
            }
        }
    }

    pub fn is_cancelled(&self, scan_id: ScanId) -> bool {
        self.ids
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .binary_search(&scan_id)
            .is_ok()
    }

    pub fn len(&self) -> usize {
        self.ids.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrackerError {
    #[error("attempt {0} is already registered")]
    AlreadyRegistered(AttemptId),
    #[error("attempt {0} is not registered")]
    Unknown(AttemptId),
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    scan_id: ScanId,
    count: u32,
}

/// Remaining publish count per scan attempt.
#[derive(Debug, Default)]
pub struct CompletionTracker {
    remaining: RwLock<HashMap<AttemptId, Pending>>,
}

impl CompletionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record how many results of `scan_id` must be published before `attempt` is finished.
    pub fn set_expected(
        &self,
        attempt: AttemptId,
        scan_id: ScanId,
        count: u32,
    ) -> Result<(), TrackerError> {
        let mut remaining = self
            .remaining
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if remaining.contains_key(&attempt) {
            return Err(TrackerError::AlreadyRegistered(attempt));
        }
        remaining.insert(attempt, Pending { scan_id, count });
        debug!("attempt={attempt} scan_id={scan_id} expects {count} published results");
        Ok(())
    }

    /// Count one published result. Returns `true` when this was the last one; the entry is
    /// removed at that point, so any further decrement for the attempt is an error.
    pub fn decrement_and_check(&self, attempt: AttemptId) -> Result<bool, TrackerError> {
        let mut remaining = self
            .remaining
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let pending = remaining
            .get_mut(&attempt)
            .ok_or(TrackerError::Unknown(attempt))?;
        pending.count = pending.count.saturating_sub(1);
        if pending.count == 0 {
            remaining.remove(&attempt);
            return Ok(true);
        }
        Ok(false)
    }

    /// Drop every attempt of `scan_id`; used when the scan is aborted and will never finish.
    pub fn retire_scan(&self, scan_id: ScanId) -> usize {
        let mut remaining = self
            .remaining
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = remaining.len();
        remaining.retain(|_, pending| pending.scan_id != scan_id);
        let retired = before - remaining.len();
        if retired > 0 {
            debug!("scan_id={scan_id} retired {retired} pending attempts");
        }
        retired
    }

    pub fn remaining(&self, attempt: AttemptId) -> Option<u32> {
        self.remaining
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&attempt)
            .map(|pending| pending.count)
    }
}
