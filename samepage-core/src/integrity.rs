//! Integrity: SHA-256 state digests and per-page repair failure tracking.

use std::collections::HashMap;
use std::fmt::Write as _;

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::crdt::ElementId;

/// Consecutive failed repairs of one page before it is reported as unresolved.
pub const DEFAULT_REPAIR_FAILURE_THRESHOLD: u32 = 2;

pub fn to_hex(digest: &[u8]) -> String {
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        let _ = write!(out, "{:02x}", b);
    }
    out
}

/// Incremental digest over replica state. Variable-length fields are length-prefixed.
pub struct ChecksumBuilder {
    hasher: Sha256,
}

impl ChecksumBuilder {
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
        }
    }

    pub fn update(&mut self, bytes: &[u8]) -> &mut Self {
        self.hasher.update(bytes);
        self
    }

    pub fn update_str(&mut self, s: &str) -> &mut Self {
        self.hasher.update((s.len() as u64).to_le_bytes());
        self.hasher.update(s.as_bytes());
        self
    }

    pub fn update_id(&mut self, id: &ElementId) -> &mut Self {
        self.hasher.update(id.counter.to_le_bytes());
        self.hasher.update(id.actor.as_bytes());
        self
    }

    pub fn finish_hex(self) -> String {
        to_hex(&self.hasher.finalize())
    }
}

impl Default for ChecksumBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairVerdict {
    /// Below threshold: request another snapshot.
    Retry,
    /// Threshold reached: surface an unresolved sync error.
    Unresolved,
}

/// Counts consecutive repair failures per page. A successful repair resets the count.
pub struct RepairTracker {
    failures: HashMap<Uuid, u32>,
    threshold: u32,
}

impl RepairTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            failures: HashMap::new(),
            threshold: threshold.max(1),
        }
    }

    pub fn record_failure(&mut self, page: Uuid) -> RepairVerdict {
        let count = self.failures.entry(page).or_insert(0);
        *count += 1;
        if *count >= self.threshold {
            *count = 0;
            RepairVerdict::Unresolved
        } else {
            RepairVerdict::Retry
        }
    }

    pub fn record_success(&mut self, page: &Uuid) {
        self.failures.remove(page);
    }

    pub fn failure_count(&self, page: &Uuid) -> u32 {
        self.failures.get(page).copied().unwrap_or(0)
    }

    pub fn forget(&mut self, page: &Uuid) {
        self.failures.remove(page);
    }
}

impl Default for RepairTracker {
    fn default() -> Self {
        Self::new(DEFAULT_REPAIR_FAILURE_THRESHOLD)
    }
}
