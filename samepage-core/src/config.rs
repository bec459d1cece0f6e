//! Core tuning knobs. The host builds one and passes it to `SamePageCore::new`.

use serde::{Deserialize, Serialize};

use crate::chunk::{DEFAULT_CHUNK_TIMEOUT_TICKS, DEFAULT_MAX_FRAME_SIZE, DEFAULT_MAX_PARTIAL_MESSAGES};
use crate::integrity::DEFAULT_REPAIR_FAILURE_THRESHOLD;

/// Default bound on messages in flight over direct links before new ones use the relay.
pub const DEFAULT_MAX_DIRECT_IN_FLIGHT: usize = 128;

/// Ticks after connecting before the resync sweep is considered settled even if some peers never answered.
pub const DEFAULT_RESYNC_TIMEOUT_TICKS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Frame size in characters.
    pub max_frame_size: usize,
    pub chunk_timeout_ticks: u64,
    pub max_partial_messages: usize,
    /// Consecutive failed repairs before a page is reported as unresolved.
    pub repair_failure_threshold: u32,
    /// Send local edits as incremental batches. When off, every edit is sent as a full refresh.
    pub granular_changes: bool,
    pub max_direct_in_flight: usize,
    pub resync_timeout_ticks: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            chunk_timeout_ticks: DEFAULT_CHUNK_TIMEOUT_TICKS,
            max_partial_messages: DEFAULT_MAX_PARTIAL_MESSAGES,
            repair_failure_threshold: DEFAULT_REPAIR_FAILURE_THRESHOLD,
            granular_changes: true,
            max_direct_in_flight: DEFAULT_MAX_DIRECT_IN_FLIGHT,
            resync_timeout_ticks: DEFAULT_RESYNC_TIMEOUT_TICKS,
        }
    }
}
