//! Chunk codec: split a logical message into bounded frames, reassemble on receive.
//!
//! Frame size counts characters of the serialized message, so a frame never
//! splits a character. Partial messages are keyed by message id and expire
//! after a number of idle ticks.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::LogicalMessage;

/// Default frame size in characters.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 32 * 1024;

/// Default inactivity window for a partial message, in ticks.
pub const DEFAULT_CHUNK_TIMEOUT_TICKS: u64 = 30;

/// Default bound on concurrently tracked partial messages.
pub const DEFAULT_MAX_PARTIAL_MESSAGES: usize = 64;

/// Upper bound on frames per message; larger totals are rejected as malformed.
pub const MAX_FRAMES_PER_MESSAGE: u32 = 1 << 16;

/// Completed ids remembered so late duplicates are not treated as a new message.
const RECENT_COMPLETED: usize = 256;

/// One frame of a logical message. A single-frame message is index 0 of total 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    pub message_id: Uuid,
    pub index: u32,
    pub total: u32,
    pub data: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("message needs {0} frames")]
    TooLarge(usize),
    #[error("{0}")]
    Malformed(String),
}

/// Serialize `message` and split it into frames of at most `max_frame_size` characters.
/// A size of 0 uses `DEFAULT_MAX_FRAME_SIZE`.
pub fn encode(message: &LogicalMessage, max_frame_size: usize) -> Result<Vec<Frame>, ChunkError> {
    let size = if max_frame_size == 0 {
        DEFAULT_MAX_FRAME_SIZE
    } else {
        max_frame_size
    };
    let json = serde_json::to_string(message)?;
    let chars: Vec<char> = json.chars().collect();
    let total = chars.len().div_ceil(size).max(1);
    if total > MAX_FRAMES_PER_MESSAGE as usize {
        return Err(ChunkError::TooLarge(total));
    }
    let frames = chars
        .chunks(size)
        .enumerate()
        .map(|(index, part)| Frame {
            message_id: message.id,
            index: index as u32,
            total: total as u32,
            data: part.iter().collect(),
        })
        .collect();
    Ok(frames)
}

#[derive(Debug)]
pub enum Ingest {
    Incomplete,
    Complete(LogicalMessage),
}

/// Frames arrived so far, by index. Sized by what arrived, not by the announced total.
struct PartialMessage {
    total: u32,
    parts: BTreeMap<u32, String>,
    last_tick: u64,
}

/// Per-channel reassembly state.
pub struct Reassembler {
    partials: HashMap<Uuid, PartialMessage>,
    completed: VecDeque<Uuid>,
    completed_set: HashSet<Uuid>,
    tick: u64,
    timeout_ticks: u64,
    max_partials: usize,
}

impl Reassembler {
    pub fn new(timeout_ticks: u64, max_partials: usize) -> Self {
        Self {
            partials: HashMap::new(),
            completed: VecDeque::new(),
            completed_set: HashSet::new(),
            tick: 0,
            timeout_ticks,
            max_partials: max_partials.max(1),
        }
    }

    /// Add one frame. Returns the message once every index has arrived.
    pub fn ingest(&mut self, frame: Frame) -> Result<Ingest, ChunkError> {
        if frame.total == 0 || frame.total > MAX_FRAMES_PER_MESSAGE {
            return Err(ChunkError::Malformed(format!(
                "frame total {} out of range",
                frame.total
            )));
        }
        if frame.index >= frame.total {
            return Err(ChunkError::Malformed(format!(
                "frame index {} >= total {}",
                frame.index, frame.total
            )));
        }
        if self.completed_set.contains(&frame.message_id) {
            return Ok(Ingest::Incomplete);
        }
        if !self.partials.contains_key(&frame.message_id) && self.partials.len() >= self.max_partials {
            self.evict_oldest();
        }
        let tick = self.tick;
        let partial = self
            .partials
            .entry(frame.message_id)
            .or_insert_with(|| PartialMessage {
                total: frame.total,
                parts: BTreeMap::new(),
                last_tick: tick,
            });
        if partial.total != frame.total {
            return Err(ChunkError::Malformed(format!(
                "message {} announced {} frames, now {}",
                frame.message_id, partial.total, frame.total
            )));
        }
        partial.last_tick = tick;
        if partial.parts.contains_key(&frame.index) {
            return Ok(Ingest::Incomplete);
        }
        partial.parts.insert(frame.index, frame.data);
        if partial.parts.len() < partial.total as usize {
            return Ok(Ingest::Incomplete);
        }

        let Some(done) = self.partials.remove(&frame.message_id) else {
            return Ok(Ingest::Incomplete);
        };
        self.remember_completed(frame.message_id);
        let json: String = done.parts.into_values().collect();
        let message: LogicalMessage = serde_json::from_str(&json)
            .map_err(|e| ChunkError::Malformed(format!("message {}: {}", frame.message_id, e)))?;
        Ok(Ingest::Complete(message))
    }

    /// Advance time; drop partial messages idle longer than the timeout. Returns their ids.
    pub fn tick(&mut self) -> Vec<Uuid> {
        self.tick = self.tick.saturating_add(1);
        let now = self.tick;
        let timeout = self.timeout_ticks;
        let stale: Vec<Uuid> = self
            .partials
            .iter()
            .filter(|(_, p)| now.saturating_sub(p.last_tick) > timeout)
            .map(|(&id, _)| id)
            .collect();
        for id in &stale {
            self.partials.remove(id);
        }
        stale
    }

    pub fn pending(&self) -> usize {
        self.partials.len()
    }

    pub fn is_pending(&self, message_id: &Uuid) -> bool {
        self.partials.contains_key(message_id)
    }

    pub fn clear(&mut self) {
        self.partials.clear();
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .partials
            .iter()
            .min_by_key(|(_, p)| p.last_tick)
            .map(|(&id, _)| id);
        if let Some(id) = oldest {
            tracing::warn!(message_id = %id, "evicting partial message at capacity");
            self.partials.remove(&id);
        }
    }

    fn remember_completed(&mut self, id: Uuid) {
        if self.completed_set.insert(id) {
            self.completed.push_back(id);
        }
        while self.completed.len() > RECENT_COMPLETED {
            if let Some(old) = self.completed.pop_front() {
                self.completed_set.remove(&old);
            }
        }
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_TIMEOUT_TICKS, DEFAULT_MAX_PARTIAL_MESSAGES)
    }
}
