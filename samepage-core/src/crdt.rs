//! Replicated page document: RGA character sequence plus range annotations
//! anchored on element ids.
//!
//! Every character gets an `ElementId` (Lamport counter, notebook). An insert
//! names the element it was typed after; concurrent inserts after the same
//! element are ordered by descending id, so all replicas agree on the final
//! sequence whatever the arrival order. Deletes leave tombstones. Ops whose
//! anchors have not arrived yet are parked and retried after every merge.
//!
//! Batches are numbered per actor. A batch is applied only when it is the
//! next one expected from its actor; older ones are duplicates, newer ones
//! mean we missed something and the page needs a repair.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::identity::NotebookId;
use crate::integrity::ChecksumBuilder;

/// Last batch version applied per actor.
pub type VersionVector = BTreeMap<NotebookId, u64>;

/// Stable identity of one character (and of one annotation). Ordered by counter, then actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ElementId {
    pub counter: u64,
    pub actor: NotebookId,
}

/// Annotation as the host sees it: a half-open range of visible positions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RangeAnnotation {
    pub start: usize,
    pub end: usize,
    pub kind: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl RangeAnnotation {
    pub fn new(start: usize, end: usize, kind: impl Into<String>) -> Self {
        Self {
            start,
            end,
            kind: kind.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// Annotation as replicated: anchored on the first and last covered element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Annotation {
    pub id: ElementId,
    pub start: ElementId,
    pub end: ElementId,
    pub kind: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// Rendered page content: what a host reads and writes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentView {
    pub text: String,
    #[serde(default)]
    pub annotations: Vec<RangeAnnotation>,
}

impl DocumentView {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            annotations: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Op {
    Insert {
        id: ElementId,
        after: Option<ElementId>,
        value: char,
    },
    Delete {
        target: ElementId,
    },
    Annotate {
        annotation: Annotation,
    },
    Unannotate {
        target: ElementId,
    },
}

/// Ops produced by one local change. `version` is the actor's batch number;
/// the batch was derived from `version - 1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpBatch {
    pub actor: NotebookId,
    pub version: u64,
    pub ops: Vec<Op>,
}

impl OpBatch {
    pub fn parent_version(&self) -> u64 {
        self.version.saturating_sub(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Element {
    pub id: ElementId,
    pub value: char,
    pub deleted: bool,
}

/// Full replica state, used to seed new members and to repair diverged ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub elements: Vec<Element>,
    pub annotations: Vec<Annotation>,
    pub removed_annotations: Vec<ElementId>,
    pub clock: u64,
    pub seen: VersionVector,
    pub checksum: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Applied,
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DocumentError {
    #[error("position {index} is outside the document (length {len})")]
    OutOfRange { index: usize, len: usize },
    #[error("annotation range {start}..{end} is empty or reversed")]
    InvalidRange { start: usize, end: usize },
    #[error("no matching annotation")]
    UnknownAnnotation,
    #[error("expected version {expected} from {actor}, received {received}")]
    VersionGap {
        actor: NotebookId,
        expected: u64,
        received: u64,
    },
    #[error("snapshot checksum mismatch")]
    CorruptSnapshot,
}

pub struct ReplicatedDocument {
    actor: NotebookId,
    clock: u64,
    elements: Vec<Element>,
    ids: HashSet<ElementId>,
    annotations: BTreeMap<ElementId, Annotation>,
    removed_annotations: BTreeSet<ElementId>,
    seen: VersionVector,
    /// Ops whose anchors have not arrived yet.
    pending: Vec<Op>,
    /// Batches applied since `history_floor`, in application order.
    history: Vec<OpBatch>,
    history_floor: VersionVector,
}

impl ReplicatedDocument {
    pub fn new(actor: NotebookId) -> Self {
        Self {
            actor,
            clock: 0,
            elements: Vec::new(),
            ids: HashSet::new(),
            annotations: BTreeMap::new(),
            removed_annotations: BTreeSet::new(),
            seen: VersionVector::new(),
            pending: Vec::new(),
            history: Vec::new(),
            history_floor: VersionVector::new(),
        }
    }

    /// Rebuild a replica from a peer snapshot. Fails if the checksum does not match the content.
    pub fn from_snapshot(actor: NotebookId, snapshot: Snapshot) -> Result<Self, DocumentError> {
        let mut doc = Self::new(actor);
        doc.ids = snapshot.elements.iter().map(|e| e.id).collect();
        doc.elements = snapshot.elements;
        doc.annotations = snapshot
            .annotations
            .into_iter()
            .map(|a| (a.id, a))
            .collect();
        doc.removed_annotations = snapshot.removed_annotations.into_iter().collect();
        doc.clock = snapshot.clock;
        doc.history_floor = snapshot.seen.clone();
        doc.seen = snapshot.seen;
        if doc.ids.len() != doc.elements.len() || doc.checksum() != snapshot.checksum {
            return Err(DocumentError::CorruptSnapshot);
        }
        Ok(doc)
    }

    pub fn actor(&self) -> NotebookId {
        self.actor
    }

    /// This replica's own batch counter.
    pub fn version(&self) -> u64 {
        self.seen.get(&self.actor).copied().unwrap_or(0)
    }

    pub fn seen(&self) -> &VersionVector {
        &self.seen
    }

    pub fn len(&self) -> usize {
        self.elements.iter().filter(|e| !e.deleted).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn text(&self) -> String {
        self.elements
            .iter()
            .filter(|e| !e.deleted)
            .map(|e| e.value)
            .collect()
    }

    pub fn contains(&self, id: &ElementId) -> bool {
        self.ids.contains(id)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn elements(&self) -> &[Element] {
        &self.elements
    }

    pub(crate) fn visible_ids(&self) -> Vec<ElementId> {
        self.elements
            .iter()
            .filter(|e| !e.deleted)
            .map(|e| e.id)
            .collect()
    }

    pub fn view(&self) -> DocumentView {
        DocumentView {
            text: self.text(),
            annotations: self
                .annotation_views()
                .into_iter()
                .map(|(_, a)| a)
                .collect(),
        }
    }

    /// Live annotations mapped to visible positions, ordered by annotation id.
    /// Annotations whose whole range was deleted are omitted.
    pub(crate) fn annotation_views(&self) -> Vec<(ElementId, RangeAnnotation)> {
        let mut offsets: HashMap<ElementId, (usize, bool)> = HashMap::new();
        let mut visible = 0usize;
        for e in &self.elements {
            offsets.insert(e.id, (visible, !e.deleted));
            if !e.deleted {
                visible += 1;
            }
        }
        let mut out = Vec::new();
        for (id, ann) in &self.annotations {
            let (Some(&(start, _)), Some(&(end_off, end_visible))) =
                (offsets.get(&ann.start), offsets.get(&ann.end))
            else {
                continue;
            };
            let end = if end_visible { end_off + 1 } else { end_off };
            if end > start {
                out.push((
                    *id,
                    RangeAnnotation {
                        start,
                        end,
                        kind: ann.kind.clone(),
                        attributes: ann.attributes.clone(),
                    },
                ));
            }
        }
        out
    }

    /// Insert `text` before visible position `index`.
    pub fn insert(&mut self, index: usize, text: &str) -> Result<Option<OpBatch>, DocumentError> {
        let visible = self.visible_ids();
        if index > visible.len() {
            return Err(DocumentError::OutOfRange {
                index,
                len: visible.len(),
            });
        }
        let after = index.checked_sub(1).map(|i| visible[i]);
        let ops = self.insert_chars(after, text.chars());
        Ok(self.commit(ops))
    }

    /// Delete `count` visible characters starting at `index`.
    pub fn delete(&mut self, index: usize, count: usize) -> Result<Option<OpBatch>, DocumentError> {
        let visible = self.visible_ids();
        let end = index.saturating_add(count);
        if end > visible.len() {
            return Err(DocumentError::OutOfRange {
                index: end,
                len: visible.len(),
            });
        }
        let ops = self.delete_ids(&visible[index..end]);
        Ok(self.commit(ops))
    }

    pub fn annotate(&mut self, range: &RangeAnnotation) -> Result<Option<OpBatch>, DocumentError> {
        let visible = self.visible_ids();
        if range.start >= range.end {
            return Err(DocumentError::InvalidRange {
                start: range.start,
                end: range.end,
            });
        }
        if range.end > visible.len() {
            return Err(DocumentError::OutOfRange {
                index: range.end,
                len: visible.len(),
            });
        }
        let op = self.annotate_op(&visible, range);
        Ok(self.commit(vec![op]))
    }

    /// Remove the first live annotation equal to `range`.
    pub fn remove_annotation(
        &mut self,
        range: &RangeAnnotation,
    ) -> Result<Option<OpBatch>, DocumentError> {
        let target = self
            .annotation_views()
            .into_iter()
            .find(|(_, a)| a == range)
            .map(|(id, _)| id)
            .ok_or(DocumentError::UnknownAnnotation)?;
        let op = Op::Unannotate { target };
        self.apply_op(&op);
        Ok(self.commit(vec![op]))
    }

    /// Directed merge towards `target`: the smallest text edit (common prefix
    /// and suffix kept) plus annotation adds/removes. Elements not touched by
    /// the edit keep their ids, so concurrent remote edits still land.
    pub fn replace_content(&mut self, target: &DocumentView) -> Option<OpBatch> {
        let base = self.visible_ids();
        let text = self.text();
        self.replace_from(&base, &text, target).0
    }

    /// Directed merge from a view rendered earlier. `base` holds the element id
    /// behind each character of `base_text`; changes the viewer never saw are
    /// kept. Falls back to the current text if `base` is not from this replica.
    ///
    /// Also returns the element id behind each character of `target.text`.
    pub fn replace_from(
        &mut self,
        base: &[ElementId],
        base_text: &str,
        target: &DocumentView,
    ) -> (Option<OpBatch>, Vec<ElementId>) {
        let current: Vec<char> = base_text.chars().collect();
        if current.len() != base.len() || base.iter().any(|id| !self.ids.contains(id)) {
            let base = self.visible_ids();
            let text = self.text();
            return self.replace_from(&base, &text, target);
        }
        let wanted: Vec<char> = target.text.chars().collect();
        let prefix = current
            .iter()
            .zip(&wanted)
            .take_while(|(a, b)| a == b)
            .count();
        let max_suffix = current.len().min(wanted.len()) - prefix;
        let suffix = current
            .iter()
            .rev()
            .zip(wanted.iter().rev())
            .take(max_suffix)
            .take_while(|(a, b)| a == b)
            .count();

        let doomed: Vec<ElementId> = base[prefix..current.len() - suffix]
            .iter()
            .filter(|id| self.is_visible(id))
            .copied()
            .collect();
        let mut ops = self.delete_ids(&doomed);
        let after = prefix.checked_sub(1).map(|i| base[i]);
        let inserted = self.insert_chars(after, wanted[prefix..wanted.len() - suffix].iter().copied());
        let mut shown: Vec<ElementId> = base[..prefix].to_vec();
        shown.extend(inserted.iter().filter_map(|op| match op {
            Op::Insert { id, .. } => Some(*id),
            _ => None,
        }));
        shown.extend_from_slice(&base[current.len() - suffix..]);
        ops.extend(inserted);

        let mut desired: Vec<&RangeAnnotation> = target.annotations.iter().collect();
        for (id, existing) in self.annotation_views() {
            match desired.iter().position(|d| **d == existing) {
                Some(pos) => {
                    desired.remove(pos);
                }
                None => {
                    let op = Op::Unannotate { target: id };
                    self.apply_op(&op);
                    ops.push(op);
                }
            }
        }
        let visible = self.visible_ids();
        for range in desired {
            if range.start < range.end && range.end <= visible.len() {
                ops.push(self.annotate_op(&visible, range));
            }
        }
        (self.commit(ops), shown)
    }

    /// Apply a peer's batch. Idempotent; a batch that skips versions is refused.
    pub fn merge(&mut self, batch: &OpBatch) -> Result<MergeOutcome, DocumentError> {
        let seen = self.seen.get(&batch.actor).copied().unwrap_or(0);
        if batch.version <= seen {
            return Ok(MergeOutcome::Duplicate);
        }
        if batch.version > seen + 1 {
            return Err(DocumentError::VersionGap {
                actor: batch.actor,
                expected: seen + 1,
                received: batch.version,
            });
        }
        for op in &batch.ops {
            if !self.apply_op(op) {
                self.pending.push(op.clone());
            }
        }
        self.drain_pending();
        self.seen.insert(batch.actor, batch.version);
        self.history.push(batch.clone());
        Ok(MergeOutcome::Applied)
    }

    /// Batches a peer at `their` version vector is missing, or `None` when our
    /// history no longer reaches back that far (send a snapshot instead).
    pub fn missing_for(&self, their: &VersionVector) -> Option<Vec<OpBatch>> {
        let behind = |actor: &NotebookId| their.get(actor).copied().unwrap_or(0);
        if self
            .history_floor
            .iter()
            .any(|(actor, floor)| behind(actor) < *floor)
        {
            return None;
        }
        Some(
            self.history
                .iter()
                .filter(|b| b.version > behind(&b.actor))
                .cloned()
                .collect(),
        )
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            elements: self.elements.clone(),
            annotations: self.annotations.values().cloned().collect(),
            removed_annotations: self.removed_annotations.iter().copied().collect(),
            clock: self.clock,
            seen: self.seen.clone(),
            checksum: self.checksum(),
        }
    }

    /// Replace this replica with `snapshot`, then replay our own batches the
    /// snapshot has not seen. Returns the replayed batches so they can be re-sent.
    pub fn reinitialize(&mut self, snapshot: Snapshot) -> Result<Vec<OpBatch>, DocumentError> {
        let mut fresh = Self::from_snapshot(self.actor, snapshot)?;
        let covered = fresh.version();
        let unsent: Vec<OpBatch> = self
            .history
            .iter()
            .filter(|b| b.actor == self.actor && b.version > covered)
            .cloned()
            .collect();
        fresh.clock = fresh.clock.max(self.clock);
        for batch in &unsent {
            for op in &batch.ops {
                if !fresh.apply_op(op) {
                    fresh.pending.push(op.clone());
                }
            }
        }
        fresh.drain_pending();
        fresh.seen.insert(self.actor, covered.max(self.version()));
        fresh.history.extend(unsent.iter().cloned());
        *self = fresh;
        Ok(unsent)
    }

    /// Digest of the replicated state (elements, tombstones, annotations).
    pub fn checksum(&self) -> String {
        let mut c = ChecksumBuilder::new();
        for e in &self.elements {
            c.update_id(&e.id)
                .update(&(e.value as u32).to_le_bytes())
                .update(&[e.deleted as u8]);
        }
        for a in self.annotations.values() {
            c.update_id(&a.id)
                .update_id(&a.start)
                .update_id(&a.end)
                .update_str(&a.kind);
            for (k, v) in &a.attributes {
                c.update_str(k).update_str(v);
            }
        }
        for id in &self.removed_annotations {
            c.update_id(id);
        }
        c.finish_hex()
    }

    fn next_id(&mut self) -> ElementId {
        self.clock += 1;
        ElementId {
            counter: self.clock,
            actor: self.actor,
        }
    }

    fn insert_chars(
        &mut self,
        mut after: Option<ElementId>,
        chars: impl Iterator<Item = char>,
    ) -> Vec<Op> {
        let mut ops = Vec::new();
        for value in chars {
            let id = self.next_id();
            let op = Op::Insert { id, after, value };
            self.apply_op(&op);
            ops.push(op);
            after = Some(id);
        }
        ops
    }

    fn delete_ids(&mut self, targets: &[ElementId]) -> Vec<Op> {
        targets
            .iter()
            .map(|&target| {
                let op = Op::Delete { target };
                self.apply_op(&op);
                op
            })
            .collect()
    }

    fn annotate_op(&mut self, visible: &[ElementId], range: &RangeAnnotation) -> Op {
        let op = Op::Annotate {
            annotation: Annotation {
                id: self.next_id(),
                start: visible[range.start],
                end: visible[range.end - 1],
                kind: range.kind.clone(),
                attributes: range.attributes.clone(),
            },
        };
        self.apply_op(&op);
        op
    }

    fn commit(&mut self, ops: Vec<Op>) -> Option<OpBatch> {
        if ops.is_empty() {
            return None;
        }
        let version = self.version() + 1;
        self.seen.insert(self.actor, version);
        let batch = OpBatch {
            actor: self.actor,
            version,
            ops,
        };
        self.history.push(batch.clone());
        Some(batch)
    }

    fn is_visible(&self, id: &ElementId) -> bool {
        self.position(id)
            .is_some_and(|p| !self.elements[p].deleted)
    }

    fn position(&self, id: &ElementId) -> Option<usize> {
        self.elements.iter().position(|e| e.id == *id)
    }

    /// Returns false when the op's anchor is not present yet.
    fn apply_op(&mut self, op: &Op) -> bool {
        match op {
            Op::Insert { id, after, value } => {
                if self.ids.contains(id) {
                    return true;
                }
                let mut pos = match after {
                    None => 0,
                    Some(anchor) => match self.position(anchor) {
                        Some(p) => p + 1,
                        None => return false,
                    },
                };
                while pos < self.elements.len() && self.elements[pos].id > *id {
                    pos += 1;
                }
                self.elements.insert(
                    pos,
                    Element {
                        id: *id,
                        value: *value,
                        deleted: false,
                    },
                );
                self.ids.insert(*id);
                self.clock = self.clock.max(id.counter);
                true
            }
            Op::Delete { target } => match self.position(target) {
                Some(p) => {
                    self.elements[p].deleted = true;
                    true
                }
                None => false,
            },
            Op::Annotate { annotation } => {
                self.clock = self.clock.max(annotation.id.counter);
                if self.annotations.contains_key(&annotation.id)
                    || self.removed_annotations.contains(&annotation.id)
                {
                    return true;
                }
                if !self.ids.contains(&annotation.start) || !self.ids.contains(&annotation.end) {
                    return false;
                }
                self.annotations.insert(annotation.id, annotation.clone());
                true
            }
            Op::Unannotate { target } => {
                self.annotations.remove(target);
                self.removed_annotations.insert(*target);
                true
            }
        }
    }

    fn drain_pending(&mut self) {
        loop {
            let before = self.pending.len();
            for op in std::mem::take(&mut self.pending) {
                if !self.apply_op(&op) {
                    self.pending.push(op);
                }
            }
            if self.pending.len() == before {
                break;
            }
        }
    }
}
