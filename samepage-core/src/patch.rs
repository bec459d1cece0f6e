//! Local patches: the edit a host applies to bring its rendered page up to date.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::crdt::{DocumentView, Element, ElementId, RangeAnnotation};

/// Character-indexed edit. Ops in a patch apply in order, each against the result of the previous.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PatchOp {
    Insert { index: usize, text: String },
    Delete { index: usize, count: usize },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Patch {
    pub ops: Vec<PatchOp>,
    /// Full replacement annotation list, present only when annotations changed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Vec<RangeAnnotation>>,
}

impl Patch {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty() && self.annotations.is_none()
    }

    pub fn apply_to_text(&self, text: &str) -> String {
        let mut chars: Vec<char> = text.chars().collect();
        for op in &self.ops {
            match op {
                PatchOp::Insert { index, text } => {
                    let at = (*index).min(chars.len());
                    chars.splice(at..at, text.chars());
                }
                PatchOp::Delete { index, count } => {
                    let start = (*index).min(chars.len());
                    let end = start.saturating_add(*count).min(chars.len());
                    chars.drain(start..end);
                }
            }
        }
        chars.into_iter().collect()
    }

    pub fn apply(&self, view: &DocumentView) -> DocumentView {
        DocumentView {
            text: self.apply_to_text(&view.text),
            annotations: self
                .annotations
                .clone()
                .unwrap_or_else(|| view.annotations.clone()),
        }
    }
}

fn push_insert(ops: &mut Vec<PatchOp>, index: usize, ch: char) {
    if let Some(PatchOp::Insert { index: at, text }) = ops.last_mut() {
        if *at + text.chars().count() == index {
            text.push(ch);
            return;
        }
    }
    ops.push(PatchOp::Insert {
        index,
        text: ch.to_string(),
    });
}

fn push_delete(ops: &mut Vec<PatchOp>, index: usize) {
    if let Some(PatchOp::Delete { index: at, count }) = ops.last_mut() {
        if *at == index {
            *count += 1;
            return;
        }
    }
    ops.push(PatchOp::Delete { index, count: 1 });
}

/// Diff by element identity. `rendered` is the id sequence the host currently shows.
/// Returns `None` if some rendered id is unknown to the replica (state was reinitialized).
pub fn diff_elements(rendered: &[ElementId], elements: &[Element]) -> Option<Vec<PatchOp>> {
    let shown: HashSet<ElementId> = rendered.iter().copied().collect();
    let known: HashSet<ElementId> = elements.iter().map(|e| e.id).collect();
    if !shown.is_subset(&known) {
        return None;
    }
    let mut ops = Vec::new();
    let mut pos = 0usize;
    for e in elements {
        match (shown.contains(&e.id), !e.deleted) {
            (true, true) => pos += 1,
            (true, false) => push_delete(&mut ops, pos),
            (false, true) => {
                push_insert(&mut ops, pos, e.value);
                pos += 1;
            }
            (false, false) => {}
        }
    }
    Some(ops)
}

/// Text-only diff: one delete and one insert around the common prefix and suffix.
pub fn diff_text(old: &str, new: &str) -> Vec<PatchOp> {
    let old: Vec<char> = old.chars().collect();
    let new: Vec<char> = new.chars().collect();
    let prefix = old.iter().zip(&new).take_while(|(a, b)| a == b).count();
    let max_suffix = old.len().min(new.len()) - prefix;
    let suffix = old
        .iter()
        .rev()
        .zip(new.iter().rev())
        .take(max_suffix)
        .take_while(|(a, b)| a == b)
        .count();
    let mut ops = Vec::new();
    let removed = old.len() - suffix - prefix;
    if removed > 0 {
        ops.push(PatchOp::Delete {
            index: prefix,
            count: removed,
        });
    }
    let inserted: String = new[prefix..new.len() - suffix].iter().collect();
    if !inserted.is_empty() {
        ops.push(PatchOp::Insert {
            index: prefix,
            text: inserted,
        });
    }
    ops
}
