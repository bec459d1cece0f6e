//! Document engine: one replica per shared page plus what the host last rendered.
//!
//! The rendered view only advances when the host acknowledges a patch, so a
//! host that failed to apply one catches up with the next.

use std::collections::HashMap;

use uuid::Uuid;

use crate::crdt::{
    DocumentError, DocumentView, ElementId, MergeOutcome, OpBatch, RangeAnnotation,
    ReplicatedDocument, Snapshot, VersionVector,
};
use crate::error::{Error, Result};
use crate::identity::NotebookId;
use crate::patch::{self, Patch};

/// An edit made in the host, in host positions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalEdit {
    Insert { index: usize, text: String },
    Delete { index: usize, count: usize },
    Annotate(RangeAnnotation),
    RemoveAnnotation(RangeAnnotation),
}

struct PageReplica {
    doc: ReplicatedDocument,
    rendered_ids: Vec<ElementId>,
    rendered: DocumentView,
}

impl PageReplica {
    fn in_sync(&self) -> bool {
        self.rendered_ids == self.doc.visible_ids() && self.rendered == self.doc.view()
    }

    fn mark_rendered(&mut self) {
        self.rendered_ids = self.doc.visible_ids();
        self.rendered = self.doc.view();
    }
}

pub struct DocumentEngine {
    actor: NotebookId,
    pages: HashMap<Uuid, PageReplica>,
}

impl DocumentEngine {
    pub fn new(actor: NotebookId) -> Self {
        Self {
            actor,
            pages: HashMap::new(),
        }
    }

    pub fn has_page(&self, page: &Uuid) -> bool {
        self.pages.contains_key(page)
    }

    /// Start replicating a page the host already shows as `initial`.
    /// Returns the batch that introduces that content.
    pub fn open(&mut self, page: Uuid, initial: &DocumentView) -> Option<OpBatch> {
        let mut doc = ReplicatedDocument::new(self.actor);
        let batch = doc.replace_content(initial);
        let mut replica = PageReplica {
            doc,
            rendered_ids: Vec::new(),
            rendered: DocumentView::default(),
        };
        replica.mark_rendered();
        self.pages.insert(page, replica);
        batch
    }

    /// Start replicating from a peer's snapshot. The host has not rendered anything yet.
    pub fn seed_from_snapshot(&mut self, page: Uuid, snapshot: Snapshot) -> Result<()> {
        let doc = ReplicatedDocument::from_snapshot(self.actor, snapshot)
            .map_err(|e| divergence(page, e))?;
        self.pages.insert(
            page,
            PageReplica {
                doc,
                rendered_ids: Vec::new(),
                rendered: DocumentView::default(),
            },
        );
        Ok(())
    }

    pub fn close(&mut self, page: &Uuid) -> bool {
        self.pages.remove(page).is_some()
    }

    /// Apply an edit the host already made. Returns the batch to send to peers.
    pub fn apply_local_edit(&mut self, page: &Uuid, edit: &LocalEdit) -> Result<Option<OpBatch>> {
        let replica = self.replica_mut(page)?;
        let was_in_sync = replica.in_sync();
        let batch = match edit {
            LocalEdit::Insert { index, text } => replica.doc.insert(*index, text),
            LocalEdit::Delete { index, count } => replica.doc.delete(*index, *count),
            LocalEdit::Annotate(range) => replica.doc.annotate(range),
            LocalEdit::RemoveAnnotation(range) => replica.doc.remove_annotation(range),
        }?;
        if was_in_sync {
            replica.mark_rendered();
        }
        Ok(batch)
    }

    /// Full-content refresh from the host, merged against what the host last rendered.
    pub fn refresh(&mut self, page: &Uuid, content: &DocumentView) -> Result<Option<OpBatch>> {
        let replica = self.replica_mut(page)?;
        let was_in_sync = replica.in_sync();
        let base_ids = replica.rendered_ids.clone();
        let base_text = replica.rendered.text.clone();
        let (batch, shown) = replica.doc.replace_from(&base_ids, &base_text, content);
        if was_in_sync {
            replica.mark_rendered();
        } else {
            // The host now shows `content`; what it lacks comes in the next patch.
            replica.rendered = content.clone();
            replica.rendered_ids = shown;
        }
        Ok(batch)
    }

    /// Merge a peer batch. A version gap is reported as divergence.
    pub fn merge_remote(&mut self, page: &Uuid, batch: &OpBatch) -> Result<MergeOutcome> {
        let replica = self.replica_mut(page)?;
        replica.doc.merge(batch).map_err(|e| divergence(*page, e))
    }

    /// Patch taking the host from its last rendered view to the replica's view.
    pub fn compute_local_patch(&self, page: &Uuid) -> Result<Option<Patch>> {
        let replica = self.replica(page)?;
        let view = replica.doc.view();
        let ops = if replica.rendered_ids.is_empty() && !replica.rendered.text.is_empty() {
            patch::diff_text(&replica.rendered.text, &view.text)
        } else {
            patch::diff_elements(&replica.rendered_ids, replica.doc.elements())
                .unwrap_or_else(|| patch::diff_text(&replica.rendered.text, &view.text))
        };
        let annotations = if view.annotations != replica.rendered.annotations {
            Some(view.annotations)
        } else {
            None
        };
        let patch = Patch { ops, annotations };
        Ok((!patch.is_empty()).then_some(patch))
    }

    /// The host applied the last computed patch.
    pub fn acknowledge_patch(&mut self, page: &Uuid) -> Result<()> {
        self.replica_mut(page)?.mark_rendered();
        Ok(())
    }

    /// Reinitialize from a peer snapshot. Returns our replayed batches to re-send.
    pub fn repair(&mut self, page: &Uuid, snapshot: Snapshot) -> Result<Vec<OpBatch>> {
        let replica = self.replica_mut(page)?;
        replica
            .doc
            .reinitialize(snapshot)
            .map_err(|e| divergence(*page, e))
    }

    pub fn missing_for(&self, page: &Uuid, seen: &VersionVector) -> Result<Option<Vec<OpBatch>>> {
        Ok(self.replica(page)?.doc.missing_for(seen))
    }

    pub fn seen(&self, page: &Uuid) -> Option<VersionVector> {
        self.pages.get(page).map(|r| r.doc.seen().clone())
    }

    pub fn snapshot(&self, page: &Uuid) -> Result<Snapshot> {
        Ok(self.replica(page)?.doc.snapshot())
    }

    pub fn view(&self, page: &Uuid) -> Option<DocumentView> {
        self.pages.get(page).map(|r| r.doc.view())
    }

    pub fn checksum(&self, page: &Uuid) -> Option<String> {
        self.pages.get(page).map(|r| r.doc.checksum())
    }

    fn replica(&self, page: &Uuid) -> Result<&PageReplica> {
        self.pages
            .get(page)
            .ok_or_else(|| Error::UnknownPage(page.to_string()))
    }

    fn replica_mut(&mut self, page: &Uuid) -> Result<&mut PageReplica> {
        self.pages
            .get_mut(page)
            .ok_or_else(|| Error::UnknownPage(page.to_string()))
    }
}

fn divergence(page: Uuid, e: DocumentError) -> Error {
    match e {
        DocumentError::VersionGap { .. } | DocumentError::CorruptSnapshot => {
            Error::DivergenceDetected {
                page,
                reason: e.to_string(),
            }
        }
        other => Error::from(other),
    }
}
