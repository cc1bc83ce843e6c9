//! Per-element document store.
//!
//! The store owns one automerge document per bound element. The element's
//! value lives under the root key `value`. Until anything is written the
//! key is absent and reads fall back to the binding's default data.
//!
//! # Seeding
//!
//! The first local write materializes the default as "seed" changes. When
//! the document is still empty every map in the default and every leaf
//! under it is committed as its own change with timestamp 0. A map change
//! depends only on the change that created its parent map and is authored
//! by an actor derived from the document id and its key path. A leaf change
//! also folds the canonical leaf JSON into its actor. Clients seeding the
//! same field therefore produce byte-identical changes, which automerge
//! deduplicates by hash. Clients whose defaults differ still share every
//! map, so their pre-sync edits to different keys merge.
//!
//! Integer leaves at paths registered with [`DocumentStore::mark_counter`]
//! are seeded as automerge counters, so concurrent increments add up.
//!
//! # Conflicts
//!
//! Concurrent writes to the same scalar resolve with automerge's rule: the
//! operation with the greater Lamport counter wins, and equal counters
//! tie-break on the greater actor id (byte-wise).

use std::collections::HashMap;

use automerge::sync::{self, SyncDoc};
use automerge::transaction::CommitOptions;
use automerge::{
    transaction::Transactable, ActorId, AutoCommit, AutomergeError, ChangeHash, ObjId, ObjType,
    ScalarValue, ROOT,
};
use serde_json::Value;
use thiserror::Error;

use crate::crdt::{put_json, read_prop, Counters, Draft, Patch, Path};
use crate::document_id::{truncated_digest, DocumentId};
use crate::element::{ElementId, RoomId};

/// Root key holding an element's value.
pub const VALUE_KEY: &str = "value";

/// Errors returned by the document store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("element {0} is not bound")]
    NotBound(ElementId),

    #[error("automerge error: {0}")]
    Automerge(#[from] AutomergeError),

    #[error("failed to decode sync message: {0}")]
    Decode(String),
}

/// A write against an element.
#[derive(Debug, Clone)]
pub enum Update {
    /// Replace the whole value. Concurrent edits to the old value are lost.
    Replace(Value),
    /// Apply path-scoped edits recorded by a [`Draft`].
    Patches(Vec<Patch>),
}

/// Result of a local write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    pub applied: usize,
    pub skipped: usize,
}

/// An outgoing sync message for one document.
#[derive(Debug, Clone)]
pub struct OutgoingSync {
    pub document_id: DocumentId,
    pub element: ElementId,
    pub data: Vec<u8>,
    /// True for the first message of a connection, sent as a `request`.
    pub request: bool,
}

/// Result of merging a remote sync message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    pub element: ElementId,
    /// The merged value changed.
    pub changed: bool,
    /// This message completed the first remote snapshot for the element.
    pub first_sync: bool,
    /// The remote peer now holds every local write.
    pub flushed: bool,
}

struct Entry {
    document_id: DocumentId,
    doc: AutoCommit,
    default: Value,
    counters: Counters,
    bindings: usize,
    remote: sync::State,
    requested: bool,
    synced: bool,
    pending: bool,
}

/// All documents of one room, as seen by one connection.
pub struct DocumentStore {
    room: RoomId,
    actor: ActorId,
    entries: HashMap<ElementId, Entry>,
    by_document: HashMap<DocumentId, ElementId>,
}

impl DocumentStore {
    pub fn new(room: RoomId, actor: ActorId) -> Self {
        Self {
            room,
            actor,
            entries: HashMap::new(),
            by_document: HashMap::new(),
        }
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    pub fn actor(&self) -> &ActorId {
        &self.actor
    }

    /// Registers interest in an element and returns its current value.
    ///
    /// Repeated binds share one entry; the first bind's default wins.
    /// Returns `true` as the second element when the entry is new.
    pub fn bind(&mut self, element: &ElementId, default: Value) -> (Value, bool) {
        let created = !self.entries.contains_key(element);
        if created {
            let document_id = DocumentId::for_element(&self.room, element);
            let doc = AutoCommit::new().with_actor(self.actor.clone());
            self.entries.insert(
                element.clone(),
                Entry {
                    document_id,
                    doc,
                    default,
                    counters: Counters::default(),
                    bindings: 0,
                    remote: sync::State::new(),
                    requested: false,
                    synced: false,
                    pending: false,
                },
            );
            self.by_document.insert(document_id, element.clone());
        } else if let Some(entry) = self.entries.get(element) {
            if entry.default != default {
                tracing::debug!(
                    "element {} already bound with a different default; keeping the first",
                    element
                );
            }
        }

        if let Some(entry) = self.entries.get_mut(element) {
            entry.bindings += 1;
        }
        (self.read(element).unwrap_or(Value::Null), created)
    }

    /// Keeps integers at `path` inside the element's value as counters.
    pub fn mark_counter(&mut self, element: &ElementId, path: Path) {
        if let Some(entry) = self.entries.get_mut(element) {
            entry.counters.insert(path);
        }
    }

    /// Releases one binding. The document stays in the store so queued
    /// writes still reach the server; remote data is never deleted.
    pub fn unbind(&mut self, element: &ElementId) -> usize {
        match self.entries.get_mut(element) {
            Some(entry) => {
                entry.bindings = entry.bindings.saturating_sub(1);
                entry.bindings
            }
            None => 0,
        }
    }

    /// Number of live bindings for an element.
    pub fn bindings(&self, element: &ElementId) -> usize {
        self.entries.get(element).map(|e| e.bindings).unwrap_or(0)
    }

    /// Current merged value, or the default before anything was written
    /// or received. `None` only for elements that were never bound.
    pub fn read(&self, element: &ElementId) -> Option<Value> {
        let entry = self.entries.get(element)?;
        match read_prop(&entry.doc, &ROOT, VALUE_KEY) {
            Ok(Some(value)) => Some(value),
            Ok(None) => Some(entry.default.clone()),
            Err(e) => {
                tracing::warn!("failed to read element {}: {}", element, e);
                Some(entry.default.clone())
            }
        }
    }

    /// Applies a write locally. Delivery happens on the next sync round.
    pub fn write(
        &mut self,
        element: &ElementId,
        update: Update,
    ) -> Result<WriteOutcome, StoreError> {
        let entry = self
            .entries
            .get_mut(element)
            .ok_or_else(|| StoreError::NotBound(element.clone()))?;

        seed(entry)?;

        let mut outcome = WriteOutcome::default();
        match update {
            Update::Replace(value) => {
                put_json(&mut entry.doc, &ROOT, VALUE_KEY, &value)?;
                outcome.applied += 1;
            }
            Update::Patches(patches) => {
                for patch in &patches {
                    if patch.apply_doc(&mut entry.doc, &ROOT, VALUE_KEY)? {
                        outcome.applied += 1;
                    } else {
                        tracing::warn!(
                            "skipping edit on element {} that does not fit its shape: {}",
                            element,
                            patch
                        );
                        outcome.skipped += 1;
                    }
                }
            }
        }
        if outcome.applied > 0 && !entry.counters.is_empty() {
            entry.counters.normalize(&mut entry.doc, &ROOT, VALUE_KEY)?;
        }
        entry.doc.commit();

        if outcome.applied > 0 {
            entry.pending = true;
        }
        Ok(outcome)
    }

    /// Runs a mutator over a draft of the current value and applies the
    /// edits it recorded.
    pub fn mutate<F>(&mut self, element: &ElementId, mutator: F) -> Result<WriteOutcome, StoreError>
    where
        F: FnOnce(&mut Draft),
    {
        let current = self
            .read(element)
            .ok_or_else(|| StoreError::NotBound(element.clone()))?;
        let mut draft = Draft::new(current);
        mutator(&mut draft);
        self.write(element, Update::Patches(draft.into_patches()))
    }

    /// Whether the element has received its first remote snapshot.
    pub fn is_synced(&self, element: &ElementId) -> bool {
        self.entries.get(element).map(|e| e.synced).unwrap_or(false)
    }

    /// Whether local writes have not yet been acknowledged by the remote.
    pub fn has_pending_writes(&self, element: &ElementId) -> bool {
        self.entries.get(element).map(|e| e.pending).unwrap_or(false)
    }

    pub fn document_id(&self, element: &ElementId) -> Option<DocumentId> {
        self.entries.get(element).map(|e| e.document_id)
    }

    pub fn element_for(&self, document_id: &DocumentId) -> Option<&ElementId> {
        self.by_document.get(document_id)
    }

    pub fn elements(&self) -> impl Iterator<Item = &ElementId> {
        self.entries.keys()
    }

    /// Forgets per-connection sync state. Called for every new transport
    /// connection; the next round re-requests full state, which merges
    /// idempotently with what is already known.
    pub fn reset_sync(&mut self) {
        for entry in self.entries.values_mut() {
            entry.remote = sync::State::new();
            entry.requested = false;
        }
    }

    /// Produces the next sync message for an element, if one is needed.
    pub fn generate_sync_message(&mut self, element: &ElementId) -> Option<OutgoingSync> {
        let entry = self.entries.get_mut(element)?;
        let message = entry.doc.sync().generate_sync_message(&mut entry.remote)?;
        let request = !entry.requested;
        entry.requested = true;
        Some(OutgoingSync {
            document_id: entry.document_id,
            element: element.clone(),
            data: message.encode(),
            request,
        })
    }

    /// Merges a remote sync message. Messages for unknown documents are
    /// ignored and yield `Ok(None)`.
    pub fn receive_sync_message(
        &mut self,
        document_id: &DocumentId,
        data: &[u8],
    ) -> Result<Option<Received>, StoreError> {
        let Some(element) = self.by_document.get(document_id).cloned() else {
            return Ok(None);
        };
        let Some(entry) = self.entries.get_mut(&element) else {
            return Ok(None);
        };

        let message =
            sync::Message::decode(data).map_err(|e| StoreError::Decode(e.to_string()))?;

        let before = entry.doc.get_heads().to_vec();
        entry
            .doc
            .sync()
            .receive_sync_message(&mut entry.remote, message)?;
        let after = entry.doc.get_heads().to_vec();

        let their_heads = entry.remote.their_heads.clone();
        let caught_up = match &their_heads {
            Some(heads) => heads
                .iter()
                .all(|hash| entry.doc.get_change_by_hash(hash).is_some()),
            None => false,
        };

        let first_sync = caught_up && !entry.synced;
        let mut flushed = false;
        if caught_up {
            entry.synced = true;
            if entry.pending && their_heads.map(sorted) == Some(sorted(after.clone())) {
                entry.pending = false;
                flushed = true;
            }
        }

        Ok(Some(Received {
            element,
            changed: before != after,
            first_sync,
            flushed,
        }))
    }
}

fn sorted(mut heads: Vec<ChangeHash>) -> Vec<ChangeHash> {
    heads.sort();
    heads
}

/// Materializes the default value before the first local write.
fn seed(entry: &mut Entry) -> Result<(), AutomergeError> {
    if read_prop(&entry.doc, &ROOT, VALUE_KEY)?.is_some() {
        return Ok(());
    }
    if !entry.doc.get_heads().is_empty() {
        return put_json(&mut entry.doc, &ROOT, VALUE_KEY, &entry.default);
    }

    let seeder = Seeder {
        document_id: entry.document_id,
        counters: &entry.counters,
    };
    seeder.seed(
        &mut entry.doc,
        &[],
        &ROOT,
        &[VALUE_KEY.to_string()],
        &entry.default,
    )
}

struct Seeder<'a> {
    document_id: DocumentId,
    counters: &'a Counters,
}

impl Seeder<'_> {
    /// Commits `value` at `parent[path.last()]` in a fork of `doc` at
    /// `base`, merges the fork back and recurses into maps.
    fn seed(
        &self,
        doc: &mut AutoCommit,
        base: &[ChangeHash],
        parent: &ObjId,
        path: &[String],
        value: &Value,
    ) -> Result<(), AutomergeError> {
        let Some(key) = path.last() else {
            return Ok(());
        };
        let mut fork = if base.is_empty() {
            AutoCommit::new()
        } else {
            doc.fork_at(base)?
        };

        if let Value::Object(fields) = value {
            fork.set_actor(self.actor(b"map", path, &[]));
            let map = fork.put_object(parent, key.as_str(), ObjType::Map)?;
            let heads = merge_fork(doc, &mut fork)?;
            for (field, child) in fields {
                let mut child_path = path.to_vec();
                child_path.push(field.clone());
                self.seed(doc, &heads, &map, &child_path, child)?;
            }
            return Ok(());
        }

        let canonical = serde_json::to_vec(value).unwrap_or_default();
        let counter = value
            .as_i64()
            .filter(|_| self.counters.contains_keys(&path[1..]));
        match counter {
            Some(n) => {
                fork.set_actor(self.actor(b"counter", path, &canonical));
                fork.put(parent, key.as_str(), ScalarValue::counter(n))?;
            }
            None => {
                fork.set_actor(self.actor(b"leaf", path, &canonical));
                put_json(&mut fork, parent, key.as_str(), value)?;
            }
        }
        merge_fork(doc, &mut fork)?;
        Ok(())
    }

    fn actor(&self, kind: &[u8], path: &[String], canonical: &[u8]) -> ActorId {
        let path = serde_json::to_vec(path).unwrap_or_default();
        let digest = truncated_digest(&[
            b"seed:".as_slice(),
            kind,
            self.document_id.as_bytes().as_slice(),
            path.as_slice(),
            canonical,
        ]);
        ActorId::from(&digest[..])
    }
}

fn merge_fork(
    doc: &mut AutoCommit,
    fork: &mut AutoCommit,
) -> Result<Vec<ChangeHash>, AutomergeError> {
    fork.commit_with(CommitOptions::default().with_time(0));
    let heads = fork.get_heads();
    doc.merge(fork)?;
    Ok(heads)
}
