//! Explicit, path-scoped edits.
//!
//! A mutator never edits a document directly. It receives a [`Draft`], a
//! working copy of the current value that records every edit as a
//! [`Patch`]. The store then replays only those patches against the
//! automerge document, so concurrent edits from other connections to
//! paths the mutator did not touch survive the merge.

use std::fmt;

use automerge::{
    transaction::Transactable, AutoCommit, AutomergeError, ObjId, ObjType, Prop, ReadDoc,
    ScalarValue, Value as AmValue,
};
use serde_json::{Map, Value};

use super::value::{insert_json, put_json};

/// One step in a [`Path`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    Key(String),
    Index(usize),
}

impl Segment {
    pub(crate) fn as_key(&self) -> String {
        match self {
            Segment::Key(key) => key.clone(),
            Segment::Index(index) => index.to_string(),
        }
    }

    fn as_index(&self) -> Option<usize> {
        match self {
            Segment::Key(key) => key.parse().ok(),
            Segment::Index(index) => Some(*index),
        }
    }
}

/// Location inside an element value. The empty path is the value itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Path(Vec<Segment>);

impl Path {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.0.push(Segment::Key(key.into()));
        self
    }

    pub fn index(mut self, index: usize) -> Self {
        self.0.push(Segment::Index(index));
        self
    }

    /// Parses a dot-separated path such as `items.0.name`.
    ///
    /// Purely numeric segments become indices; they still address a map key
    /// of the same spelling when the container turns out to be a map.
    pub fn parse(raw: &str) -> Self {
        let segments = raw
            .split('.')
            .filter(|s| !s.is_empty())
            .map(|s| match s.parse::<usize>() {
                Ok(index) => Segment::Index(index),
                Err(_) => Segment::Key(s.to_string()),
            })
            .collect();
        Self(segments)
    }

    pub fn segments(&self) -> &[Segment] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    fn split_last(&self) -> Option<(&[Segment], &Segment)> {
        self.0.split_last().map(|(last, parent)| (parent, last))
    }
}

impl From<&str> for Path {
    fn from(raw: &str) -> Self {
        Self::parse(raw)
    }
}

impl From<Vec<Segment>> for Path {
    fn from(segments: Vec<Segment>) -> Self {
        Self(segments)
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.0.iter().map(Segment::as_key).collect();
        write!(f, "{}", rendered.join("."))
    }
}

/// A single recorded edit.
#[derive(Debug, Clone, PartialEq)]
pub enum Patch {
    /// Put `value` at `path`, creating missing intermediate maps.
    Set { path: Path, value: Value },
    /// Remove the map key or list element at `path`.
    Delete { path: Path },
    /// Append to the list at `path`, creating the list if absent.
    Push { path: Path, value: Value },
    /// Insert into the list at `path` before `index`.
    Insert {
        path: Path,
        index: usize,
        value: Value,
    },
    /// Add `by` to the number at `path`; a missing number counts as zero.
    /// Integers become automerge counters, so concurrent increments add up.
    Increment { path: Path, by: i64 },
}

impl Patch {
    pub fn path(&self) -> &Path {
        match self {
            Patch::Set { path, .. }
            | Patch::Delete { path }
            | Patch::Push { path, .. }
            | Patch::Insert { path, .. }
            | Patch::Increment { path, .. } => path,
        }
    }

    /// Applies the patch to a JSON value. Returns false if the path
    /// does not fit the value's current shape.
    pub fn apply_json(&self, target: &mut Value) -> bool {
        match self {
            Patch::Set { path, value } => match path.split_last() {
                None => {
                    *target = value.clone();
                    true
                }
                Some((parent, last)) => match walk_json(target, parent, true) {
                    Some(node) => set_json_child(node, last, value.clone()),
                    None => false,
                },
            },
            Patch::Delete { path } => match path.split_last() {
                None => {
                    *target = Value::Null;
                    true
                }
                Some((parent, last)) => match walk_json(target, parent, false) {
                    Some(Value::Object(map)) => map.remove(&last.as_key()).is_some(),
                    Some(Value::Array(items)) => match last.as_index() {
                        Some(index) if index < items.len() => {
                            items.remove(index);
                            true
                        }
                        _ => false,
                    },
                    _ => false,
                },
            },
            Patch::Push { path, value } => {
                let len = match list_json(target, path, true) {
                    Some(items) => items.len(),
                    None => return false,
                };
                insert_json_list(target, path, len, value)
            }
            Patch::Insert { path, index, value } => insert_json_list(target, path, *index, value),
            Patch::Increment { path, by } => {
                let (parent, last) = match path.split_last() {
                    Some(split) => split,
                    None => return increment_json(target, *by),
                };
                let node = match walk_json(target, parent, true) {
                    Some(node) => node,
                    None => return false,
                };
                match node {
                    Value::Object(map) => {
                        let slot = map.entry(last.as_key()).or_insert(Value::from(0));
                        increment_json(slot, *by)
                    }
                    Value::Array(items) => match last.as_index().and_then(|i| items.get_mut(i)) {
                        Some(slot) => increment_json(slot, *by),
                        None => false,
                    },
                    _ => false,
                }
            }
        }
    }

    /// Applies the patch to an automerge document whose element value lives
    /// at `container[prop]`. Returns `Ok(false)` if the path does not fit
    /// the document's current shape.
    pub fn apply_doc(
        &self,
        doc: &mut AutoCommit,
        container: &ObjId,
        prop: &str,
    ) -> Result<bool, AutomergeError> {
        let mut full = vec![Segment::Key(prop.to_string())];
        full.extend(self.path().segments().iter().cloned());
        let (last, parent) = match full.split_last() {
            Some(split) => split,
            None => return Ok(false),
        };

        match self {
            Patch::Set { value, .. } => {
                let Some(node) = walk_doc(doc, container, parent, true)? else {
                    return Ok(false);
                };
                match child_prop(doc, &node, last)? {
                    Some(target) => {
                        put_json(doc, &node, target, value)?;
                        Ok(true)
                    }
                    None => Ok(false),
                }
            }
            Patch::Delete { path } if path.is_root() => {
                doc.put(container, prop, ScalarValue::Null)?;
                Ok(true)
            }
            Patch::Delete { .. } => {
                let Some(node) = walk_doc(doc, container, parent, false)? else {
                    return Ok(false);
                };
                match child_prop(doc, &node, last)? {
                    Some(target) if doc.get(&node, target.clone())?.is_some() => {
                        doc.delete(&node, target)?;
                        Ok(true)
                    }
                    _ => Ok(false),
                }
            }
            Patch::Push { value, .. } => {
                let Some(list) = list_doc(doc, container, parent, last, true)? else {
                    return Ok(false);
                };
                let len = doc.length(&list);
                insert_json(doc, &list, len, value)?;
                Ok(true)
            }
            Patch::Insert { index, value, .. } => {
                let Some(list) = list_doc(doc, container, parent, last, false)? else {
                    return Ok(false);
                };
                if *index > doc.length(&list) {
                    return Ok(false);
                }
                insert_json(doc, &list, *index, value)?;
                Ok(true)
            }
            Patch::Increment { by, .. } => {
                let Some(node) = walk_doc(doc, container, parent, true)? else {
                    return Ok(false);
                };
                let Some(target) = child_prop(doc, &node, last)? else {
                    return Ok(false);
                };
                let current = match doc.get(&node, target.clone())? {
                    Some((AmValue::Scalar(scalar), _)) => match &*scalar {
                        ScalarValue::Counter(_) => Numeric::Counter,
                        ScalarValue::Int(n) => Numeric::Int(*n),
                        ScalarValue::Uint(n) => Numeric::Int(*n as i64),
                        ScalarValue::F64(f) => Numeric::Float(*f),
                        _ => Numeric::Other,
                    },
                    Some(_) => Numeric::Other,
                    None => Numeric::Missing,
                };
                match current {
                    Numeric::Counter => doc.increment(&node, target, *by)?,
                    Numeric::Int(n) => {
                        doc.put(&node, target, ScalarValue::counter(n.saturating_add(*by)))?
                    }
                    Numeric::Float(f) => doc.put(&node, target, f + *by as f64)?,
                    Numeric::Missing if matches!(target, Prop::Map(_)) => {
                        doc.put(&node, target, ScalarValue::counter(*by))?
                    }
                    Numeric::Missing | Numeric::Other => return Ok(false),
                }
                Ok(true)
            }
        }
    }
}

/// What an increment finds at its target.
enum Numeric {
    Counter,
    Int(i64),
    Float(f64),
    Missing,
    Other,
}

impl fmt::Display for Patch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Patch::Set { path, .. } => write!(f, "set {}", path),
            Patch::Delete { path } => write!(f, "delete {}", path),
            Patch::Push { path, .. } => write!(f, "push {}", path),
            Patch::Insert { path, index, .. } => write!(f, "insert {}[{}]", path, index),
            Patch::Increment { path, by } => write!(f, "increment {} by {}", path, by),
        }
    }
}

/// Paths inside an element value whose integers are kept as automerge
/// counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Counters(Vec<Path>);

impl Counters {
    pub fn insert(&mut self, path: Path) {
        if !self.0.contains(&path) {
            self.0.push(path);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether `keys`, spelled as map keys or list indices, names a
    /// counter path.
    pub fn contains_keys(&self, keys: &[String]) -> bool {
        self.0.iter().any(|path| {
            path.segments().len() == keys.len()
                && path
                    .segments()
                    .iter()
                    .zip(keys)
                    .all(|(segment, key)| segment.as_key() == *key)
        })
    }

    /// Turns plain integers at counter paths under `container[prop]` into
    /// counters. Existing counters are left alone so concurrent increments
    /// on them are kept. Returns the number of values converted.
    pub fn normalize(
        &self,
        doc: &mut AutoCommit,
        container: &ObjId,
        prop: &str,
    ) -> Result<usize, AutomergeError> {
        let mut converted = 0;
        for path in &self.0 {
            let mut full = vec![Segment::Key(prop.to_string())];
            full.extend(path.segments().iter().cloned());
            let Some((last, parent)) = full.split_last() else {
                continue;
            };
            let Some(node) = walk_doc(doc, container, parent, false)? else {
                continue;
            };
            let Some(target) = child_prop(doc, &node, last)? else {
                continue;
            };
            let current = match doc.get(&node, target.clone())? {
                Some((AmValue::Scalar(scalar), _)) => match &*scalar {
                    ScalarValue::Int(n) => Some(*n),
                    ScalarValue::Uint(n) => i64::try_from(*n).ok(),
                    _ => None,
                },
                _ => None,
            };
            if let Some(n) = current {
                doc.put(&node, target, ScalarValue::counter(n))?;
                converted += 1;
            }
        }
        Ok(converted)
    }
}

/// Working copy handed to mutators.
///
/// Reads see every edit made so far in the same mutator, so
/// `draft.increment("count", 1)` twice yields `count + 2`.
#[derive(Debug, Clone)]
pub struct Draft {
    working: Value,
    patches: Vec<Patch>,
}

impl Draft {
    pub fn new(current: Value) -> Self {
        Self {
            working: current,
            patches: Vec::new(),
        }
    }

    /// The working value including edits made so far.
    pub fn value(&self) -> &Value {
        &self.working
    }

    pub fn get(&self, path: impl Into<Path>) -> Option<&Value> {
        let path = path.into();
        let mut node = &self.working;
        for segment in path.segments() {
            node = match node {
                Value::Object(map) => map.get(&segment.as_key())?,
                Value::Array(items) => items.get(segment.as_index()?)?,
                _ => return None,
            };
        }
        Some(node)
    }

    pub fn set(&mut self, path: impl Into<Path>, value: impl Into<Value>) -> &mut Self {
        self.record(Patch::Set {
            path: path.into(),
            value: value.into(),
        })
    }

    pub fn delete(&mut self, path: impl Into<Path>) -> &mut Self {
        self.record(Patch::Delete { path: path.into() })
    }

    pub fn push(&mut self, path: impl Into<Path>, value: impl Into<Value>) -> &mut Self {
        self.record(Patch::Push {
            path: path.into(),
            value: value.into(),
        })
    }

    pub fn insert(
        &mut self,
        path: impl Into<Path>,
        index: usize,
        value: impl Into<Value>,
    ) -> &mut Self {
        self.record(Patch::Insert {
            path: path.into(),
            index,
            value: value.into(),
        })
    }

    pub fn increment(&mut self, path: impl Into<Path>, by: i64) -> &mut Self {
        self.record(Patch::Increment {
            path: path.into(),
            by,
        })
    }

    pub fn patches(&self) -> &[Patch] {
        &self.patches
    }

    pub fn into_patches(self) -> Vec<Patch> {
        self.patches
    }

    fn record(&mut self, patch: Patch) -> &mut Self {
        if !patch.apply_json(&mut self.working) {
            tracing::debug!("draft edit does not fit current shape: {}", patch);
        }
        self.patches.push(patch);
        self
    }
}

// ---------------------------------------------------------------------------
// JSON helpers
// ---------------------------------------------------------------------------

fn walk_json<'a>(
    mut node: &'a mut Value,
    segments: &[Segment],
    create: bool,
) -> Option<&'a mut Value> {
    for segment in segments {
        node = match node {
            Value::Object(map) => {
                let key = segment.as_key();
                if create {
                    map.entry(key)
                        .or_insert_with(|| Value::Object(Map::new()))
                } else {
                    map.get_mut(&key)?
                }
            }
            Value::Array(items) => items.get_mut(segment.as_index()?)?,
            _ => return None,
        };
    }
    Some(node)
}

fn set_json_child(node: &mut Value, last: &Segment, value: Value) -> bool {
    match node {
        Value::Object(map) => {
            map.insert(last.as_key(), value);
            true
        }
        Value::Array(items) => match last.as_index() {
            Some(index) if index < items.len() => {
                items[index] = value;
                true
            }
            _ => false,
        },
        _ => false,
    }
}

fn list_json<'a>(target: &'a mut Value, path: &Path, create: bool) -> Option<&'a mut Vec<Value>> {
    let node = match path.split_last() {
        None => target,
        Some((parent, last)) => {
            let parent = walk_json(target, parent, create)?;
            match parent {
                Value::Object(map) => {
                    let key = last.as_key();
                    if create {
                        map.entry(key).or_insert_with(|| Value::Array(Vec::new()))
                    } else {
                        map.get_mut(&key)?
                    }
                }
                Value::Array(items) => items.get_mut(last.as_index()?)?,
                _ => return None,
            }
        }
    };
    match node {
        Value::Array(items) => Some(items),
        _ => None,
    }
}

fn insert_json_list(target: &mut Value, path: &Path, index: usize, value: &Value) -> bool {
    match list_json(target, path, false) {
        Some(items) if index <= items.len() => {
            items.insert(index, value.clone());
            true
        }
        _ => false,
    }
}

fn increment_json(slot: &mut Value, by: i64) -> bool {
    let next = if let Some(n) = slot.as_i64() {
        Value::from(n.saturating_add(by))
    } else if let Some(f) = slot.as_f64() {
        Value::from(f + by as f64)
    } else {
        return false;
    };
    *slot = next;
    true
}

// ---------------------------------------------------------------------------
// Automerge helpers
// ---------------------------------------------------------------------------

/// Resolves a segment to a property of `node`, honoring its container type.
fn child_prop(
    doc: &AutoCommit,
    node: &ObjId,
    segment: &Segment,
) -> Result<Option<Prop>, AutomergeError> {
    Ok(match doc.object_type(node)? {
        ObjType::List => match segment.as_index() {
            Some(index) if index < doc.length(node) => Some(Prop::Seq(index)),
            _ => None,
        },
        ObjType::Text => None,
        _ => Some(Prop::Map(segment.as_key())),
    })
}

fn walk_doc(
    doc: &mut AutoCommit,
    container: &ObjId,
    segments: &[Segment],
    create: bool,
) -> Result<Option<ObjId>, AutomergeError> {
    let mut node = container.clone();
    for segment in segments {
        let Some(prop) = child_prop(doc, &node, segment)? else {
            return Ok(None);
        };
        let existing = match doc.get(&node, prop.clone())? {
            Some((AmValue::Object(ObjType::Text), _)) | Some((AmValue::Scalar(_), _)) => {
                return Ok(None)
            }
            Some((AmValue::Object(_), id)) => Some(id),
            None => None,
        };
        node = match (existing, prop) {
            (Some(id), _) => id,
            (None, Prop::Map(key)) if create => doc.put_object(&node, key.as_str(), ObjType::Map)?,
            (None, _) => return Ok(None),
        };
    }
    Ok(Some(node))
}

fn list_doc(
    doc: &mut AutoCommit,
    container: &ObjId,
    parent: &[Segment],
    last: &Segment,
    create: bool,
) -> Result<Option<ObjId>, AutomergeError> {
    let Some(node) = walk_doc(doc, container, parent, create)? else {
        return Ok(None);
    };
    let Some(prop) = child_prop(doc, &node, last)? else {
        return Ok(None);
    };
    let existing = match doc.get(&node, prop.clone())? {
        Some((AmValue::Object(ObjType::List), id)) => Some(id),
        Some(_) => return Ok(None),
        None => None,
    };
    match (existing, prop) {
        (Some(id), _) => Ok(Some(id)),
        (None, Prop::Map(key)) if create => {
            Ok(Some(doc.put_object(&node, key.as_str(), ObjType::List)?))
        }
        (None, _) => Ok(None),
    }
}
