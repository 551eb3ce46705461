//! In-memory document collection.
//!
//! # Design
//! - Every operation takes the collection lock once and finishes under it, so
//!   `find_one_and_update` is atomic: two callers racing on the same filter
//!   see exactly one winner.
//! - Declared indexes map `field -> value key -> ids` and narrow the candidate
//!   set for equality / `In` filters before the full predicate runs.
//! - The whole collection can be saved to / loaded from a JSON snapshot.
//!   `SnapshotCollection` builds the cross-process store on top of that.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::ports::{
    Document, DocumentCollection, Filter, FindOptions, ID_FIELD, IdGenerator, Order, StoreError,
    SystemClock, UlidGenerator, Update,
};

/// Compiled form of a `Filter` (regexes built once per query).
enum Matcher {
    All,
    Eq(String, Value),
    Ne(String, Value),
    In(String, Vec<Value>),
    Exists(String, bool),
    Regex(String, Regex),
    Lt(String, Value),
    And(Vec<Matcher>),
    Or(Vec<Matcher>),
}

impl Matcher {
    fn compile(filter: &Filter) -> Result<Self, StoreError> {
        Ok(match filter {
            Filter::All => Matcher::All,
            Filter::Eq(f, v) => Matcher::Eq(f.clone(), v.clone()),
            Filter::Ne(f, v) => Matcher::Ne(f.clone(), v.clone()),
            Filter::In(f, vs) => Matcher::In(f.clone(), vs.clone()),
            Filter::Exists(f, present) => Matcher::Exists(f.clone(), *present),
            Filter::Regex(f, pattern) => Matcher::Regex(
                f.clone(),
                Regex::new(pattern)
                    .map_err(|e| StoreError::InvalidFilter(format!("{f}: {e}")))?,
            ),
            Filter::Lt(f, v) => Matcher::Lt(f.clone(), v.clone()),
            Filter::And(parts) => {
                Matcher::And(parts.iter().map(Matcher::compile).collect::<Result<_, _>>()?)
            }
            Filter::Or(parts) => {
                Matcher::Or(parts.iter().map(Matcher::compile).collect::<Result<_, _>>()?)
            }
        })
    }

    fn matches(&self, doc: &Document) -> bool {
        match self {
            Matcher::All => true,
            Matcher::Eq(f, v) => value_eq(get_path(doc, f), v),
            Matcher::Ne(f, v) => !value_eq(get_path(doc, f), v),
            Matcher::In(f, vs) => {
                let actual = get_path(doc, f);
                vs.iter().any(|v| value_eq(actual, v))
            }
            Matcher::Exists(f, present) => {
                let exists = !matches!(get_path(doc, f), None | Some(Value::Null));
                exists == *present
            }
            Matcher::Regex(f, re) => match get_path(doc, f) {
                Some(Value::String(s)) => re.is_match(s),
                Some(Value::Array(items)) => items
                    .iter()
                    .any(|item| item.as_str().is_some_and(|s| re.is_match(s))),
                _ => false,
            },
            Matcher::Lt(f, v) => match get_path(doc, f) {
                None | Some(Value::Null) => false,
                Some(actual) => compare_values(actual, v) == Ordering::Less,
            },
            Matcher::And(parts) => parts.iter().all(|m| m.matches(doc)),
            Matcher::Or(parts) => parts.iter().any(|m| m.matches(doc)),
        }
    }
}

/// Collection contents plus secondary indexes.
#[derive(Default)]
struct CollectionState {
    /// All documents by `_id` (single source of truth).
    documents: BTreeMap<String, Document>,

    /// field -> value key -> ids
    indexes: BTreeMap<String, HashMap<String, BTreeSet<String>>>,
}

impl CollectionState {
    fn index_document(&mut self, id: &str, doc: &Document) {
        for (field, index) in self.indexes.iter_mut() {
            for key in index_keys(doc, field) {
                index.entry(key).or_default().insert(id.to_string());
            }
        }
    }

    fn unindex_document(&mut self, id: &str, doc: &Document) {
        for (field, index) in self.indexes.iter_mut() {
            for key in index_keys(doc, field) {
                if let Some(ids) = index.get_mut(&key) {
                    ids.remove(id);
                    if ids.is_empty() {
                        index.remove(&key);
                    }
                }
            }
        }
    }

    /// Ids that may match, or `None` when the filter needs a full scan.
    fn candidates(&self, matcher: &Matcher) -> Option<BTreeSet<String>> {
        match matcher {
            Matcher::Eq(f, v) if f == ID_FIELD => Some(
                v.as_str()
                    .filter(|id| self.documents.contains_key(*id))
                    .map(|id| BTreeSet::from([id.to_string()]))
                    .unwrap_or_default(),
            ),
            Matcher::Eq(f, v) => {
                let index = self.indexes.get(f)?;
                Some(index.get(&value_key(v)).cloned().unwrap_or_default())
            }
            Matcher::In(f, vs) => {
                let index = self.indexes.get(f)?;
                Some(
                    vs.iter()
                        .filter_map(|v| index.get(&value_key(v)))
                        .flatten()
                        .cloned()
                        .collect(),
                )
            }
            Matcher::And(parts) => parts
                .iter()
                .filter_map(|part| self.candidates(part))
                .reduce(|acc, next| acc.intersection(&next).cloned().collect()),
            _ => None,
        }
    }

    fn matching_ids(&self, matcher: &Matcher) -> Vec<String> {
        match self.candidates(matcher) {
            Some(ids) => ids
                .into_iter()
                .filter(|id| self.documents.get(id).is_some_and(|d| matcher.matches(d)))
                .collect(),
            None => self
                .documents
                .iter()
                .filter(|(_, d)| matcher.matches(d))
                .map(|(id, _)| id.clone())
                .collect(),
        }
    }

    fn insert(&mut self, id: String, doc: Document) -> Result<(), StoreError> {
        if self.documents.contains_key(&id) {
            return Err(StoreError::InvalidDocument(format!("duplicate key `{id}`")));
        }
        self.index_document(&id, &doc);
        self.documents.insert(id, doc);
        Ok(())
    }

    fn replace(&mut self, id: &str, doc: Document) {
        if let Some(old) = self.documents.remove(id) {
            self.unindex_document(id, &old);
        }
        self.index_document(id, &doc);
        self.documents.insert(id.to_string(), doc);
    }

    /// Drop every document, keeping the declared index fields.
    fn clear(&mut self) {
        self.documents.clear();
        for index in self.indexes.values_mut() {
            index.clear();
        }
    }

    fn remove(&mut self, id: &str) -> bool {
        match self.documents.remove(id) {
            Some(old) => {
                self.unindex_document(id, &old);
                true
            }
            None => false,
        }
    }
}

/// In-memory `DocumentCollection`.
pub struct InMemoryCollection {
    name: String,
    state: Arc<Mutex<CollectionState>>,
    ids: Arc<dyn IdGenerator>,
}

impl InMemoryCollection {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id_generator(name, Arc::new(UlidGenerator::new(SystemClock)))
    }

    pub fn with_id_generator(name: impl Into<String>, ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(CollectionState::default())),
            ids,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// All documents, in key order.
    pub async fn snapshot(&self) -> Vec<Document> {
        let state = self.state.lock().await;
        state.documents.values().cloned().collect()
    }

    /// Load documents from a JSON snapshot file, merging them over what is
    /// already here. A missing file is an empty collection.
    pub async fn load_snapshot(&self, path: &Path) -> Result<usize, StoreError> {
        let documents = read_snapshot(path).await?;
        let mut state = self.state.lock().await;
        let loaded = load_documents(&mut state, documents)?;
        debug!(collection = %self.name, loaded, "loaded snapshot");
        Ok(loaded)
    }

    /// Replace the whole contents with the snapshot at `path`. Index
    /// declarations survive.
    pub async fn reload_snapshot(&self, path: &Path) -> Result<usize, StoreError> {
        let documents = read_snapshot(path).await?;
        let mut state = self.state.lock().await;
        state.clear();
        load_documents(&mut state, documents)
    }

    /// Write every document to `path` as a JSON array.
    ///
    /// The file is written next to `path` and renamed over it, so a reader
    /// sees either the old or the new snapshot.
    pub async fn save_snapshot(&self, path: &Path) -> Result<(), StoreError> {
        let documents = self.snapshot().await;
        let raw = serde_json::to_string_pretty(&documents)?;
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut staging = path.as_os_str().to_owned();
        staging.push(".tmp");
        let staging = PathBuf::from(staging);
        tokio::fs::write(&staging, raw).await?;
        tokio::fs::rename(&staging, path).await?;
        debug!(collection = %self.name, saved = documents.len(), "saved snapshot");
        Ok(())
    }

    fn assign_id(&self, doc: &mut Document) -> Result<String, StoreError> {
        match doc.get(ID_FIELD) {
            Some(Value::String(id)) => Ok(id.clone()),
            Some(other) => Err(StoreError::InvalidDocument(format!(
                "_id must be a string, got {other}"
            ))),
            None => {
                let id = self.ids.generate().to_string();
                doc.insert(ID_FIELD.to_string(), Value::String(id.clone()));
                Ok(id)
            }
        }
    }
}

#[async_trait]
impl DocumentCollection for InMemoryCollection {
    async fn insert_one(&self, mut document: Document) -> Result<Document, StoreError> {
        let id = self.assign_id(&mut document)?;
        let mut state = self.state.lock().await;
        state.insert(id, document.clone())?;
        Ok(document)
    }

    async fn find(&self, filter: &Filter, options: &FindOptions) -> Result<Vec<Document>, StoreError> {
        let matcher = Matcher::compile(filter)?;
        let state = self.state.lock().await;

        let mut found: Vec<&Document> = state
            .matching_ids(&matcher)
            .iter()
            .filter_map(|id| state.documents.get(id))
            .collect();
        found.sort_by(|a, b| compare_documents(a, b, &options.sort));

        let limit = options.limit.unwrap_or(usize::MAX);
        Ok(found
            .into_iter()
            .skip(options.skip)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn find_one_and_update(
        &self,
        filter: &Filter,
        update: &Update,
        upsert: bool,
    ) -> Result<Option<Document>, StoreError> {
        let matcher = Matcher::compile(filter)?;
        let mut state = self.state.lock().await;

        if let Some(id) = state.matching_ids(&matcher).into_iter().next() {
            let mut doc = state.documents.get(&id).cloned().unwrap_or_default();
            apply_update(&mut doc, update, false);
            state.replace(&id, doc.clone());
            return Ok(Some(doc));
        }

        if !upsert {
            return Ok(None);
        }

        let mut doc = Document::new();
        seed_from_filter(&mut doc, filter);
        apply_update(&mut doc, update, true);
        let id = self.assign_id(&mut doc)?;
        state.insert(id, doc.clone())?;
        Ok(Some(doc))
    }

    async fn delete_many(&self, filter: &Filter) -> Result<u64, StoreError> {
        let matcher = Matcher::compile(filter)?;
        let mut state = self.state.lock().await;
        let ids = state.matching_ids(&matcher);
        let mut deleted = 0;
        for id in ids {
            if state.remove(&id) {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn count(&self, filter: &Filter) -> Result<u64, StoreError> {
        let matcher = Matcher::compile(filter)?;
        let state = self.state.lock().await;
        Ok(state.matching_ids(&matcher).len() as u64)
    }

    async fn distinct(&self, field: &str, filter: &Filter) -> Result<Vec<Value>, StoreError> {
        let matcher = Matcher::compile(filter)?;
        let state = self.state.lock().await;

        let mut values: Vec<Value> = Vec::new();
        for id in state.matching_ids(&matcher) {
            let Some(doc) = state.documents.get(&id) else {
                continue;
            };
            let candidates = match get_path(doc, field) {
                None | Some(Value::Null) => continue,
                Some(Value::Array(items)) => items.clone(),
                Some(v) => vec![v.clone()],
            };
            for v in candidates {
                if !v.is_null() && !values.contains(&v) {
                    values.push(v);
                }
            }
        }
        Ok(values)
    }

    async fn create_index(&self, field: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.indexes.contains_key(field) {
            return Ok(());
        }

        let mut index: HashMap<String, BTreeSet<String>> = HashMap::new();
        for (id, doc) in &state.documents {
            for key in index_keys(doc, field) {
                index.entry(key).or_default().insert(id.clone());
            }
        }
        state.indexes.insert(field.to_string(), index);
        debug!(collection = %self.name, field, "created index");
        Ok(())
    }
}

// ========================================
// Document helpers
// ========================================

pub(crate) fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = doc.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn set_path(doc: &mut Document, path: &str, value: Value) {
    let mut parts: Vec<&str> = path.split('.').collect();
    let Some(last) = parts.pop() else {
        return;
    };
    let mut current = doc;
    for part in parts {
        let entry = current
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Document::new()));
        if !entry.is_object() {
            *entry = Value::Object(Document::new());
        }
        current = match entry {
            Value::Object(map) => map,
            _ => return,
        };
    }
    current.insert(last.to_string(), value);
}

async fn read_snapshot(path: &Path) -> Result<Vec<Document>, StoreError> {
    match tokio::fs::read_to_string(path).await {
        Ok(raw) => Ok(serde_json::from_str(&raw)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

fn load_documents(state: &mut CollectionState, documents: Vec<Document>) -> Result<usize, StoreError> {
    let mut loaded = 0;
    for doc in documents {
        let id = doc
            .get(ID_FIELD)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| StoreError::InvalidDocument("snapshot entry without _id".into()))?;
        state.replace(&id, doc);
        loaded += 1;
    }
    Ok(loaded)
}

fn remove_path(doc: &mut Document, path: &str) {
    let mut parts: Vec<&str> = path.split('.').collect();
    let Some(last) = parts.pop() else {
        return;
    };
    let mut current = doc;
    for part in parts {
        current = match current.get_mut(part) {
            Some(Value::Object(map)) => map,
            _ => return,
        };
    }
    current.remove(last);
}

fn apply_update(doc: &mut Document, update: &Update, inserting: bool) {
    if inserting {
        for (path, value) in &update.set_on_insert {
            set_path(doc, path, value.clone());
        }
    }
    for (path, value) in &update.set {
        set_path(doc, path, value.clone());
    }
    for path in &update.unset {
        remove_path(doc, path);
    }
}

/// Upserted documents start from the filter's equality terms.
fn seed_from_filter(doc: &mut Document, filter: &Filter) {
    match filter {
        Filter::Eq(f, v) => set_path(doc, f, v.clone()),
        Filter::And(parts) => {
            for part in parts {
                seed_from_filter(doc, part);
            }
        }
        _ => {}
    }
}

fn value_eq(actual: Option<&Value>, expected: &Value) -> bool {
    match actual {
        None | Some(Value::Null) => expected.is_null(),
        Some(Value::Array(items)) if !expected.is_array() => items.contains(expected),
        Some(v) => v == expected,
    }
}

fn value_key(v: &Value) -> String {
    v.to_string()
}

fn index_keys(doc: &Document, field: &str) -> Vec<String> {
    match get_path(doc, field) {
        None | Some(Value::Null) => vec![value_key(&Value::Null)],
        Some(Value::Array(items)) => {
            let mut keys: Vec<String> = items.iter().map(value_key).collect();
            keys.push(value_key(&Value::Array(items.clone())));
            keys
        }
        Some(v) => vec![value_key(v)],
    }
}

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Object(_) => 3,
        Value::Array(_) => 4,
        Value::Bool(_) => 5,
    }
}

/// Total order over JSON values. RFC 3339 strings compare as instants so
/// timestamps with different fractional precision still sort correctly.
pub(crate) fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => {
            match (
                DateTime::parse_from_rfc3339(x),
                DateTime::parse_from_rfc3339(y),
            ) {
                (Ok(x), Ok(y)) => x.with_timezone(&Utc).cmp(&y.with_timezone(&Utc)),
                _ => x.cmp(y),
            }
        }
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

fn compare_documents(a: &Document, b: &Document, sort: &[(String, Order)]) -> Ordering {
    for (field, order) in sort {
        let null = Value::Null;
        let x = get_path(a, field).unwrap_or(&null);
        let y = get_path(b, field).unwrap_or(&null);
        let ord = compare_values(x, y);
        let ord = match order {
            Order::Asc => ord,
            Order::Desc => ord.reverse(),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    // Stable tie-break so skip/limit paging never overlaps.
    let null = Value::Null;
    compare_values(
        a.get(ID_FIELD).unwrap_or(&null),
        b.get(ID_FIELD).unwrap_or(&null),
    )
}
