//! DocumentCollection port - the engine's only storage dependency.
//!
//! Records are JSON documents keyed by a string `_id`. Field names in filters,
//! sorts and updates may be dotted paths (`context.request_params.dataset_id`).
//!
//! # Design
//! - `find_one_and_update` must be atomic with respect to its filter: the
//!   filter is evaluated and the update applied as one step. Run-state CAS is
//!   built on exactly this guarantee.
//! - Nothing above this trait caches documents across calls.

use async_trait::async_trait;
use serde_json::{Map, Value};

/// A stored document (always a JSON object).
pub type Document = Map<String, Value>;

/// Name of the primary-key field.
pub const ID_FIELD: &str = "_id";

/// Query predicate over documents.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Matches everything.
    All,
    /// Field equals value. A missing field equals `null`; an array field
    /// matches when any element equals the value.
    Eq(String, Value),
    Ne(String, Value),
    In(String, Vec<Value>),
    /// Field is present and non-null (`true`) or absent/null (`false`).
    Exists(String, bool),
    /// Case-sensitive regex over string fields (or string array elements).
    Regex(String, String),
    /// Field is strictly less than value (nulls never match).
    Lt(String, Value),
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Filter::Eq(field.to_string(), value.into())
    }

    pub fn ne(field: &str, value: impl Into<Value>) -> Self {
        Filter::Ne(field.to_string(), value.into())
    }

    pub fn is_in<I, V>(field: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Filter::In(field.to_string(), values.into_iter().map(Into::into).collect())
    }

    pub fn exists(field: &str, present: bool) -> Self {
        Filter::Exists(field.to_string(), present)
    }

    pub fn regex(field: &str, pattern: impl Into<String>) -> Self {
        Filter::Regex(field.to_string(), pattern.into())
    }

    pub fn lt(field: &str, value: impl Into<Value>) -> Self {
        Filter::Lt(field.to_string(), value.into())
    }

    pub fn id(id: impl Into<String>) -> Self {
        Filter::Eq(ID_FIELD.to_string(), Value::String(id.into()))
    }

    /// Conjunction that flattens `All` away.
    pub fn and(filters: Vec<Filter>) -> Self {
        let mut parts: Vec<Filter> = filters
            .into_iter()
            .filter(|f| !matches!(f, Filter::All))
            .collect();
        match parts.len() {
            0 => Filter::All,
            1 => parts.remove(0),
            _ => Filter::And(parts),
        }
    }
}

/// Sort order for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    pub sort: Vec<(String, Order)>,
    pub skip: usize,
    pub limit: Option<usize>,
}

impl FindOptions {
    pub fn sorted(mut self, field: &str, order: Order) -> Self {
        self.sort.push((field.to_string(), order));
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Field-level update, Mongo style.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update {
    /// Paths to overwrite.
    pub set: Document,
    /// Paths written only when an upsert inserts a new document.
    pub set_on_insert: Document,
    /// Paths to remove.
    pub unset: Vec<String>,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, path: &str, value: impl Into<Value>) -> Self {
        self.set.insert(path.to_string(), value.into());
        self
    }

    pub fn set_on_insert(mut self, path: &str, value: impl Into<Value>) -> Self {
        self.set_on_insert.insert(path.to_string(), value.into());
        self
    }

    pub fn unset(mut self, path: &str) -> Self {
        self.unset.push(path.to_string());
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A collection of JSON documents.
#[async_trait]
pub trait DocumentCollection: Send + Sync {
    /// Insert a document, assigning `_id` when absent. Returns the stored document.
    async fn insert_one(&self, document: Document) -> Result<Document, StoreError>;

    async fn find(&self, filter: &Filter, options: &FindOptions) -> Result<Vec<Document>, StoreError>;

    async fn find_one(&self, filter: &Filter) -> Result<Option<Document>, StoreError> {
        let mut found = self.find(filter, &FindOptions::default().limit(1)).await?;
        Ok(found.pop())
    }

    /// Atomically apply `update` to the first document matching `filter` and
    /// return it after the update. With `upsert`, insert a document built from
    /// the filter's equality terms plus the update when nothing matches.
    async fn find_one_and_update(
        &self,
        filter: &Filter,
        update: &Update,
        upsert: bool,
    ) -> Result<Option<Document>, StoreError>;

    /// Returns the number of deleted documents.
    async fn delete_many(&self, filter: &Filter) -> Result<u64, StoreError>;

    async fn count(&self, filter: &Filter) -> Result<u64, StoreError>;

    /// Distinct non-null values of `field` among matching documents.
    async fn distinct(&self, field: &str, filter: &Filter) -> Result<Vec<Value>, StoreError>;

    /// Declare a secondary index on `field`. Idempotent.
    async fn create_index(&self, field: &str) -> Result<(), StoreError>;
}
