//! Paging, sorting and free-text search parameters for list queries.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Cap applied when a caller asks for no limit (or limit 0).
pub const DEFAULT_LIST_LIMIT: usize = 1000;

/// Sortable operation fields. Timestamps that a record does not have yet
/// (for example `completed_at` on a QUEUED record) sort as null, before any
/// value when ascending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortBy {
    UpdatedAt,
    ScheduledAt,
    #[default]
    QueuedAt,
    StartedAt,
    CompletedAt,
    FailedAt,
    Operator,
}

impl SortBy {
    /// Document path of the field.
    pub fn field(self) -> &'static str {
        match self {
            SortBy::UpdatedAt => "updated_at",
            SortBy::ScheduledAt => "scheduled_at",
            SortBy::QueuedAt => "queued_at",
            SortBy::StartedAt => "started_at",
            SortBy::CompletedAt => "completed_at",
            SortBy::FailedAt => "failed_at",
            SortBy::Operator => "operator",
        }
    }
}

impl FromStr for SortBy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "updated_at" => Ok(SortBy::UpdatedAt),
            "scheduled_at" => Ok(SortBy::ScheduledAt),
            "queued_at" => Ok(SortBy::QueuedAt),
            "started_at" => Ok(SortBy::StartedAt),
            "completed_at" => Ok(SortBy::CompletedAt),
            "failed_at" => Ok(SortBy::FailedAt),
            "operator" => Ok(SortBy::Operator),
            other => Err(format!("unsupported sort field `{other}`")),
        }
    }
}

impl fmt::Display for SortBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.field())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Ascending,
    #[default]
    Descending,
}

impl FromStr for SortDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "asc" | "ascending" => Ok(SortDirection::Ascending),
            "desc" | "descending" => Ok(SortDirection::Descending),
            other => Err(format!("unsupported sort direction `{other}`")),
        }
    }
}

/// Paging parameters.
///
/// Defaults: sort by queue time, newest first, `DEFAULT_LIST_LIMIT` rows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Paging {
    #[serde(default)]
    pub sort_by: SortBy,
    #[serde(default)]
    pub sort_direction: SortDirection,
    #[serde(default)]
    pub skip: usize,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl Paging {
    pub fn new(sort_by: SortBy, sort_direction: SortDirection) -> Self {
        Self {
            sort_by,
            sort_direction,
            skip: 0,
            limit: None,
        }
    }

    pub fn page(mut self, skip: usize, limit: usize) -> Self {
        self.skip = skip;
        self.limit = Some(limit);
        self
    }

    /// The limit actually applied (0 or absent means the default cap).
    pub fn effective_limit(&self) -> usize {
        match self.limit {
            None | Some(0) => DEFAULT_LIST_LIMIT,
            Some(n) => n,
        }
    }
}

/// Free-text search: term -> fields the term may match.
///
/// All terms must match (AND); a term matches when any of its fields
/// contains it (OR). Matching is a case-sensitive substring test.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Search(pub BTreeMap<String, Vec<String>>);

impl Search {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn term(mut self, term: impl Into<String>, fields: &[&str]) -> Self {
        self.0
            .insert(term.into(), fields.iter().map(|f| f.to_string()).collect());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the first field not in `allowed`.
    pub fn unsupported_field<'a>(&'a self, allowed: &[&str]) -> Option<&'a str> {
        self.0
            .values()
            .flatten()
            .find(|field| !allowed.contains(&field.as_str()))
            .map(String::as_str)
    }
}
