//! DatasetCatalog port - the external dataset store, seen from the queue.
//!
//! The engine needs two things from it: the set of dataset ids that still
//! exist (for orphan cleanup) and a handle for the dataset an invocation
//! targets (loaded lazily by the execution context).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Opaque reference to a loaded dataset.
///
/// Only the id and a display name cross the port; what "loading" means is up
/// to the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetHandle {
    pub id: String,
    pub name: String,
}

/// Read-only view of the dataset store.
///
/// # Errors
/// - Failures are `anyhow` errors: the catalog is external and its failure
///   modes are not the engine's to classify. Callers wrap them (orphan
///   cleanup turns one into `DelegateError::InvalidArgument`).
#[async_trait]
pub trait DatasetCatalog: Send + Sync {
    /// Every dataset id that currently exists. Orphan cleanup deletes
    /// operations whose dataset is missing from this list, so an incomplete
    /// answer deletes live work.
    async fn list_dataset_ids(&self) -> anyhow::Result<Vec<String>>;

    /// `Ok(None)` when the dataset does not exist.
    async fn load(&self, dataset_id: &str) -> anyhow::Result<Option<DatasetHandle>>;
}
