//! In-memory and file-backed implementations of the ports.

pub mod datasets;
pub mod memory_store;
pub mod secrets;
pub mod snapshot_store;

pub use datasets::InMemoryDatasetCatalog;
pub use memory_store::InMemoryCollection;
pub use secrets::{EnvSecretsResolver, StaticSecrets};
pub use snapshot_store::SnapshotCollection;
