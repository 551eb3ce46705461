//! Ports - traits for everything the engine consumes but does not own.
//!
//! - **DocumentCollection**: the persistent store (source of truth)
//! - **SecretsResolver**: operator secrets
//! - **DatasetCatalog**: live dataset ids and handles
//! - **Clock** / **IdGenerator**: time and key generation, swappable in tests

pub mod clock;
pub mod datasets;
pub mod document_store;
pub mod id_generator;
pub mod secrets;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::datasets::{DatasetCatalog, DatasetHandle};
pub use self::document_store::{
    Document, DocumentCollection, Filter, FindOptions, ID_FIELD, Order, StoreError, Update,
};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::secrets::SecretsResolver;
