//! Shared fixtures for unit tests.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};

use crate::impls::InMemoryCollection;
use crate::ports::{Clock, FixedClock, UlidGenerator};
use crate::repository::{OperationRepository, OrchestratorRepository};

pub(crate) fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
}

pub(crate) fn fixed_clock() -> Arc<FixedClock> {
    Arc::new(FixedClock::new(t0()))
}

pub(crate) fn collection(name: &str, clock: &Arc<FixedClock>) -> Arc<InMemoryCollection> {
    let ids = Arc::new(UlidGenerator::new(Arc::clone(clock)));
    Arc::new(InMemoryCollection::with_id_generator(name, ids))
}

pub(crate) async fn operation_repo(clock: &Arc<FixedClock>) -> OperationRepository {
    let clock_dyn: Arc<dyn Clock> = clock.clone();
    let repo = OperationRepository::new(collection("delegated_ops", clock), clock_dyn);
    repo.ensure_indexes().await.unwrap();
    repo
}

pub(crate) async fn orchestrator_repo(clock: &Arc<FixedClock>) -> OrchestratorRepository {
    let clock_dyn: Arc<dyn Clock> = clock.clone();
    let repo = OrchestratorRepository::new(collection("orchestrators", clock), clock_dyn);
    repo.ensure_indexes().await.unwrap();
    repo
}
