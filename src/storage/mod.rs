//! Storage contracts and the URI-dispatched driver registry.
//!
//! The node never talks to disks directly: `log_uri`, `stable_uri` and
//! `snapshot_uri` are resolved through the process-wide driver registry,
//! and each driver vends the matching collaborator for its scheme.

mod log_manager;
mod snapshot;
mod stable;
mod state_machine;

pub use log_manager::*;
pub use snapshot::*;
pub use stable::*;
pub use state_machine::*;

use std::sync::Arc;
use std::sync::OnceLock;

use dashmap::DashMap;
use tracing::info;

use crate::NodeError;
use crate::Result;

/// Creates storage collaborators for one URI scheme (e.g. `file`, `mem`).
pub trait StorageDriver: Send + Sync + 'static {
    fn create_log_manager(
        &self,
        uri: &str,
    ) -> Result<Arc<dyn LogManager>>;

    fn create_stable_storage(
        &self,
        uri: &str,
    ) -> Result<Arc<dyn StableStorage>>;

    fn create_snapshot_storage(
        &self,
        uri: &str,
    ) -> Result<Arc<dyn SnapshotStorage>>;
}

fn drivers() -> &'static DashMap<String, Arc<dyn StorageDriver>> {
    static DRIVERS: OnceLock<DashMap<String, Arc<dyn StorageDriver>>> = OnceLock::new();
    DRIVERS.get_or_init(DashMap::new)
}

/// Registers `driver` for `scheme`, replacing any previous registration.
pub fn register_driver(
    scheme: &str,
    driver: Arc<dyn StorageDriver>,
) {
    info!("register storage driver for scheme: {}", scheme);
    drivers().insert(scheme.to_string(), driver);
}

/// Resolves the driver claiming `uri`'s scheme (`scheme://...`).
pub fn find_driver(uri: &str) -> Result<Arc<dyn StorageDriver>> {
    let scheme = uri.split("://").next().unwrap_or_default();
    drivers()
        .get(scheme)
        .map(|entry| entry.value().clone())
        .ok_or_else(|| NodeError::StorageUnavailable(uri.to_string()).into())
}
