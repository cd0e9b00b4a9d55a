//! Collaborator interfaces.
//!
//! The engine never talks to the destination system directly; it goes
//! through these traits. Production implementations wrap the
//! application-server and data-store-server RPC clients, which are out
//! of scope here. The test suite substitutes in-memory fakes.
//!
//! Lookup failures are split into two cases on purpose: [`None`] means
//! the entity does not exist and a CREATE is the right reaction, while
//! [`ServiceError`] means the lookup itself failed and the entity must
//! be skipped for this pull rather than blindly re-created.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::model::{EntityKind, EntityProperty, MaterialKey, NewDataSet};
use crate::sync::batch::ReconciliationBatch;

/// A collaborator call failed for a reason other than "not found".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("Service call failed: {0}")]
pub struct ServiceError(pub String);

/// The slice of a locally stored entity the engine needs to build an
/// update instruction: identity, the concurrency token, and the current
/// property set (for full-replace padding).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub perm_id: String,
    pub identifier: String,
    /// Version/concurrency token the storage layer uses to detect
    /// concurrent modification. Carried verbatim into updates.
    pub version: i64,
    pub type_code: Option<String>,
    pub properties: Vec<EntityProperty>,
}

/// Counts reported by an atomic batch execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationSummary {
    pub created: usize,
    pub updated: usize,
}

/// Batched create/update side of the destination system.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn space_exists(&self, code: &str) -> Result<bool, ServiceError>;

    async fn project_by_perm_id(&self, perm_id: &str)
        -> Result<Option<StoredRecord>, ServiceError>;
    async fn experiment_by_perm_id(
        &self,
        perm_id: &str,
    ) -> Result<Option<StoredRecord>, ServiceError>;
    async fn sample_by_perm_id(&self, perm_id: &str) -> Result<Option<StoredRecord>, ServiceError>;
    async fn data_set_by_code(&self, code: &str) -> Result<Option<StoredRecord>, ServiceError>;
    async fn material_by_key(&self, key: &MaterialKey)
        -> Result<Option<StoredRecord>, ServiceError>;

    /// Apply the whole accumulated batch as one atomic operation set.
    /// Atomicity is this collaborator's guarantee, not the engine's.
    async fn perform_operations(
        &self,
        batch: &ReconciliationBatch,
    ) -> Result<OperationSummary, ServiceError>;

    /// Move the staged files of a freshly downloaded physical data set
    /// into permanent storage and register it with its sample,
    /// experiment and parent associations.
    async fn register_physical(
        &self,
        data_set: &NewDataSet,
        staged: &Path,
    ) -> Result<(), ServiceError>;
}

/// An entity as reported by the destination's space-scoped graph
/// listing, the input to deletion-by-difference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalEntity {
    pub kind: EntityKind,
    pub perm_id: String,
    pub identifier: String,
}

/// Token handed back by a staged deletion, to be confirmed later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionToken(pub String);

/// Deletion-capable administrative side of the destination system.
#[async_trait]
pub trait AdminApi: Send + Sync {
    async fn space_entities(&self, space: &str) -> Result<Vec<LocalEntity>, ServiceError>;
    async fn list_materials(&self) -> Result<Vec<MaterialKey>, ServiceError>;

    async fn delete_data_sets(
        &self,
        codes: &[String],
        reason: &str,
    ) -> Result<DeletionToken, ServiceError>;
    async fn delete_samples(
        &self,
        perm_ids: &[String],
        reason: &str,
    ) -> Result<DeletionToken, ServiceError>;
    async fn delete_experiments(
        &self,
        perm_ids: &[String],
        reason: &str,
    ) -> Result<DeletionToken, ServiceError>;
    /// Projects are removed immediately, without a confirmation stage.
    async fn delete_projects(&self, perm_ids: &[String], reason: &str)
        -> Result<(), ServiceError>;
    /// Materials are removed immediately, without a confirmation stage.
    async fn delete_materials(
        &self,
        keys: &[MaterialKey],
        reason: &str,
    ) -> Result<(), ServiceError>;

    async fn confirm_deletions(&self, tokens: &[DeletionToken]) -> Result<(), ServiceError>;
}

/// A file belonging to a remote data set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    /// Path relative to the data set root.
    pub path: String,
    pub is_directory: bool,
    pub size: u64,
}

/// Download side of the remote data-store server.
#[async_trait]
pub trait FileTransferApi: Send + Sync {
    async fn list_files(&self, data_set_code: &str) -> Result<Vec<RemoteFile>, ServiceError>;
    async fn download(&self, data_set_code: &str, path: &str) -> Result<Vec<u8>, ServiceError>;
}

/// Failure notification channel. The production implementation mails
/// the configured recipients with the log file attached when available.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn sync_failed(&self, reason: &str, log_file: Option<&Path>);
}

/// Fallback notifier that only writes to the log. Used when no mail
/// client is wired up.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn sync_failed(&self, reason: &str, log_file: Option<&Path>) {
        match log_file {
            Some(path) => tracing::error!("Synchronization failed: {reason} (log at {path:?})"),
            None => tracing::error!("Synchronization failed: {reason}"),
        }
    }
}
