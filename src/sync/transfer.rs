//! Physical data set file transfer.
//!
//! Each selected data set is staged under
//! `<store_root>/<harvester_temp_dir>/<data_set_code>/` and then handed
//! to the storage collaborator for registration. Staging directories
//! are derived from the data set code, so concurrent workers never
//! write to the same path. A failed download aborts that data set only;
//! the other workers run to completion and the pool always waits for
//! all of them.
//!
//! Data sets are dispatched in dependency order (Kahn's algorithm over
//! the parent/child and container/component edges restricted to the
//! batch), so a child is never submitted before the parents it derives
//! from. See DESIGN.md for the rationale behind sorting before
//! dispatch.

use parking_lot::Mutex;
use petgraph::graphmap::DiGraphMap;
use petgraph::Direction;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;

use crate::error::HarvestError;
use crate::model::{ConnectionKind, Incoming, NewDataSet};
use crate::service::{EntityStore, FileTransferApi, ServiceError};

/// Outcome of one pool run. `registered` is the shared append-only list
/// the workers push completed codes onto; `failed` data sets are
/// excluded from the subsequent linkage pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TransferSummary {
    pub registered: Vec<String>,
    pub failed: Vec<String>,
}

/// Registration order for the selected data sets: parents before
/// children, components before their container. Edges pointing outside
/// the selection are ignored. If the restricted graph contains a cycle
/// the acyclic prefix keeps its order and the remainder is appended in
/// code order with a warning.
pub fn dependency_order(
    data_sets: &BTreeMap<String, Incoming<NewDataSet>>,
    selected: &[String],
) -> Vec<String> {
    let chosen: BTreeSet<&str> = selected.iter().map(String::as_str).collect();
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
    for code in chosen.iter().copied() {
        graph.add_node(code);
    }
    for code in chosen.iter().copied() {
        let Some(record) = data_sets.get(code) else {
            continue;
        };
        for conn in &record.connections {
            if !chosen.contains(conn.to_perm_id.as_str()) {
                continue;
            }
            match conn.kind {
                // Parent first, then the child derived from it.
                ConnectionKind::Child => {
                    graph.add_edge(code, conn.to_perm_id.as_str(), ());
                }
                // Components first, then the container aggregating them.
                ConnectionKind::Component => {
                    graph.add_edge(conn.to_perm_id.as_str(), code, ());
                }
                ConnectionKind::Reference => {}
            }
        }
    }

    // Kahn's algorithm with a sorted ready set for deterministic output.
    let mut in_degree: BTreeMap<&str, usize> = graph
        .nodes()
        .map(|n| (n, graph.neighbors_directed(n, Direction::Incoming).count()))
        .collect();
    let mut ready: BTreeSet<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(n, _)| *n)
        .collect();
    let mut order = Vec::with_capacity(chosen.len());
    while let Some(&next) = ready.iter().next() {
        ready.remove(next);
        order.push(next.to_string());
        for successor in graph.neighbors_directed(next, Direction::Outgoing) {
            let degree = in_degree
                .get_mut(successor)
                .expect("successor is a graph node");
            *degree -= 1;
            if *degree == 0 {
                ready.insert(successor);
            }
        }
    }
    if order.len() < chosen.len() {
        let placed: BTreeSet<&str> = order.iter().map(String::as_str).collect();
        let remainder: Vec<String> = chosen
            .iter()
            .copied()
            .filter(|code| !placed.contains(*code))
            .map(str::to_string)
            .collect();
        tracing::warn!(
            "Data set dependency graph contains a cycle; appending {:?} in code order",
            remainder
        );
        order.extend(remainder);
    }
    order
}

#[derive(Clone)]
pub struct TransferPool {
    files: Arc<dyn FileTransferApi>,
    store: Arc<dyn EntityStore>,
    staging_root: PathBuf,
    workers: usize,
    request_timeout: Duration,
}

impl TransferPool {
    pub fn new(
        files: Arc<dyn FileTransferApi>,
        store: Arc<dyn EntityStore>,
        store_root: PathBuf,
        harvester_temp_dir: &str,
        workers: usize,
        request_timeout: Duration,
    ) -> Self {
        TransferPool {
            files,
            store,
            staging_root: store_root.join(harvester_temp_dir),
            workers: workers.max(1),
            request_timeout,
        }
    }

    /// Run the pool over `data_sets`, already in dependency order.
    /// Never fails as a whole: per-item errors are logged and reported
    /// through [`TransferSummary::failed`].
    pub async fn run(&self, data_sets: Vec<NewDataSet>) -> TransferSummary {
        tracing::info!(
            "Registering {} physical data sets with {} workers",
            data_sets.len(),
            self.workers
        );
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let registered = Arc::new(Mutex::new(Vec::<String>::new()));
        let mut tasks = JoinSet::new();
        for data_set in data_sets {
            let pool = self.clone();
            let semaphore = semaphore.clone();
            let registered = registered.clone();
            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("transfer semaphore is never closed");
                let code = data_set.code.clone();
                tracing::debug!("start {code}");
                match pool.transfer(&data_set).await {
                    Ok(()) => {
                        registered.lock().push(code.clone());
                        tracing::debug!("finished {code}");
                        (code, true)
                    }
                    Err(e) => {
                        tracing::warn!("{e}");
                        (code, false)
                    }
                }
            });
        }

        let mut summary = TransferSummary::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, true)) => {}
                Ok((code, false)) => summary.failed.push(code),
                Err(e) => tracing::error!("Transfer worker panicked: {e}"),
            }
        }
        summary.registered = registered.lock().clone();
        summary.failed.sort();
        summary
    }

    /// Transfer one data set: download every file into the staging
    /// directory, then register. Must not be called concurrently for
    /// the same data set code.
    pub async fn transfer(&self, data_set: &NewDataSet) -> Result<(), HarvestError> {
        let code = &data_set.code;
        let staging = self.staging_root.join(code);
        tokio::fs::create_dir_all(&staging)
            .await
            .map_err(|e| transfer_error(code, format!("cannot create staging dir: {e}")))?;

        let listed = self
            .bounded(code, self.files.list_files(code))
            .await
            .map_err(|e| transfer_error(code, format!("file listing failed: {e}")))?;
        for file in listed {
            if file.path.is_empty() {
                continue;
            }
            let target = staging.join(&file.path);
            if file.is_directory {
                tokio::fs::create_dir_all(&target)
                    .await
                    .map_err(|e| transfer_error(code, format!("cannot create {target:?}: {e}")))?;
                continue;
            }
            let bytes = self
                .bounded(code, self.files.download(code, &file.path))
                .await
                .map_err(|e| transfer_error(code, format!("download of '{}' failed: {e}", file.path)))?;
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| transfer_error(code, format!("cannot create {parent:?}: {e}")))?;
            }
            tokio::fs::write(&target, bytes)
                .await
                .map_err(|e| transfer_error(code, format!("cannot write {target:?}: {e}")))?;
            tracing::debug!("Downloaded {}/{}", code, file.path);
        }

        self.bounded(code, self.store.register_physical(data_set, &staging))
            .await
            .map_err(|e| transfer_error(code, format!("registration failed: {e}")))?;
        Ok(())
    }

    /// Apply the configured timeout to a collaborator call. A timeout
    /// is a per-item failure, never a pool-wide abort.
    async fn bounded<T>(
        &self,
        code: &str,
        call: impl std::future::Future<Output = Result<T, ServiceError>>,
    ) -> Result<T, ServiceError> {
        match timeout(self.request_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ServiceError(format!(
                "timed out after {:?} while transferring '{code}'",
                self.request_timeout
            ))),
        }
    }
}

fn transfer_error(code: &str, reason: String) -> HarvestError {
    HarvestError::Transfer {
        code: code.to_string(),
        reason,
    }
}
