//! # harvest-core
//!
//! An incremental harvesting engine: it periodically pulls a remote
//! "resource list" document describing entities (projects, experiments,
//! samples, data sets, materials), reconciles it against local state and
//! applies create/update/delete operations idempotently, driven by a
//! persisted last-synchronization watermark.
//!
//! ## Overview
//!
//! One pull runs through a fixed pipeline:
//!
//! 1. **Fetch** — [`connector::DataSourceConnector`] retrieves the
//!    document over authenticated HTTP.
//! 2. **Parse** — [`parser::ResourceListParser`] turns it into a typed
//!    [`model::ResourceListData`], rewriting remote space codes through
//!    the configured [`config::SpaceMapping`] as it goes.
//! 3. **Reconcile** — [`sync::SyncEngine`] walks the model kind by kind
//!    (projects, experiments, samples, materials — a strict order,
//!    since each pass depends on the previous pass's identifier
//!    rewrites), accumulating one atomic
//!    [`sync::ReconciliationBatch`].
//! 4. **Transfer** — physical data sets modified since the watermark
//!    are downloaded and registered by [`sync::TransferPool`], in
//!    dependency order, with bounded parallelism.
//! 5. **Link** — container/component and parent/child relations between
//!    data sets are committed once the storage identifiers exist.
//! 6. **Delete** — [`sync::DeletionReconciler`] removes every local
//!    entity the document no longer mentions.
//! 7. **Advance** — the [`watermark::SyncWatermark`] staged at pull
//!    start is promoted by an atomic rename.
//!
//! Entities are considered for create/update only when their
//! last-modification timestamp lies strictly after the watermark, which
//! is the instant the *previous successful* pull started. Re-running
//! against an unchanged document is a no-op.
//!
//! ## Collaborators
//!
//! The engine talks to the destination system exclusively through the
//! traits in [`service`]: an entity store with an atomic batch
//! operation, a deletion-capable admin API, a file download API and a
//! failure notifier. Wire implementations of those live with the
//! application embedding this crate.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::path::{Path, PathBuf};
//! use std::sync::Arc;
//! use harvest_core::config::SyncConfig;
//! use harvest_core::connector::DataSourceConnector;
//! use harvest_core::service::LogNotifier;
//! use harvest_core::sync::SyncEngine;
//!
//! # async fn run(store: Arc<dyn harvest_core::service::EntityStore>,
//! #              admin: Arc<dyn harvest_core::service::AdminApi>,
//! #              files: Arc<dyn harvest_core::service::FileTransferApi>)
//! #              -> Result<(), harvest_core::HarvestError> {
//! let config = SyncConfig::load(Path::new("harvester-config-file"))?;
//! let source = Arc::new(DataSourceConnector::new(&config)?);
//! let engine = SyncEngine::new(
//!     config,
//!     PathBuf::from("targets/store"),
//!     source,
//!     store,
//!     admin,
//!     files,
//!     Arc::new(LogNotifier),
//! )?;
//! let report = engine.run().await?;
//! tracing::info!("pull done, watermark now {}", report.pull_started);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connector;
pub mod error;
pub mod model;
pub mod parser;
pub mod service;
pub mod sync;
pub mod watermark;

pub use error::*;
