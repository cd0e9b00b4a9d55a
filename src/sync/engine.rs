//! The pull orchestrator.
//!
//! One [`SyncEngine::run`] call performs one pull:
//!
//! 1. verify the destination spaces exist,
//! 2. read the watermark and stage "now" as its successor,
//! 3. fetch and parse the resource list,
//! 4. reconcile projects, then experiments, then samples, then
//!    materials into one batch and commit it atomically,
//! 5. transfer physical data sets modified since the watermark through
//!    the worker pool, in dependency order,
//! 6. commit the data set linkage batch,
//! 7. delete whatever the document no longer mentions,
//! 8. promote the staged watermark.
//!
//! The kind ordering in step 4 is a strict sequential dependency: the
//! project pass rewrites experiment identifiers, the experiment pass
//! assigns samples and data sets to experiments, and later passes read
//! those rewrites from the in-memory model.
//!
//! An entity whose `lastmod` is at or before the watermark is skipped
//! for body changes but its connections are still walked, because a
//! changed neighbor may need the edge materialized. Per-entity lookup
//! and transfer failures are logged and the entity is omitted from the
//! batch; fetch, parse, commit and deletion failures abort the pull,
//! leave the watermark untouched and notify the configured channel.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{SpaceMapping, SyncConfig};
use crate::connector::ResourceListSource;
use crate::error::HarvestError;
use crate::model::{ConnectionKind, DataSetClass, ResourceListData};
use crate::parser::ResourceListParser;
use crate::service::{
    AdminApi, EntityStore, FileTransferApi, Notifier, OperationSummary, StoredRecord,
};
use crate::sync::batch::{
    prepare_updated_properties, DataSetCreation, DataSetUpdate, ExperimentUpdate, LinkFold,
    MaterialUpdate, ProjectUpdate, ReconciliationBatch, SampleUpdate,
};
use crate::sync::deletion::{DeletionReconciler, DeletionReport};
use crate::sync::transfer::{dependency_order, TransferPool, TransferSummary};
use crate::watermark::SyncWatermark;

/// What one successful pull did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// The instant captured at pull start; after success this is the
    /// persisted watermark.
    pub pull_started: DateTime<Utc>,
    pub metadata: OperationSummary,
    pub linkage: OperationSummary,
    pub transferred: Vec<String>,
    pub failed_transfers: Vec<String>,
    pub deletions: DeletionReport,
}

pub struct SyncEngine {
    config: SyncConfig,
    mapping: SpaceMapping,
    store_root: PathBuf,
    source: Arc<dyn ResourceListSource>,
    store: Arc<dyn EntityStore>,
    admin: Arc<dyn AdminApi>,
    files: Arc<dyn FileTransferApi>,
    notifier: Arc<dyn Notifier>,
    watermark: SyncWatermark,
}

impl SyncEngine {
    pub fn new(
        config: SyncConfig,
        store_root: PathBuf,
        source: Arc<dyn ResourceListSource>,
        store: Arc<dyn EntityStore>,
        admin: Arc<dyn AdminApi>,
        files: Arc<dyn FileTransferApi>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, HarvestError> {
        let mapping = config.space_mapping()?;
        let watermark = SyncWatermark::new(&config.last_sync_file);
        Ok(SyncEngine {
            config,
            mapping,
            store_root,
            source,
            store,
            admin,
            files,
            notifier,
            watermark,
        })
    }

    /// Run one pull. On failure the watermark is left in place (the
    /// next scheduled run retries the same window) and the notifier is
    /// informed.
    pub async fn run(&self) -> Result<SyncReport, HarvestError> {
        match self.run_pull().await {
            Ok(report) => Ok(report),
            Err(e) => {
                tracing::error!("Sync failed: {e}");
                self.notifier
                    .sync_failed(&e.to_string(), self.config.log_file.as_deref())
                    .await;
                Err(e)
            }
        }
    }

    async fn run_pull(&self) -> Result<SyncReport, HarvestError> {
        self.ensure_destination_spaces().await?;

        let watermark = self.watermark.read()?;
        let pull_started = Utc::now();
        self.watermark.stage(pull_started)?;
        tracing::info!(
            "Starting synchronization from {} for spaces {:?}, watermark {}",
            self.config.data_source_as_url,
            self.config.data_source_spaces,
            watermark
        );

        let document = self.source.fetch(&self.config.data_source_spaces).await?;
        tracing::info!("Parsing the resource list document...");
        let mut data = ResourceListParser::new(&self.mapping).parse(&document)?;

        let mut batch = ReconciliationBatch::default();
        self.reconcile_projects(&mut data, watermark, &mut batch)
            .await;
        self.reconcile_experiments(&mut data, watermark, &mut batch)
            .await;
        self.reconcile_samples(&mut data, watermark, &mut batch)
            .await;
        self.reconcile_materials(&data, watermark, &mut batch).await;
        let metadata = self.commit(&batch, "meta data").await?;

        let transfers = self.transfer_physical(&data, watermark).await;
        let linkage_batch = self
            .link_data_sets(&data, watermark, &transfers.failed)
            .await;
        let linkage = self.commit(&linkage_batch, "data set linkage").await?;

        let deletions = DeletionReconciler::new(self.admin.as_ref(), &self.mapping)
            .reconcile(&data, self.config.dry_run)
            .await?;

        if self.config.dry_run {
            tracing::info!("Dry run: watermark stays at {watermark}");
        } else {
            self.watermark.commit()?;
            tracing::info!("Watermark advanced to {pull_started}");
        }
        tracing::info!(
            "Synchronization finished: {} created, {} updated, {} deleted, \
             {} physical data sets transferred ({} failed)",
            metadata.created + linkage.created,
            metadata.updated + linkage.updated,
            deletions.total(),
            transfers.registered.len(),
            transfers.failed.len()
        );
        Ok(SyncReport {
            pull_started,
            metadata,
            linkage,
            transferred: transfers.registered,
            failed_transfers: transfers.failed,
            deletions,
        })
    }

    /// Every configured destination space must already exist; creating
    /// spaces is an administrative act the harvester must not perform
    /// implicitly.
    async fn ensure_destination_spaces(&self) -> Result<(), HarvestError> {
        for space in self.mapping.destinations() {
            let exists = self.store.space_exists(space).await.map_err(|e| {
                HarvestError::Config(format!("Cannot verify harvester space '{space}': {e}"))
            })?;
            if !exists {
                return Err(HarvestError::Config(format!(
                    "Harvester space '{space}' does not exist"
                )));
            }
        }
        Ok(())
    }

    async fn reconcile_projects(
        &self,
        data: &mut ResourceListData,
        watermark: DateTime<Utc>,
        batch: &mut ReconciliationBatch,
    ) {
        let perm_ids: Vec<String> = data.projects.keys().cloned().collect();
        for perm_id in &perm_ids {
            let record = data.projects[perm_id].clone();
            if record.modified_after(watermark) {
                match self.store.project_by_perm_id(perm_id).await {
                    Ok(None) => batch.project_creations.push(record.entity.clone()),
                    Ok(Some(stored)) => batch.project_updates.push(ProjectUpdate {
                        perm_id: perm_id.clone(),
                        identifier: record.entity.identifier.clone(),
                        version: stored.version,
                        description: record.entity.description.clone(),
                    }),
                    Err(e) => tracing::warn!("Skipping project {perm_id}, lookup failed: {e}"),
                }
            }
            for conn in &record.connections {
                match conn.kind {
                    ConnectionKind::Reference => {
                        // Experiments nest under their project; qualify
                        // the experiment identifier with the project's
                        // final path before the experiment pass runs.
                        if let Some(experiment) = data.experiments.get_mut(&conn.to_perm_id) {
                            experiment.entity.identifier = format!(
                                "{}/{}",
                                record.entity.identifier, experiment.entity.code
                            );
                        } else {
                            tracing::info!(
                                "Connected experiment with permId {} is missing from the pull",
                                conn.to_perm_id
                            );
                        }
                    }
                    other => {
                        tracing::debug!("Ignoring {other:?} connection on project {perm_id}")
                    }
                }
            }
        }
    }

    async fn reconcile_experiments(
        &self,
        data: &mut ResourceListData,
        watermark: DateTime<Utc>,
        batch: &mut ReconciliationBatch,
    ) {
        let perm_ids: Vec<String> = data.experiments.keys().cloned().collect();
        for perm_id in &perm_ids {
            let record = data.experiments[perm_id].clone();
            if record.modified_after(watermark) {
                match self.store.experiment_by_perm_id(perm_id).await {
                    Ok(None) => batch.experiment_creations.push(record.entity.clone()),
                    Ok(Some(stored)) => batch.experiment_updates.push(ExperimentUpdate {
                        perm_id: perm_id.clone(),
                        identifier: record.entity.identifier.clone(),
                        version: stored.version,
                        properties: prepare_updated_properties(
                            &record.entity.properties,
                            &stored.properties,
                        ),
                    }),
                    Err(e) => tracing::warn!("Skipping experiment {perm_id}, lookup failed: {e}"),
                }
            }
            for conn in &record.connections {
                match conn.kind {
                    ConnectionKind::Reference => {
                        let mut resolved = false;
                        if let Some(sample) = data.samples.get_mut(&conn.to_perm_id) {
                            sample.entity.experiment = Some(record.entity.identifier.clone());
                            resolved = true;
                        }
                        if let Some(data_set) = data.data_sets.get_mut(&conn.to_perm_id) {
                            data_set.entity.experiment = Some(record.entity.identifier.clone());
                            resolved = true;
                        }
                        if !resolved {
                            tracing::info!(
                                "Connected entity with permId {} is missing from the pull",
                                conn.to_perm_id
                            );
                        }
                    }
                    other => {
                        tracing::debug!("Ignoring {other:?} connection on experiment {perm_id}")
                    }
                }
            }
        }
    }

    async fn reconcile_samples(
        &self,
        data: &mut ResourceListData,
        watermark: DateTime<Utc>,
        batch: &mut ReconciliationBatch,
    ) {
        enum Pending {
            Create,
            Update(StoredRecord),
        }
        let mut pending: BTreeMap<String, Pending> = BTreeMap::new();
        let mut fold = LinkFold::default();

        let perm_ids: Vec<String> = data.samples.keys().cloned().collect();
        for perm_id in &perm_ids {
            let record = data.samples[perm_id].clone();
            if record.modified_after(watermark) {
                match self.store.sample_by_perm_id(perm_id).await {
                    Ok(None) => {
                        pending.insert(perm_id.clone(), Pending::Create);
                    }
                    Ok(Some(stored)) => {
                        pending.insert(perm_id.clone(), Pending::Update(stored));
                    }
                    Err(e) => tracing::warn!("Skipping sample {perm_id}, lookup failed: {e}"),
                }
            }
            for conn in &record.connections {
                match conn.kind {
                    ConnectionKind::Component => {
                        if let Some(component) = data.samples.get_mut(&conn.to_perm_id) {
                            component.entity.container = Some(record.entity.identifier.clone());
                        } else {
                            tracing::info!(
                                "Component sample with permId {} is missing from the pull",
                                conn.to_perm_id
                            );
                        }
                    }
                    ConnectionKind::Child => {
                        if data.samples.contains_key(&conn.to_perm_id) {
                            fold.record(
                                record.entity.identifier.clone(),
                                ConnectionKind::Child,
                                conn.to_perm_id.clone(),
                            );
                        } else {
                            tracing::info!(
                                "Child sample with permId {} is missing from the pull",
                                conn.to_perm_id
                            );
                        }
                    }
                    ConnectionKind::Reference => {
                        tracing::debug!("Ignoring plain reference on sample {perm_id}")
                    }
                }
            }
        }

        // Instructions are built only after the full pass, so every
        // incoming parent edge and container assignment has been seen.
        let links = fold.group();
        for (perm_id, decision) in pending {
            let record = &data.samples[&perm_id];
            let parents = links.parents_of(&perm_id);
            match decision {
                Pending::Create => {
                    let mut sample = record.entity.clone();
                    sample.parents = parents;
                    batch.sample_creations.push(sample);
                }
                Pending::Update(stored) => batch.sample_updates.push(SampleUpdate {
                    perm_id: perm_id.clone(),
                    identifier: record.entity.identifier.clone(),
                    version: stored.version,
                    properties: prepare_updated_properties(
                        &record.entity.properties,
                        &stored.properties,
                    ),
                    experiment: record.entity.experiment.clone(),
                    container: record.entity.container.clone(),
                    modified_parents: parents,
                }),
            }
        }
    }

    async fn reconcile_materials(
        &self,
        data: &ResourceListData,
        watermark: DateTime<Utc>,
        batch: &mut ReconciliationBatch,
    ) {
        for (key, record) in &data.materials {
            if !record.modified_after(watermark) {
                continue;
            }
            match self.store.material_by_key(key).await {
                Ok(None) => batch.material_creations.push(record.entity.clone()),
                Ok(Some(stored)) => batch.material_updates.push(MaterialUpdate {
                    key: key.clone(),
                    version: stored.version,
                    properties: prepare_updated_properties(
                        &record.entity.properties,
                        &stored.properties,
                    ),
                }),
                Err(e) => tracing::warn!("Skipping material {key}, lookup failed: {e}"),
            }
        }
    }

    async fn commit(
        &self,
        batch: &ReconciliationBatch,
        label: &str,
    ) -> Result<OperationSummary, HarvestError> {
        if batch.is_empty() {
            tracing::debug!("No {label} operations to commit");
            return Ok(OperationSummary::default());
        }
        batch.log_summary(label);
        if self.config.dry_run {
            tracing::info!("Dry run: skipping {label} commit");
            return Ok(OperationSummary::default());
        }
        let summary = self
            .store
            .perform_operations(batch)
            .await
            .map_err(|e| HarvestError::Commit(format!("{label}: {e}")))?;
        tracing::info!(
            "Entity operation result: {} created, {} updated",
            summary.created,
            summary.updated
        );
        Ok(summary)
    }

    async fn transfer_physical(
        &self,
        data: &ResourceListData,
        watermark: DateTime<Utc>,
    ) -> TransferSummary {
        let selected = data.physical_modified_after(watermark);
        if selected.is_empty() {
            tracing::info!("No physical data sets modified since the watermark");
            return TransferSummary::default();
        }
        let ordered = dependency_order(&data.data_sets, &selected);
        if self.config.dry_run {
            tracing::info!(
                "Dry run: skipping transfer of {} physical data sets",
                ordered.len()
            );
            return TransferSummary::default();
        }
        let pool = TransferPool::new(
            self.files.clone(),
            self.store.clone(),
            self.store_root.clone(),
            &self.config.harvester_temp_dir,
            self.config.parallel.worker_count(),
            self.config.request_timeout,
        );
        let batch: Vec<_> = ordered
            .iter()
            .filter_map(|code| data.data_sets.get(code))
            .map(|record| record.entity.clone())
            .collect();
        let summary = pool.run(batch).await;
        if !summary.failed.is_empty() {
            tracing::warn!(
                "{} data sets failed to register: {:?}",
                summary.failed.len(),
                summary.failed
            );
        }
        summary
    }

    /// Third pass: container creations plus the linkage updates that
    /// need the physical data sets' storage identifiers to exist first.
    async fn link_data_sets(
        &self,
        data: &ResourceListData,
        watermark: DateTime<Utc>,
        failed: &[String],
    ) -> ReconciliationBatch {
        let mut fold = LinkFold::default();
        for (code, record) in &data.data_sets {
            for conn in &record.connections {
                if !data.data_sets.contains_key(&conn.to_perm_id) {
                    tracing::info!(
                        "Connected data set {} is missing from the pull",
                        conn.to_perm_id
                    );
                    continue;
                }
                if failed.contains(code) || failed.contains(&conn.to_perm_id) {
                    continue;
                }
                match conn.kind {
                    ConnectionKind::Child | ConnectionKind::Component => {
                        fold.record(code.clone(), conn.kind, conn.to_perm_id.clone());
                    }
                    ConnectionKind::Reference => {
                        tracing::debug!("Ignoring plain reference on data set {code}")
                    }
                }
            }
        }
        let links = fold.group();

        let mut batch = ReconciliationBatch::default();
        for (code, record) in &data.data_sets {
            if !record.modified_after(watermark) || failed.contains(code) {
                continue;
            }
            match self.store.data_set_by_code(&record.entity.code).await {
                Ok(None) => {
                    if record.entity.class == DataSetClass::Container {
                        batch.data_set_creations.push(DataSetCreation {
                            data_set: record.entity.clone(),
                            parents: links.parents_of(code),
                            contained: links.contained_in(code),
                        });
                    } else {
                        // A physical data set the workers did not
                        // register; leave it for the next pull.
                        tracing::warn!("Data set {code} is not present locally, skipping linkage");
                    }
                }
                Ok(Some(stored)) => batch.data_set_updates.push(DataSetUpdate {
                    code: record.entity.code.clone(),
                    version: stored.version,
                    properties: prepare_updated_properties(
                        &record.entity.properties,
                        &stored.properties,
                    ),
                    sample: record.entity.sample.clone(),
                    experiment: record.entity.experiment.clone(),
                    modified_parents: links.parents_of(code),
                    modified_contained: (record.entity.class == DataSetClass::Container)
                        .then(|| links.contained_in(code)),
                }),
                Err(e) => tracing::warn!("Skipping data set {code}, lookup failed: {e}"),
            }
        }
        batch
    }
}
