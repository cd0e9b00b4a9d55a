//! Deletion by difference.
//!
//! The incoming document is the authoritative enumeration of every
//! entity in the scoped spaces: anything local that it no longer
//! mentions is removed. This is only correct when the document is
//! complete — a truncated document causes false deletions — which is
//! why a parse failure anywhere aborts the pull before this pass runs.
//!
//! Two deletion paths exist on purpose. Data sets, samples and
//! experiments go through a staged delete whose tokens are confirmed in
//! one administrative call; projects and materials are deleted
//! immediately without confirmation. Unifying the paths would change
//! the storage layer's observable two-phase behavior.

use std::collections::BTreeMap;

use crate::config::SpaceMapping;
use crate::error::HarvestError;
use crate::model::{EntityKind, MaterialKey, ResourceListData};
use crate::service::{AdminApi, DeletionToken};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeletionReport {
    pub data_sets: usize,
    pub samples: usize,
    pub experiments: usize,
    pub projects: usize,
    pub materials: usize,
}

impl DeletionReport {
    pub fn total(&self) -> usize {
        self.data_sets + self.samples + self.experiments + self.projects + self.materials
    }
}

pub struct DeletionReconciler<'a> {
    admin: &'a dyn AdminApi,
    mapping: &'a SpaceMapping,
}

impl<'a> DeletionReconciler<'a> {
    pub fn new(admin: &'a dyn AdminApi, mapping: &'a SpaceMapping) -> Self {
        DeletionReconciler { admin, mapping }
    }

    pub async fn reconcile(
        &self,
        data: &ResourceListData,
        dry_run: bool,
    ) -> Result<DeletionReport, HarvestError> {
        // Identifier by key, kept for operator-readable logging.
        let mut projects: BTreeMap<String, String> = BTreeMap::new();
        let mut experiments: BTreeMap<String, String> = BTreeMap::new();
        let mut samples: BTreeMap<String, String> = BTreeMap::new();
        let mut data_sets: BTreeMap<String, String> = BTreeMap::new();

        for space in self.mapping.destinations() {
            let entities = self
                .admin
                .space_entities(space)
                .await
                .map_err(|e| HarvestError::Deletion(format!("listing space '{space}': {e}")))?;
            for entity in entities {
                let perm_id = entity.perm_id;
                let identifier = entity.identifier;
                match entity.kind {
                    EntityKind::Project => {
                        if !data.projects.contains_key(&perm_id) {
                            projects.insert(perm_id, identifier);
                        }
                    }
                    EntityKind::Experiment => {
                        if !data.experiments.contains_key(&perm_id) {
                            experiments.insert(perm_id, identifier);
                        }
                    }
                    EntityKind::Sample => {
                        if !data.samples.contains_key(&perm_id) {
                            samples.insert(perm_id, identifier);
                        }
                    }
                    EntityKind::DataSet => {
                        if !data.data_sets.contains_key(&perm_id) {
                            data_sets.insert(perm_id, identifier);
                        }
                    }
                    EntityKind::Material => {
                        // Materials are space-less; compared globally below.
                    }
                }
            }
        }

        // Materials are compared against the full incoming set, not per
        // space.
        let materials: Vec<MaterialKey> = self
            .admin
            .list_materials()
            .await
            .map_err(|e| HarvestError::Deletion(format!("listing materials: {e}")))?
            .into_iter()
            .filter(|key| !data.materials.contains_key(key))
            .collect();

        let report = DeletionReport {
            data_sets: data_sets.len(),
            samples: samples.len(),
            experiments: experiments.len(),
            projects: projects.len(),
            materials: materials.len(),
        };
        log_stale("data sets", &data_sets);
        log_stale("samples", &samples);
        log_stale("experiments", &experiments);
        log_stale("projects", &projects);
        if !materials.is_empty() {
            tracing::info!("{} materials are stale: {:?}", materials.len(), materials);
        }
        if report.total() == 0 {
            tracing::info!("Nothing has been deleted");
            return Ok(report);
        }
        if dry_run {
            tracing::info!("Dry run: skipping deletion of {} entities", report.total());
            return Ok(report);
        }

        let mut tokens: Vec<DeletionToken> = Vec::new();
        if !data_sets.is_empty() {
            let codes: Vec<String> = data_sets.keys().cloned().collect();
            tokens.push(
                self.admin
                    .delete_data_sets(&codes, "sync data set deletions")
                    .await
                    .map_err(|e| HarvestError::Deletion(format!("data sets: {e}")))?,
            );
        }
        if !samples.is_empty() {
            let perm_ids: Vec<String> = samples.keys().cloned().collect();
            tokens.push(
                self.admin
                    .delete_samples(&perm_ids, "sync sample deletions")
                    .await
                    .map_err(|e| HarvestError::Deletion(format!("samples: {e}")))?,
            );
        }
        if !experiments.is_empty() {
            let perm_ids: Vec<String> = experiments.keys().cloned().collect();
            tokens.push(
                self.admin
                    .delete_experiments(&perm_ids, "sync experiment deletions")
                    .await
                    .map_err(|e| HarvestError::Deletion(format!("experiments: {e}")))?,
            );
        }
        if !projects.is_empty() {
            let perm_ids: Vec<String> = projects.keys().cloned().collect();
            self.admin
                .delete_projects(&perm_ids, "sync project deletions")
                .await
                .map_err(|e| HarvestError::Deletion(format!("projects: {e}")))?;
        }
        if !materials.is_empty() {
            // A failed material deletion leaves stale materials behind
            // for the next pull, it does not invalidate this one.
            if let Err(e) = self
                .admin
                .delete_materials(&materials, "sync material deletions")
                .await
            {
                tracing::warn!("One or more materials could not be deleted: {e}");
            }
        }
        if !tokens.is_empty() {
            self.admin
                .confirm_deletions(&tokens)
                .await
                .map_err(|e| HarvestError::Deletion(format!("confirming deletions: {e}")))?;
        }
        tracing::info!(
            "{} data sets, {} samples, {} experiments, {} projects, {} materials have been deleted",
            report.data_sets,
            report.samples,
            report.experiments,
            report.projects,
            report.materials
        );
        Ok(report)
    }
}

fn log_stale(kind: &str, stale: &BTreeMap<String, String>) {
    if stale.is_empty() {
        return;
    }
    tracing::info!(
        "{} {kind} with the following identifiers are stale: {:?}",
        stale.len(),
        stale.values().collect::<Vec<_>>()
    );
}
