//! The batch of pending operations built during one reconciliation
//! pass, and the connection fold that feeds its linkage fields.
//!
//! Updates are always full replacements. A linkage list that became
//! empty is submitted as an explicit empty array so the storage layer
//! treats it as a deliberate clear, never as "no change requested".

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::model::{
    ConnectionKind, EntityProperty, MaterialKey, NewDataSet, NewExperiment, NewMaterial,
    NewProject, NewSample,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectUpdate {
    pub perm_id: String,
    pub identifier: String,
    pub version: i64,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentUpdate {
    pub perm_id: String,
    pub identifier: String,
    pub version: i64,
    pub properties: Vec<EntityProperty>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleUpdate {
    pub perm_id: String,
    pub identifier: String,
    pub version: i64,
    pub properties: Vec<EntityProperty>,
    pub experiment: Option<String>,
    pub container: Option<String>,
    /// Complete replacement set of parent identifiers. Empty means "this
    /// sample has no parents any more".
    pub modified_parents: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterialUpdate {
    pub key: MaterialKey,
    pub version: i64,
    pub properties: Vec<EntityProperty>,
}

/// Creation of a data set in the linkage pass (containers only; physical
/// data sets are registered by the transfer workers).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSetCreation {
    pub data_set: NewDataSet,
    pub parents: Vec<String>,
    pub contained: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSetUpdate {
    pub code: String,
    pub version: i64,
    pub properties: Vec<EntityProperty>,
    pub sample: Option<String>,
    pub experiment: Option<String>,
    /// Complete replacement set of parent data set codes.
    pub modified_parents: Vec<String>,
    /// Complete replacement set of contained codes; `None` for
    /// non-container data sets, where no container update is requested.
    pub modified_contained: Option<Vec<String>>,
}

/// Accumulator for one atomic operation set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationBatch {
    pub project_creations: Vec<NewProject>,
    pub project_updates: Vec<ProjectUpdate>,
    pub experiment_creations: Vec<NewExperiment>,
    pub experiment_updates: Vec<ExperimentUpdate>,
    pub sample_creations: Vec<NewSample>,
    pub sample_updates: Vec<SampleUpdate>,
    pub material_creations: Vec<NewMaterial>,
    pub material_updates: Vec<MaterialUpdate>,
    pub data_set_creations: Vec<DataSetCreation>,
    pub data_set_updates: Vec<DataSetUpdate>,
}

impl ReconciliationBatch {
    pub fn creations(&self) -> usize {
        self.project_creations.len()
            + self.experiment_creations.len()
            + self.sample_creations.len()
            + self.material_creations.len()
            + self.data_set_creations.len()
    }

    pub fn updates(&self) -> usize {
        self.project_updates.len()
            + self.experiment_updates.len()
            + self.sample_updates.len()
            + self.material_updates.len()
            + self.data_set_updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.creations() == 0 && self.updates() == 0
    }

    pub fn log_summary(&self, label: &str) {
        tracing::info!(
            "{label} batch: +{}/~{} projects, +{}/~{} experiments, +{}/~{} samples, \
             +{}/~{} materials, +{}/~{} data sets",
            self.project_creations.len(),
            self.project_updates.len(),
            self.experiment_creations.len(),
            self.experiment_updates.len(),
            self.sample_creations.len(),
            self.sample_updates.len(),
            self.material_creations.len(),
            self.material_updates.len(),
            self.data_set_creations.len(),
            self.data_set_updates.len(),
        );
    }
}

/// Pad the incoming property list with the locally stored properties it
/// no longer mentions, set to the empty string, so values that were
/// cleared at the data source are cleared here too instead of lingering.
pub fn prepare_updated_properties(
    incoming: &[EntityProperty],
    existing: &[EntityProperty],
) -> Vec<EntityProperty> {
    let mut updated = incoming.to_vec();
    let incoming_codes: BTreeSet<&str> = incoming.iter().map(|p| p.code.as_str()).collect();
    for property in existing {
        if !incoming_codes.contains(property.code.as_str()) {
            updated.push(EntityProperty::new(property.code.clone(), ""));
        }
    }
    updated
}

/// First phase of the connection fold: `(target, kind, source)` triples
/// collected while walking every entity's connections. The second phase
/// ([`LinkFold::group`]) builds per-target parent sets and per-source
/// contained sets, so a target referenced by several connections has
/// its complete set available before any update instruction is built.
#[derive(Debug, Default, Clone)]
pub struct LinkFold {
    triples: Vec<(String, ConnectionKind, String)>,
}

impl LinkFold {
    pub fn record(&mut self, source: impl Into<String>, kind: ConnectionKind, target: impl Into<String>) {
        self.triples.push((target.into(), kind, source.into()));
    }

    pub fn group(&self) -> GroupedLinks {
        let mut parents_by_target: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut contained_by_source: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (target, kind, source) in &self.triples {
            match kind {
                ConnectionKind::Child => {
                    parents_by_target
                        .entry(target.clone())
                        .or_default()
                        .insert(source.clone());
                }
                ConnectionKind::Component => {
                    contained_by_source
                        .entry(source.clone())
                        .or_default()
                        .insert(target.clone());
                }
                ConnectionKind::Reference => {}
            }
        }
        GroupedLinks {
            parents_by_target,
            contained_by_source,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct GroupedLinks {
    parents_by_target: BTreeMap<String, BTreeSet<String>>,
    contained_by_source: BTreeMap<String, BTreeSet<String>>,
}

impl GroupedLinks {
    /// Complete parent set of `target`; empty when nothing points at it.
    pub fn parents_of(&self, target: &str) -> Vec<String> {
        self.parents_by_target
            .get(target)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Complete contained set of a container; empty when it aggregates
    /// nothing in this pull.
    pub fn contained_in(&self, source: &str) -> Vec<String> {
        self.contained_by_source
            .get(source)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removed_properties_are_padded_with_empty_values() {
        let incoming = vec![EntityProperty::new("A", "1")];
        let existing = vec![
            EntityProperty::new("A", "old"),
            EntityProperty::new("B", "gone"),
        ];
        let updated = prepare_updated_properties(&incoming, &existing);
        assert_eq!(
            updated,
            vec![EntityProperty::new("A", "1"), EntityProperty::new("B", "")]
        );
    }

    #[test]
    fn fold_accumulates_all_parents_of_a_target() {
        let mut fold = LinkFold::default();
        fold.record("/DST/P_A", ConnectionKind::Child, "child-1");
        fold.record("/DST/P_B", ConnectionKind::Child, "child-1");
        fold.record("/DST/P_A", ConnectionKind::Child, "child-1"); // duplicate edge
        let links = fold.group();
        assert_eq!(links.parents_of("child-1"), vec!["/DST/P_A", "/DST/P_B"]);
        assert!(links.parents_of("child-2").is_empty());
    }

    #[test]
    fn fold_groups_contained_by_container() {
        let mut fold = LinkFold::default();
        fold.record("CONT-1", ConnectionKind::Component, "DS-1");
        fold.record("CONT-1", ConnectionKind::Component, "DS-2");
        fold.record("CONT-1", ConnectionKind::Reference, "DS-3");
        let links = fold.group();
        assert_eq!(links.contained_in("CONT-1"), vec!["DS-1", "DS-2"]);
    }
}
