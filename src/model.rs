//! Typed records for the entities announced by a resource list document,
//! plus the in-memory reconciliation model produced by one parse.
//!
//! Everything in here is created once per pull by
//! [`ResourceListParser`](crate::parser::ResourceListParser), read (and in
//! a few places rewritten) by the engine while it builds a batch, and
//! discarded when the pull completes. Nothing is persisted across runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::error::HarvestError;

/// The closed set of entity kinds a resource list can announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKind {
    Project,
    Experiment,
    Sample,
    DataSet,
    Material,
}

impl EntityKind {
    pub fn from_wire(s: &str) -> Result<Self, HarvestError> {
        match s {
            "PROJECT" => Ok(EntityKind::Project),
            "EXPERIMENT" => Ok(EntityKind::Experiment),
            "SAMPLE" => Ok(EntityKind::Sample),
            "DATA_SET" => Ok(EntityKind::DataSet),
            "MATERIAL" => Ok(EntityKind::Material),
            other => Err(HarvestError::Parse(format!(
                "Unknown entity kind attribute '{other}'"
            ))),
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EntityKind::Project => write!(f, "PROJECT"),
            EntityKind::Experiment => write!(f, "EXPERIMENT"),
            EntityKind::Sample => write!(f, "SAMPLE"),
            EntityKind::DataSet => write!(f, "DATA_SET"),
            EntityKind::Material => write!(f, "MATERIAL"),
        }
    }
}

/// Relationship kind of a [`Connection`] edge.
///
/// Wire values are `Connection` (a plain reference between nesting
/// levels), `Child` (lineage) and `Component` (aggregation without
/// lineage). Anything else in the document is a parse error rather than
/// a silently dropped edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConnectionKind {
    Reference,
    Child,
    Component,
}

impl ConnectionKind {
    pub fn from_wire(s: &str) -> Result<Self, HarvestError> {
        match s {
            "Connection" => Ok(ConnectionKind::Reference),
            "Child" => Ok(ConnectionKind::Child),
            "Component" => Ok(ConnectionKind::Component),
            other => Err(HarvestError::Parse(format!(
                "Unknown connection type '{other}'"
            ))),
        }
    }
}

/// A directed edge from the entity owning this connection to another
/// remote identifier. The target may be part of the current pull or may
/// only exist in local storage; resolution happens in the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub to_perm_id: String,
    pub kind: ConnectionKind,
}

/// A free-form property as announced by the document: a property type
/// code paired with its value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityProperty {
    pub code: String,
    pub value: String,
}

impl EntityProperty {
    pub fn new(code: impl Into<String>, value: impl Into<String>) -> Self {
        EntityProperty {
            code: code.into(),
            value: value.into(),
        }
    }
}

/// Storage class of a data set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataSetClass {
    /// Files live in the store; transferred through the worker pool.
    Physical,
    /// Aggregates other data sets, carries no files of its own.
    Container,
}

impl DataSetClass {
    pub fn from_wire(s: &str) -> Result<Self, HarvestError> {
        match s {
            "PHYSICAL" => Ok(DataSetClass::Physical),
            "CONTAINER" => Ok(DataSetClass::Container),
            other => Err(HarvestError::Parse(format!(
                "Unknown data set kind '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewProject {
    pub perm_id: String,
    pub code: String,
    /// `/DEST_SPACE/CODE`, space already mapped.
    pub identifier: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewExperiment {
    pub perm_id: String,
    pub code: String,
    pub type_code: String,
    /// `/DEST_SPACE/PROJECT/CODE`, space already mapped. Rewritten by
    /// the project pass when the owning project announces a reference.
    pub identifier: String,
    pub properties: Vec<EntityProperty>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSample {
    pub perm_id: String,
    pub code: String,
    pub type_code: String,
    /// `/DEST_SPACE/CODE`, space already mapped.
    pub identifier: String,
    pub experiment: Option<String>,
    pub container: Option<String>,
    pub parents: Vec<String>,
    pub properties: Vec<EntityProperty>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewDataSet {
    /// Data sets have no separate permId; the code is the stable key.
    pub code: String,
    pub type_code: String,
    pub class: DataSetClass,
    pub sample: Option<String>,
    pub experiment: Option<String>,
    pub properties: Vec<EntityProperty>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMaterial {
    pub code: String,
    pub type_code: String,
    pub properties: Vec<EntityProperty>,
}

/// Value identity of a material. The source format assigns materials no
/// permId, so the `(code, type)` pair is the reconciliation key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MaterialKey {
    pub code: String,
    pub type_code: String,
}

impl MaterialKey {
    pub fn new(code: impl Into<String>, type_code: impl Into<String>) -> Self {
        MaterialKey {
            code: code.into(),
            type_code: type_code.into(),
        }
    }
}

impl fmt::Display for MaterialKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({})", self.code, self.type_code)
    }
}

/// An entity record paired with its last-modification instant and its
/// outgoing connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Incoming<T> {
    pub entity: T,
    pub last_modification: DateTime<Utc>,
    pub connections: Vec<Connection>,
}

impl<T> Incoming<T> {
    pub fn new(entity: T, last_modification: DateTime<Utc>) -> Self {
        Incoming {
            entity,
            last_modification,
            connections: Vec::new(),
        }
    }

    /// True when the entity body must be considered for create/update.
    /// Connections are resolved regardless of this gate.
    pub fn modified_after(&self, watermark: DateTime<Utc>) -> bool {
        self.last_modification > watermark
    }
}

/// Everything one parse of the resource list produced, indexed by stable
/// remote identifier (materials by their value key).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceListData {
    pub projects: BTreeMap<String, Incoming<NewProject>>,
    pub experiments: BTreeMap<String, Incoming<NewExperiment>>,
    pub samples: BTreeMap<String, Incoming<NewSample>>,
    pub data_sets: BTreeMap<String, Incoming<NewDataSet>>,
    pub materials: BTreeMap<MaterialKey, Incoming<NewMaterial>>,
    /// Destination spaces touched by this document (mapped codes).
    pub harvester_spaces: BTreeSet<String>,
}

impl ResourceListData {
    /// Codes of physical data sets whose body changed since the
    /// watermark, in key order. This is the input to the transfer pool.
    pub fn physical_modified_after(&self, watermark: DateTime<Utc>) -> Vec<String> {
        self.data_sets
            .iter()
            .filter(|(_, ds)| {
                ds.entity.class == DataSetClass::Physical && ds.modified_after(watermark)
            })
            .map(|(code, _)| code.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.projects.is_empty()
            && self.experiments.is_empty()
            && self.samples.is_empty()
            && self.data_sets.is_empty()
            && self.materials.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ds(class: DataSetClass) -> NewDataSet {
        NewDataSet {
            code: String::new(),
            type_code: "RAW".to_string(),
            class,
            sample: None,
            experiment: None,
            properties: Vec::new(),
        }
    }

    #[test]
    fn physical_filter_respects_class_and_watermark() {
        let watermark = Utc.with_ymd_and_hms(2024, 1, 5, 0, 0, 0).unwrap();
        let before = Utc.with_ymd_and_hms(2024, 1, 4, 0, 0, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap();

        let mut data = ResourceListData::default();
        let mut fresh = Incoming::new(ds(DataSetClass::Physical), after);
        fresh.entity.code = "DS-FRESH".to_string();
        let mut stale = Incoming::new(ds(DataSetClass::Physical), before);
        stale.entity.code = "DS-STALE".to_string();
        let mut container = Incoming::new(ds(DataSetClass::Container), after);
        container.entity.code = "DS-CONT".to_string();
        data.data_sets.insert("DS-FRESH".to_string(), fresh);
        data.data_sets.insert("DS-STALE".to_string(), stale);
        data.data_sets.insert("DS-CONT".to_string(), container);

        assert_eq!(data.physical_modified_after(watermark), vec!["DS-FRESH"]);
    }

    #[test]
    fn entity_at_watermark_is_not_modified() {
        let watermark = Utc.with_ymd_and_hms(2024, 1, 5, 0, 0, 0).unwrap();
        let record = Incoming::new((), watermark);
        assert!(!record.modified_after(watermark));
    }

    #[test]
    fn wire_tags_round_trip() {
        for (tag, kind) in [
            ("PROJECT", EntityKind::Project),
            ("EXPERIMENT", EntityKind::Experiment),
            ("SAMPLE", EntityKind::Sample),
            ("DATA_SET", EntityKind::DataSet),
            ("MATERIAL", EntityKind::Material),
        ] {
            assert_eq!(EntityKind::from_wire(tag).unwrap(), kind);
            assert_eq!(kind.to_string(), tag);
        }
        assert!(EntityKind::from_wire("ATTACHMENT").is_err());
        assert!(ConnectionKind::from_wire("Sibling").is_err());
    }
}
