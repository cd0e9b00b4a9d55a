//! Resource list document parsing.
//!
//! The remote data source publishes a sitemap-style `urlset` where each
//! `<url>` entry announces one resource. Entity metadata resources are
//! the ones whose location ends in the `/M` marker segment; each such
//! entry must carry exactly one `<lastmod>` and one `<xd>` extension
//! element describing the entity, its attributes, free-form properties
//! and outgoing connections. A missing or malformed element aborts the
//! whole parse: a partially understood document must never drive
//! reconciliation, because deletion is computed by difference against
//! it.
//!
//! Remote space codes are rewritten through the configured
//! [`SpaceMapping`] here, at extraction time. Nothing downstream of the
//! parser ever sees an unmapped space code.

use chrono::{DateTime, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use regex::Regex;
use std::collections::BTreeMap;

use crate::config::SpaceMapping;
use crate::error::HarvestError;
use crate::model::{
    Connection, ConnectionKind, DataSetClass, EntityKind, EntityProperty, Incoming, MaterialKey,
    NewDataSet, NewExperiment, NewMaterial, NewProject, NewSample, ResourceListData,
};

/// Location suffix marking an entity metadata resource.
const METADATA_MARKER: &str = "/M";
/// Master data is delivered through the same listing but synchronized
/// elsewhere; the entity parser skips it.
const MASTER_DATA_MARKER: &str = "MASTER_DATA/MASTER_DATA/M";

const LASTMOD_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Stable identifiers are runs of digits and hyphens; 17 is the minimum
/// length a timestamp-prefixed permId can have.
static PERM_ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([0-9-]{17,})").expect("perm id pattern is valid"));
static DATA_SET_CODE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"DATA_SET/(.*)/M").expect("data set code pattern is valid"));

pub struct ResourceListParser<'a> {
    mapping: &'a SpaceMapping,
    data: ResourceListData,
}

impl<'a> ResourceListParser<'a> {
    pub fn new(mapping: &'a SpaceMapping) -> Self {
        ResourceListParser {
            mapping,
            data: ResourceListData::default(),
        }
    }

    /// Parse the whole document into a [`ResourceListData`].
    pub fn parse(mut self, document: &str) -> Result<ResourceListData, HarvestError> {
        let entries = collect_entries(document)?;
        let total = entries.len();
        for entry in entries {
            if !entry.loc.ends_with(METADATA_MARKER) || entry.loc.ends_with(MASTER_DATA_MARKER) {
                continue;
            }
            self.parse_entry(entry)?;
        }
        tracing::debug!(
            "Parsed {} of {} listed resources into {} projects, {} experiments, {} samples, {} data sets, {} materials",
            self.data.projects.len()
                + self.data.experiments.len()
                + self.data.samples.len()
                + self.data.data_sets.len()
                + self.data.materials.len(),
            total,
            self.data.projects.len(),
            self.data.experiments.len(),
            self.data.samples.len(),
            self.data.data_sets.len(),
            self.data.materials.len(),
        );
        Ok(self.data)
    }

    fn parse_entry(&mut self, entry: UrlEntry) -> Result<(), HarvestError> {
        let loc = entry.loc;
        let lastmod_text = entry.lastmod.ok_or_else(|| {
            HarvestError::Parse(format!(
                "The resource list should contain 1 lastmod element per resource ({loc})"
            ))
        })?;
        let last_modification = parse_lastmod(&lastmod_text)?;
        let xd = entry.xd.ok_or_else(|| {
            HarvestError::Parse(format!(
                "The resource list should contain 1 xd element per resource ({loc})"
            ))
        })?;
        let kind = EntityKind::from_wire(&xd.required("kind", &loc)?)?;
        match kind {
            EntityKind::Project => self.parse_project(&loc, xd, last_modification),
            EntityKind::Experiment => self.parse_experiment(&loc, xd, last_modification),
            EntityKind::Sample => self.parse_sample(&loc, xd, last_modification),
            EntityKind::DataSet => self.parse_data_set(&loc, xd, last_modification),
            EntityKind::Material => self.parse_material(&loc, xd, last_modification),
        }
    }

    fn parse_project(
        &mut self,
        loc: &str,
        xd: XdBlock,
        last_modification: DateTime<Utc>,
    ) -> Result<(), HarvestError> {
        let perm_id = extract_perm_id(loc)?;
        let code = xd.required("code", loc)?;
        let description = xd.optional("desc").unwrap_or_default();
        let space = self.extract_space(&xd, loc)?;
        let project = NewProject {
            perm_id: perm_id.clone(),
            identifier: format!("/{space}/{code}"),
            code,
            description,
        };
        let mut record = Incoming::new(project, last_modification);
        record.connections = xd.into_connections()?;
        self.data.projects.insert(perm_id, record);
        Ok(())
    }

    fn parse_experiment(
        &mut self,
        loc: &str,
        xd: XdBlock,
        last_modification: DateTime<Utc>,
    ) -> Result<(), HarvestError> {
        let perm_id = extract_perm_id(loc)?;
        let code = xd.required("code", loc)?;
        let type_code = xd.required("type", loc)?;
        let project = xd.required("project", loc)?;
        let space = self.extract_space(&xd, loc)?;
        let experiment = NewExperiment {
            perm_id: perm_id.clone(),
            identifier: format!("/{space}/{project}/{code}"),
            code,
            type_code,
            properties: xd.properties.clone(),
        };
        let mut record = Incoming::new(experiment, last_modification);
        record.connections = xd.into_connections()?;
        self.data.experiments.insert(perm_id, record);
        Ok(())
    }

    fn parse_sample(
        &mut self,
        loc: &str,
        xd: XdBlock,
        last_modification: DateTime<Utc>,
    ) -> Result<(), HarvestError> {
        let perm_id = extract_perm_id(loc)?;
        let code = xd.required("code", loc)?;
        let type_code = xd.required("type", loc)?;
        let space = self.extract_space(&xd, loc)?;
        let experiment = match xd.optional("experiment") {
            Some(identifier) => Some(self.translate_identifier(&identifier)?),
            None => None,
        };
        let sample = NewSample {
            perm_id: perm_id.clone(),
            identifier: format!("/{space}/{code}"),
            code,
            type_code,
            experiment,
            container: None,
            parents: Vec::new(),
            properties: xd.properties.clone(),
        };
        let mut record = Incoming::new(sample, last_modification);
        record.connections = xd.into_connections()?;
        self.data.samples.insert(perm_id, record);
        Ok(())
    }

    fn parse_data_set(
        &mut self,
        loc: &str,
        xd: XdBlock,
        last_modification: DateTime<Utc>,
    ) -> Result<(), HarvestError> {
        let key = extract_data_set_code(loc)?;
        let code = xd.required("code", loc)?;
        let type_code = xd.required("type", loc)?;
        let class = DataSetClass::from_wire(&xd.required("dsKind", loc)?)?;
        let sample = match xd.optional("sample") {
            Some(identifier) => Some(self.translate_identifier(&identifier)?),
            None => None,
        };
        let experiment = match xd.optional("experiment") {
            Some(identifier) => Some(self.translate_identifier(&identifier)?),
            None => None,
        };
        let data_set = NewDataSet {
            code,
            type_code,
            class,
            sample,
            experiment,
            properties: xd.properties.clone(),
        };
        let mut record = Incoming::new(data_set, last_modification);
        record.connections = xd.into_connections()?;
        self.data.data_sets.insert(key, record);
        Ok(())
    }

    fn parse_material(
        &mut self,
        loc: &str,
        xd: XdBlock,
        last_modification: DateTime<Utc>,
    ) -> Result<(), HarvestError> {
        let code = xd.required("code", loc)?;
        let type_code = xd.required("type", loc)?;
        let material = NewMaterial {
            code: code.clone(),
            type_code: type_code.clone(),
            properties: xd.properties,
        };
        // Materials carry no connections in the source format.
        let record = Incoming::new(material, last_modification);
        self.data
            .materials
            .insert(MaterialKey::new(code, type_code), record);
        Ok(())
    }

    /// Read the `space` attribute, map it, and record the destination
    /// space as touched by this document.
    fn extract_space(&mut self, xd: &XdBlock, loc: &str) -> Result<String, HarvestError> {
        let remote = xd.required("space", loc)?;
        let mapped = self.mapping.translate(&remote)?.to_string();
        self.data.harvester_spaces.insert(mapped.clone());
        Ok(mapped)
    }

    /// Rewrite the space level of a `/SPACE/...` identifier through the
    /// mapping.
    fn translate_identifier(&self, identifier: &str) -> Result<String, HarvestError> {
        let trimmed = identifier.strip_prefix('/').ok_or_else(|| {
            HarvestError::Parse(format!("Identifier '{identifier}' does not start with '/'"))
        })?;
        match trimmed.split_once('/') {
            Some((space, rest)) => Ok(format!("/{}/{rest}", self.mapping.translate(space)?)),
            None => Ok(format!("/{}", self.mapping.translate(trimmed)?)),
        }
    }
}

fn parse_lastmod(text: &str) -> Result<DateTime<Utc>, HarvestError> {
    // The document states GMT times without a zone designator.
    let naive = NaiveDateTime::parse_from_str(text.trim(), LASTMOD_FORMAT).map_err(|e| {
        HarvestError::Parse(format!("Last modification date cannot be parsed '{text}': {e}"))
    })?;
    Ok(naive.and_utc())
}

fn extract_perm_id(loc: &str) -> Result<String, HarvestError> {
    PERM_ID_PATTERN
        .find(loc)
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| HarvestError::Parse(format!("Malformed resource url '{loc}'")))
}

fn extract_data_set_code(loc: &str) -> Result<String, HarvestError> {
    DATA_SET_CODE_PATTERN
        .captures(loc)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| HarvestError::Parse(format!("Malformed resource url '{loc}'")))
}

/// One `<url>` entry as found in the document, before kind dispatch.
#[derive(Debug, Default)]
struct UrlEntry {
    loc: String,
    lastmod: Option<String>,
    xd: Option<XdBlock>,
}

/// The `<xd>` extension element: attributes plus the optional
/// `<properties>` and `<connections>` children.
#[derive(Debug, Default)]
struct XdBlock {
    attributes: BTreeMap<String, String>,
    properties: Vec<EntityProperty>,
    connections: Vec<(String, String)>,
}

impl XdBlock {
    fn required(&self, name: &str, loc: &str) -> Result<String, HarvestError> {
        self.optional(name).ok_or_else(|| {
            HarvestError::Parse(format!("Missing '{name}' attribute on xd element ({loc})"))
        })
    }

    /// Absent and empty attributes are both treated as "not set"; the
    /// data source emits empty strings for unset references.
    fn optional(&self, name: &str) -> Option<String> {
        self.attributes
            .get(name)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }

    fn into_connections(self) -> Result<Vec<Connection>, HarvestError> {
        self.connections
            .into_iter()
            .map(|(to, kind)| {
                Ok(Connection {
                    to_perm_id: to,
                    kind: ConnectionKind::from_wire(&kind)?,
                })
            })
            .collect()
    }
}

fn read_attributes(element: &BytesStart<'_>) -> Result<BTreeMap<String, String>, HarvestError> {
    let mut attributes = BTreeMap::new();
    for attr in element.attributes() {
        let attr = attr.map_err(|e| HarvestError::Parse(format!("Bad attribute: {e}")))?;
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| HarvestError::Parse(format!("Bad attribute value: {e}")))?
            .into_owned();
        attributes.insert(key, value);
    }
    Ok(attributes)
}

/// What the next text event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TextTarget {
    Loc,
    LastMod,
    PropertyCode,
    PropertyValue,
}

/// First pass: flatten the XML stream into [`UrlEntry`] records. Element
/// names are matched on their local part, so any namespace prefixes the
/// data source chooses are accepted.
fn collect_entries(document: &str) -> Result<Vec<UrlEntry>, HarvestError> {
    let mut reader = Reader::from_str(document);
    reader.trim_text(true);

    let mut entries = Vec::new();
    let mut current: Option<UrlEntry> = None;
    let mut in_properties = false;
    let mut pending_property: Option<EntityProperty> = None;
    let mut text_target: Option<TextTarget> = None;

    loop {
        match reader.read_event()? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"url" => current = Some(UrlEntry::default()),
                b"loc" => text_target = Some(TextTarget::Loc),
                b"lastmod" => text_target = Some(TextTarget::LastMod),
                b"xd" => {
                    if let Some(entry) = current.as_mut() {
                        entry.xd = Some(XdBlock {
                            attributes: read_attributes(&e)?,
                            ..Default::default()
                        });
                    }
                }
                b"properties" => in_properties = true,
                b"property" if in_properties => {
                    pending_property = Some(EntityProperty::new("", ""));
                }
                b"code" if pending_property.is_some() => {
                    text_target = Some(TextTarget::PropertyCode);
                }
                b"value" if pending_property.is_some() => {
                    text_target = Some(TextTarget::PropertyValue);
                }
                b"connection" => {
                    push_connection(&e, current.as_mut())?;
                }
                _ => {}
            },
            Event::Empty(e) => match e.local_name().as_ref() {
                b"xd" => {
                    if let Some(entry) = current.as_mut() {
                        entry.xd = Some(XdBlock {
                            attributes: read_attributes(&e)?,
                            ..Default::default()
                        });
                    }
                }
                b"connection" => {
                    push_connection(&e, current.as_mut())?;
                }
                _ => {}
            },
            Event::Text(t) => {
                if let Some(target) = text_target {
                    let text = t
                        .unescape()
                        .map_err(|e| HarvestError::Parse(format!("Bad text content: {e}")))?
                        .into_owned();
                    match (target, current.as_mut(), pending_property.as_mut()) {
                        (TextTarget::Loc, Some(entry), _) => entry.loc = text,
                        (TextTarget::LastMod, Some(entry), _) => entry.lastmod = Some(text),
                        (TextTarget::PropertyCode, _, Some(prop)) => prop.code = text,
                        (TextTarget::PropertyValue, _, Some(prop)) => prop.value = text,
                        _ => {}
                    }
                }
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"url" => {
                    if let Some(entry) = current.take() {
                        entries.push(entry);
                    }
                }
                b"loc" | b"lastmod" | b"code" | b"value" => text_target = None,
                b"properties" => in_properties = false,
                b"property" => {
                    if let (Some(prop), Some(entry)) = (pending_property.take(), current.as_mut()) {
                        if let Some(xd) = entry.xd.as_mut() {
                            xd.properties.push(prop);
                        }
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(entries)
}

fn push_connection(
    element: &BytesStart<'_>,
    current: Option<&mut UrlEntry>,
) -> Result<(), HarvestError> {
    let attributes = read_attributes(element)?;
    let (Some(to), Some(kind)) = (attributes.get("to"), attributes.get("type")) else {
        return Err(HarvestError::Parse(
            "Connection element without 'to' and 'type' attributes".to_string(),
        ));
    };
    if let Some(xd) = current.and_then(|entry| entry.xd.as_mut()) {
        xd.connections.push((to.clone(), kind.clone()));
    }
    Ok(())
}
