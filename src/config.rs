//! Harvester configuration.
//!
//! The configuration file is INI-style: `[Section]` headers followed by
//! `key = value` lines. One `[DataSource1]` section describes the remote
//! data source, the space lists and the local paths the engine needs.
//! Unknown sections and keys are ignored so operators can keep comments
//! and extra tooling keys in the same file.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::read_to_string;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::error::HarvestError;

pub const DATA_SOURCE_SECTION: &str = "DataSource1";

const RESOURCE_LIST_URL_KEY: &str = "resource-list-url";
const AS_URL_KEY: &str = "data-source-openbis-url";
const DSS_URL_KEY: &str = "data-source-dss-url";
const AUTH_REALM_KEY: &str = "data-source-auth-realm";
const AUTH_USER_KEY: &str = "data-source-auth-user";
const AUTH_PASS_KEY: &str = "data-source-auth-pass";
const DATA_SOURCE_SPACES_KEY: &str = "data-source-spaces";
const HARVESTER_SPACES_KEY: &str = "harvester-spaces";
const HARVESTER_TEMP_DIR_KEY: &str = "harvester-tmp-dir";
const LAST_SYNC_FILE_KEY: &str = "last-sync-timestamp-file";
const LOG_FILE_KEY: &str = "log-file";
const EMAIL_ADDRESSES_KEY: &str = "email-addresses";
const DRY_RUN_KEY: &str = "dry-run";
const MACHINE_LOAD_KEY: &str = "machine-load";
const MAX_THREADS_KEY: &str = "max-threads";
const REQUEST_TIMEOUT_KEY: &str = "request-timeout-ms";

const LIST_SEPARATOR: char = ',';

/// Minimal INI reader: sections of `key = value` lines. Lines starting
/// with `#` or `;` are comments.
#[derive(Debug, Default, Clone)]
pub struct ConfigReader {
    sections: BTreeMap<String, BTreeMap<String, String>>,
}

impl ConfigReader {
    pub fn parse(text: &str) -> Result<Self, HarvestError> {
        let mut sections: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        let mut current: Option<String> = None;
        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
                let name = name.trim().to_string();
                sections.entry(name.clone()).or_default();
                current = Some(name);
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(HarvestError::Config(format!(
                    "Line {} is neither a section header nor a key=value pair: '{line}'",
                    lineno + 1
                )));
            };
            let Some(section) = current.as_ref() else {
                return Err(HarvestError::Config(format!(
                    "Key '{}' appears before any section header",
                    key.trim()
                )));
            };
            sections
                .get_mut(section)
                .expect("section inserted on header")
                .insert(key.trim().to_string(), value.trim().to_string());
        }
        Ok(ConfigReader { sections })
    }

    pub fn section_exists(&self, section: &str) -> bool {
        self.sections.contains_key(section)
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .get(section)
            .and_then(|s| s.get(key))
            .map(String::as_str)
    }

    fn required(&self, section: &str, key: &str) -> Result<String, HarvestError> {
        self.get(section, key).map(str::to_string).ok_or_else(|| {
            HarvestError::Config(format!("Missing required key '{key}' in [{section}]"))
        })
    }
}

/// Injective remote-space to destination-space mapping, configured once
/// per run from the two position-aligned space lists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceMapping(BTreeMap<String, String>);

impl SpaceMapping {
    pub fn new(sources: &[String], destinations: &[String]) -> Result<Self, HarvestError> {
        if sources.len() != destinations.len() {
            return Err(HarvestError::Config(format!(
                "Please specify a harvester space for each data source space \
                 ({} data source spaces, {} harvester spaces)",
                sources.len(),
                destinations.len()
            )));
        }
        let mut map = BTreeMap::new();
        let mut seen = BTreeSet::new();
        for (source, destination) in sources.iter().zip(destinations) {
            if !seen.insert(destination.clone()) {
                return Err(HarvestError::Config(format!(
                    "Harvester space '{destination}' is mapped from more than one data source space"
                )));
            }
            if map.insert(source.clone(), destination.clone()).is_some() {
                return Err(HarvestError::Config(format!(
                    "Data source space '{source}' is listed more than once"
                )));
            }
        }
        Ok(SpaceMapping(map))
    }

    /// Destination space for a remote space code. Every space the
    /// document references must be configured; an unmapped code means
    /// the document and the configuration disagree.
    pub fn translate(&self, remote_space: &str) -> Result<&str, HarvestError> {
        self.0.get(remote_space).map(String::as_str).ok_or_else(|| {
            HarvestError::Parse(format!(
                "Document references space '{remote_space}' which has no harvester mapping"
            ))
        })
    }

    pub fn sources(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn destinations(&self) -> impl Iterator<Item = &str> {
        self.0.values().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Parallel execution preferences for the transfer pool.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParallelPrefs {
    /// Fraction of available cores to occupy.
    pub machine_load: f64,
    pub max_threads: usize,
}

impl Default for ParallelPrefs {
    fn default() -> Self {
        ParallelPrefs {
            machine_load: 0.5,
            max_threads: 10,
        }
    }
}

impl ParallelPrefs {
    pub fn worker_count(&self) -> usize {
        let by_load = (num_cpus::get() as f64 * self.machine_load).round() as usize;
        by_load.clamp(1, self.max_threads.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    pub resource_list_url: Url,
    pub data_source_as_url: String,
    pub data_source_dss_url: String,
    pub auth_realm: String,
    pub auth_user: String,
    pub auth_pass: String,
    pub data_source_spaces: Vec<String>,
    pub harvester_spaces: Vec<String>,
    pub harvester_temp_dir: String,
    pub last_sync_file: PathBuf,
    pub log_file: Option<PathBuf>,
    pub email_addresses: Vec<String>,
    pub dry_run: bool,
    pub parallel: ParallelPrefs,
    /// Applied to each remote download and remote service call.
    pub request_timeout: Duration,
}

impl SyncConfig {
    pub fn load(path: &Path) -> Result<Self, HarvestError> {
        tracing::debug!("Reading harvester configuration from {:?}", path);
        let text = read_to_string(path)?;
        Self::from_reader(&ConfigReader::parse(&text)?)
    }

    pub fn from_reader(reader: &ConfigReader) -> Result<Self, HarvestError> {
        if !reader.section_exists(DATA_SOURCE_SECTION) {
            return Err(HarvestError::Config(
                "Please specify at least one data source section".to_string(),
            ));
        }
        let section = DATA_SOURCE_SECTION;
        let resource_list_url = Url::parse(&reader.required(section, RESOURCE_LIST_URL_KEY)?)?;
        let config = SyncConfig {
            resource_list_url,
            data_source_as_url: reader.required(section, AS_URL_KEY)?,
            data_source_dss_url: reader.required(section, DSS_URL_KEY)?,
            auth_realm: reader.required(section, AUTH_REALM_KEY)?,
            auth_user: reader.required(section, AUTH_USER_KEY)?,
            auth_pass: reader.required(section, AUTH_PASS_KEY)?,
            data_source_spaces: split_list(&reader.required(section, DATA_SOURCE_SPACES_KEY)?),
            harvester_spaces: split_list(&reader.required(section, HARVESTER_SPACES_KEY)?),
            harvester_temp_dir: reader.required(section, HARVESTER_TEMP_DIR_KEY)?,
            last_sync_file: PathBuf::from(reader.required(section, LAST_SYNC_FILE_KEY)?),
            log_file: reader.get(section, LOG_FILE_KEY).map(PathBuf::from),
            email_addresses: reader
                .get(section, EMAIL_ADDRESSES_KEY)
                .map(split_list)
                .unwrap_or_default(),
            dry_run: match reader.get(section, DRY_RUN_KEY) {
                None => false,
                Some(v) => parse_bool(section, DRY_RUN_KEY, v)?,
            },
            parallel: ParallelPrefs {
                machine_load: match reader.get(section, MACHINE_LOAD_KEY) {
                    None => ParallelPrefs::default().machine_load,
                    Some(v) => v.parse().map_err(|_| {
                        HarvestError::Config(format!("'{v}' is not a valid machine load"))
                    })?,
                },
                max_threads: match reader.get(section, MAX_THREADS_KEY) {
                    None => ParallelPrefs::default().max_threads,
                    Some(v) => v.parse().map_err(|_| {
                        HarvestError::Config(format!("'{v}' is not a valid thread count"))
                    })?,
                },
            },
            request_timeout: match reader.get(section, REQUEST_TIMEOUT_KEY) {
                None => Duration::from_millis(10_000),
                Some(v) => Duration::from_millis(v.parse().map_err(|_| {
                    HarvestError::Config(format!("'{v}' is not a valid timeout in milliseconds"))
                })?),
            },
        };
        // Surface list-length mismatches at load time, before any
        // network activity.
        SpaceMapping::new(&config.data_source_spaces, &config.harvester_spaces)?;
        Ok(config)
    }

    pub fn space_mapping(&self) -> Result<SpaceMapping, HarvestError> {
        SpaceMapping::new(&self.data_source_spaces, &self.harvester_spaces)
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(LIST_SEPARATOR)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_bool(section: &str, key: &str, value: &str) -> Result<bool, HarvestError> {
    match value {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        other => Err(HarvestError::Config(format!(
            "'{other}' is not a valid boolean for '{key}' in [{section}]"
        ))),
    }
}
