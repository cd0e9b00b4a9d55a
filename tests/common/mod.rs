//! Shared test utilities for integration tests.
//!
//! Import from integration test files as:
//! ```ignore
//! mod common;
//! ```

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use harvest_core::config::{ParallelPrefs, SyncConfig};
use harvest_core::connector::ResourceListSource;
use harvest_core::error::HarvestError;
use harvest_core::model::{EntityKind, MaterialKey, NewDataSet};
use harvest_core::service::{
    AdminApi, DeletionToken, EntityStore, FileTransferApi, LocalEntity, Notifier,
    OperationSummary, RemoteFile, ServiceError, StoredRecord,
};
use harvest_core::sync::batch::ReconciliationBatch;
use harvest_core::sync::{SyncEngine, SyncReport};

/// Initialize tracing for tests, respecting RUST_LOG env var.
///
/// Safe to call multiple times — subsequent calls are no-ops.
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

pub const BASE: &str = "https://remote.example/datastore_server/re-sync";

/// Builds a resource list document in the format the data source
/// publishes: a sitemap `urlset` with one `<url>` entry per entity.
#[derive(Default)]
pub struct DocBuilder {
    entries: Vec<String>,
}

fn conns_xml(conns: &[(&str, &str)]) -> String {
    if conns.is_empty() {
        return String::new();
    }
    let mut xml = String::from("<x:connections>");
    for (to, kind) in conns {
        xml.push_str(&format!("<x:connection to=\"{to}\" type=\"{kind}\"/>"));
    }
    xml.push_str("</x:connections>");
    xml
}

impl DocBuilder {
    pub fn new() -> Self {
        DocBuilder::default()
    }

    pub fn project(
        mut self,
        perm_id: &str,
        code: &str,
        space: &str,
        lastmod: &str,
        conns: &[(&str, &str)],
    ) -> Self {
        self.entries.push(format!(
            "<url><loc>{BASE}/PROJECT/{perm_id}/M</loc><lastmod>{lastmod}</lastmod>\
             <x:xd kind=\"PROJECT\" code=\"{code}\" desc=\"synced project\" space=\"{space}\">{}</x:xd></url>",
            conns_xml(conns)
        ));
        self
    }

    pub fn experiment(
        mut self,
        perm_id: &str,
        code: &str,
        project: &str,
        space: &str,
        lastmod: &str,
        conns: &[(&str, &str)],
    ) -> Self {
        self.entries.push(format!(
            "<url><loc>{BASE}/EXPERIMENT/{perm_id}/M</loc><lastmod>{lastmod}</lastmod>\
             <x:xd kind=\"EXPERIMENT\" code=\"{code}\" type=\"DEFAULT_EXP\" project=\"{project}\" \
             space=\"{space}\">{}</x:xd></url>",
            conns_xml(conns)
        ));
        self
    }

    pub fn sample(
        mut self,
        perm_id: &str,
        code: &str,
        space: &str,
        experiment: Option<&str>,
        lastmod: &str,
        conns: &[(&str, &str)],
    ) -> Self {
        let experiment_attr = experiment
            .map(|e| format!(" experiment=\"{e}\""))
            .unwrap_or_default();
        self.entries.push(format!(
            "<url><loc>{BASE}/SAMPLE/{perm_id}/M</loc><lastmod>{lastmod}</lastmod>\
             <x:xd kind=\"SAMPLE\" code=\"{code}\" type=\"WELL\" space=\"{space}\"{experiment_attr}>{}</x:xd></url>",
            conns_xml(conns)
        ));
        self
    }

    pub fn data_set(
        mut self,
        code: &str,
        ds_kind: &str,
        sample: Option<&str>,
        experiment: Option<&str>,
        lastmod: &str,
        conns: &[(&str, &str)],
    ) -> Self {
        let sample_attr = sample
            .map(|s| format!(" sample=\"{s}\""))
            .unwrap_or_default();
        let experiment_attr = experiment
            .map(|e| format!(" experiment=\"{e}\""))
            .unwrap_or_default();
        self.entries.push(format!(
            "<url><loc>{BASE}/DATA_SET/{code}/M</loc><lastmod>{lastmod}</lastmod>\
             <x:xd kind=\"DATA_SET\" code=\"{code}\" type=\"RAW_DATA\" dsKind=\"{ds_kind}\"\
             {sample_attr}{experiment_attr}>{}</x:xd></url>",
            conns_xml(conns)
        ));
        self
    }

    pub fn material(mut self, code: &str, type_code: &str, lastmod: &str) -> Self {
        self.entries.push(format!(
            "<url><loc>{BASE}/MATERIAL/{code}/M</loc><lastmod>{lastmod}</lastmod>\
             <x:xd kind=\"MATERIAL\" code=\"{code}\" type=\"{type_code}\"></x:xd></url>"
        ));
        self
    }

    pub fn build(self) -> String {
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
             <urlset xmlns=\"http://www.sitemaps.org/schemas/sitemap/0.9\" \
                     xmlns:rs=\"http://www.openarchives.org/rs/terms/\" \
                     xmlns:x=\"https://sis.id.ethz.ch/software/#openbis/xdterms/\">\n\
             <rs:md capability=\"resourcelist\" at=\"2024-01-10T10:00:00Z\"/>\n{}\n</urlset>",
            self.entries.join("\n")
        )
    }
}

/// Document source serving a fixed string, counting fetches.
pub struct StaticResourceList {
    xml: String,
    calls: Mutex<usize>,
}

impl StaticResourceList {
    pub fn new(xml: impl Into<String>) -> Arc<Self> {
        Arc::new(StaticResourceList {
            xml: xml.into(),
            calls: Mutex::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock()
    }
}

#[async_trait]
impl ResourceListSource for StaticResourceList {
    async fn fetch(&self, _spaces: &[String]) -> Result<String, HarvestError> {
        *self.calls.lock() += 1;
        Ok(self.xml.clone())
    }
}

/// All mutable state of the fake destination system, shared by every
/// collaborator trait the mock implements.
#[derive(Default)]
pub struct BackendState {
    pub spaces: BTreeSet<String>,
    pub projects: BTreeMap<String, StoredRecord>,
    pub experiments: BTreeMap<String, StoredRecord>,
    pub samples: BTreeMap<String, StoredRecord>,
    pub data_sets: BTreeMap<String, StoredRecord>,
    pub data_set_space: BTreeMap<String, String>,
    pub materials: BTreeMap<MaterialKey, StoredRecord>,
    pub committed_batches: Vec<ReconciliationBatch>,
    pub registered_physical: Vec<(String, PathBuf)>,
    pub remote_files: BTreeMap<String, Vec<(String, Vec<u8>)>>,
    pub deleted: Vec<String>,
    pub confirmed: Vec<usize>,
    pub notifications: Vec<String>,
    pub fail_commit: bool,
    pub fail_lookups: BTreeSet<String>,
    pub fail_downloads: BTreeSet<String>,
    pub fail_sample_deletion: bool,
    pub fail_material_deletion: bool,
    token_counter: usize,
}

pub fn stored(perm_id: &str, identifier: &str) -> StoredRecord {
    StoredRecord {
        perm_id: perm_id.to_string(),
        identifier: identifier.to_string(),
        version: 1,
        type_code: None,
        properties: Vec::new(),
    }
}

fn space_of(identifier: &str) -> Option<&str> {
    identifier.strip_prefix('/').map(|rest| {
        rest.split_once('/')
            .map(|(space, _)| space)
            .unwrap_or(rest)
    })
}

fn data_set_home(data_set: &NewDataSet) -> String {
    data_set
        .sample
        .as_deref()
        .or(data_set.experiment.as_deref())
        .and_then(space_of)
        .unwrap_or("DST")
        .to_string()
}

#[derive(Clone, Default)]
pub struct MockBackend(pub Arc<Mutex<BackendState>>);

impl MockBackend {
    pub fn with_spaces(spaces: &[&str]) -> Self {
        let backend = MockBackend::default();
        {
            let mut state = backend.0.lock();
            for space in spaces {
                state.spaces.insert(space.to_string());
            }
        }
        backend
    }

    pub fn state(&self) -> parking_lot::MutexGuard<'_, BackendState> {
        self.0.lock()
    }

    fn lookup(
        &self,
        map: impl Fn(&BackendState) -> Option<StoredRecord>,
        key: &str,
    ) -> Result<Option<StoredRecord>, ServiceError> {
        let state = self.0.lock();
        if state.fail_lookups.contains(key) {
            return Err(ServiceError(format!("lookup of '{key}' is wired to fail")));
        }
        Ok(map(&state))
    }
}

#[async_trait]
impl EntityStore for MockBackend {
    async fn space_exists(&self, code: &str) -> Result<bool, ServiceError> {
        Ok(self.0.lock().spaces.contains(code))
    }

    async fn project_by_perm_id(
        &self,
        perm_id: &str,
    ) -> Result<Option<StoredRecord>, ServiceError> {
        self.lookup(|s| s.projects.get(perm_id).cloned(), perm_id)
    }

    async fn experiment_by_perm_id(
        &self,
        perm_id: &str,
    ) -> Result<Option<StoredRecord>, ServiceError> {
        self.lookup(|s| s.experiments.get(perm_id).cloned(), perm_id)
    }

    async fn sample_by_perm_id(&self, perm_id: &str) -> Result<Option<StoredRecord>, ServiceError> {
        self.lookup(|s| s.samples.get(perm_id).cloned(), perm_id)
    }

    async fn data_set_by_code(&self, code: &str) -> Result<Option<StoredRecord>, ServiceError> {
        self.lookup(|s| s.data_sets.get(code).cloned(), code)
    }

    async fn material_by_key(
        &self,
        key: &MaterialKey,
    ) -> Result<Option<StoredRecord>, ServiceError> {
        self.lookup(|s| s.materials.get(key).cloned(), &key.code)
    }

    async fn perform_operations(
        &self,
        batch: &ReconciliationBatch,
    ) -> Result<OperationSummary, ServiceError> {
        let mut state = self.0.lock();
        if state.fail_commit {
            return Err(ServiceError("batch commit is wired to fail".to_string()));
        }
        for project in &batch.project_creations {
            state.projects.insert(
                project.perm_id.clone(),
                stored(&project.perm_id, &project.identifier),
            );
        }
        for update in &batch.project_updates {
            if let Some(record) = state.projects.get_mut(&update.perm_id) {
                record.version += 1;
            }
        }
        for experiment in &batch.experiment_creations {
            let mut record = stored(&experiment.perm_id, &experiment.identifier);
            record.properties = experiment.properties.clone();
            state.experiments.insert(experiment.perm_id.clone(), record);
        }
        for update in &batch.experiment_updates {
            if let Some(record) = state.experiments.get_mut(&update.perm_id) {
                record.version += 1;
                record.properties = update.properties.clone();
            }
        }
        for sample in &batch.sample_creations {
            let mut record = stored(&sample.perm_id, &sample.identifier);
            record.properties = sample.properties.clone();
            state.samples.insert(sample.perm_id.clone(), record);
        }
        for update in &batch.sample_updates {
            if let Some(record) = state.samples.get_mut(&update.perm_id) {
                record.version += 1;
                record.identifier = update.identifier.clone();
                record.properties = update.properties.clone();
            }
        }
        for material in &batch.material_creations {
            let key = MaterialKey::new(material.code.clone(), material.type_code.clone());
            let mut record = stored(&material.code, &material.code);
            record.properties = material.properties.clone();
            state.materials.insert(key, record);
        }
        for update in &batch.material_updates {
            if let Some(record) = state.materials.get_mut(&update.key) {
                record.version += 1;
                record.properties = update.properties.clone();
            }
        }
        for creation in &batch.data_set_creations {
            let data_set = &creation.data_set;
            state
                .data_sets
                .insert(data_set.code.clone(), stored(&data_set.code, &data_set.code));
            let home = data_set_home(data_set);
            state.data_set_space.insert(data_set.code.clone(), home);
        }
        for update in &batch.data_set_updates {
            if let Some(record) = state.data_sets.get_mut(&update.code) {
                record.version += 1;
                record.properties = update.properties.clone();
            }
        }
        let summary = OperationSummary {
            created: batch.creations(),
            updated: batch.updates(),
        };
        state.committed_batches.push(batch.clone());
        Ok(summary)
    }

    async fn register_physical(
        &self,
        data_set: &NewDataSet,
        staged: &Path,
    ) -> Result<(), ServiceError> {
        let mut state = self.0.lock();
        state
            .data_sets
            .insert(data_set.code.clone(), stored(&data_set.code, &data_set.code));
        let home = data_set_home(data_set);
        state.data_set_space.insert(data_set.code.clone(), home);
        state
            .registered_physical
            .push((data_set.code.clone(), staged.to_path_buf()));
        Ok(())
    }
}

#[async_trait]
impl AdminApi for MockBackend {
    async fn space_entities(&self, space: &str) -> Result<Vec<LocalEntity>, ServiceError> {
        let state = self.0.lock();
        let mut entities = Vec::new();
        let scoped = |records: &BTreeMap<String, StoredRecord>, kind: EntityKind| {
            records
                .values()
                .filter(|r| space_of(&r.identifier) == Some(space))
                .map(|r| LocalEntity {
                    kind,
                    perm_id: r.perm_id.clone(),
                    identifier: r.identifier.clone(),
                })
                .collect::<Vec<_>>()
        };
        entities.extend(scoped(&state.projects, EntityKind::Project));
        entities.extend(scoped(&state.experiments, EntityKind::Experiment));
        entities.extend(scoped(&state.samples, EntityKind::Sample));
        for (code, record) in &state.data_sets {
            if state.data_set_space.get(code).map(String::as_str) == Some(space) {
                entities.push(LocalEntity {
                    kind: EntityKind::DataSet,
                    perm_id: record.perm_id.clone(),
                    identifier: record.identifier.clone(),
                });
            }
        }
        Ok(entities)
    }

    async fn list_materials(&self) -> Result<Vec<MaterialKey>, ServiceError> {
        Ok(self.0.lock().materials.keys().cloned().collect())
    }

    async fn delete_data_sets(
        &self,
        codes: &[String],
        _reason: &str,
    ) -> Result<DeletionToken, ServiceError> {
        let mut state = self.0.lock();
        for code in codes {
            state.data_sets.remove(code);
            state.deleted.push(format!("DATA_SET:{code}"));
        }
        state.token_counter += 1;
        Ok(DeletionToken(format!("token-{}", state.token_counter)))
    }

    async fn delete_samples(
        &self,
        perm_ids: &[String],
        _reason: &str,
    ) -> Result<DeletionToken, ServiceError> {
        let mut state = self.0.lock();
        if state.fail_sample_deletion {
            return Err(ServiceError("sample deletion is wired to fail".to_string()));
        }
        for perm_id in perm_ids {
            state.samples.remove(perm_id);
            state.deleted.push(format!("SAMPLE:{perm_id}"));
        }
        state.token_counter += 1;
        Ok(DeletionToken(format!("token-{}", state.token_counter)))
    }

    async fn delete_experiments(
        &self,
        perm_ids: &[String],
        _reason: &str,
    ) -> Result<DeletionToken, ServiceError> {
        let mut state = self.0.lock();
        for perm_id in perm_ids {
            state.experiments.remove(perm_id);
            state.deleted.push(format!("EXPERIMENT:{perm_id}"));
        }
        state.token_counter += 1;
        Ok(DeletionToken(format!("token-{}", state.token_counter)))
    }

    async fn delete_projects(
        &self,
        perm_ids: &[String],
        _reason: &str,
    ) -> Result<(), ServiceError> {
        let mut state = self.0.lock();
        for perm_id in perm_ids {
            state.projects.remove(perm_id);
            state.deleted.push(format!("PROJECT:{perm_id}"));
        }
        Ok(())
    }

    async fn delete_materials(
        &self,
        keys: &[MaterialKey],
        _reason: &str,
    ) -> Result<(), ServiceError> {
        let mut state = self.0.lock();
        if state.fail_material_deletion {
            return Err(ServiceError(
                "material deletion is wired to fail".to_string(),
            ));
        }
        for key in keys {
            state.materials.remove(key);
            state.deleted.push(format!("MATERIAL:{key}"));
        }
        Ok(())
    }

    async fn confirm_deletions(&self, tokens: &[DeletionToken]) -> Result<(), ServiceError> {
        self.0.lock().confirmed.push(tokens.len());
        Ok(())
    }
}

#[async_trait]
impl FileTransferApi for MockBackend {
    async fn list_files(&self, data_set_code: &str) -> Result<Vec<RemoteFile>, ServiceError> {
        let state = self.0.lock();
        Ok(state
            .remote_files
            .get(data_set_code)
            .map(|files| {
                files
                    .iter()
                    .map(|(path, bytes)| RemoteFile {
                        path: path.clone(),
                        is_directory: false,
                        size: bytes.len() as u64,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn download(&self, data_set_code: &str, path: &str) -> Result<Vec<u8>, ServiceError> {
        let state = self.0.lock();
        if state.fail_downloads.contains(data_set_code) {
            return Err(ServiceError(format!(
                "download for '{data_set_code}' is wired to fail"
            )));
        }
        state
            .remote_files
            .get(data_set_code)
            .and_then(|files| files.iter().find(|(p, _)| p == path))
            .map(|(_, bytes)| bytes.clone())
            .ok_or_else(|| ServiceError(format!("no such file '{path}' in '{data_set_code}'")))
    }
}

#[async_trait]
impl Notifier for MockBackend {
    async fn sync_failed(&self, reason: &str, _log_file: Option<&Path>) {
        self.0.lock().notifications.push(reason.to_string());
    }
}

/// Configuration pointing at a temp directory, mapping DEFAULT -> DST
/// and CHEM -> DST_CHEM.
pub fn config_for(dir: &Path) -> SyncConfig {
    SyncConfig {
        resource_list_url: Url::parse(BASE).unwrap(),
        data_source_as_url: "https://remote.example:8443/openbis".to_string(),
        data_source_dss_url: "https://remote.example:8444/datastore_server".to_string(),
        auth_realm: "OAI-PMH".to_string(),
        auth_user: "harvester".to_string(),
        auth_pass: "secret".to_string(),
        data_source_spaces: vec!["DEFAULT".to_string(), "CHEM".to_string()],
        harvester_spaces: vec!["DST".to_string(), "DST_CHEM".to_string()],
        harvester_temp_dir: "harvester-tmp".to_string(),
        last_sync_file: dir.join("last-sync-timestamp-file.txt"),
        log_file: None,
        email_addresses: Vec::new(),
        dry_run: false,
        parallel: ParallelPrefs::default(),
        request_timeout: Duration::from_millis(2_000),
    }
}

pub fn engine_for(
    backend: &MockBackend,
    source: Arc<dyn ResourceListSource>,
    dir: &Path,
    dry_run: bool,
) -> SyncEngine {
    let mut config = config_for(dir);
    config.dry_run = dry_run;
    SyncEngine::new(
        config,
        dir.join("store"),
        source,
        Arc::new(backend.clone()),
        Arc::new(backend.clone()),
        Arc::new(backend.clone()),
        Arc::new(backend.clone()),
    )
    .expect("engine construction succeeds for a valid config")
}

pub async fn run_pull(
    backend: &MockBackend,
    xml: &str,
    dir: &Path,
) -> Result<SyncReport, HarvestError> {
    let source = StaticResourceList::new(xml);
    engine_for(backend, source, dir, false).run().await
}
