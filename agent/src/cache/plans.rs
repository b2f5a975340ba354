//! Plan registry

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use tracing::{info, warn};

use crate::deploy::plan::{DeploymentPlan, PlanSpec};
use crate::errors::DeployError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::utils::sha256_hash;

/// Plan registry entry
#[derive(Debug, Clone)]
pub struct PlanEntry {
    pub plan: Arc<DeploymentPlan>,
    pub digest: String,
    pub source: Option<PathBuf>,
}

/// Result of scanning a plans directory
#[derive(Debug, Default)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    pub unchanged: usize,
    pub rejected: Vec<(PathBuf, String)>,
}

/// Validated plans, keyed by plan name
#[derive(Default)]
pub struct PlanRegistry {
    entries: RwLock<HashMap<String, PlanEntry>>,
}

impl PlanRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a plan by name
    pub fn get(&self, name: &str) -> Option<Arc<DeploymentPlan>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(name).map(|e| e.plan.clone())
    }

    /// Insert or replace a plan
    pub fn insert(&self, plan: DeploymentPlan) {
        self.insert_entry(plan, String::new(), None);
    }

    fn insert_entry(&self, plan: DeploymentPlan, digest: String, source: Option<PathBuf>) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            plan.name().to_string(),
            PlanEntry {
                plan: Arc::new(plan),
                digest,
                source,
            },
        );
    }

    fn digest_of(&self, name: &str) -> Option<String> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(name).map(|e| e.digest.clone())
    }

    /// Names of all registered plans, sorted
    pub fn names(&self) -> Vec<String> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = entries.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Load every `*.json` plan in `dir`
    ///
    /// A file that fails to parse or validate is reported and leaves any
    /// previously loaded version of that plan in place.
    pub async fn load_dir(&self, dir: &Dir) -> Result<LoadReport, DeployError> {
        let mut report = LoadReport::default();
        if !dir.exists().await {
            return Ok(report);
        }

        for path in dir.list_files_with_ext("json").await? {
            let file = File::new(&path);
            let contents = match file.read_string().await {
                Ok(contents) => contents,
                Err(e) => {
                    report.rejected.push((path, e.to_string()));
                    continue;
                }
            };
            let digest = sha256_hash(contents.as_bytes());

            match parse_plan(&contents) {
                Ok(plan) => {
                    let name = plan.name().to_string();
                    if self.digest_of(&name).as_deref() == Some(digest.as_str()) {
                        report.unchanged += 1;
                        continue;
                    }
                    info!("Loaded plan {} from {}", name, path.display());
                    self.insert_entry(plan, digest, Some(path));
                    report.loaded.push(name);
                }
                Err(e) => {
                    warn!("Rejected plan file {}: {}", path.display(), e);
                    report.rejected.push((path, e.to_string()));
                }
            }
        }

        Ok(report)
    }
}

/// Parse and validate a plan definition document
pub fn parse_plan(contents: &str) -> Result<DeploymentPlan, DeployError> {
    let spec: PlanSpec = serde_json::from_str(contents)
        .map_err(|e| DeployError::PlanError(format!("Invalid plan definition: {}", e)))?;
    DeploymentPlan::from_spec(spec)
}

/// Read and validate a single plan file
pub async fn load_plan_file(file: &File) -> Result<DeploymentPlan, DeployError> {
    let contents = file.read_string().await?;
    parse_plan(&contents)
}
