//! Runner that writes job bundles to disk instead of executing them

use super::{JobRunner, JobSpec, JobStatus};
use crate::error::{FleetError, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tracing::info;

/// Writes each submitted bundle to `<dir>/<execution>.json` and reports it
/// as succeeded
pub struct DryRunRunner {
    dir: PathBuf,
    jobs: Arc<RwLock<HashMap<String, JobStatus>>>,
}

impl DryRunRunner {
    pub fn new(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            jobs: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    fn bundle_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", name))
    }
}

impl JobRunner for DryRunRunner {
    fn submit(&self, spec: &JobSpec) -> Result<JobStatus> {
        let mut jobs = self
            .jobs
            .write()
            .map_err(|_| FleetError::Lock("Failed to acquire write lock".to_string()))?;

        let path = self.bundle_path(&spec.name);
        std::fs::write(&path, serde_json::to_string_pretty(spec)?)?;
        info!("Wrote job bundle {} to {}", spec.name, path.display());

        let attempts = jobs.get(&spec.name).map(|s| s.attempts).unwrap_or(0) + 1;
        let status = JobStatus::succeeded(attempts);
        jobs.insert(spec.name.clone(), status.clone());
        Ok(status)
    }

    fn status(&self, name: &str) -> Result<Option<JobStatus>> {
        let jobs = self
            .jobs
            .read()
            .map_err(|_| FleetError::Lock("Failed to acquire read lock".to_string()))?;
        if let Some(status) = jobs.get(name) {
            return Ok(Some(status.clone()));
        }
        // Bundles written by an earlier invocation count as finished runs.
        if self.bundle_path(name).exists() {
            return Ok(Some(JobStatus::succeeded(1)));
        }
        Ok(None)
    }

    fn delete(&self, name: &str) -> Result<()> {
        let mut jobs = self
            .jobs
            .write()
            .map_err(|_| FleetError::Lock("Failed to acquire write lock".to_string()))?;
        jobs.remove(name);
        let path = self.bundle_path(name);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }
}
