pub mod ask;
pub mod capture;
pub mod cleanup;
pub mod compare;
pub mod process;
pub mod records;
pub mod report;
pub mod run;
pub mod scan;
pub mod status;
pub mod usage;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use crate::snap::config::LookoutConfig;
use crate::snap::metrics::Metrics;
use crate::snap::paths::LookoutPaths;
use crate::snap::pipeline::{JobOutcome, Pipeline, PipelineParts};
use crate::snap::record_store::RecordStore;
use crate::snap::storage::{SCHEMA_VERSION, write_schema_version};

#[derive(Debug, Clone, Serialize)]
pub struct CommandReport {
    pub command: String,
    pub ok: bool,
    pub details: Vec<String>,
    pub issues: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl CommandReport {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ok: true,
            details: Vec::new(),
            issues: Vec::new(),
            data: None,
        }
    }

    pub fn detail(&mut self, text: impl Into<String>) {
        self.details.push(text.into());
    }

    pub fn issue(&mut self, text: impl Into<String>) {
        self.ok = false;
        self.issues.push(text.into());
    }

    pub fn attach<T: Serialize>(&mut self, data: &T) -> Result<()> {
        self.data = Some(serde_json::to_value(data)?);
        Ok(())
    }

    /// Fold a scheduled-job outcome into the report.
    pub fn job<T>(&mut self, outcome: &JobOutcome<T>, done: impl FnOnce(&mut Self, &T)) {
        match outcome {
            JobOutcome::Skipped(reason) => self.detail(format!("skipped: {reason}")),
            JobOutcome::Failed => self.issue("external call failed; nothing recorded"),
            JobOutcome::Done(value) => done(self, value),
        }
    }
}

/// Shared handles every command works against.
pub struct Runtime {
    pub cfg: LookoutConfig,
    pub paths: LookoutPaths,
    pub store: Arc<RecordStore>,
    pub metrics: Arc<Metrics>,
}

impl Runtime {
    pub fn open(cfg: LookoutConfig) -> Result<Self> {
        let paths = LookoutPaths::new(&cfg.data_dir);
        paths.ensure_dirs()?;
        write_schema_version(&cfg.data_dir, SCHEMA_VERSION)?;
        let store = RecordStore::open(&cfg.data_dir)
            .with_context(|| format!("failed to open record store in {}", cfg.data_dir.display()))?;
        Ok(Self {
            cfg,
            paths,
            store: Arc::new(store),
            metrics: Arc::new(Metrics::new()),
        })
    }

    /// Pipeline backed by the configured providers; fails without API keys.
    pub fn pipeline(&self) -> Result<Arc<Pipeline>> {
        let parts = PipelineParts::from_config(&self.cfg)?;
        Ok(Arc::new(Pipeline::new(
            self.cfg.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.metrics),
            parts,
        )))
    }
}
