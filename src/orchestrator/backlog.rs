//! JSON backlog file
//!
//! The backlog is a single JSON object keyed by work item id. Every terminal
//! run rewrites its item's entry with the final status and the run outcome.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

use super::traits::BacklogSink;
use super::types::RunResult;
use crate::hub::NewWorkItem;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacklogEntry {
    pub epic_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    pub status: String,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<RunResult>,
}

pub type Backlog = BTreeMap<String, BacklogEntry>;

pub struct JsonBacklogSink {
    path: PathBuf,
    // Serializes read-modify-write cycles
    lock: Mutex<()>,
}

impl JsonBacklogSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Current backlog contents; a missing file is an empty backlog
    pub async fn load(&self) -> Result<Backlog> {
        match fs::read_to_string(&self.path).await {
            Ok(contents) if contents.trim().is_empty() => Ok(Backlog::new()),
            Ok(contents) => serde_json::from_str(&contents)
                .with_context(|| format!("Malformed backlog file {}", self.path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Backlog::new()),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", self.path.display())),
        }
    }

    async fn store(&self, backlog: &Backlog) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let serialized = serde_json::to_string_pretty(backlog)?;
        let temp_file = self.path.with_extension("json.tmp");
        fs::write(&temp_file, serialized).await?;
        fs::rename(&temp_file, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl BacklogSink for JsonBacklogSink {
    async fn set_status(&self, item: &NewWorkItem, status: &str, result: &RunResult) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut backlog = self.load().await?;
        backlog.insert(
            item.id.clone(),
            BacklogEntry {
                epic_id: item.epic_id.clone(),
                project: item.project.clone(),
                status: status.to_string(),
                updated_at: Utc::now(),
                last_run: Some(result.clone()),
            },
        );
        self.store(&backlog).await?;
        debug!(item_id = %item.id, status = %status, path = %self.path.display(), "Backlog updated");
        Ok(())
    }
}
