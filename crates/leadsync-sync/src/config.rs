use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use leadsync_adapters::apify::{DEFAULT_ACTOR_ID, DEFAULT_BASE_URL};
use leadsync_adapters::{ApifyJobProvider, SheetsConnector};
use leadsync_storage::FileRunStateStore;
use serde::{Deserialize, Serialize};

use crate::orchestrator::{OrchestratorOptions, RunOrchestrator};

pub const DEFAULT_SHEETS_BASE_URL: &str = "https://sheets.googleapis.com/v4/spreadsheets";
pub const DEFAULT_AUTH_URL: &str = "http://localhost:8000/api/auth/google";

/// Settings-tab header names the orchestrator reads from and writes back to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnHeaders {
    pub launch_key: String,
    pub max_limit: String,
    pub credential: String,
    pub dataset_url: String,
    pub scraped: String,
    pub pushed: String,
    pub status: String,
    pub comments: String,
    pub scrape_status: String,
    pub push_status: String,
}

impl Default for ColumnHeaders {
    fn default() -> Self {
        Self {
            launch_key: "Search Term".into(),
            max_limit: "Max Limit".into(),
            credential: "Apify Token".into(),
            dataset_url: "Dataset URL".into(),
            scraped: "Scraped".into(),
            pushed: "Pushed".into(),
            status: "Status".into(),
            comments: "Comments".into(),
            scrape_status: "Scrape Status".into(),
            push_status: "Google-Maps Push Status".into(),
        }
    }
}

impl ColumnHeaders {
    /// Reads header overrides from YAML; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", path.display()));
            }
        };
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Columns created on the settings tab at run start so writeback has somewhere to land.
    pub fn writeback(&self) -> [&str; 7] {
        [
            self.status.as_str(),
            self.comments.as_str(),
            self.dataset_url.as_str(),
            self.scraped.as_str(),
            self.pushed.as_str(),
            self.scrape_status.as_str(),
            self.push_status.as_str(),
        ]
    }
}

#[derive(Debug, Clone)]
pub struct LeadsyncConfig {
    pub state_path: PathBuf,
    pub sheets_base_url: String,
    pub auth_url: String,
    pub apify_base_url: String,
    pub apify_actor_id: String,
    pub apify_token: Option<String>,
    pub poll_interval: Duration,
    pub web_port: u16,
    pub seed_page_size: u32,
    pub columns_file: PathBuf,
}

fn truthy(value: &str) -> bool {
    matches!(value, "1" | "true" | "TRUE" | "True")
}

impl LeadsyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let ephemeral = var("LEADSYNC_EPHEMERAL_FS")
            .map(|v| truthy(&v))
            .unwrap_or(false);
        let default_state = if ephemeral {
            "/tmp/.run-state.json"
        } else {
            "./.run-state.json"
        };
        Self {
            state_path: var("LEADSYNC_STATE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(default_state)),
            sheets_base_url: var("LEADSYNC_SHEETS_BASE_URL")
                .unwrap_or_else(|| DEFAULT_SHEETS_BASE_URL.to_string()),
            auth_url: var("LEADSYNC_AUTH_URL").unwrap_or_else(|| DEFAULT_AUTH_URL.to_string()),
            apify_base_url: var("APIFY_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            apify_actor_id: var("APIFY_ACTOR_ID").unwrap_or_else(|| DEFAULT_ACTOR_ID.to_string()),
            apify_token: var("APIFY_TOKEN").filter(|t| !t.trim().is_empty()),
            poll_interval: Duration::from_millis(
                var("LEADSYNC_POLL_INTERVAL_MS")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(1500),
            ),
            web_port: var("LEADSYNC_WEB_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
            seed_page_size: var("LEADSYNC_SEED_PAGE_SIZE")
                .and_then(|v| v.parse().ok())
                .unwrap_or(10_000),
            columns_file: var("LEADSYNC_COLUMNS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("leadsync.yaml")),
        }
    }

    pub fn column_headers(&self) -> Result<ColumnHeaders> {
        ColumnHeaders::load(&self.columns_file)
    }

    /// Wires the file-backed store, Google Sheets and Apify into an orchestrator.
    pub fn orchestrator(&self) -> Result<RunOrchestrator> {
        let options = OrchestratorOptions {
            columns: self.column_headers()?,
            seed_page_size: self.seed_page_size,
        };
        Ok(RunOrchestrator::new(
            Arc::new(FileRunStateStore::new(self.state_path.clone())),
            Arc::new(SheetsConnector::new(
                self.sheets_base_url.clone(),
                self.auth_url.clone(),
            )),
            Arc::new(ApifyJobProvider::new(
                self.apify_base_url.clone(),
                self.apify_actor_id.clone(),
                self.apify_token.clone(),
            )),
            options,
        ))
    }
}
