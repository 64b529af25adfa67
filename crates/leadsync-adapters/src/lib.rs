//! Collaborator contracts (spreadsheet + scrape job provider) and their clients.

use std::sync::Arc;

use async_trait::async_trait;
use leadsync_core::{AuthToken, DestinationRow, RawRecord};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod apify;
pub mod memory;
pub mod sheets;

pub use apify::ApifyJobProvider;
pub use memory::{MemoryConnector, MemoryWorkbook, ScriptedJob, ScriptedJobProvider};
pub use sheets::{column_letters, SheetsClient, SheetsConnector};

pub const CRATE_NAME: &str = "leadsync-adapters";

#[derive(Debug, Error)]
pub enum TableError {
    #[error("spreadsheet access is not authorized")]
    Unauthorized,
    #[error("tab '{0}' is not accessible")]
    TabUnavailable(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("table API error (status {status}): {message}")]
    Api { status: u16, message: String },
    #[error("parse error: {0}")]
    Parse(String),
}

impl From<reqwest::Error> for TableError {
    fn from(err: reqwest::Error) -> Self {
        TableError::Network(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("no provider credential available for job")]
    MissingCredential,
    #[error("unknown job {0}")]
    UnknownJob(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("job API error (status {status}): {message}")]
    Api { status: u16, message: String },
    #[error("parse error: {0}")]
    Parse(String),
    #[error("{0}")]
    Rejected(String),
}

impl From<reqwest::Error> for JobError {
    fn from(err: reqwest::Error) -> Self {
        JobError::Network(err.to_string())
    }
}

impl From<serde_json::Error> for JobError {
    fn from(err: serde_json::Error) -> Self {
        JobError::Parse(err.to_string())
    }
}

/// Spreadsheet primitives the orchestrator needs. Rows and columns are 1-based.
#[async_trait]
pub trait TableService: Send + Sync {
    async fn get_row(
        &self,
        spreadsheet_id: &str,
        tab: &str,
        row: u32,
    ) -> Result<Vec<String>, TableError>;

    async fn get_rows(
        &self,
        spreadsheet_id: &str,
        tab: &str,
        start_row: u32,
        count: u32,
    ) -> Result<Vec<Vec<String>>, TableError>;

    async fn append_rows(
        &self,
        spreadsheet_id: &str,
        tab: &str,
        rows: &[DestinationRow],
    ) -> Result<(), TableError>;

    /// Returns the header's column, creating it when absent; `0` when the tab is inaccessible.
    async fn ensure_header(
        &self,
        spreadsheet_id: &str,
        tab: &str,
        header: &str,
    ) -> Result<u32, TableError>;

    async fn set_cell(
        &self,
        spreadsheet_id: &str,
        tab: &str,
        row: u32,
        col: u32,
        value: &str,
    ) -> Result<(), TableError>;
}

/// Turns a caller credential into an authorized table session.
pub trait TableConnector: Send + Sync {
    /// `None` means the credential is missing or unusable.
    fn connect(&self, token: &AuthToken) -> Option<Arc<dyn TableService>>;

    /// Where the caller can go to (re-)authorize spreadsheet access.
    fn authorization_url(&self) -> String;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobParams {
    pub limit: Option<u32>,
    pub credential: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Succeeded { dataset_url: Option<String> },
    Failed { reason: String },
}

#[async_trait]
pub trait JobProvider: Send + Sync {
    async fn start_job(&self, launch_key: &str, params: &JobParams) -> Result<String, JobError>;

    async fn job_status(&self, job_id: &str, credential: Option<&str>)
        -> Result<JobStatus, JobError>;

    async fn result_records(
        &self,
        job_id: &str,
        credential: Option<&str>,
    ) -> Result<Vec<RawRecord>, JobError>;

    /// Best-effort; callers log failures rather than propagate them.
    async fn abort_job(&self, job_id: &str, credential: Option<&str>) -> Result<(), JobError>;
}
