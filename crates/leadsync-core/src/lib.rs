//! Core run-state model and record types for leadsync.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "leadsync-core";

/// One schemaless result item produced by a scrape job.
pub type RawRecord = serde_json::Map<String, JsonValue>;

/// One fixed-schema row ready to append to the leads tab.
pub type DestinationRow = Vec<String>;

/// Set of unique ids already present in (or pushed to) the leads tab.
///
/// Serialized as an ordered list; ids are only ever added.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DedupSet {
    ids: BTreeSet<String>,
}

impl DedupSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Self::new();
        for id in ids {
            set.insert(id.as_ref());
        }
        set
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id.trim())
    }

    /// Adds a non-empty id. Returns `true` when the id was not yet present.
    pub fn insert(&mut self, id: &str) -> bool {
        let id = id.trim();
        if id.is_empty() {
            return false;
        }
        self.ids.insert(id.to_string())
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.ids.iter().map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowStatus {
    Skipped,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerRowEntry {
    pub row: u32,
    pub status: RowStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leads: Option<usize>,
}

impl PerRowEntry {
    pub fn skipped(row: u32, message: impl Into<String>) -> Self {
        Self {
            row,
            status: RowStatus::Skipped,
            message: Some(message.into()),
            dataset_url: None,
            leads: None,
        }
    }

    pub fn succeeded(row: u32, leads: usize, dataset_url: Option<String>) -> Self {
        Self {
            row,
            status: RowStatus::Succeeded,
            message: None,
            dataset_url,
            leads: Some(leads),
        }
    }

    pub fn failed(row: u32, message: impl Into<String>) -> Self {
        Self {
            row,
            status: RowStatus::Failed,
            message: Some(message.into()),
            dataset_url: None,
            leads: None,
        }
    }
}

/// 1-based settings-tab column indices resolved once at run start. `0` means unavailable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SettingsColumns {
    pub launch_key_col: u32,
    pub max_limit_col: u32,
    pub credential_col: u32,
    pub status_col: u32,
    pub comments_col: u32,
    pub dataset_col: u32,
    pub scraped_col: u32,
    pub pushed_col: u32,
    pub scrape_status_col: u32,
    pub push_status_col: u32,
}

/// Reads the cell at a 1-based column from a fetched row, trimmed.
pub fn cell_at(row: &[String], col: u32) -> &str {
    if col == 0 {
        return "";
    }
    row.get(col as usize - 1).map(|s| s.trim()).unwrap_or_default()
}

/// Header comparison key: trimmed, lowercased, inner whitespace collapsed.
pub fn normalize_header(header: &str) -> String {
    header
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Case/whitespace-insensitive header lookup built once per header row.
#[derive(Debug, Clone, Default)]
pub struct HeaderIndex {
    by_key: HashMap<String, usize>,
}

impl HeaderIndex {
    pub fn new<S: AsRef<str>>(headers: &[S]) -> Self {
        let mut by_key = HashMap::with_capacity(headers.len());
        for (idx, header) in headers.iter().enumerate() {
            let key = normalize_header(header.as_ref());
            if !key.is_empty() {
                by_key.entry(key).or_insert(idx);
            }
        }
        Self { by_key }
    }

    /// 0-based position of the first header matching `name`.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.by_key.get(&normalize_header(name)).copied()
    }

    /// 1-based column of `name`, or `0` when absent.
    pub fn column(&self, name: &str) -> u32 {
        self.position(name).map(|idx| idx as u32 + 1).unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunProgress {
    pub run_id: Uuid,
    pub spreadsheet_id: String,
    pub settings_sheet_name: String,
    pub leads_sheet_name: String,
    pub start_row: u32,
    pub end_row: u32,
    pub row_numbers: Vec<u32>,
    pub current_index: usize,
    pub processed: usize,
    pub skipped: usize,
    pub total_leads: usize,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RunOutcome>,
    #[serde(default)]
    pub per_row: Vec<PerRowEntry>,
    #[serde(default)]
    pub headers_after_ensure: Vec<String>,
    #[serde(default)]
    pub leads_headers: Vec<String>,
    #[serde(default)]
    pub existing_unique_ids: DedupSet,
    #[serde(default)]
    pub columns: SettingsColumns,
}

impl RunProgress {
    pub fn new(
        spreadsheet_id: impl Into<String>,
        settings_sheet_name: impl Into<String>,
        leads_sheet_name: impl Into<String>,
        start_row: u32,
        end_row: u32,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            spreadsheet_id: spreadsheet_id.into(),
            settings_sheet_name: settings_sheet_name.into(),
            leads_sheet_name: leads_sheet_name.into(),
            start_row,
            end_row,
            row_numbers: (start_row..=end_row).collect(),
            current_index: 0,
            processed: 0,
            skipped: 0,
            total_leads: 0,
            started_at,
            finished_at: None,
            outcome: None,
            per_row: Vec::new(),
            headers_after_ensure: Vec::new(),
            leads_headers: Vec::new(),
            existing_unique_ids: DedupSet::new(),
            columns: SettingsColumns::default(),
        }
    }

    pub fn total_rows(&self) -> usize {
        self.row_numbers.len()
    }

    pub fn is_complete(&self) -> bool {
        self.current_index >= self.row_numbers.len()
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    pub fn current_row(&self) -> Option<u32> {
        self.row_numbers.get(self.current_index).copied()
    }

    /// Appends the outcome of the current row and advances the cursor past it.
    pub fn record(&mut self, entry: PerRowEntry) {
        match entry.status {
            RowStatus::Skipped => self.skipped += 1,
            RowStatus::Succeeded | RowStatus::Failed => self.processed += 1,
        }
        self.total_leads += entry.leads.unwrap_or(0);
        self.per_row.push(entry);
        self.current_index = (self.current_index + 1).min(self.row_numbers.len());
    }

    pub fn finish(&mut self, outcome: RunOutcome, at: DateTime<Utc>) {
        if self.finished_at.is_none() {
            self.finished_at = Some(at);
            self.outcome = Some(outcome);
        }
    }

    pub fn snapshot(&self, active_job_id: Option<&str>) -> ProgressSnapshot {
        ProgressSnapshot {
            run_id: self.run_id,
            done: self.is_finished(),
            outcome: self.outcome,
            spreadsheet_id: self.spreadsheet_id.clone(),
            settings_sheet_name: self.settings_sheet_name.clone(),
            leads_sheet_name: self.leads_sheet_name.clone(),
            start_row: self.start_row,
            end_row: self.end_row,
            current_index: self.current_index,
            total_rows: self.total_rows(),
            processed: self.processed,
            skipped: self.skipped,
            total_leads: self.total_leads,
            started_at: self.started_at,
            finished_at: self.finished_at,
            active_job_id: active_job_id.map(ToString::to_string),
            per_row: self.per_row.clone(),
        }
    }
}

/// Process-wide orchestrator state, persisted between step invocations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunState {
    pub cancel_requested: bool,
    pub active_job_id: Option<String>,
    pub active_credential_token: Option<String>,
    pub current_run: Option<RunProgress>,
}

impl RunState {
    pub fn for_new_run(run: RunProgress) -> Self {
        Self {
            cancel_requested: false,
            active_job_id: None,
            active_credential_token: None,
            current_run: Some(run),
        }
    }

    pub fn clear_active_job(&mut self) {
        self.active_job_id = None;
        self.active_credential_token = None;
    }

    pub fn has_unfinished_run(&self) -> bool {
        self.current_run
            .as_ref()
            .map(|run| !run.is_finished())
            .unwrap_or(false)
    }

    pub fn snapshot(&self) -> Option<ProgressSnapshot> {
        self.current_run
            .as_ref()
            .map(|run| run.snapshot(self.active_job_id.as_deref()))
    }
}

/// Progress view returned by every run entry point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub run_id: Uuid,
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RunOutcome>,
    pub spreadsheet_id: String,
    pub settings_sheet_name: String,
    pub leads_sheet_name: String,
    pub start_row: u32,
    pub end_row: u32,
    pub current_index: usize,
    pub total_rows: usize,
    pub processed: usize,
    pub skipped: usize,
    pub total_leads: usize,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_job_id: Option<String>,
    pub per_row: Vec<PerRowEntry>,
}

/// Opaque spreadsheet credential forwarded by the caller.
///
/// Either a bare access-token string or an OAuth token object carrying `access_token`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthToken(pub JsonValue);

impl AuthToken {
    pub fn from_access_token(token: impl Into<String>) -> Self {
        Self(serde_json::json!({ "access_token": token.into() }))
    }

    pub fn access_token(&self) -> Option<&str> {
        let raw = match &self.0 {
            JsonValue::String(s) => s.as_str(),
            JsonValue::Object(map) => map.get("access_token")?.as_str()?,
            _ => return None,
        };
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed)
        }
    }
}
