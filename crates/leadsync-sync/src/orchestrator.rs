//! Resumable run orchestration.
//!
//! Every entry point loads [`RunState`] from the store, does one bounded unit of
//! work and saves it back. Nothing survives in memory between calls, so a step
//! may run in a fresh process. Overlapping callers are last-writer-wins.

use std::sync::Arc;

use chrono::{Local, Utc};
use leadsync_adapters::{
    JobError, JobParams, JobProvider, JobStatus, TableConnector, TableError, TableService,
};
use leadsync_core::{
    cell_at, AuthToken, DedupSet, HeaderIndex, PerRowEntry, ProgressSnapshot, RunOutcome,
    RunProgress, RunState, SettingsColumns,
};
use leadsync_storage::{RunStateStore, StorageError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::ColumnHeaders;
use crate::dedup::seed_unique_ids;
use crate::mapper::map_records;
use crate::normalize::first_seen_label;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("spreadsheet access is not authorized")]
    NotAuthorized { auth_url: String },
    #[error("invalid row range {start_row}..={end_row}: {reason}")]
    InvalidRange {
        start_row: u32,
        end_row: u32,
        reason: &'static str,
    },
    #[error("no active run")]
    NoActiveRun,
    #[error("run {run_id} is still in progress; start with supersede to replace it")]
    RunInProgress { run_id: Uuid },
    #[error("leads tab '{tab}' has no header row")]
    MissingLeadsHeaders { tab: String },
    #[error("job provider error: {0}")]
    JobProvider(#[from] JobError),
    #[error("table service error: {0}")]
    TableService(#[from] TableError),
    #[error("run state could not be saved: {0}")]
    Storage(#[from] StorageError),
}

impl RunError {
    pub fn kind(&self) -> &'static str {
        match self {
            RunError::NotAuthorized { .. } => "not_authorized",
            RunError::InvalidRange { .. } => "invalid_range",
            RunError::NoActiveRun => "no_active_run",
            RunError::RunInProgress { .. } => "run_in_progress",
            RunError::MissingLeadsHeaders { .. } | RunError::TableService(_) => {
                "table_service_error"
            }
            RunError::JobProvider(_) => "job_provider_error",
            RunError::Storage(_) => "storage_error",
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            kind: self.kind().to_string(),
            message: self.to_string(),
            auth_url: match self {
                RunError::NotAuthorized { auth_url } => Some(auth_url.clone()),
                _ => None,
            },
        }
    }
}

/// Structured error returned by every entry point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRunRequest {
    pub spreadsheet_id: String,
    pub settings_sheet_name: String,
    pub leads_sheet_name: String,
    pub start_row: u32,
    pub end_row: u32,
    /// Replace an unfinished run instead of rejecting the start.
    #[serde(default)]
    pub supersede: bool,
}

/// Largest number of settings rows one run may cover.
pub const MAX_RUN_ROWS: u32 = 5_000;

impl StartRunRequest {
    fn validate(&self) -> Result<(), RunError> {
        let reason = if self.start_row < 2 {
            "startRow must be at least 2; row 1 holds headers"
        } else if self.end_row < self.start_row {
            "endRow must not be before startRow"
        } else if self.end_row - self.start_row >= MAX_RUN_ROWS {
            "range covers more rows than one run allows"
        } else {
            return Ok(());
        };
        Err(RunError::InvalidRange {
            start_row: self.start_row,
            end_row: self.end_row,
            reason,
        })
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub columns: ColumnHeaders,
    pub seed_page_size: u32,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            columns: ColumnHeaders::default(),
            seed_page_size: 10_000,
        }
    }
}

/// Scrape target read from one settings row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsRow {
    pub launch_key: String,
    pub limit: Option<u32>,
    pub credential: Option<String>,
    pub pushed: bool,
}

impl SettingsRow {
    pub fn from_cells(cells: &[String], columns: &SettingsColumns) -> Self {
        let credential = cell_at(cells, columns.credential_col);
        Self {
            launch_key: cell_at(cells, columns.launch_key_col).to_string(),
            limit: cell_at(cells, columns.max_limit_col)
                .replace(',', "")
                .parse::<u32>()
                .ok()
                .filter(|limit| *limit > 0),
            credential: (!credential.is_empty()).then(|| credential.to_string()),
            pushed: cell_at(cells, columns.pushed_col).eq_ignore_ascii_case("y"),
        }
    }
}

enum RowStep {
    Waiting,
    Launched {
        job_id: String,
        credential: Option<String>,
    },
    Done {
        entry: PerRowEntry,
        seen: Option<DedupSet>,
    },
}

impl RowStep {
    fn done(entry: PerRowEntry) -> Self {
        RowStep::Done { entry, seen: None }
    }
}

fn snapshot_of(state: &RunState) -> Result<ProgressSnapshot, RunError> {
    state.snapshot().ok_or(RunError::NoActiveRun)
}

pub struct RunOrchestrator {
    store: Arc<dyn RunStateStore>,
    connector: Arc<dyn TableConnector>,
    jobs: Arc<dyn JobProvider>,
    options: OrchestratorOptions,
}

impl RunOrchestrator {
    pub fn new(
        store: Arc<dyn RunStateStore>,
        connector: Arc<dyn TableConnector>,
        jobs: Arc<dyn JobProvider>,
        options: OrchestratorOptions,
    ) -> Self {
        Self {
            store,
            connector,
            jobs,
            options,
        }
    }

    fn not_authorized(&self) -> RunError {
        RunError::NotAuthorized {
            auth_url: self.connector.authorization_url(),
        }
    }

    fn table_error(&self, err: TableError) -> RunError {
        match err {
            TableError::Unauthorized => self.not_authorized(),
            other => RunError::TableService(other),
        }
    }

    fn connect(&self, token: Option<&AuthToken>) -> Result<Arc<dyn TableService>, RunError> {
        token
            .and_then(|token| self.connector.connect(token))
            .ok_or_else(|| self.not_authorized())
    }

    pub async fn start_run(
        &self,
        request: &StartRunRequest,
        token: Option<&AuthToken>,
    ) -> Result<ProgressSnapshot, RunError> {
        request.validate()?;
        let table = self.connect(token)?;

        let previous = self.store.load().await.unwrap_or_default();
        if let Some(prior) = previous.current_run.as_ref().filter(|run| !run.is_finished()) {
            if !request.supersede {
                return Err(RunError::RunInProgress {
                    run_id: prior.run_id,
                });
            }
            warn!(run_id = %prior.run_id, "superseding unfinished run");
        }

        let spreadsheet_id = request.spreadsheet_id.trim();
        let settings_tab = request.settings_sheet_name.trim();
        let leads_tab = request.leads_sheet_name.trim();

        let leads_headers = table
            .get_row(spreadsheet_id, leads_tab, 1)
            .await
            .map_err(|e| self.table_error(e))?;
        if leads_headers.iter().all(|h| h.trim().is_empty()) {
            return Err(RunError::MissingLeadsHeaders {
                tab: leads_tab.to_string(),
            });
        }
        let (columns, headers_after_ensure) = self
            .resolve_columns(table.as_ref(), spreadsheet_id, settings_tab)
            .await?;
        let seed = seed_unique_ids(
            table.as_ref(),
            spreadsheet_id,
            leads_tab,
            &leads_headers,
            self.options.seed_page_size,
        )
        .await
        .map_err(|e| self.table_error(e))?;

        let mut run = RunProgress::new(
            spreadsheet_id,
            settings_tab,
            leads_tab,
            request.start_row,
            request.end_row,
            Utc::now(),
        );
        run.columns = columns;
        run.headers_after_ensure = headers_after_ensure;
        run.leads_headers = leads_headers;
        run.existing_unique_ids = seed;

        let state = RunState::for_new_run(run);
        self.store.save(&state).await?;
        info!(
            run_id = ?state.current_run.as_ref().map(|r| r.run_id),
            start_row = request.start_row,
            end_row = request.end_row,
            "run started"
        );

        if previous.has_unfinished_run() {
            if let Some(job_id) = previous.active_job_id.as_deref() {
                self.abort_best_effort(job_id, previous.active_credential_token.as_deref())
                    .await;
            }
        }
        snapshot_of(&state)
    }

    async fn resolve_columns(
        &self,
        table: &dyn TableService,
        spreadsheet_id: &str,
        settings_tab: &str,
    ) -> Result<(SettingsColumns, Vec<String>), RunError> {
        let names = &self.options.columns;
        let mut ensured = [0u32; 7];
        for (slot, header) in ensured.iter_mut().zip(names.writeback()) {
            *slot = table
                .ensure_header(spreadsheet_id, settings_tab, header)
                .await
                .map_err(|e| self.table_error(e))?;
        }
        let [status_col, comments_col, dataset_col, scraped_col, pushed_col, scrape_status_col, push_status_col] =
            ensured;

        let headers = match table.get_row(spreadsheet_id, settings_tab, 1).await {
            Ok(headers) => headers,
            Err(TableError::TabUnavailable(tab)) => {
                warn!(tab = %tab, "settings tab unavailable; row targets cannot be read");
                Vec::new()
            }
            Err(err) => return Err(self.table_error(err)),
        };
        let index = HeaderIndex::new(&headers);
        let columns = SettingsColumns {
            launch_key_col: index.column(&names.launch_key),
            max_limit_col: index.column(&names.max_limit),
            credential_col: index.column(&names.credential),
            status_col,
            comments_col,
            dataset_col,
            scraped_col,
            pushed_col,
            scrape_status_col,
            push_status_col,
        };
        Ok((columns, headers))
    }

    /// Advances the run by at most one row. A row whose job is still running is revisited next call.
    pub async fn step_run(
        &self,
        run_id: Uuid,
        token: Option<&AuthToken>,
    ) -> Result<ProgressSnapshot, RunError> {
        let span = info_span!("run_step", run_id = %run_id);
        self.step_inner(run_id, token).instrument(span).await
    }

    async fn step_inner(
        &self,
        run_id: Uuid,
        token: Option<&AuthToken>,
    ) -> Result<ProgressSnapshot, RunError> {
        let mut state = self.store.load().await.ok_or(RunError::NoActiveRun)?;
        let run = match state.current_run.as_ref() {
            Some(run) if run.run_id == run_id => run,
            _ => return Err(RunError::NoActiveRun),
        };
        if run.is_finished() {
            return snapshot_of(&state);
        }

        if state.cancel_requested {
            state.clear_active_job();
            if let Some(run) = state.current_run.as_mut() {
                run.finish(RunOutcome::Cancelled, Utc::now());
                info!(current_index = run.current_index, "run cancelled");
            }
            self.store.save(&state).await?;
            return snapshot_of(&state);
        }

        let Some(row) = run.current_row() else {
            if let Some(run) = state.current_run.as_mut() {
                run.finish(RunOutcome::Completed, Utc::now());
            }
            self.store.save(&state).await?;
            return snapshot_of(&state);
        };

        let table = self.connect(token)?;
        let step = match state.active_job_id.as_deref() {
            Some(job_id) => {
                self.poll_job(
                    table.as_ref(),
                    run,
                    row,
                    job_id,
                    state.active_credential_token.as_deref(),
                )
                .await?
            }
            None => self.launch_row(table.as_ref(), run, row).await?,
        };

        match step {
            RowStep::Waiting => {}
            RowStep::Launched { job_id, credential } => {
                state.active_job_id = Some(job_id);
                state.active_credential_token = credential;
            }
            RowStep::Done { entry, seen } => {
                state.clear_active_job();
                if let Some(run) = state.current_run.as_mut() {
                    if let Some(seen) = seen {
                        run.existing_unique_ids = seen;
                    }
                    info!(row = entry.row, status = ?entry.status, leads = ?entry.leads, "row finished");
                    run.record(entry);
                    if run.is_complete() {
                        run.finish(RunOutcome::Completed, Utc::now());
                        info!(
                            processed = run.processed,
                            skipped = run.skipped,
                            total_leads = run.total_leads,
                            "run completed"
                        );
                    }
                }
            }
        }

        self.store.save(&state).await?;
        snapshot_of(&state)
    }

    async fn launch_row(
        &self,
        table: &dyn TableService,
        run: &RunProgress,
        row: u32,
    ) -> Result<RowStep, RunError> {
        let cells = match table
            .get_row(&run.spreadsheet_id, &run.settings_sheet_name, row)
            .await
        {
            Ok(cells) => cells,
            Err(TableError::Unauthorized) => return Err(self.not_authorized()),
            Err(err) => {
                return Ok(self
                    .fail_row(table, run, row, format!("reading settings row: {err}"))
                    .await)
            }
        };

        let target = SettingsRow::from_cells(&cells, &run.columns);
        if target.pushed {
            debug!(row, "row already pushed");
            return Ok(RowStep::done(PerRowEntry::skipped(row, "already pushed")));
        }
        if target.launch_key.is_empty() {
            debug!(row, "row has no launch key");
            return Ok(RowStep::done(PerRowEntry::skipped(row, "no launch key")));
        }

        let params = JobParams {
            limit: target.limit,
            credential: target.credential.clone(),
        };
        match self.jobs.start_job(&target.launch_key, &params).await {
            Ok(job_id) => {
                info!(row, job_id = %job_id, launch_key = %target.launch_key, "job launched");
                let cols = &run.columns;
                if let Err(err) = self
                    .write_cells(table, run, row, &[(cols.scrape_status_col, "RUNNING")])
                    .await
                {
                    warn!(row, error = %err, "could not mark row as running");
                }
                Ok(RowStep::Launched {
                    job_id,
                    credential: target.credential,
                })
            }
            Err(err) => Ok(self
                .fail_row(table, run, row, format!("starting job: {err}"))
                .await),
        }
    }

    async fn poll_job(
        &self,
        table: &dyn TableService,
        run: &RunProgress,
        row: u32,
        job_id: &str,
        credential: Option<&str>,
    ) -> Result<RowStep, RunError> {
        let status = match self.jobs.job_status(job_id, credential).await {
            Ok(status) => status,
            Err(err) => {
                self.abort_best_effort(job_id, credential).await;
                return Ok(self
                    .fail_row(table, run, row, format!("polling job {job_id}: {err}"))
                    .await);
            }
        };
        match status {
            JobStatus::Running => {
                debug!(row, job_id, "job still running");
                Ok(RowStep::Waiting)
            }
            JobStatus::Failed { reason } => Ok(self
                .fail_row(table, run, row, format!("job {job_id} failed: {reason}"))
                .await),
            JobStatus::Succeeded { dataset_url } => {
                self.push_results(table, run, row, job_id, credential, dataset_url)
                    .await
            }
        }
    }

    async fn push_results(
        &self,
        table: &dyn TableService,
        run: &RunProgress,
        row: u32,
        job_id: &str,
        credential: Option<&str>,
        dataset_url: Option<String>,
    ) -> Result<RowStep, RunError> {
        let records = match self.jobs.result_records(job_id, credential).await {
            Ok(records) => records,
            Err(err) => {
                return Ok(self
                    .fail_row(table, run, row, format!("fetching results of job {job_id}: {err}"))
                    .await)
            }
        };

        let first_seen = first_seen_label(&Local::now());
        let mut seen = run.existing_unique_ids.clone();
        let rows = map_records(&records, &run.leads_headers, &mut seen, &first_seen);
        if !rows.is_empty() {
            match table
                .append_rows(&run.spreadsheet_id, &run.leads_sheet_name, &rows)
                .await
            {
                Ok(()) => {}
                Err(TableError::Unauthorized) => return Err(self.not_authorized()),
                Err(err) => {
                    return Ok(self
                        .fail_row(table, run, row, format!("appending leads: {err}"))
                        .await)
                }
            }
        }
        let leads = rows.len();
        info!(row, job_id, records = records.len(), leads, "pushed leads");

        let cols = &run.columns;
        let push_status = format!("Pushed {leads} leads");
        let mut cells = vec![
            (cols.scraped_col, "Y"),
            (cols.pushed_col, "Y"),
            (cols.scrape_status_col, "SUCCEEDED"),
            (cols.status_col, "Done"),
            (cols.push_status_col, push_status.as_str()),
        ];
        if let Some(url) = dataset_url.as_deref() {
            cells.insert(0, (cols.dataset_col, url));
        }
        let entry = match self.write_cells(table, run, row, &cells).await {
            Ok(()) => PerRowEntry::succeeded(row, leads, dataset_url),
            Err(err) => {
                warn!(row, error = %err, "status writeback failed after push");
                let mut entry = PerRowEntry::failed(
                    row,
                    format!("pushed {leads} leads but status writeback failed: {err}"),
                );
                entry.leads = Some(leads);
                entry.dataset_url = dataset_url;
                entry
            }
        };
        Ok(RowStep::Done {
            entry,
            seen: Some(seen),
        })
    }

    /// Records a row-local failure; the failure writeback itself is best-effort.
    async fn fail_row(
        &self,
        table: &dyn TableService,
        run: &RunProgress,
        row: u32,
        message: String,
    ) -> RowStep {
        warn!(row, error = %message, "row failed");
        let cols = &run.columns;
        let cells = [
            (cols.scrape_status_col, "FAILED"),
            (cols.status_col, "Failed"),
            (cols.comments_col, message.as_str()),
        ];
        if let Err(err) = self.write_cells(table, run, row, &cells).await {
            warn!(row, error = %err, "failure writeback failed");
        }
        RowStep::done(PerRowEntry::failed(row, message))
    }

    async fn write_cells(
        &self,
        table: &dyn TableService,
        run: &RunProgress,
        row: u32,
        cells: &[(u32, &str)],
    ) -> Result<(), TableError> {
        for &(col, value) in cells {
            if col == 0 {
                continue;
            }
            table
                .set_cell(&run.spreadsheet_id, &run.settings_sheet_name, row, col, value)
                .await?;
        }
        Ok(())
    }

    async fn abort_best_effort(&self, job_id: &str, credential: Option<&str>) {
        match self.jobs.abort_job(job_id, credential).await {
            Ok(()) => info!(job_id, "job abort requested"),
            Err(err) => warn!(job_id, error = %err, "job abort failed"),
        }
    }

    /// Flags the run for cancellation; the next step finalizes it.
    pub async fn cancel_run(&self) -> Result<ProgressSnapshot, RunError> {
        let mut state = self
            .store
            .load()
            .await
            .filter(|state| state.current_run.is_some())
            .ok_or(RunError::NoActiveRun)?;
        state.cancel_requested = true;
        self.store.save(&state).await?;
        info!(active_job = ?state.active_job_id, "cancel requested");

        if let Some(job_id) = state.active_job_id.as_deref() {
            self.abort_best_effort(job_id, state.active_credential_token.as_deref())
                .await;
        }
        snapshot_of(&state)
    }

    pub async fn run_status(&self) -> Result<ProgressSnapshot, RunError> {
        let state = self.store.load().await.ok_or(RunError::NoActiveRun)?;
        snapshot_of(&state)
    }

    /// Forgets all persisted state, aborting any job still attached to it.
    pub async fn reset_run(&self) -> Result<(), RunError> {
        if let Some(state) = self.store.load().await {
            if let Some(job_id) = state.active_job_id.as_deref() {
                self.abort_best_effort(job_id, state.active_credential_token.as_deref())
                    .await;
            }
        }
        self.store.clear().await?;
        info!("run state cleared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use leadsync_adapters::{MemoryConnector, MemoryWorkbook, ScriptedJob, ScriptedJobProvider};
    use leadsync_core::{RawRecord, RowStatus};
    use leadsync_storage::{FileRunStateStore, MemoryRunStateStore};
    use serde_json::json;

    use super::*;

    const SHEET: &str = "sheet-1";
    const SETTINGS: &str = "Niche Settings";
    const LEADS: &str = "Scraped Leads";
    const TOKEN: &str = "google-token";
    const AUTH_URL: &str = "https://auth.test/google";

    struct Harness {
        book: Arc<MemoryWorkbook>,
        jobs: Arc<ScriptedJobProvider>,
        store: Arc<MemoryRunStateStore>,
    }

    fn token() -> AuthToken {
        AuthToken::from_access_token(TOKEN)
    }

    fn request(start_row: u32, end_row: u32) -> StartRunRequest {
        StartRunRequest {
            spreadsheet_id: SHEET.into(),
            settings_sheet_name: SETTINGS.into(),
            leads_sheet_name: LEADS.into(),
            start_row,
            end_row,
            supersede: false,
        }
    }

    fn place(id: &str, name: &str) -> RawRecord {
        let mut record = RawRecord::new();
        record.insert("placeId".into(), json!(id));
        record.insert("title".into(), json!(name));
        record.insert("phone".into(), json!("+61 2 9000 0000"));
        record
    }

    fn harness() -> Harness {
        let book = Arc::new(MemoryWorkbook::new());
        book.insert_tab(
            SHEET,
            SETTINGS,
            vec![
                vec!["Search Term", "Max Limit", "Apify Token", "Pushed"],
                vec!["", "", "", ""],
                vec!["plumbers sydney", "25", "row-token", ""],
                vec!["cafes melbourne", "", "", ""],
                vec!["bakers perth", "", "", "y"],
            ],
        );
        book.insert_tab(
            SHEET,
            LEADS,
            vec![
                vec!["Unique ID", "Business Name", "Phone Number", "AI Analysis"],
                vec!["p-existing", "Old Lead", "", "2"],
            ],
        );
        Harness {
            book,
            jobs: Arc::new(ScriptedJobProvider::new()),
            store: Arc::new(MemoryRunStateStore::new()),
        }
    }

    impl Harness {
        /// A fresh orchestrator per call, like a fresh process per request.
        fn orchestrator(&self) -> RunOrchestrator {
            self.orchestrator_with(self.store.clone())
        }

        fn orchestrator_with(&self, store: Arc<dyn RunStateStore>) -> RunOrchestrator {
            RunOrchestrator::new(
                store,
                Arc::new(MemoryConnector::new(self.book.clone(), TOKEN, AUTH_URL)),
                self.jobs.clone(),
                OrchestratorOptions::default(),
            )
        }

        async fn start(&self, start_row: u32, end_row: u32) -> Uuid {
            self.orchestrator()
                .start_run(&request(start_row, end_row), Some(&token()))
                .await
                .expect("start run")
                .run_id
        }

        async fn step(&self, run_id: Uuid) -> ProgressSnapshot {
            let before = self
                .store
                .load()
                .await
                .and_then(|s| s.current_run)
                .map(|r| r.current_index)
                .unwrap_or(0);
            let snap = self
                .orchestrator()
                .step_run(run_id, Some(&token()))
                .await
                .expect("step run");
            assert!(snap.current_index >= before, "cursor moved backwards");
            assert_eq!(snap.processed + snap.skipped, snap.current_index);
            assert_eq!(snap.per_row.len(), snap.current_index);
            snap
        }

        fn settings_cell(&self, row: u32, header: &str) -> String {
            let headers = self.book.rows(SHEET, SETTINGS).unwrap()[0].clone();
            let col = HeaderIndex::new(&headers).column(header);
            assert!(col > 0, "missing settings header {header}");
            self.book.cell(SHEET, SETTINGS, row, col)
        }
    }

    #[tokio::test]
    async fn skips_then_polls_then_pushes_deduplicated_leads() {
        let h = harness();
        h.jobs.script(
            "plumbers sydney",
            ScriptedJob::Succeed {
                polls: 2,
                records: vec![
                    place("p-existing", "Old Lead Again"),
                    place("p-1", "Plumber One"),
                    place("p-2", "Plumber Two"),
                    place("p-1", "Plumber One Again"),
                ],
            },
        );
        let run_id = h.start(2, 3).await;

        let snap = h.step(run_id).await;
        assert!(!snap.done);
        assert_eq!((snap.skipped, snap.current_index), (1, 1));
        assert_eq!(snap.per_row[0].message.as_deref(), Some("no launch key"));

        let snap = h.step(run_id).await;
        assert_eq!(snap.active_job_id.as_deref(), Some("job-1"));
        assert_eq!(snap.current_index, 1);
        assert_eq!(
            h.jobs.started(),
            vec![(
                "plumbers sydney".to_string(),
                JobParams {
                    limit: Some(25),
                    credential: Some("row-token".into())
                }
            )]
        );
        assert_eq!(h.settings_cell(3, "Scrape Status"), "RUNNING");

        for _ in 0..2 {
            let snap = h.step(run_id).await;
            assert!(!snap.done);
            assert_eq!(snap.current_index, 1);
        }

        let snap = h.step(run_id).await;
        assert!(snap.done);
        assert_eq!(snap.outcome, Some(RunOutcome::Completed));
        assert_eq!((snap.processed, snap.skipped, snap.total_leads), (1, 1, 2));
        assert!(snap.active_job_id.is_none());
        assert_eq!(snap.per_row[1].status, RowStatus::Succeeded);
        assert_eq!(snap.per_row[1].leads, Some(2));

        let leads = h.book.rows(SHEET, LEADS).unwrap();
        assert_eq!(leads.len(), 4);
        assert_eq!(leads[2][..3], ["p-1", "Plumber One", "61290000000"]);
        assert_eq!(leads[3][0], "p-2");

        assert_eq!(h.settings_cell(3, "Pushed"), "Y");
        assert_eq!(h.settings_cell(3, "Scraped"), "Y");
        assert_eq!(h.settings_cell(3, "Status"), "Done");
        assert_eq!(h.settings_cell(3, "Scrape Status"), "SUCCEEDED");
        assert_eq!(h.settings_cell(3, "Google-Maps Push Status"), "Pushed 2 leads");
        assert_eq!(h.settings_cell(3, "Dataset URL"), "memory://datasets/job-1");

        let state = h.store.load().await.unwrap();
        let run = state.current_run.unwrap();
        assert!(run.existing_unique_ids.contains("p-2"));
        assert_eq!(run.existing_unique_ids.len(), 3);
    }

    #[tokio::test]
    async fn finished_run_keeps_returning_final_snapshot() {
        let h = harness();
        let run_id = h.start(5, 5).await;
        let snap = h.step(run_id).await;
        assert!(snap.done);
        assert_eq!(snap.per_row[0].message.as_deref(), Some("already pushed"));

        let again = h.step(run_id).await;
        assert_eq!(again, snap);
        assert!(h.jobs.started().is_empty());
    }

    #[tokio::test]
    async fn failed_job_is_isolated_to_its_row() {
        let h = harness();
        h.jobs.script(
            "plumbers sydney",
            ScriptedJob::Fail {
                polls: 0,
                reason: "actor crashed".into(),
            },
        );
        h.jobs.script(
            "cafes melbourne",
            ScriptedJob::Succeed {
                polls: 0,
                records: vec![place("c-1", "Cafe One")],
            },
        );
        let run_id = h.start(3, 4).await;

        h.step(run_id).await;
        let snap = h.step(run_id).await;
        assert_eq!(snap.current_index, 1);
        assert_eq!(snap.per_row[0].status, RowStatus::Failed);
        assert!(snap.per_row[0]
            .message
            .as_deref()
            .unwrap()
            .contains("actor crashed"));
        assert_eq!(h.settings_cell(3, "Status"), "Failed");
        assert_eq!(h.settings_cell(3, "Scrape Status"), "FAILED");
        assert!(h.settings_cell(3, "Comments").contains("actor crashed"));

        h.step(run_id).await;
        let snap = h.step(run_id).await;
        assert!(snap.done);
        assert_eq!((snap.processed, snap.skipped, snap.total_leads), (2, 0, 1));
        assert_eq!(snap.per_row[1].status, RowStatus::Succeeded);
        assert_eq!(h.jobs.started()[1].1, JobParams::default());
    }

    #[test]
    fn widest_allowed_range_validates() {
        assert!(request(2, 1 + MAX_RUN_ROWS).validate().is_ok());
        assert!(request(2, 2 + MAX_RUN_ROWS).validate().is_err());
    }

    #[tokio::test]
    async fn poll_failure_aborts_job_and_fails_row() {
        let h = harness();
        h.jobs.script(
            "plumbers sydney",
            ScriptedJob::Succeed {
                polls: 5,
                records: vec![],
            },
        );
        let run_id = h.start(3, 4).await;
        h.step(run_id).await;
        h.jobs.fail_status(true);

        let snap = h.step(run_id).await;
        assert_eq!(snap.current_index, 1);
        assert_eq!(snap.per_row[0].status, RowStatus::Failed);
        assert!(snap.active_job_id.is_none());
        assert_eq!(h.jobs.aborted(), vec!["job-1".to_string()]);
        assert_eq!(h.settings_cell(3, "Scrape Status"), "FAILED");
    }

    #[tokio::test]
    async fn rejected_launch_fails_row_and_advances() {
        let h = harness();
        h.jobs
            .script("plumbers sydney", ScriptedJob::RejectStart("quota exceeded".into()));
        let run_id = h.start(3, 3).await;

        let snap = h.step(run_id).await;
        assert!(snap.done);
        assert_eq!(snap.processed, 1);
        assert!(snap.per_row[0]
            .message
            .as_deref()
            .unwrap()
            .contains("quota exceeded"));
    }

    #[tokio::test]
    async fn append_failure_fails_row_without_growing_dedup_set() {
        let h = harness();
        h.jobs.script(
            "plumbers sydney",
            ScriptedJob::Succeed {
                polls: 0,
                records: vec![place("p-9", "Plumber Nine")],
            },
        );
        let run_id = h.start(3, 3).await;
        h.step(run_id).await;
        h.book.fail_appends(true);

        let snap = h.step(run_id).await;
        assert!(snap.done);
        assert_eq!(snap.per_row[0].status, RowStatus::Failed);
        assert_eq!(snap.total_leads, 0);
        let run = h.store.load().await.unwrap().current_run.unwrap();
        assert!(!run.existing_unique_ids.contains("p-9"));
    }

    #[tokio::test]
    async fn cancel_is_observed_on_next_step() {
        let h = harness();
        h.jobs.script(
            "plumbers sydney",
            ScriptedJob::Succeed {
                polls: 10,
                records: vec![],
            },
        );
        let run_id = h.start(2, 5).await;
        h.step(run_id).await;
        h.step(run_id).await;

        let snap = h.orchestrator().cancel_run().await.unwrap();
        assert!(!snap.done);
        assert_eq!(h.jobs.aborted(), vec!["job-1".to_string()]);

        let snap = h.step(run_id).await;
        assert!(snap.done);
        assert_eq!(snap.outcome, Some(RunOutcome::Cancelled));
        assert_eq!(snap.current_index, 1);
        assert!(snap.active_job_id.is_none());

        let again = h.step(run_id).await;
        assert_eq!(again.current_index, 1);
        assert_eq!(h.jobs.started().len(), 1);

        // The flag outlives the cancelled run and is reset only by the next start.
        assert!(h.store.load().await.unwrap().cancel_requested);
        h.start(4, 4).await;
        assert!(!h.store.load().await.unwrap().cancel_requested);
    }

    #[tokio::test]
    async fn cancel_survives_abort_failure() {
        let h = harness();
        h.jobs.script(
            "plumbers sydney",
            ScriptedJob::Succeed {
                polls: 10,
                records: vec![],
            },
        );
        h.jobs.fail_aborts(true);
        let run_id = h.start(3, 4).await;
        h.step(run_id).await;

        h.orchestrator().cancel_run().await.expect("cancel");
        let snap = h.step(run_id).await;
        assert!(snap.done);
        assert_eq!(snap.outcome, Some(RunOutcome::Cancelled));
    }

    #[tokio::test]
    async fn stale_or_missing_runs_report_no_active_run() {
        let h = harness();
        let orchestrator = h.orchestrator();
        let err = orchestrator
            .step_run(Uuid::new_v4(), Some(&token()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "no_active_run");
        assert_eq!(orchestrator.cancel_run().await.unwrap_err().kind(), "no_active_run");
        assert_eq!(orchestrator.run_status().await.unwrap_err().kind(), "no_active_run");

        h.start(2, 3).await;
        let err = orchestrator
            .step_run(Uuid::new_v4(), Some(&token()))
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::NoActiveRun));
    }

    #[tokio::test]
    async fn corrupt_state_degrades_to_no_active_run() {
        let h = harness();
        let run_id = h.start(2, 3).await;
        h.store.put_raw("{ truncated").await;
        let err = h
            .orchestrator()
            .step_run(run_id, Some(&token()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "no_active_run");
    }

    #[tokio::test]
    async fn bad_ranges_are_rejected_before_any_state_change() {
        let h = harness();
        let orchestrator = h.orchestrator();
        let widest = 2 + MAX_RUN_ROWS;
        for (start, end) in [(1, 3), (5, 3), (0, 0), (2, widest), (2, u32::MAX)] {
            let err = orchestrator
                .start_run(&request(start, end), Some(&token()))
                .await
                .unwrap_err();
            assert_eq!(err.kind(), "invalid_range");
        }
        assert!(h.store.raw().await.is_none());
    }

    #[tokio::test]
    async fn missing_credentials_carry_reauthorization_url() {
        let h = harness();
        let orchestrator = h.orchestrator();
        let err = orchestrator.start_run(&request(2, 3), None).await.unwrap_err();
        let body = err.to_body();
        assert_eq!(body.kind, "not_authorized");
        assert_eq!(body.auth_url.as_deref(), Some(AUTH_URL));

        let run_id = h.start(2, 3).await;
        let wrong = AuthToken::from_access_token("expired");
        let err = orchestrator.step_run(run_id, Some(&wrong)).await.unwrap_err();
        assert_eq!(err.kind(), "not_authorized");
        let snap = orchestrator.run_status().await.unwrap();
        assert_eq!(snap.current_index, 0);

        let json = serde_json::to_value(err.to_body()).unwrap();
        assert_eq!(json["authUrl"], json!(AUTH_URL));
    }

    #[tokio::test]
    async fn unfinished_run_must_be_superseded_explicitly() {
        let h = harness();
        h.jobs.script(
            "plumbers sydney",
            ScriptedJob::Succeed {
                polls: 10,
                records: vec![],
            },
        );
        let first = h.start(3, 3).await;
        h.step(first).await;

        let err = h
            .orchestrator()
            .start_run(&request(2, 3), Some(&token()))
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::RunInProgress { run_id } if run_id == first));

        let mut replace = request(2, 3);
        replace.supersede = true;
        let snap = h
            .orchestrator()
            .start_run(&replace, Some(&token()))
            .await
            .unwrap();
        assert_ne!(snap.run_id, first);
        assert_eq!(h.jobs.aborted(), vec!["job-1".to_string()]);
        let err = h
            .orchestrator()
            .step_run(first, Some(&token()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "no_active_run");
    }

    #[tokio::test]
    async fn save_failure_surfaces_and_keeps_cursor() {
        let h = harness();
        let run_id = h.start(2, 3).await;
        h.store.fail_saves(true);
        let err = h
            .orchestrator()
            .step_run(run_id, Some(&token()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "storage_error");

        h.store.fail_saves(false);
        let snap = h.orchestrator().run_status().await.unwrap();
        assert_eq!(snap.current_index, 0);
    }

    #[tokio::test]
    async fn leads_tab_without_headers_cannot_start() {
        let h = harness();
        h.book.insert_tab(SHEET, LEADS, Vec::<Vec<&str>>::new());
        let err = h
            .orchestrator()
            .start_run(&request(2, 3), Some(&token()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "table_service_error");
        assert!(err.to_string().contains(LEADS));
    }

    #[tokio::test]
    async fn start_creates_writeback_columns_and_seeds_ids() {
        let h = harness();
        h.start(2, 3).await;
        let state = h.store.load().await.unwrap();
        let run = state.current_run.unwrap();

        assert_eq!(run.row_numbers, vec![2, 3]);
        assert_eq!(run.columns.launch_key_col, 1);
        assert_eq!(run.columns.pushed_col, 4);
        assert!(run.columns.push_status_col > 4);
        assert_eq!(run.headers_after_ensure.len(), 10);
        assert_eq!(run.leads_headers[0], "Unique ID");
        assert!(run.existing_unique_ids.contains("p-existing"));
    }

    /// Known race: overlapping writers are last-writer-wins with no locking.
    /// A step that loaded state before a cancel and saved after it erases the cancel.
    #[tokio::test]
    async fn overlapping_writers_are_last_writer_wins() {
        let h = harness();
        let run_id = h.start(2, 5).await;
        let loaded_by_slow_step = h.store.raw().await.unwrap();

        h.orchestrator().cancel_run().await.unwrap();
        h.store.put_raw(loaded_by_slow_step).await;

        let snap = h.step(run_id).await;
        assert!(!snap.done);
        assert_eq!(snap.current_index, 1);
    }

    #[tokio::test]
    async fn status_and_reset_round_trip() {
        let h = harness();
        h.jobs.script(
            "plumbers sydney",
            ScriptedJob::Succeed {
                polls: 10,
                records: vec![],
            },
        );
        let run_id = h.start(3, 4).await;
        h.step(run_id).await;

        let status = h.orchestrator().run_status().await.unwrap();
        assert_eq!(status.run_id, run_id);
        assert_eq!(status.active_job_id.as_deref(), Some("job-1"));

        h.orchestrator().reset_run().await.unwrap();
        assert_eq!(h.jobs.aborted(), vec!["job-1".to_string()]);
        assert!(h.store.raw().await.is_none());
        assert_eq!(
            h.orchestrator().run_status().await.unwrap_err().kind(),
            "no_active_run"
        );
    }

    #[tokio::test]
    async fn file_store_run_resumes_across_orchestrators() {
        let h = harness();
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn RunStateStore> =
            Arc::new(FileRunStateStore::new(dir.path().join(".run-state.json")));
        h.jobs.script(
            "cafes melbourne",
            ScriptedJob::Succeed {
                polls: 1,
                records: vec![place("c-1", "Cafe One"), place("c-2", "Cafe Two")],
            },
        );

        let run_id = h
            .orchestrator_with(store.clone())
            .start_run(&request(4, 4), Some(&token()))
            .await
            .unwrap()
            .run_id;
        let mut snap = None;
        for _ in 0..3 {
            snap = Some(
                h.orchestrator_with(store.clone())
                    .step_run(run_id, Some(&token()))
                    .await
                    .unwrap(),
            );
        }
        let snap = snap.unwrap();
        assert!(snap.done);
        assert_eq!(snap.total_leads, 2);
        assert_eq!(h.book.rows(SHEET, LEADS).unwrap().len(), 4);
    }

    #[test]
    fn settings_row_parses_limit_credential_and_marker() {
        let columns = SettingsColumns {
            launch_key_col: 1,
            max_limit_col: 2,
            credential_col: 3,
            pushed_col: 4,
            ..SettingsColumns::default()
        };
        let cells: Vec<String> = ["  cafes ", "1,500", " ", " Y "]
            .iter()
            .map(|c| c.to_string())
            .collect();
        let row = SettingsRow::from_cells(&cells, &columns);
        assert_eq!(row.launch_key, "cafes");
        assert_eq!(row.limit, Some(1500));
        assert_eq!(row.credential, None);
        assert!(row.pushed);

        let bad_limit: Vec<String> = vec!["x".into(), "0".into()];
        assert_eq!(SettingsRow::from_cells(&bad_limit, &columns).limit, None);
    }
}
