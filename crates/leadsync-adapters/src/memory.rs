//! In-process table and job provider used for local dry runs and tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use leadsync_core::{AuthToken, DestinationRow, HeaderIndex, RawRecord};

use crate::{
    JobError, JobParams, JobProvider, JobStatus, TableConnector, TableError, TableService,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

type TabKey = (String, String);

/// Spreadsheet tabs held in memory, keyed by spreadsheet id and tab name.
#[derive(Debug, Default)]
pub struct MemoryWorkbook {
    tabs: Mutex<BTreeMap<TabKey, Vec<Vec<String>>>>,
    fail_appends: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryWorkbook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_tab<R, C>(&self, spreadsheet_id: &str, tab: &str, rows: R)
    where
        R: IntoIterator<Item = C>,
        C: IntoIterator,
        C::Item: Into<String>,
    {
        let rows: Vec<Vec<String>> = rows
            .into_iter()
            .map(|row| row.into_iter().map(Into::into).collect())
            .collect();
        lock(&self.tabs).insert((spreadsheet_id.to_string(), tab.to_string()), rows);
    }

    pub fn rows(&self, spreadsheet_id: &str, tab: &str) -> Option<Vec<Vec<String>>> {
        lock(&self.tabs)
            .get(&(spreadsheet_id.to_string(), tab.to_string()))
            .cloned()
    }

    pub fn cell(&self, spreadsheet_id: &str, tab: &str, row: u32, col: u32) -> String {
        self.rows(spreadsheet_id, tab)
            .and_then(|rows| rows.get(row.saturating_sub(1) as usize).cloned())
            .and_then(|r| r.get(col.saturating_sub(1) as usize).cloned())
            .unwrap_or_default()
    }

    pub fn fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn with_tab<T>(
        &self,
        spreadsheet_id: &str,
        tab: &str,
        f: impl FnOnce(&mut Vec<Vec<String>>) -> T,
    ) -> Result<T, TableError> {
        let mut tabs = lock(&self.tabs);
        let rows = tabs
            .get_mut(&(spreadsheet_id.to_string(), tab.to_string()))
            .ok_or_else(|| TableError::TabUnavailable(tab.to_string()))?;
        Ok(f(rows))
    }
}

#[async_trait]
impl TableService for MemoryWorkbook {
    async fn get_row(
        &self,
        spreadsheet_id: &str,
        tab: &str,
        row: u32,
    ) -> Result<Vec<String>, TableError> {
        self.with_tab(spreadsheet_id, tab, |rows| {
            rows.get(row.saturating_sub(1) as usize)
                .cloned()
                .unwrap_or_default()
        })
    }

    async fn get_rows(
        &self,
        spreadsheet_id: &str,
        tab: &str,
        start_row: u32,
        count: u32,
    ) -> Result<Vec<Vec<String>>, TableError> {
        self.with_tab(spreadsheet_id, tab, |rows| {
            rows.iter()
                .skip(start_row.saturating_sub(1) as usize)
                .take(count as usize)
                .cloned()
                .collect()
        })
    }

    async fn append_rows(
        &self,
        spreadsheet_id: &str,
        tab: &str,
        new_rows: &[DestinationRow],
    ) -> Result<(), TableError> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(TableError::Api {
                status: 503,
                message: "append rejected".into(),
            });
        }
        self.with_tab(spreadsheet_id, tab, |rows| rows.extend(new_rows.iter().cloned()))
    }

    async fn ensure_header(
        &self,
        spreadsheet_id: &str,
        tab: &str,
        header: &str,
    ) -> Result<u32, TableError> {
        let result = self.with_tab(spreadsheet_id, tab, |rows| {
            if rows.is_empty() {
                rows.push(Vec::new());
            }
            let headers = &mut rows[0];
            let existing = HeaderIndex::new(headers.as_slice()).column(header);
            if existing > 0 {
                return existing;
            }
            headers.push(header.trim().to_string());
            headers.len() as u32
        });
        match result {
            Ok(col) => Ok(col),
            Err(TableError::TabUnavailable(_)) => Ok(0),
            Err(err) => Err(err),
        }
    }

    async fn set_cell(
        &self,
        spreadsheet_id: &str,
        tab: &str,
        row: u32,
        col: u32,
        value: &str,
    ) -> Result<(), TableError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(TableError::Api {
                status: 503,
                message: "cell write rejected".into(),
            });
        }
        if row == 0 || col == 0 {
            return Err(TableError::Parse(format!("invalid cell {row}:{col}")));
        }
        self.with_tab(spreadsheet_id, tab, |rows| {
            let r = row as usize - 1;
            let c = col as usize - 1;
            if rows.len() <= r {
                rows.resize_with(r + 1, Vec::new);
            }
            let cells = &mut rows[r];
            if cells.len() <= c {
                cells.resize(c + 1, String::new());
            }
            cells[c] = value.to_string();
        })
    }
}

/// Authorizes exactly one access token against a shared [`MemoryWorkbook`].
pub struct MemoryConnector {
    workbook: Arc<MemoryWorkbook>,
    access_token: String,
    auth_url: String,
}

impl MemoryConnector {
    pub fn new(
        workbook: Arc<MemoryWorkbook>,
        access_token: impl Into<String>,
        auth_url: impl Into<String>,
    ) -> Self {
        Self {
            workbook,
            access_token: access_token.into(),
            auth_url: auth_url.into(),
        }
    }
}

impl TableConnector for MemoryConnector {
    fn connect(&self, token: &AuthToken) -> Option<Arc<dyn TableService>> {
        if token.access_token()? != self.access_token {
            return None;
        }
        Some(self.workbook.clone() as Arc<dyn TableService>)
    }

    fn authorization_url(&self) -> String {
        self.auth_url.clone()
    }
}

/// How a scripted launch key behaves once started.
#[derive(Debug, Clone)]
pub enum ScriptedJob {
    /// Reports `running` for `polls` status checks, then succeeds with `records`.
    Succeed { polls: u32, records: Vec<RawRecord> },
    /// Reports `running` for `polls` status checks, then fails.
    Fail { polls: u32, reason: String },
    /// The launch itself is rejected.
    RejectStart(String),
}

#[derive(Debug)]
struct ActiveJob {
    launch_key: String,
    remaining_polls: u32,
    aborted: bool,
}

/// Deterministic job provider keyed by launch key.
#[derive(Debug, Default)]
pub struct ScriptedJobProvider {
    scripts: Mutex<HashMap<String, ScriptedJob>>,
    jobs: Mutex<HashMap<String, ActiveJob>>,
    started: Mutex<VecDeque<(String, JobParams)>>,
    aborted: Mutex<Vec<String>>,
    next_id: AtomicU64,
    fail_aborts: AtomicBool,
    fail_status: AtomicBool,
}

impl ScriptedJobProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, launch_key: &str, job: ScriptedJob) {
        lock(&self.scripts).insert(launch_key.to_string(), job);
    }

    pub fn fail_aborts(&self, fail: bool) {
        self.fail_aborts.store(fail, Ordering::SeqCst);
    }

    /// Makes every status check fail as if the provider were unreachable.
    pub fn fail_status(&self, fail: bool) {
        self.fail_status.store(fail, Ordering::SeqCst);
    }

    /// Launch keys and params in the order jobs were started.
    pub fn started(&self) -> Vec<(String, JobParams)> {
        lock(&self.started).iter().cloned().collect()
    }

    pub fn aborted(&self) -> Vec<String> {
        lock(&self.aborted).clone()
    }

    fn script_for(&self, job_id: &str) -> Result<(ScriptedJob, u32, bool), JobError> {
        let jobs = lock(&self.jobs);
        let job = jobs
            .get(job_id)
            .ok_or_else(|| JobError::UnknownJob(job_id.to_string()))?;
        let script = lock(&self.scripts)
            .get(&job.launch_key)
            .cloned()
            .ok_or_else(|| JobError::UnknownJob(job_id.to_string()))?;
        Ok((script, job.remaining_polls, job.aborted))
    }
}

#[async_trait]
impl JobProvider for ScriptedJobProvider {
    async fn start_job(&self, launch_key: &str, params: &JobParams) -> Result<String, JobError> {
        let script = lock(&self.scripts)
            .get(launch_key)
            .cloned()
            .ok_or_else(|| JobError::Rejected(format!("no job configured for '{launch_key}'")))?;
        let remaining_polls = match script {
            ScriptedJob::RejectStart(reason) => return Err(JobError::Rejected(reason)),
            ScriptedJob::Succeed { polls, .. } | ScriptedJob::Fail { polls, .. } => polls,
        };
        let job_id = format!("job-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        lock(&self.jobs).insert(
            job_id.clone(),
            ActiveJob {
                launch_key: launch_key.to_string(),
                remaining_polls,
                aborted: false,
            },
        );
        lock(&self.started).push_back((launch_key.to_string(), params.clone()));
        Ok(job_id)
    }

    async fn job_status(
        &self,
        job_id: &str,
        _credential: Option<&str>,
    ) -> Result<JobStatus, JobError> {
        if self.fail_status.load(Ordering::SeqCst) {
            return Err(JobError::Api {
                status: 503,
                message: "status unavailable".into(),
            });
        }
        let (script, remaining, aborted) = self.script_for(job_id)?;
        if aborted {
            return Ok(JobStatus::Failed {
                reason: "aborted".into(),
            });
        }
        if remaining > 0 {
            if let Some(job) = lock(&self.jobs).get_mut(job_id) {
                job.remaining_polls -= 1;
            }
            return Ok(JobStatus::Running);
        }
        Ok(match script {
            ScriptedJob::Succeed { .. } => JobStatus::Succeeded {
                dataset_url: Some(format!("memory://datasets/{job_id}")),
            },
            ScriptedJob::Fail { reason, .. } => JobStatus::Failed { reason },
            ScriptedJob::RejectStart(reason) => JobStatus::Failed { reason },
        })
    }

    async fn result_records(
        &self,
        job_id: &str,
        _credential: Option<&str>,
    ) -> Result<Vec<RawRecord>, JobError> {
        match self.script_for(job_id)?.0 {
            ScriptedJob::Succeed { records, .. } => Ok(records),
            _ => Err(JobError::Rejected(format!("job {job_id} has no results"))),
        }
    }

    async fn abort_job(&self, job_id: &str, _credential: Option<&str>) -> Result<(), JobError> {
        if self.fail_aborts.load(Ordering::SeqCst) {
            return Err(JobError::Api {
                status: 500,
                message: "abort rejected".into(),
            });
        }
        if let Some(job) = lock(&self.jobs).get_mut(job_id) {
            job.aborted = true;
        }
        lock(&self.aborted).push(job_id.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ensure_header_appends_missing_columns() {
        let book = MemoryWorkbook::new();
        book.insert_tab("s", "Settings", vec![vec!["Search Term", "Max Limit"]]);

        assert_eq!(book.ensure_header("s", "Settings", "max limit").await.unwrap(), 2);
        assert_eq!(book.ensure_header("s", "Settings", "Pushed").await.unwrap(), 3);
        assert_eq!(book.ensure_header("s", "Missing", "Pushed").await.unwrap(), 0);
        assert_eq!(book.cell("s", "Settings", 1, 3), "Pushed");
    }

    #[tokio::test]
    async fn set_cell_grows_sparse_rows() {
        let book = MemoryWorkbook::new();
        book.insert_tab("s", "Settings", vec![vec!["A"]]);
        book.set_cell("s", "Settings", 3, 2, "Y").await.unwrap();
        assert_eq!(book.cell("s", "Settings", 3, 2), "Y");
        assert_eq!(book.get_row("s", "Settings", 2).await.unwrap(), Vec::<String>::new());
    }

    #[tokio::test]
    async fn scripted_job_runs_then_succeeds() {
        let jobs = ScriptedJobProvider::new();
        jobs.script(
            "cafes",
            ScriptedJob::Succeed {
                polls: 1,
                records: vec![RawRecord::new()],
            },
        );
        let id = jobs.start_job("cafes", &JobParams::default()).await.unwrap();
        assert_eq!(jobs.job_status(&id, None).await.unwrap(), JobStatus::Running);
        assert!(matches!(
            jobs.job_status(&id, None).await.unwrap(),
            JobStatus::Succeeded { .. }
        ));
        assert_eq!(jobs.result_records(&id, None).await.unwrap().len(), 1);
        assert_eq!(jobs.started().len(), 1);
    }

    #[tokio::test]
    async fn connector_checks_access_token() {
        let book = Arc::new(MemoryWorkbook::new());
        let connector = MemoryConnector::new(book, "secret", "https://auth.test/start");
        assert!(connector.connect(&AuthToken::from_access_token("secret")).is_some());
        assert!(connector.connect(&AuthToken::from_access_token("other")).is_none());
    }
}
