//! Apify actor-run client acting as the scrape job provider.

use async_trait::async_trait;
use leadsync_core::RawRecord;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info};

use crate::{JobError, JobParams, JobProvider, JobStatus};

pub const DEFAULT_BASE_URL: &str = "https://api.apify.com/v2";

/// Google Maps place scraper, addressed as `username~actor`.
pub const DEFAULT_ACTOR_ID: &str = "compass~crawler-google-places";

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    data: T,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunData {
    pub id: String,
    pub status: String,
    #[serde(rename = "defaultDatasetId", default)]
    pub default_dataset_id: Option<String>,
    #[serde(rename = "statusMessage", default)]
    pub status_message: Option<String>,
}

pub struct ApifyJobProvider {
    client: reqwest::Client,
    base_url: String,
    actor_id: String,
    default_token: Option<String>,
}

impl ApifyJobProvider {
    pub fn new(
        base_url: impl Into<String>,
        actor_id: impl Into<String>,
        default_token: Option<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            actor_id: actor_id.into().replace('/', "~"),
            default_token: default_token.filter(|t| !t.trim().is_empty()),
        }
    }

    fn token<'a>(&'a self, credential: Option<&'a str>) -> Result<&'a str, JobError> {
        credential
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .or(self.default_token.as_deref())
            .ok_or(JobError::MissingCredential)
    }

    async fn checked(resp: reqwest::Response) -> Result<reqwest::Response, JobError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(JobError::Api {
            status: status.as_u16(),
            message: body,
        })
    }

    async fn fetch_run(&self, job_id: &str, token: &str) -> Result<RunData, JobError> {
        let url = format!("{}/actor-runs/{}", self.base_url, job_id);
        let resp = self.client.get(&url).bearer_auth(token).send().await?;
        let resp = Self::checked(resp).await?;
        let api_resp: ApiResponse<RunData> = resp.json().await?;
        Ok(api_resp.data)
    }
}

/// Actor input for a launch key: a search term, or a start URL when the key is a URL.
pub fn build_actor_input(launch_key: &str, limit: Option<u32>) -> JsonValue {
    let key = launch_key.trim();
    let mut input = if key.starts_with("http://") || key.starts_with("https://") {
        json!({ "startUrls": [{ "url": key }] })
    } else {
        json!({ "searchStringsArray": [key] })
    };
    if let Some(limit) = limit {
        input["maxCrawledPlacesPerSearch"] = json!(limit);
    }
    input
}

pub fn map_run_status(run: &RunData, base_url: &str) -> JobStatus {
    match run.status.as_str() {
        "SUCCEEDED" => JobStatus::Succeeded {
            dataset_url: run
                .default_dataset_id
                .as_deref()
                .filter(|id| !id.is_empty())
                .map(|id| format!("{base_url}/datasets/{id}/items?format=json")),
        },
        "FAILED" | "ABORTED" | "TIMED-OUT" => JobStatus::Failed {
            reason: match &run.status_message {
                Some(msg) if !msg.trim().is_empty() => format!("{}: {}", run.status, msg.trim()),
                _ => format!("run finished with status {}", run.status),
            },
        },
        _ => JobStatus::Running,
    }
}

#[async_trait]
impl JobProvider for ApifyJobProvider {
    async fn start_job(&self, launch_key: &str, params: &JobParams) -> Result<String, JobError> {
        let token = self.token(params.credential.as_deref())?;
        let input = build_actor_input(launch_key, params.limit);
        let url = format!("{}/acts/{}/runs", self.base_url, self.actor_id);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&input)
            .send()
            .await?;
        let resp = Self::checked(resp).await?;
        let api_resp: ApiResponse<RunData> = resp.json().await?;
        info!(run_id = %api_resp.data.id, actor = %self.actor_id, "Apify run started");
        Ok(api_resp.data.id)
    }

    async fn job_status(
        &self,
        job_id: &str,
        credential: Option<&str>,
    ) -> Result<JobStatus, JobError> {
        let token = self.token(credential)?;
        let run = self.fetch_run(job_id, token).await?;
        debug!(run_id = job_id, status = %run.status, "polled Apify run");
        Ok(map_run_status(&run, &self.base_url))
    }

    async fn result_records(
        &self,
        job_id: &str,
        credential: Option<&str>,
    ) -> Result<Vec<RawRecord>, JobError> {
        let token = self.token(credential)?;
        let url = format!(
            "{}/actor-runs/{}/dataset/items?format=json&clean=true",
            self.base_url, job_id
        );
        let resp = self.client.get(&url).bearer_auth(token).send().await?;
        let resp = Self::checked(resp).await?;
        let items: Vec<JsonValue> = resp.json().await?;
        let records = items
            .into_iter()
            .filter_map(|item| match item {
                JsonValue::Object(map) => Some(map),
                _ => None,
            })
            .collect::<Vec<_>>();
        info!(run_id = job_id, count = records.len(), "fetched dataset items");
        Ok(records)
    }

    async fn abort_job(&self, job_id: &str, credential: Option<&str>) -> Result<(), JobError> {
        let token = self.token(credential)?;
        let url = format!("{}/actor-runs/{}/abort", self.base_url, job_id);
        let resp = self.client.post(&url).bearer_auth(token).send().await?;
        Self::checked(resp).await?;
        info!(run_id = job_id, "Apify run abort requested");
        Ok(())
    }
}
