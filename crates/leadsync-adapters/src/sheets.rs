//! Google Sheets v4 values API client.

use std::sync::Arc;

use async_trait::async_trait;
use leadsync_core::{AuthToken, DestinationRow, HeaderIndex};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tracing::debug;

use crate::{TableConnector, TableError, TableService};

#[derive(Debug, Clone)]
pub struct SheetsConnector {
    client: reqwest::Client,
    base_url: String,
    auth_url: String,
}

impl SheetsConnector {
    pub fn new(base_url: impl Into<String>, auth_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            auth_url: auth_url.into(),
        }
    }
}

impl TableConnector for SheetsConnector {
    fn connect(&self, token: &AuthToken) -> Option<Arc<dyn TableService>> {
        let access_token = token.access_token()?.to_string();
        Some(Arc::new(SheetsClient {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            access_token,
        }))
    }

    fn authorization_url(&self) -> String {
        self.auth_url.clone()
    }
}

pub struct SheetsClient {
    client: reqwest::Client,
    base_url: String,
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<JsonValue>>,
}

/// Converts a 1-based column index to A1 letters (`1 -> A`, `27 -> AA`).
pub fn column_letters(col: u32) -> String {
    let mut x = col;
    let mut letters = Vec::new();
    while x > 0 {
        let rem = (x - 1) % 26;
        letters.push((b'A' + rem as u8) as char);
        x = (x - 1) / 26;
    }
    letters.iter().rev().collect()
}

fn quoted_range(tab: &str, a1: &str) -> String {
    format!("'{}'!{}", tab.replace('\'', "''"), a1)
}

fn cell_text(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl SheetsClient {
    fn values_url(&self, spreadsheet_id: &str, segment: &str) -> Result<Url, TableError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| TableError::Parse(format!("invalid sheets base url: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| TableError::Parse("sheets base url cannot be a base".into()))?
            .push(spreadsheet_id)
            .push("values")
            .push(segment);
        Ok(url)
    }

    async fn checked(
        &self,
        resp: reqwest::Response,
        range: &str,
    ) -> Result<reqwest::Response, TableError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        match status {
            StatusCode::UNAUTHORIZED => Err(TableError::Unauthorized),
            StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
                Err(TableError::TabUnavailable(range.to_string()))
            }
            StatusCode::BAD_REQUEST if body.contains("Unable to parse range") => {
                Err(TableError::TabUnavailable(range.to_string()))
            }
            _ => Err(TableError::Api {
                status: status.as_u16(),
                message: body,
            }),
        }
    }

    async fn read_range(
        &self,
        spreadsheet_id: &str,
        range: &str,
    ) -> Result<Vec<Vec<String>>, TableError> {
        let url = self.values_url(spreadsheet_id, range)?;
        let resp = self
            .client
            .get(url)
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        let resp = self.checked(resp, range).await?;
        let parsed: ValueRange = resp
            .json()
            .await
            .map_err(|e| TableError::Parse(e.to_string()))?;
        Ok(parsed
            .values
            .iter()
            .map(|row| row.iter().map(cell_text).collect())
            .collect())
    }
}

#[async_trait]
impl TableService for SheetsClient {
    async fn get_row(
        &self,
        spreadsheet_id: &str,
        tab: &str,
        row: u32,
    ) -> Result<Vec<String>, TableError> {
        let range = quoted_range(tab, &format!("{row}:{row}"));
        let mut rows = self.read_range(spreadsheet_id, &range).await?;
        Ok(if rows.is_empty() {
            Vec::new()
        } else {
            rows.swap_remove(0)
        })
    }

    async fn get_rows(
        &self,
        spreadsheet_id: &str,
        tab: &str,
        start_row: u32,
        count: u32,
    ) -> Result<Vec<Vec<String>>, TableError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let end_row = start_row.saturating_add(count - 1);
        let range = quoted_range(tab, &format!("{start_row}:{end_row}"));
        self.read_range(spreadsheet_id, &range).await
    }

    async fn append_rows(
        &self,
        spreadsheet_id: &str,
        tab: &str,
        rows: &[DestinationRow],
    ) -> Result<(), TableError> {
        if rows.is_empty() {
            return Ok(());
        }
        let range = quoted_range(tab, "A1");
        let mut url = self.values_url(spreadsheet_id, &format!("{range}:append"))?;
        url.query_pairs_mut()
            .append_pair("valueInputOption", "RAW")
            .append_pair("insertDataOption", "INSERT_ROWS");
        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.access_token)
            .json(&json!({ "majorDimension": "ROWS", "values": rows }))
            .send()
            .await?;
        self.checked(resp, &range).await?;
        debug!(tab, rows = rows.len(), "appended rows");
        Ok(())
    }

    async fn ensure_header(
        &self,
        spreadsheet_id: &str,
        tab: &str,
        header: &str,
    ) -> Result<u32, TableError> {
        let headers = match self.get_row(spreadsheet_id, tab, 1).await {
            Ok(headers) => headers,
            Err(TableError::TabUnavailable(_)) => return Ok(0),
            Err(err) => return Err(err),
        };
        let existing = HeaderIndex::new(&headers).column(header);
        if existing > 0 {
            return Ok(existing);
        }
        let col = headers.len() as u32 + 1;
        self.set_cell(spreadsheet_id, tab, 1, col, header.trim())
            .await?;
        Ok(col)
    }

    async fn set_cell(
        &self,
        spreadsheet_id: &str,
        tab: &str,
        row: u32,
        col: u32,
        value: &str,
    ) -> Result<(), TableError> {
        let range = quoted_range(tab, &format!("{}{row}", column_letters(col)));
        let mut url = self.values_url(spreadsheet_id, &range)?;
        url.query_pairs_mut().append_pair("valueInputOption", "RAW");
        let resp = self
            .client
            .put(url)
            .bearer_auth(&self.access_token)
            .json(&json!({ "range": range, "majorDimension": "ROWS", "values": [[value]] }))
            .send()
            .await?;
        self.checked(resp, &range).await?;
        Ok(())
    }
}
