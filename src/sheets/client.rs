//! Smartsheet API client
//!
//! Rate-limited, retrying HTTP client for the Smartsheet REST API. The
//! `SheetService` trait is the seam the sync engine talks to, so the engine
//! can run against the in-memory implementation in tests.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rand::Rng;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::sleep;

use super::model::{
    ApiResult, BatchReport, CellHistory, ChunkFailure, ColumnId, FolderContents, FolderId,
    IndexResult, Row, RowId, RowUpdate, Sheet, SheetId, WorkspaceId, WriteMode,
    MAX_ROWS_PER_REQUEST,
};
use crate::config::ClientConfig;
use crate::error::{Result, SyncError};
use crate::util::chunks;

/// Environment variable carrying the API bearer token.
pub const ACCESS_TOKEN_VAR: &str = "SMARTSHEET_ACCESS_TOKEN";

/// Operations the sync engine needs from the spreadsheet service.
#[async_trait]
pub trait SheetService: Send + Sync {
    /// Fetch a sheet; with `modified_since`, only rows modified at or after it.
    async fn get_sheet(
        &self,
        sheet_id: SheetId,
        modified_since: Option<DateTime<Utc>>,
    ) -> Result<Sheet>;

    async fn get_row(&self, sheet_id: SheetId, row_id: RowId) -> Result<Row>;

    /// Most recent modification records of a cell, newest first.
    async fn get_cell_history(
        &self,
        sheet_id: SheetId,
        row_id: RowId,
        column_id: ColumnId,
        limit: usize,
    ) -> Result<Vec<CellHistory>>;

    async fn list_workspace(&self, workspace_id: WorkspaceId) -> Result<FolderContents>;

    async fn list_folder(&self, folder_id: FolderId) -> Result<FolderContents>;

    /// Send one request's worth of rows (at most `MAX_ROWS_PER_REQUEST`).
    async fn write_chunk(
        &self,
        sheet_id: SheetId,
        rows: &[RowUpdate],
        mode: WriteMode,
    ) -> Result<Vec<Row>>;

    /// Write `rows`, splitting into chunks of at most `MAX_ROWS_PER_REQUEST`.
    ///
    /// Each chunk is sent independently; a failed chunk is recorded in the
    /// report and the remaining chunks are still attempted.
    async fn write_rows(
        &self,
        sheet_id: SheetId,
        rows: &[RowUpdate],
        mode: WriteMode,
    ) -> Result<BatchReport> {
        let mut report = BatchReport::default();
        if rows.is_empty() {
            return Ok(report);
        }

        let parts: Vec<&[RowUpdate]> = if rows.len() > MAX_ROWS_PER_REQUEST {
            chunks(rows, MAX_ROWS_PER_REQUEST)?
        } else {
            vec![rows]
        };

        let mut offset = 0;
        for part in parts {
            let range = offset..offset + part.len();
            offset += part.len();
            match self.write_chunk(sheet_id, part, mode).await {
                Ok(mut written) => report.written.append(&mut written),
                Err(error) => {
                    tracing::warn!(
                        sheet_id,
                        rows = part.len(),
                        kind = %error.kind(),
                        error = %error,
                        "Row batch chunk rejected"
                    );
                    report.failures.push(ChunkFailure { range, error });
                }
            }
        }

        Ok(report)
    }
}

/// Bounded exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (0-based), without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    fn delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(wait) = retry_after {
            return wait.min(self.max_backoff);
        }
        let base = self.backoff(attempt);
        let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 4);
        base + Duration::from_millis(jitter_ms)
    }
}

impl From<&ClientConfig> for RetryPolicy {
    fn from(config: &ClientConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_backoff: Duration::from_millis(config.base_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

pub struct SmartsheetClient {
    http: Client,
    api_base: String,
    token: String,
    retry: RetryPolicy,
    permits: Semaphore,
    min_interval: Duration,
    last_request: Mutex<Instant>,
}

impl SmartsheetClient {
    /// Create a client using the token from `SMARTSHEET_ACCESS_TOKEN`
    pub fn from_env(config: &ClientConfig) -> Result<Self> {
        let token = std::env::var(ACCESS_TOKEN_VAR).map_err(|_| {
            SyncError::configuration(format!("{} environment variable not set", ACCESS_TOKEN_VAR))
        })?;
        Self::new(config, token)
    }

    pub fn new(config: &ClientConfig, token: String) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| SyncError::configuration(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            token,
            retry: RetryPolicy::from(config),
            permits: Semaphore::new(config.max_concurrent_requests.max(1)),
            min_interval: Duration::from_millis(config.min_request_interval_ms),
            last_request: Mutex::new(Instant::now()),
        })
    }

    /// Enforce spacing between requests
    async fn rate_limit(&self) {
        let mut last = self.last_request.lock().await;
        let elapsed = last.elapsed();
        if elapsed < self.min_interval {
            sleep(self.min_interval - elapsed).await;
        }
        *last = Instant::now();
    }

    /// Issue a request, retrying transient failures and rate limiting.
    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&serde_json::Value>,
    ) -> Result<T> {
        let mut attempt = 0;
        loop {
            match self.send_once(method.clone(), path, query, body).await {
                Err(err) if err.kind().is_retryable() && attempt < self.retry.max_retries => {
                    let retry_after = match &err {
                        SyncError::RateLimited { retry_after } => *retry_after,
                        _ => None,
                    };
                    let delay = self.retry.delay(attempt, retry_after);
                    tracing::warn!(
                        path,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying sheet service request"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn send_once<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&serde_json::Value>,
    ) -> Result<T> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| SyncError::transient("request pool closed"))?;
        self.rate_limit().await;

        let url = format!("{}{}", self.api_base, path);
        let mut request = self
            .http
            .request(method, &url)
            .bearer_auth(&self.token)
            .header("Accept", "application/json")
            .query(query);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::from_status(status.as_u16(), path, &body, retry_after));
        }
        if status == StatusCode::NO_CONTENT {
            return Err(SyncError::Permanent {
                status: status.as_u16(),
                message: format!("{} returned no content", path),
            });
        }

        Ok(response.json().await?)
    }
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[async_trait]
impl SheetService for SmartsheetClient {
    async fn get_sheet(
        &self,
        sheet_id: SheetId,
        modified_since: Option<DateTime<Utc>>,
    ) -> Result<Sheet> {
        let mut query = vec![("include", "objectValue".to_string())];
        if let Some(since) = modified_since {
            query.push((
                "rowsModifiedSince",
                since.to_rfc3339_opts(SecondsFormat::Secs, true),
            ));
        }
        self.request(Method::GET, &format!("/sheets/{}", sheet_id), &query, None)
            .await
    }

    async fn get_row(&self, sheet_id: SheetId, row_id: RowId) -> Result<Row> {
        self.request(
            Method::GET,
            &format!("/sheets/{}/rows/{}", sheet_id, row_id),
            &[("include", "objectValue".to_string())],
            None,
        )
        .await
    }

    async fn get_cell_history(
        &self,
        sheet_id: SheetId,
        row_id: RowId,
        column_id: ColumnId,
        limit: usize,
    ) -> Result<Vec<CellHistory>> {
        let page: IndexResult<CellHistory> = self
            .request(
                Method::GET,
                &format!(
                    "/sheets/{}/rows/{}/columns/{}/history",
                    sheet_id, row_id, column_id
                ),
                &[
                    ("include", "objectValue".to_string()),
                    ("pageSize", limit.max(1).to_string()),
                    ("page", "1".to_string()),
                ],
                None,
            )
            .await?;
        Ok(page.data)
    }

    async fn list_workspace(&self, workspace_id: WorkspaceId) -> Result<FolderContents> {
        self.request(
            Method::GET,
            &format!("/workspaces/{}", workspace_id),
            &[],
            None,
        )
        .await
    }

    async fn list_folder(&self, folder_id: FolderId) -> Result<FolderContents> {
        self.request(Method::GET, &format!("/folders/{}", folder_id), &[], None)
            .await
    }

    async fn write_chunk(
        &self,
        sheet_id: SheetId,
        rows: &[RowUpdate],
        mode: WriteMode,
    ) -> Result<Vec<Row>> {
        let method = match mode {
            WriteMode::Add => Method::POST,
            WriteMode::Update => Method::PUT,
        };
        let body = serde_json::to_value(rows)?;
        let result: ApiResult<Vec<Row>> = self
            .request(method, &format!("/sheets/{}/rows", sheet_id), &[], Some(&body))
            .await?;
        tracing::debug!(
            sheet_id,
            rows = rows.len(),
            mode = ?mode,
            message = %result.message,
            "Rows written"
        );
        Ok(result.result)
    }
}
