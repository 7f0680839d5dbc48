//! Paced HTTP fetching and the table backends (CSV file, Google Sheets) that
//! reconciled rows are persisted to.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "reelsync-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Retry schedule for rate-limited and flaky endpoints.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub growth_factor: f64,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            growth_factor: 2.0,
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Jikan answers 429 readily; back off hard and give up at the 24s ceiling.
    pub fn rate_limited_catalog() -> Self {
        Self {
            max_retries: 4,
            base_delay: Duration::from_millis(1500),
            growth_factor: 2.0,
            max_delay: Duration::from_secs(24),
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let exponent = i32::try_from(attempt_index).unwrap_or(i32::MAX);
        let factor = self.growth_factor.max(1.0).powi(exponent);
        let millis = (self.base_delay.as_millis() as f64 * factor).min(self.max_delay.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }
}

/// Enforces a minimum delay between consecutive calls.
#[derive(Debug)]
pub struct RequestPacer {
    min_interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_call: Mutex::new(None),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub async fn wait(&self) {
        let mut last_call = self.last_call.lock().await;
        if let Some(previous) = *last_call {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last_call = Some(Instant::now());
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    pub min_interval: Option<Duration>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            min_interval: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub json: Option<JsonValue>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            headers: Vec::new(),
            json: None,
        }
    }

    pub fn post_json(url: impl Into<String>, body: JsonValue) -> Self {
        Self {
            method: Method::POST,
            url: url.into(),
            headers: Vec::new(),
            json: Some(body),
        }
    }

    pub fn put_json(url: impl Into<String>, body: JsonValue) -> Self {
        Self {
            method: Method::PUT,
            ..Self::post_json(url, body)
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn bearer(self, token: &str) -> Self {
        self.header("authorization", format!("Bearer {token}"))
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, FetchError> {
        serde_json::from_slice(&self.body).map_err(|source| FetchError::Decode {
            url: loggable_url(&self.final_url).to_string(),
            source,
        })
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("invalid JSON from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status, .. } => Some(*status),
            FetchError::Request(err) => err.status().map(|s| s.as_u16()),
            FetchError::Decode { .. } => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    pub fn is_access_denied(&self) -> bool {
        matches!(self.status(), Some(401 | 403))
    }
}

/// A reqwest client with pacing and retry. Each upstream API gets its own
/// fetcher so pacing is per service.
#[derive(Debug)]
pub struct HttpFetcher {
    service: &'static str,
    client: reqwest::Client,
    pacer: Option<RequestPacer>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(service: &'static str, config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            service,
            client,
            pacer: config.min_interval.map(RequestPacer::new),
            backoff: config.backoff,
        })
    }

    pub fn service(&self) -> &'static str {
        self.service
    }

    pub async fn send(&self, request: &HttpRequest) -> Result<FetchedResponse, FetchError> {
        let span = info_span!(
            "http_fetch",
            service = self.service,
            method = %request.method,
            url = loggable_url(&request.url)
        );
        self.send_with_retries(request).instrument(span).await
    }

    pub async fn send_json<T: DeserializeOwned>(&self, request: &HttpRequest) -> Result<T, FetchError> {
        self.send(request).await?.json()
    }

    async fn send_with_retries(&self, request: &HttpRequest) -> Result<FetchedResponse, FetchError> {
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            if let Some(pacer) = &self.pacer {
                pacer.wait().await;
            }

            let mut builder = self.client.request(request.method.clone(), &request.url);
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if let Some(body) = &request.json {
                builder = builder.json(body);
            }

            match builder.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp
                            .bytes()
                            .await
                            .map_err(|e| FetchError::Request(e.without_url()))?
                            .to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    let disposition = classify_status(status);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        warn!(status = status.as_u16(), attempt, ?delay, "retryable status, backing off");
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    let body = resp.text().await.unwrap_or_default();
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: loggable_url(&final_url).to_string(),
                        body,
                    });
                }
                Err(err) => {
                    let disposition = classify_reqwest_error(&err);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        debug!(error = %err, attempt, ?delay, "request error, backing off");
                        last_request_error = Some(err);
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(FetchError::Request(err.without_url()));
                }
            }
        }

        match last_request_error {
            Some(err) => Err(FetchError::Request(err.without_url())),
            None => Err(FetchError::HttpStatus {
                status: 0,
                url: loggable_url(&request.url).to_string(),
                body: "retry budget exhausted".to_string(),
            }),
        }
    }
}

/// Query strings can carry API keys, so spans only record the path.
pub fn loggable_url(url: &str) -> &str {
    url.split_once('?').map_or(url, |(path, _)| path)
}

/// A single cell write; `row` counts the header as row 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellUpdate {
    pub row: usize,
    pub column: usize,
    pub value: String,
}

/// Row-oriented destination for reconciled records. The first row, when
/// present, is the header.
#[async_trait]
pub trait TableStore: Send + Sync {
    fn describe(&self) -> String;

    /// Id the backend assigned to this destination, if any. Changes once a
    /// write creates the destination.
    fn resource_id(&self) -> Option<String> {
        None
    }

    /// Whether image cells should be written as `=IMAGE()` formulas.
    fn formats_images(&self) -> bool {
        false
    }

    async fn exists(&self) -> anyhow::Result<bool>;

    async fn read(&self) -> anyhow::Result<Vec<Vec<String>>>;

    async fn append(&mut self, rows: &[Vec<String>]) -> anyhow::Result<()>;

    async fn overwrite(&mut self, rows: &[Vec<String>]) -> anyhow::Result<()>;

    async fn delete_rows(&mut self, indexes: &BTreeSet<usize>) -> anyhow::Result<()> {
        let rows = self.read().await?;
        let kept: Vec<Vec<String>> = rows
            .into_iter()
            .enumerate()
            .filter(|(i, _)| !indexes.contains(i))
            .map(|(_, row)| row)
            .collect();
        self.overwrite(&kept).await
    }

    async fn update_cells(&mut self, updates: &[CellUpdate]) -> anyhow::Result<()> {
        let mut rows = self.read().await?;
        for update in updates {
            let Some(row) = rows.get_mut(update.row) else {
                continue;
            };
            if row.len() <= update.column {
                row.resize(update.column + 1, String::new());
            }
            row[update.column] = update.value.clone();
        }
        self.overwrite(&rows).await
    }
}

/// Flat CSV file. Row deletion and cell updates rewrite the whole file.
#[derive(Debug, Clone)]
pub struct CsvTable {
    path: PathBuf,
}

impl CsvTable {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `DiscordMovies` becomes `DiscordMovies.csv`; names already ending in `.csv` are kept.
    pub fn for_name(name: &str) -> Self {
        if name.ends_with(".csv") {
            Self::new(name)
        } else {
            Self::new(format!("{name}.csv"))
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn encode(rows: &[Vec<String>]) -> anyhow::Result<Vec<u8>> {
        let mut writer = csv::WriterBuilder::new()
            .flexible(true)
            .from_writer(Vec::new());
        for row in rows {
            writer.write_record(row).context("encoding csv row")?;
        }
        writer
            .into_inner()
            .map_err(|e| anyhow::anyhow!("flushing csv buffer: {e}"))
    }

    /// Write via a temp file and rename so readers never see a half-written table.
    async fn write_atomically(&self, bytes: &[u8]) -> anyhow::Result<()> {
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming {} -> {}",
                    temp_path.display(),
                    self.path.display()
                )
            });
        }
        Ok(())
    }
}

#[async_trait]
impl TableStore for CsvTable {
    fn describe(&self) -> String {
        format!("csv file {}", self.path.display())
    }

    async fn exists(&self) -> anyhow::Result<bool> {
        fs::try_exists(&self.path)
            .await
            .with_context(|| format!("checking {}", self.path.display()))
    }

    async fn read(&self) -> anyhow::Result<Vec<Vec<String>>> {
        if !self.exists().await? {
            return Ok(Vec::new());
        }
        let bytes = fs::read(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(bytes.as_slice());
        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.with_context(|| format!("parsing {}", self.path.display()))?;
            rows.push(record.iter().map(ToString::to_string).collect());
        }
        Ok(rows)
    }

    async fn append(&mut self, rows: &[Vec<String>]) -> anyhow::Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        if !self.exists().await? {
            return self.overwrite(rows).await;
        }
        let bytes = Self::encode(rows)?;
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("opening {} for append", self.path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("appending to {}", self.path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing {}", self.path.display()))?;
        debug!(path = %self.path.display(), rows = rows.len(), "appended csv rows");
        Ok(())
    }

    async fn overwrite(&mut self, rows: &[Vec<String>]) -> anyhow::Result<()> {
        let bytes = Self::encode(rows)?;
        self.write_atomically(&bytes).await?;
        debug!(path = %self.path.display(), rows = rows.len(), "rewrote csv file");
        Ok(())
    }
}

pub const SHEETS_API_BASE: &str = "https://sheets.googleapis.com/v4/spreadsheets";

#[derive(Debug, Clone)]
pub struct SheetsConfig {
    pub spreadsheet_id: Option<String>,
    pub access_token: String,
    /// Title used when a new spreadsheet has to be created.
    pub title: String,
    pub sheet_name: String,
    /// Numeric sheet id (`gid`) used for row deletion.
    pub sheet_gid: i64,
}

impl SheetsConfig {
    pub fn new(spreadsheet_id: Option<String>, access_token: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            spreadsheet_id,
            access_token: access_token.into(),
            title: title.into(),
            sheet_name: "Sheet1".to_string(),
            sheet_gid: 0,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<JsonValue>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedSpreadsheet {
    spreadsheet_id: String,
}

/// Google Sheets v4 backend. Takes a ready OAuth bearer token.
#[derive(Debug)]
pub struct SheetsTable {
    http: HttpFetcher,
    api_base: String,
    config: SheetsConfig,
}

impl SheetsTable {
    pub fn new(http: HttpFetcher, config: SheetsConfig) -> Self {
        Self {
            http,
            api_base: SHEETS_API_BASE.to_string(),
            config,
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    pub fn spreadsheet_id(&self) -> Option<&str> {
        self.config.spreadsheet_id.as_deref()
    }

    fn full_range(&self) -> String {
        encode_range(&format!("{}!A:Z", self.config.sheet_name))
    }

    fn cell_range(&self, row: usize, column: usize) -> String {
        format!("{}!{}{}", self.config.sheet_name, column_letter(column), row + 1)
    }

    fn spreadsheet_url(&self, id: &str) -> String {
        format!("{}/{}", self.api_base, id)
    }

    async fn ensure_spreadsheet(&mut self) -> anyhow::Result<String> {
        if let Some(id) = &self.config.spreadsheet_id {
            return Ok(id.clone());
        }
        let request = HttpRequest::post_json(
            self.api_base.clone(),
            json!({ "properties": { "title": self.config.title } }),
        )
        .bearer(&self.config.access_token);
        let created: CreatedSpreadsheet = self
            .http
            .send_json(&request)
            .await
            .context("creating spreadsheet")?;
        info!(spreadsheet_id = %created.spreadsheet_id, title = %self.config.title, "created spreadsheet");
        self.config.spreadsheet_id = Some(created.spreadsheet_id.clone());
        Ok(created.spreadsheet_id)
    }

    fn require_id(&self) -> anyhow::Result<&str> {
        self.config
            .spreadsheet_id
            .as_deref()
            .context("no spreadsheet id configured")
    }
}

#[async_trait]
impl TableStore for SheetsTable {
    fn describe(&self) -> String {
        match &self.config.spreadsheet_id {
            Some(id) => format!("spreadsheet {id}"),
            None => format!("new spreadsheet \"{}\"", self.config.title),
        }
    }

    fn formats_images(&self) -> bool {
        true
    }

    fn resource_id(&self) -> Option<String> {
        self.config.spreadsheet_id.clone()
    }

    async fn exists(&self) -> anyhow::Result<bool> {
        let Some(id) = self.config.spreadsheet_id.as_deref() else {
            return Ok(false);
        };
        let request = HttpRequest::get(format!("{}?fields=spreadsheetId", self.spreadsheet_url(id)))
            .bearer(&self.config.access_token);
        match self.http.send(&request).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => {
                warn!(spreadsheet_id = id, "spreadsheet id configured but not found");
                Ok(false)
            }
            Err(err) => Err(err).with_context(|| format!("checking spreadsheet {id}")),
        }
    }

    async fn read(&self) -> anyhow::Result<Vec<Vec<String>>> {
        if !self.exists().await? {
            return Ok(Vec::new());
        }
        let id = self.require_id()?;
        let request = HttpRequest::get(format!(
            "{}/values/{}?valueRenderOption=FORMULA",
            self.spreadsheet_url(id),
            self.full_range()
        ))
        .bearer(&self.config.access_token);
        let range: ValueRange = self
            .http
            .send_json(&request)
            .await
            .with_context(|| format!("reading values of spreadsheet {id}"))?;
        Ok(range
            .values
            .into_iter()
            .map(|row| row.iter().map(cell_to_string).collect())
            .collect())
    }

    async fn append(&mut self, rows: &[Vec<String>]) -> anyhow::Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let id = self.ensure_spreadsheet().await?;
        let request = HttpRequest::post_json(
            format!(
                "{}/values/{}:append?valueInputOption=USER_ENTERED&insertDataOption=INSERT_ROWS",
                self.spreadsheet_url(&id),
                self.full_range()
            ),
            json!({ "values": rows }),
        )
        .bearer(&self.config.access_token);
        self.http
            .send(&request)
            .await
            .with_context(|| format!("appending rows to spreadsheet {id}"))?;
        info!(spreadsheet_id = %id, rows = rows.len(), "appended rows");
        Ok(())
    }

    async fn overwrite(&mut self, rows: &[Vec<String>]) -> anyhow::Result<()> {
        let id = self.ensure_spreadsheet().await?;
        let clear = HttpRequest::post_json(
            format!("{}/values/{}:clear", self.spreadsheet_url(&id), self.full_range()),
            json!({}),
        )
        .bearer(&self.config.access_token);
        self.http
            .send(&clear)
            .await
            .with_context(|| format!("clearing spreadsheet {id}"))?;

        if rows.is_empty() {
            return Ok(());
        }
        let start = encode_range(&format!("{}!A1", self.config.sheet_name));
        let update = HttpRequest::put_json(
            format!(
                "{}/values/{}?valueInputOption=USER_ENTERED",
                self.spreadsheet_url(&id),
                start
            ),
            json!({ "majorDimension": "ROWS", "values": rows }),
        )
        .bearer(&self.config.access_token);
        self.http
            .send(&update)
            .await
            .with_context(|| format!("writing rows to spreadsheet {id}"))?;
        info!(spreadsheet_id = %id, rows = rows.len(), "rewrote spreadsheet");
        Ok(())
    }

    async fn delete_rows(&mut self, indexes: &BTreeSet<usize>) -> anyhow::Result<()> {
        if indexes.is_empty() {
            return Ok(());
        }
        let id = self.require_id()?.to_string();
        // Highest rows first so earlier deletions do not shift later ones.
        let requests: Vec<JsonValue> = indexes
            .iter()
            .rev()
            .map(|row| {
                json!({
                    "deleteDimension": {
                        "range": {
                            "sheetId": self.config.sheet_gid,
                            "dimension": "ROWS",
                            "startIndex": row,
                            "endIndex": row + 1,
                        }
                    }
                })
            })
            .collect();
        let request = HttpRequest::post_json(
            format!("{}:batchUpdate", self.spreadsheet_url(&id)),
            json!({ "requests": requests }),
        )
        .bearer(&self.config.access_token);
        self.http
            .send(&request)
            .await
            .with_context(|| format!("deleting rows from spreadsheet {id}"))?;
        info!(spreadsheet_id = %id, rows = indexes.len(), "deleted rows");
        Ok(())
    }

    async fn update_cells(&mut self, updates: &[CellUpdate]) -> anyhow::Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let id = self.require_id()?.to_string();
        let data: Vec<JsonValue> = updates
            .iter()
            .map(|u| json!({ "range": self.cell_range(u.row, u.column), "values": [[u.value]] }))
            .collect();
        let request = HttpRequest::post_json(
            format!("{}/values:batchUpdate", self.spreadsheet_url(&id)),
            json!({ "valueInputOption": "USER_ENTERED", "data": data }),
        )
        .bearer(&self.config.access_token);
        self.http
            .send(&request)
            .await
            .with_context(|| format!("updating cells of spreadsheet {id}"))?;
        Ok(())
    }
}

/// Zero-based column index to A1 letters: 0 -> A, 25 -> Z, 26 -> AA.
pub fn column_letter(index: usize) -> String {
    let mut n = index + 1;
    let mut letters = Vec::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        letters.push((b'A' + rem as u8) as char);
        n = (n - 1) / 26;
    }
    letters.iter().rev().collect()
}

fn encode_range(range: &str) -> String {
    range.replace(' ', "%20")
}

/// Sheets returns typed cells; booleans come back as TRUE/FALSE.
fn cell_to_string(cell: &JsonValue) -> String {
    match cell {
        JsonValue::String(s) => s.clone(),
        JsonValue::Bool(true) => "TRUE".to_string(),
        JsonValue::Bool(false) => "FALSE".to_string(),
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};
    use tempfile::tempdir;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Reads one request, body included, and returns its head.
    async fn read_request(stream: &mut tokio::net::TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&buf[..end]).to_string();
                let body_len = head
                    .lines()
                    .filter_map(|line| line.split_once(':'))
                    .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
                    .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= end + 4 + body_len {
                    return head;
                }
            }
            let n = stream.read(&mut chunk).await.unwrap();
            if n == 0 {
                return String::from_utf8_lossy(&buf).to_string();
            }
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Answers one connection per queued `(status, body)` and keeps each
    /// request head it saw.
    async fn scripted_server(responses: Vec<(u16, String)>) -> (String, Arc<StdMutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let log = seen.clone();
        tokio::spawn(async move {
            for (status, body) in responses {
                let (mut stream, _) = listener.accept().await.unwrap();
                let head = read_request(&mut stream).await;
                log.lock().unwrap().push(head);
                let reply = format!(
                    "HTTP/1.1 {status} Scripted\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                stream.write_all(reply.as_bytes()).await.unwrap();
                let _ = stream.shutdown().await;
            }
        });
        (base, seen)
    }

    fn rows(data: &[&[&str]]) -> Vec<Vec<String>> {
        data.iter()
            .map(|r| r.iter().map(|c| c.to_string()).collect())
            .collect()
    }

    #[test]
    fn backoff_grows_geometrically_and_is_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            growth_factor: 3.0,
            max_delay: Duration::from_millis(1000),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(300));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(900));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(50), Duration::from_millis(1000));
    }

    #[test]
    fn catalog_backoff_stays_under_ceiling() {
        let policy = BackoffPolicy::rate_limited_catalog();
        let total: Duration = (0..policy.max_retries)
            .map(|a| policy.delay_for_attempt(a))
            .sum();
        assert!(policy.delay_for_attempt(10) <= Duration::from_secs(24));
        assert!(total >= Duration::from_secs(20));
    }

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), RetryDisposition::NonRetryable);
    }

    #[test]
    fn fetch_error_status_helpers() {
        let not_found = FetchError::HttpStatus {
            status: 404,
            url: "u".into(),
            body: String::new(),
        };
        let denied = FetchError::HttpStatus {
            status: 403,
            url: "u".into(),
            body: String::new(),
        };
        assert!(not_found.is_not_found());
        assert!(!not_found.is_access_denied());
        assert!(denied.is_access_denied());
    }

    #[tokio::test]
    async fn pacer_spaces_out_calls() {
        let pacer = RequestPacer::new(Duration::from_millis(40));
        let started = Instant::now();
        pacer.wait().await;
        pacer.wait().await;
        pacer.wait().await;
        assert!(started.elapsed() >= Duration::from_millis(80));
    }

    #[test]
    fn logged_urls_drop_query_strings() {
        assert_eq!(
            loggable_url("https://api.themoviedb.org/3/find/tt1?api_key=secret"),
            "https://api.themoviedb.org/3/find/tt1"
        );
        assert_eq!(loggable_url("https://api.jikan.moe/v4/anime/1"), "https://api.jikan.moe/v4/anime/1");
    }

    #[test]
    fn column_letters() {
        assert_eq!(column_letter(0), "A");
        assert_eq!(column_letter(11), "L");
        assert_eq!(column_letter(25), "Z");
        assert_eq!(column_letter(26), "AA");
        assert_eq!(column_letter(27), "AB");
    }

    #[test]
    fn sheet_cells_become_strings() {
        assert_eq!(cell_to_string(&json!("Heat")), "Heat");
        assert_eq!(cell_to_string(&json!(true)), "TRUE");
        assert_eq!(cell_to_string(&json!(8.5)), "8.5");
        assert_eq!(cell_to_string(&JsonValue::Null), "");
    }

    #[test]
    fn csv_name_gets_extension_once() {
        assert_eq!(CsvTable::for_name("DiscordMovies").path(), Path::new("DiscordMovies.csv"));
        assert_eq!(CsvTable::for_name("movies.csv").path(), Path::new("movies.csv"));
    }

    #[tokio::test]
    async fn csv_table_roundtrips_multiline_cells() {
        let dir = tempdir().expect("tempdir");
        let mut table = CsvTable::new(dir.path().join("movies.csv"));
        assert!(!table.exists().await.unwrap());
        assert!(table.read().await.unwrap().is_empty());

        let initial = rows(&[&["Title", "Link", "User"], &["Heat", "https://a", "alice\nbob"]]);
        table.overwrite(&initial).await.unwrap();
        assert!(table.exists().await.unwrap());
        assert_eq!(table.read().await.unwrap(), initial);

        table
            .append(&rows(&[&["Alien", "https://b", "carol"]]))
            .await
            .unwrap();
        let read = table.read().await.unwrap();
        assert_eq!(read.len(), 3);
        assert_eq!(read[2], vec!["Alien", "https://b", "carol"]);
    }

    #[tokio::test]
    async fn csv_append_creates_missing_file() {
        let dir = tempdir().expect("tempdir");
        let mut table = CsvTable::new(dir.path().join("nested").join("new.csv"));
        table.append(&rows(&[&["Title", "Link"]])).await.unwrap();
        assert_eq!(table.read().await.unwrap(), rows(&[&["Title", "Link"]]));
    }

    #[tokio::test]
    async fn csv_delete_and_update_rewrite_file() {
        let dir = tempdir().expect("tempdir");
        let mut table = CsvTable::new(dir.path().join("movies.csv"));
        table
            .overwrite(&rows(&[
                &["Title", "Link", "Watched"],
                &["Heat", "https://a", "False"],
                &["Alien", "https://b", "False"],
                &["Ran", "https://c", "False"],
            ]))
            .await
            .unwrap();

        table.delete_rows(&BTreeSet::from([2])).await.unwrap();
        table
            .update_cells(&[CellUpdate {
                row: 2,
                column: 2,
                value: "True".into(),
            }])
            .await
            .unwrap();

        assert_eq!(
            table.read().await.unwrap(),
            rows(&[
                &["Title", "Link", "Watched"],
                &["Heat", "https://a", "False"],
                &["Ran", "https://c", "True"],
            ])
        );
    }

    #[tokio::test]
    async fn sheets_without_id_does_not_exist() {
        let http = HttpFetcher::new("sheets", HttpClientConfig::default()).unwrap();
        let table = SheetsTable::new(http, SheetsConfig::new(None, "token", "DiscordMovies"));
        assert!(!table.exists().await.unwrap());
        assert!(table.read().await.unwrap().is_empty());
        assert!(table.formats_images());
        assert_eq!(table.describe(), "new spreadsheet \"DiscordMovies\"");
        assert_eq!(table.cell_range(4, 2), "Sheet1!C5");
        assert_eq!(table.resource_id(), None);
    }

    #[tokio::test]
    async fn creating_a_spreadsheet_records_its_id() {
        let (base, seen) = scripted_server(vec![
            (200, r#"{"spreadsheetId":"sheet-42"}"#.to_string()),
            (200, "{}".to_string()),
            (200, "{}".to_string()),
        ])
        .await;
        let http = HttpFetcher::new("sheets", HttpClientConfig::default()).unwrap();
        let mut table =
            SheetsTable::new(http, SheetsConfig::new(None, "token", "DiscordMovies")).with_api_base(base);

        table.overwrite(&rows(&[&["Title", "Link"], &["Heat", "l"]])).await.unwrap();

        assert_eq!(table.resource_id().as_deref(), Some("sheet-42"));
        assert_eq!(table.describe(), "spreadsheet sheet-42");
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert!(seen[0].starts_with("POST / "), "{}", seen[0]);
        assert!(seen[1].starts_with("POST /sheet-42/values/"), "{}", seen[1]);
        assert!(seen[2].starts_with("PUT /sheet-42/values/"), "{}", seen[2]);
    }
}
