//! Remote tabular store access.
//!
//! The fetch layer only talks to [`RemoteStore`]; [`PostgrestStore`] is the
//! Supabase/PostgREST implementation used by the binary.

use crate::config::RemoteConfig;
use crate::error::{FetchError, Result};
use crate::types::{BoundingBox, Row};
use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode};
use serde_json::{json, Value};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Server-side row filter on a categorical column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnFilter {
    Eq { column: String, value: String },
    In { column: String, values: Vec<String> },
}

impl ColumnFilter {
    fn to_param(&self) -> (String, String) {
        match self {
            ColumnFilter::Eq { column, value } => (column.clone(), format!("eq.{}", value)),
            ColumnFilter::In { column, values } => {
                let quoted: Vec<String> = values
                    .iter()
                    .map(|v| format!("\"{}\"", v.replace('"', "\\\"")))
                    .collect();
                (column.clone(), format!("in.({})", quoted.join(",")))
            }
        }
    }
}

/// A read against the census table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableQuery {
    pub select: String,
    pub filter: Option<ColumnFilter>,
    pub order: Option<String>,
}

impl TableQuery {
    pub fn all() -> Self {
        Self {
            select: "*".to_string(),
            filter: None,
            order: None,
        }
    }

    pub fn columns(columns: &[&str]) -> Self {
        Self {
            select: columns.join(","),
            ..Self::all()
        }
    }

    pub fn filtered(mut self, filter: ColumnFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn ordered_by(mut self, column: &str) -> Self {
        self.order = Some(column.to_string());
        self
    }

    fn to_params(&self, range: PageRange) -> Vec<(String, String)> {
        let mut params = vec![("select".to_string(), self.select.clone())];
        if let Some(filter) = &self.filter {
            params.push(filter.to_param());
        }
        if let Some(order) = &self.order {
            params.push(("order".to_string(), format!("{}.asc", order)));
        }
        params.extend(range.to_params());
        params
    }
}

/// Inclusive row window `[offset, offset + limit - 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRange {
    pub offset: usize,
    pub limit: usize,
}

impl PageRange {
    pub fn page(index: usize, size: usize) -> Self {
        Self {
            offset: index * size,
            limit: size,
        }
    }

    pub fn last(&self) -> usize {
        self.offset + self.limit.saturating_sub(1)
    }

    fn to_params(self) -> [(String, String); 2] {
        [
            ("offset".to_string(), self.offset.to_string()),
            ("limit".to_string(), self.limit.to_string()),
        ]
    }
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// One page of rows matching `query`.
    async fn select(&self, query: &TableQuery, range: PageRange) -> Result<Vec<Row>>;

    /// One page of rows intersecting `bounds`, via the spatial procedure.
    ///
    /// Stores without that procedure return [`FetchError::UnsupportedOperation`].
    async fn rows_in_bounds(&self, bounds: &BoundingBox, range: PageRange) -> Result<Vec<Row>>;
}

/// Bounded exponential backoff for transient request failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_backoff: Duration) -> Self {
        Self {
            max_retries,
            base_backoff,
            max_backoff: Duration::from_secs(10),
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_backoff.saturating_mul(factor).min(self.max_backoff)
    }

    pub async fn run<F, Fut, T>(&self, operation_name: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    let delay = self.backoff(attempt);
                    warn!(
                        "{} failed (attempt {}): {} - retrying in {:?}",
                        operation_name, attempt, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Supabase REST (PostgREST) store.
#[derive(Debug, Clone)]
pub struct PostgrestStore {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    table: String,
    bounds_rpc: String,
    retry: RetryPolicy,
}

impl PostgrestStore {
    pub fn new(config: &RemoteConfig, api_key: String) -> Result<Self> {
        if config.url.trim().is_empty() {
            return Err(FetchError::Config("remote.url is empty".to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key,
            table: config.table.clone(),
            bounds_rpc: config.bounds_rpc.clone(),
            retry: RetryPolicy::new(
                config.max_retries,
                Duration::from_millis(config.retry_backoff_ms),
            ),
        })
    }

    fn table_url(&self) -> String {
        format!("{}/rest/v1/{}", self.base_url, self.table)
    }

    fn rpc_url(&self) -> String {
        format!("{}/rest/v1/rpc/{}", self.base_url, self.bounds_rpc)
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }
}

#[async_trait]
impl RemoteStore for PostgrestStore {
    async fn select(&self, query: &TableQuery, range: PageRange) -> Result<Vec<Row>> {
        let params = &query.to_params(range);
        debug!("GET {} rows {}-{}", self.table, range.offset, range.last());
        self.retry
            .run("Page request", || async move {
                let response = self
                    .authorize(self.client.get(self.table_url()))
                    .query(&params)
                    .send()
                    .await?;
                let status = response.status();
                let body = response.text().await?;
                if !status.is_success() {
                    return Err(FetchError::Remote {
                        status: status.as_u16(),
                        message: body,
                    });
                }
                decode_rows(&body)
            })
            .await
    }

    async fn rows_in_bounds(&self, bounds: &BoundingBox, range: PageRange) -> Result<Vec<Row>> {
        let payload = &json!({
            "min_lng": bounds.min_lng,
            "min_lat": bounds.min_lat,
            "max_lng": bounds.max_lng,
            "max_lat": bounds.max_lat,
        });
        let params = &range.to_params();
        debug!("POST rpc/{} rows {}-{}", self.bounds_rpc, range.offset, range.last());
        self.retry
            .run("Bounds request", || async move {
                let response = self
                    .authorize(self.client.post(self.rpc_url()))
                    .query(params)
                    .json(payload)
                    .send()
                    .await?;
                let status = response.status();
                let body = response.text().await?;
                if status == StatusCode::NOT_FOUND {
                    return Err(FetchError::UnsupportedOperation(format!(
                        "rpc/{} is not available",
                        self.bounds_rpc
                    )));
                }
                if !status.is_success() {
                    return Err(FetchError::Remote {
                        status: status.as_u16(),
                        message: body,
                    });
                }
                decode_rows(&body)
            })
            .await
    }
}

/// Parses a response body into rows. A `null` or empty body is an empty page.
pub fn decode_rows(body: &str) -> Result<Vec<Row>> {
    if body.trim().is_empty() {
        return Ok(Vec::new());
    }
    let value: Value =
        serde_json::from_str(body).map_err(|e| FetchError::Decode(e.to_string()))?;
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => Ok(items
            .into_iter()
            .filter_map(|item| match item {
                Value::Object(row) => Some(row),
                _ => None,
            })
            .collect()),
        other => Err(FetchError::Decode(format!(
            "expected an array of rows, got {}",
            kind_of(&other)
        ))),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
