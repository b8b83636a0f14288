use crate::backend::decode::{self, TableRow, TableSchema};
use crate::backend::token::TokenSource;
use crate::backend::{
    Connector, DatasetSummary, QueryResult, ServiceAccountCredentials, TableMetadata,
    TableSummary, Warehouse,
};
use crate::error::BridgeError;
use crate::verbose::Timer;
use reqwest::{Client, Method, Url};
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

pub const DEFAULT_ENDPOINT: &str = "https://bigquery.googleapis.com/bigquery/v2";
pub const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// Upper bound on how long a single jobs.query / getQueryResults call may
/// block server-side. Shortened further when the query deadline is closer.
const SERVER_WAIT_MS: u64 = 10_000;
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Builds [`BigQueryClient`]s for the connect endpoint.
#[derive(Debug, Clone)]
pub struct BigQueryConnector {
    endpoint: String,
    token_uri: String,
    query_timeout_secs: u64,
    http: Client,
}

#[derive(Debug)]
pub struct BigQueryClient {
    project_id: String,
    endpoint: String,
    query_timeout_secs: u64,
    tokens: TokenSource,
    http: Client,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    query: &'a str,
    use_legacy_sql: bool,
    timeout_ms: u64,
    format_options: FormatOptions,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FormatOptions {
    use_int64_timestamp: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    job_reference: Option<JobReference>,
    job_complete: Option<bool>,
    schema: Option<TableSchema>,
    rows: Option<Vec<TableRow>>,
    page_token: Option<String>,
}

#[derive(Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
    location: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatasetListResponse {
    datasets: Option<Vec<DatasetEntry>>,
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatasetEntry {
    dataset_reference: DatasetReference,
    location: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatasetReference {
    dataset_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableListResponse {
    tables: Option<Vec<TableEntry>>,
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableEntry {
    table_reference: TableReference,
    #[serde(rename = "type")]
    table_type: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableReference {
    table_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableResource {
    schema: Option<TableSchema>,
    num_rows: Option<String>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: Option<ErrorDetail>,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: Option<String>,
}

impl BigQueryConnector {
    pub fn new(endpoint: String, token_uri: String, query_timeout_secs: u64) -> Self {
        Self {
            endpoint,
            token_uri,
            query_timeout_secs,
            http: Client::new(),
        }
    }
}

impl Connector for BigQueryConnector {
    type Warehouse = BigQueryClient;

    async fn connect(
        &self,
        credentials: ServiceAccountCredentials,
    ) -> Result<BigQueryClient, BridgeError> {
        let private_key = credentials.normalized_private_key();
        let tokens = TokenSource::new(
            credentials.client_email,
            &private_key,
            self.token_uri.clone(),
            self.http.clone(),
        )?;

        Ok(BigQueryClient {
            project_id: credentials.project_id,
            endpoint: self.endpoint.clone(),
            query_timeout_secs: self.query_timeout_secs,
            tokens,
            http: self.http.clone(),
        })
    }
}

impl BigQueryClient {
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn client_email(&self) -> &str {
        self.tokens.client_email()
    }

    fn url(&self, segments: &[&str]) -> Result<Url, BridgeError> {
        let mut url = Url::parse(&self.endpoint).map_err(|e| BridgeError::Config {
            message: format!("invalid BigQuery endpoint {}: {}", self.endpoint, e),
        })?;
        url.path_segments_mut()
            .map_err(|_| BridgeError::Config {
                message: format!("BigQuery endpoint cannot be a base URL: {}", self.endpoint),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send<B: Serialize, T: DeserializeOwned>(
        &self,
        method: Method,
        url: Url,
        params: &[(&str, String)],
        body: Option<&B>,
    ) -> Result<T, BridgeError> {
        let token = self.tokens.access_token().await?;
        let mut request = self
            .http
            .request(method, url)
            .bearer_auth(token.expose_secret())
            .query(params);
        if let Some(body) = body {
            request = request.json(body);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| BridgeError::upstream(format!("request to BigQuery failed: {}", e)))?;

        let status_code = resp.status();
        if !status_code.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::map_http_error(status_code.as_u16(), &body));
        }

        resp.json().await.map_err(|e| {
            BridgeError::upstream(format!("failed to parse BigQuery response: {}", e))
        })
    }

    async fn get<T: DeserializeOwned>(
        &self,
        url: Url,
        params: &[(&str, String)],
    ) -> Result<T, BridgeError> {
        self.send::<(), T>(Method::GET, url, params, None).await
    }

    /// The upstream message is passed through verbatim when BigQuery sends one.
    fn map_http_error(status: u16, body: &str) -> BridgeError {
        let message = serde_json::from_str::<ErrorEnvelope>(body)
            .ok()
            .and_then(|envelope| envelope.error)
            .and_then(|detail| detail.message)
            .unwrap_or_else(|| format!("HTTP error: {}", status));
        BridgeError::Upstream { message }
    }

    fn job_params(
        job: &JobReference,
        page_token: Option<&str>,
        wait_ms: u64,
    ) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("timeoutMs", wait_ms.to_string()),
            ("formatOptions.useInt64Timestamp", "true".to_string()),
        ];
        if let Some(location) = &job.location {
            params.push(("location", location.clone()));
        }
        if let Some(token) = page_token {
            params.push(("pageToken", token.to_string()));
        }
        params
    }

    async fn query_results(
        &self,
        job: &JobReference,
        page_token: Option<&str>,
        wait_ms: u64,
    ) -> Result<QueryResponse, BridgeError> {
        let url = self.url(&["projects", &self.project_id, "queries", &job.job_id])?;
        self.get(url, &Self::job_params(job, page_token, wait_ms)).await
    }

    /// Poll until the job completes; past `deadline` the job is cancelled.
    async fn poll_job(
        &self,
        job: &JobReference,
        deadline: Instant,
    ) -> Result<QueryResponse, BridgeError> {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.cancel_job(job).await;
                return Err(BridgeError::Timeout {
                    seconds: self.query_timeout_secs,
                });
            }

            let response = self.query_results(job, None, wait_ms(deadline)).await?;
            if response.job_complete.unwrap_or(false) {
                return Ok(response);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(POLL_INTERVAL.min(remaining)).await;
        }
    }

    async fn cancel_job(&self, job: &JobReference) {
        let url = match self.url(&["projects", &self.project_id, "jobs", &job.job_id, "cancel"]) {
            Ok(url) => url,
            Err(_) => return,
        };
        let mut params = Vec::new();
        if let Some(location) = &job.location {
            params.push(("location", location.clone()));
        }
        let cancelled: Result<serde_json::Value, BridgeError> = self
            .send::<(), _>(Method::POST, url, &params, None)
            .await;
        if let Err(e) = cancelled {
            tracing::warn!(job_id = %job.job_id, error = %e, "failed to cancel timed out query job");
        }
    }

    async fn list_datasets_page(
        &self,
        page_token: Option<&str>,
        max_results: Option<u32>,
    ) -> Result<DatasetListResponse, BridgeError> {
        let url = self.url(&["projects", &self.project_id, "datasets"])?;
        let mut params = Vec::new();
        if let Some(token) = page_token {
            params.push(("pageToken", token.to_string()));
        }
        if let Some(max) = max_results {
            params.push(("maxResults", max.to_string()));
        }
        self.get(url, &params).await
    }
}

/// Server-side wait for the next call, capped by what is left of `deadline`.
fn wait_ms(deadline: Instant) -> u64 {
    let remaining = deadline.saturating_duration_since(Instant::now());
    u64::try_from(remaining.as_millis())
        .unwrap_or(u64::MAX)
        .min(SERVER_WAIT_MS)
}

impl Warehouse for BigQueryClient {
    async fn verify(&self) -> Result<(), BridgeError> {
        self.list_datasets_page(None, Some(1)).await.map(|_| ())
    }

    async fn list_datasets(&self) -> Result<Vec<DatasetSummary>, BridgeError> {
        let timer = Timer::start();
        let mut datasets = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let page = self.list_datasets_page(page_token.as_deref(), None).await?;
            datasets.extend(page.datasets.unwrap_or_default().into_iter().map(|d| {
                DatasetSummary {
                    id: d.dataset_reference.dataset_id,
                    location: d.location,
                }
            }));
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        tracing::debug!(
            project_id = %self.project_id,
            count = datasets.len(),
            elapsed_ms = timer.elapsed_ms(),
            "listed datasets"
        );
        Ok(datasets)
    }

    async fn list_tables(&self, dataset_id: &str) -> Result<Vec<TableSummary>, BridgeError> {
        let timer = Timer::start();
        let url = self.url(&["projects", &self.project_id, "datasets", dataset_id, "tables"])?;
        let mut tables = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut params = Vec::new();
            if let Some(token) = &page_token {
                params.push(("pageToken", token.clone()));
            }
            let page: TableListResponse = self.get(url.clone(), &params).await?;
            tables.extend(page.tables.unwrap_or_default().into_iter().map(|t| TableSummary {
                id: t.table_reference.table_id,
                table_type: t.table_type,
            }));
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        tracing::debug!(
            dataset_id,
            count = tables.len(),
            elapsed_ms = timer.elapsed_ms(),
            "listed tables"
        );
        Ok(tables)
    }

    async fn table_metadata(
        &self,
        dataset_id: &str,
        table_id: &str,
    ) -> Result<TableMetadata, BridgeError> {
        let url = self.url(&[
            "projects",
            &self.project_id,
            "datasets",
            dataset_id,
            "tables",
            table_id,
        ])?;
        let table: TableResource = self.get(url, &[]).await?;

        Ok(TableMetadata {
            columns: table
                .schema
                .as_ref()
                .map(decode::columns)
                .unwrap_or_default(),
            num_rows: table.num_rows.and_then(|n| n.parse().ok()),
        })
    }

    async fn query(&self, sql: &str) -> Result<QueryResult, BridgeError> {
        let timer = Timer::start();
        let deadline = Instant::now() + Duration::from_secs(self.query_timeout_secs);
        let url = self.url(&["projects", &self.project_id, "queries"])?;
        let request = QueryRequest {
            query: sql,
            use_legacy_sql: false,
            timeout_ms: wait_ms(deadline),
            format_options: FormatOptions {
                use_int64_timestamp: true,
            },
        };

        let mut response: QueryResponse = self
            .send(Method::POST, url, &[], Some(&request))
            .await?;

        if !response.job_complete.unwrap_or(false) {
            let job = response.job_reference.clone().ok_or_else(|| {
                BridgeError::upstream("no jobReference in pending query response")
            })?;
            response = self.poll_job(&job, deadline).await?;
        }

        let Some(schema) = response.schema else {
            // DDL/DML statements complete without a result schema and usually
            // without rows; any rows that do come back are typed UNKNOWN
            let rows = decode::decode_untyped_rows(&response.rows.unwrap_or_default());
            return Ok(QueryResult::from_rows(rows));
        };

        let mut rows = decode::decode_rows(&schema.fields, &response.rows.unwrap_or_default());
        let mut page_token = response.page_token;
        while let Some(token) = page_token.filter(|t| !t.is_empty()) {
            let job = response.job_reference.as_ref().ok_or_else(|| {
                BridgeError::upstream("no jobReference in paged query response")
            })?;
            let page = self
                .query_results(job, Some(&token), wait_ms(deadline))
                .await?;
            rows.extend(decode::decode_rows(&schema.fields, &page.rows.unwrap_or_default()));
            page_token = page.page_token;
        }

        tracing::debug!(
            rows = rows.len(),
            elapsed_ms = timer.elapsed_ms(),
            "query complete"
        );
        Ok(QueryResult {
            columns: decode::columns(&schema),
            rows,
        })
    }
}
