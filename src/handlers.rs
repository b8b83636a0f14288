//! Request handlers for the `/api/bigquery` endpoints.

use crate::backend::{
    ColumnMeta, Connector, DatasetSummary, Row, ServiceAccountCredentials, TableSummary, Warehouse,
};
use crate::error::BridgeError;
use crate::session::{Session, SessionStatus};
use axum::Json;
use axum::extract::{Path, Query, State};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const DEFAULT_PAGE_LIMIT: u64 = 100;
pub const DEFAULT_PAGE_OFFSET: u64 = 0;

/// Shared handler state.
pub struct AppState<C: Connector> {
    pub session: Arc<Session<C>>,
}

impl<C: Connector> AppState<C> {
    pub fn new(session: Session<C>) -> Self {
        Self {
            session: Arc::new(session),
        }
    }
}

impl<C: Connector> Clone for AppState<C> {
    fn clone(&self) -> Self {
        Self {
            session: Arc::clone(&self.session),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConnectRequest {
    pub project_id: Option<String>,
    pub client_email: Option<String>,
    pub private_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct QueryRequest {
    pub query: Option<String>,
}

/// Raw `limit`/`offset` query parameters; anything unparsable falls back to
/// the defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PageParams {
    pub limit: Option<String>,
    pub offset: Option<String>,
}

impl PageParams {
    pub fn limit(&self) -> u64 {
        self.limit
            .as_deref()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|&n| n > 0)
            .unwrap_or(DEFAULT_PAGE_LIMIT)
    }

    pub fn offset(&self) -> u64 {
        self.offset
            .as_deref()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(DEFAULT_PAGE_OFFSET)
    }
}

#[derive(Debug, Serialize)]
pub struct ConnectResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct DisconnectResponse {
    pub success: bool,
}

#[derive(Debug, Serialize)]
pub struct DatasetsResponse {
    pub datasets: Vec<DatasetSummary>,
}

#[derive(Debug, Serialize)]
pub struct TablesResponse {
    pub tables: Vec<TableSummary>,
}

#[derive(Debug, Serialize)]
pub struct TablePageResponse {
    pub rows: Vec<Row>,
    pub schema: Vec<ColumnMeta>,
    pub total: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct QueryResponse {
    pub rows: Vec<Row>,
    pub schema: Vec<ColumnMeta>,
}

fn present(field: Option<String>) -> Option<String> {
    field.filter(|v| !v.is_empty())
}

pub async fn status<C: Connector>(State(state): State<AppState<C>>) -> Json<SessionStatus> {
    Json(state.session.status())
}

/// A body that is missing or not valid JSON counts as missing fields.
pub async fn connect<C: Connector>(
    State(state): State<AppState<C>>,
    body: Option<Json<ConnectRequest>>,
) -> Result<Json<ConnectResponse>, BridgeError> {
    let request = body.map(|Json(b)| b).unwrap_or_default();

    let (Some(project_id), Some(client_email), Some(private_key)) = (
        present(request.project_id),
        present(request.client_email),
        present(request.private_key),
    ) else {
        return Err(BridgeError::validation(
            "Missing required fields: projectId, clientEmail, privateKey",
        ));
    };

    let credentials = ServiceAccountCredentials::new(project_id, client_email, private_key);
    let connection = state.session.connect(credentials).await?;

    Ok(Json(ConnectResponse {
        success: true,
        message: format!("Connected to BigQuery project {}", connection.project_id),
    }))
}

pub async fn disconnect<C: Connector>(
    State(state): State<AppState<C>>,
) -> Json<DisconnectResponse> {
    state.session.disconnect().await;
    Json(DisconnectResponse { success: true })
}

pub async fn list_datasets<C: Connector>(
    State(state): State<AppState<C>>,
) -> Result<Json<DatasetsResponse>, BridgeError> {
    let connection = state.session.current()?;
    let datasets = connection.warehouse.list_datasets().await?;
    Ok(Json(DatasetsResponse { datasets }))
}

pub async fn list_tables<C: Connector>(
    State(state): State<AppState<C>>,
    Path(dataset_id): Path<String>,
) -> Result<Json<TablesResponse>, BridgeError> {
    let connection = state.session.current()?;
    let tables = connection.warehouse.list_tables(&dataset_id).await?;
    Ok(Json(TablesResponse { tables }))
}

pub async fn table_page<C: Connector>(
    State(state): State<AppState<C>>,
    Path((dataset_id, table_id)): Path<(String, String)>,
    Query(page): Query<PageParams>,
) -> Result<Json<TablePageResponse>, BridgeError> {
    let connection = state.session.current()?;
    let warehouse = &connection.warehouse;

    let metadata = warehouse.table_metadata(&dataset_id, &table_id).await?;
    let result = warehouse
        .query_page(
            &connection.project_id,
            &dataset_id,
            &table_id,
            page.limit(),
            page.offset(),
        )
        .await?;

    Ok(Json(TablePageResponse {
        rows: result.rows,
        schema: metadata.columns,
        total: metadata.num_rows,
    }))
}

pub async fn run_query<C: Connector>(
    State(state): State<AppState<C>>,
    body: Option<Json<QueryRequest>>,
) -> Result<Json<QueryResponse>, BridgeError> {
    let connection = state.session.current()?;

    let Some(sql) = body.and_then(|Json(b)| present(b.query)) else {
        return Err(BridgeError::validation("Query is required"));
    };

    let result = connection.warehouse.query(&sql).await?;
    Ok(Json(QueryResponse {
        rows: result.rows,
        schema: result.columns,
    }))
}
