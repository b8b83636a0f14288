use axum::extract::{Form, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use bqbridge::backend::bigquery::{BigQueryClient, BigQueryConnector};
use bqbridge::backend::{ColumnType, Connector, ServiceAccountCredentials, Warehouse};
use bqbridge::error::BridgeError;
use bqbridge::session::Session;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const TEST_KEY: &str = include_str!("../fixtures/test_service_account_key.pem");
const ACCESS_TOKEN: &str = "ya29.test-token";

// --- mock BigQuery REST API ---

#[derive(Default)]
struct MockState {
    token_requests: AtomicUsize,
    reject_token: AtomicBool,
    cancelled_jobs: Mutex<Vec<String>>,
    last_query_body: Mutex<Option<Value>>,
    dataset_page_tokens: Mutex<Vec<Option<String>>>,
    requested_waits: Mutex<Vec<u64>>,
}

type Shared = Arc<MockState>;
type Reply = (StatusCode, Json<Value>);

fn error_reply(status: StatusCode, message: &str) -> Reply {
    (
        status,
        Json(json!({ "error": { "code": status.as_u16(), "message": message, "status": "ERROR" } })),
    )
}

fn authorized(headers: &HeaderMap) -> Result<(), Reply> {
    let expected = format!("Bearer {}", ACCESS_TOKEN);
    match headers.get("authorization").and_then(|v| v.to_str().ok()) {
        Some(value) if value == expected => Ok(()),
        _ => Err(error_reply(
            StatusCode::UNAUTHORIZED,
            "Request is missing required authentication credential.",
        )),
    }
}

fn orders_schema() -> Value {
    json!({ "fields": [
        { "name": "id", "type": "INTEGER", "mode": "REQUIRED" },
        { "name": "placed_at", "type": "TIMESTAMP" },
    ]})
}

async fn token(State(state): State<Shared>, Form(form): Form<HashMap<String, String>>) -> Reply {
    state.token_requests.fetch_add(1, Ordering::SeqCst);
    if state.reject_token.load(Ordering::SeqCst) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "invalid_grant", "error_description": "Invalid JWT Signature." })),
        );
    }
    let grant_ok = form.get("grant_type").map(String::as_str)
        == Some("urn:ietf:params:oauth:grant-type:jwt-bearer");
    let assertion_ok = form
        .get("assertion")
        .is_some_and(|a| a.split('.').count() == 3);
    if !grant_ok || !assertion_ok {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "invalid_request" })),
        );
    }
    (
        StatusCode::OK,
        Json(json!({ "access_token": ACCESS_TOKEN, "expires_in": 3600, "token_type": "Bearer" })),
    )
}

async fn datasets(
    State(state): State<Shared>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Reply {
    if let Err(reply) = authorized(&headers) {
        return reply;
    }
    let page_token = params.get("pageToken").cloned();
    state
        .dataset_page_tokens
        .lock()
        .unwrap()
        .push(page_token.clone());

    match page_token.as_deref() {
        None => (
            StatusCode::OK,
            Json(json!({
                "kind": "bigquery#datasetList",
                "datasets": [
                    { "id": "proj1:sales", "datasetReference": { "projectId": "proj1", "datasetId": "sales" }, "location": "US" },
                    { "id": "proj1:analytics", "datasetReference": { "projectId": "proj1", "datasetId": "analytics" }, "location": "EU" },
                ],
                "nextPageToken": "page-2",
            })),
        ),
        Some("page-2") => (
            StatusCode::OK,
            Json(json!({
                "datasets": [
                    { "id": "proj1:scratch", "datasetReference": { "projectId": "proj1", "datasetId": "scratch" } },
                ],
            })),
        ),
        Some(other) => error_reply(StatusCode::BAD_REQUEST, &format!("bad page token {}", other)),
    }
}

async fn tables(headers: HeaderMap, Path((_project, dataset)): Path<(String, String)>) -> Reply {
    if let Err(reply) = authorized(&headers) {
        return reply;
    }
    if dataset != "sales" {
        return error_reply(
            StatusCode::NOT_FOUND,
            &format!("Not found: Dataset proj1:{}", dataset),
        );
    }
    (
        StatusCode::OK,
        Json(json!({
            "tables": [
                { "tableReference": { "projectId": "proj1", "datasetId": "sales", "tableId": "orders" }, "type": "TABLE" },
                { "tableReference": { "projectId": "proj1", "datasetId": "sales", "tableId": "orders_view" }, "type": "VIEW" },
            ],
            "totalItems": 2,
        })),
    )
}

async fn table(
    headers: HeaderMap,
    Path((_project, dataset, table)): Path<(String, String, String)>,
) -> Reply {
    if let Err(reply) = authorized(&headers) {
        return reply;
    }
    if table != "orders" {
        return error_reply(
            StatusCode::NOT_FOUND,
            &format!("Not found: Table proj1:{}.{}", dataset, table),
        );
    }
    (
        StatusCode::OK,
        Json(json!({ "schema": orders_schema(), "numRows": "2", "type": "TABLE" })),
    )
}

fn complete(job_id: &str, rows: Value, page_token: Option<&str>) -> Value {
    let mut body = json!({
        "jobReference": { "projectId": "proj1", "jobId": job_id, "location": "US" },
        "jobComplete": true,
        "schema": orders_schema(),
        "rows": rows,
    });
    if let Some(token) = page_token {
        body["pageToken"] = json!(token);
    }
    body
}

/// Block like BigQuery does for a job that is still running.
async fn wait_server_side(state: &MockState, timeout_ms: u64) {
    state.requested_waits.lock().unwrap().push(timeout_ms);
    tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
}

fn pending(job_id: &str) -> Value {
    json!({
        "jobReference": { "projectId": "proj1", "jobId": job_id, "location": "US" },
        "jobComplete": false,
    })
}

async fn query(State(state): State<Shared>, headers: HeaderMap, Json(body): Json<Value>) -> Reply {
    if let Err(reply) = authorized(&headers) {
        return reply;
    }
    *state.last_query_body.lock().unwrap() = Some(body.clone());
    let sql = body["query"].as_str().unwrap_or_default();

    if sql.contains("BAD") {
        return error_reply(
            StatusCode::BAD_REQUEST,
            "Syntax error: Unexpected identifier \"BAD\" at [1:1]",
        );
    }
    if sql.contains("WAITING") {
        wait_server_side(&state, body["timeoutMs"].as_u64().unwrap_or_default()).await;
        return (StatusCode::OK, Json(pending("job-waiting")));
    }
    if sql.contains("SCHEMALESS") {
        return (
            StatusCode::OK,
            Json(json!({
                "jobReference": { "projectId": "proj1", "jobId": "job-schemaless", "location": "US" },
                "jobComplete": true,
                "rows": [
                    { "f": [ { "v": "a" }, { "v": null } ] },
                    { "f": [ { "v": "b" }, { "v": "2" } ] },
                ],
            })),
        );
    }
    if sql.contains("SLOW") {
        return (StatusCode::OK, Json(pending("job-slow")));
    }
    if sql.contains("NEVER") {
        return (StatusCode::OK, Json(pending("job-never")));
    }
    if sql.contains("PAGED") {
        return (
            StatusCode::OK,
            Json(complete(
                "job-paged",
                json!([{ "f": [ { "v": "1" }, { "v": "1700000000000000" } ] }]),
                Some("page-2"),
            )),
        );
    }
    if sql.contains("CREATE") {
        return (
            StatusCode::OK,
            Json(json!({
                "jobReference": { "projectId": "proj1", "jobId": "job-ddl", "location": "US" },
                "jobComplete": true,
            })),
        );
    }
    (
        StatusCode::OK,
        Json(complete(
            "job-fast",
            json!([
                { "f": [ { "v": "1" }, { "v": "1700000000000000" } ] },
                { "f": [ { "v": "2" }, { "v": null } ] },
            ]),
            None,
        )),
    )
}

async fn query_results(
    State(state): State<Shared>,
    headers: HeaderMap,
    Path((_project, job_id)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> Reply {
    if let Err(reply) = authorized(&headers) {
        return reply;
    }
    if params.get("location").map(String::as_str) != Some("US") {
        return error_reply(StatusCode::NOT_FOUND, "Not found: Job proj1:job (missing location)");
    }
    match (job_id.as_str(), params.get("pageToken").map(String::as_str)) {
        ("job-slow", None) => (
            StatusCode::OK,
            Json(complete(
                "job-slow",
                json!([{ "f": [ { "v": "3" }, { "v": null } ] }]),
                None,
            )),
        ),
        ("job-paged", Some("page-2")) => (
            StatusCode::OK,
            Json(complete(
                "job-paged",
                json!([{ "f": [ { "v": "2" }, { "v": null } ] }]),
                None,
            )),
        ),
        ("job-never", _) => (StatusCode::OK, Json(pending("job-never"))),
        ("job-waiting", _) => {
            let timeout_ms = params
                .get("timeoutMs")
                .and_then(|v| v.parse().ok())
                .unwrap_or_default();
            wait_server_side(&state, timeout_ms).await;
            (StatusCode::OK, Json(pending("job-waiting")))
        }
        _ => error_reply(StatusCode::NOT_FOUND, &format!("Not found: Job proj1:{}", job_id)),
    }
}

async fn cancel(
    State(state): State<Shared>,
    headers: HeaderMap,
    Path((_project, job_id)): Path<(String, String)>,
) -> Reply {
    if let Err(reply) = authorized(&headers) {
        return reply;
    }
    state.cancelled_jobs.lock().unwrap().push(job_id.clone());
    (StatusCode::OK, Json(json!({ "job": { "jobReference": { "jobId": job_id } } })))
}

struct MockServer {
    addr: SocketAddr,
    state: Shared,
}

impl MockServer {
    async fn start() -> Self {
        let state: Shared = Arc::new(MockState::default());
        let app = Router::new()
            .route("/token", post(token))
            .route("/bigquery/v2/projects/:project/datasets", get(datasets))
            .route(
                "/bigquery/v2/projects/:project/datasets/:dataset/tables",
                get(tables),
            )
            .route(
                "/bigquery/v2/projects/:project/datasets/:dataset/tables/:table",
                get(table),
            )
            .route("/bigquery/v2/projects/:project/queries", post(query))
            .route(
                "/bigquery/v2/projects/:project/queries/:job_id",
                get(query_results),
            )
            .route(
                "/bigquery/v2/projects/:project/jobs/:job_id/cancel",
                post(cancel),
            )
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock server");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("mock server");
        });

        Self { addr, state }
    }

    fn connector(&self, query_timeout_secs: u64) -> BigQueryConnector {
        BigQueryConnector::new(
            format!("http://{}/bigquery/v2", self.addr),
            format!("http://{}/token", self.addr),
            query_timeout_secs,
        )
    }

    fn token_requests(&self) -> usize {
        self.state.token_requests.load(Ordering::SeqCst)
    }
}

/// Key as it arrives from a browser: one line with escaped newlines.
fn credentials() -> ServiceAccountCredentials {
    ServiceAccountCredentials::new(
        "proj1".to_string(),
        "reader@proj1.iam.gserviceaccount.com".to_string(),
        TEST_KEY.replace('\n', "\\n"),
    )
}

async fn client(server: &MockServer) -> BigQueryClient {
    server
        .connector(5)
        .connect(credentials())
        .await
        .expect("connect")
}

// --- connect ---

#[tokio::test]
async fn test_connect_with_escaped_key_builds_client() {
    let server = MockServer::start().await;
    let client = client(&server).await;

    assert_eq!(client.project_id(), "proj1");
    assert_eq!(client.client_email(), "reader@proj1.iam.gserviceaccount.com");
    client.verify().await.expect("verify");
    assert_eq!(
        *server.state.dataset_page_tokens.lock().unwrap(),
        vec![None]
    );
}

#[tokio::test]
async fn test_connect_rejects_invalid_pem() {
    let server = MockServer::start().await;
    let credentials = ServiceAccountCredentials::new(
        "proj1".to_string(),
        "reader@proj1.iam.gserviceaccount.com".to_string(),
        "not a pem".to_string(),
    );

    let err = server.connector(5).connect(credentials).await.unwrap_err();
    assert!(matches!(err, BridgeError::Auth { .. }), "Got: {:?}", err);
    assert!(err.detail().contains("invalid private key"), "Got: {}", err);
    assert_eq!(server.token_requests(), 0);
}

#[tokio::test]
async fn test_session_connect_reports_rejected_token() {
    let server = MockServer::start().await;
    server.state.reject_token.store(true, Ordering::SeqCst);
    let session = Session::new(server.connector(5));

    let err = session.connect(credentials()).await.unwrap_err();
    assert!(matches!(err, BridgeError::Auth { .. }));
    assert!(
        err.detail().contains("Invalid JWT Signature."),
        "Got: {}",
        err.detail()
    );
    assert!(!session.status().connected);
}

#[tokio::test]
async fn test_session_connect_end_to_end() {
    let server = MockServer::start().await;
    let session = Session::new(server.connector(5));

    session.connect(credentials()).await.expect("connect");
    assert_eq!(session.status().project_id.as_deref(), Some("proj1"));

    let connection = session.current().unwrap();
    let datasets = connection.warehouse.list_datasets().await.unwrap();
    assert_eq!(datasets.len(), 3);
}

// --- browsing ---

#[tokio::test]
async fn test_list_datasets_follows_pages_in_order() {
    let server = MockServer::start().await;
    let client = client(&server).await;

    let datasets = client.list_datasets().await.unwrap();
    let summary: Vec<(String, Option<String>)> = datasets
        .into_iter()
        .map(|d| (d.id, d.location))
        .collect();
    assert_eq!(
        summary,
        vec![
            ("sales".to_string(), Some("US".to_string())),
            ("analytics".to_string(), Some("EU".to_string())),
            ("scratch".to_string(), None),
        ]
    );
    assert_eq!(
        *server.state.dataset_page_tokens.lock().unwrap(),
        vec![None, Some("page-2".to_string())]
    );
}

#[tokio::test]
async fn test_access_token_is_reused() {
    let server = MockServer::start().await;
    let client = client(&server).await;

    client.list_datasets().await.unwrap();
    client.list_tables("sales").await.unwrap();
    client.table_metadata("sales", "orders").await.unwrap();

    assert_eq!(server.token_requests(), 1);
}

#[tokio::test]
async fn test_list_tables_maps_reference_and_type() {
    let server = MockServer::start().await;
    let client = client(&server).await;

    let tables = client.list_tables("sales").await.unwrap();
    assert_eq!(tables.len(), 2);
    assert_eq!(tables[0].id, "orders");
    assert_eq!(tables[0].table_type.as_deref(), Some("TABLE"));
    assert_eq!(tables[1].id, "orders_view");
    assert_eq!(tables[1].table_type.as_deref(), Some("VIEW"));
}

#[tokio::test]
async fn test_table_metadata_reads_schema_and_row_count() {
    let server = MockServer::start().await;
    let client = client(&server).await;

    let metadata = client.table_metadata("sales", "orders").await.unwrap();
    assert_eq!(metadata.num_rows, Some(2));
    assert_eq!(metadata.columns.len(), 2);
    assert_eq!(metadata.columns[0].name, "id");
    assert_eq!(metadata.columns[0].column_type, ColumnType::Integer);
    assert_eq!(metadata.columns[1].column_type, ColumnType::Timestamp);
}

#[tokio::test]
async fn test_upstream_error_message_is_passed_through() {
    let server = MockServer::start().await;
    let client = client(&server).await;

    let err = client.table_metadata("sales", "missing").await.unwrap_err();
    assert!(matches!(err, BridgeError::Upstream { .. }));
    assert_eq!(err.detail(), "Not found: Table proj1:sales.missing");
}

// --- queries ---

#[tokio::test]
async fn test_query_decodes_rows_with_schema() {
    let server = MockServer::start().await;
    let client = client(&server).await;

    let result = client.query("SELECT id, placed_at FROM sales.orders").await.unwrap();
    assert_eq!(result.columns.len(), 2);
    assert_eq!(result.columns[1].column_type, ColumnType::Timestamp);
    assert_eq!(
        Value::Array(result.rows.into_iter().map(Value::Object).collect()),
        json!([
            { "id": 1, "placed_at": "2023-11-14T22:13:20.000000Z" },
            { "id": 2, "placed_at": null },
        ])
    );

    let body = server.state.last_query_body.lock().unwrap().clone().unwrap();
    assert_eq!(body["query"], json!("SELECT id, placed_at FROM sales.orders"));
    assert_eq!(body["useLegacySql"], json!(false));
    assert_eq!(body["formatOptions"]["useInt64Timestamp"], json!(true));
}

#[tokio::test]
async fn test_query_page_runs_generated_sql() {
    let server = MockServer::start().await;
    let client = client(&server).await;

    client
        .query_page("proj1", "sales", "orders", 10, 20)
        .await
        .unwrap();
    let body = server.state.last_query_body.lock().unwrap().clone().unwrap();
    assert_eq!(
        body["query"],
        json!("SELECT * FROM `proj1.sales.orders` LIMIT 10 OFFSET 20")
    );
}

#[tokio::test]
async fn test_query_polls_until_job_completes() {
    let server = MockServer::start().await;
    let client = client(&server).await;

    let result = client.query("SELECT SLOW").await.unwrap();
    assert_eq!(result.rows.len(), 1);
    assert_eq!(result.rows[0]["id"], json!(3));
}

#[tokio::test]
async fn test_query_fetches_remaining_pages() {
    let server = MockServer::start().await;
    let client = client(&server).await;

    let result = client.query("SELECT PAGED").await.unwrap();
    let ids: Vec<Value> = result.rows.iter().map(|r| r["id"].clone()).collect();
    assert_eq!(ids, vec![json!(1), json!(2)]);
}

#[tokio::test]
async fn test_query_without_schema_returns_empty_result() {
    let server = MockServer::start().await;
    let client = client(&server).await;

    let result = client.query("CREATE TABLE sales.t (x INT64)").await.unwrap();
    assert!(result.rows.is_empty());
    assert!(result.columns.is_empty());
}

#[tokio::test]
async fn test_query_error_message_is_passed_through() {
    let server = MockServer::start().await;
    let client = client(&server).await;

    let err = client.query("BAD SQL").await.unwrap_err();
    assert_eq!(err.detail(), "Syntax error: Unexpected identifier \"BAD\" at [1:1]");
}

#[tokio::test]
async fn test_query_timeout_cancels_job() {
    let server = MockServer::start().await;
    let client = server
        .connector(1)
        .connect(credentials())
        .await
        .expect("connect");

    let err = client.query("SELECT NEVER").await.unwrap_err();
    assert!(matches!(err, BridgeError::Timeout { seconds: 1 }), "Got: {:?}", err);
    assert_eq!(
        *server.state.cancelled_jobs.lock().unwrap(),
        vec!["job-never".to_string()]
    );
}

#[tokio::test]
async fn test_query_timeout_includes_server_side_waits() {
    let server = MockServer::start().await;
    let client = server
        .connector(1)
        .connect(credentials())
        .await
        .expect("connect");

    let started = Instant::now();
    let err = client.query("SELECT WAITING").await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, BridgeError::Timeout { seconds: 1 }), "Got: {:?}", err);
    assert!(elapsed < Duration::from_secs(3), "took {:?}", elapsed);

    let waits = server.state.requested_waits.lock().unwrap().clone();
    assert!(!waits.is_empty());
    assert!(waits.iter().all(|&ms| ms <= 1000), "waits: {:?}", waits);
    assert_eq!(
        *server.state.cancelled_jobs.lock().unwrap(),
        vec!["job-waiting".to_string()]
    );
}

#[tokio::test]
async fn test_default_server_wait_is_capped() {
    let server = MockServer::start().await;
    let client = client(&server).await;

    client.query("SELECT 1").await.unwrap();
    let body = server.state.last_query_body.lock().unwrap().clone().unwrap();
    let timeout_ms = body["timeoutMs"].as_u64().unwrap();
    assert!(timeout_ms > 0 && timeout_ms <= 5000, "timeoutMs: {}", timeout_ms);
}

#[tokio::test]
async fn test_query_without_schema_infers_positional_columns() {
    let server = MockServer::start().await;
    let client = client(&server).await;

    let result = client.query("SELECT SCHEMALESS").await.unwrap();
    let names: Vec<&str> = result.columns.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["f0_", "f1_"]);
    assert!(
        result
            .columns
            .iter()
            .all(|c| c.column_type == ColumnType::Unknown)
    );
    assert_eq!(
        Value::Array(result.rows.into_iter().map(Value::Object).collect()),
        json!([
            { "f0_": "a", "f1_": null },
            { "f0_": "b", "f1_": "2" },
        ])
    );
}
