pub mod bigquery;
pub mod decode;
pub mod token;

use crate::error::BridgeError;
use secrecy::{ExposeSecret, SecretString};
use serde::{Serialize, Serializer};
use std::future::Future;

/// A single result row: column name to JSON value, in column order.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Service-account identity supplied by the browser client.
#[derive(Debug)]
pub struct ServiceAccountCredentials {
    pub project_id: String,
    pub client_email: String,
    pub private_key: SecretString,
}

impl ServiceAccountCredentials {
    pub fn new(project_id: String, client_email: String, private_key: String) -> Self {
        Self {
            project_id,
            client_email,
            private_key: SecretString::from(private_key),
        }
    }

    /// PEM text with escaped `\n` sequences turned into real newlines.
    pub fn normalized_private_key(&self) -> SecretString {
        SecretString::from(normalize_private_key(self.private_key.expose_secret()))
    }
}

/// Keys pasted from a JSON key file often arrive as one line with literal `\n`.
pub fn normalize_private_key(key: &str) -> String {
    key.replace("\\n", "\n")
}

/// Column type as reported by BigQuery table or query metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    String,
    Bytes,
    Integer,
    Float,
    Numeric,
    BigNumeric,
    Boolean,
    Timestamp,
    Date,
    Time,
    Datetime,
    Geography,
    Interval,
    Json,
    Range,
    Record,
    Unknown,
}

impl ColumnType {
    pub fn parse(name: &str) -> Self {
        match name.to_ascii_uppercase().as_str() {
            "STRING" => Self::String,
            "BYTES" => Self::Bytes,
            "INTEGER" | "INT64" => Self::Integer,
            "FLOAT" | "FLOAT64" => Self::Float,
            "NUMERIC" => Self::Numeric,
            "BIGNUMERIC" => Self::BigNumeric,
            "BOOLEAN" | "BOOL" => Self::Boolean,
            "TIMESTAMP" => Self::Timestamp,
            "DATE" => Self::Date,
            "TIME" => Self::Time,
            "DATETIME" => Self::Datetime,
            "GEOGRAPHY" => Self::Geography,
            "INTERVAL" => Self::Interval,
            "JSON" => Self::Json,
            "RANGE" => Self::Range,
            "RECORD" | "STRUCT" => Self::Record,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "STRING",
            Self::Bytes => "BYTES",
            Self::Integer => "INTEGER",
            Self::Float => "FLOAT",
            Self::Numeric => "NUMERIC",
            Self::BigNumeric => "BIGNUMERIC",
            Self::Boolean => "BOOLEAN",
            Self::Timestamp => "TIMESTAMP",
            Self::Date => "DATE",
            Self::Time => "TIME",
            Self::Datetime => "DATETIME",
            Self::Geography => "GEOGRAPHY",
            Self::Interval => "INTERVAL",
            Self::Json => "JSON",
            Self::Range => "RANGE",
            Self::Record => "RECORD",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl Serialize for ColumnType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Metadata for a single result column.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnMeta {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetSummary {
    pub id: String,
    pub location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableSummary {
    pub id: String,
    #[serde(rename = "type")]
    pub table_type: Option<String>,
}

/// Column layout and size of a table.
#[derive(Debug, Clone)]
pub struct TableMetadata {
    pub columns: Vec<ColumnMeta>,
    pub num_rows: Option<u64>,
}

/// The output of executing a query.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub columns: Vec<ColumnMeta>,
    pub rows: Vec<Row>,
}

impl QueryResult {
    /// Build a result for rows that came back without schema metadata.
    pub fn from_rows(rows: Vec<Row>) -> Self {
        let columns = infer_columns(&rows);
        Self { columns, rows }
    }
}

/// Column names from the first row, typed `UNKNOWN`.
pub fn infer_columns(rows: &[Row]) -> Vec<ColumnMeta> {
    rows.first()
        .map(|row| {
            row.keys()
                .map(|name| ColumnMeta {
                    name: name.clone(),
                    column_type: ColumnType::Unknown,
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Quote an identifier path for use inside backticks.
pub fn quote_identifier(parts: &[&str]) -> String {
    let joined = parts
        .iter()
        .map(|p| p.replace('\\', "\\\\").replace('`', "\\`"))
        .collect::<Vec<_>>()
        .join(".");
    format!("`{}`", joined)
}

/// The query behind table browsing. No ORDER BY: pages over a table without a
/// natural order may overlap or skip rows.
pub fn page_sql(project_id: &str, dataset_id: &str, table_id: &str, limit: u64, offset: u64) -> String {
    format!(
        "SELECT * FROM {} LIMIT {} OFFSET {}",
        quote_identifier(&[project_id, dataset_id, table_id]),
        limit,
        offset
    )
}

/// Operations the HTTP handlers need from a connected warehouse.
pub trait Warehouse: Send + Sync + 'static {
    /// Cheap call that fails when the credentials are unusable.
    fn verify(&self) -> impl Future<Output = Result<(), BridgeError>> + Send;

    fn list_datasets(&self) -> impl Future<Output = Result<Vec<DatasetSummary>, BridgeError>> + Send;

    fn list_tables(
        &self,
        dataset_id: &str,
    ) -> impl Future<Output = Result<Vec<TableSummary>, BridgeError>> + Send;

    fn table_metadata(
        &self,
        dataset_id: &str,
        table_id: &str,
    ) -> impl Future<Output = Result<TableMetadata, BridgeError>> + Send;

    fn query(&self, sql: &str) -> impl Future<Output = Result<QueryResult, BridgeError>> + Send;

    fn query_page(
        &self,
        project_id: &str,
        dataset_id: &str,
        table_id: &str,
        limit: u64,
        offset: u64,
    ) -> impl Future<Output = Result<QueryResult, BridgeError>> + Send {
        let sql = page_sql(project_id, dataset_id, table_id, limit, offset);
        async move { self.query(&sql).await }
    }
}

/// Builds a warehouse client from service-account credentials.
pub trait Connector: Send + Sync + 'static {
    type Warehouse: Warehouse;

    fn connect(
        &self,
        credentials: ServiceAccountCredentials,
    ) -> impl Future<Output = Result<Self::Warehouse, BridgeError>> + Send;
}
