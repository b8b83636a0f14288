//! Decoding of BigQuery's `{f: [{v: ...}]}` row encoding into JSON objects.
//!
//! The REST API sends every scalar as a string; the column schema decides
//! what it becomes. Values that do not parse as their declared type are passed
//! through as strings rather than failing the whole result.

use crate::backend::{ColumnMeta, ColumnType, Row};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::{Number, Value};

/// A column in a table or query result schema.
#[derive(Debug, Clone, Deserialize)]
pub struct FieldSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub fields: Vec<FieldSchema>,
}

impl FieldSchema {
    pub fn column_type(&self) -> ColumnType {
        ColumnType::parse(&self.field_type)
    }

    pub fn is_repeated(&self) -> bool {
        self.mode
            .as_deref()
            .is_some_and(|m| m.eq_ignore_ascii_case("REPEATED"))
    }

    pub fn to_column_meta(&self) -> ColumnMeta {
        ColumnMeta {
            name: self.name.clone(),
            column_type: self.column_type(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TableSchema {
    #[serde(default)]
    pub fields: Vec<FieldSchema>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TableRow {
    #[serde(default)]
    pub f: Vec<TableCell>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TableCell {
    #[serde(default)]
    pub v: Value,
}

pub fn columns(schema: &TableSchema) -> Vec<ColumnMeta> {
    schema.fields.iter().map(FieldSchema::to_column_meta).collect()
}

pub fn decode_rows(fields: &[FieldSchema], rows: &[TableRow]) -> Vec<Row> {
    rows.iter().map(|row| decode_row(fields, &row.f)).collect()
}

/// Rows that arrived without a schema. Cells keep their raw values and are
/// keyed by position, following BigQuery's `f0_`, `f1_` naming for anonymous
/// columns.
pub fn decode_untyped_rows(rows: &[TableRow]) -> Vec<Row> {
    rows.iter()
        .map(|row| {
            row.f
                .iter()
                .enumerate()
                .map(|(i, cell)| (format!("f{}_", i), cell.v.clone()))
                .collect()
        })
        .collect()
}

fn decode_row(fields: &[FieldSchema], cells: &[TableCell]) -> Row {
    let mut row = Row::new();
    for (i, field) in fields.iter().enumerate() {
        let value = cells
            .get(i)
            .map(|cell| decode_cell(field, &cell.v))
            .unwrap_or(Value::Null);
        row.insert(field.name.clone(), value);
    }
    row
}

fn decode_cell(field: &FieldSchema, v: &Value) -> Value {
    match v {
        Value::Null => Value::Null,
        Value::Array(items) if field.is_repeated() => Value::Array(
            items
                .iter()
                .map(|item| match item {
                    // repeated entries are wrapped as {"v": ...}
                    Value::Object(wrapper) => {
                        decode_scalar(field, wrapper.get("v").unwrap_or(&Value::Null))
                    }
                    other => decode_scalar(field, other),
                })
                .collect(),
        ),
        _ => decode_scalar(field, v),
    }
}

fn decode_scalar(field: &FieldSchema, v: &Value) -> Value {
    match (field.column_type(), v) {
        (_, Value::Null) => Value::Null,
        (ColumnType::Record, Value::Object(record)) => match record.get("f") {
            Some(Value::Array(cells)) => {
                let mut nested = Row::new();
                for (i, sub) in field.fields.iter().enumerate() {
                    let value = cells
                        .get(i)
                        .and_then(|cell| cell.get("v"))
                        .map(|cell_v| decode_cell(sub, cell_v))
                        .unwrap_or(Value::Null);
                    nested.insert(sub.name.clone(), value);
                }
                Value::Object(nested)
            }
            _ => v.clone(),
        },
        (column_type, Value::String(text)) => decode_text(column_type, text),
        _ => v.clone(),
    }
}

pub fn decode_text(column_type: ColumnType, text: &str) -> Value {
    let parsed = match column_type {
        ColumnType::Integer => text.parse::<i64>().ok().map(Value::from),
        ColumnType::Float => text
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number),
        ColumnType::Boolean => match text.to_ascii_lowercase().as_str() {
            "true" => Some(Value::Bool(true)),
            "false" => Some(Value::Bool(false)),
            _ => None,
        },
        ColumnType::Timestamp => timestamp_to_rfc3339(text).map(Value::String),
        ColumnType::Json => serde_json::from_str(text).ok(),
        _ => None,
    };
    parsed.unwrap_or_else(|| Value::String(text.to_string()))
}

/// BigQuery timestamps arrive as int64 microseconds (or float seconds when
/// the int64 format option was not honored).
pub fn timestamp_to_rfc3339(text: &str) -> Option<String> {
    let micros = match text.parse::<i64>() {
        Ok(m) => m,
        Err(_) => {
            let secs = text.parse::<f64>().ok().filter(|s| s.is_finite())?;
            (secs * 1_000_000.0).round() as i64
        }
    };
    DateTime::<Utc>::from_timestamp_micros(micros)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Micros, true))
}
