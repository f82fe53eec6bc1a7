//! Closed-whitelist filtered query over `diamonds`, `run_metadata`, and
//! `worker_runs` (spec §6, §9's "dynamic field filter objects ... translate
//! to a declarative filter AST with a closed operator enum and a per-table
//! allow-list of column names; reject anything else with a structured
//! validation error. Do not dispatch raw user input to the database
//! driver."). Column names are only ever taken from the allow-list below,
//! never interpolated from the request; filter values are always bound as
//! typed parameters.

use crate::api_types::{AnalyticsQueryRequest, FilterOp};
use crate::error::ApiError;
use sqlx::{PgPool, QueryBuilder, Row};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnType {
    Text,
    Int8,
    Float8,
    Bool,
    Timestamptz,
    Uuid,
}

struct TableSpec {
    /// The real table name in the database; the request-facing name
    /// (`run_metadata`) does not always match it (`runs`).
    sql_table: &'static str,
    columns: &'static [(&'static str, ColumnType)],
}

fn table_spec(requested_table: &str) -> Option<TableSpec> {
    match requested_table {
        "diamonds" => Some(TableSpec {
            sql_table: "diamonds",
            columns: &[
                ("id", ColumnType::Uuid),
                ("feed", ColumnType::Text),
                ("supplier_stone_id", ColumnType::Text),
                ("supplier_price", ColumnType::Float8),
                ("price_per_carat", ColumnType::Float8),
                ("retail_price", ColumnType::Float8),
                ("markup_ratio", ColumnType::Float8),
                ("rating", ColumnType::Int8),
                ("availability", ColumnType::Text),
                ("status", ColumnType::Text),
                ("created_at", ColumnType::Timestamptz),
                ("updated_at", ColumnType::Timestamptz),
            ],
        }),
        "run_metadata" => Some(TableSpec {
            sql_table: "runs",
            columns: &[
                ("run_id", ColumnType::Uuid),
                ("feed", ColumnType::Text),
                ("run_type", ColumnType::Text),
                ("expected_workers", ColumnType::Int8),
                ("completed_workers", ColumnType::Int8),
                ("failed_workers", ColumnType::Int8),
                ("started_at", ColumnType::Timestamptz),
                ("completed_at", ColumnType::Timestamptz),
                ("cancelled", ColumnType::Bool),
            ],
        }),
        "worker_runs" => Some(TableSpec {
            sql_table: "worker_runs",
            columns: &[
                ("id", ColumnType::Uuid),
                ("run_id", ColumnType::Uuid),
                ("partition_id", ColumnType::Int8),
                ("worker_id", ColumnType::Text),
                ("status", ColumnType::Text),
                ("records_processed", ColumnType::Int8),
                ("started_at", ColumnType::Timestamptz),
                ("completed_at", ColumnType::Timestamptz),
                ("lock_expires_at", ColumnType::Timestamptz),
            ],
        }),
        _ => None,
    }
}

fn column_type(spec: &TableSpec, column: &str) -> Option<ColumnType> {
    spec.columns.iter().find(|(name, _)| *name == column).map(|(_, t)| *t)
}

fn op_sql(op: FilterOp) -> &'static str {
    match op {
        FilterOp::Eq => "=",
        FilterOp::Neq => "<>",
        FilterOp::Gt => ">",
        FilterOp::Gte => ">=",
        FilterOp::Lt => "<",
        FilterOp::Lte => "<=",
        FilterOp::Like => "like",
        FilterOp::Ilike => "ilike",
        FilterOp::In => "in",
        FilterOp::Is => "is",
    }
}

/// Run an `AnalyticsQueryRequest` against one whitelisted table, returning
/// each matching row as a JSON object (built in SQL via `row_to_json` so
/// no per-column Rust decode logic is needed for a dynamic column set).
pub async fn run_query(pool: &PgPool, requested_table: &str, req: &AnalyticsQueryRequest) -> Result<Vec<serde_json::Value>, ApiError> {
    let spec = table_spec(requested_table).ok_or_else(|| ApiError::Validation(format!("unknown table '{requested_table}'")))?;

    let mut qb: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(format!("select row_to_json(t)::text as j from (select * from {} ", spec.sql_table));
    qb.push("where 1=1");

    for clause in &req.filters {
        let col_type = column_type(&spec, &clause.column)
            .ok_or_else(|| ApiError::Validation(format!("column '{}' is not queryable on table '{requested_table}'", clause.column)))?;

        qb.push(" and ");
        qb.push(clause.column.as_str());
        qb.push(" ");

        match clause.op {
            FilterOp::Is => {
                qb.push("is ");
                if clause.value.is_null() {
                    qb.push("null");
                } else if let Some(b) = clause.value.as_bool() {
                    qb.push_bind(b);
                } else {
                    return Err(ApiError::Validation("'is' only supports null or boolean values".into()));
                }
            }
            FilterOp::In => {
                let items = clause
                    .value
                    .as_array()
                    .ok_or_else(|| ApiError::Validation("'in' requires an array value".into()))?;
                if items.is_empty() {
                    return Err(ApiError::Validation("'in' requires at least one value".into()));
                }
                qb.push("in (");
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        qb.push(", ");
                    }
                    bind_scalar(&mut qb, col_type, item)?;
                }
                qb.push(")");
            }
            other => {
                qb.push(op_sql(other));
                qb.push(" ");
                bind_scalar(&mut qb, col_type, &clause.value)?;
            }
        }
    }

    qb.push(" order by 1 limit ");
    qb.push_bind(req.limit.clamp(1, 1000));
    qb.push(" offset ");
    qb.push_bind(req.offset.max(0));
    qb.push(") t");

    let rows = qb.build().fetch_all(pool).await.map_err(|e| ApiError::Internal(anyhow::Error::new(e).context("analytics query failed")))?;

    rows.into_iter()
        .map(|row| {
            let text: String = row.try_get("j").map_err(|e| ApiError::Internal(anyhow::Error::new(e)))?;
            serde_json::from_str(&text).map_err(|e| ApiError::Internal(anyhow::Error::new(e).context("malformed row_to_json output")))
        })
        .collect()
}

fn bind_scalar(qb: &mut QueryBuilder<sqlx::Postgres>, col_type: ColumnType, value: &serde_json::Value) -> Result<(), ApiError> {
    match col_type {
        ColumnType::Text => qb.push_bind(as_text(value)?),
        ColumnType::Int8 => qb.push_bind(as_i64(value)?),
        ColumnType::Float8 => qb.push_bind(as_f64(value)?),
        ColumnType::Bool => qb.push_bind(as_bool(value)?),
        ColumnType::Timestamptz => qb.push_bind(as_timestamp(value)?),
        ColumnType::Uuid => qb.push_bind(as_uuid(value)?),
    };
    Ok(())
}

fn as_text(v: &serde_json::Value) -> Result<String, ApiError> {
    v.as_str().map(str::to_string).ok_or_else(|| ApiError::Validation("expected a string value".into()))
}

fn as_i64(v: &serde_json::Value) -> Result<i64, ApiError> {
    v.as_i64().ok_or_else(|| ApiError::Validation("expected an integer value".into()))
}

fn as_f64(v: &serde_json::Value) -> Result<f64, ApiError> {
    v.as_f64().ok_or_else(|| ApiError::Validation("expected a numeric value".into()))
}

fn as_bool(v: &serde_json::Value) -> Result<bool, ApiError> {
    v.as_bool().ok_or_else(|| ApiError::Validation("expected a boolean value".into()))
}

fn as_timestamp(v: &serde_json::Value) -> Result<chrono::DateTime<chrono::Utc>, ApiError> {
    v.as_str()
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .ok_or_else(|| ApiError::Validation("expected an RFC3339 timestamp string".into()))
}

fn as_uuid(v: &serde_json::Value) -> Result<uuid::Uuid, ApiError> {
    v.as_str()
        .and_then(|s| uuid::Uuid::parse_str(s).ok())
        .ok_or_else(|| ApiError::Validation("expected a UUID string".into()))
}
