//! PostgreSQL backend using `tokio-postgres`.

use crate::config::DatabaseConfig;
use crate::database::result::*;
use crate::database::traits::{Backend, Session};
use crate::error::{DatabaseError, DbResult, IntegrityKind};
use async_trait::async_trait;
use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::error::Error as StdError;
use std::str::FromStr;
use std::time::Instant;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::{FromSql, IsNull, ToSql, Type, to_sql_checked};
use tokio_postgres::{Client, NoTls};
use tracing::{debug, info, instrument, warn};

/// PostgreSQL backend. Each [`Backend::connect`] opens one client.
pub struct PgBackend {
    config: DatabaseConfig,
}

impl PgBackend {
    pub fn new(config: DatabaseConfig) -> Self {
        info!(
            "Using PostgreSQL backend: {}:{}/{}",
            config.host, config.port, config.database
        );
        Self { config }
    }

    fn pg_config(&self) -> tokio_postgres::Config {
        let c = &self.config;
        let mut pg = tokio_postgres::Config::new();
        pg.host(&c.host)
            .port(c.port)
            .dbname(&c.database)
            .user(&c.username)
            .application_name(&c.application_name)
            .connect_timeout(c.connect_timeout);
        if !c.password.is_empty() {
            pg.password(&c.password);
        }
        pg
    }
}

#[async_trait]
impl Backend for PgBackend {
    type Session = PgSession;

    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn connect(&self) -> DbResult<PgSession> {
        let (client, connection) = self
            .pg_config()
            .connect(NoTls)
            .await
            .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "PostgreSQL connection terminated");
            }
        });

        debug!(host = %self.config.host, "PostgreSQL connection established");
        Ok(PgSession { client })
    }
}

/// One `tokio-postgres` client.
pub struct PgSession {
    client: Client,
}

impl PgSession {
    /// Convert a PostgreSQL row to our Row type.
    fn convert_row(pg_row: &tokio_postgres::Row, columns: &[tokio_postgres::Column]) -> Row {
        let mut row = HashMap::with_capacity(columns.len());
        for (i, col) in columns.iter().enumerate() {
            row.insert(col.name().to_string(), Self::get_cell_value(pg_row, i, col.type_()));
        }
        row
    }

    /// Extract cell value from PostgreSQL row.
    fn get_cell_value(row: &tokio_postgres::Row, index: usize, ty: &Type) -> CellValue {
        let value = match *ty {
            Type::BOOL => get::<bool>(row, index).map(CellValue::Bool),
            Type::INT2 => get::<i16>(row, index).map(|v| CellValue::Int(v as i64)),
            Type::INT4 => get::<i32>(row, index).map(|v| CellValue::Int(v as i64)),
            Type::INT8 => get::<i64>(row, index).map(CellValue::Int),
            Type::OID => get::<u32>(row, index).map(|v| CellValue::Int(v as i64)),
            Type::FLOAT4 => get::<f32>(row, index).map(|v| CellValue::Float(v as f64)),
            Type::FLOAT8 => get::<f64>(row, index).map(CellValue::Float),
            Type::NUMERIC => get::<Decimal>(row, index).map(CellValue::Decimal),
            Type::TIMESTAMPTZ => get::<DateTime<Utc>>(row, index).map(CellValue::DateTime),
            Type::TIMESTAMP => get::<NaiveDateTime>(row, index)
                .map(|v| CellValue::DateTime(DateTime::from_naive_utc_and_offset(v, Utc))),
            Type::DATE => get::<NaiveDate>(row, index).map(|v| CellValue::String(v.to_string())),
            Type::JSON | Type::JSONB => get::<serde_json::Value>(row, index).map(CellValue::Json),
            Type::BYTEA => get::<Vec<u8>>(row, index).map(CellValue::Bytes),
            _ => get::<String>(row, index).map(CellValue::String),
        };
        value.unwrap_or(CellValue::Null)
    }
}

fn get<'a, T: FromSql<'a>>(row: &'a tokio_postgres::Row, index: usize) -> Option<T> {
    row.try_get::<_, Option<T>>(index).ok().flatten()
}

#[async_trait]
impl Session for PgSession {
    #[instrument(skip(self, params), fields(db = "postgres", params = params.len()))]
    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> DbResult<QueryResult> {
        let start = Instant::now();
        let stmt = self.client.prepare(sql).await.map_err(classify)?;

        if stmt.params().len() != params.len() {
            return Err(DatabaseError::InvalidParameter {
                index: params.len().min(stmt.params().len()) + 1,
                message: format!(
                    "statement expects {} parameters, got {}",
                    stmt.params().len(),
                    params.len()
                ),
            });
        }

        let bound = params
            .iter()
            .zip(stmt.params())
            .enumerate()
            .map(|(i, (value, ty))| bind(i + 1, value, ty))
            .collect::<DbResult<Vec<_>>>()?;
        let refs: Vec<&(dyn ToSql + Sync)> = bound
            .iter()
            .map(|b| b.as_ref() as &(dyn ToSql + Sync))
            .collect();

        if stmt.columns().is_empty() {
            let affected = self.client.execute(&stmt, &refs).await.map_err(classify)?;
            return Ok(QueryResult::affected(
                affected,
                start.elapsed().as_millis() as u64,
            ));
        }

        let pg_rows = self.client.query(&stmt, &refs).await.map_err(classify)?;
        let fields = stmt
            .columns()
            .iter()
            .map(|c| Column::new(c.name(), c.type_().name()))
            .collect();
        let rows = pg_rows
            .iter()
            .map(|r| Self::convert_row(r, stmt.columns()))
            .collect();

        Ok(QueryResult::new(
            fields,
            rows,
            start.elapsed().as_millis() as u64,
        ))
    }

    async fn simple_execute(&mut self, sql: &str) -> DbResult<()> {
        self.client.batch_execute(sql).await.map_err(classify)
    }

    fn is_closed(&self) -> bool {
        self.client.is_closed()
    }
}

type Bound = Box<dyn ToSql + Sync + Send>;

/// Convert one JSON-shaped parameter into a value of the server's declared
/// type for that placeholder. `index` is 1-based.
fn bind(index: usize, value: &SqlValue, ty: &Type) -> DbResult<Bound> {
    let mismatch = || DatabaseError::InvalidParameter {
        index,
        message: format!("cannot bind {} to {}", value.type_name(), ty.name()),
    };

    let bound: Bound = match (value, ty) {
        (SqlValue::Null, _) => Box::new(Null),

        (SqlValue::Bool(b), &Type::BOOL) => Box::new(*b),

        (SqlValue::Int(i), &Type::INT2) => Box::new(i16::try_from(*i).map_err(|_| mismatch())?),
        (SqlValue::Int(i), &Type::INT4) => Box::new(i32::try_from(*i).map_err(|_| mismatch())?),
        (SqlValue::Int(i), &Type::INT8) => Box::new(*i),
        (SqlValue::Int(i), &Type::FLOAT4) => Box::new(*i as f32),
        (SqlValue::Int(i), &Type::FLOAT8) => Box::new(*i as f64),
        (SqlValue::Int(i), &Type::NUMERIC) => Box::new(Decimal::from(*i)),

        (SqlValue::Float(f), &Type::FLOAT4) => Box::new(*f as f32),
        (SqlValue::Float(f), &Type::FLOAT8) => Box::new(*f),
        (SqlValue::Float(f), &Type::NUMERIC) => {
            Box::new(Decimal::try_from(*f).map_err(|_| mismatch())?)
        }

        (SqlValue::Text(s), &Type::TEXT | &Type::VARCHAR | &Type::BPCHAR | &Type::NAME | &Type::UNKNOWN) => {
            Box::new(s.clone())
        }
        (SqlValue::Text(s), &Type::INT2) => Box::new(parse::<i16>(s).ok_or_else(mismatch)?),
        (SqlValue::Text(s), &Type::INT4) => Box::new(parse::<i32>(s).ok_or_else(mismatch)?),
        (SqlValue::Text(s), &Type::INT8) => Box::new(parse::<i64>(s).ok_or_else(mismatch)?),
        (SqlValue::Text(s), &Type::FLOAT8) => Box::new(parse::<f64>(s).ok_or_else(mismatch)?),
        (SqlValue::Text(s), &Type::NUMERIC) => Box::new(parse::<Decimal>(s).ok_or_else(mismatch)?),
        (SqlValue::Text(s), &Type::BOOL) => Box::new(parse::<bool>(s).ok_or_else(mismatch)?),
        (SqlValue::Text(s), &Type::TIMESTAMPTZ) => Box::new(
            DateTime::parse_from_rfc3339(s)
                .map(|d| d.with_timezone(&Utc))
                .map_err(|_| mismatch())?,
        ),
        (SqlValue::Text(s), &Type::TIMESTAMP) => Box::new(
            NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
                .map_err(|_| mismatch())?,
        ),
        (SqlValue::Text(s), &Type::DATE) => Box::new(
            NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| mismatch())?,
        ),
        (SqlValue::Text(s), &Type::JSON | &Type::JSONB) => {
            Box::new(serde_json::Value::String(s.clone()))
        }

        (SqlValue::Json(v), &Type::JSON | &Type::JSONB) => Box::new(v.clone()),
        (SqlValue::Json(v), &Type::TEXT | &Type::VARCHAR) => Box::new(v.to_string()),

        _ => return Err(mismatch()),
    };
    Ok(bound)
}

fn parse<T: FromStr>(s: &str) -> Option<T> {
    s.trim().parse().ok()
}

/// SQL `NULL` for a placeholder of any type.
#[derive(Debug)]
struct Null;

impl ToSql for Null {
    fn to_sql(
        &self,
        _ty: &Type,
        _out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn StdError + Sync + Send>> {
        Ok(IsNull::Yes)
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

/// Map a driver error onto the gateway taxonomy.
///
/// Statement cancellation is reported as a timeout with an unknown duration;
/// callers that know the limit substitute it.
pub fn classify(err: tokio_postgres::Error) -> DatabaseError {
    if let Some(db) = err.as_db_error() {
        let code = db.code();
        let message = db.message().to_string();
        if let Some(kind) = integrity_kind(code) {
            return DatabaseError::Integrity { kind, message };
        }
        if *code == SqlState::QUERY_CANCELED {
            return DatabaseError::Timeout(0);
        }
        if code.code().starts_with("08") {
            return DatabaseError::ConnectionFailed(message);
        }
        return DatabaseError::QueryFailed {
            sqlstate: Some(code.code().to_string()),
            message,
        };
    }

    if err.is_closed() {
        return DatabaseError::ConnectionFailed("connection closed".into());
    }
    if err
        .source()
        .is_some_and(|source| source.is::<std::io::Error>())
    {
        return DatabaseError::ConnectionFailed(err.to_string());
    }
    DatabaseError::QueryFailed {
        sqlstate: None,
        message: err.to_string(),
    }
}

fn integrity_kind(code: &SqlState) -> Option<IntegrityKind> {
    if *code == SqlState::UNIQUE_VIOLATION {
        Some(IntegrityKind::Unique)
    } else if *code == SqlState::FOREIGN_KEY_VIOLATION {
        Some(IntegrityKind::ForeignKey)
    } else if *code == SqlState::NOT_NULL_VIOLATION {
        Some(IntegrityKind::NotNull)
    } else if *code == SqlState::CHECK_VIOLATION {
        Some(IntegrityKind::Check)
    } else {
        None
    }
}
