//! Statement execution: single queries, batches, transactions and CRUD helpers.
//!
//! Batches are **not** atomic. Statement `i` failing leaves the effects of
//! statements `0..i` in place; callers that need all-or-nothing semantics must
//! use [`ExecutionEngine::execute_transaction`].

use crate::config::ExecutionLimits;
use crate::database::pool::{Pool, PooledConnection};
use crate::database::result::{QueryRequest, QueryResult, SqlValue};
use crate::database::traits::Backend;
use crate::error::{DatabaseError, DbResult, Result, ValidationCode, ValidationError};
use crate::security::IdentifierSanitizer;
use crate::security::validator::preview;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

/// PostgreSQL refuses statements with more bind parameters than this.
const MAX_BIND_PARAMS: usize = 65_535;

const ROLLBACK_TIMEOUT: Duration = Duration::from_secs(5);
const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Body of a batch or transaction call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequest {
    pub queries: Vec<QueryRequest>,
    #[serde(default, rename = "timeout", skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl BatchRequest {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// One row or many.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RowData {
    One(Map<String, Value>),
    Many(Vec<Map<String, Value>>),
}

impl RowData {
    fn rows(&self) -> Vec<&Map<String, Value>> {
        match self {
            Self::One(row) => vec![row],
            Self::Many(rows) => rows.iter().collect(),
        }
    }
}

/// `RETURNING` selection: `true` for every column or an explicit list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Returning {
    All(bool),
    Columns(Vec<String>),
}

impl Default for Returning {
    fn default() -> Self {
        Self::All(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsertRequest {
    pub table: String,
    pub data: RowData,
    #[serde(default)]
    pub returning: Returning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub table: String,
    pub data: Map<String, Value>,
    #[serde(rename = "where", default)]
    pub filter: Map<String, Value>,
    #[serde(default)]
    pub returning: Returning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub table: String,
    #[serde(rename = "where", default)]
    pub filter: Map<String, Value>,
    #[serde(default)]
    pub returning: Returning,
}

/// Runs statements against the pool.
pub struct ExecutionEngine<B: Backend> {
    pool: Pool<B>,
    identifiers: IdentifierSanitizer,
    limits: ExecutionLimits,
    default_timeout: Duration,
}

impl<B: Backend> Clone for ExecutionEngine<B> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            identifiers: self.identifiers.clone(),
            limits: self.limits.clone(),
            default_timeout: self.default_timeout,
        }
    }
}

impl<B: Backend> ExecutionEngine<B> {
    pub fn new(pool: Pool<B>, identifiers: IdentifierSanitizer, limits: ExecutionLimits) -> Self {
        let default_timeout = pool.config().statement_timeout;
        Self {
            pool,
            identifiers,
            limits,
            default_timeout,
        }
    }

    pub fn pool(&self) -> &Pool<B> {
        &self.pool
    }

    /// Run one statement under its own timeout, or the default.
    #[instrument(skip(self, request), fields(sql = %preview(&request.sql)))]
    pub async fn execute(&self, request: &QueryRequest) -> Result<QueryResult> {
        let limit = request.timeout().unwrap_or(self.default_timeout);
        let start = Instant::now();
        let outcome = match self.pool.acquire().await {
            Ok(mut conn) => run_statement(&mut conn, request, limit).await,
            Err(e) => Err(e),
        };
        log_statement(&request.sql, start, &outcome);
        Ok(outcome?)
    }

    /// Run statements in order on one connection, stopping at the first failure.
    ///
    /// Effects of the statements before the failing one are kept. The failure
    /// is reported as [`DatabaseError::BatchAborted`].
    #[instrument(skip(self, requests), fields(statements = requests.len()))]
    pub async fn execute_batch(
        &self,
        requests: &[QueryRequest],
        batch_timeout: Option<Duration>,
    ) -> Result<Vec<QueryResult>> {
        check_count(
            requests.len(),
            self.limits.max_batch_size,
            "Batch",
            ValidationCode::BatchTooLarge,
        )?;

        let mut conn = self.pool.acquire().await?;
        let mut results = Vec::with_capacity(requests.len());
        for (index, request) in requests.iter().enumerate() {
            let limit = request
                .timeout()
                .or(batch_timeout)
                .unwrap_or(self.default_timeout);
            let start = Instant::now();
            let outcome = run_statement(&mut conn, request, limit).await;
            log_statement(&request.sql, start, &outcome);
            match outcome {
                Ok(result) => results.push(result),
                Err(source) => {
                    warn!(
                        index,
                        completed = results.len(),
                        "Batch aborted; earlier statements remain applied"
                    );
                    return Err(DatabaseError::BatchAborted {
                        index,
                        completed: results.len(),
                        source: Box::new(source),
                    }
                    .into());
                }
            }
        }
        Ok(results)
    }

    /// Run statements atomically: all commit or none do.
    ///
    /// The work runs on its own task, so dropping the returned future does not
    /// interrupt it; commit or rollback and the connection release still happen.
    #[instrument(skip(self, requests), fields(statements = requests.len()))]
    pub async fn execute_transaction(
        &self,
        requests: Vec<QueryRequest>,
        tx_timeout: Option<Duration>,
    ) -> Result<Vec<QueryResult>> {
        check_count(
            requests.len(),
            self.limits.max_transaction_size,
            "Transaction",
            ValidationCode::TransactionTooLarge,
        )?;

        let limit = tx_timeout.unwrap_or(self.default_timeout);
        let pool = self.pool.clone();
        let task = tokio::spawn(async move {
            let mut conn = pool.acquire().await?;
            run_transaction(&mut conn, &requests, limit).await
        });

        match task.await {
            Ok(outcome) => Ok(outcome?),
            Err(e) => Err(DatabaseError::TaskFailed(e.to_string()).into()),
        }
    }

    /// Database reachability check.
    pub async fn ping(&self) -> bool {
        let check = QueryRequest::new("SELECT 1").with_timeout(PING_TIMEOUT);
        match self.execute(&check).await {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "Database ping failed");
                false
            }
        }
    }

    pub async fn insert(&self, request: &InsertRequest) -> Result<QueryResult> {
        let statement = self.build_insert(request)?;
        self.execute(&statement).await
    }

    pub async fn update(&self, request: &UpdateRequest) -> Result<QueryResult> {
        let statement = self.build_update(request)?;
        self.execute(&statement).await
    }

    pub async fn delete(&self, request: &DeleteRequest) -> Result<QueryResult> {
        let statement = self.build_delete(request)?;
        self.execute(&statement).await
    }

    /// `INSERT INTO t (cols) VALUES ($1, ..), (..) [RETURNING ..]`.
    pub fn build_insert(&self, request: &InsertRequest) -> Result<QueryRequest> {
        let table = self.identifiers.sanitize_table(&request.table)?;
        let rows = request.data.rows();
        if rows.is_empty() || rows.iter().any(|row| row.is_empty()) {
            return Err(reject(ValidationCode::EmptyData, "Insert data must not be empty"));
        }
        if rows.len() > self.limits.max_insert_rows {
            return Err(reject(
                ValidationCode::InsertTooLarge,
                format!(
                    "Insert of {} rows exceeds the limit of {}",
                    rows.len(),
                    self.limits.max_insert_rows
                ),
            ));
        }

        let keys: Vec<&String> = rows[0].keys().collect();
        if rows
            .iter()
            .any(|row| row.len() != keys.len() || keys.iter().any(|k| !row.contains_key(*k)))
        {
            return Err(reject(
                ValidationCode::InconsistentColumns,
                "Every row must have the same columns",
            ));
        }
        if rows.len() * keys.len() > MAX_BIND_PARAMS {
            return Err(reject(
                ValidationCode::InsertTooLarge,
                "Insert exceeds the bind parameter limit",
            ));
        }

        let columns = self.columns(keys.iter().map(|k| k.as_str()))?;
        let mut params = Vec::with_capacity(rows.len() * keys.len());
        let mut tuples = Vec::with_capacity(rows.len());
        for row in &rows {
            let placeholders: Vec<String> = keys
                .iter()
                .map(|key| {
                    params.push(SqlValue::from(row[key.as_str()].clone()));
                    format!("${}", params.len())
                })
                .collect();
            tuples.push(format!("({})", placeholders.join(", ")));
        }

        let sql = format!(
            "INSERT INTO {} ({}) VALUES {}{}",
            table,
            columns.join(", "),
            tuples.join(", "),
            self.returning(&request.returning)?
        );
        Ok(QueryRequest::new(sql).with_params(params))
    }

    /// `UPDATE t SET .. WHERE .. [RETURNING ..]`.
    pub fn build_update(&self, request: &UpdateRequest) -> Result<QueryRequest> {
        let table = self.identifiers.sanitize_table(&request.table)?;
        if request.data.is_empty() {
            return Err(reject(ValidationCode::EmptyData, "Update data must not be empty"));
        }
        if request.filter.is_empty() {
            return Err(reject(
                ValidationCode::MissingWhere,
                "Update requires a non-empty where clause",
            ));
        }

        let mut params = Vec::new();
        let mut assignments = Vec::with_capacity(request.data.len());
        for (key, value) in &request.data {
            let column = self.identifiers.sanitize_column(key)?;
            params.push(SqlValue::from(value.clone()));
            assignments.push(format!("{} = ${}", column, params.len()));
        }
        let condition = self.where_clause(&request.filter, &mut params)?;

        let sql = format!(
            "UPDATE {} SET {} WHERE {}{}",
            table,
            assignments.join(", "),
            condition,
            self.returning(&request.returning)?
        );
        Ok(QueryRequest::new(sql).with_params(params))
    }

    /// `DELETE FROM t WHERE .. [RETURNING ..]`.
    pub fn build_delete(&self, request: &DeleteRequest) -> Result<QueryRequest> {
        let table = self.identifiers.sanitize_table(&request.table)?;
        if request.filter.is_empty() {
            return Err(reject(
                ValidationCode::MissingWhere,
                "Delete requires a non-empty where clause",
            ));
        }

        let mut params = Vec::new();
        let condition = self.where_clause(&request.filter, &mut params)?;
        let sql = format!(
            "DELETE FROM {} WHERE {}{}",
            table,
            condition,
            self.returning(&request.returning)?
        );
        Ok(QueryRequest::new(sql).with_params(params))
    }

    fn columns<'a>(&self, names: impl Iterator<Item = &'a str>) -> Result<Vec<String>> {
        names
            .map(|name| self.identifiers.sanitize_column(name).map_err(Into::into))
            .collect()
    }

    /// Equality conjunction; `null` compares with `IS NULL`.
    fn where_clause(&self, filter: &Map<String, Value>, params: &mut Vec<SqlValue>) -> Result<String> {
        let mut terms = Vec::with_capacity(filter.len());
        for (key, value) in filter {
            let column = self.identifiers.sanitize_column(key)?;
            if value.is_null() {
                terms.push(format!("{} IS NULL", column));
            } else {
                params.push(SqlValue::from(value.clone()));
                terms.push(format!("{} = ${}", column, params.len()));
            }
        }
        Ok(terms.join(" AND "))
    }

    fn returning(&self, returning: &Returning) -> Result<String> {
        match returning {
            Returning::All(false) => Ok(String::new()),
            Returning::All(true) => Ok(" RETURNING *".to_string()),
            Returning::Columns(names) if names.is_empty() => Ok(String::new()),
            Returning::Columns(names) => {
                let columns = self.identifiers.sanitize_columns(names)?;
                Ok(format!(" RETURNING {}", columns.join(", ")))
            }
        }
    }
}

async fn run_statement<B: Backend>(
    conn: &mut PooledConnection<B>,
    request: &QueryRequest,
    limit: Duration,
) -> DbResult<QueryResult> {
    let ms = limit.as_millis() as u64;
    match timeout(limit, conn.query(&request.sql, &request.params)).await {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(DatabaseError::Timeout(0))) => Err(DatabaseError::Timeout(ms)),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(DatabaseError::Timeout(ms)),
    }
}

async fn run_transaction<B: Backend>(
    conn: &mut PooledConnection<B>,
    requests: &[QueryRequest],
    limit: Duration,
) -> DbResult<Vec<QueryResult>> {
    let outcome = match control(conn, "BEGIN", limit).await {
        Ok(()) => match apply_statements(conn, requests, limit).await {
            Ok(results) => control(conn, "COMMIT", limit).await.map(|()| results),
            Err(e) => Err(e),
        },
        Err(e) => Err(e),
    };

    match outcome {
        Ok(results) => {
            debug!(lease_id = conn.id(), statements = results.len(), "Transaction committed");
            Ok(results)
        }
        Err(e) if conn.is_interrupted() => {
            // Closing the session aborts the open transaction server-side.
            warn!(lease_id = conn.id(), error = %e, "Transaction interrupted; discarding connection");
            conn.discard();
            Err(e)
        }
        Err(e) => {
            rollback(conn).await;
            Err(e)
        }
    }
}

/// Transaction control statement under the transaction timeout.
async fn control<B: Backend>(
    conn: &mut PooledConnection<B>,
    sql: &str,
    limit: Duration,
) -> DbResult<()> {
    match timeout(limit, conn.simple_execute(sql)).await {
        Ok(result) => result,
        Err(_) => Err(DatabaseError::Timeout(limit.as_millis() as u64)),
    }
}

async fn apply_statements<B: Backend>(
    conn: &mut PooledConnection<B>,
    requests: &[QueryRequest],
    limit: Duration,
) -> DbResult<Vec<QueryResult>> {
    let set_timeout = format!("SET LOCAL statement_timeout = {}", limit.as_millis());
    control(conn, &set_timeout, limit).await?;

    let mut results = Vec::with_capacity(requests.len());
    for request in requests {
        let start = Instant::now();
        let outcome = run_statement(conn, request, request.timeout().unwrap_or(limit)).await;
        log_statement(&request.sql, start, &outcome);
        results.push(outcome?);
    }
    Ok(results)
}

async fn rollback<B: Backend>(conn: &mut PooledConnection<B>) {
    match timeout(ROLLBACK_TIMEOUT, conn.simple_execute("ROLLBACK")).await {
        Ok(Ok(())) => debug!(lease_id = conn.id(), "Transaction rolled back"),
        Ok(Err(e)) => {
            warn!(lease_id = conn.id(), error = %e, "Rollback failed; discarding connection");
            conn.discard();
        }
        Err(_) => {
            warn!(lease_id = conn.id(), "Rollback timed out; discarding connection");
            conn.discard();
        }
    }
}

fn log_statement(sql: &str, start: Instant, outcome: &DbResult<QueryResult>) {
    let duration_ms = start.elapsed().as_millis() as u64;
    match outcome {
        Ok(result) => info!(
            sql = %preview(sql),
            duration_ms,
            rows = result.row_count,
            "Statement executed"
        ),
        Err(e) => warn!(
            sql = %preview(sql),
            duration_ms,
            kind = e.kind().as_str(),
            code = e.code(),
            error = %e,
            "Statement failed"
        ),
    }
}

fn check_count(len: usize, max: usize, what: &str, too_large: ValidationCode) -> Result<()> {
    if len == 0 {
        return Err(reject(
            ValidationCode::EmptyBatch,
            format!("{} must contain at least one statement", what),
        ));
    }
    if len > max {
        return Err(reject(
            too_large,
            format!("{} of {} statements exceeds the limit of {}", what, len, max),
        ));
    }
    Ok(())
}

fn reject(code: ValidationCode, message: impl Into<String>) -> crate::error::GatewayError {
    ValidationError::new(code, message).into()
}
