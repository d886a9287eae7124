//! In-memory backend for tests.
//!
//! Understands just enough SQL for the pool, executor and gateway tests:
//! `INSERT INTO t [(cols)] VALUES ...`, `UPDATE t SET ... WHERE ...`,
//! `DELETE FROM t WHERE ...`, `SELECT * FROM t`, `SELECT 1`,
//! `SELECT pg_sleep($1)` and transaction control. Rows are `(id, value)` pairs
//! keyed uniquely by `id`; tables must be created up front.

use crate::database::result::{CellValue, Column, QueryResult, Row, SqlValue};
use crate::database::traits::{Backend, Session};
use crate::error::{DatabaseError, DbResult, IntegrityKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

type Tables = HashMap<String, Vec<Vec<SqlValue>>>;

#[derive(Clone, Default)]
pub struct MemoryBackend {
    tables: Arc<Mutex<Tables>>,
    connects: Arc<AtomicU32>,
    fail_connect: Arc<AtomicBool>,
    stall_control: Arc<AtomicBool>,
    log: Arc<Mutex<Vec<String>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(self, name: &str) -> Self {
        self.tables.lock().insert(name.to_string(), Vec::new());
        self
    }

    pub fn rows(&self, table: &str) -> Vec<Vec<SqlValue>> {
        self.tables.lock().get(table).cloned().unwrap_or_default()
    }

    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.fail_connect.store(unreachable, Ordering::SeqCst);
    }

    /// Make BEGIN/COMMIT/ROLLBACK/SET hang forever.
    pub fn set_control_stalled(&self, stalled: bool) {
        self.stall_control.store(stalled, Ordering::SeqCst);
    }

    /// Every statement executed by any session, in order.
    pub fn statements(&self) -> Vec<String> {
        self.log.lock().clone()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    type Session = MemorySession;

    fn name(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self) -> DbResult<MemorySession> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(DatabaseError::ConnectionFailed("connection refused".into()));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(MemorySession {
            backend: self.clone(),
            tx: None,
        })
    }
}

pub struct MemorySession {
    backend: MemoryBackend,
    tx: Option<Tables>,
}

impl MemorySession {
    fn apply<T>(&mut self, f: impl FnOnce(&mut Tables) -> DbResult<T>) -> DbResult<T> {
        match self.tx.as_mut() {
            Some(snapshot) => f(snapshot),
            None => f(&mut *self.backend.tables.lock()),
        }
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> DbResult<QueryResult> {
        self.backend.log.lock().push(sql.to_string());
        let upper = sql.trim().to_uppercase();

        if upper.contains("PG_SLEEP") {
            let secs = match params.first() {
                Some(SqlValue::Float(f)) => *f,
                Some(SqlValue::Int(i)) => *i as f64,
                _ => 0.0,
            };
            tokio::time::sleep(Duration::from_secs_f64(secs)).await;
            return Ok(QueryResult::affected(1, 0));
        }
        if upper == "SELECT 1" {
            let mut row = Row::new();
            row.insert("?column?".into(), CellValue::Int(1));
            return Ok(QueryResult::new(vec![Column::new("?column?", "int4")], vec![row], 0));
        }

        let returning = upper.contains("RETURNING");
        let table = table_after(sql, &upper)?;

        if upper.starts_with("INSERT") {
            let width = column_count(sql).unwrap_or(params.len().max(1));
            let inserted = self.apply(|tables| {
                let rows = tables.get_mut(&table).ok_or_else(|| undefined(&table))?;
                let mut inserted = Vec::new();
                for chunk in params.chunks(width) {
                    if rows.iter().any(|r| r.first() == chunk.first()) {
                        return Err(DatabaseError::Integrity {
                            kind: IntegrityKind::Unique,
                            message: format!("duplicate key value violates unique constraint on {}", table),
                        });
                    }
                    rows.push(chunk.to_vec());
                    inserted.push(chunk.to_vec());
                }
                Ok(inserted)
            })?;
            return Ok(shape(inserted, returning));
        }

        if upper.starts_with("UPDATE") {
            let (value, key) = match (params.first(), params.last()) {
                (Some(v), Some(k)) => (v.clone(), k.clone()),
                _ => return Err(syntax("UPDATE needs a value and a key")),
            };
            let updated = self.apply(|tables| {
                let rows = tables.get_mut(&table).ok_or_else(|| undefined(&table))?;
                let mut updated = Vec::new();
                for row in rows.iter_mut().filter(|r| r.first() == Some(&key)) {
                    if row.len() < 2 {
                        row.push(SqlValue::Null);
                    }
                    row[1] = value.clone();
                    updated.push(row.clone());
                }
                Ok(updated)
            })?;
            return Ok(shape(updated, returning));
        }

        if upper.starts_with("DELETE") {
            let key = params.first().cloned();
            let deleted = self.apply(|tables| {
                let rows = tables.get_mut(&table).ok_or_else(|| undefined(&table))?;
                let (gone, kept): (Vec<_>, Vec<_>) =
                    rows.drain(..).partition(|r| key.is_none() || r.first() == key.as_ref());
                *rows = kept;
                Ok(gone)
            })?;
            return Ok(shape(deleted, returning));
        }

        if upper.starts_with("SELECT") {
            let rows = self.apply(|tables| {
                tables.get(&table).cloned().ok_or_else(|| undefined(&table))
            })?;
            return Ok(shape(rows, true));
        }

        Err(syntax("unsupported statement"))
    }

    async fn simple_execute(&mut self, sql: &str) -> DbResult<()> {
        self.backend.log.lock().push(sql.to_string());
        if self.backend.stall_control.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let upper = sql.trim().to_uppercase();
        match upper.as_str() {
            "BEGIN" => {
                self.tx = Some(self.backend.tables.lock().clone());
            }
            "COMMIT" => {
                if let Some(snapshot) = self.tx.take() {
                    *self.backend.tables.lock() = snapshot;
                }
            }
            "ROLLBACK" => {
                self.tx = None;
            }
            s if s.starts_with("SET LOCAL STATEMENT_TIMEOUT") => {}
            _ => return Err(syntax("unsupported control statement")),
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        false
    }
}

fn table_after(sql: &str, upper: &str) -> DbResult<String> {
    let keyword = ["INSERT INTO ", "DELETE FROM ", "UPDATE ", " FROM "]
        .into_iter()
        .find_map(|kw| upper.find(kw).map(|idx| idx + kw.len()))
        .ok_or_else(|| syntax("no table"))?;
    let name: String = sql[keyword..]
        .trim_start()
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_' || *c == '"' || *c == '.')
        .filter(|c| *c != '"')
        .collect();
    Ok(name)
}

fn column_count(sql: &str) -> Option<usize> {
    let open = sql.find('(')?;
    let close = sql[open..].find(')')? + open;
    let values = sql.to_uppercase().find("VALUES")?;
    if open > values {
        return None;
    }
    Some(sql[open + 1..close].split(',').count())
}

fn shape(rows: Vec<Vec<SqlValue>>, returning: bool) -> QueryResult {
    if !returning {
        return QueryResult::affected(rows.len() as u64, 0);
    }
    let fields = vec![Column::new("id", "int8"), Column::new("value", "text")];
    let rows = rows
        .iter()
        .map(|r| {
            let mut row = Row::new();
            for (i, v) in r.iter().enumerate() {
                let name = match i {
                    0 => "id".to_string(),
                    1 => "value".to_string(),
                    n => format!("c{}", n),
                };
                row.insert(name, CellValue::from(v));
            }
            row
        })
        .collect();
    QueryResult::new(fields, rows, 0)
}

fn undefined(table: &str) -> DatabaseError {
    DatabaseError::QueryFailed {
        sqlstate: Some("42P01".into()),
        message: format!("relation \"{}\" does not exist", table),
    }
}

fn syntax(message: &str) -> DatabaseError {
    DatabaseError::QueryFailed {
        sqlstate: Some("42601".into()),
        message: message.to_string(),
    }
}
