//! Database backend traits.

use crate::database::result::{QueryResult, SqlValue};
use crate::error::DbResult;
use async_trait::async_trait;
use serde::Serialize;

/// Opens physical connections for the pool.
///
/// Implementations: [`PgBackend`](crate::database::PgBackend).
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    type Session: Session;

    /// Returns the backend name (e.g., "postgres").
    fn name(&self) -> &'static str;

    /// Opens one new connection.
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError::ConnectionFailed`](crate::error::DatabaseError::ConnectionFailed)
    /// when the server cannot be reached or rejects the login.
    async fn connect(&self) -> DbResult<Self::Session>;
}

/// One open connection.
#[async_trait]
pub trait Session: Send + 'static {
    /// Executes a parameterized statement.
    ///
    /// Statements with a result set return their rows; everything else returns
    /// the affected row count with no rows.
    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> DbResult<QueryResult>;

    /// Executes parameterless control statements such as `BEGIN` or `ROLLBACK`.
    async fn simple_execute(&mut self, sql: &str) -> DbResult<()>;

    /// Whether the underlying connection is known to be unusable.
    fn is_closed(&self) -> bool;
}

/// Pool status information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    /// Open connections, idle and leased.
    pub total: u32,
    pub idle: u32,
    /// Callers currently blocked in `acquire`.
    pub waiting: u32,
    pub leased: u32,
    pub max_size: u32,
    /// Leases force-reclaimed since startup.
    pub leaks_reclaimed: u64,
}
