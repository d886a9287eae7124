//! Error types for the gateway.
//!
//! Uses `thiserror` for ergonomic error definitions with automatic `From` conversions.
//! Every error maps onto an [`ErrorKind`] so callers can decide whether a retry
//! makes sense, and onto a stable machine-readable code.

use serde::Serialize;
use std::borrow::Cow;
use std::time::Duration;
use thiserror::Error;

/// Classification shared by every error the gateway can surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ValidationRejected,
    AdmissionDenied,
    AccessDenied,
    ResourceExhausted,
    ExecutionTimeout,
    IntegrityViolation,
    TransportFailure,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationRejected => "validation_rejected",
            Self::AdmissionDenied => "admission_denied",
            Self::AccessDenied => "access_denied",
            Self::ResourceExhausted => "resource_exhausted",
            Self::ExecutionTimeout => "execution_timeout",
            Self::IntegrityViolation => "integrity_violation",
            Self::TransportFailure => "transport_failure",
            Self::Internal => "internal",
        }
    }

    /// Whether the same request may succeed later without changes.
    ///
    /// Execution timeouts are excluded: only read-only statements are safe to
    /// replay and the kind alone cannot tell.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::AdmissionDenied | Self::ResourceExhausted | Self::TransportFailure
        )
    }
}

/// Main error type for the gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Security error: {0}")]
    Security(#[from] SecurityError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Rate-limit store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::ValidationRejected,
            Self::Security(e) => e.kind(),
            Self::Database(e) => e.kind(),
            // A malformed request body is a caller problem.
            Self::Json(_) => ErrorKind::ValidationRejected,
            Self::Store(_) | Self::Config(_) => ErrorKind::Internal,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(e) => e.code.as_str(),
            Self::Security(e) => e.code(),
            Self::Database(e) => e.code(),
            Self::Json(_) => "INVALID_REQUEST_BODY",
            Self::Store(_) => "RATE_LIMIT_STORE_ERROR",
            Self::Config(_) => "CONFIGURATION_ERROR",
        }
    }

    /// Message safe to return to an untrusted client.
    ///
    /// Driver and internal errors are reduced to a generic sentence; the full
    /// text is only written to operator logs.
    pub fn public_message(&self) -> String {
        match self {
            Self::Validation(e) => e.message.clone(),
            Self::Security(e) => e.to_string(),
            Self::Database(e) => e.public_message(),
            Self::Json(e) => format!("Invalid request body: {}", e),
            Self::Store(_) | Self::Config(_) => "An internal error occurred".to_string(),
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Security(SecurityError::RateLimited { retry_after, .. }) => Some(*retry_after),
            _ => None,
        }
    }
}

/// Rule identifiers for rejected identifiers, statements and request shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationCode {
    MissingSql,
    QueryTooLong,
    TooManyParams,
    ParamTooLong,
    DangerousQuery,
    MultipleStatements,
    UnsafeDelete,
    LineComment,
    BlockComment,
    SystemTableAccess,
    FileAccess,
    CopyFileAccess,
    InvalidTableName,
    TableBlocked,
    TableNotAllowed,
    InvalidColumnName,
    ColumnBlocked,
    EmptyData,
    InconsistentColumns,
    MissingWhere,
    EmptyBatch,
    BatchTooLarge,
    TransactionTooLarge,
    InsertTooLarge,
    InvalidParameter,
    UnknownOperation,
}

impl ValidationCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingSql => "MISSING_SQL",
            Self::QueryTooLong => "QUERY_TOO_LONG",
            Self::TooManyParams => "TOO_MANY_PARAMS",
            Self::ParamTooLong => "PARAM_TOO_LONG",
            Self::DangerousQuery => "DANGEROUS_QUERY",
            Self::MultipleStatements => "MULTIPLE_STATEMENTS",
            Self::UnsafeDelete => "UNSAFE_DELETE",
            Self::LineComment => "LINE_COMMENT",
            Self::BlockComment => "BLOCK_COMMENT",
            Self::SystemTableAccess => "SYSTEM_TABLE_ACCESS",
            Self::FileAccess => "FILE_ACCESS",
            Self::CopyFileAccess => "COPY_FILE_ACCESS",
            Self::InvalidTableName => "INVALID_TABLE_NAME",
            Self::TableBlocked => "TABLE_BLOCKED",
            Self::TableNotAllowed => "TABLE_NOT_ALLOWED",
            Self::InvalidColumnName => "INVALID_COLUMN_NAME",
            Self::ColumnBlocked => "COLUMN_BLOCKED",
            Self::EmptyData => "EMPTY_DATA",
            Self::InconsistentColumns => "INCONSISTENT_COLUMNS",
            Self::MissingWhere => "MISSING_WHERE",
            Self::EmptyBatch => "EMPTY_BATCH",
            Self::BatchTooLarge => "BATCH_TOO_LARGE",
            Self::TransactionTooLarge => "TRANSACTION_TOO_LARGE",
            Self::InsertTooLarge => "INSERT_TOO_LARGE",
            Self::InvalidParameter => "INVALID_PARAMETER",
            Self::UnknownOperation => "UNKNOWN_OPERATION",
        }
    }
}

/// A rejected identifier, statement or request shape.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ValidationError {
    pub code: ValidationCode,
    pub message: String,
}

impl ValidationError {
    pub fn new(code: ValidationCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Admission and access-control rejections.
#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("Rate limit exceeded: {count} requests against a limit of {limit}")]
    RateLimited {
        limit: u32,
        count: u32,
        retry_after: Duration,
        burst: bool,
    },

    #[error("Client is temporarily blocked")]
    Blocked,

    #[error("Client address is blocked")]
    IpBlocked,

    #[error("Client address is not allowed")]
    IpNotAllowed,

    #[error("Missing credential")]
    MissingCredential,

    #[error("Invalid credential")]
    InvalidCredential,
}

impl SecurityError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RateLimited { .. } => ErrorKind::AdmissionDenied,
            _ => ErrorKind::AccessDenied,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimited { burst: true, .. } => "BURST_LIMIT_EXCEEDED",
            Self::RateLimited { burst: false, .. } => "RATE_LIMIT_EXCEEDED",
            Self::Blocked => "CLIENT_BLOCKED",
            Self::IpBlocked => "IP_BLOCKED",
            Self::IpNotAllowed => "IP_NOT_ALLOWED",
            Self::MissingCredential => "MISSING_CREDENTIAL",
            Self::InvalidCredential => "INVALID_CREDENTIAL",
        }
    }
}

/// Constraint families surfaced as integrity violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityKind {
    Unique,
    ForeignKey,
    NotNull,
    Check,
}

impl IntegrityKind {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unique => "UNIQUE_VIOLATION",
            Self::ForeignKey => "FOREIGN_KEY_VIOLATION",
            Self::NotNull => "NOT_NULL_VIOLATION",
            Self::Check => "CHECK_VIOLATION",
        }
    }
}

impl std::fmt::Display for IntegrityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Database-related errors.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Timed out after {0}ms waiting for a pooled connection")]
    PoolTimeout(u64),

    #[error("Connection lease was reclaimed after {0}ms")]
    LeaseReclaimed(u64),

    #[error("Connection pool is closed")]
    PoolClosed,

    #[error("Query timeout after {0}ms")]
    Timeout(u64),

    #[error("Integrity constraint violated ({kind}): {message}")]
    Integrity { kind: IntegrityKind, message: String },

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Query execution failed: {message}")]
    QueryFailed {
        sqlstate: Option<String>,
        message: String,
    },

    #[error("Invalid parameter ${index}: {message}")]
    InvalidParameter { index: usize, message: String },

    #[error("Statement {index} failed after {completed} statements were applied: {source}")]
    BatchAborted {
        index: usize,
        completed: usize,
        #[source]
        source: Box<DatabaseError>,
    },

    #[error("Execution task failed: {0}")]
    TaskFailed(String),
}

impl DatabaseError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PoolTimeout(_) | Self::LeaseReclaimed(_) | Self::PoolClosed => {
                ErrorKind::ResourceExhausted
            }
            Self::Timeout(_) => ErrorKind::ExecutionTimeout,
            Self::Integrity { .. } => ErrorKind::IntegrityViolation,
            Self::ConnectionFailed(_) => ErrorKind::TransportFailure,
            Self::InvalidParameter { .. } => ErrorKind::ValidationRejected,
            Self::BatchAborted { source, .. } => source.kind(),
            Self::QueryFailed { .. } | Self::TaskFailed(_) => ErrorKind::Internal,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::PoolTimeout(_) => "CONNECTION_TIMEOUT",
            Self::LeaseReclaimed(_) => "CONNECTION_RECLAIMED",
            Self::PoolClosed => "POOL_CLOSED",
            Self::Timeout(_) => "QUERY_TIMEOUT",
            Self::Integrity { kind, .. } => kind.code(),
            Self::ConnectionFailed(_) => "DATABASE_UNAVAILABLE",
            Self::InvalidParameter { .. } => ValidationCode::InvalidParameter.as_str(),
            Self::BatchAborted { .. } => "BATCH_ABORTED",
            Self::QueryFailed { .. } | Self::TaskFailed(_) => "DATABASE_ERROR",
        }
    }

    pub fn public_message(&self) -> String {
        match self {
            Self::PoolTimeout(_) | Self::LeaseReclaimed(_) | Self::PoolClosed => {
                "Database is busy, retry later".to_string()
            }
            Self::Timeout(ms) => format!("Query exceeded its {}ms timeout", ms),
            Self::Integrity { kind, .. } => match kind {
                IntegrityKind::Unique => "A record with the same key already exists".to_string(),
                IntegrityKind::ForeignKey => "Referenced record does not exist".to_string(),
                IntegrityKind::NotNull => "A required value is missing".to_string(),
                IntegrityKind::Check => "A value violates a check constraint".to_string(),
            },
            Self::ConnectionFailed(_) => "Database is unavailable".to_string(),
            Self::InvalidParameter { index, message } => {
                format!("Invalid parameter ${}: {}", index, message)
            }
            Self::BatchAborted {
                index,
                completed,
                source,
            } => format!(
                "Statement {} failed after {} statements were applied: {}",
                index,
                completed,
                source.public_message()
            ),
            Self::QueryFailed { .. } | Self::TaskFailed(_) => "Database operation failed".to_string(),
        }
    }
}

/// Errors raised by a rate-limit backing store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Store operation timed out after {0}ms")]
    Timeout(u64),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required field: {0}")]
    MissingField(Cow<'static, str>),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue {
        field: Cow<'static, str>,
        message: Cow<'static, str>,
    },

    #[error("Invalid database URL: {0}")]
    InvalidDatabaseUrl(String),

    #[error("Invalid access rule: {0}")]
    InvalidAccessRule(String),
}

/// Result type alias for GatewayError.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Result type alias for DatabaseError.
pub type DbResult<T> = std::result::Result<T, DatabaseError>;

/// Result type alias for SecurityError.
pub type SecurityResult<T> = std::result::Result<T, SecurityError>;

/// Result type alias for ValidationError.
pub type ValidationResult<T> = std::result::Result<T, ValidationError>;

/// Result type alias for StoreError.
pub type StoreResult<T> = std::result::Result<T, StoreError>;
