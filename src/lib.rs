//! Guarded PostgreSQL gateway.
//!
//! Sits between untrusted clients and a database: resolves the client
//! identity, applies IP and credential rules, enforces sliding-window and
//! burst admission limits, checks SQL against a policy, then executes
//! parameterized statements through a bounded, leak-reclaiming pool.
//!
//! # Example
//!
//! ```no_run
//! use pg_gateway::{
//!     config::GatewayConfig,
//!     database::{PgBackend, QueryRequest},
//!     server::{Gateway, GatewayRequest, Operation},
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = GatewayConfig::builder().from_env()?.build()?;
//!     let backend = PgBackend::new(config.database.clone());
//!
//!     // No shared store: admission counters stay in process.
//!     let gateway = Gateway::new(config, backend, None)?;
//!     gateway.start().await;
//!
//!     // Forwarded headers count because the loopback peer is a trusted proxy.
//!     let request = GatewayRequest::new(Operation::Query(QueryRequest::new("SELECT 1")))
//!         .peer("127.0.0.1:39000".parse()?)
//!         .header("x-forwarded-for", "203.0.113.7");
//!     let response = gateway.handle(request).await;
//!     println!("{}", serde_json::to_string(&response)?);
//!
//!     gateway.shutdown();
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod database;
pub mod error;
pub mod security;
pub mod server;

pub use config::{DatabaseConfig, DatabaseConfigBuilder, GatewayConfig};
pub use database::{ExecutionEngine, PgBackend, Pool, QueryRequest, QueryResult};
pub use error::{ErrorKind, GatewayError, Result};
pub use security::{AdmissionController, IdentifierSanitizer, SqlValidator};
pub use server::{Gateway, GatewayRequest, GatewayResponse};
