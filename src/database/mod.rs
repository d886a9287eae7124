//! Database execution layer.
//!
//! [`Pool`] leases connections opened by a [`Backend`]; [`ExecutionEngine`]
//! runs statements, batches and transactions on top of it. PostgreSQL is the
//! production backend.

pub mod executor;
#[cfg(test)]
pub mod mock;
pub mod pool;
pub mod postgres;
pub mod result;
pub mod traits;

pub use executor::{
    BatchRequest, DeleteRequest, ExecutionEngine, InsertRequest, Returning, RowData, UpdateRequest,
};
pub use pool::{Pool, PooledConnection};
pub use postgres::PgBackend;
pub use result::*;
pub use traits::{Backend, PoolStatus, Session};
