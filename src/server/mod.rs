//! Gateway core: wiring, request pipeline and transport-facing types.

pub mod handler;
pub mod state;
pub mod types;

pub use handler::Gateway;
pub use state::GatewayState;
pub use types::{
    ErrorBody, GatewayRequest, GatewayResponse, HealthReport, HealthStatus, Operation,
    ResponseData,
};
