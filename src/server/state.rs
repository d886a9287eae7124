//! Services shared by every request.

use crate::config::GatewayConfig;
use crate::database::{Backend, ExecutionEngine, Pool};
use crate::error::Result;
use crate::security::{
    AccessControl, AdmissionController, IdentifierSanitizer, RateLimitStore, SqlValidator,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

pub struct GatewayState<B: Backend> {
    pub config: GatewayConfig,
    pub access: AccessControl,
    pub admission: Arc<AdmissionController>,
    pub validator: SqlValidator,
    pub engine: ExecutionEngine<B>,
    request_count: AtomicU64,
    rejected_count: AtomicU64,
}

impl<B: Backend> GatewayState<B> {
    /// Wire every service from one configuration.
    pub fn new(
        config: GatewayConfig,
        backend: B,
        shared_store: Option<Arc<dyn RateLimitStore>>,
    ) -> Result<Self> {
        let access = AccessControl::from_config(&config.access)?;
        let admission = Arc::new(AdmissionController::new(&config.rate_limit, shared_store));
        let identifiers = IdentifierSanitizer::from_config(&config.security);
        let validator = SqlValidator::from_config(&config.security);
        let pool = Pool::new(backend, config.pool.clone());
        let engine = ExecutionEngine::new(pool, identifiers, config.limits.clone());

        Ok(Self {
            config,
            access,
            admission,
            validator,
            engine,
            request_count: AtomicU64::new(0),
            rejected_count: AtomicU64::new(0),
        })
    }

    pub fn pool(&self) -> &Pool<B> {
        self.engine.pool()
    }

    pub fn next_request_id(&self) -> u64 {
        self.request_count.fetch_add(1, Ordering::Relaxed)
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub fn record_rejection(&self) {
        self.rejected_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejected_count.load(Ordering::Relaxed)
    }
}
