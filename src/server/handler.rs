//! Request pipeline: identity, access, admission, validation, execution.

use crate::config::GatewayConfig;
use crate::database::Backend;
use crate::error::{ErrorKind, GatewayError, Result};
use crate::security::{ClientIdentity, RateLimitStore};
use crate::server::state::GatewayState;
use crate::server::types::{
    ErrorBody, GatewayRequest, GatewayResponse, HealthReport, HealthStatus, Operation,
    ResponseData,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// The gateway core. Transport adapters build a [`GatewayRequest`] and
/// serialize the returned [`GatewayResponse`].
pub struct Gateway<B: Backend> {
    state: Arc<GatewayState<B>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<B: Backend> Gateway<B> {
    pub fn new(
        config: GatewayConfig,
        backend: B,
        shared_store: Option<Arc<dyn RateLimitStore>>,
    ) -> Result<Self> {
        let state = GatewayState::new(config, backend, shared_store)?;
        Ok(Self {
            state: Arc::new(state),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn state(&self) -> &Arc<GatewayState<B>> {
        &self.state
    }

    /// Warm the pool and spawn the background sweeper and reaper.
    ///
    /// A failed warm-up is logged; connections then open on demand.
    pub async fn start(&self) {
        let pool = self.state.pool();
        if let Err(e) = pool.warm_up().await {
            warn!(error = %e, "Pool warm-up failed; connections will open on demand");
        }

        let mut tasks = self.tasks.lock();
        tasks.push(self.state.admission.spawn_sweeper());
        tasks.push(pool.spawn_reaper());

        info!(
            name = %self.state.config.name,
            backend = pool.backend_name(),
            rate_limit_store = self.state.admission.store_status(),
            "Gateway started"
        );
    }

    /// Stop background tasks and close the pool.
    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.state.pool().close();
        info!(
            requests = self.state.request_count(),
            rejected = self.state.rejected_count(),
            "Gateway shut down"
        );
    }

    pub async fn health(&self) -> HealthReport {
        let database = self.state.engine.ping().await;
        let rate_limit_store = self.state.admission.store_status();
        let status = if database && !self.state.admission.is_degraded() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };
        HealthReport {
            status,
            database,
            rate_limit_store,
            pool: self.state.pool().status(),
        }
    }

    /// Run one request through every guard and, if admitted, execute it.
    pub async fn handle(&self, request: GatewayRequest) -> GatewayResponse {
        let request_id = self.state.next_request_id();
        let identity = self.state.access.identify(&request.headers, request.peer);
        let span = info_span!(
            "request",
            id = request_id,
            identity = %identity,
            operation = request.operation.name()
        );
        self.process(identity, request).instrument(span).await
    }

    async fn process(&self, identity: ClientIdentity, request: GatewayRequest) -> GatewayResponse {
        let start = Instant::now();

        if let Err(e) = self.state.access.authorize(&identity, &request.headers) {
            return self.reject(e.into(), None, Vec::new());
        }

        let decision = self.state.admission.admit(identity.as_str()).await;
        let headers = decision.rate_limit_headers();
        if let Some(e) = decision.rejection() {
            return self.reject(e.into(), decision.retry_after, headers);
        }

        match self.dispatch(request.operation).await {
            Ok(data) => {
                info!(
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Request completed"
                );
                GatewayResponse::ok(data, headers)
            }
            Err(e) => self.reject(e, None, headers),
        }
    }

    async fn dispatch(&self, operation: Operation) -> Result<ResponseData> {
        for statement in operation.statements() {
            self.state
                .validator
                .check(&statement.sql, &statement.params)?;
        }

        let engine = &self.state.engine;
        let data = match operation {
            Operation::Query(request) => ResponseData::Single(engine.execute(&request).await?),
            Operation::Batch(batch) => {
                let limit = batch.timeout();
                ResponseData::Many(engine.execute_batch(&batch.queries, limit).await?)
            }
            Operation::Transaction(batch) => {
                let limit = batch.timeout();
                ResponseData::Many(engine.execute_transaction(batch.queries, limit).await?)
            }
            Operation::Insert(request) => ResponseData::Single(engine.insert(&request).await?),
            Operation::Update(request) => ResponseData::Single(engine.update(&request).await?),
            Operation::Delete(request) => ResponseData::Single(engine.delete(&request).await?),
        };
        Ok(data)
    }

    fn reject(
        &self,
        err: GatewayError,
        retry_after: Option<Duration>,
        headers: Vec<(&'static str, String)>,
    ) -> GatewayResponse {
        self.state.record_rejection();
        match err.kind() {
            ErrorKind::Internal => error!(code = err.code(), error = %err, "Request failed"),
            ErrorKind::ValidationRejected | ErrorKind::AccessDenied | ErrorKind::AdmissionDenied => {
                debug!(code = err.code(), error = %err, "Request rejected")
            }
            kind => warn!(code = err.code(), kind = kind.as_str(), error = %err, "Request failed"),
        }
        GatewayResponse::error(ErrorBody::from_error(&err, retry_after), headers)
    }
}
