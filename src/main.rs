//! Gateway binary.
//!
//! Reads one JSON request envelope per line on stdin and writes one JSON
//! response per line on stdout. Logs go to stderr.

use anyhow::Result;
use pg_gateway::{
    config::{GatewayConfig, RateLimitConfig},
    database::PgBackend,
    security::{RateLimitStore, RedisStore},
    server::{Gateway, GatewayRequest, Operation},
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

/// One inbound line.
#[derive(Debug, Deserialize)]
struct Envelope {
    operation: String,
    #[serde(default)]
    body: Value,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    peer: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!(
        "Starting {} v{}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let config = GatewayConfig::builder().from_env()?.build()?;
    let backend = PgBackend::new(config.database.clone());
    let shared_store = connect_shared_store(&config.rate_limit).await;

    let gateway = Arc::new(Gateway::new(config, backend, shared_store)?);
    gateway.start().await;

    let health = gateway.health().await;
    if health.database {
        info!(pool_idle = health.pool.idle, "Database reachable");
    } else {
        warn!("Database unreachable at startup; requests will fail until it recovers");
    }

    tokio::select! {
        result = serve_stdio(Arc::clone(&gateway)) => result?,
        _ = tokio::signal::ctrl_c() => info!("Interrupt received"),
    }

    gateway.shutdown();
    info!("Gateway stopped");
    Ok(())
}

/// Connect the shared admission store, or run with local counters only.
async fn connect_shared_store(config: &RateLimitConfig) -> Option<Arc<dyn RateLimitStore>> {
    let url = config.redis_url.as_deref()?;
    match RedisStore::connect(url, config.key_prefix.clone(), config.store_timeout).await {
        Ok(store) => {
            info!("Using shared rate-limit store");
            Some(Arc::new(store))
        }
        Err(e) => {
            warn!(error = %e, "Shared rate-limit store unavailable; using local counters");
            None
        }
    }
}

async fn serve_stdio(gateway: Arc<Gateway<PgBackend>>) -> Result<()> {
    let (tx, mut rx) = mpsc::channel::<String>(64);

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = rx.recv().await {
            if let Err(e) = write_line(&mut stdout, &line).await {
                error!(error = %e, "Failed to write response");
                break;
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let gateway = Arc::clone(&gateway);
        let tx = tx.clone();
        tokio::spawn(async move {
            let reply = respond(&gateway, &line).await;
            if tx.send(reply.to_string()).await.is_err() {
                warn!("Response channel closed");
            }
        });
    }

    drop(tx);
    if let Err(e) = writer.await {
        error!(error = %e, "Response writer failed");
    }
    info!("Input closed");
    Ok(())
}

async fn respond(gateway: &Gateway<PgBackend>, line: &str) -> Value {
    let envelope: Envelope = match serde_json::from_str(line) {
        Ok(envelope) => envelope,
        Err(e) => return json!({"success": false, "error": {"code": "INVALID_ENVELOPE", "message": e.to_string()}}),
    };

    if envelope.operation == "health" {
        return serde_json::to_value(gateway.health().await).unwrap_or(Value::Null);
    }

    let operation = match Operation::from_json(&envelope.operation, envelope.body) {
        Ok(operation) => operation,
        Err(e) => {
            return json!({
                "success": false,
                "error": {"kind": e.kind().as_str(), "code": e.code(), "message": e.public_message()}
            });
        }
    };

    let request = GatewayRequest {
        peer: envelope.peer,
        headers: envelope.headers,
        operation,
    };
    let response = gateway.handle(request).await;
    let headers: HashMap<&str, &str> = response
        .headers
        .iter()
        .map(|(name, value)| (*name, value.as_str()))
        .collect();
    match serde_json::to_value(&response) {
        Ok(mut body) => {
            body["headers"] = json!(headers);
            body
        }
        Err(e) => json!({"success": false, "error": {"code": "INTERNAL_ERROR", "message": e.to_string()}}),
    }
}

async fn write_line(stdout: &mut tokio::io::Stdout, content: &str) -> std::io::Result<()> {
    stdout.write_all(content.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pg_gateway=info,warn"));

    // stdout carries responses; logs go to stderr.
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .json()
        .init();
}
