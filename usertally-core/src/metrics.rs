//! Process-wide metrics, exposed over an optional HTTP endpoint. Counters are
//! registered once into a global registry; callers grab them through
//! [`metrics`].

use std::net::SocketAddr;
use std::sync::OnceLock;

use axum::Router;
use axum::body::Body;
use axum::http::{Response, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::{Error, Result};

pub struct UsertallyMetrics {
    /// Raw payloads read from the source.
    pub payloads_read: Counter,
    /// Payloads that failed to decode or validate.
    pub decode_failures: Counter,
    /// Records dropped because their window had already closed.
    pub late_dropped: Counter,
    /// Windows that could not be opened because a shard's ring was full.
    pub ring_overflows: Counter,
    pub windows_closed: Counter,
    /// Per-user tallies written to the sink.
    pub tallies_emitted: Counter,
    /// Sink writes that had to be retried.
    pub sink_retries: Counter,
    /// Cardinality of the user-to-shard assignment map (unbounded by design).
    pub assigned_users: Gauge,
}

impl UsertallyMetrics {
    fn new() -> Self {
        Self {
            payloads_read: Counter::default(),
            decode_failures: Counter::default(),
            late_dropped: Counter::default(),
            ring_overflows: Counter::default(),
            windows_closed: Counter::default(),
            tallies_emitted: Counter::default(),
            sink_retries: Counter::default(),
            assigned_users: Gauge::default(),
        }
    }
}

static METRICS: OnceLock<UsertallyMetrics> = OnceLock::new();
static REGISTRY: OnceLock<Registry> = OnceLock::new();

pub fn metrics() -> &'static UsertallyMetrics {
    METRICS.get_or_init(UsertallyMetrics::new)
}

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| {
        let mut registry = Registry::with_prefix("usertally");
        let m = metrics();
        registry.register(
            "payloads_read",
            "Raw payloads read from the source",
            m.payloads_read.clone(),
        );
        registry.register(
            "decode_failures",
            "Payloads dropped at the decode boundary",
            m.decode_failures.clone(),
        );
        registry.register(
            "late_dropped",
            "Records dropped because their window had already closed",
            m.late_dropped.clone(),
        );
        registry.register(
            "ring_overflows",
            "Window-open failures due to a full ring",
            m.ring_overflows.clone(),
        );
        registry.register(
            "windows_closed",
            "Windows evicted and handed to the sink",
            m.windows_closed.clone(),
        );
        registry.register(
            "tallies_emitted",
            "Per-user tallies written to the sink",
            m.tallies_emitted.clone(),
        );
        registry.register(
            "sink_retries",
            "Sink writes that had to be retried",
            m.sink_retries.clone(),
        );
        registry.register(
            "assigned_users",
            "Users currently pinned to a shard",
            m.assigned_users.clone(),
        );
        registry
    })
}

async fn metrics_handler() -> impl IntoResponse {
    let mut buffer = String::new();
    if let Err(e) = encode(&mut buffer, registry()) {
        error!(?e, "Failed to encode metrics");
        return Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(Body::empty())
            .expect("empty response is valid");
    }
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; version=0.0.4")
        .body(Body::from(buffer))
        .expect("encoded metrics are a valid body")
}

async fn livez() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

/// Serves /metrics and /livez until the token is cancelled.
pub async fn start_metrics_server(addr: SocketAddr, cln_token: CancellationToken) -> Result<()> {
    let router = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/livez", get(livez));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Metrics(format!("Binding metrics server to {addr}: {e}")))?;
    info!(?addr, "Serving metrics");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cln_token.cancelled().await })
        .await
        .map_err(|e| Error::Metrics(format!("Running metrics server: {e}")))
}
