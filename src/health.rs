//! Health server for Kubernetes probes and Prometheus metrics
//!
//! Provides HTTP endpoints for:
//! - `/healthz` - Liveness probe (is the process alive?)
//! - `/readyz` - Readiness probe (is the dashboard active?)
//! - `/metrics` - Prometheus metrics

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::info;

/// Port the health server listens on.
pub const HEALTH_PORT: u16 = 8080;

/// Labels for per-event metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct EventLabels {
    pub event: String,
}

impl prometheus_client::encoding::EncodeLabelSet for EventLabels {
    fn encode(
        &self,
        encoder: &mut prometheus_client::encoding::LabelSetEncoder,
    ) -> Result<(), std::fmt::Error> {
        use prometheus_client::encoding::EncodeLabel;
        ("event", self.event.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for the charm status gauge
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct StatusLabels {
    pub status: String,
}

impl prometheus_client::encoding::EncodeLabelSet for StatusLabels {
    fn encode(
        &self,
        encoder: &mut prometheus_client::encoding::LabelSetEncoder,
    ) -> Result<(), std::fmt::Error> {
        use prometheus_client::encoding::EncodeLabel;
        ("status", self.status.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Shared metrics state
pub struct Metrics {
    /// Processed events counter
    pub events_total: Family<EventLabels, Counter>,
    /// Deferred events counter
    pub deferred_events_total: Family<EventLabels, Counter>,
    /// Failed events counter
    pub event_errors_total: Family<EventLabels, Counter>,
    /// Current charm status (1 for the active label, 0 otherwise)
    pub charm_status: Family<StatusLabels, Gauge>,

    /// Prometheus registry
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let events_total = Family::<EventLabels, Counter>::default();
        registry.register(
            "portainer_operator_events",
            "Total number of processed lifecycle events",
            events_total.clone(),
        );

        let deferred_events_total = Family::<EventLabels, Counter>::default();
        registry.register(
            "portainer_operator_deferred_events",
            "Total number of deferred lifecycle events",
            deferred_events_total.clone(),
        );

        let event_errors_total = Family::<EventLabels, Counter>::default();
        registry.register(
            "portainer_operator_event_errors",
            "Total number of failed lifecycle events",
            event_errors_total.clone(),
        );

        let charm_status = Family::<StatusLabels, Gauge>::default();
        registry.register(
            "portainer_operator_status",
            "Current charm status",
            charm_status.clone(),
        );

        Self {
            events_total,
            deferred_events_total,
            event_errors_total,
            charm_status,
            registry,
        }
    }

    /// Encode all metrics in Prometheus text format
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

/// Shared health and metrics state for the probe endpoints.
pub struct HealthState {
    ready: RwLock<bool>,
    last_status: RwLock<Option<String>>,
    metrics: Metrics,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            ready: RwLock::new(false),
            last_status: RwLock::new(None),
            metrics: Metrics::new(),
        }
    }

    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    pub async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }

    /// Update the status gauge, clearing the previously reported label.
    pub async fn set_status(&self, status: &str) {
        let mut last = self.last_status.write().await;
        if let Some(previous) = last.as_ref() {
            self.metrics
                .charm_status
                .get_or_create(&StatusLabels {
                    status: previous.clone(),
                })
                .set(0);
        }
        self.metrics
            .charm_status
            .get_or_create(&StatusLabels {
                status: status.to_string(),
            })
            .set(1);
        *last = Some(status.to_string());
    }

    pub fn record_event(&self, event: &str) {
        self.metrics
            .events_total
            .get_or_create(&EventLabels {
                event: event.to_string(),
            })
            .inc();
    }

    pub fn record_deferred(&self, event: &str) {
        self.metrics
            .deferred_events_total
            .get_or_create(&EventLabels {
                event: event.to_string(),
            })
            .inc();
    }

    pub fn record_error(&self, event: &str) {
        self.metrics
            .event_errors_total
            .get_or_create(&EventLabels {
                event: event.to_string(),
            })
            .inc();
    }

    pub fn encode_metrics(&self) -> Result<String, std::fmt::Error> {
        self.metrics.encode()
    }
}

/// Run the health server until the process exits.
pub async fn run_health_server(state: Arc<HealthState>) -> std::io::Result<()> {
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state);

    let listener = TcpListener::bind(("0.0.0.0", HEALTH_PORT)).await?;
    info!("Health server listening on :{}", HEALTH_PORT);
    axum::serve(listener, app).await
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if state.is_ready().await {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

async fn metrics(State(state): State<Arc<HealthState>>) -> Response {
    match state.encode_metrics() {
        Ok(body) => (
            StatusCode::OK,
            [(
                axum::http::header::CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            body,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {}", e),
        )
            .into_response(),
    }
}
