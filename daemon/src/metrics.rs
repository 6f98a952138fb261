//! Prometheus metrics

use crate::config::MonitoringConfig;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::LazyLock;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Global metrics registry
static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Process-wide metrics
pub static METRICS: LazyLock<Metrics> = LazyLock::new(Metrics::new);

/// Metrics struct
pub struct Metrics {
    // Counters
    pub sessions_evicted: IntCounter,
    pub requests: IntCounterVec,
    pub request_errors: IntCounterVec,
    pub framing_errors: IntCounter,
    pub backend_failures: IntCounter,

    // Gauges
    pub sessions_active: IntGauge,
    pub connections_active: IntGauge,
    pub affinity_entries: IntGauge,
}

impl Metrics {
    pub fn new() -> Self {
        let sessions_evicted = IntCounter::with_opts(Opts::new(
            "sigbox_sessions_evicted_total",
            "Sessions removed by EVICT or the idle sweep",
        ))
        .unwrap();

        let requests = IntCounterVec::new(
            Opts::new("sigbox_requests_total", "Control operations dispatched"),
            &["op"],
        )
        .unwrap();

        let request_errors = IntCounterVec::new(
            Opts::new("sigbox_request_errors_total", "ERROR responses sent"),
            &["code"],
        )
        .unwrap();

        let framing_errors = IntCounter::with_opts(Opts::new(
            "sigbox_framing_errors_total",
            "Connections dropped on a framing or authentication error",
        ))
        .unwrap();

        let backend_failures = IntCounter::with_opts(Opts::new(
            "sigbox_proxy_backend_failures_total",
            "Backend connects that failed or backends lost while owned",
        ))
        .unwrap();

        let sessions_active = IntGauge::with_opts(Opts::new(
            "sigbox_sessions_active",
            "Sessions currently registered",
        ))
        .unwrap();

        let connections_active = IntGauge::with_opts(Opts::new(
            "sigbox_connections_active",
            "Number of active client connections",
        ))
        .unwrap();

        let affinity_entries = IntGauge::with_opts(Opts::new(
            "sigbox_proxy_affinity_entries",
            "Session ids pinned to a backend",
        ))
        .unwrap();

        // Register metrics
        REGISTRY.register(Box::new(sessions_evicted.clone())).ok();
        REGISTRY.register(Box::new(requests.clone())).ok();
        REGISTRY.register(Box::new(request_errors.clone())).ok();
        REGISTRY.register(Box::new(framing_errors.clone())).ok();
        REGISTRY.register(Box::new(backend_failures.clone())).ok();
        REGISTRY.register(Box::new(sessions_active.clone())).ok();
        REGISTRY.register(Box::new(connections_active.clone())).ok();
        REGISTRY.register(Box::new(affinity_entries.clone())).ok();

        Self {
            sessions_evicted,
            requests,
            request_errors,
            framing_errors,
            backend_failures,
            sessions_active,
            connections_active,
            affinity_entries,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Text exposition of everything registered
pub fn render() -> Vec<u8> {
    use prometheus::Encoder;

    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        error!("Failed to encode metrics: {}", e);
    }
    buffer
}

/// Start the metrics server
pub fn start_server(config: &MonitoringConfig) -> JoinHandle<()> {
    let bind = config.prometheus_bind;
    let enabled = config.prometheus_enabled;

    tokio::spawn(async move {
        if !enabled {
            info!("Prometheus metrics disabled");
            return;
        }

        use bytes::Bytes;
        use http_body_util::Full;
        use hyper::{Response, server::conn::http1, service::service_fn};
        use hyper_util::rt::TokioIo;

        let listener = match tokio::net::TcpListener::bind(bind).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind metrics server: {}", e);
                return;
            }
        };

        info!("Prometheus metrics server listening on {}", bind);

        loop {
            let (stream, _) = match listener.accept().await {
                Ok(r) => r,
                Err(e) => {
                    error!("Metrics accept error: {}", e);
                    continue;
                }
            };

            let io = TokioIo::new(stream);

            tokio::spawn(async move {
                let service = service_fn(|_req| async {
                    let mut response = Response::new(Full::new(Bytes::from(render())));
                    response.headers_mut().insert(
                        hyper::header::CONTENT_TYPE,
                        hyper::header::HeaderValue::from_static("text/plain; version=0.0.4"),
                    );
                    Ok::<_, std::convert::Infallible>(response)
                });

                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    error!("Metrics connection error: {}", e);
                }
            });
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_metrics() {
        METRICS.requests.with_label_values(&["INIT"]).inc();
        METRICS.request_errors.with_label_values(&["ENOENT"]).inc();

        let text = String::from_utf8(render()).unwrap();
        assert!(text.contains("sigbox_requests_total"));
        assert!(text.contains("op=\"INIT\""));
        assert!(text.contains("sigbox_request_errors_total"));
    }
}
