//! Prometheus metrics for the rstomp broker.
//!
//! Collected in a dedicated registry and served as text on `/metrics` by a
//! small HTTP/1 server, next to a `/health` probe.

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::core::Collector;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

/// Transaction commit size buckets (frames).
const COMMIT_SIZE_BUCKETS: &[f64] = &[1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0];

/// Broker metrics.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub connections_total: Counter,
    pub connections_active: Gauge,
    /// Frames received, by command.
    pub frames_received_total: CounterVec,
    pub frames_sent_total: Counter,
    pub heartbeats_received_total: Counter,
    /// MESSAGE frames produced, by destination kind.
    pub messages_dispatched_total: CounterVec,
    pub subscriptions_active: Gauge,
    pub transactions_active: Gauge,
    /// Frames replayed per COMMIT.
    pub transaction_commit_size: HistogramVec,
    /// ERROR frames sent, by `message` header.
    pub errors_total: CounterVec,
}

fn register<C>(registry: &Registry, collector: C) -> Result<C, prometheus::Error>
where
    C: Collector + Clone + 'static,
{
    registry.register(Box::new(collector.clone()))?;
    Ok(collector)
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let counter = |name: &str, help: &str| {
            register(&registry, Counter::with_opts(Opts::new(name, help))?)
        };
        let gauge =
            |name: &str, help: &str| register(&registry, Gauge::with_opts(Opts::new(name, help))?);

        Ok(Self {
            connections_total: counter(
                "rstomp_connections_total",
                "Connections accepted since start",
            )?,
            connections_active: gauge(
                "rstomp_connections_active",
                "Number of currently open connections",
            )?,
            frames_received_total: register(
                &registry,
                CounterVec::new(
                    Opts::new("rstomp_frames_received_total", "Frames received by command"),
                    &["command"],
                )?,
            )?,
            frames_sent_total: counter(
                "rstomp_frames_sent_total",
                "Total frames written to clients",
            )?,
            heartbeats_received_total: counter(
                "rstomp_heartbeats_received_total",
                "Total heartbeats received from clients",
            )?,
            messages_dispatched_total: register(
                &registry,
                CounterVec::new(
                    Opts::new(
                        "rstomp_messages_dispatched_total",
                        "Messages delivered to subscriptions by destination kind",
                    ),
                    &["kind"],
                )?,
            )?,
            subscriptions_active: gauge(
                "rstomp_subscriptions_active",
                "Number of active subscriptions",
            )?,
            transactions_active: gauge(
                "rstomp_transactions_active",
                "Number of open transactions",
            )?,
            transaction_commit_size: register(
                &registry,
                HistogramVec::new(
                    HistogramOpts::new(
                        "rstomp_transaction_commit_frames",
                        "Frames replayed per committed transaction",
                    )
                    .buckets(COMMIT_SIZE_BUCKETS.to_vec()),
                    &["outcome"],
                )?,
            )?,
            errors_total: register(
                &registry,
                CounterVec::new(
                    Opts::new("rstomp_errors_total", "ERROR frames sent by message"),
                    &["message"],
                )?,
            )?,
            registry,
        })
    }

    /// Prometheus text exposition of every registered metric.
    pub fn encode(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut out = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut out)?;
        Ok(out)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Serves `/metrics` and `/health` on `addr` until `shutdown` fires.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Arc<Metrics>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Metrics endpoint on http://{}/metrics", listener.local_addr()?);

    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.recv() => break,
        };
        match accepted {
            Ok((stream, peer)) => {
                tokio::spawn(serve_scrape(TokioIo::new(stream), peer, metrics.clone()));
            }
            Err(e) => tracing::warn!("Metrics accept failed: {}", e),
        }
    }

    tracing::info!("Metrics endpoint stopped");
    Ok(())
}

async fn serve_scrape(io: TokioIo<TcpStream>, peer: SocketAddr, metrics: Arc<Metrics>) {
    let service = service_fn(move |req| {
        let metrics = metrics.clone();
        async move { handle_request(req, metrics).await }
    });
    if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
        tracing::debug!("[{}] metrics connection: {}", peer, e);
    }
}

fn respond(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    if let Ok(value) = content_type.parse() {
        response.headers_mut().insert(hyper::header::CONTENT_TYPE, value);
    }
    response
}

async fn handle_request(
    req: Request<Incoming>,
    metrics: Arc<Metrics>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    Ok(match req.uri().path() {
        "/metrics" => match metrics.encode() {
            Ok(body) => respond(
                StatusCode::OK,
                "text/plain; version=0.0.4; charset=utf-8",
                body,
            ),
            Err(e) => respond(
                StatusCode::INTERNAL_SERVER_ERROR,
                "text/plain",
                e.to_string(),
            ),
        },
        "/health" | "/healthz" => respond(StatusCode::OK, "text/plain", "OK"),
        _ => respond(StatusCode::NOT_FOUND, "text/plain", "Not Found"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();

        metrics.connections_total.inc();
        metrics.connections_active.inc();
        metrics.frames_received_total.with_label_values(&["SEND"]).inc();
        metrics.errors_total.with_label_values(&["Not connected"]).inc();
        metrics
            .transaction_commit_size
            .with_label_values(&["committed"])
            .observe(3.0);

        let encoded = String::from_utf8(metrics.encode().unwrap()).unwrap();
        assert!(encoded.contains("rstomp_connections_total"));
        assert!(encoded.contains("rstomp_frames_received_total"));
        assert!(encoded.contains("rstomp_errors_total"));
        assert!(encoded.contains("rstomp_transaction_commit_frames"));
    }

    #[test]
    fn test_gauges() {
        let metrics = Metrics::new().unwrap();
        metrics.subscriptions_active.set(4.0);
        metrics.transactions_active.set(2.0);
        metrics
            .messages_dispatched_total
            .with_label_values(&["queue"])
            .inc_by(7.0);

        let encoded = String::from_utf8(metrics.encode().unwrap()).unwrap();
        assert!(encoded.contains("rstomp_subscriptions_active 4"));
        assert!(encoded.contains("rstomp_transactions_active 2"));
        assert!(encoded.contains("rstomp_messages_dispatched_total{kind=\"queue\"} 7"));
    }
}
