/*
[INPUT]:  Component liveness flags and the engine's status snapshot
[OUTPUT]: /healthz and /status HTTP endpoints
[POS]:    Operations layer - the process's observable surface
[UPDATE]: When components or status fields change
*/

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::MetricsSnapshot;
use crate::slot_manager::SlotCounts;

/// Components reported on `/healthz`.
#[derive(Debug, Clone, Copy)]
pub enum Component {
    Exchange,
    OrderExecutor,
    RiskMonitor,
    SlotManager,
}

/// Per-symbol status block served on `/status`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TaskStatus {
    pub symbol: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub last_price: Decimal,
    pub last_tick_ms: i64,
    pub slot_counts: SlotCounts,
    #[serde(with = "rust_decimal::serde::str")]
    pub divergence: Decimal,
    pub breaker_open: bool,
}

#[derive(Debug, Clone, serde::Serialize, Default)]
pub struct StatusSnapshot {
    pub tasks: Vec<TaskStatus>,
    pub metrics: Option<MetricsSnapshot>,
}

/// Shared liveness + status state the engine keeps current.
#[derive(Debug, Default)]
pub struct HealthRegistry {
    exchange: AtomicBool,
    order_executor: AtomicBool,
    risk_monitor: AtomicBool,
    slot_manager: AtomicBool,
    status: Mutex<StatusSnapshot>,
}

impl HealthRegistry {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_live(&self, component: Component, live: bool) {
        let flag = match component {
            Component::Exchange => &self.exchange,
            Component::OrderExecutor => &self.order_executor,
            Component::RiskMonitor => &self.risk_monitor,
            Component::SlotManager => &self.slot_manager,
        };
        flag.store(live, Ordering::SeqCst);
    }

    pub fn all_live(&self) -> bool {
        self.exchange.load(Ordering::SeqCst)
            && self.order_executor.load(Ordering::SeqCst)
            && self.risk_monitor.load(Ordering::SeqCst)
            && self.slot_manager.load(Ordering::SeqCst)
    }

    pub fn set_status(&self, status: StatusSnapshot) {
        *self.status.lock() = status;
    }

    fn health_body(&self) -> serde_json::Value {
        serde_json::json!({
            "exchange": self.exchange.load(Ordering::SeqCst),
            "order_executor": self.order_executor.load(Ordering::SeqCst),
            "risk_monitor": self.risk_monitor.load(Ordering::SeqCst),
            "slot_manager": self.slot_manager.load(Ordering::SeqCst),
        })
    }

    fn status_body(&self) -> serde_json::Value {
        serde_json::to_value(&*self.status.lock()).unwrap_or_default()
    }
}

/// Serves the health/status endpoints until cancelled.
pub async fn serve(
    addr: SocketAddr,
    registry: Arc<HealthRegistry>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "health server listening");

    loop {
        let (stream, remote) = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(err) => {
                    warn!(error = %err, "health server accept failed");
                    continue;
                }
            },
        };

        let registry = registry.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let registry = registry.clone();
                async move { handle(req, registry) }
            });
            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                debug!(%remote, error = %err, "health connection error");
            }
        });
    }
}

fn handle(
    req: Request<hyper::body::Incoming>,
    registry: Arc<HealthRegistry>,
) -> Result<Response<Full<Bytes>>, hyper::http::Error> {
    match req.uri().path() {
        "/healthz" => {
            let status = if registry.all_live() {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            json_response(status, registry.health_body())
        }
        "/status" => json_response(StatusCode::OK, registry.status_body()),
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from_static(b"not found"))),
    }
}

fn json_response(
    status: StatusCode,
    body: serde_json::Value,
) -> Result<Response<Full<Bytes>>, hyper::http::Error> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
}
