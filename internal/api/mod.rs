use crate::copy::coordinator::CopyCoordinator;
use crate::copy::registry::CopyRegistry;
use crate::obs::{Metrics, MetricsLayer};
use crate::store::{DestinationStore, SourceClient};
use crate::util::config::Config;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub mod proxy;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub metrics: Arc<Metrics>,
    pub registry: CopyRegistry,
    pub coordinator: CopyCoordinator,
}

impl AppState {
    pub fn new(config: Config, destination: Arc<dyn DestinationStore>, metrics: Arc<Metrics>) -> Self {
        let registry = CopyRegistry::new();
        let source = SourceClient::new(&config.source_url);
        let coordinator =
            CopyCoordinator::new(registry.clone(), source, destination, metrics.clone());
        Self {
            config,
            metrics,
            registry,
            coordinator,
        }
    }
}

pub struct Servers {
    handles: Vec<JoinHandle<()>>,
}

impl Servers {
    pub async fn run_all(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

pub fn build_servers(state: AppState) -> Result<Servers, String> {
    let mut handles = Vec::new();

    let proxy_app =
        proxy::router(state.clone()).layer(MetricsLayer::new(state.metrics.clone(), "proxy"));
    handles.push(spawn_server(&state.config.listen, proxy_app)?);

    let metrics_app = metrics_router(state.clone())
        .layer(MetricsLayer::new(state.metrics.clone(), "metrics"));
    handles.push(spawn_server(&state.config.metrics_listen, metrics_app)?);

    Ok(Servers { handles })
}

async fn run_server(socket: SocketAddr, app: Router) {
    let listener = match TcpListener::bind(socket).await {
        Ok(val) => val,
        Err(err) => {
            tracing::error!(addr = %socket, error = %err, "listener bind failed");
            return;
        }
    };
    let _ = axum::serve(listener, app).await;
}

fn spawn_server(addr: &str, app: Router) -> Result<JoinHandle<()>, String> {
    let socket: SocketAddr = addr
        .parse()
        .map_err(|_| format!("invalid listen addr {addr}"))?;
    let handle = tokio::spawn(run_server(socket, app));
    Ok(handle)
}

fn metrics_router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(ready_handler))
        .with_state(state)
}

async fn metrics_handler(State(state): State<AppState>) -> String {
    refresh_registry_metrics(&state);
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    let _ = encoder.encode(&state.metrics.gather(), &mut buffer);
    String::from_utf8_lossy(&buffer).to_string()
}

pub fn refresh_registry_metrics(state: &AppState) {
    state
        .metrics
        .registry_entries
        .set(state.registry.len() as i64);
}

async fn ready_handler(State(state): State<AppState>) -> (StatusCode, &'static str) {
    let client = reqwest::Client::new();
    let response = client
        .head(state.coordinator.source().base_url())
        .send()
        .await;
    // Any HTTP answer counts as reachable; only transport failures matter.
    if response.is_err() {
        return (StatusCode::SERVICE_UNAVAILABLE, "source not reachable");
    }
    (StatusCode::OK, "ok")
}
