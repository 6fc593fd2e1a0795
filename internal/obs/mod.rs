use crate::util::host::HostDetails;
use axum::extract::MatchedPath;
use axum::http::Request;
use futures_util::future::BoxFuture;
use prometheus::core::Collector;
use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tower::{Layer, Service};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub http_requests: IntCounterVec,
    pub http_duration: HistogramVec,
    pub cache_hits: IntCounter,
    pub redirects: IntCounterVec,
    pub uploads: IntCounterVec,
    pub upload_duration: HistogramVec,
    pub upload_bytes: IntCounterVec,
    pub wait_outcomes: IntCounterVec,
    pub wait_duration: HistogramVec,
    pub registry_entries: IntGauge,
}

struct MetricVectors {
    http_requests: IntCounterVec,
    http_duration: HistogramVec,
    cache_hits: IntCounter,
    redirects: IntCounterVec,
    uploads: IntCounterVec,
    upload_duration: HistogramVec,
    upload_bytes: IntCounterVec,
    wait_outcomes: IntCounterVec,
    wait_duration: HistogramVec,
    registry_entries: IntGauge,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Self::build(Registry::new())
    }

    /// Registry with host identity stamped on every series, so a fleet of
    /// per-region proxies can be told apart in one backend.
    pub fn for_host(host: &HostDetails, region: &str) -> Arc<Self> {
        let mut labels = HashMap::new();
        labels.insert("hostname".to_string(), host.hostname.clone());
        labels.insert("instance_id".to_string(), host.instance_id.clone());
        labels.insert("instance_type".to_string(), host.instance_type.clone());
        labels.insert("region".to_string(), region.to_string());
        let registry =
            Registry::new_custom(None, Some(labels)).expect("metrics registry with host labels");
        Self::build(registry)
    }

    fn build(registry: Registry) -> Arc<Self> {
        let vectors = build_metric_vectors();
        register_metric_vectors(&registry, &vectors);
        Arc::new(Self {
            registry,
            http_requests: vectors.http_requests,
            http_duration: vectors.http_duration,
            cache_hits: vectors.cache_hits,
            redirects: vectors.redirects,
            uploads: vectors.uploads,
            upload_duration: vectors.upload_duration,
            upload_bytes: vectors.upload_bytes,
            wait_outcomes: vectors.wait_outcomes,
            wait_duration: vectors.wait_duration,
            registry_entries: vectors.registry_entries,
        })
    }

    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    pub fn observe_upload(&self, result: &str, elapsed: Duration, bytes: u64) {
        self.uploads.with_label_values(&[result]).inc();
        self.upload_duration
            .with_label_values(&[result])
            .observe(elapsed.as_secs_f64());
        self.upload_bytes.with_label_values(&[result]).inc_by(bytes);
    }

    pub fn observe_wait(&self, outcome: &str, waited: Duration) {
        self.wait_outcomes.with_label_values(&[outcome]).inc();
        self.wait_duration
            .with_label_values(&[outcome])
            .observe(waited.as_secs_f64());
    }

    pub fn record_redirect(&self, target: &str, reason: &str) {
        self.redirects.with_label_values(&[target, reason]).inc();
    }
}

fn build_metric_vectors() -> MetricVectors {
    let (http_requests, http_duration) = build_http_vectors();
    let (cache_hits, redirects) = build_redirect_vectors();
    let (uploads, upload_duration, upload_bytes) = build_upload_vectors();
    let (wait_outcomes, wait_duration) = build_wait_vectors();
    let registry_entries = IntGauge::new("ocp_registry_entries", "Copy registry entries")
        .expect("registry_entries");
    MetricVectors {
        http_requests,
        http_duration,
        cache_hits,
        redirects,
        uploads,
        upload_duration,
        upload_bytes,
        wait_outcomes,
        wait_duration,
        registry_entries,
    }
}

fn build_http_vectors() -> (IntCounterVec, HistogramVec) {
    let http_requests = IntCounterVec::new(
        Opts::new("ocp_http_requests_total", "HTTP requests"),
        &["service", "route", "method", "status"],
    )
    .expect("http_requests");
    let http_duration = HistogramVec::new(
        HistogramOpts::new("ocp_http_request_duration_seconds", "HTTP request duration"),
        &["service", "route", "method"],
    )
    .expect("http_duration");
    (http_requests, http_duration)
}

fn build_redirect_vectors() -> (IntCounter, IntCounterVec) {
    let cache_hits = IntCounter::new(
        "ocp_cache_hits_total",
        "Requests answered by an object already in the destination bucket",
    )
    .expect("cache_hits");
    let redirects = IntCounterVec::new(
        Opts::new("ocp_redirects_total", "Redirect responses"),
        &["target", "reason"],
    )
    .expect("redirects");
    (cache_hits, redirects)
}

fn build_upload_vectors() -> (IntCounterVec, HistogramVec, IntCounterVec) {
    let uploads = IntCounterVec::new(
        Opts::new("ocp_uploads_total", "Destination uploads"),
        &["result"],
    )
    .expect("uploads");
    let upload_duration = HistogramVec::new(
        HistogramOpts::new("ocp_upload_duration_seconds", "Destination upload duration"),
        &["result"],
    )
    .expect("upload_duration");
    let upload_bytes = IntCounterVec::new(
        Opts::new("ocp_upload_bytes_total", "Bytes sent to the destination"),
        &["result"],
    )
    .expect("upload_bytes");
    (uploads, upload_duration, upload_bytes)
}

fn build_wait_vectors() -> (IntCounterVec, HistogramVec) {
    let wait_outcomes = IntCounterVec::new(
        Opts::new("ocp_wait_outcomes_total", "Wait gate outcomes"),
        &["outcome"],
    )
    .expect("wait_outcomes");
    let wait_duration = HistogramVec::new(
        HistogramOpts::new("ocp_wait_duration_seconds", "Time spent in the wait gate"),
        &["outcome"],
    )
    .expect("wait_duration");
    (wait_outcomes, wait_duration)
}

fn register_metric_vectors(registry: &Registry, vectors: &MetricVectors) {
    register_collector(registry, &vectors.http_requests);
    register_collector(registry, &vectors.http_duration);
    register_collector(registry, &vectors.cache_hits);
    register_collector(registry, &vectors.redirects);
    register_collector(registry, &vectors.uploads);
    register_collector(registry, &vectors.upload_duration);
    register_collector(registry, &vectors.upload_bytes);
    register_collector(registry, &vectors.wait_outcomes);
    register_collector(registry, &vectors.wait_duration);
    register_collector(registry, &vectors.registry_entries);
}

fn register_collector<C>(registry: &Registry, collector: &C)
where
    C: Collector + Clone + 'static,
{
    registry.register(Box::new(collector.clone())).ok();
}

#[derive(Clone)]
pub struct MetricsLayer {
    metrics: Arc<Metrics>,
    service: &'static str,
}

impl MetricsLayer {
    pub fn new(metrics: Arc<Metrics>, service: &'static str) -> Self {
        Self { metrics, service }
    }
}

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService {
            inner,
            metrics: self.metrics.clone(),
            service: self.service,
        }
    }
}

#[derive(Clone)]
pub struct MetricsService<S> {
    inner: S,
    metrics: Arc<Metrics>,
    service: &'static str,
}

impl<S, B> Service<Request<B>> for MetricsService<S>
where
    S: Service<Request<B>, Response = axum::response::Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
    B: Send + 'static,
{
    type Response = axum::response::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let mut inner = self.inner.clone();
        let metrics = self.metrics.clone();
        let service = self.service;
        let method = req.method().clone();
        let path = request_path_label(&req);
        let start = Instant::now();
        Box::pin(async move {
            let response = inner.call(req).await?;
            let status_label = response.status().as_u16().to_string();
            metrics
                .http_requests
                .with_label_values(&[service, &path, method.as_str(), &status_label])
                .inc();
            metrics
                .http_duration
                .with_label_values(&[service, &path, method.as_str()])
                .observe(start.elapsed().as_secs_f64());
            Ok(response)
        })
    }
}

fn request_path_label<B>(req: &Request<B>) -> String {
    if let Some(matched) = req.extensions().get::<MatchedPath>() {
        return matched.as_str().to_string();
    }
    req.uri().path().to_string()
}

#[cfg(test)]
mod tests {
    use super::{Metrics, MetricsLayer};
    use crate::util::host::HostDetails;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::routing::get;
    use axum::Router;
    use prometheus::Encoder;
    use std::time::Duration;
    use tower::Service;

    #[test]
    fn metrics_registry_exposes_known_series() {
        let metrics = Metrics::new();
        metrics.cache_hits.inc();
        metrics.record_redirect("source", "timeout");
        metrics.observe_upload("ok", Duration::from_millis(10), 1024);
        metrics.observe_wait("ready", Duration::from_millis(5));
        metrics.registry_entries.set(3);

        let names: Vec<String> = metrics
            .gather()
            .into_iter()
            .map(|family| family.name().to_string())
            .collect();
        assert!(names.contains(&"ocp_cache_hits_total".to_string()));
        assert!(names.contains(&"ocp_redirects_total".to_string()));
        assert!(names.contains(&"ocp_uploads_total".to_string()));
        assert!(names.contains(&"ocp_upload_bytes_total".to_string()));
        assert!(names.contains(&"ocp_wait_outcomes_total".to_string()));
        assert!(names.contains(&"ocp_registry_entries".to_string()));
    }

    #[test]
    fn observe_upload_counts_result_and_bytes() {
        let metrics = Metrics::new();
        metrics.observe_upload("ok", Duration::from_millis(10), 2048);
        metrics.observe_upload("error", Duration::from_millis(10), 512);
        assert_eq!(metrics.uploads.with_label_values(&["ok"]).get(), 1);
        assert_eq!(metrics.upload_bytes.with_label_values(&["ok"]).get(), 2048);
        assert_eq!(metrics.upload_bytes.with_label_values(&["error"]).get(), 512);
    }

    #[test]
    fn for_host_stamps_constant_labels() {
        let host = HostDetails {
            hostname: "proxy-1".to_string(),
            instance_id: "i-0abc".to_string(),
            instance_type: "m5.large".to_string(),
        };
        let metrics = Metrics::for_host(&host, "us-east-1");
        metrics.cache_hits.inc();

        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&metrics.gather(), &mut buffer)
            .expect("encode");
        let body = String::from_utf8_lossy(&buffer).to_string();
        assert!(body.contains("ocp_cache_hits_total"));
        assert!(body.contains("hostname=\"proxy-1\""));
        assert!(body.contains("instance_id=\"i-0abc\""));
        assert!(body.contains("region=\"us-east-1\""));
    }

    #[tokio::test]
    async fn metrics_layer_records_requests_with_matched_path() {
        let metrics = Metrics::new();
        let layer = MetricsLayer::new(metrics.clone(), "proxy");
        let mut app = Router::new()
            .route("/objects/{id}", get(|| async { "" }))
            .layer(layer);

        let req = Request::builder()
            .method("GET")
            .uri("/objects/123")
            .body(Body::empty())
            .expect("request");

        let waker = futures_util::task::noop_waker();
        let mut cx = std::task::Context::from_waker(&waker);
        let _ = <Router as Service<Request<Body>>>::poll_ready(&mut app, &mut cx);
        let response = <Router as Service<Request<Body>>>::call(&mut app, req)
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let count = metrics
            .http_requests
            .with_label_values(&["proxy", "/objects/{id}", "GET", "200"])
            .get();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn metrics_layer_uses_fallback_path_without_matched_path() {
        let metrics = Metrics::new();
        let layer = MetricsLayer::new(metrics.clone(), "proxy");
        let route = get(|| async { "" });
        let mut wrapped = tower::Layer::layer(&layer, route);

        let req = Request::builder()
            .method("GET")
            .uri("/fallback")
            .body(Body::empty())
            .expect("request");

        let response = Service::call(&mut wrapped, req).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let count = metrics
            .http_requests
            .with_label_values(&["proxy", "/fallback", "GET", "200"])
            .get();
        assert_eq!(count, 1);
    }
}
