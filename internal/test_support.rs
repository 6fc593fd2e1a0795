use crate::api::AppState;
use crate::obs::Metrics;
use crate::store::{ByteChunk, DestinationStore, ObjectMeta};
use crate::util::config::{Config, UploadAcl};
use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::http::header;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use dashmap::DashMap;
use md5::{Digest, Md5};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_stream::wrappers::ReceiverStream;

pub fn base_config() -> Config {
    Config {
        source_url: "http://127.0.0.1:1".to_string(),
        region: "us-east-1".to_string(),
        bucket: "dest-bucket".to_string(),
        prefix: String::new(),
        listen: "127.0.0.1:0".to_string(),
        metrics_listen: "127.0.0.1:0".to_string(),
        max_wait: Duration::from_secs(90),
        bucket_public_url: None,
        s3_endpoint: None,
        s3_force_path_style: false,
        upload_acl: UploadAcl::PublicRead,
        metadata_url: "http://127.0.0.1:1".to_string(),
        log_level: "info".to_string(),
    }
}

pub fn build_state(source_url: &str, destination: Arc<FakeDestination>) -> AppState {
    let mut config = base_config();
    config.source_url = source_url.to_string();
    AppState::new(config, destination, Metrics::new())
}

struct StoredObject {
    bytes: Vec<u8>,
    etag: String,
}

/// In-memory destination bucket with call counters and failure switches.
pub struct FakeDestination {
    objects: DashMap<String, StoredObject>,
    puts: AtomicUsize,
    heads: AtomicUsize,
    pub fail_puts: AtomicBool,
    pub fail_heads: AtomicBool,
}

impl FakeDestination {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            objects: DashMap::new(),
            puts: AtomicUsize::new(0),
            heads: AtomicUsize::new(0),
            fail_puts: AtomicBool::new(false),
            fail_heads: AtomicBool::new(false),
        })
    }

    pub fn seed(&self, key: &str, bytes: Vec<u8>) {
        let etag = md5_hex(&bytes);
        self.objects
            .insert(key.to_string(), StoredObject { bytes, etag });
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.get(key).map(|stored| stored.bytes.clone())
    }

    pub fn etag(&self, key: &str) -> Option<String> {
        self.objects.get(key).map(|stored| stored.etag.clone())
    }

    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn head_count(&self) -> usize {
        self.heads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DestinationStore for FakeDestination {
    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>, String> {
        self.heads.fetch_add(1, Ordering::SeqCst);
        if self.fail_heads.load(Ordering::SeqCst) {
            return Err("destination head failed: injected".into());
        }
        Ok(self.objects.get(key).map(|stored| ObjectMeta {
            size_bytes: stored.bytes.len() as u64,
            etag: Some(stored.etag.clone()),
        }))
    }

    async fn put_stream(
        &self,
        key: &str,
        size_bytes: u64,
        _content_type: Option<&str>,
        mut body: mpsc::Receiver<ByteChunk>,
    ) -> Result<Option<String>, String> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err("destination upload failed: injected".into());
        }
        let mut collected = Vec::new();
        while let Some(chunk) = body.recv().await {
            let chunk = chunk.map_err(|err| format!("upload stream failed: {err}"))?;
            collected.extend_from_slice(&chunk);
        }
        if collected.len() as u64 != size_bytes {
            return Err(format!(
                "upload truncated: expected {size_bytes} bytes, got {}",
                collected.len()
            ));
        }
        let etag = md5_hex(&collected);
        self.objects.insert(
            key.to_string(),
            StoredObject {
                bytes: collected,
                etag: etag.clone(),
            },
        );
        Ok(Some(etag))
    }

    fn object_url(&self, key: &str) -> String {
        format!("https://dest-bucket.test/{}", key.trim_start_matches('/'))
    }
}

pub fn md5_hex(bytes: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

pub struct ServerHandle {
    shutdown: Option<oneshot::Sender<()>>,
    join: JoinHandle<()>,
}

impl ServerHandle {
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = self.join.await;
    }
}

pub async fn spawn_app(app: Router) -> (String, ServerHandle) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let join = tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await;
    });
    sleep(Duration::from_millis(50)).await;
    (
        format!("http://{}", addr),
        ServerHandle {
            shutdown: Some(shutdown_tx),
            join,
        },
    )
}

/// Source bucket fixture serving one object with full metadata headers.
pub fn static_source_router(path: &str, payload: Vec<u8>) -> Router {
    let etag = format!("\"{}\"", md5_hex(&payload));
    Router::new().route(
        path,
        get(move || {
            let payload = payload.clone();
            let etag = etag.clone();
            async move {
                (
                    [
                        (header::CONTENT_TYPE, "application/octet-stream".to_string()),
                        (header::ETAG, etag),
                    ],
                    payload,
                )
            }
        }),
    )
}

/// Source bucket fixture that sends headers and the first half of the body,
/// then withholds the rest until `release` is notified. Lets tests observe a
/// copy while it is in flight.
pub fn gated_source_router(
    path: &str,
    payload: Vec<u8>,
    release: Arc<Notify>,
) -> (Router, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let route_hits = hits.clone();
    let router = Router::new().route(
        path,
        get(move || {
            let release = release.clone();
            let hits = route_hits.clone();
            let payload = payload.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                let total = payload.len();
                let split = total / 2;
                let head = Bytes::copy_from_slice(&payload[..split]);
                let tail = Bytes::copy_from_slice(&payload[split..]);
                let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(2);
                tokio::spawn(async move {
                    let _ = tx.send(Ok(head)).await;
                    release.notified().await;
                    let _ = tx.send(Ok(tail)).await;
                });
                Response::builder()
                    .header(header::CONTENT_LENGTH, total)
                    .header(header::CONTENT_TYPE, "application/octet-stream")
                    .body(Body::from_stream(ReceiverStream::new(rx)))
                    .expect("gated response")
            }
        }),
    );
    (router, hits)
}
