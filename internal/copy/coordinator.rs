use crate::copy::registry::{CopyEntry, CopyFailure, CopyRegistry, CopyState};
use crate::copy::tee::ChunkFanout;
use crate::obs::Metrics;
use crate::store::{ByteChunk, ByteChunkStream, DestinationStore, SourceClient, SourceObject};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

/// What the triggering request streams back while the upload runs beside it.
pub struct PassThrough {
    pub size_bytes: u64,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    pub body: mpsc::Receiver<ByteChunk>,
}

pub enum Admission {
    /// This request won the copy: serve the source bytes as the response
    /// while the tee uploads them.
    PassThrough(PassThrough),
    /// The source has no readable object for this key; the entry is terminal.
    SourceGone,
    /// The destination bucket already holds the object.
    AlreadyCopied,
    /// Another request owns the in-flight copy; wait on the entry.
    InFlight(Arc<CopyEntry>),
    /// The entry reached a terminal state earlier.
    Terminal(CopyState),
}

/// Drives one key's copy lifecycle end to end: admission, the tee pipeline,
/// and publication of the terminal state to all waiters.
#[derive(Clone)]
pub struct CopyCoordinator {
    registry: CopyRegistry,
    source: SourceClient,
    destination: Arc<dyn DestinationStore>,
    metrics: Arc<Metrics>,
}

impl CopyCoordinator {
    pub fn new(
        registry: CopyRegistry,
        source: SourceClient,
        destination: Arc<dyn DestinationStore>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            registry,
            source,
            destination,
            metrics,
        }
    }

    pub fn registry(&self) -> &CopyRegistry {
        &self.registry
    }

    pub fn source(&self) -> &SourceClient {
        &self.source
    }

    pub fn destination(&self) -> &Arc<dyn DestinationStore> {
        &self.destination
    }

    /// Admit one request for `key`. `source_path` is the raw request path,
    /// which is what the source bucket is addressed by (the key prefix only
    /// applies to the destination).
    pub async fn admit(&self, key: &str, source_path: &str) -> Admission {
        if let Some(entry) = self.registry.lookup(key) {
            let state = entry.state();
            if state.is_terminal() {
                return Admission::Terminal(state);
            }
            return Admission::InFlight(entry);
        }

        // The registry only remembers this process's copies; the bucket may
        // already hold the object from an earlier run.
        if self.destination_has(key).await {
            self.metrics.cache_hits.inc();
            return Admission::AlreadyCopied;
        }

        let (entry, created) = self.registry.get_or_create(key);
        if !created {
            let state = entry.state();
            if state.is_terminal() {
                return Admission::Terminal(state);
            }
            return Admission::InFlight(entry);
        }

        match self.source.fetch(source_path).await {
            Ok(Some(object)) => Admission::PassThrough(self.start_copy(entry, object)),
            Ok(None) => {
                entry.publish(CopyState::Failed(CopyFailure::SourceMissing));
                tracing::info!(key = %key, "source object missing");
                Admission::SourceGone
            }
            Err(err) => {
                entry.publish(CopyState::Failed(CopyFailure::SourceMissing));
                tracing::warn!(key = %key, error = %err, "source read failed");
                Admission::SourceGone
            }
        }
    }

    async fn destination_has(&self, key: &str) -> bool {
        match self.destination.head(key).await {
            Ok(meta) => meta.is_some(),
            Err(err) => {
                // Non-fatal: a head failure degrades to a copy attempt.
                tracing::warn!(key = %key, error = %err, "destination head failed");
                false
            }
        }
    }

    fn start_copy(&self, entry: Arc<CopyEntry>, object: SourceObject) -> PassThrough {
        let SourceObject {
            size_bytes,
            content_type,
            etag,
            stream,
        } = object;

        let mut fanout = ChunkFanout::new();
        let client_body = fanout.add_sink("client");
        let upload_body = fanout.add_sink("upload");
        tokio::spawn(drive_source(stream, fanout));

        let coordinator = self.clone();
        let upload_content_type = content_type.clone();
        tokio::spawn(async move {
            coordinator
                .run_upload(entry, size_bytes, upload_content_type, upload_body)
                .await;
        });

        PassThrough {
            size_bytes,
            content_type,
            etag,
            body: client_body,
        }
    }

    async fn run_upload(
        &self,
        entry: Arc<CopyEntry>,
        size_bytes: u64,
        content_type: Option<String>,
        body: mpsc::Receiver<ByteChunk>,
    ) {
        let started = Instant::now();
        let result = self
            .destination
            .put_stream(entry.key(), size_bytes, content_type.as_deref(), body)
            .await;
        let elapsed = started.elapsed();
        match result {
            Ok(etag) => {
                self.metrics.observe_upload("ok", elapsed, size_bytes);
                entry.publish(CopyState::Succeeded);
                tracing::info!(
                    key = %entry.key(),
                    bytes = size_bytes,
                    etag = etag.as_deref().unwrap_or("-"),
                    "copied object to destination"
                );
            }
            Err(err) => {
                self.metrics.observe_upload("error", elapsed, size_bytes);
                entry.publish(CopyState::Failed(CopyFailure::UploadError));
                tracing::warn!(key = %entry.key(), error = %err, "destination upload failed");
            }
        }
    }
}

/// Reader side of the tee: pulls source chunks and fans them out until the
/// stream ends, the source errors out, or nobody is listening anymore.
async fn drive_source(mut stream: ByteChunkStream, mut fanout: ChunkFanout) {
    while let Some(next) = stream.next().await {
        match next {
            Ok(chunk) => {
                if !fanout.push(chunk).await {
                    tracing::debug!("tee abandoned, all sinks gone");
                    return;
                }
            }
            Err(err) => {
                fanout.fail(err).await;
                return;
            }
        }
    }
}
