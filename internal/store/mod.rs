use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::header::{CONTENT_TYPE, ETAG};
use reqwest::StatusCode;
use tokio::sync::mpsc;

pub mod s3;

pub type ByteChunk = Result<Bytes, std::io::Error>;
pub type ByteChunkStream = BoxStream<'static, ByteChunk>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub size_bytes: u64,
    pub etag: Option<String>,
}

/// Destination bucket capability consumed by the copy engine. Injected as a
/// trait object so tests can run against an in-memory store.
#[async_trait]
pub trait DestinationStore: Send + Sync {
    /// Metadata for `key`, or `None` when the bucket has no such object.
    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>, String>;

    /// Upload `body` under `key`, returning the backend ETag when one is
    /// reported. The body arrives as a channel of chunks fed by the tee
    /// pipeline; the upload must consume it without buffering the whole
    /// object.
    async fn put_stream(
        &self,
        key: &str,
        size_bytes: u64,
        content_type: Option<&str>,
        body: mpsc::Receiver<ByteChunk>,
    ) -> Result<Option<String>, String>;

    /// Public URL clients are redirected to for `key`.
    fn object_url(&self, key: &str) -> String;
}

pub struct SourceObject {
    pub size_bytes: u64,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    pub stream: ByteChunkStream,
}

impl std::fmt::Debug for SourceObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceObject")
            .field("size_bytes", &self.size_bytes)
            .field("content_type", &self.content_type)
            .field("etag", &self.etag)
            .field("stream", &"<stream>")
            .finish()
    }
}

/// Streaming reads from the source bucket over plain HTTP.
#[derive(Clone)]
pub struct SourceClient {
    client: reqwest::Client,
    base_url: String,
}

impl SourceClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn object_url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Fetch one object as a stream. `Ok(None)` means the source has no such
    /// object; transport failures and unexpected statuses are errors.
    pub async fn fetch(&self, path: &str) -> Result<Option<SourceObject>, String> {
        let url = self.object_url(path);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| format!("source request failed: {err}"))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(format!("source status {}", response.status()));
        }
        let size_bytes = response
            .content_length()
            .ok_or_else(|| "source response missing content length".to_string())?;
        let content_type = header_value(&response, CONTENT_TYPE.as_str());
        let etag = header_value(&response, ETAG.as_str())
            .map(|value| value.trim_matches('"').to_string());
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other))
            .boxed();
        Ok(Some(SourceObject {
            size_bytes,
            content_type,
            etag,
            stream,
        }))
    }
}

fn header_value(response: &reqwest::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
}
