use super::{ByteChunk, DestinationStore, ObjectMeta};
use crate::util::config::{Config, UploadAcl};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::ObjectCannedAcl;
use aws_smithy_types::body::SdkBody;
use bytes::Bytes;
use futures_util::StreamExt;
use http_body_util::StreamBody;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Destination bucket backed by S3 (or an S3-compatible endpoint).
pub struct S3Store {
    client: aws_sdk_s3::Client,
    bucket: String,
    public_base_url: String,
    upload_acl: UploadAcl,
}

impl S3Store {
    pub async fn from_config(config: &Config) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()));
        if let Some(endpoint) = config.s3_endpoint.as_deref() {
            loader = loader.endpoint_url(endpoint);
        }
        let shared = loader.load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if config.s3_force_path_style || config.s3_endpoint.is_some() {
            builder = builder.force_path_style(true);
        }
        let client = aws_sdk_s3::Client::from_conf(builder.build());
        Self {
            client,
            bucket: config.bucket.clone(),
            public_base_url: config.destination_base_url(),
            upload_acl: config.upload_acl,
        }
    }
}

#[async_trait]
impl DestinationStore for S3Store {
    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>, String> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => Ok(Some(ObjectMeta {
                size_bytes: output.content_length().unwrap_or_default().max(0) as u64,
                etag: output.e_tag().map(trim_etag),
            })),
            Err(err) => {
                let not_found = err
                    .as_service_error()
                    .map(|service| service.is_not_found())
                    .unwrap_or(false);
                if not_found {
                    return Ok(None);
                }
                Err(format!("destination head failed: {err}"))
            }
        }
    }

    async fn put_stream(
        &self,
        key: &str,
        size_bytes: u64,
        content_type: Option<&str>,
        body: mpsc::Receiver<ByteChunk>,
    ) -> Result<Option<String>, String> {
        let frames = ReceiverStream::new(body).map(into_frame);
        let sdk_body = SdkBody::from_body_1_x(StreamBody::new(frames));
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_length(size_bytes as i64)
            .body(ByteStream::new(sdk_body));
        if let Some(content_type) = content_type {
            request = request.content_type(content_type);
        }
        if self.upload_acl == UploadAcl::PublicRead {
            request = request.acl(ObjectCannedAcl::PublicRead);
        }
        let output = request
            .send()
            .await
            .map_err(|err| format!("destination upload failed: {err}"))?;
        Ok(output.e_tag().map(trim_etag))
    }

    fn object_url(&self, key: &str) -> String {
        format!(
            "{}/{}",
            self.public_base_url.trim_end_matches('/'),
            key.trim_start_matches('/')
        )
    }
}

fn into_frame(chunk: ByteChunk) -> Result<http_body::Frame<Bytes>, std::io::Error> {
    chunk.map(http_body::Frame::data)
}

fn trim_etag(value: &str) -> String {
    value.trim_matches('"').to_string()
}

#[cfg(test)]
mod tests {
    use super::{into_frame, trim_etag, S3Store};
    use crate::store::DestinationStore;
    use crate::test_support;
    use bytes::Bytes;

    #[test]
    fn trim_etag_strips_quotes() {
        assert_eq!(trim_etag("\"abc123\""), "abc123");
        assert_eq!(trim_etag("abc123"), "abc123");
    }

    #[test]
    fn into_frame_maps_chunks_and_errors() {
        let frame = into_frame(Ok(Bytes::from_static(b"data"))).expect("frame");
        assert_eq!(frame.into_data().expect("data").as_ref(), b"data");
        let err = into_frame(Err(std::io::Error::other("gone"))).expect_err("error");
        assert!(err.to_string().contains("gone"));
    }

    #[tokio::test]
    async fn object_url_joins_public_base_and_key() {
        let config = test_support::base_config();
        let store = S3Store::from_config(&config).await;
        assert_eq!(
            store.object_url("production/builds/app.tar.gz"),
            "https://dest-bucket.s3.us-east-1.amazonaws.com/production/builds/app.tar.gz"
        );
    }

    #[tokio::test]
    async fn object_url_respects_public_override() {
        let mut config = test_support::base_config();
        config.bucket_public_url = Some("https://cdn.example.com/mirror/".to_string());
        let store = S3Store::from_config(&config).await;
        assert_eq!(
            store.object_url("/k1"),
            "https://cdn.example.com/mirror/k1"
        );
    }

    #[tokio::test]
    async fn head_reports_transport_errors() {
        let mut config = test_support::base_config();
        config.s3_endpoint = Some("http://127.0.0.1:1".to_string());
        let store = S3Store::from_config(&config).await;
        let err = store.head("k1").await.unwrap_err();
        assert!(err.contains("destination head failed"));
    }
}
