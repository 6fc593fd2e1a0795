use std::time::Duration;

const METADATA_TIMEOUT: Duration = Duration::from_secs(1);
const UNKNOWN: &str = "unknown";

#[derive(Debug, Clone)]
pub struct HostDetails {
    pub hostname: String,
    pub instance_id: String,
    pub instance_type: String,
}

impl HostDetails {
    pub fn unknown() -> Self {
        Self {
            hostname: UNKNOWN.to_string(),
            instance_id: UNKNOWN.to_string(),
            instance_type: UNKNOWN.to_string(),
        }
    }
}

/// Best-effort host identity for metric labels. Every lookup falls back to
/// "unknown" so startup never blocks on the metadata endpoint.
pub async fn discover(metadata_url: &str) -> HostDetails {
    let client = match reqwest::Client::builder().timeout(METADATA_TIMEOUT).build() {
        Ok(client) => client,
        Err(err) => {
            tracing::warn!(error = %err, "metadata client build failed");
            return HostDetails {
                hostname: hostname(),
                ..HostDetails::unknown()
            };
        }
    };
    let instance_id = fetch_metadata(&client, metadata_url, "instance-id").await;
    let instance_type = fetch_metadata(&client, metadata_url, "instance-type").await;
    HostDetails {
        hostname: hostname(),
        instance_id: instance_id.unwrap_or_else(|| UNKNOWN.to_string()),
        instance_type: instance_type.unwrap_or_else(|| UNKNOWN.to_string()),
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| UNKNOWN.to_string())
}

async fn fetch_metadata(client: &reqwest::Client, base_url: &str, item: &str) -> Option<String> {
    let url = format!("{}/latest/meta-data/{}", base_url.trim_end_matches('/'), item);
    let response = match client.get(&url).send().await {
        Ok(response) => response,
        Err(err) => {
            tracing::debug!(item = %item, error = %err, "instance metadata unavailable");
            return None;
        }
    };
    if !response.status().is_success() {
        tracing::debug!(item = %item, status = %response.status(), "instance metadata rejected");
        return None;
    }
    let body = response.text().await.ok()?;
    let value = body.trim().to_string();
    if value.is_empty() {
        return None;
    }
    Some(value)
}
