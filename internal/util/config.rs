use std::env;
use std::time::Duration;

const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(90);
const DEFAULT_METADATA_URL: &str = "http://169.254.169.254";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadAcl {
    PublicRead,
    Private,
}

impl UploadAcl {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "public-read" => Some(Self::PublicRead),
            "private" => Some(Self::Private),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PublicRead => "public-read",
            Self::Private => "private",
        }
    }
}

#[derive(Clone)]
pub struct Config {
    pub source_url: String,
    pub region: String,
    pub bucket: String,
    pub prefix: String,
    pub listen: String,
    pub metrics_listen: String,
    pub max_wait: Duration,
    pub bucket_public_url: Option<String>,
    pub s3_endpoint: Option<String>,
    pub s3_force_path_style: bool,
    pub upload_acl: UploadAcl,
    pub metadata_url: String,
    pub log_level: String,
}

impl Config {
    pub fn load() -> Result<Self, String> {
        let config = Self {
            source_url: required_env("OCP_SOURCE_URL", "OCP_SOURCE_URL is required")?,
            region: required_env("OCP_REGION", "OCP_REGION is required")?,
            bucket: required_env("OCP_BUCKET", "OCP_BUCKET is required")?,
            prefix: env_or_default("OCP_PREFIX", ""),
            listen: normalize_listen_addr(env_or_default("OCP_LISTEN", ":8080")),
            metrics_listen: normalize_listen_addr(env_or_default("OCP_METRICS_LISTEN", ":9100")),
            max_wait: load_max_wait()?,
            bucket_public_url: env::var("OCP_BUCKET_PUBLIC_URL").ok(),
            s3_endpoint: env::var("OCP_S3_ENDPOINT").ok(),
            s3_force_path_style: env::var("OCP_S3_FORCE_PATH_STYLE")
                .ok()
                .and_then(|value| parse_bool(&value))
                .unwrap_or(false),
            upload_acl: load_upload_acl()?,
            metadata_url: env_or_default("OCP_METADATA_URL", DEFAULT_METADATA_URL),
            log_level: env_or_default("OCP_LOG_LEVEL", "info"),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        validate_base_url("OCP_SOURCE_URL", &self.source_url)?;
        if let Some(url) = self.bucket_public_url.as_deref() {
            validate_base_url("OCP_BUCKET_PUBLIC_URL", url)?;
        }
        if self.bucket.trim().is_empty() {
            return Err("OCP_BUCKET must not be empty".into());
        }
        if self.region.trim().is_empty() {
            return Err("OCP_REGION must not be empty".into());
        }
        if self.max_wait.is_zero() {
            return Err("OCP_MAX_WAIT must be a positive duration".into());
        }
        Ok(())
    }

    /// Base URL clients are redirected to once an object lives in the
    /// destination bucket.
    pub fn destination_base_url(&self) -> String {
        match self.bucket_public_url.as_deref() {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("https://{}.s3.{}.amazonaws.com", self.bucket, self.region),
        }
    }
}

fn load_max_wait() -> Result<Duration, String> {
    let Some(raw) = env::var("OCP_MAX_WAIT").ok() else {
        return Ok(DEFAULT_MAX_WAIT);
    };
    humantime::parse_duration(raw.trim())
        .map_err(|err| format!("OCP_MAX_WAIT is not a valid duration: {err}"))
}

fn load_upload_acl() -> Result<UploadAcl, String> {
    let raw = env_or_default("OCP_UPLOAD_ACL", "public-read");
    UploadAcl::parse(&raw).ok_or_else(|| "OCP_UPLOAD_ACL must be public-read or private".into())
}

fn validate_base_url(env_name: &str, value: &str) -> Result<(), String> {
    if !value.starts_with("http://") && !value.starts_with("https://") {
        return Err(format!("{env_name} must be an absolute http/https URL"));
    }
    Ok(())
}

fn required_env(key: &str, missing_message: &str) -> Result<String, String> {
    env::var(key).map_err(|_| missing_message.to_string())
}

fn env_or_default(key: &str, default_value: &str) -> String {
    env::var(key).unwrap_or_else(|_| default_value.to_string())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn normalize_listen_addr(value: String) -> String {
    if value.starts_with(':') {
        format!("0.0.0.0{}", value)
    } else {
        value
    }
}
