use ocp_core::api;
use ocp_core::obs::Metrics;
use ocp_core::store::s3::S3Store;
use ocp_core::util::config::Config;
use ocp_core::util::{host, shutdown_signal, usage};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const APP_VERSION: &str = match option_env!("OCP_APP_VERSION") {
    Some(value) => value,
    None => env!("CARGO_PKG_VERSION"),
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if usage::handle_cli_flags(APP_VERSION) {
        return Ok(());
    }

    let config = Config::load()?;
    init_tracing(&config.log_level);

    let host_details = host::discover(&config.metadata_url).await;
    let metrics = Metrics::for_host(&host_details, &config.region);
    let destination = Arc::new(S3Store::from_config(&config).await);

    tracing::info!(
        listen = %config.listen,
        source = %config.source_url,
        bucket = %config.bucket,
        prefix = %config.prefix,
        hostname = %host_details.hostname,
        "copy proxy starting"
    );

    let state = api::AppState::new(config, destination, metrics);
    let servers = api::build_servers(state)?;

    tokio::select! {
        _ = servers.run_all() => {},
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
        }
    }

    Ok(())
}

fn init_tracing(default_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}
