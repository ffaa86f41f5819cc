use crate::config::ArchiveConfig;
use crate::error::Result;
use tracing::info;

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Builds the client shared by catalog queries, submissions and status checks.
pub fn setup_http_client(config: &ArchiveConfig) -> Result<reqwest::Client> {
    info!(
        "🌐 Archive: {} | Ingest: {}{}",
        config.archive_base_url(),
        config.ingest_base_url(),
        if config.use_test_instance { " (test instance)" } else { "" }
    );

    let client = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(config.request_timeout)
        .connect_timeout(config.request_timeout.min(std::time::Duration::from_secs(30)))
        .build()?;
    Ok(client)
}
