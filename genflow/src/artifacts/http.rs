//! HTTP client setup for artifact downloads.

use std::sync::OnceLock;
use std::time::Duration;
use tracing::debug;

use crate::{Error, Result};

/// Install the process-wide rustls provider once.
pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            // Another component installed it first.
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Build the client used to download remote artifacts.
pub fn build_download_client(request_timeout: Duration) -> Result<reqwest::Client> {
    install_rustls_provider();

    let mut builder = reqwest::Client::builder()
        .user_agent(concat!("genflow/", env!("CARGO_PKG_VERSION")))
        .pool_max_idle_per_host(4);
    if request_timeout > Duration::ZERO {
        builder = builder.timeout(request_timeout);
    }
    builder
        .build()
        .map_err(|e| Error::config(format!("failed to build HTTP client: {e}")))
}
