use std::{sync::OnceLock, time::Duration};

use tracing::debug;

use crate::Result;

pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            // Can happen if another crate installed it first.
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Build the shared HTTP client used by the service clients.
pub fn build_client(timeout: Duration) -> Result<reqwest::Client> {
    install_rustls_provider();
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout.min(Duration::from_secs(10)))
        .user_agent(concat!("rawmon/", env!("CARGO_PKG_VERSION")))
        .build()?;
    Ok(client)
}
