use std::{sync::OnceLock, time::Duration};

use tracing::debug;

use crate::Result;

/// Install the aws-lc-rs rustls provider once per process.
///
/// reqwest is built with `rustls-tls-*-no-provider`, so a provider must be in
/// place before the first client is constructed.
pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Build a `reqwest::Client` for an outbound collaborator with its own timeout budget.
pub fn build_client(timeout: Duration) -> Result<reqwest::Client> {
    install_rustls_provider();

    let mut builder = reqwest::Client::builder()
        .user_agent(concat!("alert-relay/", env!("CARGO_PKG_VERSION")))
        .pool_max_idle_per_host(4);
    if timeout > Duration::ZERO {
        builder = builder.timeout(timeout);
    }
    Ok(builder.build()?)
}
