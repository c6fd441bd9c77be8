//! Shared `reqwest` client construction.

use std::sync::OnceLock;
use std::time::Duration;

use tracing::debug;

use crate::{Error, Result};

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
/// Per-read idle timeout; the transfer as a whole is unbounded.
const READ_TIMEOUT: Duration = Duration::from_secs(60);

pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            // Another crate installed one first.
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Client used for probes, ranged downloads and small fetches.
///
/// Response bodies are never transparently decompressed, so byte counts and
/// ranges always refer to the bytes on the wire.
pub fn build_client() -> Result<reqwest::Client> {
    install_rustls_provider();
    reqwest::Client::builder()
        .user_agent(DEFAULT_USER_AGENT)
        .connect_timeout(CONNECT_TIMEOUT)
        .read_timeout(READ_TIMEOUT)
        .pool_max_idle_per_host(16)
        .build()
        .map_err(|e| Error::config(format!("failed to build HTTP client: {e}")))
}
