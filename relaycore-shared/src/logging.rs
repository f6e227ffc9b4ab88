//! Tracing bootstrap shared by both binaries.
//!
//! One call at startup: a binary calls
//! [`init_tracing`] once before doing anything else, and every subsequent
//! `tracing::info!`/`#[instrument]` call is captured by the resulting
//! subscriber. Format (plain vs JSON) is controlled by `RELAYCORE_LOG_FORMAT`
//! so operators can switch without a rebuild.

use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the global tracing subscriber.
///
/// Honors `RUST_LOG` for filtering (defaulting to `info` when unset) and
/// `RELAYCORE_LOG_FORMAT=json` to switch to structured JSON output, which
/// operators point log shippers at in production.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json = std::env::var("RELAYCORE_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let builder = fmt().with_env_filter(filter).with_target(true);

    if json {
        let _ = builder.json().try_init();
    } else {
        let _ = builder.try_init();
    }
}
