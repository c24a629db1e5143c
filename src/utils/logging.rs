//! Structured logging configuration.
//!
//! The library itself only emits `tracing` events; installing a subscriber
//! is the consumer's choice. This helper wires up a sensible default for
//! binaries and tests.

use tracing_subscriber::{fmt, EnvFilter};

/// Install a formatting subscriber honoring `RUST_LOG`.
///
/// Defaults to `info` for this crate when `RUST_LOG` is unset. Safe to call
/// more than once; only the first call installs.
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("secure_channel=info"));
    let _ = fmt().with_env_filter(filter).with_target(true).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init();
        init();
    }
}
