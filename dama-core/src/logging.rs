//! Tracing subscriber bootstrap

use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber filtered by `level`
///
/// An empty or unparsable `level` falls back to `RUST_LOG`, then to `info`.
/// Calling this twice leaves the first subscriber in place.
pub fn init(level: &str) {
    let env_filter = EnvFilter::try_new(level)
        .ok()
        .filter(|_| !level.trim().is_empty())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init("debug");
        init("");
        tracing::info!("subscriber installed");
    }
}
