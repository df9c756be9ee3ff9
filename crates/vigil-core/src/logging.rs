//! Tracing subscriber setup for processes hosting supervised loops.
//!
//! Every component logs through `tracing`; nothing is printed unless the
//! host installs a subscriber, either its own or one of these.

use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install a compact stderr subscriber filtered by `RUST_LOG`, defaulting
/// to `warn`. Panics if a global subscriber is already set.
///
/// ```bash
/// RUST_LOG=vigil_core=debug ./my-agent
/// ```
pub fn init() {
    subscriber().init();
}

/// Like [`init`], but reports an already-installed subscriber as an error.
pub fn try_init() -> Result<(), TryInitError> {
    subscriber().try_init()
}

fn subscriber() -> impl SubscriberInitExt {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_install_is_rejected() {
        let _ = try_init();
        assert!(try_init().is_err());
    }
}
