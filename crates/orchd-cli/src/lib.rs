//! Shared plumbing for the `orchd` and `orchctl` binaries.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize diagnostics (respects `RUST_LOG`).
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();
}
