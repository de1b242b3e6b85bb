//! Support for tracing execution of a program.

use tracing_subscriber::{fmt::Subscriber, prelude::*, EnvFilter};

/// Set up the `tracing` library with reasonable options.
pub fn initialize_tracing() {
    let filter = EnvFilter::from_default_env();
    Subscriber::builder()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .finish()
        .init();
}
