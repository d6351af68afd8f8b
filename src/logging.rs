//! Logging setup.
//!
//! Structured logging via `tracing`, formatted compactly so stderr output
//! keeps the "warning prefixed with the program name" feel the original
//! C tool gave with plain `warn(3)`/`warnx(3)` calls.

use tracing_subscriber::EnvFilter;

pub fn init(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env("PTYFWD_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
