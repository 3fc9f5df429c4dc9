use tracing_subscriber::{fmt, EnvFilter};
use tracing_subscriber::prelude::*;

/// Filter used when `RUST_LOG` is unset. Audit events stay on even when the
/// crate itself is quieter.
pub const DEFAULT_DIRECTIVES: &str = "warn,token_broker=info,audit=info";

/// Install the global subscriber on stderr so stdout carries only command output.
///
/// Targets are printed because audit events are told apart by their `audit` target.
pub fn init() {
    let _ = try_init(DEFAULT_DIRECTIVES);
}

/// Like [`init`] with explicit fallback directives; fails if a subscriber is already set.
pub fn try_init(default_directives: &str) -> Result<(), tracing_subscriber::util::TryInitError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives));
    let fmt_layer = fmt::layer().with_target(true).with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
}
