/// Logging setup for the binary

use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber. `RUST_LOG` wins; otherwise `stackguard=info`,
/// or `stackguard=debug` with `--verbose`.
pub fn init_tracing(verbose: bool) {
    let default = if verbose { "stackguard=debug" } else { "stackguard=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    // Logs go to stderr so command output stays pipeable
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
