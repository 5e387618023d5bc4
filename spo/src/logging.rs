//! Diagnostic tracing for the `spo` binary.
//!
//! Output goes to stderr so stdout stays reserved for progress lines and
//! results. `RUST_LOG` wins over the verbosity flag when set.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Defaults to `warn`, or `spo=info` with `--verbose`. Output: stderr,
/// compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=spo=debug spo run --task-file task.md --prompt "Answer briefly."
/// ```
pub fn init(verbose: bool) {
    let default_directive = if verbose { "warn,spo=info" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
