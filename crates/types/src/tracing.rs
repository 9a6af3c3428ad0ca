use std::sync::Once;

static TRACING_INIT: Once = Once::new();

/// Initialise the global tracing subscriber.
///
/// The log level is controlled by `RUST_LOG` (e.g. `RUST_LOG=debug` or
/// `RUST_LOG=pool=debug,info`); the default is `INFO`. Output goes to
/// stderr so worker stdout stays free for application use.
///
/// Idempotent — calls after the first are no-ops.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_ansi(false)
            .with_env_filter(filter)
            .try_init();
    });
}
