/// Initialize the tracing subscriber for a relay binary.
///
/// `RUST_LOG` wins when set; otherwise `default_filter` (e.g.
/// `"teleop_host=info,teleop_shared=info"`) is used. Calling this twice is
/// harmless.
pub fn init_tracing(default_filter: &str) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_names(true)
                .with_timer(fmt::time::uptime()),
        )
        .with(filter)
        .try_init();
}
