use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber. Level comes from `RESCUE_LOG` (default `info`).
/// Logs go to stderr; stdout carries only plans and reports.
pub fn init() {
    let env_filter = EnvFilter::try_from_env("RESCUE_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .init();
}
