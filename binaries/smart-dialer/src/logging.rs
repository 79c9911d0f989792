use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initializes the tracing subscriber: compact logs to stderr, filtered by `RUST_LOG`
/// (defaulting to `smart_dialer=debug`). Logging is stateless and non-structural (§9): callers
/// never branch on what got logged.
pub fn init_logging() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().compact().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive("smart_dialer=debug".parse()?)
                .from_env_lossy(),
        )
        .try_init()?;
    Ok(())
}
