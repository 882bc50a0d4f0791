use tracing_subscriber::EnvFilter;

/// Installs the global subscriber. An explicit `RUST_LOG` wins; otherwise
/// `level` applies to the bridge crates while the dependency tree stays at
/// warn.
pub fn set(level: String) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,livebridge={level},rtsp={level},registry={level}",
            level = level
        ))
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .compact()
        .with_thread_names(true)
        .with_target(true)
        .init();
}
