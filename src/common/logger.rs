use tracing_subscriber::EnvFilter;

/// Maps the repeatable `-v` count to a base log level and installs the
/// subscriber. `RUST_LOG` overrides whatever the command line asked for.
pub fn init(verbosity: u8) {
    let base_level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(base_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}
