use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Install the global subscriber. Internal logs are written to `stderr`,
/// records own `stdout`.
///
/// `levels` takes the `RUST_LOG` directive syntax, so `info,file_source=debug`
/// works as well as a bare level.
pub fn init(color: bool, json: bool, levels: &str) {
    let filter = EnvFilter::try_new(levels).unwrap_or_else(|_| EnvFilter::new("info"));

    // Ignore errors when setting, since tests can initialize this
    // multiple times.
    let _ = if json {
        FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .flatten_event(true)
            .try_init()
    } else {
        FmtSubscriber::builder()
            .with_ansi(color)
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init()
    };
}
