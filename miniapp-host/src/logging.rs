use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Install the fmt subscriber. `RUST_LOG` adds to the default `miniapp=info` directive.
/// Safe to call more than once; later calls are no-ops.
pub fn init() {
    let filter = EnvFilter::from_default_env().add_directive(
        "miniapp=info"
            .parse()
            .unwrap_or_else(|_| LevelFilter::INFO.into()),
    );
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
