use crate::config::LogFormat;
use tracing_subscriber::EnvFilter;

/// Initialize structured logging.
///
/// Uses `RUST_LOG` if set, otherwise `info`. Logs go to stderr so run
/// progress on stdout stays readable.
pub fn init(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(true);

    match format {
        LogFormat::Pretty => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}
