use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing with stdout and, when `log_dir` is set, a daily rolling file.
/// Format: human-readable logfmt OR JSON if desired.
///
/// Keep the returned guard alive for the life of the process; dropping it
/// stops the background file writer.
pub fn init_logging(log_dir: Option<&str>, json_format: bool) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // Console layer (stderr so piped tool output stays clean)
    let stdout_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true);

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            // Log file = <dir>/eds.log.{date}
            let file_appender = rolling::daily(dir, "eds.log");
            let (non_blocking_file, guard) = tracing_appender::non_blocking(file_appender);

            let layer = if json_format {
                fmt::layer()
                    .json()
                    .with_writer(non_blocking_file)
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_level(true)
                    .boxed()
            } else {
                fmt::layer()
                    .with_writer(non_blocking_file)
                    .with_target(false)
                    .with_level(true)
                    .with_ansi(false)
                    .boxed()
            };
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    // try_init so a second call (tests, embedding) leaves the first subscriber in place
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init();

    guard
}
