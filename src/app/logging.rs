//! Usage: Process-wide tracing subscriber (JSON lines in production, pretty output in debug).

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

fn default_directives(debug: bool) -> &'static str {
    if debug {
        "debug,hyper=info,h2=info,rustls=info"
    } else {
        "info"
    }
}

/// The returned guard flushes buffered lines on drop; keep it alive for the whole process.
pub fn init(debug: bool) -> WorkerGuard {
    let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(debug)));

    let layer = if debug {
        fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_span_events(FmtSpan::NONE)
            .pretty()
            .boxed()
    } else {
        fmt::layer()
            .with_writer(writer)
            .with_target(false)
            .json()
            .with_current_span(true)
            .flatten_event(true)
            .boxed()
    };

    if let Err(err) = tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()
    {
        eprintln!("tracing subscriber already installed: {err}");
    }

    // Dependencies that still speak `log` end up in the same sink.
    let _ = tracing_log::LogTracer::init();

    guard
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_switches_default_level() {
        assert!(default_directives(true).starts_with("debug"));
        assert_eq!(default_directives(false), "info");
    }
}
