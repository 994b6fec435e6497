//! Logging setup
//!
//! Every environment logs timestamped lines to stdout. Dev additionally
//! writes a daily-rotating file under `logs/`. `RUST_LOG` overrides the
//! default filter.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::Environment;

const LOG_DIR: &str = "logs";
const LOG_FILE_PREFIX: &str = "plan_sync.log";

/// Keeps the non-blocking file writer alive; drop it last.
pub struct LogGuard {
    _file: Option<tracing_appender::non_blocking::WorkerGuard>,
}

pub fn default_filter(env: Environment) -> &'static str {
    match env {
        Environment::Dev => "plan_sync=debug,info",
        Environment::Staging | Environment::Prod => "plan_sync=info,warn",
    }
}

/// Install the global subscriber for `env`.
pub fn init(env: Environment) -> LogGuard {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(env).into());

    let stdout = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout)
        .with_target(true);

    let (file, guard) = if env.writes_log_file() {
        let appender = tracing_appender::rolling::daily(LOG_DIR, LOG_FILE_PREFIX);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_target(true);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout)
        .with(file)
        .init();

    LogGuard { _file: guard }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filters_parse() {
        for env in [Environment::Dev, Environment::Staging, Environment::Prod] {
            assert!(EnvFilter::try_new(default_filter(env)).is_ok());
        }
    }
}
