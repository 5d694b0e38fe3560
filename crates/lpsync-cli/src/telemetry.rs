use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer, Registry};

/// Logs go to stderr; stdout carries only the report.
pub fn init_tracing(json: bool, level: Level) {
    let output = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);
    let output: Box<dyn Layer<Registry> + Send + Sync> = if json {
        output.json().boxed()
    } else {
        output.boxed()
    };
    tracing_subscriber::registry()
        .with(output)
        .with(log_filter(std::env::var(EnvFilter::DEFAULT_ENV).ok(), level))
        .try_init()
        .ok();
}

/// `RUST_LOG` directives when they parse, otherwise the `--verbose` level.
fn log_filter(directives: Option<String>, level: Level) -> EnvFilter {
    directives
        .filter(|d| !d.trim().is_empty())
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new(level.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::level_filters::LevelFilter;

    #[test]
    fn verbosity_applies_without_directives() {
        assert_eq!(log_filter(None, Level::DEBUG).max_level_hint(), Some(LevelFilter::DEBUG));
        assert_eq!(
            log_filter(Some("  ".into()), Level::INFO).max_level_hint(),
            Some(LevelFilter::INFO)
        );
    }

    #[test]
    fn env_directives_win_over_verbosity() {
        let filter = log_filter(Some("lpsync_sync=trace".into()), Level::INFO);
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::TRACE));
    }
}
