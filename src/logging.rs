//! Tracing subscriber setup.
//!
//! `RUST_LOG` takes precedence over the configured level.  Installing a
//! subscriber twice is harmless: the second call reports `false`.

use tracing::Subscriber;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// `fmt` subscriber in the configured format, filtered by `filter`.
fn build_subscriber(
    config: &LoggingConfig,
    filter: EnvFilter,
) -> Box<dyn Subscriber + Send + Sync> {
    if config.format.eq_ignore_ascii_case("json") {
        Box::new(tracing_subscriber::fmt().json().with_env_filter(filter).finish())
    } else {
        Box::new(tracing_subscriber::fmt().with_env_filter(filter).finish())
    }
}

/// Install a global `fmt` subscriber for `config`.
///
/// Returns `true` if this call installed the subscriber.
pub fn init_logging(config: &LoggingConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));

    let subscriber = build_subscriber(config, filter);
    let installed = tracing::subscriber::set_global_default(subscriber).is_ok();
    if installed {
        tracing::debug!(
            "Logging initialized: level={} format={}",
            config.level,
            config.format
        );
    }
    installed
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::Level;

    fn enabled_under(config: &LoggingConfig, level: Level) -> bool {
        let subscriber = build_subscriber(config, EnvFilter::new(config.level.as_str()));
        tracing::subscriber::with_default(subscriber, || match level {
            Level::DEBUG => tracing::enabled!(Level::DEBUG),
            _ => tracing::enabled!(Level::INFO),
        })
    }

    #[test]
    fn test_configured_level_filters_events() {
        let debug_json = LoggingConfig {
            level: "debug".to_string(),
            format: "json".to_string(),
        };
        assert!(enabled_under(&debug_json, Level::DEBUG));

        let warn_text = LoggingConfig {
            level: "warn".to_string(),
            format: "text".to_string(),
        };
        assert!(!enabled_under(&warn_text, Level::DEBUG));
        assert!(!enabled_under(&warn_text, Level::INFO));
    }
}
