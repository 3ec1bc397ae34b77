//! Structured logging for quasar nodes.
//!
//! Installs a `tracing` subscriber with a console layer and, in debug builds,
//! a JSON file layer for post-mortem analysis of session traffic. The filter
//! comes from `RUST_LOG` first, then the config's `debug.log_level`.

use std::path::Path;

use quasar_config::Config;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when neither `RUST_LOG` nor the config says otherwise.
pub const DEFAULT_FILTER: &str = "info,quasar_session=info";

/// Name of the JSON log file written in debug builds.
pub const LOG_FILE_NAME: &str = "quasar.log";

/// Filter string for `config`, falling back to [`DEFAULT_FILTER`].
pub fn filter_for(config: Option<&Config>) -> String {
    match config {
        Some(config) if !config.debug.log_level.is_empty() => config.debug.log_level.clone(),
        _ => DEFAULT_FILTER.to_string(),
    }
}

/// Initialize the tracing subscriber.
///
/// Console output carries uptime timestamps, targets and thread names (the
/// session loop thread is named). With `debug_build` set and a writable
/// `log_dir`, every event is also written as JSON to [`LOG_FILE_NAME`].
///
/// ```no_run
/// use quasar_config::Config;
///
/// let config = Config::default();
/// quasar_log::init_logging(None, false, Some(&config));
/// ```
pub fn init_logging(log_dir: Option<&Path>, debug_build: bool, config: Option<&Config>) {
    let filter_str = filter_for(config);
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(true)
        .with_level(true)
        .with_timer(fmt::time::uptime());

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer);

    if debug_build
        && let Some(log_dir) = log_dir
        && std::fs::create_dir_all(log_dir).is_ok()
        && let Ok(log_file) = std::fs::File::create(log_dir.join(LOG_FILE_NAME))
    {
        let file_layer = fmt::layer()
            .with_writer(log_file)
            .with_ansi(false)
            .with_target(true)
            .with_timer(fmt::time::uptime())
            .json();

        subscriber.with(file_layer).init();
        return;
    }

    subscriber.init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter() {
        let filter_str = EnvFilter::new(filter_for(None)).to_string();
        assert!(filter_str.contains("quasar_session=info"));
        assert!(filter_str.contains("info"));
    }

    #[test]
    fn test_config_level_overrides_default() {
        let mut config = Config::default();
        config.debug.log_level = "debug,quasar_session=trace".to_string();
        assert_eq!(filter_for(Some(&config)), "debug,quasar_session=trace");
    }

    #[test]
    fn test_empty_config_level_falls_back() {
        let mut config = Config::default();
        config.debug.log_level.clear();
        assert_eq!(filter_for(Some(&config)), DEFAULT_FILTER);
        assert_eq!(filter_for(None), DEFAULT_FILTER);
    }

    #[test]
    fn test_env_filter_parsing() {
        for filter_str in ["info", "debug,quasar_session=trace", "warn,quasar_node=debug"] {
            assert!(EnvFilter::try_from(filter_str).is_ok(), "failed to parse {filter_str}");
        }
    }

    #[test]
    fn test_log_file_lands_in_log_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        let log_file_path = temp_dir.path().join(LOG_FILE_NAME);
        assert_eq!(log_file_path.file_name().unwrap(), "quasar.log");
    }
}
