//! Subscriber setup for the binaries.

use anyhow::anyhow;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LoggingConfig};

/// Install the global `fmt` subscriber. `RUST_LOG` takes precedence over the
/// resolved level.
pub fn init(config: &LoggingConfig, cli_level_override: Option<&str>) -> anyhow::Result<()> {
    let level = resolve_log_level(config, cli_level_override)?;
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    match config.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .json()
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .pretty()
            .try_init(),
    }
    .map_err(|err| anyhow!("initialize logging subscriber: {err}"))
}

fn resolve_log_level(
    config: &LoggingConfig,
    cli_level_override: Option<&str>,
) -> anyhow::Result<LevelFilter> {
    let raw_level = cli_level_override.unwrap_or(&config.level);
    raw_level
        .trim()
        .to_ascii_lowercase()
        .parse::<LevelFilter>()
        .map_err(|_| {
            anyhow!(
                "invalid log level `{raw_level}`; expected one of trace, debug, info, warn, error, off"
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_log_level_from_config() {
        let config = LoggingConfig {
            level: "Debug".to_string(),
            format: LogFormat::Json,
        };
        assert_eq!(resolve_log_level(&config, None).unwrap(), LevelFilter::DEBUG);
    }

    #[test]
    fn test_cli_override_wins() {
        let config = LoggingConfig::default();
        assert_eq!(
            resolve_log_level(&config, Some("warn")).unwrap(),
            LevelFilter::WARN
        );
    }

    #[test]
    fn test_invalid_level_rejected() {
        let config = LoggingConfig {
            level: "loud".to_string(),
            format: LogFormat::Pretty,
        };
        let err = resolve_log_level(&config, None).unwrap_err().to_string();
        assert!(err.contains("invalid log level `loud`"));
    }
}
