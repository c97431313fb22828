//! Configuration types for the stub store.

mod insertion;
mod logging;
mod retention;
mod store;

use std::path::Path;

use serde::{Deserialize, Serialize};

pub use insertion::InsertionConfig;
pub use logging::{LogFormat, LoggingConfig};
pub use retention::RetentionConfig;
pub use store::{RedisConfig, StoreConfig};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub insertion: InsertionConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        match self.store.backend.as_str() {
            "inmemory" => {}
            "redis" => {
                if self.store.redis.is_none() {
                    anyhow::bail!(
                        "Redis backend selected but no 'store.redis' section provided. \
                         Please provide at least 'store.redis.url'"
                    );
                }
            }
            other => {
                anyhow::bail!("Unknown store backend: '{other}'. Supported: inmemory, redis");
            }
        }

        if self.insertion.max_attempts == 0 {
            anyhow::bail!("'insertion.max_attempts' must be at least 1");
        }

        Ok(())
    }
}
