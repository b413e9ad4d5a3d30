use serde::{Deserialize, Serialize};

use crate::core::ping::PingConfig;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LoggingCfg {
    #[serde(default = "default_log_level")] pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default)] pub ping: PingConfig,
    #[serde(default)] pub logging: LoggingCfg,
}

fn default_log_level() -> String { "info".to_string() }

impl Default for LoggingCfg {
    fn default() -> Self {
        Self { log_level: default_log_level() }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            ping: PingConfig::default(),
            logging: LoggingCfg::default(),
        }
    }
}
