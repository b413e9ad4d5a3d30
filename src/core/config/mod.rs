pub mod loader;
pub mod model;

pub use model::{AppConfig, LoggingCfg};
