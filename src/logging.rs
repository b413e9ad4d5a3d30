use tracing_subscriber::{fmt, EnvFilter};

use crate::core::config::model::LoggingCfg;

/// 安装全局 tracing 订阅者：优先读取 `RUST_LOG`，否则使用配置中的级别。
/// 已存在全局订阅者时直接返回。
pub fn init_logging(cfg: &LoggingCfg) {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(cfg.log_level.trim()))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_level(true)
        .compact()
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
    tracing::info!(target = "app", level = %cfg.log_level, "tracing initialized");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_is_idempotent() {
        let cfg = LoggingCfg { log_level: "not a level[".into() };
        init_logging(&cfg);
        init_logging(&LoggingCfg::default());
        assert!(tracing::dispatcher::has_been_set());
    }
}
