use std::{path::Path, sync::Arc};

use anyhow::Result;

use crate::core::config::{loader, model::AppConfig};

use super::{config::PingConfig, failure_weight::FailureWeightTracker};

/// 从主配置文件读取 `ping` 节并规范化。
pub fn load_ping_config_at(base_dir: &Path) -> Result<PingConfig> {
    let app_cfg = loader::load_or_init_at(base_dir)?;
    Ok(effective_config(&app_cfg))
}

pub fn effective_config(app_cfg: &AppConfig) -> PingConfig {
    app_cfg.ping.clone().normalized()
}

/// 按配置构造失效权重跟踪器；相对路径按 `base_dir` 解析，未配置路径时仅保存在内存。
pub(super) fn init_failure_tracker(config: &PingConfig, base_dir: &Path) -> Arc<FailureWeightTracker> {
    let decay = config.decay_window_ms();
    let max = config.max_failure_count;
    match config
        .failure_weight_path
        .as_deref()
        .map(str::trim)
        .filter(|path| !path.is_empty())
    {
        Some(raw_path) => {
            let resolved = loader::resolve_path(base_dir, raw_path);
            Arc::new(FailureWeightTracker::load_or_init_from_file(&resolved, decay, max))
        }
        None => Arc::new(FailureWeightTracker::in_memory(decay, max)),
    }
}
