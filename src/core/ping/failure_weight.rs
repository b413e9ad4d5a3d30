use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::RwLock,
};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use super::model::current_epoch_ms;

/// 普通失效的基础权重（毫秒当量）。
const FAILURE_WEIGHT_MS: i64 = 50;
/// 快速失败的额外权重，远高于普通失效。
const FAST_FAIL_WEIGHT_MS: i64 = 500;
/// 连续成功多少次后失效计数减一。
const SUCCESS_STREAK_FOR_RECOVERY: u32 = 3;

/// 单个 IP 的失效历史。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct IpFailureRecord {
    pub ip: String,
    #[serde(default)]
    pub failure_count: u32,
    #[serde(default)]
    pub fast_fail_count: u32,
    /// 连续成功次数，失效时清零。
    #[serde(default)]
    pub success_count: u32,
    #[serde(default)]
    pub total_attempts: u64,
    /// 最近一次失效时间（Unix epoch 毫秒），0 表示从未失效。
    #[serde(default)]
    pub last_failure_epoch_ms: i64,
    #[serde(default)]
    pub failure_rate: f64,
}

impl IpFailureRecord {
    pub fn new<S: Into<String>>(ip: S) -> Self {
        Self {
            ip: ip.into(),
            ..Self::default()
        }
    }

    fn refresh_rate(&mut self) {
        if self.total_attempts > 0 {
            self.failure_rate = f64::from(self.failure_count) / self.total_attempts as f64;
        }
    }

    fn mark_failure(&mut self, max_count: u32, now_ms: i64) {
        self.failure_count = self.failure_count.saturating_add(1).min(max_count);
        self.total_attempts = self.total_attempts.saturating_add(1);
        self.success_count = 0;
        self.last_failure_epoch_ms = now_ms;
        self.refresh_rate();
    }

    /// 按线性衰减计算的权重；超过衰减窗口即为 0。
    /// 有失效计数但缺少失效时间时不衰减，按全额计算。
    fn weight_at(&self, now_ms: i64, decay_window_ms: i64) -> i64 {
        let base = i64::from(self.failure_count) * FAILURE_WEIGHT_MS
            + i64::from(self.fast_fail_count) * FAST_FAIL_WEIGHT_MS;
        if base == 0 {
            return 0;
        }
        if self.last_failure_epoch_ms <= 0 {
            return base;
        }
        let elapsed = now_ms.saturating_sub(self.last_failure_epoch_ms).max(0);
        if decay_window_ms <= 0 || elapsed >= decay_window_ms {
            return 0;
        }
        let remaining = 1.0 - elapsed as f64 / decay_window_ms as f64;
        (base as f64 * remaining) as i64
    }
}

/// IP 失效权重跟踪器：记录解析结果中各 IP 的失效情况，用于排序惩罚。
#[derive(Debug)]
pub struct FailureWeightTracker {
    path: Option<PathBuf>,
    decay_window_ms: i64,
    max_failure_count: u32,
    records: RwLock<HashMap<String, IpFailureRecord>>,
}

impl FailureWeightTracker {
    pub fn in_memory(decay_window_ms: i64, max_failure_count: u32) -> Self {
        Self {
            path: None,
            decay_window_ms,
            max_failure_count: max_failure_count.max(1),
            records: RwLock::new(HashMap::new()),
        }
    }

    /// 从文件加载；文件不存在或损坏时以空状态启动，不返回错误。
    pub fn load_or_init_from_file(path: &Path, decay_window_ms: i64, max_failure_count: u32) -> Self {
        let mut tracker = Self::in_memory(decay_window_ms, max_failure_count);
        tracker.path = Some(path.to_path_buf());
        match Self::read_records(path) {
            Ok(Some(records)) => {
                let loaded = records.len();
                if let Ok(mut guard) = tracker.records.write() {
                    for record in records {
                        guard.insert(record.ip.clone(), record);
                    }
                }
                tracing::info!(
                    target = "ping",
                    path = %path.display(),
                    records = loaded,
                    "ip failure weights loaded"
                );
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(
                    target = "ping",
                    path = %path.display(),
                    error = %err,
                    "ip failure weights unreadable, starting empty"
                );
            }
        }
        tracker
    }

    fn read_records(path: &Path) -> Result<Option<Vec<IpFailureRecord>>> {
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read(path)
            .with_context(|| format!("read ip failure weights: {}", path.display()))?;
        let records = serde_json::from_slice::<Vec<IpFailureRecord>>(&data)
            .context("parse ip failure weights json")?;
        Ok(Some(records))
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn record_failure(&self, ip: &str) {
        self.record_failure_at(ip, current_epoch_ms());
    }

    pub fn record_failure_at(&self, ip: &str, now_ms: i64) {
        let max = self.max_failure_count;
        self.update(ip, |record| record.mark_failure(max, now_ms));
    }

    /// 快速失败：等同一次普通失效，外加快速失败计数。
    pub fn record_fast_fail(&self, ip: &str) {
        self.record_fast_fail_at(ip, current_epoch_ms());
    }

    pub fn record_fast_fail_at(&self, ip: &str, now_ms: i64) {
        let max = self.max_failure_count;
        self.update(ip, |record| {
            record.mark_failure(max, now_ms);
            record.fast_fail_count = record.fast_fail_count.saturating_add(1).min(max);
        });
    }

    /// 连续成功 3 次后失效计数减一并重新计数，不会一次清零。
    pub fn record_success(&self, ip: &str) {
        self.update(ip, |record| {
            record.success_count = record.success_count.saturating_add(1);
            record.total_attempts = record.total_attempts.saturating_add(1);
            if record.success_count >= SUCCESS_STREAK_FOR_RECOVERY && record.failure_count > 0 {
                record.failure_count -= 1;
                record.success_count = 0;
            }
            record.refresh_rate();
        });
    }

    fn update<F: FnOnce(&mut IpFailureRecord)>(&self, ip: &str, apply: F) {
        match self.records.write() {
            Ok(mut guard) => {
                let record = guard
                    .entry(ip.to_string())
                    .or_insert_with(|| IpFailureRecord::new(ip));
                apply(record);
            }
            Err(_) => {
                tracing::warn!(target = "ping", "ip failure weights lock poisoned");
            }
        }
    }

    pub fn get_weight(&self, ip: &str) -> i64 {
        self.weight_at(ip, current_epoch_ms())
    }

    /// 排序热路径：只读锁内查表，无分配。
    pub fn weight_at(&self, ip: &str, now_ms: i64) -> i64 {
        match self.records.read() {
            Ok(guard) => guard
                .get(ip)
                .map(|record| record.weight_at(now_ms, self.decay_window_ms))
                .unwrap_or(0),
            Err(_) => 0,
        }
    }

    /// 返回记录副本；未知 IP 返回空记录。
    pub fn get_record(&self, ip: &str) -> IpFailureRecord {
        self.records
            .read()
            .ok()
            .and_then(|guard| guard.get(ip).cloned())
            .unwrap_or_else(|| IpFailureRecord::new(ip))
    }

    pub fn all_records(&self) -> Vec<IpFailureRecord> {
        self.records
            .read()
            .map(|guard| guard.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|guard| guard.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut guard) = self.records.write() {
            guard.clear();
        }
    }

    /// 写入临时文件后重命名，保证磁盘上的快照完整；未配置路径时直接返回。
    pub fn save_to_disk(&self) -> Result<()> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        let mut records = {
            let guard = self
                .records
                .read()
                .map_err(|_| anyhow!("ip failure weights poisoned"))?;
            guard.values().cloned().collect::<Vec<_>>()
        };
        records.sort_by(|a, b| a.ip.cmp(&b.ip));
        let json = serde_json::to_string_pretty(&records).context("serialize ip failure weights")?;

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).ok();
        }
        let tmp = temp_path(path);
        fs::write(&tmp, json)
            .with_context(|| format!("write ip failure weights: {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("replace ip failure weights: {}", path.display()))?;
        tracing::debug!(
            target = "ping",
            path = %path.display(),
            records = records.len(),
            "ip failure weights saved"
        );
        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}
