use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_true() -> bool {
    true
}

pub fn default_count() -> u32 {
    3
}

pub fn default_timeout_ms() -> u64 {
    800
}

pub fn default_concurrency() -> usize {
    8
}

pub fn default_rtt_cache_ttl_seconds() -> u64 {
    300
}

pub fn default_stale_grace_seconds() -> u64 {
    30
}

pub fn default_decay_days() -> u32 {
    7
}

pub fn default_max_failure_count() -> u32 {
    100
}

pub fn default_cache_shards() -> usize {
    32
}

/// 多次尝试的 RTT 汇总方式。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RttStrategy {
    /// 成功尝试的平均值（默认）。
    #[default]
    Avg,
    /// 成功尝试中的最小值。
    Min,
}

/// 各探测阶段使用的端口，默认 443 / 53 / 80。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProbePorts {
    #[serde(default = "default_tls_port")]
    pub tls: u16,
    #[serde(default = "default_udp_port")]
    pub udp: u16,
    #[serde(default = "default_http_port")]
    pub http: u16,
}

fn default_tls_port() -> u16 {
    443
}

fn default_udp_port() -> u16 {
    53
}

fn default_http_port() -> u16 {
    80
}

impl Default for ProbePorts {
    fn default() -> Self {
        Self {
            tls: default_tls_port(),
            udp: default_udp_port(),
            http: default_http_port(),
        }
    }
}

/// 测速排序引擎的运行期配置，位于主配置文件的 `ping` 节。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PingConfig {
    /// 解析层据此决定是否调用排序；引擎自身不读取。
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 每个 IP 的探测次数。
    #[serde(default = "default_count")]
    pub count: u32,
    /// 单阶段超时（毫秒）。
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// 同时进行探测的 IP 数上限。
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// 每次排序最多测试的 IP 数，0 表示不限制。
    #[serde(default)]
    pub max_test_ips: usize,
    /// RTT 缓存的基准 TTL（秒），0 表示关闭缓存与后台清理。
    #[serde(default = "default_rtt_cache_ttl_seconds")]
    pub rtt_cache_ttl_seconds: u64,
    /// 软过期后仍可返回旧值的容忍期（秒）。
    #[serde(default = "default_stale_grace_seconds")]
    pub stale_grace_seconds: u64,
    #[serde(default)]
    pub enable_http_fallback: bool,
    #[serde(default)]
    pub rtt_strategy: RttStrategy,
    /// IP 失效权重持久化文件；缺省时仅保存在内存。
    #[serde(default)]
    pub failure_weight_path: Option<String>,
    /// 失效权重线性衰减到 0 所需的天数。
    #[serde(default = "default_decay_days")]
    pub decay_days: u32,
    #[serde(default = "default_max_failure_count")]
    pub max_failure_count: u32,
    #[serde(default = "default_cache_shards")]
    pub cache_shards: usize,
    #[serde(default)]
    pub ports: ProbePorts,
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            count: default_count(),
            timeout_ms: default_timeout_ms(),
            concurrency: default_concurrency(),
            max_test_ips: 0,
            rtt_cache_ttl_seconds: default_rtt_cache_ttl_seconds(),
            stale_grace_seconds: default_stale_grace_seconds(),
            enable_http_fallback: false,
            rtt_strategy: RttStrategy::default(),
            failure_weight_path: None,
            decay_days: default_decay_days(),
            max_failure_count: default_max_failure_count(),
            cache_shards: default_cache_shards(),
            ports: ProbePorts::default(),
        }
    }
}

impl PingConfig {
    /// 将 0 等无效值替换为默认值；`max_test_ips` 与 `rtt_cache_ttl_seconds` 的 0 有含义，保留。
    pub fn normalized(mut self) -> Self {
        if self.count == 0 {
            self.count = default_count();
        }
        if self.timeout_ms == 0 {
            self.timeout_ms = default_timeout_ms();
        }
        if self.concurrency == 0 {
            self.concurrency = default_concurrency();
        }
        if self.decay_days == 0 {
            self.decay_days = default_decay_days();
        }
        if self.max_failure_count == 0 {
            self.max_failure_count = default_max_failure_count();
        }
        if self.cache_shards == 0 {
            self.cache_shards = default_cache_shards();
        }
        if let Some(path) = self.failure_weight_path.as_deref() {
            if path.trim().is_empty() {
                self.failure_weight_path = None;
            }
        }
        self
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn decay_window_ms(&self) -> i64 {
        i64::from(self.decay_days) * 24 * 60 * 60 * 1000
    }

    pub fn stale_grace_ms(&self) -> i64 {
        (self.stale_grace_seconds as i64).saturating_mul(1000)
    }

    pub fn cache_enabled(&self) -> bool {
        self.rtt_cache_ttl_seconds > 0
    }
}
