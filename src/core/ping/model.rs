use serde::{Deserialize, Serialize};
use std::{
    fmt,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

/// 不可达哨兵值：探测全部失败时对外暴露的 RTT（毫秒）。
pub const UNREACHABLE_RTT_MS: i64 = 999_999;

/// 探测方式，决定排序时的置信度惩罚。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProbeMethod {
    Icmp,
    /// TCP 443 建连后完成 TLS 握手（带 SNI）。
    Tls,
    Tcp443,
    /// 仅在开启 HTTP 兜底时使用的 TCP 80 建连。
    Tcp80,
    Udp53,
    /// 所有阶段均失败。
    None,
    /// 来自新鲜缓存。
    Cached,
    /// 来自软过期缓存，后台正在刷新。
    Stale,
}

impl ProbeMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Icmp => "icmp",
            Self::Tls => "tls",
            Self::Tcp443 => "tcp443",
            Self::Tcp80 => "tcp80",
            Self::Udp53 => "udp53",
            Self::None => "none",
            Self::Cached => "cached",
            Self::Stale => "stale",
        }
    }
}

impl fmt::Display for ProbeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单个 IP 的测速结果，产生后不再修改。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    pub ip: String,
    /// 毫秒；`UNREACHABLE_RTT_MS` 表示不可达。
    pub rtt_ms: i64,
    /// 丢包率，取值 0..=100。
    pub loss_percent: f64,
    pub probe_method: ProbeMethod,
    /// 首次尝试即失败、提前放弃剩余尝试。
    #[serde(default)]
    pub fast_fail: bool,
}

impl ProbeResult {
    pub fn new<S: Into<String>>(ip: S, rtt_ms: i64, loss_percent: f64, method: ProbeMethod) -> Self {
        Self {
            ip: ip.into(),
            rtt_ms,
            loss_percent,
            probe_method: method,
            fast_fail: false,
        }
    }

    pub fn unreachable<S: Into<String>>(ip: S) -> Self {
        Self::new(ip, UNREACHABLE_RTT_MS, 100.0, ProbeMethod::None)
    }

    pub fn fast_failed<S: Into<String>>(ip: S) -> Self {
        Self {
            fast_fail: true,
            ..Self::unreachable(ip)
        }
    }

    pub fn is_unreachable(&self) -> bool {
        self.loss_percent >= 100.0 || self.rtt_ms >= UNREACHABLE_RTT_MS
    }
}

pub fn current_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_millis() as i64
}
