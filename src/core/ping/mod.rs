//! IP 测速与排序引擎：对 DNS 解析得到的候选 IP 做分层探测（TCP/TLS → UDP DNS → 可选 TCP 80），
//! 结合 RTT 缓存、请求合并与失效权重给出综合排序。

pub mod cache;
pub mod coalesce;
pub mod config;
pub mod failure_weight;
pub mod model;
pub mod probe;
pub mod scoring;

mod builder;
mod maintenance;
pub mod manager;

pub use cache::{RttCacheEntry, ShardedRttCache};
pub use coalesce::ProbeCoalescer;
pub use config::{PingConfig, ProbePorts, RttStrategy};
pub use failure_weight::{FailureWeightTracker, IpFailureRecord};
pub use builder::{effective_config, load_ping_config_at};
pub use manager::Pinger;
pub use model::{current_epoch_ms, ProbeMethod, ProbeResult, UNREACHABLE_RTT_MS};
pub use probe::{default_prober, ProbeError, ProbeSample, ProberFn, ProtocolProber};
