use std::{
    collections::{HashMap, HashSet},
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::Result;
use futures::FutureExt;
use tokio::{sync::Semaphore, task::JoinSet};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::core::config::{loader, model::AppConfig};

use super::{
    builder,
    cache::{RttCacheEntry, ShardedRttCache},
    coalesce::ProbeCoalescer,
    config::{PingConfig, RttStrategy},
    failure_weight::{FailureWeightTracker, IpFailureRecord},
    maintenance::CacheCleaner,
    model::{current_epoch_ms, ProbeMethod, ProbeResult, UNREACHABLE_RTT_MS},
    probe::{default_prober, ProberFn},
    scoring,
};

/// 每次丢失的尝试追加的 RTT 惩罚（毫秒）。
const LOST_ATTEMPT_PENALTY_MS: i64 = 150;

/// 后台任务与前台调用共享的探测状态。
struct ProbeContext {
    config: PingConfig,
    cache: Arc<ShardedRttCache>,
    weights: Arc<FailureWeightTracker>,
    coalescer: ProbeCoalescer,
    prober: ProberFn,
}

impl ProbeContext {
    /// 经合并器执行一次完整测量；缓存与失效权重只由实际执行探测的调用方写入。
    async fn probe_and_store(&self, ip: &str, domain: &str) -> ProbeResult {
        let key = ProbeCoalescer::key(ip, domain);
        self.coalescer
            .run(key, || async move {
                let result = self.measure(ip, domain).await;
                self.store(&result);
                result
            })
            .await
    }

    async fn measure(&self, ip: &str, domain: &str) -> ProbeResult {
        let count = self.config.count.max(1);
        let mut rtts: Vec<i64> = Vec::with_capacity(count as usize);
        let mut method: Option<ProbeMethod> = None;

        for attempt in 0..count {
            match (self.prober)(ip.to_string(), domain.to_string()).await {
                Ok(sample) => {
                    method.get_or_insert(sample.method);
                    rtts.push(sample.rtt_ms);
                }
                Err(err) => {
                    tracing::debug!(
                        target = "ping",
                        ip,
                        domain,
                        attempt,
                        error = %err,
                        "probe attempt failed"
                    );
                    if attempt == 0 {
                        self.weights.record_fast_fail(ip);
                        return ProbeResult::fast_failed(ip);
                    }
                }
            }
        }

        let (Some(method), Some(base)) = (method, aggregate_rtt(&rtts, self.config.rtt_strategy)) else {
            return ProbeResult::unreachable(ip);
        };
        let lost = i64::from(count) - rtts.len() as i64;
        let rtt_ms = base + lost * LOST_ATTEMPT_PENALTY_MS;
        let loss_percent = lost as f64 / f64::from(count) * 100.0;
        tracing::debug!(
            target = "ping",
            ip,
            domain,
            rtt_ms,
            loss_percent,
            method = %method,
            "probe finished"
        );
        ProbeResult::new(ip, rtt_ms, loss_percent, method)
    }

    fn store(&self, result: &ProbeResult) {
        // 快速失败已在测量循环中记录
        if !result.fast_fail {
            if result.loss_percent == 0.0 {
                self.weights.record_success(&result.ip);
            } else {
                self.weights.record_failure(&result.ip);
            }
        }
        if !self.config.cache_enabled() {
            return;
        }
        let base_ttl_ms = (self.config.rtt_cache_ttl_seconds as i64).saturating_mul(1000);
        let ttl_ms = scoring::dynamic_ttl_ms(result, base_ttl_ms);
        let stale_at = current_epoch_ms().saturating_add(ttl_ms);
        let expires_at = stale_at.saturating_add(self.config.stale_grace_ms());
        self.cache.set(
            &result.ip,
            RttCacheEntry::new(
                result.rtt_ms,
                result.loss_percent,
                result.probe_method,
                stale_at,
                expires_at,
            ),
        );
    }
}

/// 命中缓存时把原探测方式的惩罚并入 RTT，使缓存结果与新鲜结果的得分一致；
/// 不可达条目保持哨兵值。
fn cached_rtt(entry: &RttCacheEntry) -> i64 {
    if entry.rtt_ms >= UNREACHABLE_RTT_MS {
        return entry.rtt_ms;
    }
    entry
        .rtt_ms
        .saturating_add(scoring::probe_method_penalty(entry.probe_method))
}

fn aggregate_rtt(rtts: &[i64], strategy: RttStrategy) -> Option<i64> {
    if rtts.is_empty() {
        return None;
    }
    match strategy {
        RttStrategy::Min => rtts.iter().copied().min(),
        RttStrategy::Avg => Some(rtts.iter().sum::<i64>() / rtts.len() as i64),
    }
}

/// IP 测速排序引擎。
///
/// 持有独立的 RTT 缓存、失效权重、请求合并器与后台刷新集合，
/// 多个实例之间不共享任何状态。
pub struct Pinger {
    inner: Arc<ProbeContext>,
    refreshing: Arc<Mutex<HashSet<String>>>,
    refresh_tasks: TaskTracker,
    cleaner: Mutex<Option<CacheCleaner>>,
    stopped: AtomicBool,
}

impl Pinger {
    /// 使用真实网络探测；失效权重相对路径按默认配置目录解析。
    pub fn new(config: PingConfig) -> Result<Self> {
        Self::with_base_dir(config, &loader::base_dir())
    }

    pub fn with_base_dir(config: PingConfig, base_dir: &Path) -> Result<Self> {
        let config = config.normalized();
        let prober = default_prober(&config);
        Self::with_prober(config, base_dir, prober)
    }

    pub fn from_app_config(app_cfg: &AppConfig, base_dir: &Path) -> Result<Self> {
        Self::with_base_dir(builder::effective_config(app_cfg), base_dir)
    }

    /// 注入自定义探测函数，便于在无网络环境下驱动引擎。
    pub fn with_prober(config: PingConfig, base_dir: &Path, prober: ProberFn) -> Result<Self> {
        let config = config.normalized();
        let cache = Arc::new(ShardedRttCache::new(config.cache_shards));
        let weights = builder::init_failure_tracker(&config, base_dir);
        let cleaner = if config.cache_enabled() {
            Some(CacheCleaner::spawn(
                cache.clone(),
                Duration::from_secs(config.rtt_cache_ttl_seconds),
            )?)
        } else {
            None
        };
        tracing::info!(
            target = "ping",
            count = config.count,
            timeout_ms = config.timeout_ms,
            concurrency = config.concurrency,
            cache_ttl_secs = config.rtt_cache_ttl_seconds,
            "pinger initialized"
        );
        Ok(Self {
            inner: Arc::new(ProbeContext {
                config,
                cache,
                weights,
                coalescer: ProbeCoalescer::new(),
                prober,
            }),
            refreshing: Arc::new(Mutex::new(HashSet::new())),
            refresh_tasks: TaskTracker::new(),
            cleaner: Mutex::new(cleaner),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &PingConfig {
        &self.inner.config
    }

    /// 解析层据此决定是否调用排序；引擎自身在被调用时总会排序。
    pub fn is_enabled(&self) -> bool {
        self.inner.config.enabled
    }

    pub async fn rank_and_sort(&self, ips: &[String], domain: &str) -> Vec<ProbeResult> {
        self.rank_and_sort_with_cancel(ips, domain, &CancellationToken::new())
            .await
    }

    /// 取消后不再等待尚未完成的探测，返回已得到的部分结果。
    pub async fn rank_and_sort_with_cancel(
        &self,
        ips: &[String],
        domain: &str,
        cancel: &CancellationToken,
    ) -> Vec<ProbeResult> {
        let cfg = &self.inner.config;
        let limit = if cfg.max_test_ips > 0 {
            cfg.max_test_ips.min(ips.len())
        } else {
            ips.len()
        };
        let candidates = &ips[..limit];
        if candidates.is_empty() {
            return Vec::new();
        }

        let now = current_epoch_ms();
        let mut results = Vec::with_capacity(candidates.len());
        let mut misses = Vec::new();
        for ip in candidates {
            match self.cached_result(ip, now) {
                Some(result) => {
                    if result.probe_method == ProbeMethod::Stale {
                        self.spawn_revalidation(ip, domain);
                    }
                    results.push(result);
                }
                None => misses.push(ip.clone()),
            }
        }

        let hits = results.len();
        let fresh = self.probe_all(misses, domain, cancel).await;
        tracing::debug!(
            target = "ping",
            domain,
            candidates = candidates.len(),
            cache_hits = hits,
            probed = fresh.len(),
            cancelled = cancel.is_cancelled(),
            "rank finished"
        );
        results.extend(fresh);
        scoring::sort_results(results, &self.inner.weights, current_epoch_ms())
    }

    /// 排序后仅返回 IP 字符串。
    pub async fn sort_ips(&self, ips: &[String], domain: &str) -> Vec<String> {
        self.rank_and_sort(ips, domain)
            .await
            .into_iter()
            .map(|result| result.ip)
            .collect()
    }

    fn cached_result(&self, ip: &str, now_ms: i64) -> Option<ProbeResult> {
        if !self.inner.config.cache_enabled() {
            return None;
        }
        let entry = self.inner.cache.get(ip)?;
        if entry.is_expired(now_ms) {
            return None;
        }
        let method = if entry.is_stale(now_ms) {
            ProbeMethod::Stale
        } else {
            ProbeMethod::Cached
        };
        Some(ProbeResult::new(ip, cached_rtt(&entry), entry.loss_percent, method))
    }

    async fn probe_all(
        &self,
        ips: Vec<String>,
        domain: &str,
        cancel: &CancellationToken,
    ) -> Vec<ProbeResult> {
        if ips.is_empty() {
            return Vec::new();
        }
        let semaphore = Arc::new(Semaphore::new(self.inner.config.concurrency.max(1)));
        let mut tasks = JoinSet::new();
        let mut results = Vec::with_capacity(ips.len());

        for ip in ips {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let ctx = self.inner.clone();
            let domain = domain.to_string();
            tasks.spawn(async move {
                let _permit = permit;
                ctx.probe_and_store(&ip, &domain).await
            });
        }

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    while let Some(Some(joined)) = tasks.join_next().now_or_never() {
                        if let Ok(result) = joined {
                            results.push(result);
                        }
                    }
                    // 已派发的探测继续在后台完成并写入缓存
                    tasks.detach_all();
                    break;
                }
                joined = tasks.join_next() => match joined {
                    Some(Ok(result)) => results.push(result),
                    Some(Err(err)) => {
                        tracing::debug!(target = "ping", error = %err, "probe task join error");
                    }
                    None => break,
                },
            }
        }
        results
    }

    /// 每个 IP 同一时间最多一个后台刷新任务。
    fn spawn_revalidation(&self, ip: &str, domain: &str) {
        match self.refreshing.lock() {
            Ok(mut guard) => {
                if !guard.insert(ip.to_string()) {
                    return;
                }
            }
            Err(_) => return,
        }
        let ctx = self.inner.clone();
        let refreshing = self.refreshing.clone();
        let ip = ip.to_string();
        let domain = domain.to_string();
        self.refresh_tasks.spawn(async move {
            let result = ctx.probe_and_store(&ip, &domain).await;
            tracing::debug!(
                target = "ping",
                ip = %ip,
                rtt_ms = result.rtt_ms,
                method = %result.probe_method,
                "stale entry revalidated"
            );
            if let Ok(mut guard) = refreshing.lock() {
                guard.remove(&ip);
            }
        });
    }

    /// 等待当前所有后台刷新结束。
    pub async fn wait_background_refreshes(&self) {
        self.refresh_tasks.close();
        self.refresh_tasks.wait().await;
        self.refresh_tasks.reopen();
    }

    pub fn pending_refreshes(&self) -> usize {
        self.refreshing.lock().map(|guard| guard.len()).unwrap_or(0)
    }

    pub fn record_ip_failure(&self, ip: &str) {
        self.inner.weights.record_failure(ip);
    }

    pub fn record_ip_fast_fail(&self, ip: &str) {
        self.inner.weights.record_fast_fail(ip);
    }

    pub fn record_ip_success(&self, ip: &str) {
        self.inner.weights.record_success(ip);
    }

    pub fn failure_weight(&self, ip: &str) -> i64 {
        self.inner.weights.get_weight(ip)
    }

    pub fn failure_record(&self, ip: &str) -> IpFailureRecord {
        self.inner.weights.get_record(ip)
    }

    pub fn failure_records(&self) -> Vec<IpFailureRecord> {
        self.inner.weights.all_records()
    }

    pub fn clear_failure_records(&self) {
        self.inner.weights.clear();
    }

    pub fn save_failure_weights(&self) -> Result<()> {
        self.inner.weights.save_to_disk()
    }

    pub fn cache_len(&self) -> usize {
        self.inner.cache.len()
    }

    pub fn cache_entries(&self) -> HashMap<String, RttCacheEntry> {
        self.inner.cache.all_entries()
    }

    pub fn clear_cache(&self) {
        self.inner.cache.clear();
    }

    pub fn cleaner_running(&self) -> bool {
        self.cleaner
            .lock()
            .map(|guard| guard.as_ref().map(CacheCleaner::is_running).unwrap_or(false))
            .unwrap_or(false)
    }

    /// 停止后台清理并落盘失效权重；只有首次调用生效。
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let cleaner = self.cleaner.lock().ok().and_then(|mut guard| guard.take());
        if let Some(mut cleaner) = cleaner {
            cleaner.stop();
        }
        if let Err(err) = self.inner.weights.save_to_disk() {
            tracing::warn!(target = "ping", error = %err, "failed to flush ip failure weights");
        }
        tracing::info!(target = "ping", "pinger stopped");
    }
}

impl Drop for Pinger {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cached_rtt_keeps_method_penalty() {
        let udp = RttCacheEntry::new(10, 0.0, ProbeMethod::Udp53, 1, 2);
        let tls = RttCacheEntry::new(20, 0.0, ProbeMethod::Tls, 1, 2);
        assert_eq!(cached_rtt(&udp), 510);
        assert_eq!(cached_rtt(&tls), 120);
        let dead = RttCacheEntry::new(UNREACHABLE_RTT_MS, 100.0, ProbeMethod::None, 1, 2);
        assert_eq!(cached_rtt(&dead), UNREACHABLE_RTT_MS);
    }

    #[test]
    fn aggregate_by_strategy() {
        assert_eq!(aggregate_rtt(&[], RttStrategy::Avg), None);
        assert_eq!(aggregate_rtt(&[10, 20, 33], RttStrategy::Avg), Some(21));
        assert_eq!(aggregate_rtt(&[10, 20, 33], RttStrategy::Min), Some(10));
    }
}
