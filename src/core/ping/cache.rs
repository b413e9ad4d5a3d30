use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        RwLock,
    },
};

use super::model::{current_epoch_ms, ProbeMethod};

const MAX_SHARDS: usize = 1024;
const FALLBACK_SHARDS: usize = 16;

const FNV_OFFSET_32: u32 = 2_166_136_261;
const FNV_PRIME_32: u32 = 16_777_619;

/// 单个 IP 的 RTT 缓存条目。
///
/// `stale_at_epoch_ms` 为软过期：超过后仍可返回，但需后台刷新；
/// `expires_at_epoch_ms` 为硬过期：超过后视为未命中。
/// `probe_method` 记录产生该条目的探测方式，命中缓存时据此保留置信度惩罚。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RttCacheEntry {
    pub rtt_ms: i64,
    pub loss_percent: f64,
    pub probe_method: ProbeMethod,
    pub stale_at_epoch_ms: i64,
    pub expires_at_epoch_ms: i64,
}

impl RttCacheEntry {
    /// `stale_at` 超过 `expires_at` 时收紧到 `expires_at`。
    pub fn new(
        rtt_ms: i64,
        loss_percent: f64,
        probe_method: ProbeMethod,
        stale_at_epoch_ms: i64,
        expires_at_epoch_ms: i64,
    ) -> Self {
        Self {
            rtt_ms,
            loss_percent,
            probe_method,
            stale_at_epoch_ms: stale_at_epoch_ms.min(expires_at_epoch_ms),
            expires_at_epoch_ms,
        }
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at_epoch_ms
    }

    pub fn is_stale(&self, now_ms: i64) -> bool {
        now_ms >= self.stale_at_epoch_ms
    }
}

#[derive(Debug, Default)]
struct RttCacheShard {
    entries: RwLock<HashMap<String, RttCacheEntry>>,
}

/// 分片 RTT 缓存：每个分片独立加锁，不同 IP 之间互不争用。
#[derive(Debug)]
pub struct ShardedRttCache {
    shards: Vec<RttCacheShard>,
    mask: u32,
    cleanup_cursor: AtomicUsize,
}

impl Default for ShardedRttCache {
    fn default() -> Self {
        Self::new(super::config::default_cache_shards())
    }
}

impl ShardedRttCache {
    /// 分片数向上取整为 2 的幂（上限 1024）；0 使用 16。
    pub fn new(shard_count: usize) -> Self {
        let count = if shard_count == 0 {
            FALLBACK_SHARDS
        } else {
            shard_count.min(MAX_SHARDS).next_power_of_two()
        };
        let shards = (0..count).map(|_| RttCacheShard::default()).collect();
        Self {
            shards,
            mask: (count - 1) as u32,
            cleanup_cursor: AtomicUsize::new(0),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// 内联 FNV-1a，不产生任何分配。
    pub fn shard_index(&self, ip: &str) -> usize {
        let mut hash = FNV_OFFSET_32;
        for byte in ip.as_bytes() {
            hash ^= u32::from(*byte);
            hash = hash.wrapping_mul(FNV_PRIME_32);
        }
        (hash & self.mask) as usize
    }

    fn shard(&self, ip: &str) -> &RttCacheShard {
        &self.shards[self.shard_index(ip)]
    }

    pub fn get(&self, ip: &str) -> Option<RttCacheEntry> {
        let guard = self.shard(ip).entries.read().ok()?;
        guard.get(ip).copied()
    }

    pub fn set(&self, ip: &str, entry: RttCacheEntry) {
        if let Ok(mut guard) = self.shard(ip).entries.write() {
            guard.insert(ip.to_string(), entry);
        }
    }

    pub fn delete(&self, ip: &str) {
        if let Ok(mut guard) = self.shard(ip).entries.write() {
            guard.remove(ip);
        }
    }

    pub fn cleanup_expired(&self) -> usize {
        self.cleanup_expired_at(current_epoch_ms())
    }

    /// 逐个分片清理硬过期条目，返回删除数量。
    pub fn cleanup_expired_at(&self, now_ms: i64) -> usize {
        self.shards
            .iter()
            .map(|shard| Self::cleanup_shard(shard, now_ms))
            .sum()
    }

    /// 增量清理：从内部游标开始最多处理 `max_shards` 个分片，多次调用后覆盖全部分片。
    pub fn cleanup_expired_partial(&self, max_shards: usize, now_ms: i64) -> usize {
        let total = self.shards.len();
        let budget = max_shards.clamp(1, total);
        let start = self.cleanup_cursor.fetch_add(budget, Ordering::Relaxed);
        (0..budget)
            .map(|offset| &self.shards[start.wrapping_add(offset) % total])
            .map(|shard| Self::cleanup_shard(shard, now_ms))
            .sum()
    }

    fn cleanup_shard(shard: &RttCacheShard, now_ms: i64) -> usize {
        match shard.entries.write() {
            Ok(mut guard) => {
                let before = guard.len();
                guard.retain(|_, entry| !entry.is_expired(now_ms));
                before - guard.len()
            }
            Err(_) => 0,
        }
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.entries.read().map(|guard| guard.len()).unwrap_or(0))
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        for shard in &self.shards {
            if let Ok(mut guard) = shard.entries.write() {
                guard.clear();
            }
        }
    }

    /// 所有条目的快照，逐分片加读锁复制。
    pub fn all_entries(&self) -> HashMap<String, RttCacheEntry> {
        let mut snapshot = HashMap::with_capacity(self.len());
        for shard in &self.shards {
            if let Ok(guard) = shard.entries.read() {
                snapshot.extend(guard.iter().map(|(ip, entry)| (ip.clone(), *entry)));
            }
        }
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread};

    fn entry(rtt: i64, stale_at: i64, expires_at: i64) -> RttCacheEntry {
        RttCacheEntry::new(rtt, 0.0, ProbeMethod::Tls, stale_at, expires_at)
    }

    #[test]
    fn shard_count_rounds_up_to_power_of_two() {
        assert_eq!(ShardedRttCache::new(0).shard_count(), 16);
        assert_eq!(ShardedRttCache::new(1).shard_count(), 1);
        assert_eq!(ShardedRttCache::new(20).shard_count(), 32);
        assert_eq!(ShardedRttCache::new(32).shard_count(), 32);
        assert_eq!(ShardedRttCache::new(5000).shard_count(), 1024);
    }

    #[test]
    fn shard_index_is_stable_and_in_range() {
        let cache = ShardedRttCache::new(32);
        for i in 0..=255u8 {
            let ip = format!("10.0.0.{i}");
            let idx = cache.shard_index(&ip);
            assert!(idx < 32);
            assert_eq!(idx, cache.shard_index(&ip));
        }
    }

    #[test]
    fn shard_index_matches_reference_fnv1a() {
        // FNV-1a("a") = 0xe40c292c
        let cache = ShardedRttCache::new(1024);
        assert_eq!(cache.shard_index("a"), (0xe40c_292c_u32 & 1023) as usize);
    }

    #[test]
    fn entry_constructor_keeps_stale_before_expiry() {
        let e = entry(10, 500, 100);
        assert_eq!(e.stale_at_epoch_ms, 100);
        assert!(e.stale_at_epoch_ms <= e.expires_at_epoch_ms);
    }

    #[test]
    fn set_get_delete_roundtrip() {
        let cache = ShardedRttCache::new(16);
        cache.set("1.1.1.1", entry(12, 1_000, 2_000));
        let got = cache.get("1.1.1.1").expect("entry present");
        assert_eq!(got.rtt_ms, 12);
        assert_eq!(cache.len(), 1);
        cache.delete("1.1.1.1");
        assert!(cache.get("1.1.1.1").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn cleanup_removes_only_expired_entries() {
        let cache = ShardedRttCache::new(32);
        for i in 0..100 {
            cache.set(&format!("192.168.1.{i}"), entry(10, 0, 1_000));
        }
        for i in 0..50 {
            cache.set(&format!("10.0.0.{i}"), entry(20, 5_000, 10_000));
        }
        assert_eq!(cache.len(), 150);
        assert_eq!(cache.cleanup_expired_at(2_000), 100);
        assert_eq!(cache.len(), 50);
        assert_eq!(cache.cleanup_expired_at(2_000), 0);
    }

    #[test]
    fn partial_cleanup_converges_to_full_cleanup() {
        let cache = ShardedRttCache::new(32);
        for i in 0..200 {
            cache.set(&format!("172.16.0.{i}"), entry(10, 0, 1_000));
        }
        let mut removed = 0;
        for _ in 0..8 {
            removed += cache.cleanup_expired_partial(4, 5_000);
        }
        assert_eq!(removed, 200);
        assert!(cache.is_empty());
    }

    #[test]
    fn all_entries_returns_copies() {
        let cache = ShardedRttCache::new(8);
        cache.set("8.8.8.8", entry(30, 1_000, 2_000));
        cache.set("9.9.9.9", entry(40, 1_000, 2_000));
        let mut snapshot = cache.all_entries();
        assert_eq!(snapshot.len(), 2);
        snapshot.get_mut("8.8.8.8").unwrap().rtt_ms = 1;
        assert_eq!(cache.get("8.8.8.8").unwrap().rtt_ms, 30);
        cache.clear();
        assert!(cache.all_entries().is_empty());
    }

    #[test]
    fn concurrent_writers_on_distinct_ips() {
        let cache = Arc::new(ShardedRttCache::new(16));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = cache.clone();
                thread::spawn(move || {
                    for i in 0..100 {
                        let ip = format!("10.{t}.0.{i}");
                        cache.set(&ip, entry(i, i64::MAX - 1, i64::MAX));
                        assert!(cache.get(&ip).is_some());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.len(), 800);
    }
}
