use std::{collections::HashMap, future::Future, sync::Arc};

use tokio::sync::{Mutex, OnceCell};

use super::model::ProbeResult;

type Slot = Arc<OnceCell<ProbeResult>>;

/// 同一 `ip:domain` 的并发探测合并为一次，所有调用方拿到同一结果。
///
/// 不同 key 之间互不阻塞；首个调用方被取消时，等待中的调用方会接手执行。
#[derive(Debug, Default)]
pub struct ProbeCoalescer {
    inflight: Mutex<HashMap<String, Slot>>,
}

impl ProbeCoalescer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(ip: &str, domain: &str) -> String {
        format!("{ip}:{domain}")
    }

    pub async fn run<F, Fut>(&self, key: String, probe: F) -> ProbeResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ProbeResult>,
    {
        let slot = {
            let mut guard = self.inflight.lock().await;
            guard.entry(key.clone()).or_default().clone()
        };
        let result = slot.get_or_init(probe).await.clone();

        let mut guard = self.inflight.lock().await;
        if guard
            .get(&key)
            .map(|current| Arc::ptr_eq(current, &slot))
            .unwrap_or(false)
        {
            guard.remove(&key);
        }
        result
    }

    pub async fn inflight_len(&self) -> usize {
        self.inflight.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ping::model::ProbeMethod;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    #[tokio::test]
    async fn concurrent_callers_share_one_probe() {
        let coalescer = Arc::new(ProbeCoalescer::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..10 {
            let coalescer = coalescer.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                coalescer
                    .run(ProbeCoalescer::key("1.1.1.1", "example.com"), || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        ProbeResult::new("1.1.1.1", 42, 0.0, ProbeMethod::Tls)
                    })
                    .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().rtt_ms, 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(coalescer.inflight_len().await, 0);
    }

    #[tokio::test]
    async fn sequential_calls_probe_again() {
        let coalescer = ProbeCoalescer::new();
        let first = coalescer
            .run("k".into(), || async { ProbeResult::new("k", 1, 0.0, ProbeMethod::Tls) })
            .await;
        let second = coalescer
            .run("k".into(), || async { ProbeResult::new("k", 2, 0.0, ProbeMethod::Tls) })
            .await;
        assert_eq!(first.rtt_ms, 1);
        assert_eq!(second.rtt_ms, 2);
    }

    #[tokio::test]
    async fn cancelled_leader_hands_over_to_waiter() {
        let coalescer = Arc::new(ProbeCoalescer::new());
        let leader = {
            let coalescer = coalescer.clone();
            tokio::spawn(async move {
                coalescer
                    .run("x:y".into(), || async {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        ProbeResult::new("x", 1, 0.0, ProbeMethod::Tls)
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let follower = {
            let coalescer = coalescer.clone();
            tokio::spawn(async move {
                coalescer
                    .run("x:y".into(), || async { ProbeResult::new("x", 7, 0.0, ProbeMethod::Tls) })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        leader.abort();
        let result = tokio::time::timeout(Duration::from_secs(5), follower)
            .await
            .expect("follower finished")
            .unwrap();
        assert_eq!(result.rtt_ms, 7);
    }
}
