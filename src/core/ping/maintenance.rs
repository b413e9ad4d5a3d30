use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use anyhow::{Context, Result};
use tokio::sync::Notify;

use super::cache::ShardedRttCache;

/// RTT 缓存后台清理器：独立线程运行，按固定间隔清除硬过期条目。
#[derive(Debug)]
pub struct CacheCleaner {
    stop_flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
    thread: Option<thread::JoinHandle<()>>,
}

impl CacheCleaner {
    pub fn spawn(cache: Arc<ShardedRttCache>, interval: Duration) -> Result<Self> {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let notify = Arc::new(Notify::new());
        let thread_flag = stop_flag.clone();
        let thread_notify = notify.clone();
        let handle = thread::Builder::new()
            .name("ping-cache-cleaner".into())
            .spawn(move || {
                match tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()
                {
                    Ok(rt) => rt.block_on(run_cleanup_loop(cache, interval, thread_flag, thread_notify)),
                    Err(err) => {
                        tracing::error!(
                            target = "ping",
                            error = %err,
                            "failed to build cache cleaner runtime"
                        );
                    }
                }
            })
            .context("spawn cache cleaner thread")?;

        tracing::info!(
            target = "ping",
            interval_secs = interval.as_secs(),
            "rtt cache cleaner started"
        );
        Ok(Self {
            stop_flag,
            notify,
            thread: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    /// 通知线程退出并等待其结束；重复调用无副作用。
    pub fn stop(&mut self) {
        let Some(handle) = self.thread.take() else {
            return;
        };
        self.stop_flag.store(true, Ordering::Relaxed);
        // notify_one 会保留许可，线程尚未进入等待时也不会丢失唤醒
        self.notify.notify_one();
        if let Err(err) = handle.join() {
            tracing::warn!(target = "ping", "failed to join cache cleaner thread: {:?}", err);
        }
    }
}

impl Drop for CacheCleaner {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_cleanup_loop(
    cache: Arc<ShardedRttCache>,
    interval: Duration,
    stop: Arc<AtomicBool>,
    notify: Arc<Notify>,
) {
    while !stop.load(Ordering::Relaxed) {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let removed = cache.cleanup_expired();
                if removed > 0 {
                    tracing::debug!(
                        target = "ping",
                        removed,
                        remaining = cache.len(),
                        "expired rtt entries removed"
                    );
                }
            }
            _ = notify.notified() => {}
        }
    }
    tracing::info!(target = "ping", "rtt cache cleaner stopped");
}
