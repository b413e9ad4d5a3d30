#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use futures::FutureExt;
use smartdns_sort_lib::core::ping::{
    PingConfig, Pinger, ProbeError, ProbeMethod, ProbeSample, ProberFn,
};
use tokio::{
    io::AsyncReadExt,
    net::{TcpListener, UdpSocket},
};
use tokio_rustls::TlsAcceptor;

/// 测试用配置：单次探测、关闭缓存，按需覆盖。
pub fn quick_config() -> PingConfig {
    PingConfig {
        count: 1,
        timeout_ms: 300,
        concurrency: 8,
        rtt_cache_ttl_seconds: 0,
        ..PingConfig::default()
    }
}

pub fn ips(list: &[&str]) -> Vec<String> {
    list.iter().map(|ip| ip.to_string()).collect()
}

pub fn pinger_with(cfg: PingConfig, base: &Path, prober: &MockProber) -> Pinger {
    Pinger::with_prober(cfg, base, prober.as_fn()).expect("build pinger")
}

#[derive(Debug, Default)]
struct Behavior {
    default: Option<ProbeSample>,
    script: VecDeque<Option<ProbeSample>>,
    delay: Duration,
}

#[derive(Debug, Default)]
struct MockState {
    behaviors: HashMap<String, Behavior>,
    calls: HashMap<String, usize>,
}

/// 可编排的探测桩：按 IP 返回预设结果，并统计调用次数与并发峰值。
#[derive(Debug, Clone, Default)]
pub struct MockProber {
    state: Arc<Mutex<MockState>>,
    total_calls: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
}

impl MockProber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reachable(&self, ip: &str, rtt_ms: i64, method: ProbeMethod) -> &Self {
        self.with_behavior(ip, |b| b.default = Some(ProbeSample { rtt_ms, method }));
        self
    }

    pub fn unreachable(&self, ip: &str) -> &Self {
        self.with_behavior(ip, |b| b.default = None);
        self
    }

    /// 依次消费的一次性结果，`None` 表示该次尝试失败；耗尽后回到默认行为。
    pub fn script(&self, ip: &str, outcomes: &[Option<i64>]) -> &Self {
        self.with_behavior(ip, |b| {
            b.script.extend(outcomes.iter().map(|o| {
                o.map(|rtt_ms| ProbeSample {
                    rtt_ms,
                    method: ProbeMethod::Tls,
                })
            }))
        });
        self
    }

    pub fn delay(&self, ip: &str, delay: Duration) -> &Self {
        self.with_behavior(ip, |b| b.delay = delay);
        self
    }

    fn with_behavior<F: FnOnce(&mut Behavior)>(&self, ip: &str, apply: F) {
        let mut state = self.state.lock().unwrap();
        apply(state.behaviors.entry(ip.to_string()).or_default());
    }

    pub fn calls(&self) -> usize {
        self.total_calls.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, ip: &str) -> usize {
        self.state.lock().unwrap().calls.get(ip).copied().unwrap_or(0)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn as_fn(&self) -> ProberFn {
        let mock = self.clone();
        Arc::new(move |ip: String, _domain: String| {
            let mock = mock.clone();
            async move { mock.probe(&ip).await }.boxed()
        })
    }

    async fn probe(&self, ip: &str) -> Result<ProbeSample, ProbeError> {
        self.total_calls.fetch_add(1, Ordering::SeqCst);
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);

        let (outcome, delay) = {
            let mut state = self.state.lock().unwrap();
            *state.calls.entry(ip.to_string()).or_insert(0) += 1;
            match state.behaviors.get_mut(ip) {
                Some(b) => {
                    let outcome = b.script.pop_front().unwrap_or(b.default);
                    (outcome, b.delay)
                }
                None => (None, Duration::ZERO),
            }
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
        outcome.ok_or(ProbeError::AllStagesFailed)
    }
}

/// 绑定后立即释放，得到一个大概率无人监听的本地端口。
pub async fn closed_tcp_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

pub async fn closed_udp_port() -> u16 {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = socket.local_addr().unwrap().port();
    drop(socket);
    port
}

/// 接受连接后立即关闭：TCP 可达但 TLS 握手必然失败。
pub async fn spawn_plain_tcp_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            drop(stream);
        }
    });
    port
}

/// 原样回显收到的报文，模拟一个会应答的 DNS 端口。
pub async fn spawn_udp_echo() -> u16 {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = socket.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut buf = [0u8; 512];
        while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..n], peer).await;
        }
    });
    port
}

/// 使用自签名证书的本地 TLS 服务。
pub async fn spawn_tls_server() -> u16 {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_der = cert.serialize_der().unwrap();
    let key_der = cert.serialize_private_key_der();
    let config = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(vec![rustls::Certificate(cert_der)], rustls::PrivateKey(key_der))
        .unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                if let Ok(mut tls) = acceptor.accept(stream).await {
                    let mut sink = [0u8; 64];
                    let _ = tls.read(&mut sink).await;
                }
            });
        }
    });
    port
}
