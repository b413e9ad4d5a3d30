use std::{
    net::{IpAddr, SocketAddr},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use futures::future::{BoxFuture, FutureExt};
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, Error as TlsError, ServerName};
use tokio::{
    net::{TcpStream, UdpSocket},
    time::timeout,
};
use tokio_rustls::TlsConnector;

use super::{
    config::{PingConfig, ProbePorts},
    model::ProbeMethod,
};

/// 固定的 DNS 查询：www.google.com A/IN，事务 ID 为 0。
pub const DNS_PROBE_QUERY: [u8; 32] = [
    0x00, 0x00, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x03, b'w', b'w',
    b'w', 0x06, b'g', b'o', b'o', b'g', b'l', b'e', 0x03, b'c', b'o', b'm', 0x00, 0x00, 0x01,
    0x00, 0x01,
];

const DNS_HEADER_LEN: usize = 12;
const UDP_BUFFER_LEN: usize = 512;
const UDP_POOL_CAPACITY: usize = 64;

/// 一次成功探测的原始耗时与所用阶段。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSample {
    pub rtt_ms: i64,
    pub method: ProbeMethod,
}

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("invalid ip address: {0}")]
    InvalidIp(String),
    #[error("{stage} timed out")]
    Timeout { stage: &'static str },
    #[error("{stage} connect failed: {source}")]
    Connect {
        stage: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("tls handshake failed: {0}")]
    TlsHandshake(#[source] std::io::Error),
    #[error("udp exchange failed: {0}")]
    Udp(#[source] std::io::Error),
    #[error("unexpected dns reply: {0}")]
    BadReply(&'static str),
    #[error("all probe stages failed")]
    AllStagesFailed,
}

/// 可替换的探测函数，参数为 `(ip, domain)`；测试中可注入模拟实现。
pub type ProberFn =
    Arc<dyn Fn(String, String) -> BoxFuture<'static, Result<ProbeSample, ProbeError>> + Send + Sync>;

/// 基于真实网络的默认探测实现。
pub fn default_prober(cfg: &PingConfig) -> ProberFn {
    let prober = Arc::new(ProtocolProber::from_config(cfg));
    Arc::new(move |ip: String, domain: String| {
        let prober = prober.clone();
        async move { prober.probe(&ip, &domain).await }.boxed()
    })
}

/// 只测速度，不校验证书链与域名。
pub struct InsecureCertVerifier;

impl ServerCertVerifier for InsecureCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> Result<ServerCertVerified, TlsError> {
        Ok(ServerCertVerified::assertion())
    }
}

fn insecure_client_config() -> ClientConfig {
    ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(InsecureCertVerifier))
        .with_no_client_auth()
}

/// UDP 读缓冲池，归还时清零。
#[derive(Debug, Default)]
pub struct UdpBufferPool {
    buffers: Mutex<Vec<Box<[u8; UDP_BUFFER_LEN]>>>,
}

impl UdpBufferPool {
    pub fn acquire(&self) -> Box<[u8; UDP_BUFFER_LEN]> {
        self.buffers
            .lock()
            .ok()
            .and_then(|mut pool| pool.pop())
            .unwrap_or_else(|| Box::new([0u8; UDP_BUFFER_LEN]))
    }

    pub fn release(&self, mut buf: Box<[u8; UDP_BUFFER_LEN]>) {
        buf.fill(0);
        if let Ok(mut pool) = self.buffers.lock() {
            if pool.len() < UDP_POOL_CAPACITY {
                pool.push(buf);
            }
        }
    }

    pub fn pooled(&self) -> usize {
        self.buffers.lock().map(|pool| pool.len()).unwrap_or(0)
    }
}

/// 分层探测：TCP 建连 → TLS 握手（带 SNI）→ UDP DNS → 可选的 TCP 80。
pub struct ProtocolProber {
    ports: ProbePorts,
    timeout: Duration,
    enable_http_fallback: bool,
    connector: TlsConnector,
    buffers: UdpBufferPool,
}

impl ProtocolProber {
    pub fn new(ports: ProbePorts, timeout: Duration, enable_http_fallback: bool) -> Self {
        Self {
            ports,
            timeout,
            enable_http_fallback,
            connector: TlsConnector::from(Arc::new(insecure_client_config())),
            buffers: UdpBufferPool::default(),
        }
    }

    pub fn from_config(cfg: &PingConfig) -> Self {
        Self::new(cfg.ports, cfg.probe_timeout(), cfg.enable_http_fallback)
    }

    pub fn buffer_pool(&self) -> &UdpBufferPool {
        &self.buffers
    }

    pub async fn probe(&self, ip: &str, domain: &str) -> Result<ProbeSample, ProbeError> {
        let addr: IpAddr = ip
            .trim()
            .parse()
            .map_err(|_| ProbeError::InvalidIp(ip.to_string()))?;

        match self.tcp_connect(addr, self.ports.tls, "tcp443").await {
            Ok((stream, start)) => {
                // TCP 通但 TLS 不通的节点直接判定失败，不再尝试后续阶段
                self.tls_handshake(stream, addr, domain).await?;
                return Ok(ProbeSample {
                    rtt_ms: elapsed_ms(start),
                    method: ProbeMethod::Tls,
                });
            }
            Err(err) => {
                tracing::debug!(target = "ping", ip = %addr, error = %err, "tcp stage failed");
            }
        }

        match self.udp_dns(addr).await {
            Ok(rtt_ms) => {
                return Ok(ProbeSample {
                    rtt_ms,
                    method: ProbeMethod::Udp53,
                })
            }
            Err(err) => {
                tracing::debug!(target = "ping", ip = %addr, error = %err, "udp stage failed");
            }
        }

        if self.enable_http_fallback {
            match self.tcp_connect(addr, self.ports.http, "tcp80").await {
                Ok((stream, start)) => {
                    let rtt_ms = elapsed_ms(start);
                    drop(stream);
                    return Ok(ProbeSample {
                        rtt_ms,
                        method: ProbeMethod::Tcp80,
                    });
                }
                Err(err) => {
                    tracing::debug!(target = "ping", ip = %addr, error = %err, "http stage failed");
                }
            }
        }

        Err(ProbeError::AllStagesFailed)
    }

    async fn tcp_connect(
        &self,
        ip: IpAddr,
        port: u16,
        stage: &'static str,
    ) -> Result<(TcpStream, Instant), ProbeError> {
        let start = Instant::now();
        let stream = timeout(self.timeout, TcpStream::connect(SocketAddr::new(ip, port)))
            .await
            .map_err(|_| ProbeError::Timeout { stage })?
            .map_err(|source| ProbeError::Connect { stage, source })?;
        Ok((stream, start))
    }

    async fn tls_handshake(&self, stream: TcpStream, ip: IpAddr, domain: &str) -> Result<(), ProbeError> {
        let server_name = sni_for(domain, ip);
        let tls = timeout(self.timeout, self.connector.connect(server_name, stream))
            .await
            .map_err(|_| ProbeError::Timeout { stage: "tls" })?
            .map_err(ProbeError::TlsHandshake)?;
        drop(tls);
        Ok(())
    }

    async fn udp_dns(&self, ip: IpAddr) -> Result<i64, ProbeError> {
        let bind: SocketAddr = if ip.is_ipv6() {
            SocketAddr::from(([0u16; 8], 0))
        } else {
            SocketAddr::from(([0u8; 4], 0))
        };
        let socket = UdpSocket::bind(bind).await.map_err(ProbeError::Udp)?;
        socket
            .connect(SocketAddr::new(ip, self.ports.udp))
            .await
            .map_err(ProbeError::Udp)?;

        let mut buf = self.buffers.acquire();
        let outcome = self.udp_exchange(&socket, &mut buf[..]).await;
        self.buffers.release(buf);
        outcome
    }

    async fn udp_exchange(&self, socket: &UdpSocket, buf: &mut [u8]) -> Result<i64, ProbeError> {
        let start = Instant::now();
        let exchange = async {
            socket.send(&DNS_PROBE_QUERY).await?;
            let read = socket.recv(buf).await?;
            Ok::<usize, std::io::Error>(read)
        };
        let read = timeout(self.timeout, exchange)
            .await
            .map_err(|_| ProbeError::Timeout { stage: "udp53" })?
            .map_err(ProbeError::Udp)?;
        validate_dns_reply(&buf[..read])?;
        Ok(elapsed_ms(start))
    }
}

/// 域名不是合法 DNS 名（或为空）时退回使用 IP 作为 SNI。
fn sni_for(domain: &str, ip: IpAddr) -> ServerName {
    let domain = domain.trim().trim_end_matches('.');
    if domain.is_empty() {
        return ServerName::IpAddress(ip);
    }
    ServerName::try_from(domain).unwrap_or(ServerName::IpAddress(ip))
}

fn validate_dns_reply(reply: &[u8]) -> Result<(), ProbeError> {
    if reply.len() < DNS_HEADER_LEN {
        return Err(ProbeError::BadReply("shorter than dns header"));
    }
    if reply[..2] != DNS_PROBE_QUERY[..2] {
        return Err(ProbeError::BadReply("transaction id mismatch"));
    }
    Ok(())
}

fn elapsed_ms(start: Instant) -> i64 {
    start.elapsed().as_millis().min(i64::MAX as u128) as i64
}
