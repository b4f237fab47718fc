use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use hickory_proto::op::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::UpstreamConfig;

const DEFAULT_PORT: u16 = 53;
const TCP_SCHEME: &str = "tcp://";
const RECV_BUF_SIZE: usize = 4096;

/// Errors from a single upstream exchange. Timeouts are terminal for the
/// upstream within a request; other errors earn one retry.
#[derive(Debug)]
pub enum ExchangeError {
    Timeout,
    Other(String),
}

impl ExchangeError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ExchangeError::Timeout)
    }
}

impl fmt::Display for ExchangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeError::Timeout => write!(f, "timed out"),
            ExchangeError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for ExchangeError {}

impl From<std::io::Error> for ExchangeError {
    fn from(err: std::io::Error) -> Self {
        ExchangeError::Other(err.to_string())
    }
}

/// One upstream resolver. Implementations are shared across requests and
/// must be internally synchronized.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Perform a full query/response exchange.
    async fn exchange(&self, request: &Message) -> Result<Message, ExchangeError>;

    /// Smoothed round-trip time used for dispatch ordering.
    fn rtt(&self) -> Duration;

    /// Feed one observed exchange duration into the moving average.
    fn adjust_rtt(&self, sample: Duration);

    fn options(&self) -> &UpstreamConfig;
}

/// Plain DNS upstream: UDP with a TCP retry on truncation, or TCP-only for
/// `tcp://` addresses.
pub struct PlainUpstream {
    options: UpstreamConfig,
    addr: SocketAddr,
    prefer_tcp: bool,
    /// EMA of exchange time in milliseconds. 0 = no sample yet.
    rtt_ms: AtomicU64,
}

impl PlainUpstream {
    pub fn new(cfg: &UpstreamConfig) -> anyhow::Result<Self> {
        let (prefer_tcp, raw) = match cfg.address.strip_prefix(TCP_SCHEME) {
            Some(rest) => (true, rest),
            None => (false, cfg.address.as_str()),
        };
        let addr = parse_address(raw)
            .with_context(|| format!("invalid upstream address: {}", cfg.address))?;
        Ok(Self {
            options: cfg.clone(),
            addr,
            prefer_tcp,
            rtt_ms: AtomicU64::new(0),
        })
    }

    async fn exchange_udp(&self, packet: &[u8]) -> Result<Vec<u8>, ExchangeError> {
        let local: SocketAddr = if self.addr.is_ipv4() {
            "0.0.0.0:0".parse().map_err(|_| ExchangeError::Other("bad local addr".into()))?
        } else {
            "[::]:0".parse().map_err(|_| ExchangeError::Other("bad local addr".into()))?
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(self.addr).await?;
        socket.send(packet).await?;

        let mut buf = [0u8; RECV_BUF_SIZE];
        loop {
            let len = socket.recv(&mut buf).await?;
            // The socket is connected, so any datagram with our id is the
            // response. Anything else is a stray packet; keep waiting.
            if len >= 2 && packet.len() >= 2 && buf[..2] == packet[..2] {
                return Ok(buf[..len].to_vec());
            }
        }
    }

    async fn exchange_tcp(&self, packet: &[u8]) -> Result<Vec<u8>, ExchangeError> {
        if packet.len() > u16::MAX as usize {
            return Err(ExchangeError::Other("request too large for tcp".into()));
        }
        let mut stream = TcpStream::connect(self.addr).await?;

        let mut framed = Vec::with_capacity(2 + packet.len());
        framed.extend_from_slice(&(packet.len() as u16).to_be_bytes());
        framed.extend_from_slice(packet);
        stream.write_all(&framed).await?;

        let mut len_buf = [0u8; 2];
        stream.read_exact(&mut len_buf).await?;
        let resp_len = u16::from_be_bytes(len_buf) as usize;
        let mut buf = vec![0u8; resp_len];
        stream.read_exact(&mut buf).await?;
        Ok(buf)
    }
}

#[async_trait]
impl Upstream for PlainUpstream {
    async fn exchange(&self, request: &Message) -> Result<Message, ExchangeError> {
        let packet = request
            .to_vec()
            .map_err(|err| ExchangeError::Other(err.to_string()))?;

        let exchange = async {
            if self.prefer_tcp {
                return parse_response(&self.exchange_tcp(&packet).await?);
            }
            let response = parse_response(&self.exchange_udp(&packet).await?)?;
            if response.truncated() {
                // 截断的UDP响应通过TCP重试。 / Truncated UDP answers retry over TCP.
                debug!(target = "upstream", address = %self.options.address, "truncated response, retrying over tcp");
                return parse_response(&self.exchange_tcp(&packet).await?);
            }
            Ok(response)
        };

        match timeout(self.options.timeout(), exchange).await {
            Ok(result) => result,
            Err(_) => Err(ExchangeError::Timeout),
        }
    }

    fn rtt(&self) -> Duration {
        Duration::from_millis(self.rtt_ms.load(Ordering::Relaxed))
    }

    fn adjust_rtt(&self, sample: Duration) {
        let sample_ms = sample.as_millis() as u64;
        let old = self.rtt_ms.load(Ordering::Relaxed);
        let next = if old == 0 { sample_ms } else { (old + sample_ms) / 2 };
        self.rtt_ms.store(next, Ordering::Relaxed);
    }

    fn options(&self) -> &UpstreamConfig {
        &self.options
    }
}

fn parse_response(raw: &[u8]) -> Result<Message, ExchangeError> {
    Message::from_vec(raw).map_err(|err| ExchangeError::Other(err.to_string()))
}

fn parse_address(raw: &str) -> anyhow::Result<SocketAddr> {
    if let Ok(addr) = raw.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let ip: IpAddr = raw
        .trim_start_matches('[')
        .trim_end_matches(']')
        .parse()
        .context("neither socket address nor ip")?;
    Ok(SocketAddr::new(ip, DEFAULT_PORT))
}

/// Builds upstreams from settings. Individual failures are logged and
/// skipped; the proxy init decides whether what remains is enough.
pub struct UpstreamFactory {
    pub ipv6_available: bool,
}

impl UpstreamFactory {
    pub fn create(&self, cfg: &UpstreamConfig) -> anyhow::Result<Arc<dyn Upstream>> {
        let upstream = PlainUpstream::new(cfg)?;
        if upstream.addr.is_ipv6() && !self.ipv6_available {
            warn!(
                target = "upstream",
                address = %cfg.address,
                "ipv6 upstream configured but ipv6 is reported unavailable"
            );
        }
        Ok(Arc::new(upstream))
    }

    pub fn create_all(&self, cfgs: &[UpstreamConfig]) -> Vec<Arc<dyn Upstream>> {
        let mut upstreams: Vec<Arc<dyn Upstream>> = Vec::with_capacity(cfgs.len());
        for cfg in cfgs {
            match self.create(cfg) {
                Ok(upstream) => {
                    info!(target = "upstream", address = %cfg.address, "upstream created");
                    upstreams.push(upstream);
                }
                Err(err) => {
                    error!(target = "upstream", address = %cfg.address, error = %err, "failed to create upstream");
                }
            }
        }
        upstreams
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{MessageType, Query, ResponseCode};
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
    use std::net::Ipv4Addr;
    use std::str::FromStr;
    use tokio::net::TcpListener;

    fn query(qname: &str) -> Message {
        let mut msg = Message::new();
        msg.set_id(0x4242);
        let mut q = Query::new();
        q.set_name(Name::from_str(qname).unwrap());
        q.set_query_type(RecordType::A);
        q.set_query_class(DNSClass::IN);
        msg.add_query(q);
        msg
    }

    fn canned_response(request: &Message, truncated: bool) -> Message {
        let mut resp = Message::new();
        resp.set_id(request.id());
        resp.set_message_type(MessageType::Response);
        resp.set_response_code(ResponseCode::NoError);
        resp.set_truncated(truncated);
        for q in request.queries() {
            resp.add_query(q.clone());
        }
        if !truncated {
            resp.add_answer(Record::from_rdata(
                request.queries()[0].name().clone(),
                300,
                RData::A(A(Ipv4Addr::new(192, 0, 2, 1))),
            ));
        }
        resp
    }

    fn upstream_for(address: &str, timeout_ms: u64) -> PlainUpstream {
        PlainUpstream::new(&UpstreamConfig {
            address: address.to_string(),
            timeout_ms,
            id: Some(1),
            bootstrap: None,
        })
        .expect("create upstream")
    }

    #[test]
    fn parse_address_accepts_bare_ip_and_scheme() {
        let plain = upstream_for("9.9.9.9", 1000);
        assert_eq!(plain.addr, "9.9.9.9:53".parse().unwrap());
        assert!(!plain.prefer_tcp);

        let tcp = upstream_for("tcp://8.8.8.8:5353", 1000);
        assert_eq!(tcp.addr, "8.8.8.8:5353".parse().unwrap());
        assert!(tcp.prefer_tcp);

        let v6 = upstream_for("[2001:db8::1]", 1000);
        assert_eq!(v6.addr, "[2001:db8::1]:53".parse().unwrap());

        assert!(PlainUpstream::new(&UpstreamConfig {
            address: "dns.example.com".to_string(),
            timeout_ms: 1000,
            id: None,
            bootstrap: None,
        })
        .is_err());
    }

    #[test]
    fn rtt_moving_average() {
        let upstream = upstream_for("9.9.9.9", 1000);
        assert_eq!(upstream.rtt(), Duration::ZERO);
        upstream.adjust_rtt(Duration::from_millis(100));
        assert_eq!(upstream.rtt(), Duration::from_millis(100));
        upstream.adjust_rtt(Duration::from_millis(50));
        assert_eq!(upstream.rtt(), Duration::from_millis(75));
    }

    #[tokio::test]
    async fn udp_exchange_round_trips() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            let (len, peer) = server.recv_from(&mut buf).await.unwrap();
            let request = Message::from_vec(&buf[..len]).unwrap();
            let resp = canned_response(&request, false).to_vec().unwrap();
            server.send_to(&resp, peer).await.unwrap();
        });

        let upstream = upstream_for(&addr.to_string(), 2000);
        let response = upstream.exchange(&query("example.com.")).await.unwrap();
        assert_eq!(response.id(), 0x4242);
        assert_eq!(response.answers().len(), 1);
    }

    #[tokio::test]
    async fn udp_exchange_times_out() {
        // Bound but silent socket.
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();

        let upstream = upstream_for(&addr.to_string(), 50);
        let err = upstream.exchange(&query("example.com.")).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn tcp_exchange_round_trips() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut len_buf = [0u8; 2];
            stream.read_exact(&mut len_buf).await.unwrap();
            let len = u16::from_be_bytes(len_buf) as usize;
            let mut buf = vec![0u8; len];
            stream.read_exact(&mut buf).await.unwrap();
            let request = Message::from_vec(&buf).unwrap();
            let resp = canned_response(&request, false).to_vec().unwrap();
            stream
                .write_all(&(resp.len() as u16).to_be_bytes())
                .await
                .unwrap();
            stream.write_all(&resp).await.unwrap();
        });

        let upstream = upstream_for(&format!("tcp://{}", addr), 2000);
        let response = upstream.exchange(&query("example.com.")).await.unwrap();
        assert_eq!(response.answers().len(), 1);
    }

    #[tokio::test]
    async fn truncated_udp_retries_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // UDP server on the same port as the TCP listener.
        let server = UdpSocket::bind(addr).await.unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            let (len, peer) = server.recv_from(&mut buf).await.unwrap();
            let request = Message::from_vec(&buf[..len]).unwrap();
            let resp = canned_response(&request, true).to_vec().unwrap();
            server.send_to(&resp, peer).await.unwrap();
        });
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut len_buf = [0u8; 2];
            stream.read_exact(&mut len_buf).await.unwrap();
            let len = u16::from_be_bytes(len_buf) as usize;
            let mut buf = vec![0u8; len];
            stream.read_exact(&mut buf).await.unwrap();
            let request = Message::from_vec(&buf).unwrap();
            let resp = canned_response(&request, false).to_vec().unwrap();
            stream
                .write_all(&(resp.len() as u16).to_be_bytes())
                .await
                .unwrap();
            stream.write_all(&resp).await.unwrap();
        });

        let upstream = upstream_for(&addr.to_string(), 2000);
        let response = upstream.exchange(&query("example.com.")).await.unwrap();
        assert!(!response.truncated());
        assert_eq!(response.answers().len(), 1);
    }
}
