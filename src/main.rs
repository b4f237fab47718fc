use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sievedns::config::load_config;
use sievedns::proxy::DnsProxy;
use sievedns::watcher;
use sievedns::ProxyEvents;

#[derive(Parser, Debug)]
#[command(author, version, about = "sievedns filtering DNS forwarding proxy", long_about = None)]
struct Args {
    /// 配置文件路径（JSON）
    #[arg(short = 'c', long = "config", default_value = "config/sievedns.json")]
    config: PathBuf,
    /// 启用调试日志
    #[arg(long = "debug", default_value_t = false)]
    debug: bool,
    /// UDP worker 数量（默认 CPU 核心数）
    #[arg(long = "udp-workers", default_value_t = 0)]
    udp_workers: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    let cfg = load_config(&args.config).context("load config")?;
    let bind_udp: SocketAddr = cfg.bind_udp.parse().context("parse bind addr")?;
    let bind_tcp: SocketAddr = cfg.bind_tcp.parse().context("parse tcp bind addr")?;
    let filter_cfg = cfg.filter.clone();

    let (proxy, warning) = DnsProxy::init(cfg, ProxyEvents::default()).context("init proxy")?;
    if let Some(warning) = warning {
        warn!(warning = %warning, "proxy initialized with warnings");
    }
    let proxy = Arc::new(proxy);

    watcher::spawn(filter_cfg, proxy.filter());

    // UDP worker 数量：默认为 CPU 核心数，最少 1 个
    let udp_workers = if args.udp_workers > 0 {
        args.udp_workers
    } else {
        num_cpus::get()
    };

    info!(
        bind_udp = %bind_udp,
        bind_tcp = %bind_tcp,
        udp_workers = udp_workers,
        version = DnsProxy::version(),
        "dns proxy started"
    );

    let mut udp_handles = Vec::with_capacity(udp_workers);

    #[cfg(unix)]
    {
        // On Unix create individual sockets with SO_REUSEPORT so kernel distributes packets
        for worker_id in 0..udp_workers {
            let proxy = proxy.clone();
            let std_socket = create_reuseport_udp_socket(bind_udp)
                .with_context(|| format!("create udp socket for worker {}", worker_id))?;
            let socket = UdpSocket::from_std(std_socket)?;
            let handle = tokio::spawn(async move {
                run_udp_worker(worker_id, Arc::new(socket), proxy).await;
            });
            udp_handles.push(handle);
        }
    }

    #[cfg(not(unix))]
    {
        // Non-Unix: a single shared socket, workers take turns receiving.
        use socket2::{Domain, Protocol, Socket, Type};
        let domain = if bind_udp.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket =
            Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("create socket")?;
        let _ = socket.set_recv_buffer_size(4 * 1024 * 1024);
        let _ = socket.set_send_buffer_size(4 * 1024 * 1024);
        socket.set_nonblocking(true).context("set nonblocking")?;
        socket.bind(&bind_udp.into()).context("bind socket")?;

        let udp_socket = Arc::new(UdpSocket::from_std(socket.into()).context("from_std")?);
        for worker_id in 0..udp_workers {
            let proxy = proxy.clone();
            let socket = Arc::clone(&udp_socket);
            let handle = tokio::spawn(async move {
                run_udp_worker(worker_id, socket, proxy).await;
            });
            udp_handles.push(handle);
        }
    }

    let tcp_listener = TcpListener::bind(bind_tcp)
        .await
        .context("bind tcp listener")?;
    let tcp_proxy = proxy.clone();
    let tcp_handle = tokio::spawn(async move {
        if let Err(err) = run_tcp(tcp_listener, tcp_proxy).await {
            error!(error = %err, "tcp server exited");
        }
    });

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("shutting down");

    tcp_handle.abort();
    for handle in &udp_handles {
        handle.abort();
    }
    proxy.deinit().await;

    Ok(())
}

fn init_tracing(debug: bool) {
    let fmt_layer = fmt::layer().with_target(false).with_ansi(false);

    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

// 在 Unix 上创建带 SO_REUSEPORT 的 UDP socket；非 Unix 使用标准绑定
#[cfg(unix)]
fn create_reuseport_udp_socket(addr: SocketAddr) -> anyhow::Result<std::net::UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};
    use std::os::unix::io::AsRawFd;
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    // Try to set SO_REUSEPORT via libc to avoid depending on socket2 method availability
    #[allow(unused_imports)]
    use libc::{c_int, c_void, setsockopt, socklen_t, SOL_SOCKET, SO_REUSEPORT};
    let val: c_int = 1;
    let fd = socket.as_raw_fd();
    let ret = unsafe {
        setsockopt(
            fd,
            SOL_SOCKET,
            SO_REUSEPORT,
            &val as *const _ as *const c_void,
            std::mem::size_of_val(&val) as socklen_t,
        )
    };
    if ret != 0 {
        // non-fatal: continue without reuseport
    }
    let _ = socket.set_recv_buffer_size(4 * 1024 * 1024);
    let _ = socket.set_send_buffer_size(4 * 1024 * 1024);
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// UDP worker：请求在独立任务中处理，接收循环不被上游 I/O 阻塞。
/// Each request runs in its own task so upstream I/O never stalls receive.
async fn run_udp_worker(_worker_id: usize, socket: Arc<UdpSocket>, proxy: Arc<DnsProxy>) {
    use bytes::BytesMut;
    let mut buf = BytesMut::with_capacity(4096);

    loop {
        buf.resize(4096, 0);
        match socket.recv_from(&mut buf).await {
            Ok((len, peer)) => {
                buf.truncate(len);
                let packet = buf.split().freeze();
                let proxy = proxy.clone();
                let socket = Arc::clone(&socket);
                tokio::spawn(async move {
                    let response = proxy.handle_message(&packet).await;
                    // Empty response means the request was unparseable.
                    if !response.is_empty() {
                        let _ = socket.send_to(&response, peer).await;
                    }
                });
            }
            Err(err) => {
                warn!(error = %err, "udp recv failed");
                buf.clear();
            }
        }
    }
}

async fn run_tcp(listener: TcpListener, proxy: Arc<DnsProxy>) -> anyhow::Result<()> {
    loop {
        let (stream, _peer) = listener.accept().await?;
        let proxy = proxy.clone();
        tokio::spawn(async move {
            let _ = handle_tcp_conn(stream, proxy).await;
        });
    }
}

async fn handle_tcp_conn(mut stream: TcpStream, proxy: Arc<DnsProxy>) -> anyhow::Result<()> {
    const MAX_TCP_FRAME: usize = 64 * 1024;
    let mut len_buf = [0u8; 2];

    loop {
        if let Err(err) = stream.read_exact(&mut len_buf).await {
            if err.kind() != std::io::ErrorKind::UnexpectedEof {
                return Err(err.into());
            }
            return Ok(());
        }
        let frame_len = u16::from_be_bytes(len_buf) as usize;
        if frame_len == 0 || frame_len > MAX_TCP_FRAME {
            return Ok(());
        }

        let mut buf = vec![0u8; frame_len];
        if stream.read_exact(&mut buf).await.is_err() {
            return Ok(());
        }

        let response = proxy.handle_message(&buf).await;
        if response.is_empty() {
            return Ok(());
        }

        if response.len() <= u16::MAX as usize {
            let len_bytes = (response.len() as u16).to_be_bytes();
            if stream.write_all(&len_bytes).await.is_err() {
                return Ok(());
            }
            if stream.write_all(&response).await.is_err() {
                return Ok(());
            }
        }
    }
}
