use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// UDP监听地址，缺省0.0.0.0:5353，避免1024以下端口权限问题。
    #[serde(default = "default_bind_udp")]
    pub bind_udp: String,
    /// TCP监听地址，缺省0.0.0.0:5353。
    #[serde(default = "default_bind_tcp")]
    pub bind_tcp: String,
    /// 上游DNS服务器列表。 / Primary upstreams, tried in RTT order.
    #[serde(default)]
    pub upstreams: Vec<UpstreamConfig>,
    /// Fallback upstreams, consulted only after every primary failed.
    #[serde(default)]
    pub fallbacks: Vec<UpstreamConfig>,
    /// Rule lists for the filtering engine.
    #[serde(default)]
    pub filter: FilterConfig,
    /// How blocked queries are answered.
    #[serde(default)]
    pub blocking_mode: BlockingMode,
    /// TTL stamped on synthesized blocking answers and their SOA records.
    #[serde(default = "default_blocked_response_ttl_secs")]
    pub blocked_response_ttl_secs: u32,
    /// Address answered to blocked A queries when blocking_mode=custom_address.
    #[serde(default)]
    pub custom_blocking_ipv4: String,
    /// Address answered to blocked AAAA queries when blocking_mode=custom_address.
    #[serde(default)]
    pub custom_blocking_ipv6: String,
    /// Response cache capacity in entries. 0 disables caching.
    #[serde(default = "default_dns_cache_size")]
    pub dns_cache_size: u64,
    /// Serve expired cache entries and refresh them in the background.
    #[serde(default)]
    pub optimistic_cache: bool,
    /// Answer every AAAA query with an empty SOA response.
    #[serde(default)]
    pub block_ipv6: bool,
    /// Whether outgoing IPv6 connectivity is expected to work.
    #[serde(default = "default_true")]
    pub ipv6_available: bool,
    /// DNS64 prefix discovery and AAAA synthesis. Absent = disabled.
    #[serde(default)]
    pub dns64: Option<Dns64Config>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// `ip`, `ip:port` or `tcp://ip:port`.
    pub address: String,
    /// 上游超时（毫秒）。
    #[serde(default = "default_upstream_timeout_ms")]
    pub timeout_ms: u64,
    /// Identifier reported in processed events.
    #[serde(default)]
    pub id: Option<i32>,
    /// Bootstrap resolver for named upstreams. Unused by plain upstreams.
    #[serde(default)]
    pub bootstrap: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct FilterConfig {
    /// Rule list files, watched for changes and hot-reloaded.
    #[serde(default)]
    pub files: Vec<PathBuf>,
    /// Inline rules, applied in addition to the files.
    #[serde(default)]
    pub rules: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BlockingMode {
    /// REFUSED for adblock-style rules, rewritten address for hosts-style.
    #[default]
    Default,
    Refused,
    Nxdomain,
    UnspecifiedAddress,
    CustomAddress,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Dns64Config {
    /// Upstreams queried during prefix discovery.
    pub upstreams: Vec<UpstreamConfig>,
    #[serde(default = "default_dns64_max_tries")]
    pub max_tries: u32,
    /// 每次发现尝试之间的等待时间（毫秒）。
    #[serde(default = "default_dns64_wait_time_ms")]
    pub wait_time_ms: u64,
}

impl Dns64Config {
    pub fn wait_time(&self) -> Duration {
        Duration::from_millis(self.wait_time_ms)
    }
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_udp: default_bind_udp(),
            bind_tcp: default_bind_tcp(),
            upstreams: Vec::new(),
            fallbacks: Vec::new(),
            filter: FilterConfig::default(),
            blocking_mode: BlockingMode::default(),
            blocked_response_ttl_secs: default_blocked_response_ttl_secs(),
            custom_blocking_ipv4: String::new(),
            custom_blocking_ipv6: String::new(),
            dns_cache_size: default_dns_cache_size(),
            optimistic_cache: false,
            block_ipv6: false,
            ipv6_available: true,
            dns64: None,
        }
    }
}

pub fn load_config(path: &Path) -> Result<ProxyConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config file: {}", path.display()))?;
    let cfg: ProxyConfig = serde_json::from_str(&raw)
        .with_context(|| format!("parse config file: {}", path.display()))?;

    if cfg.upstreams.is_empty() && cfg.fallbacks.is_empty() {
        anyhow::bail!("no upstreams configured");
    }

    // 轻量校验：监听地址提前解析，便于尽早报错。
    let _: std::net::SocketAddr = cfg.bind_udp.parse().context("parse bind_udp")?;
    let _: std::net::SocketAddr = cfg.bind_tcp.parse().context("parse bind_tcp")?;

    info!(
        target = "config",
        upstreams = cfg.upstreams.len(),
        fallbacks = cfg.fallbacks.len(),
        cache_size = cfg.dns_cache_size,
        "config loaded"
    );

    Ok(cfg)
}

fn default_bind_udp() -> String {
    "0.0.0.0:5353".to_string()
}

fn default_bind_tcp() -> String {
    "0.0.0.0:5353".to_string()
}

fn default_upstream_timeout_ms() -> u64 {
    5000
}

fn default_blocked_response_ttl_secs() -> u32 {
    3600
}

fn default_dns_cache_size() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

fn default_dns64_max_tries() -> u32 {
    5
}

fn default_dns64_wait_time_ms() -> u64 {
    1000
}
