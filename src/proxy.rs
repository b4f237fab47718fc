use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use anyhow::Result;
use arc_swap::ArcSwap;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{BlockingMode, ProxyConfig};
use crate::dns64::{self, Dns64State};
use crate::events::ProxyEvents;
use crate::filter::Filter;
use crate::forwarder::Forwarder;
use crate::upstream::UpstreamFactory;

/// The proxy facade: owns the forwarder and its background work.
///
/// `init` validates settings and builds every collaborator; on failure no
/// partial state survives. `deinit` must run before drop if background
/// tasks were started, and no `handle_message` call may follow it.
pub struct DnsProxy {
    forwarder: Arc<Forwarder>,
    settings: Arc<ProxyConfig>,
    filter: Arc<ArcSwap<Filter>>,
    discovery: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl DnsProxy {
    /// Build a proxy from settings.
    ///
    /// Returns the proxy and an optional non-fatal warning (unreadable
    /// rule lists, empty custom blocking addresses). Hard errors: invalid
    /// custom blocking addresses, or no usable upstream at all.
    pub fn init(settings: ProxyConfig, events: ProxyEvents) -> Result<(DnsProxy, Option<String>)> {
        info!(target = "proxy", "initializing");
        let mut warnings: Vec<String> = Vec::new();

        if settings.blocking_mode == BlockingMode::CustomAddress {
            if settings.custom_blocking_ipv4.is_empty() {
                let msg = "custom blocking IPv4 not set: blocking responses to A queries will be empty";
                warn!(target = "proxy", "{}", msg);
                warnings.push(msg.to_string());
            } else if settings.custom_blocking_ipv4.parse::<Ipv4Addr>().is_err() {
                anyhow::bail!(
                    "invalid custom blocking IPv4 address: {}",
                    settings.custom_blocking_ipv4
                );
            }
            if settings.custom_blocking_ipv6.is_empty() {
                let msg = "custom blocking IPv6 not set: blocking responses to AAAA queries will be empty";
                warn!(target = "proxy", "{}", msg);
                warnings.push(msg.to_string());
            } else if settings.custom_blocking_ipv6.parse::<Ipv6Addr>().is_err() {
                anyhow::bail!(
                    "invalid custom blocking IPv6 address: {}",
                    settings.custom_blocking_ipv6
                );
            }
        }

        let factory = UpstreamFactory {
            ipv6_available: settings.ipv6_available,
        };
        let upstreams = factory.create_all(&settings.upstreams);
        let fallbacks = factory.create_all(&settings.fallbacks);
        if upstreams.is_empty() && fallbacks.is_empty() {
            anyhow::bail!("failed to initialize any upstream");
        }

        let (filter, filter_warning) = Filter::new(&settings.filter);
        if let Some(warning) = filter_warning {
            warn!(target = "proxy", warning = %warning, "filter initialized with warnings");
            warnings.push(warning);
        }
        let filter = Arc::new(ArcSwap::from_pointee(filter));

        let dns64_state = Arc::new(Dns64State::default());
        let discovery = settings.dns64.clone().map(|cfg| {
            info!(target = "proxy", "DNS64 discovery is enabled");
            dns64::spawn_discovery(cfg, settings.ipv6_available, dns64_state.clone())
        });

        let settings = Arc::new(settings);
        let forwarder = Arc::new(Forwarder::new(
            settings.clone(),
            events,
            upstreams,
            fallbacks,
            filter.clone(),
            dns64_state,
        ));

        info!(target = "proxy", "initialized");
        let warning = if warnings.is_empty() {
            None
        } else {
            Some(warnings.join("\n"))
        };
        Ok((
            DnsProxy {
                forwarder,
                settings,
                filter,
                discovery: std::sync::Mutex::new(discovery),
            },
            warning,
        ))
    }

    pub async fn handle_message(&self, message: &[u8]) -> Vec<u8> {
        self.forwarder.handle_message(message).await
    }

    /// Cancel discovery, drain refresh tasks, release everything.
    pub async fn deinit(&self) {
        let discovery = self
            .discovery
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(discovery) = discovery {
            discovery.abort();
        }
        self.forwarder.deinit().await;
    }

    pub fn settings(&self) -> &ProxyConfig {
        &self.settings
    }

    /// The hot-swappable filter, shared with the rule-file watcher.
    pub fn filter(&self) -> Arc<ArcSwap<Filter>> {
        self.filter.clone()
    }

    pub fn version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }
}
