//! sievedns - a filtering, caching DNS forwarding proxy.
//!
//! The library exposes the proxy core so that listeners, tests and benches
//! can drive it with raw DNS wire messages.

pub mod cache;
pub mod config;
pub mod dns64;
pub mod events;
pub mod filter;
pub mod forwarder;
pub mod proxy;
pub mod responses;
pub mod upstream;
pub mod watcher;

pub use config::{load_config, BlockingMode, ProxyConfig};
pub use events::{ProcessedEvent, ProxyEvents};
pub use proxy::DnsProxy;
