use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::AAAA;
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::Dns64Config;
use crate::upstream::{ExchangeError, Upstream, UpstreamFactory};

/// The IPv4-only name used for prefix discovery (RFC 7050).
pub const IPV4_ONLY_HOST: &str = "ipv4only.arpa.";

/// Well-known addresses ipv4only.arpa resolves to.
const WELL_KNOWN_V4: [Ipv4Addr; 2] = [Ipv4Addr::new(192, 0, 0, 170), Ipv4Addr::new(192, 0, 0, 171)];

/// Accepted NAT64 prefix lengths in bytes. Bits 64..71 of a synthesized
/// address must stay zero, so there is no 8-byte variant.
const VALID_PREFIX_LENGTHS: [usize; 7] = [4, 5, 6, 7, 9, 10, 12];

/// Discovered NAT64 prefixes. Readers snapshot under a shared lock; the
/// discovery task replaces the set wholesale.
#[derive(Default)]
pub struct Dns64State {
    prefixes: RwLock<Vec<Vec<u8>>>,
}

impl Dns64State {
    pub fn snapshot(&self) -> Vec<Vec<u8>> {
        self.prefixes
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn set(&self, prefixes: Vec<Vec<u8>>) {
        *self
            .prefixes
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = prefixes;
    }
}

/// Embed an IPv4 address into a NAT64 prefix per RFC 6052.
///
/// The four octets are placed directly after the prefix, skipping octet 8
/// which must remain zero.
pub fn synthesize_ipv4_embedded_ipv6(prefix: &[u8], v4: Ipv4Addr) -> anyhow::Result<Ipv6Addr> {
    if !VALID_PREFIX_LENGTHS.contains(&prefix.len()) {
        anyhow::bail!("invalid dns64 prefix length: {}", prefix.len());
    }
    let mut out = [0u8; 16];
    out[..prefix.len()].copy_from_slice(prefix);
    let mut pos = prefix.len();
    for octet in v4.octets() {
        if pos == 8 {
            pos += 1;
        }
        out[pos] = octet;
        pos += 1;
    }
    Ok(Ipv6Addr::from(out))
}

/// Derive NAT64 prefixes from AAAA answers for ipv4only.arpa: a prefix is
/// valid when re-embedding a well-known IPv4 reproduces the observed address.
pub fn derive_prefixes(answers: &[Record]) -> Vec<Vec<u8>> {
    let mut prefixes: Vec<Vec<u8>> = Vec::new();
    for record in answers {
        let Some(RData::AAAA(aaaa)) = record.data() else {
            continue;
        };
        let octets = aaaa.0.octets();
        'lengths: for len in VALID_PREFIX_LENGTHS {
            let prefix = &octets[..len];
            for wka in WELL_KNOWN_V4 {
                if synthesize_ipv4_embedded_ipv6(prefix, wka)
                    .map(|addr| addr == aaaa.0)
                    .unwrap_or(false)
                {
                    if !prefixes.iter().any(|p| p.as_slice() == prefix) {
                        prefixes.push(prefix.to_vec());
                    }
                    break 'lengths;
                }
            }
        }
    }
    prefixes
}

/// Query one discovery upstream for NAT64 prefixes.
pub async fn discover_prefixes(
    upstream: &Arc<dyn Upstream>,
) -> Result<Vec<Vec<u8>>, ExchangeError> {
    let name = Name::from_str(IPV4_ONLY_HOST)
        .map_err(|err| ExchangeError::Other(err.to_string()))?;
    let mut request = Message::new();
    request.set_id(rand::random());
    request.set_recursion_desired(true);
    let mut query = Query::new();
    query.set_name(name);
    query.set_query_type(RecordType::AAAA);
    query.set_query_class(DNSClass::IN);
    request.add_query(query);

    let response = upstream.exchange(&request).await?;
    Ok(derive_prefixes(response.answers()))
}

/// Background prefix discovery: up to `max_tries` rounds over the
/// configured upstreams, stopping at the first non-empty result.
pub fn spawn_discovery(
    cfg: Dns64Config,
    ipv6_available: bool,
    state: Arc<Dns64State>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let factory = UpstreamFactory { ipv6_available };
        for _ in 0..cfg.max_tries {
            tokio::time::sleep(cfg.wait_time()).await;
            for upstream_cfg in &cfg.upstreams {
                let upstream = match factory.create(upstream_cfg) {
                    Ok(upstream) => upstream,
                    Err(err) => {
                        debug!(target = "dns64", error = %err, "failed to create discovery upstream");
                        continue;
                    }
                };
                match discover_prefixes(&upstream).await {
                    Ok(prefixes) if !prefixes.is_empty() => {
                        info!(target = "dns64", count = prefixes.len(), "prefixes discovered");
                        state.set(prefixes);
                        return;
                    }
                    Ok(_) => {
                        debug!(target = "dns64", "no prefixes discovered, retrying");
                    }
                    Err(err) => {
                        debug!(target = "dns64", error = %err, "error discovering prefixes");
                    }
                }
            }
        }
        debug!(target = "dns64", "failed to discover any prefixes");
    })
}

/// Attempt AAAA synthesis for a client AAAA request whose upstream answer
/// contained no AAAA records.
///
/// Issues an A query with copied RD/CD through the same upstream, then
/// embeds every A answer into each known prefix. Returns `None` when no
/// AAAA could be produced, leaving the original response untouched.
pub async fn synthesize_aaaa(
    request: &Message,
    upstream: &Arc<dyn Upstream>,
    state: &Dns64State,
) -> Option<Message> {
    let prefixes = state.snapshot();
    if prefixes.is_empty() {
        return None;
    }

    let question = request.queries().first()?;

    let mut request_a = Message::new();
    request_a.set_id(rand::random());
    request_a.set_recursion_desired(request.recursion_desired());
    request_a.set_checking_disabled(request.checking_disabled());
    let mut query = Query::new();
    query.set_name(question.name().clone());
    query.set_query_type(RecordType::A);
    query.set_query_class(DNSClass::IN);
    request_a.add_query(query);

    let response_a = match upstream.exchange(&request_a).await {
        Ok(response) => response,
        Err(err) => {
            debug!(target = "dns64", error = %err, "auxiliary A query failed");
            return None;
        }
    };
    if response_a.answers().is_empty() {
        debug!(target = "dns64", "upstream returned no A records");
        return None;
    }

    let mut records = Vec::new();
    let mut aaaa_count = 0usize;
    for rr in response_a.answers() {
        match rr.data() {
            Some(RData::A(a)) => {
                for prefix in &prefixes {
                    match synthesize_ipv4_embedded_ipv6(prefix, a.0) {
                        Ok(v6) => {
                            records.push(Record::from_rdata(
                                rr.name().clone(),
                                rr.ttl(),
                                RData::AAAA(AAAA(v6)),
                            ));
                            aaaa_count += 1;
                        }
                        Err(err) => {
                            debug!(target = "dns64", error = %err, "could not synthesize address");
                        }
                    }
                }
            }
            _ => records.push(rr.clone()),
        }
    }

    debug!(target = "dns64", synthesized = aaaa_count, "synthesized AAAA records");
    if aaaa_count == 0 {
        return None;
    }

    let mut response = Message::new();
    response.set_id(request.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(OpCode::Query);
    response.set_response_code(ResponseCode::NoError);
    response.set_recursion_desired(request.recursion_desired());
    response.set_recursion_available(response_a.recursion_available());
    response.set_checking_disabled(response_a.checking_disabled());
    for query in request.queries() {
        response.add_query(query.clone());
    }
    for record in records {
        response.add_answer(record);
    }
    Some(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpstreamConfig;
    use async_trait::async_trait;
    use hickory_proto::rr::rdata::A;
    use std::time::Duration;

    const NAT64_PREFIX: [u8; 12] = [0x00, 0x64, 0xff, 0x9b, 0, 0, 0, 0, 0, 0, 0, 0];

    #[test]
    fn embeds_into_96_bit_prefix() {
        let addr =
            synthesize_ipv4_embedded_ipv6(&NAT64_PREFIX, Ipv4Addr::new(192, 0, 0, 170)).unwrap();
        assert_eq!(addr, "64:ff9b::c000:aa".parse::<Ipv6Addr>().unwrap());
    }

    #[test]
    fn embeds_into_64_bit_prefix_skipping_u_octet() {
        // 9-byte prefix: the IPv4 lands in octets 9..13.
        let prefix = [0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0];
        let addr = synthesize_ipv4_embedded_ipv6(&prefix, Ipv4Addr::new(1, 2, 3, 4)).unwrap();
        assert_eq!(addr.octets()[8], 0);
        assert_eq!(&addr.octets()[9..13], &[1, 2, 3, 4]);
    }

    #[test]
    fn embeds_into_40_bit_prefix_across_u_octet() {
        // 5-byte prefix: octets 5,6,7 then skip 8, then 9.
        let prefix = [0x20, 0x01, 0x0d, 0xb8, 0xaa];
        let addr = synthesize_ipv4_embedded_ipv6(&prefix, Ipv4Addr::new(1, 2, 3, 4)).unwrap();
        let octets = addr.octets();
        assert_eq!(&octets[5..8], &[1, 2, 3]);
        assert_eq!(octets[8], 0);
        assert_eq!(octets[9], 4);
    }

    #[test]
    fn rejects_invalid_prefix_length() {
        let prefix = [0u8; 8];
        assert!(synthesize_ipv4_embedded_ipv6(&prefix, Ipv4Addr::new(1, 2, 3, 4)).is_err());
    }

    #[test]
    fn derives_prefix_from_well_known_answer() {
        let addr: Ipv6Addr = "64:ff9b::c000:aa".parse().unwrap();
        let record = Record::from_rdata(
            Name::from_str(IPV4_ONLY_HOST).unwrap(),
            300,
            RData::AAAA(AAAA(addr)),
        );
        let prefixes = derive_prefixes(&[record]);
        assert_eq!(prefixes, vec![NAT64_PREFIX.to_vec()]);
    }

    #[test]
    fn derive_ignores_unrelated_answers() {
        let record = Record::from_rdata(
            Name::from_str(IPV4_ONLY_HOST).unwrap(),
            300,
            RData::AAAA(AAAA("2001:db8::1".parse().unwrap())),
        );
        assert!(derive_prefixes(&[record]).is_empty());
    }

    struct FixedUpstream {
        options: UpstreamConfig,
        answers: Vec<Record>,
    }

    #[async_trait]
    impl Upstream for FixedUpstream {
        async fn exchange(&self, request: &Message) -> Result<Message, ExchangeError> {
            let mut response = Message::new();
            response.set_id(request.id());
            response.set_message_type(MessageType::Response);
            response.set_recursion_available(true);
            for query in request.queries() {
                response.add_query(query.clone());
            }
            for record in &self.answers {
                response.add_answer(record.clone());
            }
            Ok(response)
        }

        fn rtt(&self) -> Duration {
            Duration::ZERO
        }

        fn adjust_rtt(&self, _sample: Duration) {}

        fn options(&self) -> &UpstreamConfig {
            &self.options
        }
    }

    #[tokio::test]
    async fn synthesizes_aaaa_from_a_answers() {
        let state = Dns64State::default();
        state.set(vec![NAT64_PREFIX.to_vec()]);

        let name = Name::from_str("ipv4only.arpa.").unwrap();
        let upstream: Arc<dyn Upstream> = Arc::new(FixedUpstream {
            options: UpstreamConfig {
                address: "192.0.2.1:53".to_string(),
                timeout_ms: 1000,
                id: None,
                bootstrap: None,
            },
            answers: vec![
                Record::from_rdata(
                    name.clone(),
                    300,
                    RData::A(A(Ipv4Addr::new(192, 0, 0, 170))),
                ),
                Record::from_rdata(
                    name.clone(),
                    300,
                    RData::A(A(Ipv4Addr::new(192, 0, 0, 171))),
                ),
            ],
        });

        let mut request = Message::new();
        request.set_id(0x77);
        request.set_recursion_desired(true);
        let mut query = Query::new();
        query.set_name(name);
        query.set_query_type(RecordType::AAAA);
        query.set_query_class(DNSClass::IN);
        request.add_query(query);

        let response = synthesize_aaaa(&request, &upstream, &state)
            .await
            .expect("synthesis succeeds");
        assert_eq!(response.id(), 0x77);
        let addrs: Vec<Ipv6Addr> = response
            .answers()
            .iter()
            .map(|r| match r.data() {
                Some(RData::AAAA(aaaa)) => aaaa.0,
                other => panic!("expected AAAA, got {:?}", other),
            })
            .collect();
        assert_eq!(
            addrs,
            vec![
                "64:ff9b::c000:aa".parse::<Ipv6Addr>().unwrap(),
                "64:ff9b::c000:ab".parse::<Ipv6Addr>().unwrap(),
            ]
        );
    }

    #[tokio::test]
    async fn synthesis_without_prefixes_returns_none() {
        let state = Dns64State::default();
        let upstream: Arc<dyn Upstream> = Arc::new(FixedUpstream {
            options: UpstreamConfig {
                address: "192.0.2.1:53".to_string(),
                timeout_ms: 1000,
                id: None,
                bootstrap: None,
            },
            answers: Vec::new(),
        });
        let request = Message::new();
        assert!(synthesize_aaaa(&request, &upstream, &state).await.is_none());
    }
}
