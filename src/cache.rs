use std::sync::Arc;
use std::time::{Duration, Instant};

use hickory_proto::op::Message;
use hickory_proto::rr::{Record, RecordType};
use moka::sync::Cache;
use tracing::debug;

/// EDNS UDP payload size advertised on cached responses.
pub(crate) const UDP_RECV_BUF_SIZE: u16 = 4096;

/// Cache key: everything that makes two requests interchangeable.
///
/// The name is lowercased (DNS is case-insensitive) and kept with its
/// trailing root dot. Of the EDNS state only the DO bit participates.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    qtype: u16,
    qclass: u16,
    dnssec_ok: bool,
    checking_disabled: bool,
    qname: String,
}

impl CacheKey {
    pub fn from_request(request: &Message) -> Option<CacheKey> {
        let question = request.queries().first()?;
        Some(CacheKey {
            qtype: u16::from(question.query_type()),
            qclass: u16::from(question.query_class()),
            dnssec_ok: request
                .extensions()
                .as_ref()
                .map(|edns| edns.dnssec_ok())
                .unwrap_or(false),
            checking_disabled: request.checking_disabled(),
            qname: question.name().to_lowercase().to_string(),
        })
    }
}

struct CachedResponse {
    /// Response template: question stripped, AA cleared. Patched on read.
    template: Message,
    expires_at: Instant,
    upstream_id: Option<i32>,
}

pub struct CacheHit {
    pub response: Message,
    pub upstream_id: Option<i32>,
    pub expired: bool,
}

/// Bounded concurrent cache of response templates.
///
/// moka 的并发 LRU 允许读路径更新最近使用位置，无需独占锁。
/// moka's concurrent LRU lets reads update recency without a writer lock.
pub struct ResponseCache {
    entries: Option<Cache<CacheKey, Arc<CachedResponse>>>,
}

impl ResponseCache {
    /// `capacity` of zero disables caching entirely.
    pub fn new(capacity: u64) -> Self {
        let entries = if capacity == 0 {
            None
        } else {
            Some(Cache::builder().max_capacity(capacity).build())
        };
        Self { entries }
    }

    pub fn enabled(&self) -> bool {
        self.entries.is_some()
    }

    /// Look up a cached response for `request`.
    ///
    /// On a hit the stored template is cloned and patched with the live
    /// request's id, question section and EDNS payload size; every record
    /// TTL is set to the remaining lifetime, clamped to at least 1 second.
    /// Expired entries are still returned, with `expired = true` and TTL 1,
    /// so the caller can decide whether to serve them optimistically.
    pub fn lookup(&self, key: &CacheKey, request: &Message) -> Option<CacheHit> {
        let entries = self.entries.as_ref()?;

        if has_unsupported_extensions(request) {
            debug!(target = "cache", "request has unsupported extensions");
            return None;
        }

        let entry = entries.get(key)?;
        let now = Instant::now();
        let remaining = entry.expires_at.saturating_duration_since(now);
        let expired = remaining == Duration::ZERO;
        let ttl = if expired { 1 } else { remaining_secs_ceil(remaining).max(1) };

        let mut response = entry.template.clone();
        response.set_id(request.id());
        if let Some(edns) = response.extensions_mut().as_mut() {
            edns.set_max_payload(UDP_RECV_BUF_SIZE);
        }
        for query in request.queries() {
            response.add_query(query.clone());
        }
        patch_ttls(&mut response, ttl);

        Some(CacheHit {
            response,
            upstream_id: entry.upstream_id,
            expired,
        })
    }

    /// Check cacheability and store an eligible response.
    ///
    /// Requirements: not truncated, exactly one question, NOERROR, no
    /// unsupported EDNS extensions, an answer of the requested type for
    /// A/AAAA queries, and a minimum record TTL of at least one second.
    pub fn insert(&self, key: CacheKey, response: &Message, upstream_id: Option<i32>) {
        let Some(entries) = self.entries.as_ref() else {
            return;
        };

        if response.truncated()
            || response.queries().len() != 1
            || response.response_code() != hickory_proto::op::ResponseCode::NoError
            || has_unsupported_extensions(response)
        {
            return;
        }

        let qtype = response.queries()[0].query_type();
        if qtype == RecordType::A || qtype == RecordType::AAAA {
            let found = response.answers().iter().any(|rr| rr.record_type() == qtype);
            if !found {
                return;
            }
        }

        let min_rr_ttl = min_rr_ttl(response);
        if min_rr_ttl == 0 {
            return;
        }

        entries.insert(
            key,
            Arc::new(CachedResponse {
                template: template_of(response),
                expires_at: Instant::now() + Duration::from_secs(min_rr_ttl as u64),
                upstream_id,
            }),
        );
    }

    pub fn erase(&self, key: &CacheKey) {
        if let Some(entries) = self.entries.as_ref() {
            entries.invalidate(key);
        }
    }

    #[cfg(test)]
    pub(crate) fn insert_with_expiry(
        &self,
        key: CacheKey,
        response: &Message,
        upstream_id: Option<i32>,
        expires_at: Instant,
    ) {
        let entries = self.entries.as_ref().expect("cache enabled");
        entries.insert(
            key,
            Arc::new(CachedResponse {
                template: template_of(response),
                expires_at,
                upstream_id,
            }),
        );
    }
}

/// Copy of `msg` with the question stripped and AA cleared. Both are
/// re-established (question from the live request) when a lookup patches
/// the clone.
fn template_of(msg: &Message) -> Message {
    let mut template = Message::new();
    template.set_id(msg.id());
    template.set_message_type(msg.message_type());
    template.set_op_code(msg.op_code());
    template.set_authoritative(false);
    template.set_truncated(msg.truncated());
    template.set_recursion_desired(msg.recursion_desired());
    template.set_recursion_available(msg.recursion_available());
    template.set_authentic_data(msg.authentic_data());
    template.set_checking_disabled(msg.checking_disabled());
    template.set_response_code(msg.response_code());
    for answer in msg.answers() {
        template.add_answer(answer.clone());
    }
    for authority in msg.name_servers() {
        template.add_name_server(authority.clone());
    }
    for additional in msg.additionals() {
        template.add_additional(additional.clone());
    }
    if let Some(edns) = msg.extensions() {
        template.set_edns(edns.clone());
    }
    template
}

/// Minimum TTL across answer, authority and additional records.
/// An empty response yields 0, which makes it uncacheable.
fn min_rr_ttl(msg: &Message) -> u32 {
    let mut min = u32::MAX;
    for rr in msg
        .answers()
        .iter()
        .chain(msg.name_servers())
        .chain(msg.additionals())
    {
        min = min.min(rr.ttl());
    }
    if min == u32::MAX {
        0
    } else {
        min
    }
}

fn patch_ttls(msg: &mut Message, ttl: u32) {
    let patch = |records: Vec<Record>| -> Vec<Record> {
        records
            .into_iter()
            .map(|mut rr| {
                rr.set_ttl(ttl);
                rr
            })
            .collect()
    };
    let answers = patch(msg.take_answers());
    msg.insert_answers(answers);
    let authorities = patch(msg.take_name_servers());
    msg.insert_name_servers(authorities);
    let additionals = patch(msg.take_additionals());
    msg.insert_additionals(additionals);
}

/// EDNS features the cache does not understand make both requests and
/// responses ineligible: extended rcodes and EDNS options.
///
/// The reserved EDNS flag bits should also veto caching, but hickory-proto
/// does not retain them after decoding, so they cannot be inspected here.
fn has_unsupported_extensions(msg: &Message) -> bool {
    match msg.extensions() {
        Some(edns) => edns.rcode_high() != 0 || !edns.options().as_ref().is_empty(),
        None => false,
    }
}

fn remaining_secs_ceil(remaining: Duration) -> u32 {
    let mut secs = remaining.as_secs();
    if remaining.subsec_nanos() > 0 {
        secs += 1;
    }
    secs.min(u32::MAX as u64) as u32
}
