use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwap;
use dashmap::DashMap;
use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::{RData, RecordType};
use rustc_hash::FxBuildHasher;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::cache::{CacheKey, ResponseCache};
use crate::config::ProxyConfig;
use crate::dns64::{self, Dns64State};
use crate::events::{self, ProcessedEvent, ProxyEvents};
use crate::filter::{Filter, Rule};
use crate::responses;
use crate::upstream::Upstream;

/// Firefox queries this name to decide whether to enable its own DoH;
/// answering NXDOMAIN keeps resolution on the local proxy.
const MOZILLA_DOH_HOST: &str = "use-application-dns.net.";

/// The DNS forwarder core: one instance serves every listener.
///
/// All state is shared-nothing or internally synchronized, so
/// `handle_message` may be invoked from any number of tasks in parallel.
pub struct Forwarder {
    settings: Arc<ProxyConfig>,
    events: ProxyEvents,
    upstreams: Vec<Arc<dyn Upstream>>,
    fallbacks: Vec<Arc<dyn Upstream>>,
    filter: Arc<ArcSwap<Filter>>,
    cache: ResponseCache,
    dns64: Arc<Dns64State>,
    // 每个指纹最多一个在途刷新任务。 / At most one in-flight refresh per fingerprint.
    refresh_tasks: DashMap<CacheKey, JoinHandle<()>, FxBuildHasher>,
    shutting_down: AtomicBool,
}

impl Forwarder {
    pub fn new(
        settings: Arc<ProxyConfig>,
        events: ProxyEvents,
        upstreams: Vec<Arc<dyn Upstream>>,
        fallbacks: Vec<Arc<dyn Upstream>>,
        filter: Arc<ArcSwap<Filter>>,
        dns64: Arc<Dns64State>,
    ) -> Self {
        let cache = ResponseCache::new(settings.dns_cache_size);
        Self {
            settings,
            events,
            upstreams,
            fallbacks,
            filter,
            cache,
            dns64,
            refresh_tasks: DashMap::with_hasher(FxBuildHasher::default()),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &ProxyConfig {
        &self.settings
    }

    /// Process one wire-format DNS message and produce the reply bytes.
    ///
    /// Never fails outward: unrecoverable states produce a SERVFAIL built
    /// from whatever was parsed, or empty bytes when not even the request
    /// id could be recovered.
    pub async fn handle_message(self: &Arc<Self>, message: &[u8]) -> Vec<u8> {
        let started = Instant::now();
        let mut event = ProcessedEvent {
            start_time_ms: unix_ms(),
            ..Default::default()
        };

        let request = match Message::from_vec(message) {
            Ok(request) => request,
            Err(err) => {
                let err = format!("failed to parse payload: {}", err);
                debug!(target = "forwarder", error = %err, "dropping malformed request");
                self.finalize_event(&mut event, started, None, None, None, None, Some(err));
                return Vec::new();
            }
        };

        let Some(question) = request.queries().first().cloned() else {
            debug!(target = "forwarder", id = request.id(), "message has no question section");
            let response = responses::servfail(&request);
            let raw = responses::serialize(&response).unwrap_or_default();
            self.finalize_event(
                &mut event,
                started,
                None,
                Some(&response),
                None,
                None,
                Some("message has no question section".to_string()),
            );
            return raw;
        };

        let domain = question.name().to_string();
        event.domain = domain.clone();
        let qtype = question.query_type();
        let key = CacheKey::from_request(&request);

        if let Some(key) = &key {
            if let Some(hit) = self.cache.lookup(key, &request) {
                if !hit.expired || self.settings.optimistic_cache {
                    if hit.expired {
                        self.spawn_refresh(key.clone(), request.clone());
                    }
                    event.cache_hit = true;
                    let raw = responses::serialize(&hit.response).unwrap_or_default();
                    self.finalize_event(
                        &mut event,
                        started,
                        Some(&request),
                        Some(&hit.response),
                        None,
                        hit.upstream_id,
                        None,
                    );
                    return raw;
                }
            }
        }

        // Mozilla DoH canary short-circuit.
        if (qtype == RecordType::A || qtype == RecordType::AAAA)
            && domain.eq_ignore_ascii_case(MOZILLA_DOH_HOST)
        {
            debug!(target = "forwarder", "answering Mozilla DoH canary with NXDOMAIN");
            let response = responses::nxdomain(&request, &self.settings);
            let raw = responses::serialize(&response).unwrap_or_default();
            self.finalize_event(&mut event, started, Some(&request), Some(&response), None, None, None);
            return raw;
        }

        let pure_domain = domain.strip_suffix('.').unwrap_or(&domain).to_string();
        trace!(target = "forwarder", domain = %pure_domain, "query domain");

        let mut effective_rules: Vec<Rule> = Vec::new();

        // IPv6 hard block: filter runs for telemetry, but only a blocking
        // response with a non-NOERROR rcode overrides the SOA answer.
        if self.settings.block_ipv6 && qtype == RecordType::AAAA {
            if let Some(response) =
                self.apply_filter(&pure_domain, &request, &mut event, &mut effective_rules)
            {
                if response.response_code() != ResponseCode::NoError {
                    let raw = responses::serialize(&response).unwrap_or_default();
                    self.finalize_event(&mut event, started, Some(&request), Some(&response), None, None, None);
                    return raw;
                }
            }
            debug!(target = "forwarder", domain = %pure_domain, "AAAA query blocked: ipv6 blocking is enabled");
            let response = responses::soa_negative(
                &request,
                &self.settings,
                responses::SOA_RETRY_IPV6_BLOCK,
            );
            let raw = responses::serialize(&response).unwrap_or_default();
            self.finalize_event(&mut event, started, Some(&request), Some(&response), None, None, None);
            return raw;
        }

        // Pre-filter by query domain.
        if let Some(response) =
            self.apply_filter(&pure_domain, &request, &mut event, &mut effective_rules)
        {
            let raw = responses::serialize(&response).unwrap_or_default();
            self.finalize_event(&mut event, started, Some(&request), Some(&response), None, None, None);
            return raw;
        }

        let (mut response, upstream) = match self.do_upstream_exchange(&request).await {
            Ok(exchanged) => exchanged,
            Err((err, last_tried)) => {
                warn!(target = "forwarder", domain = %pure_domain, error = %err, "all upstreams failed");
                let response = responses::servfail(&request);
                let raw = responses::serialize(&response).unwrap_or_default();
                self.finalize_event(
                    &mut event,
                    started,
                    Some(&request),
                    Some(&response),
                    None,
                    last_tried.and_then(|u| u.options().id),
                    Some(err),
                );
                return raw;
            }
        };

        if response.response_code() == ResponseCode::NoError {
            // Post-filter CNAME targets and answer addresses.
            let answers = response.answers().to_vec();
            for rr in &answers {
                let hostname = match rr.data() {
                    Some(RData::CNAME(cname)) => {
                        let target = cname.0.to_string();
                        trace!(target = "forwarder", cname = %target, "response CNAME");
                        target.strip_suffix('.').unwrap_or(&target).to_string()
                    }
                    Some(RData::A(a)) => a.0.to_string(),
                    Some(RData::AAAA(aaaa)) => aaaa.0.to_string(),
                    _ => continue,
                };
                if let Some(blocked) =
                    self.apply_filter(&hostname, &request, &mut event, &mut effective_rules)
                {
                    let raw = responses::serialize(&blocked).unwrap_or_default();
                    self.finalize_event(
                        &mut event,
                        started,
                        Some(&request),
                        Some(&blocked),
                        Some(&response),
                        None,
                        None,
                    );
                    return raw;
                }
            }

            // DNS64: synthesize AAAA when the native answer has none.
            if self.settings.dns64.is_some() && qtype == RecordType::AAAA {
                let has_aaaa = response
                    .answers()
                    .iter()
                    .any(|rr| rr.record_type() == RecordType::AAAA);
                if !has_aaaa {
                    if let Some(synthesized) =
                        dns64::synthesize_aaaa(&request, &upstream, &self.dns64).await
                    {
                        debug!(target = "forwarder", domain = %pure_domain, "dns64 synthesized response");
                        response = synthesized;
                    }
                }
            }
        }

        let raw = responses::serialize(&response).unwrap_or_default();
        event.bytes_sent = message.len();
        event.bytes_received = raw.len();
        let upstream_id = upstream.options().id;
        self.finalize_event(
            &mut event,
            started,
            Some(&request),
            Some(&response),
            None,
            upstream_id,
            None,
        );
        if let Some(key) = key {
            self.cache.insert(key, &response, upstream_id);
        }
        raw
    }

    /// Graceful teardown: queued refresh tasks observe the shutdown flag
    /// and exit, started ones are drained. No `handle_message` calls may
    /// follow.
    pub async fn deinit(&self) {
        info!(target = "forwarder", "deinitializing");
        self.shutting_down.store(true, Ordering::Release);
        let keys: Vec<CacheKey> = self
            .refresh_tasks
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        let mut handles = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some((_, handle)) = self.refresh_tasks.remove(&key) {
                handles.push(handle);
            }
        }
        for handle in handles {
            let _ = handle.await;
        }
        info!(target = "forwarder", "deinitialized");
    }

    /// Match `hostname` against the rule lists, merged with the effective
    /// rules carried from earlier stages of the same request. Returns the
    /// blocking response if the decisive rule blocks.
    fn apply_filter(
        &self,
        hostname: &str,
        request: &Message,
        event: &mut ProcessedEvent,
        last_effective_rules: &mut Vec<Rule>,
    ) -> Option<Message> {
        let filter = self.filter.load();
        let mut rules = filter.matches(hostname);
        for rule in &rules {
            trace!(target = "forwarder", rule = %rule.text, "matched rule");
        }
        rules.extend(last_effective_rules.iter().cloned());
        let effective = Filter::effective_rules(&rules);
        events::append_rules(event, &effective);
        *last_effective_rules = effective.clone();

        if effective.is_empty() || effective[0].exception {
            return None;
        }

        debug!(target = "forwarder", rule = %effective[0].text, hostname = %hostname, "query blocked by rule");
        Some(responses::blocking_response(
            request,
            &self.settings,
            &effective,
        ))
    }

    /// Try every primary, then every fallback, each group ordered by the
    /// RTT recorded at snapshot time. Timeouts are terminal per upstream;
    /// other errors earn a single retry.
    async fn do_upstream_exchange(
        &self,
        request: &Message,
    ) -> Result<(Message, Arc<dyn Upstream>), (String, Option<Arc<dyn Upstream>>)> {
        let mut last_error = String::new();
        let mut last_tried: Option<Arc<dyn Upstream>> = None;

        for group in [&self.upstreams, &self.fallbacks] {
            let mut sorted: Vec<Arc<dyn Upstream>> = group.clone();
            sorted.sort_by_key(|upstream| upstream.rtt());

            for upstream in sorted {
                last_tried = Some(upstream.clone());
                let address = upstream.options().address.clone();
                trace!(target = "forwarder", address = %address, "starting exchange");
                let start = Instant::now();
                let result = upstream.exchange(request).await;
                upstream.adjust_rtt(start.elapsed());

                match result {
                    Ok(response) => return Ok((response, upstream)),
                    Err(err) if err.is_timeout() => {
                        debug!(target = "forwarder", address = %address, error = %err, "upstream exchange failed");
                    }
                    Err(err) => {
                        // Transient failures are worth one more attempt
                        // against the same upstream.
                        match upstream.exchange(request).await {
                            Ok(response) => return Ok((response, upstream)),
                            Err(retry_err) => {
                                last_error = format!(
                                    "upstream ({}) exchange failed: first reason is {}, second is: {}",
                                    address, err, retry_err
                                );
                                debug!(target = "forwarder", error = %last_error, "retry failed");
                            }
                        }
                    }
                }
            }
        }

        if last_error.is_empty() {
            last_error = "all upstreams failed".to_string();
        }
        Err((last_error, last_tried))
    }

    fn spawn_refresh(self: &Arc<Self>, key: CacheKey, request: Message) {
        if self.shutting_down.load(Ordering::Acquire) {
            return;
        }
        use dashmap::mapref::entry::Entry;
        match self.refresh_tasks.entry(key.clone()) {
            Entry::Occupied(_) => {
                // 该指纹的刷新已在途。 / A refresh for this key is already in flight.
            }
            Entry::Vacant(slot) => {
                let forwarder = Arc::downgrade(self);
                let handle = tokio::spawn(async move {
                    let Some(forwarder) = forwarder.upgrade() else {
                        return;
                    };
                    if !forwarder.shutting_down.load(Ordering::Acquire) {
                        forwarder.run_refresh(&key, &request).await;
                    }
                    forwarder.refresh_tasks.remove(&key);
                });
                slot.insert(handle);
            }
        }
    }

    async fn run_refresh(&self, key: &CacheKey, request: &Message) {
        debug!(target = "forwarder", id = request.id(), "starting async refresh");
        match self.do_upstream_exchange(request).await {
            Ok((response, upstream)) => {
                self.cache.insert(key.clone(), &response, upstream.options().id);
            }
            Err((err, _)) => {
                debug!(target = "forwarder", error = %err, "async refresh failed, removing entry from cache");
                self.cache.erase(key);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn finalize_event(
        &self,
        event: &mut ProcessedEvent,
        started: Instant,
        request: Option<&Message>,
        response: Option<&Message>,
        original_response: Option<&Message>,
        upstream_id: Option<i32>,
        error: Option<String>,
    ) {
        if let Some(request) = request {
            if let Some(question) = request.queries().first() {
                event.qtype = question.query_type().to_string();
            }
        }
        if let Some(response) = response {
            event.rcode = events::rcode_to_str(response.response_code()).to_string();
            event.answer = events::format_answers(response.answers());
        }
        if let Some(original) = original_response {
            event.original_answer = events::format_answers(original.answers());
        }
        event.upstream_id = upstream_id;
        if let Some(error) = error {
            event.error = error;
        }
        event.elapsed_ms = started.elapsed().as_millis() as u64;
        self.events.emit_request_processed(event);
    }
}

fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
