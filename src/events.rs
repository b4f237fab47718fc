use std::fmt::Write as _;

use hickory_proto::op::ResponseCode;
use hickory_proto::rr::Record;

use crate::filter::Rule;

/// Per-request telemetry handed to the `on_request_processed` callback.
#[derive(Debug, Default, Clone)]
pub struct ProcessedEvent {
    /// Wall-clock start of processing, unix milliseconds.
    pub start_time_ms: u64,
    pub elapsed_ms: u64,
    /// Queried domain, with trailing dot.
    pub domain: String,
    /// Query type as text ("A", "AAAA", ...). Empty if the request never parsed.
    pub qtype: String,
    /// Response code as text ("NOERROR", ...). Empty if no response was built.
    pub rcode: String,
    /// Answer section of the returned response, one record per line.
    pub answer: String,
    /// Answer section of the upstream response before a post-filter rewrite.
    pub original_answer: String,
    pub upstream_id: Option<i32>,
    /// Applied rule texts, deduplicated, in application order.
    pub rules: Vec<String>,
    pub filter_ids: Vec<i32>,
    /// The decisive rule was an exception.
    pub whitelist: bool,
    pub cache_hit: bool,
    pub bytes_sent: usize,
    pub bytes_received: usize,
    pub error: String,
}

pub type RequestProcessedCallback = Box<dyn Fn(&ProcessedEvent) + Send + Sync>;

/// Certificate chain presented by an encrypted upstream, DER encoded,
/// leaf first.
#[derive(Debug, Clone)]
pub struct CertificateInfo {
    pub hostname: String,
    pub chain: Vec<Vec<u8>>,
}

/// Returning an error string rejects the connection.
pub type CertificateVerificationCallback =
    Box<dyn Fn(&CertificateInfo) -> Result<(), String> + Send + Sync>;

/// Optional callback surface. All hooks may be left unset.
///
/// `on_certificate_verification` is consulted by encrypted upstream
/// implementations; plain upstreams never present a certificate.
#[derive(Default)]
pub struct ProxyEvents {
    pub on_request_processed: Option<RequestProcessedCallback>,
    pub on_certificate_verification: Option<CertificateVerificationCallback>,
}

impl ProxyEvents {
    pub fn emit_request_processed(&self, event: &ProcessedEvent) {
        if let Some(callback) = &self.on_request_processed {
            callback(event);
        }
    }
}

/// Record the rules a filtering stage applied.
///
/// Later stages (CNAME / IP post-filters) append to the same event, so
/// already-recorded rule texts are skipped. The whitelist flag tracks the
/// decisive rule of the most recent stage.
pub fn append_rules(event: &mut ProcessedEvent, effective: &[Rule]) {
    if effective.is_empty() {
        return;
    }
    for rule in effective {
        if event.rules.iter().any(|text| text == &rule.text) {
            continue;
        }
        event.rules.push(rule.text.clone());
        event.filter_ids.push(rule.filter_id);
    }
    event.whitelist = effective[0].exception;
}

/// Format records the way event consumers expect:
/// `<TYPE>, <rdata>` per line, e.g. `A, 1.2.3.4`.
pub fn format_answers(records: &[Record]) -> String {
    let mut out = String::new();
    for record in records {
        let rdata = match record.data() {
            Some(data) => data.to_string(),
            None => continue,
        };
        let _ = writeln!(out, "{}, {}", record.record_type(), rdata);
    }
    out
}

pub fn rcode_to_str(rcode: ResponseCode) -> &'static str {
    match rcode {
        ResponseCode::NoError => "NOERROR",
        ResponseCode::FormErr => "FORMERR",
        ResponseCode::ServFail => "SERVFAIL",
        ResponseCode::NXDomain => "NXDOMAIN",
        ResponseCode::NotImp => "NOTIMP",
        ResponseCode::Refused => "REFUSED",
        _ => "OTHER",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::rdata::{A, CNAME};
    use hickory_proto::rr::{Name, RData};
    use std::net::Ipv4Addr;
    use std::str::FromStr;

    fn rule(text: &str, exception: bool) -> Rule {
        Rule {
            text: text.to_string(),
            filter_id: 3,
            ip: None,
            exception,
        }
    }

    #[test]
    fn append_rules_dedupes_and_keeps_order() {
        let mut event = ProcessedEvent::default();
        append_rules(&mut event, &[rule("||a^", false), rule("||b^", false)]);
        append_rules(&mut event, &[rule("||b^", false), rule("||c^", false)]);
        assert_eq!(event.rules, vec!["||a^", "||b^", "||c^"]);
        assert_eq!(event.filter_ids.len(), 3);
        assert!(!event.whitelist);
    }

    #[test]
    fn whitelist_follows_decisive_rule() {
        let mut event = ProcessedEvent::default();
        append_rules(&mut event, &[rule("@@||a^", true), rule("||a^", false)]);
        assert!(event.whitelist);
    }

    #[test]
    fn format_answers_prints_type_and_rdata() {
        let a = Record::from_rdata(
            Name::from_str("example.com.").unwrap(),
            60,
            RData::A(A(Ipv4Addr::new(1, 2, 3, 4))),
        );
        let cname = Record::from_rdata(
            Name::from_str("alias.example.com.").unwrap(),
            60,
            RData::CNAME(CNAME(Name::from_str("example.com.").unwrap())),
        );
        let out = format_answers(&[a, cname]);
        assert_eq!(out, "A, 1.2.3.4\nCNAME, example.com.\n");
    }
}
