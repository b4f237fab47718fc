use std::net::IpAddr;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA, SOA};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::{BinEncodable, BinEncoder};

use crate::config::{BlockingMode, ProxyConfig};
use crate::filter::Rule;

pub(crate) const SOA_RETRY_DEFAULT: u32 = 900;
pub(crate) const SOA_RETRY_IPV6_BLOCK: u32 = 60;

// Taken from AdGuardHome's genSOA: a well-known fake MNAME for negative caching.
const SOA_MNAME: &str = "fake-for-negative-caching.adguard.com.";

/// Base response skeleton: request id, QR=1, RD copied, RA set, question
/// cloned from the request.
pub fn response_template(request: &Message) -> Message {
    let mut response = Message::new();
    response.set_id(request.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(OpCode::Query);
    response.set_recursion_desired(request.recursion_desired());
    response.set_recursion_available(true);
    for query in request.queries() {
        response.add_query(query.clone());
    }
    response
}

pub fn servfail(request: &Message) -> Message {
    let mut response = response_template(request);
    response.set_response_code(ResponseCode::ServFail);
    response
}

pub fn refused(request: &Message) -> Message {
    let mut response = response_template(request);
    response.set_response_code(ResponseCode::Refused);
    response
}

pub fn nxdomain(request: &Message, settings: &ProxyConfig) -> Message {
    let mut response = response_template(request);
    response.set_response_code(ResponseCode::NXDomain);
    response.add_name_server(soa_record(request, settings, SOA_RETRY_DEFAULT));
    response
}

/// NOERROR with a single authority SOA: the "no data" answer.
pub fn soa_negative(request: &Message, settings: &ProxyConfig, retry_secs: u32) -> Message {
    let mut response = response_template(request);
    response.set_response_code(ResponseCode::NoError);
    response.add_name_server(soa_record(request, settings, retry_secs));
    response
}

fn soa_record(request: &Message, settings: &ProxyConfig, retry_secs: u32) -> Record {
    let owner = request
        .queries()
        .first()
        .map(|q| q.name().clone())
        .unwrap_or_else(Name::root);

    let zone = owner.to_string();
    let rname = if !zone.is_empty() && !zone.starts_with('.') {
        Name::from_str(&format!("hostmaster.{}", zone))
    } else {
        Name::from_str("hostmaster.")
    }
    .unwrap_or_else(|_| Name::root());

    let mname = Name::from_str(SOA_MNAME).unwrap_or_else(|_| Name::root());

    // SERIAL mirrors the odd but long-standing `now + 100500` stamp.
    let serial = (unix_time_secs() + 100_500) as u32;
    let soa = SOA::new(mname, rname, serial, 1800, retry_secs as i32, 604_800, 86_400);

    Record::from_rdata(owner, settings.blocked_response_ttl_secs, RData::SOA(soa))
}

fn unix_time_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// IPs that hosts lists use to mean "block" rather than "redirect":
/// 0.0.0.0, 127.0.0.1, :: and ::1 (bracketed forms parse to the same).
fn rules_contain_blocking_ip(rules: &[Rule]) -> bool {
    rules.iter().any(|rule| match rule.ip {
        Some(IpAddr::V4(v4)) => {
            v4 == std::net::Ipv4Addr::UNSPECIFIED || v4 == std::net::Ipv4Addr::LOCALHOST
        }
        Some(IpAddr::V6(v6)) => {
            v6 == std::net::Ipv6Addr::UNSPECIFIED || v6 == std::net::Ipv6Addr::LOCALHOST
        }
        None => false,
    })
}

/// Synthesize the blocking answer for `request` according to the decisive
/// rule kind, the query type and the configured blocking mode.
pub fn blocking_response(request: &Message, settings: &ProxyConfig, rules: &[Rule]) -> Message {
    let Some(decisive) = rules.first() else {
        return refused(request);
    };
    let qtype = request
        .queries()
        .first()
        .map(|q| q.query_type())
        .unwrap_or(RecordType::A);

    if qtype != RecordType::A && qtype != RecordType::AAAA {
        match settings.blocking_mode {
            BlockingMode::Default => {
                if decisive.ip.is_none() {
                    refused(request)
                } else {
                    soa_negative(request, settings, SOA_RETRY_DEFAULT)
                }
            }
            BlockingMode::Refused => refused(request),
            BlockingMode::Nxdomain => nxdomain(request, settings),
            BlockingMode::UnspecifiedAddress | BlockingMode::CustomAddress => {
                soa_negative(request, settings, SOA_RETRY_DEFAULT)
            }
        }
    } else if decisive.ip.is_none() {
        // Adblock-style rule.
        match settings.blocking_mode {
            BlockingMode::Default | BlockingMode::Refused => refused(request),
            BlockingMode::Nxdomain => nxdomain(request, settings),
            BlockingMode::UnspecifiedAddress | BlockingMode::CustomAddress => {
                unspec_or_custom_address(request, settings)
            }
        }
    } else if rules_contain_blocking_ip(rules) {
        match settings.blocking_mode {
            BlockingMode::Refused => refused(request),
            BlockingMode::Nxdomain => nxdomain(request, settings),
            BlockingMode::Default
            | BlockingMode::UnspecifiedAddress
            | BlockingMode::CustomAddress => unspec_or_custom_address(request, settings),
        }
    } else {
        address_rewrite_response(request, settings, rules)
    }
}

/// Hosts-style rewrite: answer with every rule IP of the requested family,
/// in rule order. No IP of that family falls back to the no-data SOA.
fn address_rewrite_response(request: &Message, settings: &ProxyConfig, rules: &[Rule]) -> Message {
    let question = request.queries().first();
    let (owner, qtype) = match question {
        Some(q) => (q.name().clone(), q.query_type()),
        None => return soa_negative(request, settings, SOA_RETRY_DEFAULT),
    };

    let mut answers = Vec::new();
    for rule in rules {
        match (qtype, rule.ip) {
            (RecordType::A, Some(IpAddr::V4(v4))) => answers.push(Record::from_rdata(
                owner.clone(),
                settings.blocked_response_ttl_secs,
                RData::A(A(v4)),
            )),
            (RecordType::AAAA, Some(IpAddr::V6(v6))) => answers.push(Record::from_rdata(
                owner.clone(),
                settings.blocked_response_ttl_secs,
                RData::AAAA(AAAA(v6)),
            )),
            _ => {}
        }
    }

    if answers.is_empty() {
        return soa_negative(request, settings, SOA_RETRY_DEFAULT);
    }

    let mut response = response_template(request);
    response.set_response_code(ResponseCode::NoError);
    for answer in answers {
        response.add_answer(answer);
    }
    response
}

fn unspec_or_custom_address(request: &Message, settings: &ProxyConfig) -> Message {
    let question = request.queries().first();
    let (owner, qtype) = match question {
        Some(q) => (q.name().clone(), q.query_type()),
        None => return soa_negative(request, settings, SOA_RETRY_DEFAULT),
    };

    let custom = settings.blocking_mode == BlockingMode::CustomAddress;
    let rdata = match qtype {
        RecordType::A => {
            if custom {
                if settings.custom_blocking_ipv4.is_empty() {
                    return soa_negative(request, settings, SOA_RETRY_DEFAULT);
                }
                // Validated at proxy init; fall back to unspecified on a
                // settings object that skipped init.
                let v4 = settings
                    .custom_blocking_ipv4
                    .parse()
                    .unwrap_or(std::net::Ipv4Addr::UNSPECIFIED);
                RData::A(A(v4))
            } else {
                RData::A(A(std::net::Ipv4Addr::UNSPECIFIED))
            }
        }
        _ => {
            if custom {
                if settings.custom_blocking_ipv6.is_empty() {
                    return soa_negative(request, settings, SOA_RETRY_DEFAULT);
                }
                let v6 = settings
                    .custom_blocking_ipv6
                    .parse()
                    .unwrap_or(std::net::Ipv6Addr::UNSPECIFIED);
                RData::AAAA(AAAA(v6))
            } else {
                RData::AAAA(AAAA(std::net::Ipv6Addr::UNSPECIFIED))
            }
        }
    };

    let mut response = response_template(request);
    response.set_response_code(ResponseCode::NoError);
    response.add_answer(Record::from_rdata(
        owner,
        settings.blocked_response_ttl_secs,
        rdata,
    ));
    response
}

pub fn serialize(msg: &Message) -> anyhow::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(512);
    {
        let mut encoder = BinEncoder::new(&mut out);
        msg.emit(&mut encoder)?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::Query;
    use hickory_proto::rr::DNSClass;

    fn request(qname: &str, qtype: RecordType) -> Message {
        let mut msg = Message::new();
        msg.set_id(0x1234);
        msg.set_recursion_desired(true);
        let mut query = Query::new();
        query.set_name(Name::from_str(qname).unwrap());
        query.set_query_type(qtype);
        query.set_query_class(DNSClass::IN);
        msg.add_query(query);
        msg
    }

    fn rule(text: &str, ip: Option<&str>, exception: bool) -> Rule {
        Rule {
            text: text.to_string(),
            filter_id: 0,
            ip: ip.map(|ip| ip.parse().unwrap()),
            exception,
        }
    }

    fn soa_retry(response: &Message) -> i32 {
        let record = response.name_servers().first().expect("authority SOA");
        match record.data() {
            Some(RData::SOA(soa)) => soa.retry(),
            other => panic!("expected SOA, got {:?}", other),
        }
    }

    #[test]
    fn template_preserves_id_and_question() {
        let req = request("example.com.", RecordType::A);
        let resp = response_template(&req);
        assert_eq!(resp.id(), 0x1234);
        assert_eq!(resp.message_type(), MessageType::Response);
        assert!(resp.recursion_desired());
        assert!(resp.recursion_available());
        assert_eq!(resp.queries().len(), 1);
        assert_eq!(resp.queries()[0].name().to_string(), "example.com.");
    }

    #[test]
    fn adblock_rule_nxdomain_mode_txt_query() {
        let req = request("ads.example.", RecordType::TXT);
        let settings = ProxyConfig {
            blocking_mode: BlockingMode::Nxdomain,
            blocked_response_ttl_secs: 1234,
            ..Default::default()
        };
        let resp = blocking_response(&req, &settings, &[rule("||ads.example^", None, false)]);
        assert_eq!(resp.response_code(), ResponseCode::NXDomain);
        assert_eq!(resp.answers().len(), 0);
        assert_eq!(resp.name_servers().len(), 1);
        assert_eq!(resp.name_servers()[0].ttl(), 1234);
        assert_eq!(soa_retry(&resp), SOA_RETRY_DEFAULT as i32);
    }

    #[test]
    fn adblock_rule_default_mode_is_refused() {
        let req = request("ads.example.", RecordType::A);
        let settings = ProxyConfig::default();
        let resp = blocking_response(&req, &settings, &[rule("||ads.example^", None, false)]);
        assert_eq!(resp.response_code(), ResponseCode::Refused);
        assert!(resp.name_servers().is_empty());
    }

    #[test]
    fn hosts_rules_rewrite_a_answers_in_rule_order() {
        let req = request("cdn.example.", RecordType::A);
        let settings = ProxyConfig {
            blocked_response_ttl_secs: 60,
            ..Default::default()
        };
        let rules = [
            rule("10.0.0.1 cdn.example", Some("10.0.0.1"), false),
            rule("10.0.0.2 cdn.example", Some("10.0.0.2"), false),
        ];
        let resp = blocking_response(&req, &settings, &rules);
        assert_eq!(resp.response_code(), ResponseCode::NoError);
        let ips: Vec<String> = resp
            .answers()
            .iter()
            .map(|r| match r.data() {
                Some(RData::A(a)) => a.0.to_string(),
                other => panic!("expected A record, got {:?}", other),
            })
            .collect();
        assert_eq!(ips, vec!["10.0.0.1", "10.0.0.2"]);
        assert!(resp.answers().iter().all(|r| r.ttl() == 60));
    }

    #[test]
    fn hosts_rule_without_family_match_yields_soa() {
        // AAAA query, but the rule only carries an IPv4.
        let req = request("cdn.example.", RecordType::AAAA);
        let settings = ProxyConfig::default();
        let resp =
            blocking_response(&req, &settings, &[rule("10.0.0.1 cdn.example", Some("10.0.0.1"), false)]);
        assert_eq!(resp.response_code(), ResponseCode::NoError);
        assert!(resp.answers().is_empty());
        assert_eq!(resp.name_servers().len(), 1);
    }

    #[test]
    fn blocking_ip_rule_default_mode_yields_unspecified() {
        let req = request("bad.example.", RecordType::A);
        let settings = ProxyConfig::default();
        let resp =
            blocking_response(&req, &settings, &[rule("0.0.0.0 bad.example", Some("0.0.0.0"), false)]);
        assert_eq!(resp.response_code(), ResponseCode::NoError);
        match resp.answers()[0].data() {
            Some(RData::A(a)) => assert!(a.0.is_unspecified()),
            other => panic!("expected A record, got {:?}", other),
        }
    }

    #[test]
    fn custom_mode_with_empty_family_falls_back_to_soa() {
        let req = request("bad.example.", RecordType::AAAA);
        let settings = ProxyConfig {
            blocking_mode: BlockingMode::CustomAddress,
            custom_blocking_ipv4: "198.51.100.1".to_string(),
            ..Default::default()
        };
        let resp = blocking_response(&req, &settings, &[rule("||bad.example^", None, false)]);
        assert_eq!(resp.response_code(), ResponseCode::NoError);
        assert!(resp.answers().is_empty());
        assert_eq!(resp.name_servers().len(), 1);
    }

    #[test]
    fn custom_mode_answers_with_custom_address() {
        let req = request("bad.example.", RecordType::A);
        let settings = ProxyConfig {
            blocking_mode: BlockingMode::CustomAddress,
            custom_blocking_ipv4: "198.51.100.1".to_string(),
            ..Default::default()
        };
        let resp = blocking_response(&req, &settings, &[rule("||bad.example^", None, false)]);
        match resp.answers()[0].data() {
            Some(RData::A(a)) => assert_eq!(a.0.to_string(), "198.51.100.1"),
            other => panic!("expected A record, got {:?}", other),
        }
    }

    #[test]
    fn soa_record_fields_match_negative_caching_convention() {
        let req = request("example.com.", RecordType::A);
        let settings = ProxyConfig {
            blocked_response_ttl_secs: 900,
            ..Default::default()
        };
        let resp = soa_negative(&req, &settings, SOA_RETRY_IPV6_BLOCK);
        let record = resp.name_servers().first().expect("soa");
        assert_eq!(record.ttl(), 900);
        match record.data() {
            Some(RData::SOA(soa)) => {
                assert_eq!(soa.mname().to_string(), SOA_MNAME);
                assert_eq!(soa.rname().to_string(), "hostmaster.example.com.");
                assert_eq!(soa.refresh(), 1800);
                assert_eq!(soa.retry(), SOA_RETRY_IPV6_BLOCK as i32);
                assert_eq!(soa.expire(), 604_800);
                assert_eq!(soa.minimum(), 86_400);
            }
            other => panic!("expected SOA, got {:?}", other),
        }
    }

    #[test]
    fn serialize_round_trips() {
        let req = request("example.com.", RecordType::A);
        let raw = serialize(&req).expect("serialize");
        let parsed = Message::from_vec(&raw).expect("parse");
        assert_eq!(parsed.id(), req.id());
        assert_eq!(serialize(&parsed).expect("serialize"), raw);
    }
}
