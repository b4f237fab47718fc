use std::fs;
use std::net::IpAddr;

use ipnet::IpNet;
use regex::Regex;
use tracing::debug;

use crate::config::FilterConfig;

/// A single filtering rule as seen by the forwarder.
///
/// Rules are cheap values: the pipeline clones them freely and never mutates
/// them after compilation.
#[derive(Debug, Clone)]
pub struct Rule {
    /// Original rule text, reported in processed events.
    pub text: String,
    /// Identifier of the list the rule came from (0 = inline rules).
    pub filter_id: i32,
    /// Rewrite address for hosts-style rules.
    pub ip: Option<IpAddr>,
    /// `@@` exception rules whitelist the query instead of blocking it.
    pub exception: bool,
}

#[derive(Debug, Clone)]
enum Pattern {
    /// Hostname equality (hosts-style rules).
    Exact(String),
    /// `||domain^` - the domain itself or any subdomain.
    Suffix(String),
    /// Plain adblock pattern, matched as a substring.
    Substring(String),
    /// `/re/` rules.
    Regex(Regex),
    /// CIDR rules, matched against stringified answer addresses.
    Cidr(IpNet),
}

#[derive(Debug, Clone)]
struct CompiledRule {
    rule: Rule,
    pattern: Pattern,
}

/// Compiled rule set. Matching is read-only, so a `Filter` can be shared
/// across workers behind an `ArcSwap` and replaced wholesale on reload.
#[derive(Debug, Default)]
pub struct Filter {
    rules: Vec<CompiledRule>,
}

impl Filter {
    /// Compile the configured rule lists.
    ///
    /// Unparsable lines are skipped and summarized in the returned warning,
    /// matching the "init succeeds with warnings" contract.
    pub fn new(cfg: &FilterConfig) -> (Filter, Option<String>) {
        let mut rules = Vec::new();
        let mut warnings = Vec::new();

        for (line_no, line) in cfg.rules.iter().enumerate() {
            match compile_line(line, 0) {
                Ok(Some(rule)) => rules.push(rule),
                Ok(None) => {}
                Err(err) => warnings.push(format!("inline rule {}: {}", line_no + 1, err)),
            }
        }

        for (idx, path) in cfg.files.iter().enumerate() {
            let filter_id = idx as i32 + 1;
            let contents = match fs::read_to_string(path) {
                Ok(contents) => contents,
                Err(err) => {
                    warnings.push(format!("{}: {}", path.display(), err));
                    continue;
                }
            };
            let mut bad_lines = 0usize;
            for line in contents.lines() {
                match compile_line(line, filter_id) {
                    Ok(Some(rule)) => rules.push(rule),
                    Ok(None) => {}
                    Err(_) => bad_lines += 1,
                }
            }
            if bad_lines > 0 {
                warnings.push(format!("{}: skipped {} rules", path.display(), bad_lines));
            }
        }

        debug!(target = "filter", rules = rules.len(), "filter compiled");

        let warning = if warnings.is_empty() {
            None
        } else {
            Some(warnings.join("\n"))
        };
        (Filter { rules }, warning)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Collect every rule matching `hostname` (already without trailing dot).
    /// The same matcher serves domains, CNAME targets and stringified
    /// answer addresses.
    pub fn matches(&self, hostname: &str) -> Vec<Rule> {
        let host = hostname.to_ascii_lowercase();
        self.rules
            .iter()
            .filter(|compiled| compiled.matches(&host))
            .map(|compiled| compiled.rule.clone())
            .collect()
    }

    /// Priority selection over raw matches: element 0 decides the outcome.
    ///
    /// Exceptions beat blocks; hosts-style rules are grouped together so an
    /// address rewrite can answer with every configured IP.
    pub fn effective_rules(rules: &[Rule]) -> Vec<Rule> {
        let exceptions: Vec<Rule> = rules.iter().filter(|r| r.exception).cloned().collect();
        if !exceptions.is_empty() {
            return exceptions;
        }
        let hosts: Vec<Rule> = rules.iter().filter(|r| r.ip.is_some()).cloned().collect();
        if !hosts.is_empty() {
            return hosts;
        }
        rules.first().cloned().into_iter().collect()
    }
}

impl CompiledRule {
    fn matches(&self, host: &str) -> bool {
        match &self.pattern {
            Pattern::Exact(name) => host == name,
            Pattern::Suffix(domain) => {
                host == domain
                    || (host.len() > domain.len()
                        && host.ends_with(domain.as_str())
                        && host.as_bytes()[host.len() - domain.len() - 1] == b'.')
            }
            Pattern::Substring(needle) => host.contains(needle.as_str()),
            Pattern::Regex(regex) => regex.is_match(host),
            Pattern::Cidr(net) => host
                .parse::<IpAddr>()
                .map(|ip| net.contains(&ip))
                .unwrap_or(false),
        }
    }
}

/// Parse one rule-list line. `Ok(None)` for blanks and comments.
fn compile_line(line: &str, filter_id: i32) -> anyhow::Result<Option<CompiledRule>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('!') || line.starts_with('#') {
        return Ok(None);
    }

    let (exception, body) = match line.strip_prefix("@@") {
        Some(rest) => (true, rest),
        None => (false, line),
    };
    if body.is_empty() {
        anyhow::bail!("empty rule body");
    }

    // hosts 格式：IP 在前，主机名在后。 / hosts syntax: IP first, hostname second.
    if !exception {
        let mut parts = body.split_whitespace();
        if let (Some(first), Some(host)) = (parts.next(), parts.next()) {
            // Accept bracketed IPv6 literals like [::1].
            let literal = first
                .strip_prefix('[')
                .and_then(|rest| rest.strip_suffix(']'))
                .unwrap_or(first);
            if let Ok(ip) = literal.parse::<IpAddr>() {
                return Ok(Some(CompiledRule {
                    rule: Rule {
                        text: line.to_string(),
                        filter_id,
                        ip: Some(ip),
                        exception: false,
                    },
                    pattern: Pattern::Exact(host.to_ascii_lowercase()),
                }));
            }
        }
    }

    if body.contains(char::is_whitespace) {
        anyhow::bail!("unexpected whitespace in rule");
    }

    let pattern = if let Some(re) = body.strip_prefix('/').and_then(|r| r.strip_suffix('/')) {
        Pattern::Regex(Regex::new(&format!("(?i){}", re))?)
    } else if let Ok(net) = body.parse::<IpNet>() {
        Pattern::Cidr(net)
    } else if let Some(domain) = body.strip_prefix("||") {
        let domain = domain.trim_end_matches('^').trim_end_matches('.');
        if domain.is_empty() {
            anyhow::bail!("empty domain in anchor rule");
        }
        Pattern::Suffix(domain.to_ascii_lowercase())
    } else {
        let needle = body.trim_matches('^');
        if needle.is_empty() {
            anyhow::bail!("empty pattern");
        }
        Pattern::Substring(needle.to_ascii_lowercase())
    };

    Ok(Some(CompiledRule {
        rule: Rule {
            text: line.to_string(),
            filter_id,
            ip: None,
            exception,
        },
        pattern,
    }))
}
