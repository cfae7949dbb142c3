//! Path-prefix routing
//!
//! Rules are evaluated in order and the first matching prefix wins. The
//! default table sends `/api/` to the API service with the prefix removed
//! and everything else to the frontend as is.

use crate::error::{Result, RolloutError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// API upstream in the default table
pub const DEFAULT_API_UPSTREAM: &str = "http://api:3000";
/// Frontend upstream in the default table
pub const DEFAULT_FRONTEND_UPSTREAM: &str = "http://frontend:80";

/// Headers that describe one connection and are never forwarded
pub const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Header list in arrival order
pub type Headers = Vec<(String, String)>;

/// One routing rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRule {
    /// Path prefix the rule matches
    pub prefix: String,
    /// Upstream base URL, e.g. `http://api:3000`
    pub upstream: String,
    /// Remove the prefix before forwarding
    #[serde(default)]
    pub strip_prefix: bool,
    /// Headers set on forwarded requests
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub set_headers: BTreeMap<String, String>,
}

impl RouteRule {
    pub fn new(prefix: &str, upstream: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            upstream: upstream.to_string(),
            strip_prefix: false,
            set_headers: BTreeMap::new(),
        }
    }

    pub fn strip_prefix(mut self) -> Self {
        self.strip_prefix = true;
        self
    }

    pub fn set_header(mut self, name: &str, value: &str) -> Self {
        self.set_headers.insert(name.to_string(), value.to_string());
        self
    }

    fn matches(&self, path: &str) -> bool {
        path.starts_with(&self.prefix)
    }
}

/// Where a request goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route<'a> {
    /// Rule that matched
    pub rule: &'a RouteRule,
    /// Path and query sent upstream
    pub path: String,
}

impl Route<'_> {
    /// Full upstream URL
    pub fn url(&self) -> String {
        format!("{}{}", self.rule.upstream.trim_end_matches('/'), self.path)
    }
}

/// Ordered routing table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RouteTable {
    rules: Vec<RouteRule>,
}

impl Default for RouteTable {
    fn default() -> Self {
        Self {
            rules: vec![
                RouteRule::new("/api/", DEFAULT_API_UPSTREAM).strip_prefix(),
                RouteRule::new("/", DEFAULT_FRONTEND_UPSTREAM),
            ],
        }
    }
}

impl RouteTable {
    /// Build a table, rejecting rules that could never work
    pub fn new(rules: Vec<RouteRule>) -> Result<Self> {
        let table = Self { rules };
        table.validate()?;
        Ok(table)
    }

    pub fn rules(&self) -> &[RouteRule] {
        &self.rules
    }

    pub fn validate(&self) -> Result<()> {
        if self.rules.is_empty() {
            return Err(RolloutError::InvalidConfig(
                "route table has no rules".to_string(),
            ));
        }
        for rule in &self.rules {
            if !rule.prefix.starts_with('/') {
                return Err(RolloutError::InvalidConfig(format!(
                    "route prefix '{}' must start with '/'",
                    rule.prefix
                )));
            }
            if !(rule.upstream.starts_with("http://") || rule.upstream.starts_with("https://")) {
                return Err(RolloutError::InvalidConfig(format!(
                    "upstream '{}' must be an http(s) URL",
                    rule.upstream
                )));
            }
        }
        Ok(())
    }

    /// Resolve a request target
    pub fn resolve(&self, path_and_query: &str) -> Option<Route<'_>> {
        let path = path_and_query
            .split_once('?')
            .map_or(path_and_query, |(p, _)| p);

        let rule = self.rules.iter().find(|r| r.matches(path))?;
        let forwarded = if rule.strip_prefix {
            let rest = &path_and_query[rule.prefix.len()..];
            if rest.starts_with('/') {
                rest.to_string()
            } else {
                format!("/{}", rest)
            }
        } else {
            path_and_query.to_string()
        };

        Some(Route {
            rule,
            path: forwarded,
        })
    }

    /// Location to redirect to when the path names a prefix without its
    /// trailing slash (`/api` for `/api/`)
    pub fn redirect_for(&self, path_and_query: &str) -> Option<String> {
        let (path, query) = match path_and_query.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (path_and_query, None),
        };
        let rule = self
            .rules
            .iter()
            .find(|r| r.prefix.len() > 1 && r.prefix.strip_suffix('/') == Some(path))?;
        Some(match query {
            Some(q) => format!("{}?{}", rule.prefix, q),
            None => rule.prefix.clone(),
        })
    }
}

fn is_hop_by_hop(name: &str, listed: &[String]) -> bool {
    let lower = name.to_ascii_lowercase();
    HOP_BY_HOP.contains(&lower.as_str()) || listed.iter().any(|l| *l == lower)
}

/// Headers for the upstream request
///
/// End-to-end headers, `Host` included, pass through unchanged. Hop-by-hop
/// headers and any header named in `Connection` are dropped. `X-Real-IP`
/// is set to the client address and the address is appended to
/// `X-Forwarded-For`.
pub fn forward_headers(original: &[(String, String)], client_ip: &str) -> Headers {
    let listed: Vec<String> = original
        .iter()
        .filter(|(name, _)| name.eq_ignore_ascii_case("connection"))
        .flat_map(|(_, value)| value.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect();

    let mut forwarded_for: Option<String> = None;
    let mut headers: Headers = Vec::with_capacity(original.len() + 2);

    for (name, value) in original {
        if is_hop_by_hop(name, &listed) || name.eq_ignore_ascii_case("x-real-ip") {
            continue;
        }
        if name.eq_ignore_ascii_case("x-forwarded-for") {
            forwarded_for = Some(match forwarded_for {
                Some(existing) => format!("{}, {}", existing, value.trim()),
                None => value.trim().to_string(),
            });
            continue;
        }
        headers.push((name.clone(), value.clone()));
    }

    headers.push(("X-Real-IP".to_string(), client_ip.to_string()));
    headers.push((
        "X-Forwarded-For".to_string(),
        match forwarded_for {
            Some(existing) if !existing.is_empty() => format!("{}, {}", existing, client_ip),
            _ => client_ip.to_string(),
        },
    ));
    headers
}

/// Apply a rule's header rewrites
pub fn rewrite_headers(headers: &mut Headers, rule: &RouteRule) {
    for (name, value) in &rule.set_headers {
        headers.retain(|(existing, _)| !existing.eq_ignore_ascii_case(name));
        headers.push((name.clone(), value.clone()));
    }
}

/// First value of a header
pub fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}
