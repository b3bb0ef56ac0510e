//! Domain and CIDR redirect rules and the outbound they are bound to.

use std::fmt;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{normalize_key, Role};
use crate::store::{ClientState, ServerState};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RedirectError {
    #[error("invalid CIDR \"{0}\"")]
    InvalidCidr(String),
    #[error("invalid domain \"{0}\"")]
    InvalidDomain(String),
    #[error("--cidr or --domain is required")]
    TargetRequired,
    #[error("specify only one of --cidr or --domain")]
    TargetConflict,
    #[error("--tag or --host is required")]
    SelectorRequired,
    #[error("unknown outbound tag \"{0}\"")]
    UnknownTag(String),
    #[error("client endpoint \"{0}\" not found")]
    EndpointNotFound(String),
    #[error("reverse portal host \"{0}\" not found")]
    PortalNotFound(String),
    #[error("tag does not match host")]
    TagHostMismatch,
    #[error("no reverse portals configured")]
    NoPortals,
    #[error("no redirect rules configured")]
    NoneConfigured,
    #[error("redirect {0} not found")]
    NotFound(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedirectKind {
    Cidr,
    Domain,
}

impl RedirectKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Cidr => "CIDR",
            Self::Domain => "domain",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectRule {
    pub kind: RedirectKind,
    pub value: String,
    pub outbound_tag: String,
    #[serde(default)]
    pub host: String,
}

impl RedirectRule {
    pub fn new(kind: RedirectKind, value: &str, outbound_tag: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
            outbound_tag: outbound_tag.to_string(),
            host: String::new(),
        }
    }

    fn same_target(&self, other: &RedirectTarget) -> bool {
        self.kind == other.kind && self.value == other.value
    }
}

/// A validated `--cidr` or `--domain` argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectTarget {
    pub kind: RedirectKind,
    pub value: String,
}

impl RedirectTarget {
    pub fn from_flags(cidr: Option<&str>, domain: Option<&str>) -> Result<Self, RedirectError> {
        let cidr = cidr.map(str::trim).filter(|v| !v.is_empty());
        let domain = domain.map(str::trim).filter(|v| !v.is_empty());
        match (cidr, domain) {
            (Some(_), Some(_)) => Err(RedirectError::TargetConflict),
            (Some(c), None) => Self::cidr(c),
            (None, Some(d)) => Self::domain(d),
            (None, None) => Err(RedirectError::TargetRequired),
        }
    }

    /// Normalizes to the network address, e.g. `10.1.2.3/16` becomes `10.1.0.0/16`.
    pub fn cidr(raw: &str) -> Result<Self, RedirectError> {
        let net: IpNet = raw
            .trim()
            .parse()
            .map_err(|_| RedirectError::InvalidCidr(raw.trim().to_string()))?;
        Ok(Self {
            kind: RedirectKind::Cidr,
            value: net.trunc().to_string(),
        })
    }

    pub fn domain(raw: &str) -> Result<Self, RedirectError> {
        let value = raw.trim().trim_end_matches('.').to_lowercase();
        let valid = !value.is_empty()
            && value.len() <= 253
            && !value.contains(char::is_whitespace)
            && !value.contains('/')
            && !value.starts_with('.');
        if !valid {
            return Err(RedirectError::InvalidDomain(raw.trim().to_string()));
        }
        Ok(Self {
            kind: RedirectKind::Domain,
            value,
        })
    }
}

impl fmt::Display for RedirectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            RedirectKind::Cidr => write!(f, "cidr {}", self.value),
            RedirectKind::Domain => write!(f, "domain {}", self.value),
        }
    }
}

/// An outbound a redirect may point at: a client endpoint or a server portal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundBinding {
    pub tag: String,
    pub host: String,
}

/// Resolves `--tag`/`--host` against the role's known outbounds.
pub fn resolve_binding(
    role: Role,
    bindings: &[OutboundBinding],
    tag: Option<&str>,
    host: Option<&str>,
) -> Result<OutboundBinding, RedirectError> {
    let tag = tag.map(str::trim).filter(|v| !v.is_empty());
    let host = host.map(str::trim).filter(|v| !v.is_empty());

    let by_tag = match tag {
        Some(t) => Some(
            bindings
                .iter()
                .find(|b| normalize_key(&b.tag) == normalize_key(t))
                .ok_or_else(|| RedirectError::UnknownTag(t.to_string()))?,
        ),
        None => None,
    };
    let by_host = match host {
        Some(h) => Some(
            bindings
                .iter()
                .find(|b| normalize_key(&b.host) == normalize_key(h))
                .ok_or_else(|| match role {
                    Role::Client => RedirectError::EndpointNotFound(h.to_string()),
                    Role::Server => RedirectError::PortalNotFound(h.to_string()),
                })?,
        ),
        None => None,
    };

    match (by_tag, by_host) {
        (Some(t), Some(h)) if t.tag != h.tag => Err(RedirectError::TagHostMismatch),
        (Some(b), _) | (None, Some(b)) => Ok(b.clone()),
        (None, None) => Err(RedirectError::SelectorRequired),
    }
}

/// Appends the rule unless an identical one exists. Returns whether it was added.
pub fn add_rule(rules: &mut Vec<RedirectRule>, target: &RedirectTarget, binding: &OutboundBinding) -> bool {
    if rules
        .iter()
        .any(|r| r.same_target(target) && normalize_key(&r.outbound_tag) == normalize_key(&binding.tag))
    {
        return false;
    }
    rules.push(RedirectRule {
        kind: target.kind,
        value: target.value.clone(),
        outbound_tag: binding.tag.clone(),
        host: binding.host.clone(),
    });
    true
}

/// Removes rules matching the target, narrowed by `tag` when given.
pub fn remove_rules(
    rules: &mut Vec<RedirectRule>,
    target: &RedirectTarget,
    tag: Option<&str>,
) -> Result<Vec<RedirectRule>, RedirectError> {
    if rules.is_empty() {
        return Err(RedirectError::NoneConfigured);
    }
    let tag = tag.map(normalize_key).filter(|t| !t.is_empty());
    let (removed, kept): (Vec<_>, Vec<_>) = rules.drain(..).partition(|r| {
        r.same_target(target)
            && tag
                .as_deref()
                .map_or(true, |t| normalize_key(&r.outbound_tag) == t)
    });
    *rules = kept;
    if removed.is_empty() {
        let mut label = target.to_string();
        if let Some(t) = tag {
            label.push_str(&format!(" via {t}"));
        }
        return Err(RedirectError::NotFound(label));
    }
    Ok(removed)
}

/// One row of `redirect list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectRecord {
    pub kind: RedirectKind,
    pub value: String,
    pub tag: String,
    pub host: String,
}

fn records(rules: impl IntoIterator<Item = RedirectRecord>) -> Vec<RedirectRecord> {
    let mut out: Vec<RedirectRecord> = rules.into_iter().collect();
    out.sort_by(|a, b| {
        (a.kind, &a.value, &a.tag, &a.host).cmp(&(b.kind, &b.value, &b.tag, &b.host))
    });
    out.dedup();
    out
}

fn record_of(rule: &RedirectRule) -> RedirectRecord {
    RedirectRecord {
        kind: rule.kind,
        value: rule.value.clone(),
        tag: rule.outbound_tag.clone(),
        host: rule.host.clone(),
    }
}

impl ClientState {
    pub fn redirect_bindings(&self) -> Vec<OutboundBinding> {
        self.endpoints
            .iter()
            .map(|ep| OutboundBinding {
                tag: ep.tag.clone(),
                host: ep.hostname.clone(),
            })
            .collect()
    }

    /// Configured redirects plus the implicit host route of every endpoint.
    pub fn redirect_records(&self) -> Vec<RedirectRecord> {
        let implicit = self.endpoints.iter().filter_map(|ep| {
            let ip: std::net::IpAddr = ep.address.parse().ok()?;
            Some(RedirectRecord {
                kind: RedirectKind::Cidr,
                value: IpNet::from(ip).to_string(),
                tag: ep.tag.clone(),
                host: ep.hostname.clone(),
            })
        });
        records(self.redirects.iter().map(record_of).chain(implicit))
    }
}

impl ServerState {
    pub fn redirect_bindings(&self) -> Vec<OutboundBinding> {
        self.reverse_channels
            .iter()
            .map(|(tag, ch)| OutboundBinding {
                tag: tag.clone(),
                host: ch.host.clone(),
            })
            .collect()
    }

    pub fn redirect_records(&self) -> Vec<RedirectRecord> {
        records(self.server_redirects.iter().map(record_of))
    }
}
