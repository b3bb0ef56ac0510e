use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_REVERSE_SUFFIX: &str = ".rev";
pub const DIRECT_TAG: &str = "direct";
const PROXY_TAG_PREFIX: &str = "proxy-";

static HOST_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?$").expect("host label regex"));

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("host is empty")]
    EmptyHost,
    #[error("host exceeds 253 characters")]
    HostTooLong,
    #[error("invalid IPv4 address {0:?}")]
    InvalidIpv4(String),
    #[error("invalid host {host:?}: {reason}")]
    InvalidHost { host: String, reason: String },
    #[error("unable to derive reverse identifier from {user:?}/{host:?}")]
    ReverseIdentity { user: String, host: String },
    #[error("unsupported protocol {0:?} (expected tcp, udp or both)")]
    InvalidProtocol(String),
    #[error("invalid port {0:?}")]
    InvalidPort(String),
    #[error("unknown role {0:?}")]
    InvalidRole(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Client,
    Server,
}

impl Role {
    pub const ALL: [Role; 2] = [Role::Client, Role::Server];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Server => "server",
        }
    }

    pub fn state_file_name(self) -> String {
        format!("install-state-{}.json", self.as_str())
    }

    pub fn default_config_dir(self) -> &'static str {
        match self {
            Self::Client => "config-client",
            Self::Server => "config-server",
        }
    }

    pub fn error_log_name(self) -> String {
        format!("{}.err", self.as_str())
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "client" => Ok(Self::Client),
            "server" => Ok(Self::Server),
            other => Err(DomainError::InvalidRole(other.to_string())),
        }
    }
}

/// Lowercases the value, keeps `[a-z0-9]` and folds every other run of
/// characters into a single `-`, trimming dashes at both ends.
pub fn sanitize_label(value: &str) -> String {
    let lowered = value.trim().to_lowercase();
    let mut out = String::with_capacity(lowered.len());
    let mut last_dash = false;
    for ch in lowered.chars() {
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() {
            out.push(ch);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    out.trim_matches('-').to_string()
}

/// Outbound tag assigned to a client endpoint.
pub fn proxy_tag(host: &str) -> String {
    let label = sanitize_label(host);
    if label.is_empty() {
        format!("{PROXY_TAG_PREFIX}endpoint")
    } else {
        format!("{PROXY_TAG_PREFIX}{label}")
    }
}

pub fn is_proxy_tag(tag: &str) -> bool {
    tag.trim().to_ascii_lowercase().starts_with(PROXY_TAG_PREFIX)
}

/// Shared reverse channel identifier for a (user, host) pair.
pub fn reverse_tag(user: &str, host: &str, suffix: &str) -> Result<String, DomainError> {
    let user_label = sanitize_label(user);
    let host_label = sanitize_label(host);
    if user_label.is_empty() || host_label.is_empty() {
        return Err(DomainError::ReverseIdentity {
            user: user.trim().to_string(),
            host: host.trim().to_string(),
        });
    }
    Ok(format!("{user_label}{host_label}{suffix}"))
}

pub fn normalize_key(value: &str) -> String {
    value.trim().to_lowercase()
}

/// Accepts IPv4/IPv6 literals and DNS host names (optionally fully qualified).
pub fn validate_host(value: &str) -> Result<(), DomainError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(DomainError::EmptyHost);
    }
    if trimmed.parse::<IpAddr>().is_ok() {
        return Ok(());
    }
    if trimmed.len() > 253 {
        return Err(DomainError::HostTooLong);
    }
    if looks_like_ipv4(trimmed) {
        return Err(DomainError::InvalidIpv4(trimmed.to_string()));
    }

    let host = trimmed.strip_suffix('.').unwrap_or(trimmed);
    if host.is_empty() {
        return Err(DomainError::InvalidHost {
            host: trimmed.to_string(),
            reason: "empty label".to_string(),
        });
    }
    for label in host.split('.') {
        if !HOST_LABEL.is_match(label) {
            return Err(DomainError::InvalidHost {
                host: trimmed.to_string(),
                reason: format!("invalid label {label:?}"),
            });
        }
    }
    Ok(())
}

fn looks_like_ipv4(value: &str) -> bool {
    let parts: Vec<&str> = value.split('.').collect();
    parts.len() == 4
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}

pub fn parse_port(raw: &str) -> Result<u16, DomainError> {
    match raw.trim().parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(DomainError::InvalidPort(raw.trim().to_string())),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForwardProtocol {
    #[default]
    Tcp,
    Udp,
    Both,
}

impl ForwardProtocol {
    /// Value of the dokodemo-door `network` setting.
    pub fn network(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Both => "tcp,udp",
        }
    }

    pub fn uses_tcp(self) -> bool {
        matches!(self, Self::Tcp | Self::Both)
    }

    pub fn uses_udp(self) -> bool {
        matches!(self, Self::Udp | Self::Both)
    }
}

impl fmt::Display for ForwardProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Both => "both",
        })
    }
}

impl FromStr for ForwardProtocol {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            "both" | "tcp,udp" => Ok(Self::Both),
            other => Err(DomainError::InvalidProtocol(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_folds_separators() {
        assert_eq!(sanitize_label("Example.COM"), "example-com");
        assert_eq!(sanitize_label("  Mixed--Value  "), "mixed-value");
        assert_eq!(sanitize_label("UPPER_lower-123"), "upper-lower-123");
        assert_eq!(sanitize_label("Symbols!*&"), "symbols");
        assert_eq!(sanitize_label("..dots..and::colons"), "dots-and-colons");
        assert_eq!(sanitize_label("***"), "");
    }

    #[test]
    fn proxy_tag_for_ip_and_empty_host() {
        assert_eq!(proxy_tag("10.62.10.11"), "proxy-10-62-10-11");
        assert_eq!(proxy_tag("Edge.Example.org"), "proxy-edge-example-org");
        assert_eq!(proxy_tag("!!"), "proxy-endpoint");
        assert!(is_proxy_tag("PROXY-foo"));
        assert!(!is_proxy_tag("direct"));
    }

    #[test]
    fn reverse_tag_concatenates_sanitized_parts() {
        let tag = reverse_tag("client-abc@xp2p.local", "10.62.10.11", ".rev").expect("tag");
        assert_eq!(tag, "client-abc-xp2p-local10-62-10-11.rev");
    }

    #[test]
    fn reverse_tag_rejects_empty_parts() {
        let err = reverse_tag("  ", "host", ".rev").expect_err("must fail");
        assert!(matches!(err, DomainError::ReverseIdentity { .. }));
        assert!(reverse_tag("user", "--", ".rev").is_err());
    }

    #[test]
    fn validate_host_accepts_ips_and_names() {
        validate_host("10.62.10.11").expect("ipv4");
        validate_host("::1").expect("ipv6");
        validate_host("edge-1.example.org.").expect("fqdn");
    }

    #[test]
    fn validate_host_rejects_garbage() {
        assert_eq!(validate_host(" "), Err(DomainError::EmptyHost));
        assert!(matches!(
            validate_host("10.999.0.1"),
            Err(DomainError::InvalidIpv4(_))
        ));
        assert!(matches!(
            validate_host("-bad.example"),
            Err(DomainError::InvalidHost { .. })
        ));
        assert!(matches!(
            validate_host("under_score.example"),
            Err(DomainError::InvalidHost { .. })
        ));
    }

    #[test]
    fn host_label_length_limit() {
        let longest = "a".repeat(63);
        let too_long = "a".repeat(64);
        assert!(HOST_LABEL.is_match(&longest));
        assert!(!HOST_LABEL.is_match(&too_long));
        for _ in 0..3 {
            validate_host(&format!("{longest}.example")).expect("63-char label");
            assert!(matches!(
                validate_host(&format!("{too_long}.example")),
                Err(DomainError::InvalidHost { .. })
            ));
        }
    }

    #[test]
    fn protocol_parsing_and_network() {
        assert_eq!("both".parse::<ForwardProtocol>().expect("both").network(), "tcp,udp");
        assert_eq!("UDP".parse::<ForwardProtocol>().expect("udp"), ForwardProtocol::Udp);
        assert!("sctp".parse::<ForwardProtocol>().is_err());
    }

    #[test]
    fn role_round_trip_names() {
        assert_eq!("Server".parse::<Role>().expect("role"), Role::Server);
        assert_eq!(Role::Client.state_file_name(), "install-state-client.json");
        assert!("proxy".parse::<Role>().is_err());
    }
}
