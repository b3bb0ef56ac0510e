use std::collections::BTreeSet;
use std::net::{IpAddr, SocketAddr, TcpListener, UdpSocket};

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::domain::{normalize_key, ForwardProtocol};
use crate::redirect::{RedirectKind, RedirectRule};

pub const DEFAULT_LISTEN_ADDRESS: &str = "127.0.0.1";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ForwardError {
    #[error("--target is required")]
    TargetRequired,
    #[error("invalid --target {0:?} (expected IP:PORT)")]
    InvalidTarget(String),
    #[error("invalid listen address {0:?}")]
    InvalidListen(String),
    #[error("listen port {port} is already used by forward rule {tag}")]
    PortTaken { port: u16, tag: String },
    #[error("listen port {port} is already in use on {address}")]
    PortBusy { port: u16, address: String },
    #[error("no free listen port at or above {0}")]
    Exhausted(u16),
    #[error("forward tag {0} already exists")]
    DuplicateTag(String),
    #[error("forward remark {0:?} already exists")]
    DuplicateRemark(String),
    #[error("--listen-port, --tag, or --remark is required")]
    SelectorRequired,
    #[error("forward rule not found")]
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardRule {
    pub listen_address: String,
    pub listen_port: u16,
    pub target_ip: String,
    pub target_port: u16,
    #[serde(default)]
    pub protocol: ForwardProtocol,
    pub tag: String,
    #[serde(default)]
    pub remark: String,
}

impl ForwardRule {
    /// dokodemo-door inbound forwarding `listen_port` to the target.
    pub fn inbound(&self) -> Value {
        let mut inbound = json!({
            "tag": self.tag,
            "listen": self.listen_address,
            "port": self.listen_port,
            "protocol": "dokodemo-door",
            "settings": {
                "address": self.target_ip,
                "port": self.target_port,
                "network": self.protocol.network(),
                "followRedirect": false,
            },
        });
        if !self.remark.is_empty() {
            inbound["remark"] = Value::String(self.remark.clone());
        }
        inbound
    }

    pub fn target(&self) -> String {
        match self.target_ip.parse::<IpAddr>() {
            Ok(IpAddr::V6(v6)) => format!("[{v6}]:{}", self.target_port),
            _ => format!("{}:{}", self.target_ip, self.target_port),
        }
    }
}

pub fn inbound_tag(port: u16) -> String {
    format!("in_{port}")
}

pub fn parse_target(raw: &str) -> Result<(IpAddr, u16), ForwardError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ForwardError::TargetRequired);
    }
    let addr: SocketAddr = trimmed
        .parse()
        .map_err(|_| ForwardError::InvalidTarget(trimmed.to_string()))?;
    if addr.port() == 0 {
        return Err(ForwardError::InvalidTarget(trimmed.to_string()));
    }
    Ok((addr.ip(), addr.port()))
}

/// Checks whether the OS would let us bind `port` for the protocol.
pub trait PortProbe {
    fn is_free(&self, address: IpAddr, port: u16, protocol: ForwardProtocol) -> bool;
}

pub struct SocketProbe;

impl PortProbe for SocketProbe {
    fn is_free(&self, address: IpAddr, port: u16, protocol: ForwardProtocol) -> bool {
        let addr = SocketAddr::new(address, port);
        if protocol.uses_tcp() && TcpListener::bind(addr).is_err() {
            return false;
        }
        if protocol.uses_udp() && UdpSocket::bind(addr).is_err() {
            return false;
        }
        true
    }
}

/// Request for a new forward rule; unset fields are derived.
#[derive(Debug, Clone, Default)]
pub struct ForwardRequest {
    pub target: String,
    pub listen_address: Option<String>,
    pub listen_port: Option<u16>,
    pub protocol: ForwardProtocol,
    pub tag: Option<String>,
    pub remark: Option<String>,
}

/// Selects rules by port, tag or remark; unset fields match anything.
#[derive(Debug, Clone, Default)]
pub struct ForwardSelector {
    pub listen_port: Option<u16>,
    pub tag: Option<String>,
    pub remark: Option<String>,
}

impl ForwardSelector {
    fn is_empty(&self) -> bool {
        self.listen_port.is_none()
            && self.tag.as_deref().map_or(true, |t| t.trim().is_empty())
            && self.remark.as_deref().map_or(true, |r| r.trim().is_empty())
    }

    fn matches(&self, rule: &ForwardRule) -> bool {
        if let Some(port) = self.listen_port {
            if rule.listen_port != port {
                return false;
            }
        }
        if let Some(tag) = self.tag.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            if normalize_key(&rule.tag) != normalize_key(tag) {
                return false;
            }
        }
        if let Some(remark) = self.remark.as_deref().map(str::trim).filter(|r| !r.is_empty()) {
            if rule.remark.trim() != remark {
                return false;
            }
        }
        true
    }
}

/// Builds the rule for `request`, allocating a port from `base` when none is given.
pub fn plan_rule(
    rules: &[ForwardRule],
    request: &ForwardRequest,
    base_port: u16,
    probe: &dyn PortProbe,
) -> Result<ForwardRule, ForwardError> {
    let (target_ip, target_port) = parse_target(&request.target)?;
    let listen_raw = request
        .listen_address
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_LISTEN_ADDRESS);
    let listen: IpAddr = listen_raw
        .parse()
        .map_err(|_| ForwardError::InvalidListen(listen_raw.to_string()))?;

    let listen_port = match request.listen_port {
        Some(port) => {
            if let Some(existing) = rules.iter().find(|r| r.listen_port == port) {
                return Err(ForwardError::PortTaken {
                    port,
                    tag: existing.tag.clone(),
                });
            }
            if !probe.is_free(listen, port, request.protocol) {
                return Err(ForwardError::PortBusy {
                    port,
                    address: listen.to_string(),
                });
            }
            port
        }
        None => allocate_port(rules, listen, base_port, request.protocol, probe)?,
    };

    let tag = request
        .tag
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| inbound_tag(listen_port));
    if rules.iter().any(|r| normalize_key(&r.tag) == normalize_key(&tag)) {
        return Err(ForwardError::DuplicateTag(tag));
    }

    let remark = request
        .remark
        .as_deref()
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("forward:{target_ip}:{target_port}"));
    if rules.iter().any(|r| r.remark == remark) {
        return Err(ForwardError::DuplicateRemark(remark));
    }

    Ok(ForwardRule {
        listen_address: listen.to_string(),
        listen_port,
        target_ip: target_ip.to_string(),
        target_port,
        protocol: request.protocol,
        tag,
        remark,
    })
}

/// Smallest free port at or above `base`. Successive adds get increasing
/// ports only while nothing is removed in between; a port freed by
/// `forward remove` is handed out again by the next add.
fn allocate_port(
    rules: &[ForwardRule],
    listen: IpAddr,
    base: u16,
    protocol: ForwardProtocol,
    probe: &dyn PortProbe,
) -> Result<u16, ForwardError> {
    let used: BTreeSet<u16> = rules.iter().map(|r| r.listen_port).collect();
    (base.max(1)..=u16::MAX)
        .find(|port| !used.contains(port) && probe.is_free(listen, *port, protocol))
        .ok_or(ForwardError::Exhausted(base))
}

pub fn remove_rules(rules: &mut Vec<ForwardRule>, selector: &ForwardSelector) -> Result<Vec<ForwardRule>, ForwardError> {
    if selector.is_empty() {
        return Err(ForwardError::SelectorRequired);
    }
    let (removed, kept): (Vec<_>, Vec<_>) = rules.drain(..).partition(|r| selector.matches(r));
    *rules = kept;
    if removed.is_empty() {
        return Err(ForwardError::NotFound);
    }
    Ok(removed)
}

/// Whether some CIDR redirect covers the forward target.
pub fn has_matching_redirect(redirects: &[RedirectRule], target_ip: &str) -> bool {
    let Ok(ip) = target_ip.parse::<IpAddr>() else {
        return false;
    };
    redirects
        .iter()
        .filter(|r| r.kind == RedirectKind::Cidr)
        .filter_map(|r| r.value.parse::<IpNet>().ok())
        .any(|net| net.contains(&ip))
}

pub fn sorted(rules: &[ForwardRule]) -> Vec<ForwardRule> {
    let mut out = rules.to_vec();
    out.sort_by_key(|r| r.listen_port);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubProbe(Vec<u16>);

    impl PortProbe for StubProbe {
        fn is_free(&self, _address: IpAddr, port: u16, _protocol: ForwardProtocol) -> bool {
            !self.0.contains(&port)
        }
    }

    fn request(target: &str) -> ForwardRequest {
        ForwardRequest {
            target: target.to_string(),
            ..ForwardRequest::default()
        }
    }

    #[test]
    fn allocation_starts_at_base_and_skips_used_ports() {
        let probe = StubProbe(vec![53332]);
        let mut rules = Vec::new();
        let first = plan_rule(&rules, &request("10.0.0.5:22"), 53331, &probe).expect("first");
        assert_eq!(first.listen_port, 53331);
        assert_eq!(first.tag, "in_53331");
        assert_eq!(first.remark, "forward:10.0.0.5:22");
        rules.push(first);

        let second = plan_rule(&rules, &request("10.0.0.6:22"), 53331, &probe).expect("second");
        assert_eq!(second.listen_port, 53333);
    }

    #[test]
    fn removed_port_is_reused_by_next_add() {
        let probe = StubProbe(Vec::new());
        let mut rules = Vec::new();
        for target in ["10.0.0.5:22", "10.0.0.6:22", "10.0.0.7:22"] {
            let rule = plan_rule(&rules, &request(target), 53331, &probe).expect("add");
            rules.push(rule);
        }
        let ports: Vec<u16> = rules.iter().map(|r| r.listen_port).collect();
        assert_eq!(ports, vec![53331, 53332, 53333]);

        let selector = ForwardSelector {
            listen_port: Some(53332),
            ..ForwardSelector::default()
        };
        remove_rules(&mut rules, &selector).expect("remove");

        let next = plan_rule(&rules, &request("10.0.0.8:22"), 53331, &probe).expect("re-add");
        assert_eq!(next.listen_port, 53332);
        assert_eq!(next.tag, "in_53332");
        rules.push(next);
        let after = plan_rule(&rules, &request("10.0.0.9:22"), 53331, &probe).expect("next");
        assert_eq!(after.listen_port, 53334);
    }

    #[test]
    fn explicit_port_conflicts() {
        let probe = StubProbe(vec![6000]);
        let mut req = request("10.0.0.5:22");
        req.listen_port = Some(6000);
        assert_eq!(
            plan_rule(&[], &req, 53331, &probe),
            Err(ForwardError::PortBusy {
                port: 6000,
                address: "127.0.0.1".to_string()
            })
        );
        assert_eq!(
            plan_rule(&[], &req, 53331, &probe).expect_err("busy").to_string(),
            "listen port 6000 is already in use on 127.0.0.1"
        );

        req.listen_port = Some(7000);
        let rule = plan_rule(&[], &req, 53331, &probe).expect("free");
        let err = plan_rule(&[rule], &req, 53331, &probe).expect_err("taken");
        assert!(matches!(err, ForwardError::PortTaken { port: 7000, .. }));
    }

    #[test]
    fn duplicate_remark_is_rejected() {
        let probe = StubProbe(vec![]);
        let rule = plan_rule(&[], &request("10.0.0.5:22"), 53331, &probe).expect("first");
        let err = plan_rule(&[rule], &request("10.0.0.5:22"), 53331, &probe).expect_err("dup");
        assert!(matches!(err, ForwardError::DuplicateRemark(_)));
    }

    #[test]
    fn target_must_be_ip_and_port() {
        assert!(matches!(parse_target(""), Err(ForwardError::TargetRequired)));
        assert!(matches!(parse_target("host:22"), Err(ForwardError::InvalidTarget(_))));
        assert!(matches!(parse_target("10.0.0.1"), Err(ForwardError::InvalidTarget(_))));
        assert_eq!(
            parse_target("10.0.0.1:8080").expect("ok"),
            ("10.0.0.1".parse().expect("ip"), 8080)
        );
    }

    #[test]
    fn inbound_shape_matches_dokodemo() {
        let probe = StubProbe(vec![]);
        let mut req = request("10.0.0.5:53");
        req.protocol = ForwardProtocol::Both;
        let rule = plan_rule(&[], &req, 53331, &probe).expect("rule");
        let inbound = rule.inbound();
        assert_eq!(inbound["protocol"], "dokodemo-door");
        assert_eq!(inbound["port"], 53331);
        assert_eq!(inbound["settings"]["network"], "tcp,udp");
        assert_eq!(inbound["settings"]["followRedirect"], false);
        assert_eq!(inbound["remark"], "forward:10.0.0.5:53");
    }

    #[test]
    fn remove_by_selector() {
        let probe = StubProbe(vec![]);
        let mut rules = vec![plan_rule(&[], &request("10.0.0.5:22"), 53331, &probe).expect("rule")];
        assert_eq!(
            remove_rules(&mut rules, &ForwardSelector::default()),
            Err(ForwardError::SelectorRequired)
        );
        let by_port = ForwardSelector {
            listen_port: Some(1),
            ..ForwardSelector::default()
        };
        assert_eq!(remove_rules(&mut rules, &by_port), Err(ForwardError::NotFound));
        let by_tag = ForwardSelector {
            tag: Some("IN_53331".to_string()),
            ..ForwardSelector::default()
        };
        assert_eq!(remove_rules(&mut rules, &by_tag).expect("removed").len(), 1);
        assert!(rules.is_empty());
    }

    #[test]
    fn redirect_coverage_check() {
        let redirects = vec![
            RedirectRule::new(RedirectKind::Cidr, "10.230.0.0/16", "proxy-a"),
            RedirectRule::new(RedirectKind::Domain, "corp.example", "proxy-a"),
        ];
        assert!(has_matching_redirect(&redirects, "10.230.4.5"));
        assert!(!has_matching_redirect(&redirects, "10.231.0.1"));
    }
}
