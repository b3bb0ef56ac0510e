use std::net::IpAddr;

use serde_json::{json, Value};

use super::server::redirect_rule;
use super::{
    load_document, object_mut, reverse_entries, routing_rules, splice_list, str_field, string_list,
    write_document, ConfigFiles, Document, TagSet,
};
use crate::domain::{is_proxy_tag, DIRECT_TAG};
use crate::endpoint::Endpoint;
use crate::forward;
use crate::store::ClientState;

pub const SOCKS_INBOUND_TAG: &str = "socks-in";
pub const DIAG_INBOUND_TAG: &str = "diag-in";
const LOOPBACK: &str = "127.0.0.1";

/// Local ports of the fixed client inbounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientPorts {
    pub socks: u16,
    pub diag: u16,
}

pub fn sync(
    files: &ConfigFiles,
    ports: ClientPorts,
    before: Option<&ClientState>,
    state: &ClientState,
) -> anyhow::Result<()> {
    let mut inbounds = load_document(&files.inbounds())?;
    render_inbounds(&mut inbounds, ports, before, state);
    write_document(&files.inbounds(), &inbounds)?;

    let mut outbounds = load_document(&files.outbounds())?;
    render_outbounds(&mut outbounds, before, state);
    write_document(&files.outbounds(), &outbounds)?;

    let mut routing = load_document(&files.routing())?;
    render_routing(&mut routing, before, state);
    write_document(&files.routing(), &routing)?;

    files.ensure_logs()
}

fn states<'a>(before: Option<&'a ClientState>, state: &'a ClientState) -> impl Iterator<Item = &'a ClientState> {
    before.into_iter().chain(std::iter::once(state))
}

pub fn render_inbounds(doc: &mut Document, ports: ClientPorts, before: Option<&ClientState>, state: &ClientState) {
    let mut owned: TagSet = [SOCKS_INBOUND_TAG, DIAG_INBOUND_TAG].into_iter().collect();
    for s in states(before, state) {
        for rule in &s.forwards {
            owned.insert(&rule.tag);
        }
    }

    let diag_target = state
        .endpoints
        .first()
        .map(|ep| ep.address.as_str())
        .unwrap_or(LOOPBACK);
    let mut rebuilt = vec![
        json!({
            "tag": SOCKS_INBOUND_TAG,
            "listen": LOOPBACK,
            "port": ports.socks,
            "protocol": "socks",
            "settings": { "auth": "noauth", "udp": true, "ip": LOOPBACK },
            "sniffing": { "enabled": true, "destOverride": ["http", "tls"] },
        }),
        json!({
            "tag": DIAG_INBOUND_TAG,
            "listen": LOOPBACK,
            "port": ports.diag,
            "protocol": "dokodemo-door",
            "settings": {
                "address": diag_target,
                "port": ports.diag,
                "network": "tcp,udp",
                "followRedirect": false,
            },
        }),
    ];
    rebuilt.extend(forward::sorted(&state.forwards).iter().map(|r| r.inbound()));
    splice_list(doc, "inbounds", |v| owned.contains(str_field(v, "tag")), rebuilt, false);
}

pub fn trojan_outbound(ep: &Endpoint) -> Value {
    json!({
        "protocol": "trojan",
        "settings": {
            "servers": [{
                "address": ep.address,
                "port": ep.port,
                "password": ep.password,
                "email": ep.user,
            }],
        },
        "streamSettings": {
            "network": "tcp",
            "security": "tls",
            "tlsSettings": {
                "allowInsecure": ep.allow_insecure,
                "serverName": ep.server_name,
            },
        },
        "tag": ep.tag,
    })
}

pub fn render_outbounds(doc: &mut Document, before: Option<&ClientState>, state: &ClientState) {
    let mut owned: TagSet = std::iter::once(DIRECT_TAG).collect();
    for s in states(before, state) {
        for ep in &s.endpoints {
            owned.insert(&ep.tag);
        }
    }
    let is_owned = |v: &Value| {
        let tag = str_field(v, "tag");
        owned.contains(tag) || is_proxy_tag(tag)
    };

    let rebuilt: Vec<Value> = state.endpoints.iter().map(trojan_outbound).collect();
    splice_list(doc, "outbounds", is_owned, rebuilt, false);
    splice_list(
        doc,
        "outbounds",
        |_| false,
        vec![json!({
            "protocol": "freedom",
            "settings": { "domainStrategy": "UseIP" },
            "tag": DIRECT_TAG,
        })],
        true,
    );
}

fn endpoint_rule(ep: &Endpoint) -> Value {
    match ep.address.parse::<IpAddr>() {
        Ok(_) => json!({ "type": "field", "ip": [ep.address], "outboundTag": ep.tag }),
        Err(_) => json!({
            "type": "field",
            "domain": [format!("full:{}", ep.address)],
            "outboundTag": ep.tag,
        }),
    }
}

pub fn render_routing(doc: &mut Document, before: Option<&ClientState>, state: &ClientState) {
    let mut outbound_owned = TagSet::default();
    let mut reverse_owned = TagSet::default();
    for s in states(before, state) {
        for ep in &s.endpoints {
            outbound_owned.insert(&ep.tag);
        }
        for rule in &s.redirects {
            outbound_owned.insert(&rule.outbound_tag);
        }
        for (tag, channel) in &s.reverse {
            reverse_owned.insert(tag);
            reverse_owned.insert(&channel.tag);
        }
    }
    let is_owned = |rule: &Value| {
        let outbound = str_field(rule, "outboundTag");
        outbound_owned.contains(outbound)
            || is_proxy_tag(outbound)
            || string_list(rule.get("inboundTag"))
                .iter()
                .any(|t| reverse_owned.contains(t))
    };

    let mut rebuilt = Vec::new();
    for channel in state.reverse.values() {
        rebuilt.push(json!({
            "type": "field",
            "domain": [format!("full:{}", channel.domain)],
            "inboundTag": [channel.tag],
            "outboundTag": channel.endpoint_tag,
        }));
        rebuilt.push(json!({
            "type": "field",
            "inboundTag": [channel.tag],
            "outboundTag": DIRECT_TAG,
        }));
    }
    rebuilt.extend(state.redirects.iter().map(redirect_rule));
    rebuilt.extend(state.endpoints.iter().map(endpoint_rule));

    let routing = object_mut(doc, "routing");
    let strategy_missing = routing
        .get("domainStrategy")
        .and_then(Value::as_str)
        .map_or(true, |s| s.trim().is_empty());
    if strategy_missing {
        routing.insert("domainStrategy".to_string(), Value::String("IPOnDemand".to_string()));
    }
    splice_list(routing, "rules", is_owned, rebuilt, false);

    let bridges: Vec<Value> = state
        .reverse
        .values()
        .map(|ch| json!({ "domain": ch.domain, "tag": ch.tag }))
        .collect();
    let reverse = object_mut(doc, "reverse");
    splice_list(
        reverse,
        "bridges",
        |entry| reverse_owned.contains(str_field(entry, "tag")),
        bridges,
        true,
    );
    let empty = reverse
        .get("bridges")
        .and_then(Value::as_array)
        .is_some_and(Vec::is_empty);
    if empty {
        reverse.remove("bridges");
    }
    if reverse.is_empty() {
        doc.remove("reverse");
    }
}

/// One row of `client reverse list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientReverseRecord {
    pub tag: String,
    pub host: String,
    pub user: String,
    pub endpoint_tag: String,
    pub bridge: bool,
    pub direct_rule: bool,
}

pub fn reverse_records(routing: &Document, state: &ClientState) -> Vec<ClientReverseRecord> {
    let bridges = reverse_entries(routing, "bridges");
    let rules = routing_rules(routing);
    state
        .reverse
        .values()
        .map(|channel| {
            let bridge = bridges.iter().any(|(t, _)| t.eq_ignore_ascii_case(&channel.tag));
            let direct_rule = rules.iter().any(|rule| {
                str_field(rule, "outboundTag") == DIRECT_TAG
                    && string_list(rule.get("inboundTag"))
                        .iter()
                        .any(|t| t.eq_ignore_ascii_case(&channel.tag))
            });
            ClientReverseRecord {
                tag: channel.tag.clone(),
                host: channel.host.clone(),
                user: channel.user_id.clone(),
                endpoint_tag: channel.endpoint_tag.clone(),
                bridge,
                direct_rule,
            }
        })
        .collect()
}

/// SOCKS inbound address from an existing inbounds document.
pub fn socks_address(inbounds: &Document) -> Option<String> {
    inbounds
        .get("inbounds")?
        .as_array()?
        .iter()
        .find(|v| str_field(v, "protocol").eq_ignore_ascii_case("socks"))
        .and_then(|v| {
            let port = v.get("port")?.as_u64()?;
            let listen = match str_field(v, "listen") {
                "" | "0.0.0.0" => LOOPBACK,
                other => other,
            };
            Some(format!("{listen}:{port}"))
        })
}
