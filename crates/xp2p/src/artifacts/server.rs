use serde_json::{json, Value};

use super::{
    load_document, object_mut, reverse_entries, routing_rules, splice_list, str_field, string_list,
    write_document, ConfigFiles, Document, TagSet,
};
use crate::domain::DIRECT_TAG;
use crate::forward;
use crate::redirect::{RedirectKind, RedirectRule};
use crate::store::ServerState;

pub const TROJAN_INBOUND_TAG: &str = "trojan-in";

/// Rewrites every server document from `state`. `before` names entries
/// that were managed previously and must be dropped if gone.
pub fn sync(files: &ConfigFiles, before: Option<&ServerState>, state: &ServerState) -> anyhow::Result<()> {
    let mut inbounds = load_document(&files.inbounds())?;
    render_inbounds(&mut inbounds, before, state);
    write_document(&files.inbounds(), &inbounds)?;

    let mut outbounds = load_document(&files.outbounds())?;
    render_outbounds(&mut outbounds);
    write_document(&files.outbounds(), &outbounds)?;

    let mut routing = load_document(&files.routing())?;
    render_routing(&mut routing, before, state);
    write_document(&files.routing(), &routing)?;

    files.ensure_logs()
}

pub fn render_inbounds(doc: &mut Document, before: Option<&ServerState>, state: &ServerState) {
    let mut owned: TagSet = std::iter::once(TROJAN_INBOUND_TAG).collect();
    for s in before.into_iter().chain(std::iter::once(state)) {
        for rule in &s.forward_rules {
            owned.insert(&rule.tag);
        }
    }

    let mut rebuilt = vec![trojan_inbound(state)];
    rebuilt.extend(forward::sorted(&state.forward_rules).iter().map(|r| r.inbound()));
    splice_list(doc, "inbounds", |v| owned.contains(str_field(v, "tag")), rebuilt, false);
}

fn trojan_inbound(state: &ServerState) -> Value {
    let clients: Vec<Value> = state
        .users
        .iter()
        .map(|u| json!({ "password": u.password, "email": u.id }))
        .collect();
    let stream = match &state.tls {
        Some(tls) => json!({
            "network": "tcp",
            "security": "tls",
            "tlsSettings": {
                "certificates": [{
                    "certificateFile": tls.cert_path,
                    "keyFile": tls.key_path,
                }],
            },
        }),
        None => json!({ "network": "tcp", "security": "none" }),
    };
    json!({
        "tag": TROJAN_INBOUND_TAG,
        "listen": "0.0.0.0",
        "port": state.port,
        "protocol": "trojan",
        "settings": { "clients": clients },
        "streamSettings": stream,
    })
}

pub fn render_outbounds(doc: &mut Document) {
    let has_direct = doc
        .get("outbounds")
        .and_then(Value::as_array)
        .is_some_and(|items| items.iter().any(|o| str_field(o, "tag") == DIRECT_TAG));
    if has_direct {
        return;
    }
    splice_list(
        doc,
        "outbounds",
        |_| false,
        vec![json!({ "protocol": "freedom", "settings": {}, "tag": DIRECT_TAG })],
        true,
    );
}

pub fn render_routing(doc: &mut Document, before: Option<&ServerState>, state: &ServerState) {
    let mut owned = TagSet::default();
    let mut redirects = TagSet::default();
    for s in before.into_iter().chain(std::iter::once(state)) {
        for (tag, channel) in &s.reverse_channels {
            owned.insert(tag);
            owned.insert(&channel.domain);
        }
        for rule in &s.server_redirects {
            redirects.insert(&redirect_key(rule.kind, &rule.value, &rule.outbound_tag));
        }
    }

    let mut rebuilt: Vec<Value> = state
        .reverse_channels
        .iter()
        .map(|(tag, channel)| {
            json!({
                "type": "field",
                "domain": [format!("full:{}", channel.domain)],
                "inboundTag": [tag],
                "outboundTag": tag,
                "user": [channel.user_id],
            })
        })
        .collect();
    rebuilt.extend(state.server_redirects.iter().map(redirect_rule));

    let routing = object_mut(doc, "routing");
    routing
        .entry("domainStrategy")
        .or_insert_with(|| Value::String("AsIs".to_string()));
    splice_list(
        routing,
        "rules",
        |rule| {
            targets_channel(rule, &owned)
                || redirect_rule_key(rule).is_some_and(|key| redirects.contains(&key))
        },
        rebuilt,
        false,
    );

    let portals: Vec<Value> = state
        .reverse_channels
        .iter()
        .map(|(tag, channel)| json!({ "domain": channel.domain, "tag": tag }))
        .collect();
    let reverse = object_mut(doc, "reverse");
    splice_list(
        reverse,
        "portals",
        |entry| owned.contains(str_field(entry, "tag")) || owned.contains(str_field(entry, "domain")),
        portals,
        true,
    );
    let empty = reverse
        .get("portals")
        .and_then(Value::as_array)
        .is_some_and(Vec::is_empty);
    if empty {
        reverse.remove("portals");
    }
    if reverse.is_empty() {
        doc.remove("reverse");
    }
}

pub(crate) fn redirect_rule(rule: &RedirectRule) -> Value {
    match rule.kind {
        RedirectKind::Domain => json!({
            "type": "field",
            "domains": [rule.value],
            "outboundTag": rule.outbound_tag,
        }),
        RedirectKind::Cidr => json!({
            "type": "field",
            "ip": [rule.value],
            "outboundTag": rule.outbound_tag,
        }),
    }
}

fn targets_channel(rule: &Value, owned: &TagSet) -> bool {
    if string_list(rule.get("inboundTag")).iter().any(|t| owned.contains(t)) {
        return true;
    }
    if owned.contains(str_field(rule, "outboundTag")) {
        return true;
    }
    string_list(rule.get("domain"))
        .iter()
        .filter_map(|d| d.trim().strip_prefix("full:"))
        .any(|d| owned.contains(d))
}

fn redirect_key(kind: RedirectKind, value: &str, outbound_tag: &str) -> String {
    format!("{}|{}|{}", kind.label(), value.trim(), outbound_tag.trim())
}

/// Key of a plain `{type, outboundTag, domains|ip}` rule with a single
/// match value and no inbound or user match.
fn redirect_rule_key(rule: &Value) -> Option<String> {
    if !str_field(rule, "type").eq_ignore_ascii_case("field") {
        return None;
    }
    let outbound = str_field(rule, "outboundTag");
    if outbound.is_empty()
        || !string_list(rule.get("inboundTag")).is_empty()
        || !string_list(rule.get("domain")).is_empty()
        || !string_list(rule.get("user")).is_empty()
    {
        return None;
    }
    let domains = string_list(rule.get("domains"));
    let ips = string_list(rule.get("ip"));
    match (domains.as_slice(), ips.as_slice()) {
        ([value], []) => Some(redirect_key(RedirectKind::Domain, value, outbound)),
        ([], [value]) => Some(redirect_key(RedirectKind::Cidr, value, outbound)),
        _ => None,
    }
}

/// One row of `server reverse list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerReverseRecord {
    pub tag: String,
    pub domain: String,
    pub host: String,
    pub user: String,
    pub portal: bool,
    pub routing_rule: bool,
}

pub fn reverse_records(routing: &Document, state: &ServerState) -> Vec<ServerReverseRecord> {
    let portals = reverse_entries(routing, "portals");
    let rules = routing_rules(routing);
    state
        .reverse_channels
        .iter()
        .map(|(tag, channel)| {
            let portal = portals
                .iter()
                .any(|(t, d)| t.eq_ignore_ascii_case(tag) && d.eq_ignore_ascii_case(&channel.domain));
            let routing_rule = rules.iter().any(|rule| {
                str_field(rule, "outboundTag").eq_ignore_ascii_case(tag)
                    && string_list(rule.get("inboundTag"))
                        .iter()
                        .any(|t| t.eq_ignore_ascii_case(tag))
            });
            ServerReverseRecord {
                tag: tag.clone(),
                domain: channel.domain.clone(),
                host: channel.host.clone(),
                user: channel.user_id.clone(),
                portal,
                routing_rule,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redirect::RedirectTarget;
    use crate::store::TlsMaterial;

    fn state() -> ServerState {
        let mut state = ServerState {
            host: "10.62.10.11".to_string(),
            port: 62022,
            tls: Some(TlsMaterial {
                cert_path: "/srv/xp2p/config-server/cert.pem".to_string(),
                key_path: "/srv/xp2p/config-server/key.pem".to_string(),
                self_signed: true,
                server_name: "10.62.10.11".to_string(),
            }),
            ..ServerState::default()
        };
        state.upsert_user("alice", "pw").expect("user");
        state.ensure_reverse_channel("alice", ".rev").expect("channel");
        state
    }

    #[test]
    fn inbounds_carry_users_and_certificates() {
        let mut doc = Document::new();
        render_inbounds(&mut doc, None, &state());
        let inbound = &doc["inbounds"][0];
        assert_eq!(inbound["protocol"], "trojan");
        assert_eq!(inbound["port"], 62022);
        assert_eq!(inbound["settings"]["clients"][0]["email"], "alice");
        assert_eq!(inbound["streamSettings"]["security"], "tls");
        assert_eq!(
            inbound["streamSettings"]["tlsSettings"]["certificates"][0]["keyFile"],
            "/srv/xp2p/config-server/key.pem"
        );
    }

    #[test]
    fn reverse_portal_and_rule_are_emitted_once() {
        let state = state();
        let mut doc = Document::new();
        render_routing(&mut doc, None, &state);
        render_routing(&mut doc, Some(&state), &state);

        let tag = "alice10-62-10-11.rev";
        let portals = doc["reverse"]["portals"].as_array().expect("portals");
        assert_eq!(portals.len(), 1);
        assert_eq!(portals[0]["tag"], tag);
        let rules = doc["routing"]["rules"].as_array().expect("rules");
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0]["domain"][0], format!("full:{tag}"));
        assert_eq!(rules[0]["user"][0], "alice");
        assert_eq!(doc["routing"]["domainStrategy"], "AsIs");
    }

    #[test]
    fn removed_channel_drops_portal_rules_and_redirects() {
        let before = state();
        let mut doc = Document::new();
        let mut with_redirect = before.clone();
        let binding = with_redirect.redirect_bindings()[0].clone();
        crate::redirect::add_rule(
            &mut with_redirect.server_redirects,
            &RedirectTarget::cidr("10.230.0.0/16").expect("cidr"),
            &binding,
        );
        render_routing(&mut doc, None, &with_redirect);
        assert_eq!(doc["routing"]["rules"].as_array().expect("rules").len(), 2);

        let mut after = with_redirect.clone();
        after.remove_reverse_channels_for("alice");
        after.server_redirects.clear();
        render_routing(&mut doc, Some(&with_redirect), &after);
        assert!(doc["routing"]["rules"].as_array().expect("rules").is_empty());
        assert!(doc.get("reverse").is_none());
    }

    #[test]
    fn operator_rules_survive() {
        let state = state();
        let mut doc = Document::new();
        doc.insert(
            "routing".to_string(),
            json!({"domainStrategy": "IPIfNonMatch", "rules": [
                {"type": "field", "inboundTag": ["api"], "outboundTag": "api"},
                {"type": "field", "ip": ["geoip:private"], "outboundTag": "blocked"},
                {"type": "field", "domains": ["ads.example.com"], "outboundTag": "blocked"}
            ]}),
        );
        render_routing(&mut doc, None, &state);
        render_routing(&mut doc, Some(&state), &state);
        let rules = doc["routing"]["rules"].as_array().expect("rules");
        assert_eq!(rules.len(), 4);
        assert_eq!(rules[1]["outboundTag"], "api");
        assert_eq!(rules[2]["ip"][0], "geoip:private");
        assert_eq!(rules[3]["domains"][0], "ads.example.com");
        assert_eq!(doc["routing"]["domainStrategy"], "IPIfNonMatch");
    }

    #[test]
    fn redirect_shape_detection() {
        let key = redirect_rule_key(&json!({"type": "field", "ip": ["10.0.0.0/8"], "outboundTag": "x"}));
        assert_eq!(key, Some(redirect_key(RedirectKind::Cidr, "10.0.0.0/8", "x")));
        assert!(redirect_rule_key(&json!({"type": "field", "ip": ["10.0.0.0/8"], "domains": ["a"], "outboundTag": "x"})).is_none());
        assert!(redirect_rule_key(&json!({"type": "field", "ip": ["10.0.0.0/8"], "inboundTag": ["i"], "outboundTag": "x"})).is_none());
        assert!(redirect_rule_key(&json!({"type": "field", "ip": ["10.0.0.0/8"], "user": ["u"], "outboundTag": "x"})).is_none());
    }

    #[test]
    fn records_report_missing_artifacts() {
        let state = state();
        let records = reverse_records(&Document::new(), &state);
        assert_eq!(records.len(), 1);
        assert!(!records[0].portal && !records[0].routing_rule);

        let mut doc = Document::new();
        render_routing(&mut doc, None, &state);
        let records = reverse_records(&doc, &state);
        assert!(records[0].portal && records[0].routing_rule);
    }

    #[test]
    fn outbounds_get_direct_once() {
        let mut doc = Document::new();
        render_outbounds(&mut doc);
        render_outbounds(&mut doc);
        let outbounds = doc["outbounds"].as_array().expect("outbounds");
        assert_eq!(outbounds.len(), 1);
        assert_eq!(outbounds[0]["protocol"], "freedom");
    }
}
