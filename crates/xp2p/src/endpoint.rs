use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{normalize_key, proxy_tag};
use crate::store::ClientState;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EndpointError {
    #[error("endpoint {0} already exists (use --force to update)")]
    AlreadyExists(String),
    #[error("outbound tag {tag} is already assigned to {host}")]
    TagConflict { tag: String, host: String },
    #[error("client endpoint \"{0}\" not found")]
    NotFound(String),
}

/// A trojan server this client tunnels through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub hostname: String,
    pub tag: String,
    pub address: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub server_name: String,
    #[serde(default)]
    pub allow_insecure: bool,
}

impl Endpoint {
    pub fn new(
        address: &str,
        port: u16,
        user: &str,
        password: &str,
        server_name: Option<&str>,
        allow_insecure: bool,
    ) -> Self {
        let address = address.trim().to_string();
        let server_name = server_name
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(&address)
            .to_string();
        Self {
            hostname: address.clone(),
            tag: proxy_tag(&address),
            address,
            port,
            user: user.trim().to_string(),
            password: password.trim().to_string(),
            server_name,
            allow_insecure,
        }
    }

    pub fn matches(&self, target: &str) -> bool {
        let key = normalize_key(target);
        normalize_key(&self.hostname) == key || normalize_key(&self.tag) == key
    }
}

impl ClientState {
    /// Inserts or (with `force`) replaces the endpoint keyed by hostname.
    /// Returns the replaced endpoint, if any.
    pub fn upsert_endpoint(
        &mut self,
        endpoint: Endpoint,
        force: bool,
    ) -> Result<Option<Endpoint>, EndpointError> {
        let host_key = normalize_key(&endpoint.hostname);
        let tag_key = normalize_key(&endpoint.tag);

        if let Some(owner) = self.endpoints.iter().find(|ep| {
            normalize_key(&ep.tag) == tag_key && normalize_key(&ep.hostname) != host_key
        }) {
            return Err(EndpointError::TagConflict {
                tag: endpoint.tag.clone(),
                host: owner.hostname.clone(),
            });
        }

        match self
            .endpoints
            .iter()
            .position(|ep| normalize_key(&ep.hostname) == host_key)
        {
            Some(_) if !force => Err(EndpointError::AlreadyExists(endpoint.hostname)),
            Some(idx) => Ok(Some(std::mem::replace(&mut self.endpoints[idx], endpoint))),
            None => {
                self.endpoints.push(endpoint);
                Ok(None)
            }
        }
    }

    /// Drops the endpoint matching hostname or tag together with the
    /// redirects and reverse channels routed through it.
    pub fn remove_endpoint(&mut self, target: &str) -> Result<Endpoint, EndpointError> {
        let idx = self
            .endpoints
            .iter()
            .position(|ep| ep.matches(target))
            .ok_or_else(|| EndpointError::NotFound(target.trim().to_string()))?;
        let removed = self.endpoints.remove(idx);
        let tag_key = normalize_key(&removed.tag);
        self.redirects
            .retain(|rule| normalize_key(&rule.outbound_tag) != tag_key);
        self.reverse
            .retain(|_, channel| normalize_key(&channel.endpoint_tag) != tag_key);
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redirect::{RedirectKind, RedirectRule};
    use crate::reverse::ClientReverseChannel;

    fn endpoint(host: &str, password: &str) -> Endpoint {
        Endpoint::new(host, 62022, "alice", password, None, true)
    }

    #[test]
    fn new_endpoint_derives_tag_and_server_name() {
        let ep = endpoint("10.62.10.11", "secret");
        assert_eq!(ep.tag, "proxy-10-62-10-11");
        assert_eq!(ep.server_name, "10.62.10.11");
        let named = Endpoint::new("edge.example.org", 443, "bob", "pw", Some("cdn.example.org"), false);
        assert_eq!(named.server_name, "cdn.example.org");
    }

    #[test]
    fn duplicate_host_requires_force() {
        let mut state = ClientState::default();
        state.upsert_endpoint(endpoint("10.62.10.11", "a"), false).expect("insert");
        let err = state
            .upsert_endpoint(endpoint("10.62.10.11", "b"), false)
            .expect_err("duplicate");
        assert!(err.to_string().contains("endpoint 10.62.10.11 already exists"));

        let replaced = state
            .upsert_endpoint(endpoint("10.62.10.11", "b"), true)
            .expect("forced");
        assert_eq!(replaced.expect("previous").password, "a");
        assert_eq!(state.endpoints.len(), 1);
        assert_eq!(state.endpoints[0].password, "b");
    }

    #[test]
    fn tag_collision_between_hosts_is_rejected() {
        let mut state = ClientState::default();
        state.upsert_endpoint(endpoint("edge.example", "a"), false).expect("insert");
        let err = state
            .upsert_endpoint(endpoint("edge-example", "b"), true)
            .expect_err("collision");
        assert!(matches!(err, EndpointError::TagConflict { .. }));
    }

    #[test]
    fn remove_cascades_to_redirects_and_reverse() {
        let mut state = ClientState::default();
        state.upsert_endpoint(endpoint("10.0.0.1", "a"), false).expect("first");
        state.upsert_endpoint(endpoint("10.0.0.2", "b"), false).expect("second");
        state.redirects.push(RedirectRule::new(RedirectKind::Cidr, "10.9.0.0/16", "proxy-10-0-0-1"));
        state.redirects.push(RedirectRule::new(RedirectKind::Cidr, "10.8.0.0/16", "proxy-10-0-0-2"));
        state.reverse.insert(
            "alice10-0-0-1.rev".to_string(),
            ClientReverseChannel {
                endpoint_tag: "proxy-10-0-0-1".to_string(),
                user_id: "alice".to_string(),
                host: "10.0.0.1".to_string(),
                tag: "alice10-0-0-1.rev".to_string(),
                domain: "alice10-0-0-1.rev".to_string(),
            },
        );

        let removed = state.remove_endpoint("PROXY-10-0-0-1").expect("remove by tag");
        assert_eq!(removed.hostname, "10.0.0.1");
        assert_eq!(state.redirects.len(), 1);
        assert!(state.reverse.is_empty());

        let err = state.remove_endpoint("10.0.0.1").expect_err("gone");
        assert_eq!(err.to_string(), "client endpoint \"10.0.0.1\" not found");
    }
}
