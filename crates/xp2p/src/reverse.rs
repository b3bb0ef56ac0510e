use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{normalize_key, reverse_tag, DomainError};
use crate::endpoint::Endpoint;
use crate::store::{ClientState, ServerState};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReverseError {
    #[error(transparent)]
    Identity(#[from] DomainError),
    #[error("reverse tag {tag} is already assigned to {user}@{host}")]
    Conflict { tag: String, user: String, host: String },
    #[error("reverse tag {tag} is already routed via {endpoint_tag}")]
    EndpointConflict { tag: String, endpoint_tag: String },
    #[error("reverse tunnel {0} not found")]
    NotFound(String),
}

/// Server-side portal for one (user, host) pair. The map key is the tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerReverseChannel {
    pub user_id: String,
    pub host: String,
    pub domain: String,
}

/// Client-side bridge, routed through the endpoint identified by `endpoint_tag`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientReverseChannel {
    pub endpoint_tag: String,
    pub user_id: String,
    pub host: String,
    pub tag: String,
    pub domain: String,
}

impl ServerState {
    /// Registers the portal for `user_id` on this server's host and returns its tag.
    pub fn ensure_reverse_channel(&mut self, user_id: &str, suffix: &str) -> Result<String, ReverseError> {
        let tag = reverse_tag(user_id, &self.host, suffix)?;
        if let Some(existing) = self.reverse_channels.get(&tag) {
            if normalize_key(&existing.user_id) != normalize_key(user_id) {
                return Err(ReverseError::Conflict {
                    tag,
                    user: existing.user_id.clone(),
                    host: existing.host.clone(),
                });
            }
        }
        self.reverse_channels.insert(
            tag.clone(),
            ServerReverseChannel {
                user_id: user_id.trim().to_string(),
                host: self.host.clone(),
                domain: tag.clone(),
            },
        );
        Ok(tag)
    }

    /// Drops every portal owned by `user_id`, returning the removed tags.
    pub fn remove_reverse_channels_for(&mut self, user_id: &str) -> Vec<String> {
        let key = normalize_key(user_id);
        let tags: Vec<String> = self
            .reverse_channels
            .iter()
            .filter(|(_, ch)| normalize_key(&ch.user_id) == key)
            .map(|(tag, _)| tag.clone())
            .collect();
        for tag in &tags {
            self.reverse_channels.remove(tag);
        }
        tags
    }

    pub fn remove_reverse_channel(&mut self, tag: &str) -> Result<ServerReverseChannel, ReverseError> {
        let key = self
            .reverse_channels
            .keys()
            .find(|k| normalize_key(k) == normalize_key(tag))
            .cloned()
            .ok_or_else(|| ReverseError::NotFound(tag.trim().to_string()))?;
        self.reverse_channels
            .remove(&key)
            .ok_or_else(|| ReverseError::NotFound(key.clone()))
    }
}

impl ClientState {
    /// Registers the bridge derived from the endpoint's user and host.
    pub fn ensure_reverse_channel(&mut self, endpoint: &Endpoint, suffix: &str) -> Result<String, ReverseError> {
        let tag = reverse_tag(&endpoint.user, &endpoint.hostname, suffix)?;
        if let Some(existing) = self.reverse.get(&tag) {
            if normalize_key(&existing.user_id) != normalize_key(&endpoint.user)
                || normalize_key(&existing.host) != normalize_key(&endpoint.hostname)
            {
                return Err(ReverseError::Conflict {
                    tag,
                    user: existing.user_id.clone(),
                    host: existing.host.clone(),
                });
            }
            if normalize_key(&existing.endpoint_tag) != normalize_key(&endpoint.tag) {
                return Err(ReverseError::EndpointConflict {
                    tag,
                    endpoint_tag: existing.endpoint_tag.clone(),
                });
            }
        }
        self.reverse.insert(
            tag.clone(),
            ClientReverseChannel {
                endpoint_tag: endpoint.tag.clone(),
                user_id: endpoint.user.clone(),
                host: endpoint.hostname.clone(),
                tag: tag.clone(),
                domain: tag.clone(),
            },
        );
        Ok(tag)
    }

    pub fn remove_reverse_channel(&mut self, tag: &str) -> Result<ClientReverseChannel, ReverseError> {
        let key = self
            .reverse
            .keys()
            .find(|k| normalize_key(k) == normalize_key(tag))
            .cloned()
            .ok_or_else(|| ReverseError::NotFound(tag.trim().to_string()))?;
        self.reverse
            .remove(&key)
            .ok_or_else(|| ReverseError::NotFound(key.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> ServerState {
        ServerState {
            host: "10.62.10.11".to_string(),
            port: 62022,
            ..ServerState::default()
        }
    }

    #[test]
    fn server_channel_is_idempotent_per_user() {
        let mut state = server();
        let tag = state.ensure_reverse_channel("client-abc", ".rev").expect("ensure");
        assert_eq!(tag, "client-abc10-62-10-11.rev");
        state.ensure_reverse_channel("client-abc", ".rev").expect("again");
        assert_eq!(state.reverse_channels.len(), 1);
        assert_eq!(state.reverse_channels[&tag].domain, tag);
    }

    #[test]
    fn server_channel_conflicts_on_colliding_users() {
        let mut state = server();
        state.ensure_reverse_channel("client.abc", ".rev").expect("first");
        let err = state
            .ensure_reverse_channel("client_abc", ".rev")
            .expect_err("sanitized collision");
        assert!(matches!(err, ReverseError::Conflict { .. }));
    }

    #[test]
    fn removing_user_channels_returns_tags() {
        let mut state = server();
        state.ensure_reverse_channel("alice", ".rev").expect("alice");
        state.ensure_reverse_channel("bob", ".rev").expect("bob");
        assert_eq!(state.remove_reverse_channels_for("ALICE"), vec!["alice10-62-10-11.rev"]);
        assert_eq!(state.reverse_channels.len(), 1);
        assert!(state.remove_reverse_channel("missing.rev").is_err());
        state.remove_reverse_channel("bob10-62-10-11.rev").expect("remove bob");
        assert!(state.reverse_channels.is_empty());
    }

    #[test]
    fn client_channel_follows_endpoint() {
        let mut state = ClientState::default();
        let ep = Endpoint::new("10.62.10.11", 62022, "client-abc", "pw", None, true);
        let tag = state.ensure_reverse_channel(&ep, ".rev").expect("ensure");
        assert_eq!(tag, "client-abc10-62-10-11.rev");
        let channel = &state.reverse[&tag];
        assert_eq!(channel.endpoint_tag, "proxy-10-62-10-11");

        let mut moved = ep.clone();
        moved.tag = "proxy-other".to_string();
        let err = state.ensure_reverse_channel(&moved, ".rev").expect_err("routed elsewhere");
        assert!(matches!(err, ReverseError::EndpointConflict { .. }));
    }

    #[test]
    fn empty_user_cannot_derive_tag() {
        let mut state = ClientState::default();
        let ep = Endpoint::new("10.62.10.11", 62022, "***", "pw", None, true);
        assert!(matches!(
            state.ensure_reverse_channel(&ep, ".rev"),
            Err(ReverseError::Identity(_))
        ));
    }
}
