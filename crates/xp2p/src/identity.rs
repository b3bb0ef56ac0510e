//! Trojan users and `trojan://` links.

use std::fmt::Write as _;
use std::net::IpAddr;
use std::str::FromStr;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

use crate::domain::normalize_key;
use crate::store::ServerState;

const USERINFO: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b':')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'@')
    .add(b'[')
    .add(b']')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'|')
    .add(b'}');

const QUERY_VALUE: &AsciiSet = &USERINFO.add(b'&').add(b'=').add(b'+');

const FRAGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'`');

const USER_QUERY_KEYS: [&str; 6] = ["email", "user", "username", "name", "remark", "remarks"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("user id is required")]
    EmptyUser,
    #[error("password is required")]
    EmptyPassword,
    #[error("user {0} not found")]
    UserNotFound(String),
    #[error("no users configured")]
    NoUsers,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LinkError {
    #[error("invalid trojan link: {0}")]
    Malformed(String),
    #[error("unsupported link scheme {0:?} (expected trojan)")]
    Scheme(String),
    #[error("trojan link is missing the server host")]
    MissingHost,
    #[error("trojan link is missing the server port")]
    MissingPort,
    #[error("trojan link is missing the password")]
    MissingPassword,
    #[error("trojan link is missing the user (fragment or email parameter)")]
    MissingUser,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrojanUser {
    pub id: String,
    pub password: String,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at: Option<OffsetDateTime>,
}

impl TrojanUser {
    pub fn new(id: &str, password: &str) -> Result<Self, IdentityError> {
        let id = id.trim();
        let password = password.trim();
        if id.is_empty() {
            return Err(IdentityError::EmptyUser);
        }
        if password.is_empty() {
            return Err(IdentityError::EmptyPassword);
        }
        Ok(Self {
            id: id.to_string(),
            password: password.to_string(),
            created_at: Some(OffsetDateTime::now_utc()),
        })
    }

    /// A `client-<suffix>` user with a random password, used by install.
    pub fn generate() -> Self {
        Self {
            id: generate_user_id(),
            password: generate_password(),
            created_at: Some(OffsetDateTime::now_utc()),
        }
    }
}

pub fn generate_user_id() -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz234567";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..8)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    format!("client-{suffix}")
}

pub fn generate_password() -> String {
    let mut buf = [0u8; 18];
    rand::thread_rng().fill(&mut buf);
    URL_SAFE_NO_PAD.encode(buf)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserChange {
    Added,
    Updated,
    Unchanged,
}

impl ServerState {
    /// Same id and password is a no-op; a new password replaces the old one.
    pub fn upsert_user(&mut self, id: &str, password: &str) -> Result<UserChange, IdentityError> {
        let user = TrojanUser::new(id, password)?;
        let key = normalize_key(&user.id);
        match self.users.iter_mut().find(|u| normalize_key(&u.id) == key) {
            Some(existing) if existing.password == user.password => Ok(UserChange::Unchanged),
            Some(existing) => {
                existing.password = user.password;
                Ok(UserChange::Updated)
            }
            None => {
                self.users.push(user);
                Ok(UserChange::Added)
            }
        }
    }

    pub fn remove_user(&mut self, id: &str) -> Option<TrojanUser> {
        let key = normalize_key(id);
        let idx = self.users.iter().position(|u| normalize_key(&u.id) == key)?;
        Some(self.users.remove(idx))
    }

    pub fn find_user(&self, id: &str) -> Option<&TrojanUser> {
        let key = normalize_key(id);
        self.users.iter().find(|u| normalize_key(&u.id) == key)
    }

    /// Connection link for `user_id`, or the first user when none is given.
    pub fn link_for(&self, user_id: Option<&str>, host_override: Option<&str>) -> Result<TrojanLink, IdentityError> {
        let user = match user_id.map(str::trim).filter(|s| !s.is_empty()) {
            Some(id) => self
                .find_user(id)
                .ok_or_else(|| IdentityError::UserNotFound(id.to_string()))?,
            None => self.users.first().ok_or(IdentityError::NoUsers)?,
        };
        let host = host_override
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.host)
            .to_string();
        let (server_name, allow_insecure) = match &self.tls {
            Some(tls) if !tls.server_name.is_empty() => (tls.server_name.clone(), tls.self_signed),
            Some(tls) => (host.clone(), tls.self_signed),
            None => (host.clone(), true),
        };
        Ok(TrojanLink {
            password: user.password.clone(),
            host,
            port: self.port,
            server_name: Some(server_name),
            allow_insecure,
            user: user.id.clone(),
        })
    }
}

/// Parsed or to-be-rendered `trojan://` link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrojanLink {
    pub password: String,
    pub host: String,
    pub port: u16,
    /// `None` when the link asks for `security=none`.
    pub server_name: Option<String>,
    pub allow_insecure: bool,
    pub user: String,
}

impl TrojanLink {
    pub fn render(&self) -> String {
        let host = match self.host.parse::<IpAddr>() {
            Ok(IpAddr::V6(v6)) => format!("[{v6}]"),
            _ => self.host.clone(),
        };
        let mut out = format!(
            "trojan://{}@{host}:{}",
            utf8_percent_encode(&self.password, USERINFO),
            self.port
        );
        match &self.server_name {
            Some(sni) => {
                out.push_str("?security=tls");
                if self.allow_insecure {
                    out.push_str("&allowInsecure=1");
                }
                let _ = write!(out, "&sni={}", utf8_percent_encode(sni, QUERY_VALUE));
            }
            None => out.push_str("?security=none"),
        }
        let _ = write!(out, "#{}", utf8_percent_encode(&self.user, FRAGMENT));
        out
    }
}

impl std::fmt::Display for TrojanLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render())
    }
}

impl FromStr for TrojanLink {
    type Err = LinkError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let parsed = url::Url::parse(raw.trim()).map_err(|e| LinkError::Malformed(e.to_string()))?;
        if !parsed.scheme().eq_ignore_ascii_case("trojan") {
            return Err(LinkError::Scheme(parsed.scheme().to_string()));
        }
        let host = parsed
            .host_str()
            .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
            .filter(|h| !h.is_empty())
            .ok_or(LinkError::MissingHost)?;
        let port = parsed.port().ok_or(LinkError::MissingPort)?;
        let password = decode(parsed.username());
        if password.trim().is_empty() {
            return Err(LinkError::MissingPassword);
        }

        let query: Vec<(String, String)> = parsed
            .query_pairs()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.trim().to_string()))
            .collect();
        let param = |keys: &[&str]| {
            query
                .iter()
                .find(|(k, v)| keys.contains(&k.as_str()) && !v.is_empty())
                .map(|(_, v)| v.clone())
        };

        let user = parsed
            .fragment()
            .map(decode)
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty())
            .or_else(|| param(&USER_QUERY_KEYS[..]))
            .ok_or(LinkError::MissingUser)?;

        let security = param(&["security"][..]).unwrap_or_else(|| "tls".to_string());
        let (server_name, allow_insecure) = if security.eq_ignore_ascii_case("none") {
            (None, false)
        } else {
            let sni = param(&["sni", "peer", "servername"][..]).unwrap_or_else(|| host.clone());
            let insecure = param(&["allowinsecure", "allow_insecure", "insecure"][..])
                .is_some_and(|v| truthy(&v));
            (Some(sni), insecure)
        };

        Ok(Self {
            password,
            host,
            port,
            server_name,
            allow_insecure,
            user,
        })
    }
}

fn decode(value: &str) -> String {
    percent_decode_str(value).decode_utf8_lossy().into_owned()
}

fn truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
