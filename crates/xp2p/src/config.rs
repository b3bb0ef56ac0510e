use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::artifacts::ConfigFiles;
use crate::domain::{self, Role, DEFAULT_REVERSE_SUFFIX};
use crate::runtime::{self, parse_duration};
use crate::store::{InstallLayout, InstallMarker};

fn xdg_config_home() -> PathBuf {
    env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".config")
        })
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub host: Option<String>,
    pub port: u16,
    pub config_dir: String,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub config_dir: String,
    pub socks_port: u16,
    pub diag_port: u16,
}

#[derive(Debug, Clone)]
pub struct Xp2pConfig {
    pub install_dir: PathBuf,
    pub log_level: String,
    pub server: ServerSettings,
    pub client: ClientSettings,
    pub forward_base_port: u16,
    pub reverse_suffix: String,
    pub heartbeat_interval: Duration,
    pub xray_bin: Option<PathBuf>,
}

impl Default for Xp2pConfig {
    fn default() -> Self {
        let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
        Self {
            install_dir: PathBuf::from(home).join("xp2p"),
            log_level: "info".to_string(),
            server: ServerSettings {
                host: None,
                port: 62022,
                config_dir: Role::Server.default_config_dir().to_string(),
                cert: None,
                key: None,
            },
            client: ClientSettings {
                config_dir: Role::Client.default_config_dir().to_string(),
                socks_port: 51180,
                diag_port: 48044,
            },
            forward_base_port: 53331,
            reverse_suffix: DEFAULT_REVERSE_SUFFIX.to_string(),
            heartbeat_interval: Duration::from_secs(2),
            xray_bin: None,
        }
    }
}

impl Xp2pConfig {
    pub fn load(explicit_file: Option<&Path>) -> anyhow::Result<Self> {
        let mut cfg = Self::default();

        // Layer 2: TOML config file
        let file = ConfigFile::load(explicit_file)?;
        if let Some(ref v) = file.install_dir {
            cfg.install_dir = expand_tilde(v);
        }
        if let Some(ref v) = file.log_level {
            cfg.log_level = v.clone();
        }
        if let Some(ref v) = file.forward_base_port {
            cfg.forward_base_port = *v;
        }
        if let Some(ref v) = file.reverse_suffix {
            cfg.reverse_suffix = v.clone();
        }
        if let Some(ref v) = file.heartbeat_interval {
            cfg.heartbeat_interval = parse_duration(v)
                .with_context(|| format!("invalid heartbeat_interval in config.toml: {v}"))?;
        }
        if let Some(ref v) = file.xray_bin {
            cfg.xray_bin = Some(expand_tilde(v));
        }
        if let Some(server) = file.server {
            if let Some(v) = server.host {
                cfg.server.host = Some(v);
            }
            if let Some(v) = server.port {
                cfg.server.port = v;
            }
            if let Some(v) = server.config_dir {
                cfg.server.config_dir = v;
            }
            if let Some(ref v) = server.cert {
                cfg.server.cert = Some(expand_tilde(v));
            }
            if let Some(ref v) = server.key {
                cfg.server.key = Some(expand_tilde(v));
            }
        }
        if let Some(client) = file.client {
            if let Some(v) = client.config_dir {
                cfg.client.config_dir = v;
            }
            if let Some(v) = client.socks_port {
                cfg.client.socks_port = v;
            }
            if let Some(v) = client.diag_port {
                cfg.client.diag_port = v;
            }
        }

        // Layer 3: XP2P_* environment (highest priority)
        if let Ok(path) = env::var("XP2P_INSTALL_DIR") {
            cfg.install_dir = expand_tilde(&path);
        }
        if let Ok(level) = env::var("XP2P_LOG_LEVEL") {
            cfg.log_level = level;
        }
        if let Ok(host) = env::var("XP2P_SERVER_HOST") {
            let host = host.trim().to_string();
            domain::validate_host(&host)
                .with_context(|| format!("invalid XP2P_SERVER_HOST: {host}"))?;
            cfg.server.host = Some(host);
        }
        if let Ok(raw) = env::var("XP2P_SERVER_PORT") {
            cfg.server.port =
                env_port(&raw).with_context(|| format!("invalid XP2P_SERVER_PORT: {raw}"))?;
        }
        if let Ok(dir) = env::var("XP2P_SERVER_CONFIG_DIR") {
            cfg.server.config_dir = dir;
        }
        if let Ok(dir) = env::var("XP2P_CLIENT_CONFIG_DIR") {
            cfg.client.config_dir = dir;
        }
        if let Ok(raw) = env::var("XP2P_SOCKS_PORT") {
            cfg.client.socks_port =
                env_port(&raw).with_context(|| format!("invalid XP2P_SOCKS_PORT: {raw}"))?;
        }
        if let Ok(raw) = env::var("XP2P_DIAG_PORT") {
            cfg.client.diag_port =
                env_port(&raw).with_context(|| format!("invalid XP2P_DIAG_PORT: {raw}"))?;
        }
        if let Ok(raw) = env::var("XP2P_FORWARD_BASE_PORT") {
            cfg.forward_base_port = env_port(&raw)
                .with_context(|| format!("invalid XP2P_FORWARD_BASE_PORT: {raw}"))?;
        }
        if let Ok(suffix) = env::var("XP2P_REVERSE_SUFFIX") {
            cfg.reverse_suffix = suffix;
        }
        if let Ok(raw) = env::var("XP2P_HEARTBEAT_INTERVAL") {
            cfg.heartbeat_interval = parse_duration(&raw)
                .with_context(|| format!("invalid XP2P_HEARTBEAT_INTERVAL: {raw}"))?;
        }
        if let Ok(path) = env::var("XP2P_XRAY_BIN") {
            if !path.trim().is_empty() {
                cfg.xray_bin = Some(PathBuf::from(path.trim()));
            }
        }

        if cfg.reverse_suffix.trim().is_empty() {
            cfg.reverse_suffix = DEFAULT_REVERSE_SUFFIX.to_string();
        }

        Ok(cfg)
    }

    pub fn config_dir_name(&self, role: Role) -> &str {
        match role {
            Role::Client => &self.client.config_dir,
            Role::Server => &self.server.config_dir,
        }
    }
}

/// Paths and settings one role command works against.
#[derive(Debug, Clone)]
pub struct RoleContext {
    pub role: Role,
    pub layout: InstallLayout,
    pub config_dir: String,
    pub settings: Xp2pConfig,
}

impl RoleContext {
    /// `--path` beats the configured install dir. The config dir comes from
    /// `--config-dir`, then the installed role's marker, then settings.
    pub fn resolve(
        settings: &Xp2pConfig,
        role: Role,
        path: Option<&Path>,
        config_dir: Option<&str>,
    ) -> anyhow::Result<Self> {
        let root = path.map(Path::to_path_buf).unwrap_or_else(|| settings.install_dir.clone());
        let layout = InstallLayout::new(root)?;
        let config_dir = match config_dir.map(str::trim).filter(|d| !d.is_empty()) {
            Some(dir) => dir.to_string(),
            None => installed_config_dir(&layout, role)
                .unwrap_or_else(|| settings.config_dir_name(role).to_string()),
        };
        Ok(Self {
            role,
            layout,
            config_dir,
            settings: settings.clone(),
        })
    }

    pub fn files(&self) -> ConfigFiles {
        ConfigFiles::new(self.layout.config_dir(&self.config_dir))
    }
}

fn installed_config_dir(layout: &InstallLayout, role: Role) -> Option<String> {
    let marker: InstallMarker = runtime::read_json(&layout.state_path(role)).ok()??;
    Some(marker.config_dir).filter(|d| !d.trim().is_empty())
}

fn env_port(raw: &str) -> anyhow::Result<u16> {
    Ok(domain::parse_port(raw)?)
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(rest)
    } else {
        PathBuf::from(path)
    }
}

#[derive(Debug, Default, Deserialize)]
struct ServerSection {
    host: Option<String>,
    port: Option<u16>,
    config_dir: Option<String>,
    cert: Option<String>,
    key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ClientSection {
    config_dir: Option<String>,
    socks_port: Option<u16>,
    diag_port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    install_dir: Option<String>,
    log_level: Option<String>,
    forward_base_port: Option<u16>,
    reverse_suffix: Option<String>,
    heartbeat_interval: Option<String>,
    xray_bin: Option<String>,
    server: Option<ServerSection>,
    client: Option<ClientSection>,
}

impl ConfigFile {
    fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        // An explicitly requested file must exist; the implicit one is optional.
        if let Some(path) = explicit {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            return toml::from_str(&content)
                .with_context(|| format!("invalid TOML in {}", path.display()));
        }

        let path = env::var("XP2P_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| xdg_config_home().join("xp2p/config.toml"));
        let Ok(content) = std::fs::read_to_string(&path) else {
            return Ok(Self::default());
        };
        match toml::from_str(&content) {
            Ok(cfg) => Ok(cfg),
            Err(e) => {
                tracing::warn!("failed to parse {}: {e}", path.display());
                Ok(Self::default())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_known_constants() {
        let cfg = Xp2pConfig::default();
        assert_eq!(cfg.server.port, 62022);
        assert_eq!(cfg.client.socks_port, 51180);
        assert_eq!(cfg.client.diag_port, 48044);
        assert_eq!(cfg.forward_base_port, 53331);
        assert_eq!(cfg.reverse_suffix, ".rev");
        assert_eq!(cfg.config_dir_name(Role::Server), "config-server");
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(2));
    }

    #[test]
    fn explicit_toml_file_overrides_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("xp2p.toml");
        std::fs::write(
            &path,
            r#"
install_dir = "/srv/xp2p"
forward_base_port = 40000
heartbeat_interval = "5s"

[server]
host = "edge.example.org"
port = 8443

[client]
socks_port = 1080
"#,
        )
        .expect("write config");

        let file = ConfigFile::load(Some(&path)).expect("load");
        assert_eq!(file.install_dir.as_deref(), Some("/srv/xp2p"));
        assert_eq!(file.forward_base_port, Some(40000));
        let server = file.server.expect("server section");
        assert_eq!(server.port, Some(8443));
        assert_eq!(server.host.as_deref(), Some("edge.example.org"));
        assert_eq!(file.client.and_then(|c| c.socks_port), Some(1080));
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(ConfigFile::load(Some(&dir.path().join("absent.toml"))).is_err());
    }

    #[test]
    fn context_prefers_installed_config_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = Xp2pConfig::default();
        let ctx = RoleContext::resolve(&settings, Role::Client, Some(dir.path()), None).expect("ctx");
        assert_eq!(ctx.config_dir, "config-client");

        std::fs::write(
            dir.path().join("install-state-client.json"),
            r#"{"kind":"client","config_dir":"custom-client"}"#,
        )
        .expect("state");
        let ctx = RoleContext::resolve(&settings, Role::Client, Some(dir.path()), None).expect("ctx");
        assert_eq!(ctx.files().dir(), dir.path().join("custom-client"));

        let ctx = RoleContext::resolve(&settings, Role::Client, Some(dir.path()), Some("other"))
            .expect("ctx");
        assert_eq!(ctx.config_dir, "other");
    }

    #[test]
    fn expand_tilde_uses_home() {
        let expanded = expand_tilde("/abs/path");
        assert_eq!(expanded, PathBuf::from("/abs/path"));
    }
}
