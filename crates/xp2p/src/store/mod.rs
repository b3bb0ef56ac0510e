//! Per-role install state: one JSON file per role inside the install root,
//! every mutation serialized through an exclusive `flock` on `.xp2p.lock`.
//!
//! A legacy single-role `install-state.json` is only consulted when the
//! role's own file is absent; the first successful write migrates it.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use anyhow::Context;
use nix::fcntl::{Flock, FlockArg};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::domain::Role;
use crate::endpoint::Endpoint;
use crate::forward::ForwardRule;
use crate::identity::TrojanUser;
use crate::redirect::RedirectRule;
use crate::reverse::{ClientReverseChannel, ServerReverseChannel};
use crate::runtime;

pub const LEGACY_STATE_FILE: &str = "install-state.json";
pub const HEARTBEAT_STATE_FILE: &str = "state-heartbeat.json";
const LOCK_FILE: &str = ".xp2p.lock";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("xp2p {role} already installed ({path}) (use --force to overwrite)")]
    AlreadyInstalled { role: Role, path: String },
    #[error("xp2p {role} is not installed in {root}")]
    NotInstalled { role: Role, root: String },
    #[error("failed to lock install root {path}: {source}")]
    Lock {
        path: String,
        #[source]
        source: nix::Error,
    },
}

/// Paths inside one install root.
#[derive(Debug, Clone)]
pub struct InstallLayout {
    root: PathBuf,
}

impl InstallLayout {
    pub fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root: PathBuf = root.into();
        let root = if root.is_absolute() {
            root
        } else {
            std::env::current_dir()
                .context("failed to resolve current directory")?
                .join(root)
        };
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.root.join("bin")
    }

    pub fn xray_path(&self) -> PathBuf {
        self.bin_dir().join("xray")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn error_log_path(&self, role: Role) -> PathBuf {
        self.logs_dir().join(role.error_log_name())
    }

    pub fn state_path(&self, role: Role) -> PathBuf {
        self.root.join(role.state_file_name())
    }

    pub fn legacy_state_path(&self) -> PathBuf {
        self.root.join(LEGACY_STATE_FILE)
    }

    pub fn heartbeat_path(&self) -> PathBuf {
        self.root.join(HEARTBEAT_STATE_FILE)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    /// Relative names resolve under the root; absolute paths are used verbatim.
    pub fn config_dir(&self, name: &str) -> PathBuf {
        let trimmed = name.trim();
        let path = Path::new(trimmed);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(trimmed)
        }
    }
}

/// Exclusive advisory lock on the install root, released on drop.
pub struct InstallLock {
    _guard: Flock<File>,
}

impl InstallLock {
    pub fn acquire(layout: &InstallLayout) -> anyhow::Result<Self> {
        fs::create_dir_all(layout.root()).with_context(|| {
            format!("failed to create install root {}", layout.root().display())
        })?;
        let path = layout.lock_path();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("failed to open lock file {}", path.display()))?;
        let guard = Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| {
            StoreError::Lock {
                path: path.display().to_string(),
                source: errno,
            }
        })?;
        debug!(path = %path.display(), "install root locked");
        Ok(Self { _guard: guard })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstallMarker {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<Role>,
    #[serde(default)]
    pub version: String,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub installed_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub config_dir: String,
}

impl InstallMarker {
    pub fn fresh(role: Role, config_dir: &str) -> Self {
        Self {
            kind: Some(role),
            version: env!("CARGO_PKG_VERSION").to_string(),
            installed_at: Some(OffsetDateTime::now_utc()),
            config_dir: config_dir.to_string(),
        }
    }
}

pub trait RoleState: Serialize + DeserializeOwned + Clone + Default {
    const ROLE: Role;

    fn marker(&self) -> &InstallMarker;
    fn marker_mut(&mut self) -> &mut InstallMarker;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TlsMaterial {
    pub cert_path: String,
    pub key_path: String,
    #[serde(default)]
    pub self_signed: bool,
    #[serde(default)]
    pub server_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerState {
    #[serde(flatten)]
    pub marker: InstallMarker,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub users: Vec<TrojanUser>,
    #[serde(default)]
    pub tls: Option<TlsMaterial>,
    #[serde(default)]
    pub reverse_channels: BTreeMap<String, ServerReverseChannel>,
    #[serde(default)]
    pub server_redirects: Vec<RedirectRule>,
    #[serde(default)]
    pub forward_rules: Vec<ForwardRule>,
}

impl RoleState for ServerState {
    const ROLE: Role = Role::Server;

    fn marker(&self) -> &InstallMarker {
        &self.marker
    }

    fn marker_mut(&mut self) -> &mut InstallMarker {
        &mut self.marker
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientState {
    #[serde(flatten)]
    pub marker: InstallMarker,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
    #[serde(default)]
    pub redirects: Vec<RedirectRule>,
    #[serde(default)]
    pub reverse: BTreeMap<String, ClientReverseChannel>,
    #[serde(default)]
    pub forwards: Vec<ForwardRule>,
}

impl RoleState for ClientState {
    const ROLE: Role = Role::Client;

    fn marker(&self) -> &InstallMarker {
        &self.marker
    }

    fn marker_mut(&mut self) -> &mut InstallMarker {
        &mut self.marker
    }
}

enum Loaded<S> {
    PerRole(S),
    Legacy(S),
    Missing,
}

/// Narrow store for one role; both roles share the root lock.
pub struct RoleStore<S: RoleState> {
    layout: InstallLayout,
    _state: PhantomData<S>,
}

impl<S: RoleState> RoleStore<S> {
    pub fn open(layout: &InstallLayout) -> Self {
        Self {
            layout: layout.clone(),
            _state: PhantomData,
        }
    }

    pub fn layout(&self) -> &InstallLayout {
        &self.layout
    }

    pub fn path(&self) -> PathBuf {
        self.layout.state_path(S::ROLE)
    }

    pub fn load(&self) -> anyhow::Result<Option<S>> {
        Ok(match self.read()? {
            Loaded::PerRole(state) | Loaded::Legacy(state) => Some(state),
            Loaded::Missing => None,
        })
    }

    pub fn load_required(&self) -> anyhow::Result<S> {
        self.load()?.ok_or_else(|| self.not_installed().into())
    }

    /// Applies `f` to a copy of the installed state and persists the copy.
    /// Artifacts written inside `f` land before the state file.
    pub fn mutate<T>(&self, f: impl FnOnce(&mut S) -> anyhow::Result<T>) -> anyhow::Result<T> {
        let _lock = InstallLock::acquire(&self.layout)?;
        let (current, from_legacy) = match self.read()? {
            Loaded::PerRole(state) => (state, false),
            Loaded::Legacy(state) => (state, true),
            Loaded::Missing => return Err(self.not_installed().into()),
        };
        let mut next = current.clone();
        let out = f(&mut next)?;
        self.persist(&next, from_legacy)?;
        Ok(out)
    }

    /// Like [`mutate`](Self::mutate) but starts from a fresh state when the
    /// role is absent. The flag passed to `f` reports whether state existed.
    pub fn upsert<T>(
        &self,
        config_dir: &str,
        f: impl FnOnce(&mut S, bool) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        let _lock = InstallLock::acquire(&self.layout)?;
        let (mut next, existed, from_legacy) = match self.read()? {
            Loaded::PerRole(state) => (state, true, false),
            Loaded::Legacy(state) => (state, true, true),
            Loaded::Missing => {
                let mut state = S::default();
                *state.marker_mut() = InstallMarker::fresh(S::ROLE, config_dir);
                (state, false, false)
            }
        };
        let out = f(&mut next, existed)?;
        self.persist(&next, from_legacy)?;
        Ok(out)
    }

    /// Installs the role from scratch. An existing install fails unless
    /// `force`, in which case role-scoped entries are rebuilt by `f`.
    pub fn install<T>(
        &self,
        config_dir: &str,
        force: bool,
        f: impl FnOnce(&mut S, Option<&S>) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        let _lock = InstallLock::acquire(&self.layout)?;
        let (previous, from_legacy) = match self.read()? {
            Loaded::PerRole(state) => (Some(state), false),
            Loaded::Legacy(state) => (Some(state), true),
            Loaded::Missing => (None, false),
        };
        if previous.is_some() && !force {
            return Err(StoreError::AlreadyInstalled {
                role: S::ROLE,
                path: self.path().display().to_string(),
            }
            .into());
        }
        let mut next = S::default();
        *next.marker_mut() = InstallMarker::fresh(S::ROLE, config_dir);
        let out = f(&mut next, previous.as_ref())?;
        self.persist(&next, from_legacy)?;
        info!(role = %S::ROLE, path = %self.path().display(), "install state written");
        Ok(out)
    }

    /// Deletes the role's state file and its legacy entry. Returns whether
    /// anything was removed. `f` runs under the lock with the last state.
    pub fn remove(&self, f: impl FnOnce(Option<&S>) -> anyhow::Result<()>) -> anyhow::Result<bool> {
        let _lock = InstallLock::acquire(&self.layout)?;
        let previous = self.load()?;
        f(previous.as_ref())?;

        let mut removed = false;
        let path = self.path();
        match fs::remove_file(&path) {
            Ok(()) => removed = true,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| format!("failed to remove {}", path.display()));
            }
        }
        if remove_legacy_role(&self.layout, S::ROLE)? {
            removed = true;
        }
        Ok(removed)
    }

    fn read(&self) -> anyhow::Result<Loaded<S>> {
        if let Some(state) = runtime::read_json::<S>(&self.path())? {
            return Ok(Loaded::PerRole(state));
        }
        match read_legacy_role(&self.layout, S::ROLE)? {
            Some(value) => {
                let path = self.layout.legacy_state_path();
                let state: S = serde_json::from_value(value)
                    .with_context(|| format!("invalid {} state in {}", S::ROLE, path.display()))?;
                Ok(Loaded::Legacy(state))
            }
            None => Ok(Loaded::Missing),
        }
    }

    fn persist(&self, state: &S, from_legacy: bool) -> anyhow::Result<()> {
        let mut state = state.clone();
        let marker = state.marker_mut();
        if marker.kind.is_none() {
            marker.kind = Some(S::ROLE);
        }
        runtime::write_json_atomic(&self.path(), &state)?;
        if from_legacy {
            remove_legacy_role(&self.layout, S::ROLE)?;
            info!(role = %S::ROLE, "migrated legacy install state");
        }
        Ok(())
    }

    fn not_installed(&self) -> StoreError {
        StoreError::NotInstalled {
            role: S::ROLE,
            root: self.layout.root().display().to_string(),
        }
    }
}

pub type ServerStore = RoleStore<ServerState>;
pub type ClientStore = RoleStore<ClientState>;

/// Roles present in the install root: per-role files first, then the legacy file.
pub fn detect_roles(layout: &InstallLayout) -> anyhow::Result<BTreeSet<Role>> {
    let mut roles = BTreeSet::new();
    for role in Role::ALL {
        if layout.state_path(role).is_file() || read_legacy_role(layout, role)?.is_some() {
            roles.insert(role);
        }
    }
    Ok(roles)
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LegacyMulti {
    #[serde(default)]
    roles: BTreeMap<String, serde_json::Value>,
}

/// The legacy file is either `{"roles": {"client": {...}}}` or a single
/// `{"kind": "client", ...}` document.
fn read_legacy_role(layout: &InstallLayout, role: Role) -> anyhow::Result<Option<serde_json::Value>> {
    let path = layout.legacy_state_path();
    let Some(doc) = runtime::read_json::<serde_json::Value>(&path)? else {
        return Ok(None);
    };
    if let Some(roles) = doc.get("roles").and_then(|v| v.as_object()) {
        return Ok(roles.get(role.as_str()).cloned().map(|mut entry| {
            if let Some(obj) = entry.as_object_mut() {
                obj.entry("kind")
                    .or_insert_with(|| serde_json::Value::String(role.as_str().to_string()));
            }
            entry
        }));
    }
    let kind = doc
        .get("kind")
        .and_then(|v| v.as_str())
        .map(|k| k.trim().to_ascii_lowercase());
    if kind.as_deref() == Some(role.as_str()) {
        return Ok(Some(doc));
    }
    Ok(None)
}

fn remove_legacy_role(layout: &InstallLayout, role: Role) -> anyhow::Result<bool> {
    let path = layout.legacy_state_path();
    let Some(doc) = runtime::read_json::<serde_json::Value>(&path)? else {
        return Ok(false);
    };

    if doc.get("roles").is_some() {
        let mut multi: LegacyMulti = serde_json::from_value(doc)
            .with_context(|| format!("invalid JSON in {}", path.display()))?;
        if multi.roles.remove(role.as_str()).is_none() {
            return Ok(false);
        }
        if multi.roles.is_empty() {
            remove_file_if_exists(&path)?;
        } else {
            runtime::write_json_atomic(&path, &multi)?;
        }
        return Ok(true);
    }

    let matches = doc
        .get("kind")
        .and_then(|v| v.as_str())
        .is_some_and(|k| k.trim().eq_ignore_ascii_case(role.as_str()));
    if matches {
        remove_file_if_exists(&path)?;
    }
    Ok(matches)
}

/// Once no role is left, drops the shared binary, logs and heartbeat file.
/// Returns whether anything was released.
///
/// Runs under the install lock, and `.xp2p.lock` itself stays on disk:
/// unlinking it while held would let a waiter on the old inode and a newcomer
/// on a fresh file both believe they own the root. The cost is one empty
/// file left behind after a full uninstall.
pub fn release_shared(layout: &InstallLayout) -> anyhow::Result<bool> {
    let _lock = InstallLock::acquire(layout)?;
    if !detect_roles(layout)?.is_empty() {
        return Ok(false);
    }
    for dir in [layout.bin_dir(), layout.logs_dir()] {
        match fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| format!("failed to remove {}", dir.display()));
            }
        }
    }
    remove_file_if_exists(&layout.heartbeat_path())?;
    info!(root = %layout.root().display(), "released shared install files");
    Ok(true)
}

pub fn remove_file_if_exists(path: &Path) -> anyhow::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err).with_context(|| format!("failed to remove {}", path.display())),
    }
}
