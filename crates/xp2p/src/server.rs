//! Server role: install/remove, users, certificates, redirects, forwards,
//! reverse portals and the run loop.

use std::collections::BTreeSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::artifacts::server::{self as artifacts, ServerReverseRecord};
use crate::artifacts::load_document;
use crate::certs::{self, CertSource};
use crate::config::{RoleContext, Xp2pConfig};
use crate::domain::{self, normalize_key, Role};
use crate::forward::{self, ForwardRequest, ForwardRule, ForwardSelector, SocketProbe};
use crate::heartbeat::responder::DiagnosticsResponder;
use crate::heartbeat::runner::detect_local_ip;
use crate::heartbeat::HeartbeatStore;
use crate::identity::{
    generate_password, generate_user_id, IdentityError, TrojanLink, TrojanUser, UserChange,
};
use crate::process::{self, LogSinks, ProcessSpec};
use crate::redirect::{self, RedirectError, RedirectRecord, RedirectRule, RedirectTarget};
use crate::reverse::ReverseError;
use crate::runtime;
use crate::store::{self, ServerState, ServerStore, StoreError, TlsMaterial};

#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    pub host: String,
    pub port: Option<u16>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub force: bool,
}

#[derive(Debug, Clone)]
pub struct Installed {
    pub user: TrojanUser,
    pub link: TrojanLink,
    pub reverse_tag: String,
    pub config_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RemoveOptions {
    pub keep_files: bool,
    pub ignore_missing: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CertOptions {
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub host: Option<String>,
    pub force: bool,
}

fn store(ctx: &RoleContext) -> ServerStore {
    ServerStore::open(&ctx.layout)
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// `--host`, then configured host, then the address outbound traffic leaves from.
pub fn resolve_host(flag: Option<&str>, settings: &Xp2pConfig) -> String {
    if let Some(host) = non_empty(flag).or(non_empty(settings.server.host.as_deref())) {
        return host.to_string();
    }
    let detected = detect_local_ip().to_string();
    info!(host = %detected, "detected server host");
    detected
}

pub fn install(ctx: &RoleContext, opts: &InstallOptions) -> anyhow::Result<Installed> {
    let host = opts.host.trim();
    domain::validate_host(host)?;
    let port = opts.port.unwrap_or(ctx.settings.server.port);
    if port == 0 {
        anyhow::bail!("invalid port 0");
    }
    let source = CertSource::from_flags(opts.cert.clone(), opts.key.clone())?;
    let files = ctx.files();
    let suffix = ctx.settings.reverse_suffix.as_str();

    let installed = store(ctx).install(&ctx.config_dir, opts.force, |state, previous| {
        state.host = host.to_string();
        state.port = port;
        state.tls = Some(certs::install(files.dir(), host, &source)?);

        let id = non_empty(opts.user.as_deref())
            .map(str::to_string)
            .unwrap_or_else(generate_user_id);
        let password = non_empty(opts.password.as_deref())
            .map(str::to_string)
            .unwrap_or_else(generate_password);
        state.upsert_user(&id, &password)?;
        let reverse_tag = state.ensure_reverse_channel(&id, suffix)?;

        artifacts::sync(&files, previous, state)?;
        let link = state.link_for(Some(&id), None)?;
        let user = state
            .find_user(&id)
            .cloned()
            .ok_or_else(|| IdentityError::UserNotFound(id.clone()))?;
        Ok(Installed {
            user,
            link,
            reverse_tag,
            config_dir: files.dir().to_path_buf(),
        })
    })?;

    process::install_binary(&ctx.layout, ctx.settings.xray_bin.as_deref())?;
    info!(
        install_dir = %ctx.layout.root().display(),
        config_dir = %installed.config_dir.display(),
        host,
        port,
        "xp2p server installed"
    );
    Ok(installed)
}

/// Returns whether a state file was removed.
pub fn remove(ctx: &RoleContext, opts: RemoveOptions) -> anyhow::Result<bool> {
    let files = ctx.files();
    let removed = store(ctx).remove(|previous| {
        if previous.is_none() && !opts.ignore_missing {
            return Err(StoreError::NotInstalled {
                role: Role::Server,
                root: ctx.layout.root().display().to_string(),
            }
            .into());
        }
        if !opts.keep_files && files.purge()? {
            info!(config_dir = %files.dir().display(), "removed server configuration");
        }
        Ok(())
    })?;
    store::release_shared(&ctx.layout)?;
    Ok(removed)
}

/// Creates or updates a user. Without a password an existing user keeps
/// theirs and a new one gets a random password.
pub fn add_user(
    ctx: &RoleContext,
    id: &str,
    password: Option<&str>,
    host: Option<&str>,
) -> anyhow::Result<(UserChange, TrojanLink)> {
    let files = ctx.files();
    let suffix = ctx.settings.reverse_suffix.as_str();
    store(ctx).mutate(|state| {
        let before = state.clone();
        let password = match non_empty(password) {
            Some(p) => p.to_string(),
            None => state
                .find_user(id)
                .map(|u| u.password.clone())
                .unwrap_or_else(generate_password),
        };
        let change = state.upsert_user(id, &password)?;
        state.ensure_reverse_channel(id.trim(), suffix)?;
        artifacts::sync(&files, Some(&before), state)?;
        Ok((change, state.link_for(Some(id), host)?))
    })
}

fn drop_redirects_to(state: &mut ServerState, tags: &[String]) {
    let tags: BTreeSet<String> = tags.iter().map(|t| normalize_key(t)).collect();
    state
        .server_redirects
        .retain(|r| !tags.contains(&normalize_key(&r.outbound_tag)));
}

/// Idempotent: removing an unknown user is not an error.
pub fn remove_user(ctx: &RoleContext, id: &str) -> anyhow::Result<Option<TrojanUser>> {
    let files = ctx.files();
    store(ctx).mutate(|state| {
        let before = state.clone();
        let removed = state.remove_user(id);
        let tags = state.remove_reverse_channels_for(id);
        drop_redirects_to(state, &tags);
        if removed.is_some() || !tags.is_empty() {
            artifacts::sync(&files, Some(&before), state)?;
        }
        Ok(removed)
    })
}

pub fn list_users(ctx: &RoleContext) -> anyhow::Result<Vec<(TrojanUser, TrojanLink)>> {
    let state = store(ctx).load_required()?;
    state
        .users
        .iter()
        .map(|u| -> anyhow::Result<_> { Ok((u.clone(), state.link_for(Some(&u.id), None)?)) })
        .collect()
}

pub fn user_link(ctx: &RoleContext, id: Option<&str>, host: Option<&str>) -> anyhow::Result<TrojanLink> {
    Ok(store(ctx).load_required()?.link_for(id, host)?)
}

/// Replaces the TLS material of an installed server.
pub fn set_certificate(ctx: &RoleContext, opts: &CertOptions) -> anyhow::Result<TlsMaterial> {
    let source = CertSource::from_flags(opts.cert.clone(), opts.key.clone())?;
    let host = non_empty(opts.host.as_deref());
    if let Some(h) = host {
        domain::validate_host(h)?;
    }
    let files = ctx.files();
    store(ctx).mutate(|state| {
        let configured = state.tls.as_ref().is_some_and(|t| !t.cert_path.is_empty());
        if configured && !opts.force {
            anyhow::bail!("tls certificate already configured (use --force to replace)");
        }
        let before = state.clone();
        let name = host
            .map(str::to_string)
            .or_else(|| state.tls.as_ref().map(|t| t.server_name.clone()))
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| state.host.clone());
        let tls = certs::install(files.dir(), &name, &source)?;
        state.tls = Some(tls.clone());
        artifacts::sync(&files, Some(&before), state)?;
        Ok(tls)
    })
}

pub fn add_redirect(
    ctx: &RoleContext,
    target: &RedirectTarget,
    tag: Option<&str>,
    host: Option<&str>,
) -> anyhow::Result<bool> {
    let files = ctx.files();
    store(ctx).mutate(|state| {
        let before = state.clone();
        let bindings = state.redirect_bindings();
        if bindings.is_empty() {
            return Err(RedirectError::NoPortals.into());
        }
        let binding = redirect::resolve_binding(Role::Server, &bindings, tag, host)?;
        let added = redirect::add_rule(&mut state.server_redirects, target, &binding);
        if added {
            artifacts::sync(&files, Some(&before), state)?;
        }
        Ok(added)
    })
}

pub fn remove_redirect(
    ctx: &RoleContext,
    target: &RedirectTarget,
    tag: Option<&str>,
    host: Option<&str>,
    ignore_missing: bool,
) -> anyhow::Result<Vec<RedirectRule>> {
    let files = ctx.files();
    store(ctx).mutate(|state| {
        let before = state.clone();
        let selector = if non_empty(tag).is_some() || non_empty(host).is_some() {
            let bindings = state.redirect_bindings();
            match redirect::resolve_binding(Role::Server, &bindings, tag, host) {
                Ok(binding) => Some(binding.tag),
                Err(_) if ignore_missing => return Ok(Vec::new()),
                Err(err) => return Err(err.into()),
            }
        } else {
            None
        };
        match redirect::remove_rules(&mut state.server_redirects, target, selector.as_deref()) {
            Ok(removed) => {
                artifacts::sync(&files, Some(&before), state)?;
                Ok(removed)
            }
            Err(RedirectError::NotFound(_) | RedirectError::NoneConfigured) if ignore_missing => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    })
}

pub fn list_redirects(ctx: &RoleContext) -> anyhow::Result<Vec<RedirectRecord>> {
    Ok(store(ctx).load_required()?.redirect_records())
}

/// Adds a forward rule. The flag reports whether a redirect covers the target.
pub fn add_forward(ctx: &RoleContext, request: &ForwardRequest) -> anyhow::Result<(ForwardRule, bool)> {
    let files = ctx.files();
    let base = ctx.settings.forward_base_port;
    store(ctx).mutate(|state| {
        let before = state.clone();
        let rule = forward::plan_rule(&state.forward_rules, request, base, &SocketProbe)?;
        state.forward_rules.push(rule.clone());
        artifacts::sync(&files, Some(&before), state)?;
        let covered = forward::has_matching_redirect(&state.server_redirects, &rule.target_ip);
        Ok((rule, covered))
    })
}

pub fn remove_forward(
    ctx: &RoleContext,
    selector: &ForwardSelector,
    ignore_missing: bool,
) -> anyhow::Result<Vec<ForwardRule>> {
    let files = ctx.files();
    store(ctx).mutate(|state| {
        let before = state.clone();
        match forward::remove_rules(&mut state.forward_rules, selector) {
            Ok(removed) => {
                artifacts::sync(&files, Some(&before), state)?;
                Ok(removed)
            }
            Err(forward::ForwardError::NotFound) if ignore_missing => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    })
}

pub fn list_forwards(ctx: &RoleContext) -> anyhow::Result<Vec<ForwardRule>> {
    Ok(forward::sorted(&store(ctx).load_required()?.forward_rules))
}

pub fn list_reverse(ctx: &RoleContext) -> anyhow::Result<Vec<ServerReverseRecord>> {
    let state = store(ctx).load_required()?;
    let routing = load_document(&ctx.files().routing())?;
    Ok(artifacts::reverse_records(&routing, &state))
}

/// Removes one portal with its routing rule and redirects.
pub fn remove_reverse(ctx: &RoleContext, tag: &str, ignore_missing: bool) -> anyhow::Result<Option<String>> {
    let files = ctx.files();
    store(ctx).mutate(|state| {
        let before = state.clone();
        let key = state
            .reverse_channels
            .keys()
            .find(|k| normalize_key(k) == normalize_key(tag))
            .cloned();
        match state.remove_reverse_channel(tag) {
            Ok(_) => {
                let key = key.unwrap_or_else(|| tag.trim().to_string());
                drop_redirects_to(state, std::slice::from_ref(&key));
                artifacts::sync(&files, Some(&before), state)?;
                Ok(Some(key))
            }
            Err(ReverseError::NotFound(_)) if ignore_missing => Ok(None),
            Err(err) => Err(err.into()),
        }
    })
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub xray_log_file: Option<PathBuf>,
}

/// Runs xray_core plus the diagnostics responder until SIGINT/SIGTERM.
pub async fn run(ctx: &RoleContext, opts: &RunOptions) -> anyhow::Result<()> {
    let state = store(ctx).load_required()?;
    let files = ctx.files();
    process::check_artifacts(&files)?;
    let binary = process::resolve_xray_binary(&ctx.layout, ctx.settings.xray_bin.as_deref())?;

    let heartbeat = Arc::new(HeartbeatStore::new(
        ctx.layout.heartbeat_path(),
        ctx.settings.heartbeat_interval,
    ));
    let (stop_tx, stop_rx) = watch::channel(false);
    let diag = SocketAddr::from((Ipv4Addr::UNSPECIFIED, ctx.settings.client.diag_port));
    match DiagnosticsResponder::bind(diag).await {
        Ok(responder) => {
            tokio::spawn(responder.serve(Some(heartbeat.clone()), stop_rx));
        }
        Err(err) => warn!("diagnostics responder disabled: {err:#}"),
    }

    info!(
        host = %state.host,
        port = state.port,
        config_dir = %files.dir().display(),
        "starting xp2p server"
    );
    let sinks = LogSinks {
        error_log: Some(ctx.layout.error_log_path(Role::Server)),
        extra: opts.xray_log_file.clone(),
    };
    let result = process::supervise(
        &ProcessSpec::xray(&binary, files.dir()),
        &sinks,
        Some(heartbeat.as_ref()),
        process::STABILISATION_WINDOW,
        runtime::wait_for_shutdown(),
    )
    .await;
    let _ = stop_tx.send(true);
    result
}
