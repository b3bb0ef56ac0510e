//! Client role: endpoints, redirects, forwards, reverse bridges and the run loop.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::artifacts::client::{self as artifacts, ClientPorts, ClientReverseRecord};
use crate::artifacts::load_document;
use crate::config::RoleContext;
use crate::domain::{self, normalize_key, Role};
use crate::endpoint::{Endpoint, EndpointError};
use crate::forward::{self, ForwardRequest, ForwardRule, ForwardSelector, SocketProbe};
use crate::heartbeat::runner::HeartbeatRunner;
use crate::heartbeat::HeartbeatStore;
use crate::identity::TrojanLink;
use crate::process::{self, LogSinks, ProcessSpec};
use crate::redirect::{self, RedirectError, RedirectRecord, RedirectRule, RedirectTarget};
use crate::reverse::ReverseError;
use crate::runtime;
use crate::store::{self, ClientStore, StoreError};

#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    pub link: Option<String>,
    pub address: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub server_name: Option<String>,
    pub allow_insecure: bool,
    /// Forces certificate verification even when the link allows insecure TLS.
    pub strict_tls: bool,
    pub force: bool,
}

#[derive(Debug, Clone)]
pub struct Installed {
    pub endpoint: Endpoint,
    pub replaced: bool,
    pub reverse_tag: String,
    pub config_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RemoveOptions {
    pub all: bool,
    pub keep_files: bool,
    pub ignore_missing: bool,
}

/// What `client remove` did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Removal {
    pub endpoint: Option<Endpoint>,
    pub uninstalled: bool,
}

fn store(ctx: &RoleContext) -> ClientStore {
    ClientStore::open(&ctx.layout)
}

fn ports(ctx: &RoleContext) -> ClientPorts {
    ClientPorts {
        socks: ctx.settings.client.socks_port,
        diag: ctx.settings.client.diag_port,
    }
}

fn required<'a>(value: Option<&'a str>, flag: &str) -> anyhow::Result<&'a str> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| anyhow::anyhow!("{flag} is required"))
}

/// Builds the endpoint from `--link` or from the individual flags.
pub fn endpoint_from(opts: &InstallOptions, default_port: u16) -> anyhow::Result<Endpoint> {
    let mut endpoint = match opts.link.as_deref().map(str::trim).filter(|l| !l.is_empty()) {
        Some(raw) => {
            let link: TrojanLink = raw.parse()?;
            Endpoint::new(
                &link.host,
                link.port,
                &link.user,
                &link.password,
                link.server_name.as_deref(),
                link.allow_insecure || opts.allow_insecure,
            )
        }
        None => Endpoint::new(
            required(opts.address.as_deref(), "--host")?,
            opts.port.unwrap_or(default_port),
            required(opts.user.as_deref(), "--user")?,
            required(opts.password.as_deref(), "--password")?,
            opts.server_name.as_deref(),
            opts.allow_insecure,
        ),
    };
    if opts.strict_tls {
        endpoint.allow_insecure = false;
    }
    domain::validate_host(&endpoint.address)?;
    if endpoint.port == 0 {
        anyhow::bail!("invalid port 0");
    }
    Ok(endpoint)
}

/// Adds (or with `force` replaces) an endpoint, installing the role on first use.
pub fn install(ctx: &RoleContext, opts: &InstallOptions) -> anyhow::Result<Installed> {
    let endpoint = endpoint_from(opts, ctx.settings.server.port)?;
    let files = ctx.files();
    let ports = ports(ctx);
    let suffix = ctx.settings.reverse_suffix.as_str();

    let installed = store(ctx).upsert(&ctx.config_dir, |state, existed| {
        let before = existed.then(|| state.clone());
        let replaced = state.upsert_endpoint(endpoint.clone(), opts.force)?;
        if let Some(old) = &replaced {
            let old_tag = normalize_key(&old.tag);
            state
                .reverse
                .retain(|_, ch| normalize_key(&ch.endpoint_tag) != old_tag);
        }
        let reverse_tag = state.ensure_reverse_channel(&endpoint, suffix)?;
        artifacts::sync(&files, ports, before.as_ref(), state)?;
        Ok(Installed {
            endpoint: endpoint.clone(),
            replaced: replaced.is_some(),
            reverse_tag,
            config_dir: files.dir().to_path_buf(),
        })
    })?;

    process::install_binary(&ctx.layout, ctx.settings.xray_bin.as_deref())?;
    info!(
        host = %installed.endpoint.hostname,
        tag = %installed.endpoint.tag,
        replaced = installed.replaced,
        config_dir = %installed.config_dir.display(),
        "client endpoint installed"
    );
    Ok(installed)
}

pub fn list(ctx: &RoleContext) -> anyhow::Result<Vec<Endpoint>> {
    let mut endpoints = store(ctx).load_required()?.endpoints;
    endpoints.sort_by(|a, b| normalize_key(&a.hostname).cmp(&normalize_key(&b.hostname)));
    Ok(endpoints)
}

fn uninstall(ctx: &RoleContext, opts: RemoveOptions) -> anyhow::Result<bool> {
    let files = ctx.files();
    let removed = store(ctx).remove(|previous| {
        if previous.is_none() && !opts.ignore_missing {
            return Err(StoreError::NotInstalled {
                role: Role::Client,
                root: ctx.layout.root().display().to_string(),
            }
            .into());
        }
        if !opts.keep_files && files.purge()? {
            info!(config_dir = %files.dir().display(), "removed client configuration");
        }
        Ok(())
    })?;
    store::release_shared(&ctx.layout)?;
    Ok(removed)
}

/// Removes one endpoint, or the whole role with `--all` or no target.
/// Dropping the last endpoint uninstalls the role.
pub fn remove(ctx: &RoleContext, target: Option<&str>, opts: RemoveOptions) -> anyhow::Result<Removal> {
    let target = target.map(str::trim).filter(|t| !t.is_empty());
    let Some(target) = target.filter(|_| !opts.all) else {
        let uninstalled = uninstall(ctx, opts)?;
        return Ok(Removal {
            endpoint: None,
            uninstalled,
        });
    };

    let client = store(ctx);
    if client.load()?.is_none() {
        if opts.ignore_missing {
            return Ok(Removal::default());
        }
        client.load_required()?;
    }

    let files = ctx.files();
    let ports = ports(ctx);
    let outcome = client.mutate(|state| {
        let before = state.clone();
        let removed = match state.remove_endpoint(target) {
            Ok(ep) => ep,
            Err(EndpointError::NotFound(_)) if opts.ignore_missing => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        artifacts::sync(&files, ports, Some(&before), state)?;
        Ok(Some((removed, state.endpoints.is_empty())))
    })?;

    let Some((endpoint, last)) = outcome else {
        return Ok(Removal::default());
    };
    info!(host = %endpoint.hostname, tag = %endpoint.tag, "client endpoint removed");
    let uninstalled = last && uninstall(ctx, RemoveOptions { ignore_missing: true, ..opts })?;
    Ok(Removal {
        endpoint: Some(endpoint),
        uninstalled,
    })
}

pub fn add_redirect(
    ctx: &RoleContext,
    target: &RedirectTarget,
    tag: Option<&str>,
    host: Option<&str>,
) -> anyhow::Result<bool> {
    let files = ctx.files();
    let ports = ports(ctx);
    store(ctx).mutate(|state| {
        let before = state.clone();
        let binding = redirect::resolve_binding(Role::Client, &state.redirect_bindings(), tag, host)?;
        let added = redirect::add_rule(&mut state.redirects, target, &binding);
        if added {
            artifacts::sync(&files, ports, Some(&before), state)?;
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
    let ports = ports(ctx);
    let selected = |v: Option<&str>| v.map(str::trim).filter(|s| !s.is_empty()).is_some();
    store(ctx).mutate(|state| {
        let before = state.clone();
        let selector = if selected(tag) || selected(host) {
            match redirect::resolve_binding(Role::Client, &state.redirect_bindings(), tag, host) {
                Ok(binding) => Some(binding.tag),
                Err(_) if ignore_missing => return Ok(Vec::new()),
                Err(err) => return Err(err.into()),
            }
        } else {
            None
        };
        match redirect::remove_rules(&mut state.redirects, target, selector.as_deref()) {
            Ok(removed) => {
                artifacts::sync(&files, ports, Some(&before), state)?;
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
    let ports = ports(ctx);
    let base = ctx.settings.forward_base_port;
    store(ctx).mutate(|state| {
        let before = state.clone();
        let rule = forward::plan_rule(&state.forwards, request, base, &SocketProbe)?;
        state.forwards.push(rule.clone());
        artifacts::sync(&files, ports, Some(&before), state)?;
        let covered = forward::has_matching_redirect(&state.redirects, &rule.target_ip);
        Ok((rule, covered))
    })
}

pub fn remove_forward(
    ctx: &RoleContext,
    selector: &ForwardSelector,
    ignore_missing: bool,
) -> anyhow::Result<Vec<ForwardRule>> {
    let files = ctx.files();
    let ports = ports(ctx);
    store(ctx).mutate(|state| {
        let before = state.clone();
        match forward::remove_rules(&mut state.forwards, selector) {
            Ok(removed) => {
                artifacts::sync(&files, ports, Some(&before), state)?;
                Ok(removed)
            }
            Err(forward::ForwardError::NotFound) if ignore_missing => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    })
}

pub fn list_forwards(ctx: &RoleContext) -> anyhow::Result<Vec<ForwardRule>> {
    Ok(forward::sorted(&store(ctx).load_required()?.forwards))
}

pub fn list_reverse(ctx: &RoleContext) -> anyhow::Result<Vec<ClientReverseRecord>> {
    let state = store(ctx).load_required()?;
    let routing = load_document(&ctx.files().routing())?;
    Ok(artifacts::reverse_records(&routing, &state))
}

pub fn remove_reverse(ctx: &RoleContext, tag: &str, ignore_missing: bool) -> anyhow::Result<Option<String>> {
    let files = ctx.files();
    let ports = ports(ctx);
    store(ctx).mutate(|state| {
        let before = state.clone();
        match state.remove_reverse_channel(tag) {
            Ok(channel) => {
                artifacts::sync(&files, ports, Some(&before), state)?;
                Ok(Some(channel.tag))
            }
            Err(ReverseError::NotFound(_)) if ignore_missing => Ok(None),
            Err(err) => Err(err.into()),
        }
    })
}

/// Local SOCKS proxy of an installed client, if its inbounds declare one.
pub fn socks_proxy(ctx: &RoleContext) -> Option<String> {
    let inbounds = load_document(&ctx.files().inbounds()).ok()?;
    artifacts::socks_address(&inbounds)
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub xray_log_file: Option<PathBuf>,
}

/// Runs xray_core plus the heartbeat loop until SIGINT/SIGTERM.
pub async fn run(ctx: &RoleContext, opts: &RunOptions) -> anyhow::Result<()> {
    let state = store(ctx).load_required()?;
    let files = ctx.files();
    process::check_artifacts(&files)?;
    let binary = process::resolve_xray_binary(&ctx.layout, ctx.settings.xray_bin.as_deref())?;
    if state.endpoints.is_empty() {
        warn!("no client endpoints configured; heartbeats disabled");
    }

    let heartbeat = Arc::new(HeartbeatStore::new(
        ctx.layout.heartbeat_path(),
        ctx.settings.heartbeat_interval,
    ));
    let socks = socks_proxy(ctx)
        .unwrap_or_else(|| format!("127.0.0.1:{}", ctx.settings.client.socks_port));
    let (stop_tx, stop_rx) = watch::channel(false);
    if !state.endpoints.is_empty() {
        let runner = HeartbeatRunner::new(
            heartbeat.clone(),
            state.endpoints.clone(),
            ctx.settings.client.diag_port,
            Some(socks),
        );
        // Heartbeats start once xray_core is up so the SOCKS fallback has a listener.
        tokio::spawn(async move {
            tokio::time::sleep(process::STABILISATION_WINDOW).await;
            runner.run(stop_rx).await;
        });
    }

    info!(
        endpoints = state.endpoints.len(),
        config_dir = %files.dir().display(),
        "starting xp2p client"
    );
    let sinks = LogSinks {
        error_log: Some(ctx.layout.error_log_path(Role::Client)),
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

#[cfg(test)]
mod tests {
    use std::path::Path;

    use serde_json::Value;

    use super::*;
    use crate::config::Xp2pConfig;
    use crate::domain::ForwardProtocol;

    const LINK: &str = "trojan://s3cret@10.62.10.11:62022?security=tls&allowInsecure=1&sni=10.62.10.11#alpha";

    fn ctx(root: &Path) -> RoleContext {
        RoleContext::resolve(&Xp2pConfig::default(), Role::Client, Some(root), None).expect("ctx")
    }

    fn install_link(ctx: &RoleContext, link: &str, force: bool) -> anyhow::Result<Installed> {
        install(
            ctx,
            &InstallOptions {
                link: Some(link.to_string()),
                force,
                ..InstallOptions::default()
            },
        )
    }

    fn rules(ctx: &RoleContext) -> Vec<Value> {
        let doc = load_document(&ctx.files().routing()).expect("routing");
        doc["routing"]["rules"].as_array().cloned().unwrap_or_default()
    }

    #[test]
    fn install_from_link_writes_bridge() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = ctx(dir.path());
        let installed = install_link(&ctx, LINK, false).expect("install");
        assert_eq!(installed.endpoint.tag, "proxy-10-62-10-11");
        assert_eq!(installed.reverse_tag, "alpha10-62-10-11.rev");
        assert!(!installed.replaced);
        assert!(ctx.files().missing().is_empty());

        let rules = rules(&ctx);
        assert!(rules.iter().any(|r| {
            r["inboundTag"][0] == "alpha10-62-10-11.rev" && r["outboundTag"] == "proxy-10-62-10-11"
        }));
        assert!(rules
            .iter()
            .any(|r| r["inboundTag"][0] == "alpha10-62-10-11.rev" && r["outboundTag"] == "direct"));

        let records = list_reverse(&ctx).expect("reverse");
        assert_eq!(records.len(), 1);
        assert!(records[0].bridge && records[0].direct_rule);
        assert_eq!(socks_proxy(&ctx).as_deref(), Some("127.0.0.1:51180"));
    }

    #[test]
    fn install_from_flags_needs_credentials() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = ctx(dir.path());
        let err = install(
            &ctx,
            &InstallOptions {
                address: Some("edge.example.org".to_string()),
                user: Some("bravo".to_string()),
                ..InstallOptions::default()
            },
        )
        .expect_err("no password");
        assert!(err.to_string().contains("--password is required"));

        let installed = install(
            &ctx,
            &InstallOptions {
                address: Some("edge.example.org".to_string()),
                user: Some("bravo".to_string()),
                password: Some("pw".to_string()),
                server_name: Some("cdn.example.org".to_string()),
                ..InstallOptions::default()
            },
        )
        .expect("install");
        assert_eq!(installed.endpoint.port, 62022);
        assert_eq!(installed.endpoint.server_name, "cdn.example.org");
        assert!(!installed.endpoint.allow_insecure);
    }

    #[test]
    fn strict_tls_overrides_link() {
        let opts = InstallOptions {
            link: Some(LINK.to_string()),
            strict_tls: true,
            ..InstallOptions::default()
        };
        let endpoint = endpoint_from(&opts, 62022).expect("endpoint");
        assert!(!endpoint.allow_insecure);
        assert_eq!(endpoint.server_name, "10.62.10.11");
        assert_eq!(endpoint.user, "alpha");
    }

    #[test]
    fn same_host_needs_force_and_replaces_in_place() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = ctx(dir.path());
        install_link(&ctx, LINK, false).expect("install");

        let err = install_link(&ctx, LINK, false).expect_err("duplicate");
        assert!(err.to_string().contains("already exists (use --force to update)"));

        let relinked = "trojan://other@10.62.10.11:62022?security=tls&sni=10.62.10.11#bravo";
        let installed = install_link(&ctx, relinked, true).expect("force");
        assert!(installed.replaced);
        assert_eq!(installed.reverse_tag, "bravo10-62-10-11.rev");

        let endpoints = list(&ctx).expect("list");
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].password, "other");
        let tags: Vec<String> = list_reverse(&ctx).expect("reverse").into_iter().map(|r| r.tag).collect();
        assert_eq!(tags, vec!["bravo10-62-10-11.rev".to_string()]);
        let raw = std::fs::read_to_string(ctx.files().routing()).expect("routing");
        assert!(!raw.contains("alpha10-62-10-11.rev"));
    }

    #[test]
    fn removing_last_endpoint_uninstalls() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = ctx(dir.path());
        install_link(&ctx, LINK, false).expect("first");
        install_link(&ctx, "trojan://pw@10.62.10.12:62022#alpha", false).expect("second");
        let target = RedirectTarget::cidr("10.50.0.0/16").expect("cidr");
        add_redirect(&ctx, &target, None, Some("10.62.10.12")).expect("redirect");

        let removal = remove(&ctx, Some("proxy-10-62-10-12"), RemoveOptions::default()).expect("remove");
        assert_eq!(removal.endpoint.map(|e| e.hostname).as_deref(), Some("10.62.10.12"));
        assert!(!removal.uninstalled);
        let state = store(&ctx).load_required().expect("state");
        assert!(state.redirects.is_empty());

        let err = remove(&ctx, Some("10.9.9.9"), RemoveOptions::default()).expect_err("unknown");
        assert!(err.to_string().contains("not found"));
        let ignored = remove(
            &ctx,
            Some("10.9.9.9"),
            RemoveOptions {
                ignore_missing: true,
                ..RemoveOptions::default()
            },
        )
        .expect("ignored");
        assert_eq!(ignored, Removal::default());

        let removal = remove(&ctx, Some("10.62.10.11"), RemoveOptions::default()).expect("last");
        assert!(removal.uninstalled);
        assert!(!ctx.layout.state_path(Role::Client).exists());
        assert!(!ctx.files().dir().exists());
    }

    #[test]
    fn remove_all_respects_keep_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = ctx(dir.path());
        install_link(&ctx, LINK, false).expect("install");
        let opts = RemoveOptions {
            all: true,
            keep_files: true,
            ignore_missing: false,
        };
        assert!(remove(&ctx, Some("10.62.10.11"), opts).expect("remove").uninstalled);
        assert!(ctx.files().inbounds().is_file());
        assert!(remove(&ctx, None, opts).is_err());
    }

    #[test]
    fn redirect_lifecycle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = ctx(dir.path());
        install_link(&ctx, LINK, false).expect("install");
        let target = RedirectTarget::domain("intranet.example").expect("domain");

        let err = add_redirect(&ctx, &target, None, Some("10.1.1.1")).expect_err("unknown host");
        assert!(err.to_string().contains("client endpoint \"10.1.1.1\" not found"));
        assert!(add_redirect(&ctx, &target, Some("proxy-10-62-10-11"), None).expect("add"));
        assert!(!add_redirect(&ctx, &target, None, Some("10.62.10.11")).expect("repeat"));

        let records = list_redirects(&ctx).expect("list");
        assert!(records.iter().any(|r| r.value == "intranet.example" && r.tag == "proxy-10-62-10-11"));
        assert!(records.iter().any(|r| r.value == "10.62.10.11/32"));
        assert!(rules(&ctx)
            .iter()
            .any(|r| r["domains"][0] == "intranet.example" && r["outboundTag"] == "proxy-10-62-10-11"));

        assert_eq!(remove_redirect(&ctx, &target, None, None, false).expect("remove").len(), 1);
        assert!(remove_redirect(&ctx, &target, None, None, true).expect("ignored").is_empty());
        assert!(!rules(&ctx).iter().any(|r| r["domains"][0] == "intranet.example"));
    }

    #[test]
    fn forward_reports_redirect_coverage() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = ctx(dir.path());
        install_link(&ctx, LINK, false).expect("install");
        let target = RedirectTarget::cidr("10.50.0.0/16").expect("cidr");
        add_redirect(&ctx, &target, Some("proxy-10-62-10-11"), None).expect("redirect");

        let (rule, covered) = add_forward(
            &ctx,
            &ForwardRequest {
                target: "10.50.1.20:22".to_string(),
                protocol: ForwardProtocol::Both,
                remark: Some("ssh".to_string()),
                ..ForwardRequest::default()
            },
        )
        .expect("forward");
        assert!(covered);
        assert_eq!(rule.tag, forward::inbound_tag(rule.listen_port));
        assert_eq!(list_forwards(&ctx).expect("list"), vec![rule.clone()]);

        let selector = ForwardSelector {
            remark: Some("ssh".to_string()),
            ..ForwardSelector::default()
        };
        assert_eq!(remove_forward(&ctx, &selector, false).expect("remove").len(), 1);
        assert!(remove_forward(&ctx, &selector, true).expect("ignored").is_empty());
        assert!(remove_forward(&ctx, &selector, false).is_err());
    }

    #[test]
    fn reverse_remove_drops_bridge() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = ctx(dir.path());
        install_link(&ctx, LINK, false).expect("install");

        assert_eq!(
            remove_reverse(&ctx, "ALPHA10-62-10-11.rev", false).expect("remove").as_deref(),
            Some("alpha10-62-10-11.rev")
        );
        assert!(list_reverse(&ctx).expect("list").is_empty());
        assert!(remove_reverse(&ctx, "alpha10-62-10-11.rev", true).expect("ignored").is_none());
        let err = remove_reverse(&ctx, "alpha10-62-10-11.rev", false).expect_err("gone");
        assert!(err.to_string().contains("reverse tunnel alpha10-62-10-11.rev not found"));
    }
}
