mod artifacts;
mod certs;
mod client;
mod config;
mod domain;
mod endpoint;
mod forward;
mod heartbeat;
mod identity;
mod ping;
mod process;
mod redirect;
mod reverse;
mod runtime;
mod server;
mod stateview;
mod store;

use std::io::{self, IsTerminal};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use tabled::settings::Style;
use tabled::Tabled;
use tracing::{info, warn};

use crate::config::{RoleContext, Xp2pConfig};
use crate::domain::{ForwardProtocol, Role};
use crate::forward::{ForwardRequest, ForwardRule, ForwardSelector};
use crate::identity::UserChange;
use crate::ping::{PingOptions, PingProto};
use crate::redirect::{RedirectRecord, RedirectTarget};

#[derive(Parser)]
#[command(name = "xp2p", version, about = "Trojan tunnel orchestration agent for xray-core")]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Log level used when RUST_LOG is unset
    #[arg(long, global = true)]
    log_level: Option<String>,
    /// Installation directory
    #[arg(long, global = true)]
    path: Option<PathBuf>,
    /// Configuration directory name
    #[arg(long, global = true)]
    config_dir: Option<String>,
    /// Only log warnings and errors
    #[arg(long, global = true)]
    quiet: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the trojan server role
    Server {
        #[command(subcommand)]
        action: ServerCommands,
    },
    /// Manage the client role
    Client {
        #[command(subcommand)]
        action: ClientCommands,
    },
    /// Probe a diagnostics port
    Ping(PingArgs),
}

#[derive(Subcommand)]
enum ServerCommands {
    /// Install the server: certificate, first user and xray configuration
    Install {
        /// Public host name or IP written into links
        #[arg(long)]
        host: Option<String>,
        /// Trojan listener port
        #[arg(long)]
        port: Option<u16>,
        /// PEM certificate (self-signed when omitted)
        #[arg(long, requires = "key")]
        cert: Option<PathBuf>,
        /// PEM private key
        #[arg(long, requires = "cert")]
        key: Option<PathBuf>,
        /// Initial user id (generated when omitted)
        #[arg(long = "id", alias = "user")]
        user: Option<String>,
        /// Initial user password (generated when omitted)
        #[arg(long)]
        password: Option<String>,
        /// Overwrite an existing installation
        #[arg(long)]
        force: bool,
    },
    /// Remove the server role
    Remove(RemoveArgs),
    /// Run xray-core in the foreground
    Run(RunArgs),
    /// Show heartbeat state
    State(StateArgs),
    /// Manage trojan users
    User {
        #[command(subcommand)]
        action: UserCommands,
    },
    /// Manage the TLS certificate
    Cert {
        #[command(subcommand)]
        action: CertCommands,
    },
    /// Route destinations into reverse portals
    Redirect {
        #[command(subcommand)]
        action: RedirectCommands,
    },
    /// Forward local ports to remote targets
    Forward {
        #[command(subcommand)]
        action: ForwardCommands,
    },
    /// Inspect reverse portals
    Reverse {
        #[command(subcommand)]
        action: ReverseCommands,
    },
}

#[derive(Subcommand)]
enum ClientCommands {
    /// Add a server endpoint (installs the client role on first use)
    Install {
        /// trojan:// link printed by `server install`
        #[arg(long)]
        link: Option<String>,
        /// Server host
        #[arg(long, alias = "server-address", conflicts_with = "link")]
        host: Option<String>,
        /// Server port
        #[arg(long, alias = "server-port", conflicts_with = "link")]
        port: Option<u16>,
        /// Trojan user
        #[arg(long, conflicts_with = "link")]
        user: Option<String>,
        /// Trojan password
        #[arg(long, conflicts_with = "link")]
        password: Option<String>,
        /// TLS server name
        #[arg(long, alias = "server-name", conflicts_with = "link")]
        sni: Option<String>,
        /// Skip certificate verification
        #[arg(long)]
        allow_insecure: bool,
        /// Always verify the certificate
        #[arg(long, conflicts_with = "allow_insecure")]
        strict_tls: bool,
        /// Replace an existing endpoint for the same host
        #[arg(long)]
        force: bool,
    },
    /// Remove one endpoint by host or tag, or the whole client role
    Remove {
        /// Endpoint host name or outbound tag
        target: Option<String>,
        /// Remove every endpoint and the client role
        #[arg(long)]
        all: bool,
        #[arg(long)]
        keep_files: bool,
        #[arg(long)]
        ignore_missing: bool,
    },
    /// List configured endpoints
    List,
    /// Run xray-core in the foreground
    Run(RunArgs),
    /// Show heartbeat state
    State(StateArgs),
    /// Route destinations through an endpoint
    Redirect {
        #[command(subcommand)]
        action: RedirectCommands,
    },
    /// Forward local ports to remote targets
    Forward {
        #[command(subcommand)]
        action: ForwardCommands,
    },
    /// Inspect reverse bridges
    Reverse {
        #[command(subcommand)]
        action: ReverseCommands,
    },
}

#[derive(Args)]
struct RemoveArgs {
    /// Keep configuration files
    #[arg(long)]
    keep_files: bool,
    /// Succeed when nothing is installed
    #[arg(long)]
    ignore_missing: bool,
}

#[derive(Args)]
struct RunArgs {
    /// Also append xray-core stderr to this file
    #[arg(long)]
    xray_log_file: Option<PathBuf>,
    /// Install with defaults when the role is missing (server only)
    #[arg(long)]
    auto_install: bool,
}

#[derive(Args)]
struct StateArgs {
    /// Repaint until interrupted
    #[arg(long)]
    watch: bool,
    /// Refresh interval for --watch
    #[arg(long, default_value = "2s", value_parser = runtime::parse_duration)]
    interval: Duration,
    /// Print JSON instead of a table
    #[arg(long, conflicts_with = "watch")]
    json: bool,
}

#[derive(Subcommand)]
enum UserCommands {
    /// Add a user or change its password
    Add {
        #[arg(long)]
        id: String,
        #[arg(long)]
        password: Option<String>,
        /// Host written into the printed link
        #[arg(long)]
        host: Option<String>,
    },
    /// Remove a user and its reverse portal
    Remove {
        #[arg(long)]
        id: String,
    },
    /// List users with their links
    List,
    /// Print the link for one user
    Link {
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        host: Option<String>,
    },
}

#[derive(Subcommand)]
enum CertCommands {
    /// Install a certificate (self-signed when --cert/--key are omitted)
    Set {
        #[arg(long, requires = "key")]
        cert: Option<PathBuf>,
        #[arg(long, requires = "cert")]
        key: Option<PathBuf>,
        /// Server name for the certificate and links
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        force: bool,
    },
}

#[derive(Args)]
struct RedirectArgs {
    #[arg(long)]
    cidr: Option<String>,
    #[arg(long)]
    domain: Option<String>,
    /// Outbound tag
    #[arg(long)]
    tag: Option<String>,
    /// Endpoint or portal host
    #[arg(long)]
    host: Option<String>,
}

impl RedirectArgs {
    fn target(&self) -> anyhow::Result<RedirectTarget> {
        Ok(RedirectTarget::from_flags(self.cidr.as_deref(), self.domain.as_deref())?)
    }
}

#[derive(Subcommand)]
enum RedirectCommands {
    /// Add a redirect rule
    Add(RedirectArgs),
    /// Remove matching redirect rules
    Remove {
        #[command(flatten)]
        rule: RedirectArgs,
        #[arg(long)]
        ignore_missing: bool,
    },
    /// List redirect rules
    List,
}

fn parse_protocol(raw: &str) -> Result<ForwardProtocol, domain::DomainError> {
    raw.parse()
}

#[derive(Subcommand)]
enum ForwardCommands {
    /// Add a forward rule
    Add {
        /// Destination IP:PORT
        #[arg(long)]
        target: String,
        /// Listen address
        #[arg(long)]
        listen: Option<String>,
        /// Listen port (allocated from the base port when omitted)
        #[arg(long)]
        listen_port: Option<u16>,
        /// tcp, udp or both
        #[arg(long, default_value = "tcp", value_parser = parse_protocol)]
        proto: ForwardProtocol,
        #[arg(long)]
        tag: Option<String>,
        #[arg(long)]
        remark: Option<String>,
        /// First port probed when allocating
        #[arg(long)]
        base_port: Option<u16>,
    },
    /// Remove forward rules by port, tag or remark
    Remove {
        #[arg(long)]
        listen_port: Option<u16>,
        #[arg(long)]
        tag: Option<String>,
        #[arg(long)]
        remark: Option<String>,
        #[arg(long)]
        ignore_missing: bool,
    },
    /// List forward rules
    List,
}

#[derive(Subcommand)]
enum ReverseCommands {
    /// List reverse channels and their artifacts
    List,
    /// Remove one reverse channel
    Remove {
        #[arg(long)]
        tag: String,
        #[arg(long)]
        ignore_missing: bool,
    },
}

#[derive(Args)]
struct PingArgs {
    /// Host or IP to probe
    target: String,
    /// Target port (defaults to the diagnostics port)
    #[arg(long)]
    port: Option<u16>,
    #[arg(long, default_value_t = ping::DEFAULT_COUNT)]
    count: u32,
    /// Per-probe timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,
    #[arg(long, value_enum, default_value_t = PingProto::Tcp)]
    proto: PingProto,
    /// Go through a SOCKS5 proxy; without a value the installed SOCKS inbound is used
    #[arg(long, num_args = 0..=1, default_missing_value = "")]
    socks: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if !io::stdout().is_terminal() {
        colored::control::set_override(false);
    }
    if let Err(err) = run(cli).await {
        eprintln!("xp2p: {err:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let log = runtime::init_tracing(if cli.quiet { "warn" } else { "info" });
    let settings = Xp2pConfig::load(cli.config.as_deref())?;
    match (&cli.log_level, cli.quiet) {
        (Some(level), _) => log.apply(level),
        (None, false) => log.apply(&settings.log_level),
        (None, true) => {}
    }

    let context = |role| {
        RoleContext::resolve(&settings, role, cli.path.as_deref(), cli.config_dir.as_deref())
    };
    match cli.command {
        Commands::Server { action } => run_server(context(Role::Server)?, action).await,
        Commands::Client { action } => run_client(context(Role::Client)?, action).await,
        Commands::Ping(args) => run_ping(&settings, cli.path.as_deref(), args).await,
    }
}

async fn run_server(ctx: RoleContext, action: ServerCommands) -> anyhow::Result<()> {
    match action {
        ServerCommands::Install {
            host,
            port,
            cert,
            key,
            user,
            password,
            force,
        } => {
            let opts = server::InstallOptions {
                host: server::resolve_host(host.as_deref(), &ctx.settings),
                port,
                cert: cert.or_else(|| ctx.settings.server.cert.clone()),
                key: key.or_else(|| ctx.settings.server.key.clone()),
                user,
                password,
                force,
            };
            let installed = server::install(&ctx, &opts)?;
            print_credentials(&installed.user.id, &installed.user.password, &installed.link.render());
            Ok(())
        }
        ServerCommands::Remove(args) => {
            let removed = server::remove(
                &ctx,
                server::RemoveOptions {
                    keep_files: args.keep_files,
                    ignore_missing: args.ignore_missing,
                },
            )?;
            if removed {
                println!("{} xp2p server removed from {}", "-".red().bold(), ctx.layout.root().display());
            }
            Ok(())
        }
        ServerCommands::Run(args) => {
            if args.auto_install && store::ServerStore::open(&ctx.layout).load()?.is_none() {
                info!("server not installed, installing with defaults");
                let opts = server::InstallOptions {
                    host: server::resolve_host(None, &ctx.settings),
                    cert: ctx.settings.server.cert.clone(),
                    key: ctx.settings.server.key.clone(),
                    ..server::InstallOptions::default()
                };
                let installed = server::install(&ctx, &opts)?;
                print_credentials(&installed.user.id, &installed.user.password, &installed.link.render());
            }
            server::run(
                &ctx,
                &server::RunOptions {
                    xray_log_file: args.xray_log_file,
                },
            )
            .await
        }
        ServerCommands::State(args) => show_state(&ctx, args).await,
        ServerCommands::User { action } => run_server_user(&ctx, action),
        ServerCommands::Cert {
            action:
                CertCommands::Set {
                    cert,
                    key,
                    host,
                    force,
                },
        } => {
            let tls = server::set_certificate(
                &ctx,
                &server::CertOptions {
                    cert,
                    key,
                    host,
                    force,
                },
            )?;
            println!("Applied certificate {}", tls.cert_path);
            Ok(())
        }
        ServerCommands::Redirect { action } => match action {
            RedirectCommands::Add(args) => {
                let target = args.target()?;
                let added = server::add_redirect(&ctx, &target, args.tag.as_deref(), args.host.as_deref())?;
                print_redirect_added(&target, added);
                Ok(())
            }
            RedirectCommands::Remove {
                rule,
                ignore_missing,
            } => {
                let target = rule.target()?;
                let removed = server::remove_redirect(
                    &ctx,
                    &target,
                    rule.tag.as_deref(),
                    rule.host.as_deref(),
                    ignore_missing,
                )?;
                print_redirect_removed(&target, removed.len());
                Ok(())
            }
            RedirectCommands::List => {
                print_redirects(&server::list_redirects(&ctx)?, "No server redirect rules configured.");
                Ok(())
            }
        },
        ServerCommands::Forward { action } => match action {
            ForwardCommands::List => {
                print_forwards(&server::list_forwards(&ctx)?);
                Ok(())
            }
            ForwardCommands::Add { .. } => {
                let (ctx, request) = forward_request(ctx, action);
                let (rule, covered) = server::add_forward(&ctx, &request)?;
                print_forward_added(&rule, covered, Role::Server);
                Ok(())
            }
            ForwardCommands::Remove {
                listen_port,
                tag,
                remark,
                ignore_missing,
            } => {
                let selector = ForwardSelector {
                    listen_port,
                    tag,
                    remark,
                };
                print_forwards_removed(&server::remove_forward(&ctx, &selector, ignore_missing)?);
                Ok(())
            }
        },
        ServerCommands::Reverse { action } => match action {
            ReverseCommands::List => {
                print_server_reverse(&server::list_reverse(&ctx)?);
                Ok(())
            }
            ReverseCommands::Remove {
                tag,
                ignore_missing,
            } => {
                if let Some(tag) = server::remove_reverse(&ctx, &tag, ignore_missing)? {
                    println!("Removed reverse tunnel {tag}");
                }
                Ok(())
            }
        },
    }
}

fn run_server_user(ctx: &RoleContext, action: UserCommands) -> anyhow::Result<()> {
    match action {
        UserCommands::Add { id, password, host } => {
            let (change, link) = server::add_user(ctx, &id, password.as_deref(), host.as_deref())?;
            match change {
                UserChange::Added => println!("{} Added user {}", "+".green().bold(), link.user),
                UserChange::Updated => println!("{} Updated user {}", "~".yellow().bold(), link.user),
                UserChange::Unchanged => println!("User {} unchanged", link.user),
            }
            println!("Link: {link}");
        }
        UserCommands::Remove { id } => match server::remove_user(ctx, &id)? {
            Some(user) => println!("{} Removed user {}", "-".red().bold(), user.id),
            None => println!("User {} not present", id.trim()),
        },
        UserCommands::List => {
            let users = server::list_users(ctx)?;
            if users.is_empty() {
                println!("No Trojan users configured.");
                return Ok(());
            }
            let rows: Vec<UserRow> = users
                .iter()
                .map(|(user, link)| UserRow {
                    user: user.id.clone(),
                    password: user.password.clone(),
                    link: link.render(),
                })
                .collect();
            print_table(&rows);
        }
        UserCommands::Link { id, host } => {
            println!("{}", server::user_link(ctx, id.as_deref(), host.as_deref())?);
        }
    }
    Ok(())
}

async fn run_client(ctx: RoleContext, action: ClientCommands) -> anyhow::Result<()> {
    match action {
        ClientCommands::Install {
            link,
            host,
            port,
            user,
            password,
            sni,
            allow_insecure,
            strict_tls,
            force,
        } => {
            let installed = client::install(
                &ctx,
                &client::InstallOptions {
                    link,
                    address: host,
                    port,
                    user,
                    password,
                    server_name: sni,
                    allow_insecure,
                    strict_tls,
                    force,
                },
            )?;
            let verb = if installed.replaced { "Updated" } else { "Added" };
            println!(
                "{} {verb} endpoint {} ({})",
                "+".green().bold(),
                installed.endpoint.hostname,
                installed.endpoint.tag
            );
            println!("Reverse tunnel {}", installed.reverse_tag);
            Ok(())
        }
        ClientCommands::Remove {
            target,
            all,
            keep_files,
            ignore_missing,
        } => {
            let removal = client::remove(
                &ctx,
                target.as_deref(),
                client::RemoveOptions {
                    all,
                    keep_files,
                    ignore_missing,
                },
            )?;
            if let Some(endpoint) = &removal.endpoint {
                println!("{} Removed endpoint {} ({})", "-".red().bold(), endpoint.hostname, endpoint.tag);
            }
            if removal.uninstalled {
                println!("{} xp2p client removed from {}", "-".red().bold(), ctx.layout.root().display());
            }
            Ok(())
        }
        ClientCommands::List => {
            let endpoints = client::list(&ctx)?;
            if endpoints.is_empty() {
                println!("No client endpoints configured.");
                return Ok(());
            }
            let rows: Vec<EndpointRow> = endpoints
                .iter()
                .map(|ep| EndpointRow {
                    hostname: ep.hostname.clone(),
                    tag: ep.tag.clone(),
                    address: ep.address.clone(),
                    port: ep.port,
                    user: ep.user.clone(),
                    allow_insecure: ep.allow_insecure,
                    server_name: ep.server_name.clone(),
                })
                .collect();
            print_table(&rows);
            Ok(())
        }
        ClientCommands::Run(args) => {
            if args.auto_install {
                warn!("--auto-install is ignored for the client; install an endpoint with --link first");
            }
            client::run(
                &ctx,
                &client::RunOptions {
                    xray_log_file: args.xray_log_file,
                },
            )
            .await
        }
        ClientCommands::State(args) => show_state(&ctx, args).await,
        ClientCommands::Redirect { action } => match action {
            RedirectCommands::Add(args) => {
                let target = args.target()?;
                let added = client::add_redirect(&ctx, &target, args.tag.as_deref(), args.host.as_deref())?;
                print_redirect_added(&target, added);
                Ok(())
            }
            RedirectCommands::Remove {
                rule,
                ignore_missing,
            } => {
                let target = rule.target()?;
                let removed = client::remove_redirect(
                    &ctx,
                    &target,
                    rule.tag.as_deref(),
                    rule.host.as_deref(),
                    ignore_missing,
                )?;
                print_redirect_removed(&target, removed.len());
                Ok(())
            }
            RedirectCommands::List => {
                print_redirects(&client::list_redirects(&ctx)?, "No redirect rules configured.");
                Ok(())
            }
        },
        ClientCommands::Forward { action } => match action {
            ForwardCommands::List => {
                print_forwards(&client::list_forwards(&ctx)?);
                Ok(())
            }
            ForwardCommands::Add { .. } => {
                let (ctx, request) = forward_request(ctx, action);
                let (rule, covered) = client::add_forward(&ctx, &request)?;
                print_forward_added(&rule, covered, Role::Client);
                Ok(())
            }
            ForwardCommands::Remove {
                listen_port,
                tag,
                remark,
                ignore_missing,
            } => {
                let selector = ForwardSelector {
                    listen_port,
                    tag,
                    remark,
                };
                print_forwards_removed(&client::remove_forward(&ctx, &selector, ignore_missing)?);
                Ok(())
            }
        },
        ClientCommands::Reverse { action } => match action {
            ReverseCommands::List => {
                print_client_reverse(&client::list_reverse(&ctx)?);
                Ok(())
            }
            ReverseCommands::Remove {
                tag,
                ignore_missing,
            } => {
                if let Some(tag) = client::remove_reverse(&ctx, &tag, ignore_missing)? {
                    println!("Removed reverse tunnel {tag}");
                }
                Ok(())
            }
        },
    }
}

/// Splits `forward add` flags into the request and a context carrying `--base-port`.
fn forward_request(mut ctx: RoleContext, action: ForwardCommands) -> (RoleContext, ForwardRequest) {
    let ForwardCommands::Add {
        target,
        listen,
        listen_port,
        proto,
        tag,
        remark,
        base_port,
    } = action
    else {
        return (ctx, ForwardRequest::default());
    };
    if let Some(base) = base_port {
        ctx.settings.forward_base_port = base;
    }
    let request = ForwardRequest {
        target,
        listen_address: listen,
        listen_port,
        protocol: proto,
        tag,
        remark,
    };
    (ctx, request)
}

async fn show_state(ctx: &RoleContext, args: StateArgs) -> anyhow::Result<()> {
    let path = ctx.layout.heartbeat_path();
    let interval = ctx.settings.heartbeat_interval;
    let mut out = io::stdout();
    if args.watch {
        stateview::watch(&mut out, &path, interval, args.interval, runtime::wait_for_shutdown()).await
    } else {
        stateview::print(&mut out, &path, interval, args.json)
    }
}

async fn run_ping(settings: &Xp2pConfig, path: Option<&std::path::Path>, args: PingArgs) -> anyhow::Result<()> {
    let socks = match args.socks.as_deref().map(str::trim) {
        None => None,
        Some("") => Some(detect_socks(settings, path)),
        Some(addr) => Some(addr.to_string()),
    };
    let opts = PingOptions {
        count: args.count.max(1),
        timeout: args
            .timeout
            .filter(|t| *t > 0)
            .map(Duration::from_secs)
            .unwrap_or(ping::DEFAULT_TIMEOUT),
        proto: args.proto,
        port: args.port.unwrap_or(settings.client.diag_port),
        socks,
    };
    let mut out = io::stdout();
    ping::run(&args.target, &opts, &mut out).await.map(|_| ())
}

/// SOCKS inbound of the installed client, then server, then the default port.
fn detect_socks(settings: &Xp2pConfig, path: Option<&std::path::Path>) -> String {
    for role in [Role::Client, Role::Server] {
        let found = RoleContext::resolve(settings, role, path, None)
            .ok()
            .and_then(|ctx| client::socks_proxy(&ctx));
        if let Some(addr) = found {
            return addr;
        }
    }
    format!("127.0.0.1:{}", settings.client.socks_port)
}

fn print_credentials(user: &str, password: &str, link: &str) {
    println!("User: {user}");
    println!("Password: {password}");
    println!("Link: {link}");
}

fn print_table<T: Tabled>(rows: &[T]) {
    let table = tabled::Table::new(rows).with(Style::blank()).to_string();
    println!("{table}");
}

fn print_redirect_added(target: &RedirectTarget, added: bool) {
    if added {
        println!("{} Added redirect {target}", "+".green().bold());
    } else {
        println!("Redirect {target} already present");
    }
}

fn print_redirect_removed(target: &RedirectTarget, count: usize) {
    if count > 0 {
        println!("{} Removed redirect {target}", "-".red().bold());
    }
}

fn print_redirects(records: &[RedirectRecord], empty: &str) {
    if records.is_empty() {
        println!("{empty}");
        return;
    }
    let rows: Vec<RedirectRow> = records
        .iter()
        .map(|r| RedirectRow {
            kind: r.kind.label().to_string(),
            value: r.value.clone(),
            tag: r.tag.clone(),
            host: r.host.clone(),
        })
        .collect();
    print_table(&rows);
}

fn print_forward_added(rule: &ForwardRule, covered: bool, role: Role) {
    println!(
        "{} Forward {}:{} -> {} ({}, {})",
        "+".green().bold(),
        rule.listen_address,
        rule.listen_port,
        rule.target(),
        rule.protocol,
        rule.tag
    );
    if !covered {
        warn!(dest = %rule.target(), "xp2p {role} forward has no matching redirect");
    }
}

fn print_forwards_removed(rules: &[ForwardRule]) {
    for rule in rules {
        println!("{} Removed forward {}:{} ({})", "-".red().bold(), rule.listen_address, rule.listen_port, rule.tag);
    }
}

fn print_forwards(rules: &[ForwardRule]) {
    if rules.is_empty() {
        println!("No forward rules configured.");
        return;
    }
    let rows: Vec<ForwardRow> = rules
        .iter()
        .map(|r| ForwardRow {
            listen: format!("{}:{}", r.listen_address, r.listen_port),
            protocols: r.protocol.network().to_string(),
            target: r.target(),
            tag: r.tag.clone(),
            remark: r.remark.clone(),
        })
        .collect();
    print_table(&rows);
}

fn presence(found: bool) -> String {
    if found {
        "present".green().to_string()
    } else {
        "missing".red().to_string()
    }
}

fn print_server_reverse(records: &[artifacts::server::ServerReverseRecord]) {
    if records.is_empty() {
        println!("No reverse tunnels configured.");
        return;
    }
    let rows: Vec<ServerReverseRow> = records
        .iter()
        .map(|r| ServerReverseRow {
            domain: r.domain.clone(),
            host: r.host.clone(),
            user: r.user.clone(),
            outbound_tag: r.tag.clone(),
            portal: presence(r.portal),
            routing_rule: presence(r.routing_rule),
        })
        .collect();
    print_table(&rows);
}

fn print_client_reverse(records: &[artifacts::client::ClientReverseRecord]) {
    if records.is_empty() {
        println!("No reverse tunnels configured.");
        return;
    }
    let rows: Vec<ClientReverseRow> = records
        .iter()
        .map(|r| ClientReverseRow {
            tag: r.tag.clone(),
            host: r.host.clone(),
            user: r.user.clone(),
            endpoint_tag: r.endpoint_tag.clone(),
            bridge: presence(r.bridge),
            direct_rule: presence(r.direct_rule),
        })
        .collect();
    print_table(&rows);
}

#[derive(Tabled)]
struct UserRow {
    #[tabled(rename = "USER")]
    user: String,
    #[tabled(rename = "PASSWORD")]
    password: String,
    #[tabled(rename = "LINK")]
    link: String,
}

#[derive(Tabled)]
struct EndpointRow {
    #[tabled(rename = "HOSTNAME")]
    hostname: String,
    #[tabled(rename = "TAG")]
    tag: String,
    #[tabled(rename = "ADDRESS")]
    address: String,
    #[tabled(rename = "PORT")]
    port: u16,
    #[tabled(rename = "USER")]
    user: String,
    #[tabled(rename = "ALLOW_INSECURE")]
    allow_insecure: bool,
    #[tabled(rename = "SERVER_NAME")]
    server_name: String,
}

#[derive(Tabled)]
struct RedirectRow {
    #[tabled(rename = "TYPE")]
    kind: String,
    #[tabled(rename = "VALUE")]
    value: String,
    #[tabled(rename = "TAG")]
    tag: String,
    #[tabled(rename = "HOST")]
    host: String,
}

#[derive(Tabled)]
struct ForwardRow {
    #[tabled(rename = "LISTEN")]
    listen: String,
    #[tabled(rename = "PROTOCOLS")]
    protocols: String,
    #[tabled(rename = "TARGET")]
    target: String,
    #[tabled(rename = "TAG")]
    tag: String,
    #[tabled(rename = "REMARK")]
    remark: String,
}

#[derive(Tabled)]
struct ServerReverseRow {
    #[tabled(rename = "DOMAIN")]
    domain: String,
    #[tabled(rename = "HOST")]
    host: String,
    #[tabled(rename = "USER")]
    user: String,
    #[tabled(rename = "OUTBOUND_TAG")]
    outbound_tag: String,
    #[tabled(rename = "PORTAL")]
    portal: String,
    #[tabled(rename = "ROUTING_RULE")]
    routing_rule: String,
}

#[derive(Tabled)]
struct ClientReverseRow {
    #[tabled(rename = "TAG")]
    tag: String,
    #[tabled(rename = "HOST")]
    host: String,
    #[tabled(rename = "USER")]
    user: String,
    #[tabled(rename = "ENDPOINT_TAG")]
    endpoint_tag: String,
    #[tabled(rename = "BRIDGE")]
    bridge: String,
    #[tabled(rename = "DIRECT_RULE")]
    direct_rule: String,
}
