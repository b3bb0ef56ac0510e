//! Supervision of the xray_core child process.

use std::collections::VecDeque;
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::artifacts::ConfigFiles;
use crate::heartbeat::HeartbeatStore;
use crate::store::InstallLayout;

pub const STABILISATION_WINDOW: Duration = Duration::from_secs(6);
pub const TERMINATE_GRACE: Duration = Duration::from_secs(5);
const STDERR_TAIL_LINES: usize = 20;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// What to launch.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub command: PathBuf,
    pub args: Vec<String>,
}

impl ProcessSpec {
    pub fn xray(binary: &Path, config_dir: &Path) -> Self {
        Self {
            command: binary.to_path_buf(),
            args: vec![
                "run".to_string(),
                "-confdir".to_string(),
                config_dir.display().to_string(),
            ],
        }
    }
}

/// Looks for `name` on `PATH`.
pub fn which_binary(name: &str) -> Option<PathBuf> {
    let output = std::process::Command::new("which")
        .arg(name)
        .stderr(Stdio::null())
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!path.is_empty()).then(|| PathBuf::from(path))
}

/// `<root>/bin/xray`, then the configured binary, then `xray` on `PATH`.
pub fn resolve_xray_binary(layout: &InstallLayout, configured: Option<&Path>) -> anyhow::Result<PathBuf> {
    let bundled = layout.xray_path();
    if bundled.is_file() {
        return Ok(bundled);
    }
    if let Some(path) = configured {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        anyhow::bail!("xray binary {} does not exist", path.display());
    }
    which_binary("xray").ok_or_else(|| {
        anyhow::anyhow!(
            "xray binary not found: expected {}, XP2P_XRAY_BIN or xray on PATH",
            bundled.display()
        )
    })
}

/// Copies the engine into `<root>/bin/xray` unless one is already there.
/// Returns the installed path, or `None` when no source binary was found.
pub fn install_binary(layout: &InstallLayout, configured: Option<&Path>) -> anyhow::Result<Option<PathBuf>> {
    let target = layout.xray_path();
    if target.is_file() {
        return Ok(Some(target));
    }
    let source = configured
        .filter(|p| p.is_file())
        .map(Path::to_path_buf)
        .or_else(|| which_binary("xray"));
    let Some(source) = source else {
        warn!(
            path = %target.display(),
            "xray binary not found; run will need XP2P_XRAY_BIN or xray on PATH"
        );
        return Ok(None);
    };
    std::fs::create_dir_all(layout.bin_dir())
        .with_context(|| format!("failed to create {}", layout.bin_dir().display()))?;
    std::fs::copy(&source, &target)
        .with_context(|| format!("failed to copy {} to {}", source.display(), target.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o755))
            .with_context(|| format!("failed to mark {} executable", target.display()))?;
    }
    info!(source = %source.display(), path = %target.display(), "installed xray binary");
    Ok(Some(target))
}

/// Fails when any core artifact is missing from the config directory.
pub fn check_artifacts(files: &ConfigFiles) -> anyhow::Result<()> {
    let missing = files.missing();
    if missing.is_empty() {
        return Ok(());
    }
    let names: Vec<String> = missing
        .iter()
        .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
        .collect();
    anyhow::bail!(
        "missing configuration files in {}: {} (run install first)",
        files.dir().display(),
        names.join(", ")
    )
}

/// Files child stderr lines are appended to.
#[derive(Debug, Clone, Default)]
pub struct LogSinks {
    pub error_log: Option<PathBuf>,
    pub extra: Option<PathBuf>,
}

impl LogSinks {
    fn open(&self) -> anyhow::Result<Vec<std::fs::File>> {
        let mut files = Vec::new();
        for path in self.error_log.iter().chain(self.extra.iter()) {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            files.push(file);
        }
        Ok(files)
    }
}

pub struct ManagedProcess {
    child: Child,
    readers: Vec<JoinHandle<()>>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
}

impl ManagedProcess {
    pub fn spawn(spec: &ProcessSpec, sinks: &LogSinks) -> anyhow::Result<Self> {
        let log_files = sinks.open()?;
        let mut child = Command::new(&spec.command)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start {}", spec.command.display()))?;
        info!(
            pid = child.id().unwrap_or(0),
            command = %spec.command.display(),
            args = %spec.args.join(" "),
            "started xray_core"
        );

        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(forward_lines(stdout, |line| {
                info!("xray_core: {line}");
            })));
        }
        if let Some(stderr) = child.stderr.take() {
            let tail = stderr_tail.clone();
            let mut files = log_files;
            readers.push(tokio::spawn(forward_lines(stderr, move |line| {
                error!("xray_core stderr: {line}");
                for file in files.iter_mut() {
                    if let Err(err) = writeln!(file, "{line}") {
                        warn!("failed to append xray_core stderr: {err}");
                    }
                }
                let mut recent = tail.lock();
                if recent.len() == STDERR_TAIL_LINES {
                    recent.pop_front();
                }
                recent.push_back(line.to_string());
            })));
        }

        Ok(Self {
            child,
            readers,
            stderr_tail,
        })
    }

    /// Errors if the child exits before `window` elapses.
    pub async fn stabilise(&mut self, window: Duration) -> anyhow::Result<()> {
        let exited = tokio::select! {
            status = self.child.wait() => Some(status),
            _ = tokio::time::sleep(window) => None,
        };
        let Some(status) = exited else {
            info!(window = ?window, "xray_core is running");
            return Ok(());
        };
        let status = status.context("failed to wait for xray_core")?;
        self.drain().await;
        anyhow::bail!("xray_core exited during startup ({status}): {}", self.stderr_summary())
    }

    pub async fn wait(&mut self) -> anyhow::Result<ExitStatus> {
        let status = self.child.wait().await.context("failed to wait for xray_core")?;
        self.drain().await;
        Ok(status)
    }

    /// SIGTERM, then SIGKILL once `grace` runs out.
    pub async fn terminate(&mut self, grace: Duration) -> anyhow::Result<ExitStatus> {
        if let Ok(Some(status)) = self.child.try_wait() {
            self.drain().await;
            return Ok(status);
        }
        if let Some(pid) = self.child.id() {
            info!(pid, "sending SIGTERM to xray_core");
            if let Err(err) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                warn!(pid, "failed to signal xray_core: {err}");
            }
        }
        let status = match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => status.context("failed to wait for xray_core")?,
            Err(_) => {
                warn!(grace = ?grace, "xray_core ignored SIGTERM, killing");
                self.child.kill().await.context("failed to kill xray_core")?;
                self.child.wait().await.context("failed to wait for xray_core")?
            }
        };
        self.drain().await;
        info!(%status, "xray_core stopped");
        Ok(status)
    }

    pub fn stderr_summary(&self) -> String {
        let tail = self.stderr_tail.lock();
        if tail.is_empty() {
            "no stderr output".to_string()
        } else {
            tail.iter().cloned().collect::<Vec<_>>().join("\n")
        }
    }

    async fn drain(&mut self) {
        for handle in self.readers.drain(..) {
            let abort = handle.abort_handle();
            if tokio::time::timeout(DRAIN_TIMEOUT, handle).await.is_err() {
                abort.abort();
            }
        }
    }
}

async fn forward_lines<R>(reader: R, mut sink: impl FnMut(&str) + Send)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => sink(&line),
            Ok(None) => break,
            Err(err) => {
                warn!("failed reading xray_core output: {err}");
                break;
            }
        }
    }
}

/// Runs the child until `shutdown` resolves or the child dies, then flushes
/// the heartbeat file. An unexpected exit is an error.
pub async fn supervise(
    spec: &ProcessSpec,
    sinks: &LogSinks,
    heartbeat: Option<&HeartbeatStore>,
    stabilise_for: Duration,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    let mut process = ManagedProcess::spawn(spec, sinks)?;
    process.stabilise(stabilise_for).await?;

    let exited = tokio::select! {
        status = process.wait() => Some(status),
        _ = shutdown => None,
    };
    let result = match exited {
        Some(status) => {
            let status = status?;
            Err(anyhow::anyhow!(
                "xray_core exited unexpectedly ({status}): {}",
                process.stderr_summary()
            ))
        }
        None => process.terminate(TERMINATE_GRACE).await.map(|_| ()),
    };

    if let Some(store) = heartbeat {
        if let Err(err) = store.flush() {
            warn!(path = %store.path().display(), "failed to flush heartbeat state: {err:#}");
        }
    }
    result
}
