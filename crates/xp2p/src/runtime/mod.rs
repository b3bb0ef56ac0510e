use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

/// Switches the log filter once configuration is known. `RUST_LOG` always wins.
pub struct LogLevel(reload::Handle<EnvFilter, Registry>);

impl LogLevel {
    pub fn apply(&self, level: &str) {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        match EnvFilter::try_new(level) {
            Ok(filter) => {
                let _ = self.0.reload(filter);
            }
            Err(err) => tracing::warn!("invalid log level {level:?}: {err}"),
        }
    }
}

fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Logs go to stderr; stdout carries tables, links and ping replies.
pub fn init_tracing(default_level: &str) -> LogLevel {
    let (filter, handle) = reload::Layer::new(filter(default_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .init();
    LogLevel(handle)
}

pub async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => { tracing::info!("received SIGTERM, shutting down"); }
        _ = sigint.recv() => { tracing::info!("received SIGINT, shutting down"); }
    }
}

/// Writes `data` to a sibling temp file, fsyncs it and renames it over `path`.
pub fn write_atomic(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create directory {}", dir.display()))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "xp2p".to_string());
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let tmp = dir.join(format!(".{file_name}.{}-{nanos}.tmp", std::process::id()));

    let result = (|| -> anyhow::Result<()> {
        let mut f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)
            .with_context(|| format!("failed to create {}", tmp.display()))?;
        f.write_all(data)
            .with_context(|| format!("failed writing {}", tmp.display()))?;
        f.sync_all()
            .with_context(|| format!("failed to fsync {}", tmp.display()))?;
        drop(f);
        fs::rename(&tmp, path).with_context(|| {
            format!("failed to rename {} to {}", tmp.display(), path.display())
        })?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
        return result;
    }

    // Persist the rename itself.
    if let Ok(handle) = fs::File::open(dir) {
        let _ = handle.sync_all();
    }
    Ok(())
}

pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> anyhow::Result<()> {
    let mut raw = serde_json::to_vec_pretty(value)
        .with_context(|| format!("failed to encode {}", path.display()))?;
    raw.push(b'\n');
    write_atomic(path, &raw)
}

/// Missing or whitespace-only files read as `None`; malformed JSON is an error naming the path.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("failed reading {}", path.display()));
        }
    };
    if raw.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(None);
    }
    let data = serde_json::from_slice(&raw)
        .with_context(|| format!("invalid JSON in {}", path.display()))?;
    Ok(Some(data))
}

/// Parses `250ms`, `2s`, `5m`, `1h`, `1d` or a bare number of seconds.
pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        anyhow::bail!("empty duration string");
    }

    if let Some(num) = s.strip_suffix("ms") {
        let ms: u64 = num
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid duration: {s}"))?;
        return Ok(Duration::from_millis(ms));
    }

    let (num_str, multiplier) = match s.char_indices().last() {
        Some((idx, 's')) => (&s[..idx], 1),
        Some((idx, 'm')) => (&s[..idx], 60),
        Some((idx, 'h')) => (&s[..idx], 3600),
        Some((idx, 'd')) => (&s[..idx], 86400),
        Some((_, c)) if c.is_ascii_digit() => (s, 1),
        Some((_, unit)) => anyhow::bail!("unknown duration unit: {unit}. Use ms, s, m, h, or d"),
        None => anyhow::bail!("empty duration string"),
    };
    let num: u64 = num_str
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid duration: {s}"))?;

    Ok(Duration::from_secs(num * multiplier))
}
