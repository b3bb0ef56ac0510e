//! Advisory liveness records shared by both roles in `state-heartbeat.json`.

pub mod responder;
pub mod runner;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::runtime;

#[derive(Debug, thiserror::Error)]
pub enum HeartbeatError {
    #[error("heartbeat tag is required")]
    MissingTag,
    #[error("heartbeat host is required")]
    MissingHost,
}

/// One report as sent on the wire after a successful ping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeartbeatPayload {
    pub tag: String,
    pub host: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(default)]
    pub client_ip: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub timestamp: Option<OffsetDateTime>,
    #[serde(default)]
    pub rtt_ms: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum HeartbeatStatus {
    Alive,
    Stale,
    #[default]
    Dead,
}

impl HeartbeatStatus {
    /// Alive within two intervals, stale within four, dead after that.
    pub fn classify(last_update: OffsetDateTime, now: OffsetDateTime, interval: Duration) -> Self {
        let age = now - last_update;
        let interval = time::Duration::try_from(interval).unwrap_or(time::Duration::seconds(2));
        if age <= interval * 2 {
            Self::Alive
        } else if age <= interval * 4 {
            Self::Stale
        } else {
            Self::Dead
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Alive => "alive",
            Self::Stale => "stale",
            Self::Dead => "dead",
        }
    }
}

impl fmt::Display for HeartbeatStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatEntry {
    pub host: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub client_ip: String,
    pub last_rtt_ms: u64,
    pub avg_rtt_ms: f64,
    #[serde(default)]
    pub min_rtt_ms: u64,
    #[serde(default)]
    pub max_rtt_ms: u64,
    #[serde(default)]
    pub total_rtt_ms: u64,
    #[serde(default)]
    pub samples: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub last_update_at: OffsetDateTime,
    #[serde(default)]
    pub status: HeartbeatStatus,
}

impl HeartbeatEntry {
    fn first(payload: &HeartbeatPayload, at: OffsetDateTime) -> Self {
        let rtt = payload.rtt_ms.max(0) as u64;
        Self {
            host: payload.host.trim().to_string(),
            user: payload.user.trim().to_string(),
            client_ip: payload.client_ip.trim().to_string(),
            last_rtt_ms: rtt,
            avg_rtt_ms: rtt as f64,
            min_rtt_ms: rtt,
            max_rtt_ms: rtt,
            total_rtt_ms: rtt,
            samples: 1,
            last_update_at: at,
            status: HeartbeatStatus::Alive,
        }
    }

    fn absorb(&mut self, payload: &HeartbeatPayload, at: OffsetDateTime) {
        let rtt = payload.rtt_ms.max(0) as u64;
        self.host = payload.host.trim().to_string();
        if !payload.user.trim().is_empty() {
            self.user = payload.user.trim().to_string();
        }
        if !payload.client_ip.trim().is_empty() {
            self.client_ip = payload.client_ip.trim().to_string();
        }
        self.last_rtt_ms = rtt;
        self.total_rtt_ms = self.total_rtt_ms.saturating_add(rtt);
        self.samples += 1;
        self.min_rtt_ms = if self.samples == 1 { rtt } else { self.min_rtt_ms.min(rtt) };
        self.max_rtt_ms = self.max_rtt_ms.max(rtt);
        self.avg_rtt_ms = self.total_rtt_ms as f64 / self.samples as f64;
        self.last_update_at = at;
        self.status = HeartbeatStatus::Alive;
    }
}

/// Tag → entry, as persisted.
pub type HeartbeatMap = BTreeMap<String, HeartbeatEntry>;

/// Reads the heartbeat file; a missing file is an empty map.
pub fn load(path: &Path) -> anyhow::Result<HeartbeatMap> {
    Ok(runtime::read_json(path)?.unwrap_or_default())
}

/// Recomputes every status against `now`.
pub fn refresh(entries: &mut HeartbeatMap, now: OffsetDateTime, interval: Duration) {
    for entry in entries.values_mut() {
        entry.status = HeartbeatStatus::classify(entry.last_update_at, now, interval);
    }
}

/// In-process view of the heartbeat file.
///
/// Several processes (server run, client run) may share one file, so every
/// flush re-reads it and only overlays the tags this process has touched.
pub struct HeartbeatStore {
    path: PathBuf,
    interval: Duration,
    entries: Mutex<HeartbeatMap>,
}

impl HeartbeatStore {
    pub fn new(path: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            path: path.into(),
            interval,
            entries: Mutex::new(HeartbeatMap::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Folds a payload into the in-memory map and persists it.
    pub fn record(&self, payload: &HeartbeatPayload) -> anyhow::Result<HeartbeatEntry> {
        let tag = payload.tag.trim();
        if tag.is_empty() {
            return Err(HeartbeatError::MissingTag.into());
        }
        if payload.host.trim().is_empty() {
            return Err(HeartbeatError::MissingHost.into());
        }
        let at = payload.timestamp.unwrap_or_else(OffsetDateTime::now_utc);

        let entry = {
            let mut entries = self.entries.lock();
            if !entries.contains_key(tag) {
                // Continue the statistics another run left behind.
                if let Ok(Some(previous)) = load(&self.path).map(|mut m| m.remove(tag)) {
                    entries.insert(tag.to_string(), previous);
                }
            }
            let entry = entries
                .entry(tag.to_string())
                .and_modify(|e| e.absorb(payload, at))
                .or_insert_with(|| HeartbeatEntry::first(payload, at));
            entry.clone()
        };
        self.flush()?;
        Ok(entry)
    }

    /// Refreshes statuses and merges this process's entries into the file.
    pub fn flush(&self) -> anyhow::Result<()> {
        let now = OffsetDateTime::now_utc();
        let mut merged = match load(&self.path) {
            Ok(map) => map,
            Err(err) => {
                tracing::warn!(path = %self.path.display(), "discarding unreadable heartbeat file: {err:#}");
                HeartbeatMap::new()
            }
        };
        {
            let entries = self.entries.lock();
            if entries.is_empty() && !self.path.exists() {
                return Ok(());
            }
            for (tag, entry) in entries.iter() {
                let newer = merged
                    .get(tag)
                    .map_or(true, |on_disk| on_disk.last_update_at <= entry.last_update_at);
                if newer {
                    merged.insert(tag.clone(), entry.clone());
                }
            }
        }
        refresh(&mut merged, now, self.interval);
        runtime::write_json_atomic(&self.path, &merged)
    }

    pub fn snapshot(&self) -> HeartbeatMap {
        let mut entries = self.entries.lock().clone();
        refresh(&mut entries, OffsetDateTime::now_utc(), self.interval);
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(tag: &str, rtt: i64, at: OffsetDateTime) -> HeartbeatPayload {
        HeartbeatPayload {
            tag: tag.to_string(),
            host: "10.62.10.11".to_string(),
            user: "alpha".to_string(),
            client_ip: "10.62.10.12".to_string(),
            timestamp: Some(at),
            rtt_ms: rtt,
        }
    }

    #[test]
    fn statistics_accumulate_per_tag() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = HeartbeatStore::new(dir.path().join("state-heartbeat.json"), Duration::from_secs(2));
        let now = OffsetDateTime::now_utc();
        store.record(&payload("proxy-10-62-10-11", 10, now)).expect("first");
        store.record(&payload("proxy-10-62-10-11", 30, now)).expect("second");
        let entry = store.record(&payload("proxy-10-62-10-11", -5, now)).expect("third");

        assert_eq!(entry.samples, 3);
        assert_eq!(entry.last_rtt_ms, 0);
        assert_eq!(entry.min_rtt_ms, 0);
        assert_eq!(entry.max_rtt_ms, 30);
        assert!((entry.avg_rtt_ms - 40.0 / 3.0).abs() < 1e-9);
        assert_eq!(entry.status, HeartbeatStatus::Alive);
    }

    #[test]
    fn record_rejects_anonymous_payloads() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = HeartbeatStore::new(dir.path().join("hb.json"), Duration::from_secs(2));
        let mut p = payload("", 1, OffsetDateTime::now_utc());
        assert!(store.record(&p).is_err());
        p.tag = "proxy-a".to_string();
        p.host = " ".to_string();
        assert!(store.record(&p).is_err());
        assert!(!dir.path().join("hb.json").exists());
    }

    #[test]
    fn flush_keeps_entries_written_by_other_processes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state-heartbeat.json");
        let now = OffsetDateTime::now_utc();

        let server = HeartbeatStore::new(&path, Duration::from_secs(2));
        server.record(&payload("proxy-a", 5, now)).expect("server");
        let client = HeartbeatStore::new(&path, Duration::from_secs(2));
        client.record(&payload("proxy-b", 7, now)).expect("client");

        let on_disk = load(&path).expect("load");
        assert_eq!(on_disk.keys().collect::<Vec<_>>(), vec!["proxy-a", "proxy-b"]);
        assert_eq!(on_disk["proxy-a"].last_rtt_ms, 5);
    }

    #[test]
    fn status_degrades_with_age() {
        let now = OffsetDateTime::now_utc();
        let interval = Duration::from_secs(2);
        let at = |secs: i64| now - time::Duration::seconds(secs);
        assert_eq!(HeartbeatStatus::classify(at(1), now, interval), HeartbeatStatus::Alive);
        assert_eq!(HeartbeatStatus::classify(at(4), now, interval), HeartbeatStatus::Alive);
        assert_eq!(HeartbeatStatus::classify(at(6), now, interval), HeartbeatStatus::Stale);
        assert_eq!(HeartbeatStatus::classify(at(9), now, interval), HeartbeatStatus::Dead);
    }

    #[test]
    fn stored_statistics_survive_restart() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("hb.json");
        let now = OffsetDateTime::now_utc();
        HeartbeatStore::new(&path, Duration::from_secs(2))
            .record(&payload("proxy-a", 10, now))
            .expect("first run");
        let entry = HeartbeatStore::new(&path, Duration::from_secs(2))
            .record(&payload("proxy-a", 20, now))
            .expect("second run");
        assert_eq!(entry.samples, 2);
        assert_eq!(entry.avg_rtt_ms, 15.0);
    }
}
