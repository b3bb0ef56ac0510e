use std::future::Future;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use colored::Colorize;
use tabled::settings::Style;
use tabled::Tabled;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::heartbeat::{self, HeartbeatMap, HeartbeatStatus};

const CLEAR_SCREEN: &str = "\x1b[H\x1b[2J";

#[derive(Tabled)]
struct StateRow {
    #[tabled(rename = "TAG")]
    tag: String,
    #[tabled(rename = "HOST")]
    host: String,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "LAST_RTT")]
    last_rtt: String,
    #[tabled(rename = "AVG_RTT")]
    avg_rtt: String,
    #[tabled(rename = "LAST_UPDATE")]
    last_update: String,
    #[tabled(rename = "CLIENT_USER")]
    client_user: String,
    #[tabled(rename = "CLIENT_IP")]
    client_ip: String,
}

impl StateRow {
    fn placeholder() -> Self {
        let dash = || "-".to_string();
        Self {
            tag: dash(),
            host: dash(),
            status: dash(),
            last_rtt: dash(),
            avg_rtt: dash(),
            last_update: dash(),
            client_user: dash(),
            client_ip: dash(),
        }
    }
}

fn or_dash(value: &str) -> String {
    if value.trim().is_empty() {
        "-".to_string()
    } else {
        value.to_string()
    }
}

fn paint(status: HeartbeatStatus) -> String {
    match status {
        HeartbeatStatus::Alive => status.as_str().green().to_string(),
        HeartbeatStatus::Stale => status.as_str().yellow().to_string(),
        HeartbeatStatus::Dead => status.as_str().red().to_string(),
    }
}

/// Heartbeat file contents with statuses recomputed for now.
pub fn snapshot(path: &Path, interval: Duration) -> anyhow::Result<HeartbeatMap> {
    let mut entries = heartbeat::load(path)?;
    heartbeat::refresh(&mut entries, OffsetDateTime::now_utc(), interval);
    Ok(entries)
}

pub fn render_table(entries: &HeartbeatMap) -> String {
    let mut rows: Vec<StateRow> = entries
        .iter()
        .map(|(tag, e)| StateRow {
            tag: tag.clone(),
            host: or_dash(&e.host),
            status: paint(e.status),
            last_rtt: format!("{}ms", e.last_rtt_ms),
            avg_rtt: format!("{:.1}ms", e.avg_rtt_ms),
            last_update: e
                .last_update_at
                .format(&Rfc3339)
                .unwrap_or_else(|_| "-".to_string()),
            client_user: or_dash(&e.user),
            client_ip: or_dash(&e.client_ip),
        })
        .collect();
    if rows.is_empty() {
        rows.push(StateRow::placeholder());
    }
    tabled::Table::new(&rows).with(Style::blank()).to_string()
}

pub fn render_json(entries: &HeartbeatMap) -> anyhow::Result<String> {
    Ok(serde_json::to_string_pretty(entries)?)
}

pub fn print(out: &mut dyn Write, path: &Path, interval: Duration, json: bool) -> anyhow::Result<()> {
    let entries = snapshot(path, interval)?;
    let rendered = if json {
        render_json(&entries)?
    } else {
        render_table(&entries)
    };
    writeln!(out, "{rendered}")?;
    out.flush()?;
    Ok(())
}

/// Repaints every `refresh` until `shutdown` resolves.
pub async fn watch(
    out: &mut dyn Write,
    path: &Path,
    interval: Duration,
    refresh: Duration,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    let refresh = if refresh.is_zero() { interval } else { refresh };
    let mut ticker = tokio::time::interval(refresh);
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                write!(out, "{CLEAR_SCREEN}")?;
                print(out, path, interval, false)?;
            }
        }
    }
    // Leave the cursor on a clean line with attributes reset.
    write!(out, "\x1b[0m")?;
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heartbeat::{HeartbeatPayload, HeartbeatStore};

    const HEADER: [&str; 8] = [
        "TAG",
        "HOST",
        "STATUS",
        "LAST_RTT",
        "AVG_RTT",
        "LAST_UPDATE",
        "CLIENT_USER",
        "CLIENT_IP",
    ];

    #[test]
    fn empty_state_renders_placeholder_row() {
        colored::control::set_override(false);
        let table = render_table(&HeartbeatMap::new());
        let mut lines = table.lines();
        let header: Vec<&str> = lines.next().expect("header").split_whitespace().collect();
        assert_eq!(header, HEADER);
        let row: Vec<&str> = lines.next().expect("row").split_whitespace().collect();
        assert_eq!(row, vec!["-"; 8]);
    }

    #[test]
    fn live_entry_shows_identity() {
        colored::control::set_override(false);
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state-heartbeat.json");
        HeartbeatStore::new(&path, Duration::from_secs(2))
            .record(&HeartbeatPayload {
                tag: "proxy-10-62-10-11".to_string(),
                host: "10.62.10.11".to_string(),
                user: "client-abcd1234".to_string(),
                client_ip: "10.62.10.12".to_string(),
                timestamp: None,
                rtt_ms: 4,
            })
            .expect("record");

        let mut out = Vec::new();
        print(&mut out, &path, Duration::from_secs(2), false).expect("print");
        let text = String::from_utf8(out).expect("utf8");
        let row: Vec<&str> = text.lines().nth(1).expect("row").split_whitespace().collect();
        assert_eq!(row[0], "proxy-10-62-10-11");
        assert_eq!(row[2], "alive");
        assert_eq!(row[3], "4ms");
        assert_eq!(row[4], "4.0ms");
        assert_eq!(row[6], "client-abcd1234");
        assert_eq!(row[7], "10.62.10.12");
    }

    #[test]
    fn json_output_is_the_heartbeat_map() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut out = Vec::new();
        print(&mut out, &dir.path().join("missing.json"), Duration::from_secs(2), true).expect("print");
        assert_eq!(String::from_utf8(out).expect("utf8").trim(), "{}");
    }

    #[tokio::test]
    async fn watch_repaints_until_shutdown() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state-heartbeat.json");
        let mut out = Vec::new();
        watch(
            &mut out,
            &path,
            Duration::from_secs(2),
            Duration::from_millis(50),
            tokio::time::sleep(Duration::from_millis(180)),
        )
        .await
        .expect("watch");
        let text = String::from_utf8(out).expect("utf8");
        let paints = text.matches(CLEAR_SCREEN).count();
        assert!((2..=5).contains(&paints), "painted {paints} times");
        assert!(text.ends_with("\x1b[0m"));
    }
}
