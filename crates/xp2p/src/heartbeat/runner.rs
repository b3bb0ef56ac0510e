use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tracing::debug;

use super::{HeartbeatEntry, HeartbeatPayload, HeartbeatStore};
use crate::endpoint::Endpoint;
use crate::ping;

/// Periodically pings every endpoint's diagnostics port and reports the
/// round trip back over the same connection.
pub struct HeartbeatRunner {
    store: Arc<HeartbeatStore>,
    endpoints: Vec<Endpoint>,
    port: u16,
    timeout: Duration,
    socks: Option<String>,
}

impl HeartbeatRunner {
    pub fn new(store: Arc<HeartbeatStore>, endpoints: Vec<Endpoint>, port: u16, socks: Option<String>) -> Self {
        Self {
            store,
            endpoints,
            port,
            timeout: ping::DEFAULT_TIMEOUT,
            socks,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.store.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    for endpoint in &self.endpoints {
                        if let Err(err) = self.beat(endpoint).await {
                            debug!(host = %endpoint.hostname, tag = %endpoint.tag, "client heartbeat failed: {err:#}");
                        }
                    }
                }
            }
        }
    }

    /// Direct first, then through the local SOCKS inbound.
    pub async fn beat(&self, endpoint: &Endpoint) -> anyhow::Result<HeartbeatEntry> {
        let host = endpoint.hostname.as_str();
        let probe = match ping::probe_tcp(host, self.port, self.timeout, None).await {
            Ok(ok) => Ok(ok),
            Err(direct) => match self.socks.as_deref() {
                Some(proxy) => ping::probe_tcp(host, self.port, self.timeout, Some(proxy)).await,
                None => Err(direct),
            },
        };
        let (mut stream, rtt) = probe?;

        let payload = HeartbeatPayload {
            tag: endpoint.tag.clone(),
            host: endpoint.hostname.clone(),
            user: endpoint.user.clone(),
            client_ip: detect_local_ip().to_string(),
            timestamp: Some(OffsetDateTime::now_utc()),
            rtt_ms: i64::try_from(rtt.as_millis()).unwrap_or(i64::MAX),
        };
        let mut line = serde_json::to_vec(&payload)?;
        line.push(b'\n');
        stream.write_all(&line).await?;
        stream.shutdown().await.ok();

        self.store.record(&payload)
    }
}

/// Source address the kernel would pick for outbound traffic. Connecting a
/// UDP socket sends nothing.
pub fn detect_local_ip() -> IpAddr {
    UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|s| {
            s.connect(("8.8.8.8", 80))?;
            s.local_addr()
        })
        .map(|addr| addr.ip())
        .ok()
        .filter(|ip| !ip.is_unspecified())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heartbeat::responder::DiagnosticsResponder;

    #[tokio::test]
    async fn beat_records_on_both_sides() {
        let dir = tempfile::tempdir().expect("tempdir");
        let server_store = Arc::new(HeartbeatStore::new(dir.path().join("server.json"), Duration::from_secs(2)));
        let responder = DiagnosticsResponder::bind("127.0.0.1:0".parse().expect("addr"))
            .await
            .expect("bind");
        let port = responder.tcp_addr().expect("tcp").port();
        let (_tx, rx) = watch::channel(false);
        tokio::spawn(responder.serve(Some(server_store.clone()), rx));

        let client_store = Arc::new(HeartbeatStore::new(dir.path().join("client.json"), Duration::from_secs(2)));
        let endpoint = Endpoint::new("127.0.0.1", 62022, "alpha", "secret", None, true);
        let runner = HeartbeatRunner::new(client_store.clone(), vec![endpoint.clone()], port, None);

        let entry = runner.beat(&endpoint).await.expect("beat");
        assert_eq!(entry.samples, 1);
        assert_eq!(entry.user, "alpha");
        assert!(client_store.snapshot().contains_key(&endpoint.tag));

        let mut seen = false;
        for _ in 0..50 {
            if server_store.snapshot().contains_key(&endpoint.tag) {
                seen = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(seen, "server never recorded the heartbeat");
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(HeartbeatStore::new(dir.path().join("hb.json"), Duration::from_secs(2)));
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);
        let endpoint = Endpoint::new("127.0.0.1", 62022, "alpha", "secret", None, true);
        let runner = HeartbeatRunner::new(store.clone(), vec![endpoint.clone()], port, None);
        assert!(runner.beat(&endpoint).await.is_err());
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn local_ip_is_never_unspecified() {
        assert!(!detect_local_ip().is_unspecified());
    }
}
