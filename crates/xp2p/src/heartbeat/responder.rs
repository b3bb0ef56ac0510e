//! TCP/UDP PING responder run alongside the server's transport engine.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{HeartbeatPayload, HeartbeatStore};
use crate::ping::PONG;

const PAYLOAD_TIMEOUT: Duration = Duration::from_millis(250);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

pub struct DiagnosticsResponder {
    tcp: Option<TcpListener>,
    udp: Option<UdpSocket>,
}

impl DiagnosticsResponder {
    /// Binds TCP and UDP on `addr`. One of the two failing is tolerated.
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<Self> {
        let tcp = match TcpListener::bind(addr).await {
            Ok(l) => Some(l),
            Err(err) => {
                warn!(%addr, "diagnostics tcp listener unavailable: {err}");
                None
            }
        };
        let udp = match UdpSocket::bind(addr).await {
            Ok(s) => Some(s),
            Err(err) => {
                warn!(%addr, "diagnostics udp listener unavailable: {err}");
                None
            }
        };
        if tcp.is_none() && udp.is_none() {
            anyhow::bail!("unable to bind TCP/UDP listeners on {addr}");
        }
        Ok(Self { tcp, udp })
    }

    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.udp.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Answers probes until `shutdown` flips (or its sender goes away).
    pub async fn serve(self, store: Option<Arc<HeartbeatStore>>, mut shutdown: watch::Receiver<bool>) {
        info!(tcp = ?self.tcp_addr(), udp = ?self.udp_addr(), "diagnostics responder listening");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = accept(self.tcp.as_ref()) => match accepted {
                    Ok((stream, peer)) => {
                        let store = store.clone();
                        tokio::spawn(async move {
                            if let Err(err) = handle_tcp(stream, peer, store).await {
                                debug!(%peer, "tcp probe aborted: {err:#}");
                            }
                        });
                    }
                    Err(err) => warn!("diagnostics accept failed: {err}"),
                },
                received = recv(self.udp.as_ref()) => match received {
                    Ok((data, peer)) => {
                        if is_ping(&data) {
                            info!(remote_addr = %peer, "udp ping received");
                            if let Some(udp) = self.udp.as_ref() {
                                let _ = udp.send_to(format!("{PONG}\n").as_bytes(), peer).await;
                            }
                        }
                    }
                    Err(err) => warn!("udp read error: {err}"),
                },
            }
        }
        debug!("diagnostics responder stopped");
    }
}

async fn accept(listener: Option<&TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(l) => l.accept().await,
        None => std::future::pending().await,
    }
}

async fn recv(socket: Option<&UdpSocket>) -> io::Result<(Vec<u8>, SocketAddr)> {
    let Some(socket) = socket else {
        return std::future::pending().await;
    };
    let mut buf = vec![0u8; 1024];
    let (n, peer) = socket.recv_from(&mut buf).await?;
    buf.truncate(n);
    Ok((buf, peer))
}

fn is_ping(data: &[u8]) -> bool {
    String::from_utf8_lossy(data).trim().eq_ignore_ascii_case("PING")
}

async fn handle_tcp(
    stream: TcpStream,
    peer: SocketAddr,
    store: Option<Arc<HeartbeatStore>>,
) -> anyhow::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    tokio::time::timeout(REQUEST_TIMEOUT, reader.read_line(&mut line)).await??;
    if !is_ping(line.as_bytes()) {
        return Ok(());
    }
    write_half.write_all(format!("{PONG}\n").as_bytes()).await?;

    let Some(store) = store else {
        info!(remote_addr = %peer, "tcp ping received");
        return Ok(());
    };
    line.clear();
    let read = tokio::time::timeout(PAYLOAD_TIMEOUT, reader.read_line(&mut line)).await;
    if !matches!(read, Ok(Ok(n)) if n > 0) || line.trim().is_empty() {
        info!(remote_addr = %peer, "tcp ping received");
        return Ok(());
    }

    let mut payload: HeartbeatPayload = match serde_json::from_str(line.trim()) {
        Ok(p) => p,
        Err(err) => {
            warn!(remote_addr = %peer, "invalid heartbeat payload: {err}");
            return Ok(());
        }
    };
    if payload.client_ip.trim().is_empty() {
        payload.client_ip = peer.ip().to_string();
    }
    match store.record(&payload) {
        Ok(_) => debug!(tag = %payload.tag, host = %payload.host, client_ip = %payload.client_ip, "heartbeat recorded"),
        Err(err) => warn!(tag = %payload.tag, "unable to persist heartbeat: {err:#}"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::heartbeat;
    use crate::ping;

    async fn start(store: Option<Arc<HeartbeatStore>>) -> (SocketAddr, SocketAddr, watch::Sender<bool>) {
        let responder = DiagnosticsResponder::bind("127.0.0.1:0".parse().expect("addr"))
            .await
            .expect("bind");
        let tcp = responder.tcp_addr().expect("tcp");
        let udp = responder.udp_addr().expect("udp");
        let (tx, rx) = watch::channel(false);
        tokio::spawn(responder.serve(store, rx));
        (tcp, udp, tx)
    }

    #[tokio::test]
    async fn answers_tcp_and_udp_pings() {
        let (tcp, udp, _tx) = start(None).await;
        ping::probe_tcp("127.0.0.1", tcp.port(), Duration::from_secs(2), None)
            .await
            .expect("tcp pong");
        ping::probe_udp("127.0.0.1", udp.port(), Duration::from_secs(2))
            .await
            .expect("udp pong");
    }

    #[tokio::test]
    async fn heartbeat_payload_lands_in_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state-heartbeat.json");
        let store = Arc::new(HeartbeatStore::new(&path, Duration::from_secs(2)));
        let (tcp, _, _tx) = start(Some(store.clone())).await;

        let mut stream = TcpStream::connect(tcp).await.expect("connect");
        stream.write_all(b"PING\n").await.expect("ping");
        let mut buf = [0u8; 8];
        let n = stream.read(&mut buf).await.expect("pong");
        assert_eq!(&buf[..n], b"PONG\n");
        stream
            .write_all(b"{\"tag\":\"proxy-edge\",\"host\":\"edge\",\"user\":\"alpha\",\"rtt_ms\":12}\n")
            .await
            .expect("payload");
        drop(stream);

        for _ in 0..50 {
            if path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let entries = heartbeat::load(&path).expect("load");
        let entry = entries.get("proxy-edge").expect("entry");
        assert_eq!(entry.last_rtt_ms, 12);
        assert_eq!(entry.client_ip, "127.0.0.1");
        assert_eq!(store.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn shutdown_stops_serving() {
        let responder = DiagnosticsResponder::bind("127.0.0.1:0".parse().expect("addr"))
            .await
            .expect("bind");
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(responder.serve(None, rx));
        tx.send(true).expect("signal");
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("stopped in time")
            .expect("join");
    }
}
