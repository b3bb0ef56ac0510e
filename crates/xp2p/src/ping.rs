use std::fmt;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, info, warn};

pub const PING_REQUEST: &[u8] = b"PING\n";
pub const PONG: &str = "PONG";
pub const DEFAULT_COUNT: u32 = 3;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
const PACING: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum PingProto {
    #[default]
    Tcp,
    Udp,
}

impl fmt::Display for PingProto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        })
    }
}

#[derive(Debug, Clone)]
pub struct PingOptions {
    pub count: u32,
    pub timeout: Duration,
    pub proto: PingProto,
    pub port: u16,
    pub socks: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PingSummary {
    pub sent: u32,
    pub received: u32,
}

impl PingSummary {
    pub fn lost(&self) -> u32 {
        self.sent - self.received
    }

    pub fn loss_percent(&self) -> f64 {
        if self.sent == 0 {
            return 0.0;
        }
        f64::from(self.lost()) / f64::from(self.sent) * 100.0
    }
}

impl fmt::Display for PingSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Packets: sent = {}, received = {}, lost = {} ({:.0}% loss)",
            self.sent,
            self.received,
            self.lost(),
            self.loss_percent()
        )
    }
}

/// `host:port`, bracketing IPv6 literals.
pub fn display_addr(host: &str, port: u16) -> String {
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V6(_)) => format!("[{host}]:{port}"),
        _ => format!("{host}:{port}"),
    }
}

/// Sends `count` probes, printing one line per probe and a summary to `out`.
/// Fails when no probe got a reply.
pub async fn run(target: &str, opts: &PingOptions, out: &mut dyn Write) -> anyhow::Result<PingSummary> {
    let target = target.trim();
    if target.is_empty() {
        anyhow::bail!("ping target is required");
    }
    let count = opts.count.max(1);
    let timeout = if opts.timeout.is_zero() { DEFAULT_TIMEOUT } else { opts.timeout };
    let addr = display_addr(target, opts.port);
    debug!(target = %addr, proto = %opts.proto, count, ?timeout, "ping session started");

    let mut summary = PingSummary::default();
    for seq in 1..=count {
        let result = match (opts.proto, opts.socks.as_deref()) {
            (PingProto::Tcp, socks) => probe_tcp(target, opts.port, timeout, socks)
                .await
                .map(|(_, rtt)| rtt),
            (PingProto::Udp, Some(_)) => {
                warn!(seq, "udp ping via socks proxy is not supported");
                Err(anyhow::anyhow!("UDP ping via SOCKS5 proxy is not supported"))
            }
            (PingProto::Udp, None) => probe_udp(target, opts.port, timeout).await,
        };
        summary.sent += 1;
        match result {
            Ok(rtt) => {
                summary.received += 1;
                writeln!(
                    out,
                    "Reply from {addr}: seq={seq} time={}ms proto={}",
                    rtt.as_millis(),
                    opts.proto
                )?;
            }
            Err(err) => {
                writeln!(out, "Request {seq} failed: {err:#}")?;
                warn!(seq, "ping request failed: {err:#}");
            }
        }
        if seq < count {
            tokio::time::sleep(PACING).await;
        }
    }

    writeln!(out)?;
    writeln!(out, "{summary}")?;
    info!(sent = summary.sent, received = summary.received, "ping session completed");
    if summary.received == 0 {
        anyhow::bail!("no replies received");
    }
    Ok(summary)
}

/// One TCP probe. Returns the still-open stream so the caller can append a
/// heartbeat payload after the PONG.
pub async fn probe_tcp(
    host: &str,
    port: u16,
    timeout: Duration,
    socks: Option<&str>,
) -> anyhow::Result<(TcpStream, Duration)> {
    tokio::time::timeout(timeout, async {
        let mut stream = match socks {
            Some(proxy) => socks5_connect(proxy, host, port).await?,
            None => TcpStream::connect((host, port))
                .await
                .with_context(|| format!("failed to connect to {}", display_addr(host, port)))?,
        };
        let start = Instant::now();
        stream.write_all(PING_REQUEST).await?;
        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).await?;
        check_pong(&buf[..n])?;
        Ok::<_, anyhow::Error>((stream, start.elapsed()))
    })
    .await
    .map_err(|_| anyhow::anyhow!("i/o timeout after {}ms", timeout.as_millis()))?
}

pub async fn probe_udp(host: &str, port: u16, timeout: Duration) -> anyhow::Result<Duration> {
    tokio::time::timeout(timeout, async {
        let local: IpAddr = match host.parse::<IpAddr>() {
            Ok(IpAddr::V6(_)) => Ipv6Addr::UNSPECIFIED.into(),
            _ => Ipv4Addr::UNSPECIFIED.into(),
        };
        let socket = UdpSocket::bind((local, 0)).await?;
        socket.connect((host, port)).await?;
        let start = Instant::now();
        socket.send(PING_REQUEST).await?;
        let mut buf = [0u8; 64];
        let n = socket.recv(&mut buf).await?;
        check_pong(&buf[..n])?;
        Ok::<_, anyhow::Error>(start.elapsed())
    })
    .await
    .map_err(|_| anyhow::anyhow!("i/o timeout after {}ms", timeout.as_millis()))?
}

fn check_pong(reply: &[u8]) -> anyhow::Result<()> {
    let text = String::from_utf8_lossy(reply);
    if !text.trim().eq_ignore_ascii_case(PONG) {
        anyhow::bail!("unexpected response: {text:?}");
    }
    Ok(())
}

/// RFC 1928 CONNECT without authentication.
pub async fn socks5_connect(proxy: &str, host: &str, port: u16) -> anyhow::Result<TcpStream> {
    let mut s = TcpStream::connect(proxy)
        .await
        .with_context(|| format!("failed to connect through SOCKS5 proxy {proxy}"))?;

    s.write_all(&[0x05, 0x01, 0x00]).await?;
    let mut rep = [0u8; 2];
    s.read_exact(&mut rep).await?;
    if rep != [0x05, 0x00] {
        anyhow::bail!("SOCKS5 proxy {proxy} rejected method negotiation");
    }

    let mut req = vec![0x05, 0x01, 0x00];
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            req.push(0x01);
            req.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            req.push(0x04);
            req.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            let name = host.as_bytes();
            if name.len() > 255 {
                anyhow::bail!("hostname too long for SOCKS5: {host}");
            }
            req.push(0x03);
            req.push(name.len() as u8);
            req.extend_from_slice(name);
        }
    }
    req.extend_from_slice(&port.to_be_bytes());
    s.write_all(&req).await?;

    let mut head = [0u8; 4];
    s.read_exact(&mut head).await?;
    if head[1] != 0x00 {
        anyhow::bail!("SOCKS5 connect to {} failed with code {}", display_addr(host, port), head[1]);
    }
    // Skip the bound address.
    let rest = match head[3] {
        0x01 => 4 + 2,
        0x04 => 16 + 2,
        0x03 => {
            let mut len = [0u8; 1];
            s.read_exact(&mut len).await?;
            usize::from(len[0]) + 2
        }
        other => anyhow::bail!("SOCKS5 reply has unknown address type {other}"),
    };
    let mut skip = vec![0u8; rest];
    s.read_exact(&mut skip).await?;
    Ok(s)
}
