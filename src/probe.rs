use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::{self, Instant};
use tracing::{debug, warn};

use crate::types::PortState;

/// Result of one connection attempt against an address:port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortProbe {
    pub state: PortState,
    pub banner: Option<String>,
    pub latency_ms: u64,
}

impl PortProbe {
    pub fn closed() -> Self {
        Self { state: PortState::Closed, banner: None, latency_ms: 0 }
    }

    pub fn filtered() -> Self {
        Self { state: PortState::Filtered, banner: None, latency_ms: 0 }
    }
}

/// Connects to a candidate and classifies the response. Implementations
/// absorb their own errors; a failed attempt is a classification, not an error.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, addr: SocketAddr, timeout: Duration) -> PortProbe;
}

/// TCP connect prober with a short, passive banner grab on open ports.
#[derive(Debug, Clone)]
pub struct TcpProber {
    banner_timeout: Duration,
}

impl TcpProber {
    pub fn new() -> Self {
        Self { banner_timeout: Duration::from_millis(200) }
    }
}

impl Default for TcpProber {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Prober for TcpProber {
    async fn probe(&self, addr: SocketAddr, timeout: Duration) -> PortProbe {
        let start = Instant::now();
        match time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(mut stream)) => {
                let latency_ms = start.elapsed().as_millis() as u64;
                let banner = read_banner(&mut stream, self.banner_timeout).await;
                PortProbe { state: PortState::Open, banner, latency_ms }
            }
            Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => PortProbe::closed(),
            Ok(Err(e)) => {
                warn!(%addr, error = %e, "connect failed");
                PortProbe::filtered()
            }
            Err(_) => {
                debug!(%addr, timeout_ms = timeout.as_millis() as u64, "connect timed out");
                PortProbe::filtered()
            }
        }
    }
}

/// Try to read up to 256 bytes from the stream with a short timeout and convert to a lossy UTF-8 string.
async fn read_banner(stream: &mut TcpStream, wait: Duration) -> Option<String> {
    let mut buf = vec![0u8; 256];
    match time::timeout(wait, stream.read(&mut buf)).await {
        Ok(Ok(n)) if n > 0 => {
            buf.truncate(n);
            let s = String::from_utf8_lossy(&buf).trim_end().to_string();
            let s = s.replace('\n', "\\n").replace('\r', "\\r");
            Some(s)
        }
        _ => None,
    }
}

/// Best-effort service name and version from the banner, falling back to the
/// well-known port assignment.
pub fn classify_service(port: u16, banner: Option<&str>) -> (Option<String>, Option<String>) {
    if let Some(b) = banner {
        if let Some(rest) = b.strip_prefix("SSH-") {
            // SSH-2.0-OpenSSH_9.6p1 Ubuntu-3
            let version = rest
                .split_once('-')
                .map(|(_, v)| v.split_whitespace().next().unwrap_or(v).to_string());
            return (Some("ssh".into()), version);
        }
        if b.starts_with("HTTP/") {
            return (Some("http".into()), None);
        }
        if b.starts_with("220") {
            let name = if port == 21 || b.to_ascii_lowercase().contains("ftp") { "ftp" } else { "smtp" };
            return (Some(name.into()), None);
        }
        if b.starts_with("+OK") {
            return (Some("pop3".into()), None);
        }
        if b.starts_with("* OK") {
            return (Some("imap".into()), None);
        }
        if b.starts_with("RFB ") {
            return (Some("vnc".into()), b.get(4..11).map(str::to_string));
        }
        if b.starts_with("-ERR") || b.starts_with("+PONG") {
            return (Some("redis".into()), None);
        }
    }
    (well_known_service(port).map(str::to_string), None)
}

fn well_known_service(port: u16) -> Option<&'static str> {
    let name = match port {
        21 => "ftp",
        22 => "ssh",
        23 => "telnet",
        25 | 465 | 587 => "smtp",
        53 => "dns",
        80 | 8000 | 8080 | 8081 | 8888 => "http",
        110 | 995 => "pop3",
        135 => "msrpc",
        139 | 445 => "smb",
        143 | 993 => "imap",
        389 | 636 => "ldap",
        443 | 8443 => "https",
        1433 => "mssql",
        1521 => "oracle",
        2049 => "nfs",
        2375 => "docker",
        2379 => "etcd",
        3306 => "mysql",
        3389 => "rdp",
        5432 => "postgresql",
        5672 => "amqp",
        5900 => "vnc",
        5985 | 5986 => "winrm",
        6379 => "redis",
        6443 => "kubernetes",
        9092 => "kafka",
        9200 | 9300 => "elasticsearch",
        11211 => "memcached",
        15672 => "rabbitmq-management",
        27017 => "mongodb",
        _ => return None,
    };
    Some(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[test]
    fn banner_beats_port_guess() {
        let (svc, ver) = classify_service(2222, Some("SSH-2.0-OpenSSH_9.6p1 Ubuntu-3"));
        assert_eq!(svc.as_deref(), Some("ssh"));
        assert_eq!(ver.as_deref(), Some("OpenSSH_9.6p1"));

        let (svc, _) = classify_service(2525, Some("220 mail.example.com ESMTP"));
        assert_eq!(svc.as_deref(), Some("smtp"));
        let (svc, _) = classify_service(21, Some("220 (vsFTPd 3.0.5)"));
        assert_eq!(svc.as_deref(), Some("ftp"));
    }

    #[test]
    fn port_guess_when_no_banner() {
        assert_eq!(classify_service(5432, None).0.as_deref(), Some("postgresql"));
        assert_eq!(classify_service(40000, None), (None, None));
    }

    #[tokio::test]
    async fn open_port_with_banner() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut sock, _)) = listener.accept().await {
                let _ = sock.write_all(b"SSH-2.0-test\r\n").await;
            }
        });

        let probe = TcpProber::new().probe(addr, Duration::from_millis(500)).await;
        assert_eq!(probe.state, PortState::Open);
        assert_eq!(probe.banner.as_deref(), Some("SSH-2.0-test"));
    }

    #[tokio::test]
    async fn refused_port_is_closed() {
        // Bind then drop to find a port nobody is listening on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let probe = TcpProber::new().probe(addr, Duration::from_millis(500)).await;
        assert_eq!(probe.state, PortState::Closed);
    }
}
