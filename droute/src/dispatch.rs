//! Upstream dispatch (C5): protocol- and address-family-aware delivery
//! of one wire-format query to one named upstream, with a 2-second
//! per-attempt deadline and UDP-truncation-to-TCP fallback.

use crate::config::{Protocol, Upstream};
use crate::error::DispatchError;
use rand::seq::SliceRandom;
use socket2::TcpKeepalive;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(2);
const DNS_PORT: u16 = 53;
const DOT_PORT: u16 = 853;
const MAX_UDP_MESSAGE: usize = 4096;

/// Which listener accepted the inbound query, used to pick the address
/// family of the upstream to dial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    /// Use the upstream's IPv4 addresses.
    V4,
    /// Use the upstream's IPv6 addresses.
    V6,
}

/// The outcome of one dispatch attempt, enough to populate a
/// [`crate::log_sink::RequestLog`].
pub struct DispatchOutcome {
    /// The wire-format reply, if the attempt succeeded.
    pub reply: Option<Vec<u8>>,
    /// `"<proto>://<ip>"` the attempt used.
    pub server: String,
    /// Wall time the attempt took.
    pub elapsed: Duration,
    /// The failure, if any.
    pub error: Option<DispatchError>,
}

/// Dispatch `query` (a complete wire-format DNS message, no length
/// prefix) to `upstream` over its preferred protocol, picking one of
/// its addresses in the requested family.
pub async fn dispatch(
    upstream: &Upstream,
    family: AddressFamily,
    query: &[u8],
    http_client: &reqwest::Client,
) -> DispatchOutcome {
    let candidates = match family {
        AddressFamily::V4 => &upstream.ipv4,
        AddressFamily::V6 => &upstream.ipv6,
    };
    let ip = match pick_ip(candidates) {
        Some(ip) => ip,
        None => {
            return DispatchOutcome {
                reply: None,
                server: String::new(),
                elapsed: Duration::ZERO,
                error: Some(DispatchError::NoAddressForFamily(upstream.name.clone())),
            }
        }
    };

    let proto = upstream.preferred_protocol;
    let server = format!("{}://{}", proto_str(proto), ip);
    let start = std::time::Instant::now();

    let result = match proto {
        Protocol::Udp => query_udp_with_tcp_fallback(ip, query).await,
        Protocol::Tcp => query_tcp(ip, query).await,
        Protocol::Tls => query_tls(ip, upstream_tls_name(upstream), query).await,
        Protocol::Https => query_https(http_client, ip, query).await,
    };

    let elapsed = start.elapsed();
    match result {
        Ok(reply) => DispatchOutcome {
            reply: Some(reply),
            server,
            elapsed,
            error: None,
        },
        Err(e) => DispatchOutcome {
            reply: None,
            server,
            elapsed,
            error: Some(e),
        },
    }
}

fn pick_ip(candidates: &[IpAddr]) -> Option<IpAddr> {
    match candidates {
        [] => None,
        [single] => Some(*single),
        many => many.choose(&mut rand::thread_rng()).copied(),
    }
}

fn proto_str(p: Protocol) -> &'static str {
    match p {
        Protocol::Udp => "udp",
        Protocol::Tcp => "tcp",
        Protocol::Tls => "tls",
        Protocol::Https => "https",
    }
}

// The `domain` crate of this upstream's name; upstreams configured by
// bare IP have no SNI hostname to present, so we fall back to the IP
// text itself (the teacher's `no_sni` knob is the other way to handle
// this; this crate always presents a name).
fn upstream_tls_name(upstream: &Upstream) -> String {
    upstream.name.clone()
}

fn is_truncated(msg: &[u8]) -> bool {
    // RFC 1035 header: byte 2 bit 0x02 is the TC flag.
    msg.len() > 2 && msg[2] & 0x02 != 0
}

async fn query_udp_with_tcp_fallback(ip: IpAddr, query: &[u8]) -> Result<Vec<u8>, DispatchError> {
    let reply = tokio::time::timeout(ATTEMPT_TIMEOUT, query_udp(ip, query)).await??;
    if is_truncated(&reply) {
        log::debug!("udp reply from {} truncated, retrying over tcp", ip);
        tokio::time::timeout(ATTEMPT_TIMEOUT, query_tcp(ip, query)).await?
    } else {
        Ok(reply)
    }
}

async fn query_udp(ip: IpAddr, query: &[u8]) -> Result<Vec<u8>, DispatchError> {
    let bind_addr: SocketAddr = if ip.is_ipv4() {
        "0.0.0.0:0".parse().unwrap()
    } else {
        "[::]:0".parse().unwrap()
    };
    let socket = UdpSocket::bind(bind_addr).await?;
    let dest = SocketAddr::new(ip, DNS_PORT);
    socket.connect(dest).await?;
    socket.send(query).await?;

    let mut buf = vec![0u8; MAX_UDP_MESSAGE];
    let query_id = query_id_of(query);
    loop {
        let n = socket.recv(&mut buf).await?;
        let reply = &buf[..n];
        if query_id_of(reply) == query_id {
            return Ok(reply.to_vec());
        }
        // Stale/mismatched reply (e.g. a retransmit); keep waiting within
        // the outer timeout.
    }
}

fn query_id_of(msg: &[u8]) -> u16 {
    if msg.len() >= 2 {
        u16::from_be_bytes([msg[0], msg[1]])
    } else {
        0
    }
}

async fn query_tcp(ip: IpAddr, query: &[u8]) -> Result<Vec<u8>, DispatchError> {
    let dest = SocketAddr::new(ip, DNS_PORT);
    let mut stream = tokio::time::timeout(ATTEMPT_TIMEOUT, TcpStream::connect(dest)).await??;
    stream.set_nodelay(true).ok();
    tcp_exchange(&mut stream, query).await
}

async fn tcp_exchange<S>(stream: &mut S, query: &[u8]) -> Result<Vec<u8>, DispatchError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let len = u16::try_from(query.len()).map_err(|_| DispatchError::Wire("query too large for TCP framing".into()))?;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(query).await?;

    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let reply_len = u16::from_be_bytes(len_buf) as usize;
    let mut reply = vec![0u8; reply_len];
    stream.read_exact(&mut reply).await?;
    Ok(reply)
}

async fn query_tls(ip: IpAddr, server_name: String, query: &[u8]) -> Result<Vec<u8>, DispatchError> {
    use std::sync::Arc;
    use tokio_rustls::rustls::ClientConfig;
    use tokio_rustls::TlsConnector;

    let dest = SocketAddr::new(ip, DOT_PORT);
    let tcp = tokio::time::timeout(ATTEMPT_TIMEOUT, TcpStream::connect(dest)).await??;
    apply_keepalive(&tcp)?;

    let mut root_store = tokio_rustls::rustls::RootCertStore::empty();
    root_store.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
        tokio_rustls::rustls::OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject,
            ta.spki,
            ta.name_constraints,
        )
    }));
    let client_config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(client_config));
    let dns_name = tokio_rustls::rustls::ServerName::try_from(server_name.as_str())
        .map_err(|_| DispatchError::Tls(format!("invalid DNS name {server_name:?}")))?;

    let mut tls_stream = tokio::time::timeout(ATTEMPT_TIMEOUT, connector.connect(dns_name, tcp))
        .await?
        .map_err(|e| DispatchError::Tls(e.to_string()))?;
    tcp_exchange(&mut tls_stream, query).await
}

fn apply_keepalive(stream: &TcpStream) -> std::io::Result<()> {
    let sock_ref = socket2::SockRef::from(stream);
    let keepalive = TcpKeepalive::new().with_time(Duration::from_secs(60));
    sock_ref.set_tcp_keepalive(&keepalive)
}

async fn query_https(client: &reqwest::Client, ip: IpAddr, query: &[u8]) -> Result<Vec<u8>, DispatchError> {
    let url = format!("https://{ip}/dns-query");
    let resp = tokio::time::timeout(
        ATTEMPT_TIMEOUT,
        client
            .post(&url)
            .header("content-type", "application/dns-message")
            .header("accept", "application/dns-message")
            .body(query.to_vec())
            .send(),
    )
    .await??;

    if !resp.status().is_success() {
        return Err(DispatchError::Http(resp.status()));
    }
    Ok(resp.bytes().await?.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pick_ip_is_none_for_empty_candidates() {
        assert_eq!(pick_ip(&[]), None);
    }

    #[test]
    fn pick_ip_is_deterministic_for_one_candidate() {
        let ip: IpAddr = "1.1.1.1".parse().unwrap();
        assert_eq!(pick_ip(&[ip]), Some(ip));
    }

    #[test]
    fn pick_ip_chooses_among_many_candidates() {
        let a: IpAddr = "1.1.1.1".parse().unwrap();
        let b: IpAddr = "8.8.8.8".parse().unwrap();
        let picked = pick_ip(&[a, b]).unwrap();
        assert!(picked == a || picked == b);
    }

    #[test]
    fn truncation_bit_detected() {
        let mut msg = vec![0u8; 12];
        assert!(!is_truncated(&msg));
        msg[2] = 0x02;
        assert!(is_truncated(&msg));
    }

    #[test]
    fn query_id_roundtrips_header_bytes() {
        let msg = [0x12, 0x34, 0, 0];
        assert_eq!(query_id_of(&msg), 0x1234);
        assert_eq!(query_id_of(&[]), 0);
    }

    #[test]
    fn proto_str_names_match_config_protocol() {
        assert_eq!(proto_str(Protocol::Udp), "udp");
        assert_eq!(proto_str(Protocol::Tcp), "tcp");
        assert_eq!(proto_str(Protocol::Tls), "tls");
        assert_eq!(proto_str(Protocol::Https), "https");
    }
}
