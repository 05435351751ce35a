//! SOCKS5 client (RFC 1928, no authentication)
//!
//! Only the subset the data plane needs: greeting with method 0x00,
//! CONNECT and UDP ASSOCIATE. Every exchange for one connect runs under a
//! single deadline.

use crate::error::ConnectError;
use crate::protect::{protect_socket, SocketProtector};
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream, UdpSocket};
use tracing::{debug, warn};

pub const SOCKS5_VERSION: u8 = 0x05;
pub const AUTH_METHOD_NONE: u8 = 0x00;
pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;
pub const REPLY_SUCCEEDED: u8 = 0x00;
pub const MAX_DOMAIN_LEN: usize = 255;
/// Shortest reply a server may send: VER REP RSV ATYP + 4 address bytes + port
const MIN_REPLY_LEN: usize = 10;

/// Human-readable reason for a SOCKS5 reply code
pub fn reply_message(code: u8) -> &'static str {
    match code {
        0x00 => "succeeded",
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}

/// Destination carried in a SOCKS5 request
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl TargetAddr {
    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Ip(addr) => addr.port(),
            TargetAddr::Domain(_, port) => *port,
        }
    }

    /// Append `ATYP ADDR PORT`
    pub fn write_to(&self, buf: &mut Vec<u8>) -> Result<(), ConnectError> {
        match self {
            TargetAddr::Ip(SocketAddr::V4(addr)) => {
                buf.push(ATYP_IPV4);
                buf.extend_from_slice(&addr.ip().octets());
            }
            TargetAddr::Ip(SocketAddr::V6(addr)) => {
                buf.push(ATYP_IPV6);
                buf.extend_from_slice(&addr.ip().octets());
            }
            TargetAddr::Domain(domain, _) => {
                if domain.len() > MAX_DOMAIN_LEN {
                    return Err(ConnectError::DomainTooLong(domain.len()));
                }
                buf.push(ATYP_DOMAIN);
                buf.push(domain.len() as u8);
                buf.extend_from_slice(domain.as_bytes());
            }
        }
        buf.extend_from_slice(&self.port().to_be_bytes());
        Ok(())
    }

    /// Parse `ATYP ADDR PORT` from the front of `buf`, returning the consumed length
    pub fn parse(buf: &[u8]) -> Option<(Self, usize)> {
        let atyp = *buf.first()?;
        match atyp {
            ATYP_IPV4 => {
                let b = buf.get(1..7)?;
                let ip = Ipv4Addr::new(b[0], b[1], b[2], b[3]);
                let port = u16::from_be_bytes([b[4], b[5]]);
                Some((TargetAddr::Ip(SocketAddr::new(IpAddr::V4(ip), port)), 7))
            }
            ATYP_IPV6 => {
                let b = buf.get(1..19)?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&b[..16]);
                let port = u16::from_be_bytes([b[16], b[17]]);
                Some((TargetAddr::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)), 19))
            }
            ATYP_DOMAIN => {
                let len = *buf.get(1)? as usize;
                let b = buf.get(2..2 + len + 2)?;
                let domain = String::from_utf8_lossy(&b[..len]).into_owned();
                let port = u16::from_be_bytes([b[len], b[len + 1]]);
                Some((TargetAddr::Domain(domain, port), 2 + len + 2))
            }
            _ => None,
        }
    }
}

impl From<SocketAddr> for TargetAddr {
    fn from(addr: SocketAddr) -> Self {
        TargetAddr::Ip(addr)
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{}", addr),
            TargetAddr::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

/// Greeting, request and reply on an already connected stream.
/// Returns the bound address from the reply.
pub async fn handshake<S>(stream: &mut S, cmd: u8, target: &TargetAddr) -> Result<TargetAddr, ConnectError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Encode first so an oversized domain never reaches the wire
    let mut request = vec![SOCKS5_VERSION, cmd, 0x00];
    target.write_to(&mut request)?;

    stream
        .write_all(&[SOCKS5_VERSION, 0x01, AUTH_METHOD_NONE])
        .await
        .map_err(ConnectError::from_io)?;

    let mut response = [0u8; 2];
    stream.read_exact(&mut response).await.map_err(ConnectError::from_io)?;
    if response[0] != SOCKS5_VERSION || response[1] != AUTH_METHOD_NONE {
        return Err(ConnectError::HandshakeRejected {
            version: response[0],
            method: response[1],
        });
    }

    stream.write_all(&request).await.map_err(ConnectError::from_io)?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await.map_err(ConnectError::from_io)?;
    if head[0] != SOCKS5_VERSION {
        return Err(ConnectError::HandshakeRejected {
            version: head[0],
            method: head[1],
        });
    }
    if head[1] != REPLY_SUCCEEDED {
        return Err(ConnectError::UpstreamRejected { code: head[1] });
    }

    let addr_len = match head[3] {
        ATYP_IPV4 => 4 + 2,
        ATYP_IPV6 => 16 + 2,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await.map_err(ConnectError::from_io)?;
            len[0] as usize + 2
        }
        other => return Err(ConnectError::UnsupportedAddressType(other)),
    };

    // A short domain is padded up to the minimum reply; the padding is dropped
    let consumed = if head[3] == ATYP_DOMAIN {
        addr_len.max(MIN_REPLY_LEN - head.len() - 1)
    } else {
        addr_len
    };
    let mut rest = vec![0u8; consumed];
    stream.read_exact(&mut rest).await.map_err(ConnectError::from_io)?;

    let mut encoded = Vec::with_capacity(consumed + 2);
    encoded.push(head[3]);
    if head[3] == ATYP_DOMAIN {
        encoded.push((addr_len - 2) as u8);
    }
    encoded.extend_from_slice(&rest);
    TargetAddr::parse(&encoded)
        .map(|(addr, _)| addr)
        .ok_or(ConnectError::Truncated)
}

/// Established CONNECT tunnel
#[derive(Debug)]
pub struct Socks5Stream {
    inner: TcpStream,
    bound: TargetAddr,
}

impl Socks5Stream {
    /// BND.ADDR from the CONNECT reply
    pub fn bound_addr(&self) -> &TargetAddr {
        &self.bound
    }

    /// The tunnel's TCP stream, positioned after the reply
    pub fn into_inner(self) -> TcpStream {
        self.inner
    }
}

/// SOCKS5 client bound to one local proxy endpoint
#[derive(Debug, Clone)]
pub struct Socks5Client {
    proxy_host: String,
    proxy_port: u16,
    protector: Option<SocketProtector>,
}

impl Socks5Client {
    /// Client for the proxy at `proxy_host:proxy_port`
    pub fn new(proxy_host: impl Into<String>, proxy_port: u16) -> Self {
        Self {
            proxy_host: proxy_host.into(),
            proxy_port,
            protector: None,
        }
    }

    /// Protect every socket opened towards the proxy
    pub fn with_protector(mut self, protector: Option<SocketProtector>) -> Self {
        self.protector = protector;
        self
    }

    pub fn proxy_host(&self) -> &str {
        &self.proxy_host
    }

    pub fn proxy_port(&self) -> u16 {
        self.proxy_port
    }

    async fn connect_proxy(&self) -> Result<TcpStream, ConnectError> {
        let mut last_err = None;
        let addrs = tokio::net::lookup_host((self.proxy_host.as_str(), self.proxy_port))
            .await
            .map_err(ConnectError::Io)?;

        for addr in addrs {
            let socket = match addr {
                SocketAddr::V4(_) => TcpSocket::new_v4(),
                SocketAddr::V6(_) => TcpSocket::new_v6(),
            }
            .map_err(ConnectError::Io)?;

            if !protect_socket(self.protector.as_ref(), &socket) {
                warn!("Proxy socket for {} left unprotected", addr);
            }

            match socket.connect(addr).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    return Ok(stream);
                }
                Err(e) => last_err = Some(e),
            }
        }

        Err(ConnectError::Io(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "proxy host resolved to no addresses")
        })))
    }

    /// Open a CONNECT tunnel to `target`
    pub async fn connect(&self, target: &TargetAddr, timeout: Duration) -> Result<Socks5Stream, ConnectError> {
        let attempt = async {
            let mut stream = self.connect_proxy().await?;
            let bound = handshake(&mut stream, CMD_CONNECT, target).await?;
            Ok::<_, ConnectError>(Socks5Stream { inner: stream, bound })
        };

        let stream = tokio::time::timeout(timeout, attempt)
            .await
            .map_err(|_| ConnectError::Timeout)??;

        debug!("SOCKS5 tunnel to {} open (bound {})", target, stream.bound);
        Ok(stream)
    }

    /// Set up a UDP relay through the proxy
    pub async fn udp_associate(&self, timeout: Duration) -> Result<UdpAssociation, ConnectError> {
        let attempt = async {
            let mut control = self.connect_proxy().await?;
            let unspecified = TargetAddr::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
            let bound = handshake(&mut control, CMD_UDP_ASSOCIATE, &unspecified).await?;

            let proxy_ip = control.peer_addr().map_err(ConnectError::Io)?.ip();
            let relay = match bound {
                TargetAddr::Ip(addr) if addr.ip().is_unspecified() => SocketAddr::new(proxy_ip, addr.port()),
                TargetAddr::Ip(addr) => addr,
                TargetAddr::Domain(_, port) => SocketAddr::new(proxy_ip, port),
            };

            let bind_addr: SocketAddr = match relay {
                SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
                SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
            };
            let std_socket = std::net::UdpSocket::bind(bind_addr).map_err(ConnectError::Io)?;
            if !protect_socket(self.protector.as_ref(), &std_socket) {
                warn!("UDP relay socket left unprotected");
            }
            std_socket.set_nonblocking(true).map_err(ConnectError::Io)?;
            let socket = UdpSocket::from_std(std_socket).map_err(ConnectError::Io)?;

            Ok::<_, ConnectError>(UdpAssociation { control, socket, relay })
        };

        let assoc = tokio::time::timeout(timeout, attempt)
            .await
            .map_err(|_| ConnectError::Timeout)??;

        debug!("UDP relay address: {}", assoc.relay);
        Ok(assoc)
    }
}

/// `RSV RSV FRAG ATYP ADDR PORT DATA`
pub fn encode_udp_datagram(target: &TargetAddr, payload: &[u8]) -> Result<Vec<u8>, ConnectError> {
    let mut buf = Vec::with_capacity(payload.len() + 22);
    buf.extend_from_slice(&[0x00, 0x00, 0x00]);
    target.write_to(&mut buf)?;
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Split a relayed datagram into its source address and payload.
/// Fragmented datagrams are not supported and yield `None`.
pub fn decode_udp_datagram(buf: &[u8]) -> Option<(TargetAddr, &[u8])> {
    if buf.len() < 4 || buf[2] != 0 {
        return None;
    }
    let (addr, len) = TargetAddr::parse(&buf[3..])?;
    Some((addr, &buf[3 + len..]))
}

/// Live UDP ASSOCIATE session. The relay stays open while the control
/// connection is held.
#[derive(Debug)]
pub struct UdpAssociation {
    #[allow(dead_code)]
    control: TcpStream,
    socket: UdpSocket,
    relay: SocketAddr,
}

impl UdpAssociation {
    /// UDP relay address announced by the proxy
    pub fn relay_addr(&self) -> SocketAddr {
        self.relay
    }

    /// Send `payload` to `target` through the relay
    pub async fn send_to(&self, target: &TargetAddr, payload: &[u8]) -> Result<usize, ConnectError> {
        let datagram = encode_udp_datagram(target, payload)?;
        self.socket
            .send_to(&datagram, self.relay)
            .await
            .map_err(ConnectError::Io)?;
        Ok(payload.len())
    }

    /// Receive the next well-formed datagram; the payload is moved to the
    /// front of `buf`.
    pub async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(TargetAddr, usize)> {
        loop {
            let (n, from) = self.socket.recv_from(buf).await?;
            if from != self.relay {
                continue;
            }
            let (addr, header_len) = match decode_udp_datagram(&buf[..n]) {
                Some((addr, payload)) => (addr, n - payload.len()),
                None => {
                    debug!("Dropping malformed relay datagram ({} bytes)", n);
                    continue;
                }
            };
            buf.copy_within(header_len..n, 0);
            return Ok((addr, n - header_len));
        }
    }
}
