//! Shared fixtures for async tests: a scriptable SOCKS5 server and TCP
//! segment helpers.

use crate::packet::{build_ipv4_tcp, decode, TcpFlags, TcpHeader, Transport};
use crate::socks5::TargetAddr;
use std::future::Future;
use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Server side of greeting + CONNECT; returns the requested target
pub async fn accept_socks5(stream: &mut TcpStream) -> Option<TargetAddr> {
    let mut greeting = [0u8; 2];
    stream.read_exact(&mut greeting).await.ok()?;
    let mut methods = vec![0u8; greeting[1] as usize];
    stream.read_exact(&mut methods).await.ok()?;
    stream.write_all(&[0x05, 0x00]).await.ok()?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await.ok()?;
    let mut addr = vec![head[3]];
    match head[3] {
        0x01 => addr.resize(1 + 6, 0),
        0x04 => addr.resize(1 + 18, 0),
        _ => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await.ok()?;
            addr.push(len[0]);
            addr.resize(2 + len[0] as usize + 2, 0);
        }
    }
    let start = if head[3] == 0x03 { 2 } else { 1 };
    stream.read_exact(&mut addr[start..]).await.ok()?;
    let (target, _) = TargetAddr::parse(&addr)?;

    stream
        .write_all(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x04, 0x38])
        .await
        .ok()?;
    Some(target)
}

/// Listener that completes the handshake for every connection and then
/// hands the tunnel to `handler`. Returns the port.
pub async fn socks5_server<F, Fut>(handler: F) -> u16
where
    F: Fn(TcpStream, TargetAddr) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let handler = Arc::new(handler);
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let handler = handler.clone();
            tokio::spawn(async move {
                if let Some(target) = accept_socks5(&mut stream).await {
                    handler(stream, target).await;
                }
            });
        }
    });
    port
}

/// A port with nothing listening on it
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

pub fn app() -> SocketAddrV4 {
    "10.0.0.2:40000".parse().unwrap()
}

pub fn remote() -> SocketAddrV4 {
    "93.184.216.34:443".parse().unwrap()
}

/// App -> remote segment
pub fn app_segment(
    src: SocketAddrV4,
    dst: SocketAddrV4,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    payload: &[u8],
) -> Vec<u8> {
    let mss = if flags.syn { Some(1460) } else { None };
    build_ipv4_tcp(src, dst, seq, ack, flags, 65535, payload, mss)
}

pub fn syn(src: SocketAddrV4, dst: SocketAddrV4, seq: u32) -> Vec<u8> {
    app_segment(src, dst, seq, 0, TcpFlags { syn: true, ..Default::default() }, &[])
}

/// TCP header and payload of a packet written to the device
pub fn parse_tcp(packet: &[u8]) -> (TcpHeader, Vec<u8>) {
    let decoded = decode(packet).unwrap();
    let payload = decoded.payload(packet).to_vec();
    match decoded.transport {
        Transport::Tcp(tcp) => (tcp, payload),
        other => panic!("expected TCP, got {:?}", other),
    }
}

/// Poll `cond` until it holds or `limit` passes
pub async fn wait_until<F: FnMut() -> bool>(limit: Duration, mut cond: F) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
