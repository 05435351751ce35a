//! TCP relay
//!
//! Terminates the app side of each TCP connection with a minimal endpoint
//! (handshake, in-order receive, ACKs, FIN/RST) and copies the byte stream
//! to a SOCKS5 tunnel.
//!
//! ```text
//!  app ──SYN──▶ SYN-ACK ◀──┐
//!  app ──data──▶ uplink queue ──▶ [uplink pump] ──▶ SOCKS5 ──▶ remote
//!  app ◀──segments── [downlink pump] ◀────────────── SOCKS5 ◀── remote
//! ```
//!
//! There is no retransmission on the downlink: segments are written to the
//! device once and the app's own stack buffers them.

use crate::config::EngineConfig;
use crate::device::PacketDevice;
use crate::error::{ConnectError, DataPlaneError, Result};
use crate::flow::{FlowDefaults, FlowKey, RelayState, StateCell};
use crate::flow_table::FlowTable;
use crate::packet::{build_ipv4_tcp, TcpFlags, TcpHeader, DEFAULT_MSS_V4};
use crate::socks5::{Socks5Client, TargetAddr};
use crate::stats::EngineStats;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

const WINDOW: u16 = 65535;
const DOWNLINK_BUF: usize = 16 * 1024;

/// Timeouts and limits for TCP sessions
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub drain_timeout: Duration,
    pub uplink_queue: usize,
    pub defaults: FlowDefaults,
}

impl From<&EngineConfig> for RelayConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            idle_timeout: config.idle_timeout,
            drain_timeout: config.drain_timeout,
            uplink_queue: config.uplink_queue,
            defaults: FlowDefaults::new(config.proxy_label.clone()),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

#[derive(Debug)]
struct Tcb {
    iss: u32,
    their_isn: u32,
    snd_nxt: u32,
    rcv_nxt: u32,
    peer_mss: u16,
    fin_received: bool,
    fin_sent: bool,
}

/// Relay state of one TCP flow
pub struct TcpSession {
    key: FlowKey,
    state: StateCell,
    tcb: Mutex<Tcb>,
    uplink: Mutex<Option<mpsc::Sender<Bytes>>>,
    cancel: CancellationToken,
    started: Instant,
    last_activity: AtomicU64,
}

impl TcpSession {
    fn new(
        key: FlowKey,
        iss: u32,
        their_isn: u32,
        peer_mss: u16,
        uplink: mpsc::Sender<Bytes>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            key,
            state: StateCell::new(RelayState::Handshaking),
            tcb: Mutex::new(Tcb {
                iss,
                their_isn,
                snd_nxt: iss.wrapping_add(1),
                rcv_nxt: their_isn.wrapping_add(1),
                peer_mss,
                fin_received: false,
                fin_sent: false,
            }),
            uplink: Mutex::new(Some(uplink)),
            cancel,
            started: Instant::now(),
            last_activity: AtomicU64::new(0),
        }
    }

    pub fn key(&self) -> FlowKey {
        self.key
    }

    /// Current relay state
    pub fn state(&self) -> RelayState {
        self.state.load()
    }

    fn transition(&self, next: RelayState) -> bool {
        self.state.transition(next).is_ok()
    }

    fn touch(&self) {
        let nanos = self.started.elapsed().as_nanos() as u64;
        self.last_activity.fetch_max(nanos, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_nanos(self.last_activity.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }

    fn seq_ack(&self) -> (u32, u32) {
        let tcb = self.tcb.lock();
        (tcb.snd_nxt, tcb.rcv_nxt)
    }
}

/// Per-flow TCP sessions and their tasks
pub struct RelayPipeline {
    sessions: DashMap<FlowKey, Arc<TcpSession>>,
    flows: Arc<FlowTable>,
    device: Arc<dyn PacketDevice>,
    client: Socks5Client,
    stats: Arc<EngineStats>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    config: RelayConfig,
}

impl RelayPipeline {
    pub fn new(
        flows: Arc<FlowTable>,
        device: Arc<dyn PacketDevice>,
        client: Socks5Client,
        stats: Arc<EngineStats>,
        tracker: TaskTracker,
        cancel: CancellationToken,
        config: RelayConfig,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            flows,
            device,
            client,
            stats,
            tracker,
            cancel,
            config,
        }
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// State of the session for `key`, if any
    pub fn session_state(&self, key: &FlowKey) -> Option<RelayState> {
        self.sessions.get(key).map(|s| s.state())
    }

    fn session(&self, key: &FlowKey) -> Option<Arc<TcpSession>> {
        self.sessions.get(key).map(|s| Arc::clone(s.value()))
    }

    /// Cancel a session; its flow stays in the table marked closed
    pub fn close_session(&self, key: &FlowKey) -> bool {
        match self.session(key) {
            Some(session) => {
                self.abort(&session);
                true
            }
            None => false,
        }
    }

    /// Cancel every session
    pub fn close_all(&self) -> usize {
        let sessions: Vec<Arc<TcpSession>> = self.sessions.iter().map(|e| Arc::clone(e.value())).collect();
        for session in &sessions {
            self.abort(session);
        }
        sessions.len()
    }

    fn abort(&self, session: &TcpSession) {
        self.advance(session, RelayState::Closed);
        session.cancel.cancel();
    }

    /// Move session and flow together
    fn advance(&self, session: &TcpSession, next: RelayState) -> bool {
        if !session.transition(next) {
            return false;
        }
        if next == RelayState::Closed {
            self.flows.mark_closed(&session.key);
        } else {
            self.flows.set_state(&session.key, next);
        }
        true
    }

    fn remove_session(&self, session: &Arc<TcpSession>) {
        self.sessions
            .remove_if(&session.key, |_, s| Arc::ptr_eq(s, session));
    }

    async fn send_segment(
        &self,
        key: &FlowKey,
        seq: u32,
        ack: u32,
        flags: TcpFlags,
        payload: &[u8],
        mss: Option<u16>,
    ) -> io::Result<()> {
        let (SocketAddr::V4(app), SocketAddr::V4(remote)) = (key.src, key.dst) else {
            return Err(io::Error::new(io::ErrorKind::Unsupported, "IPv6 TCP relay"));
        };
        let packet = build_ipv4_tcp(remote, app, seq, ack, flags, WINDOW, payload, mss);
        self.device.send(&packet).await?;
        self.stats.record_sent();
        Ok(())
    }

    /// Entry point for every TCP segment read from the device
    pub async fn handle_tcp(self: &Arc<Self>, key: FlowKey, tcp: &TcpHeader, payload: &[u8]) -> Result<()> {
        debug!(
            "TCP: {} flags={:?} seq={} ack={} len={}",
            key, tcp.flags, tcp.seq, tcp.ack, payload.len()
        );

        if tcp.flags.syn && !tcp.flags.ack {
            return self.handle_syn(key, tcp).await;
        }

        match self.session(&key) {
            Some(session) => self.handle_segment(&session, tcp, payload).await,
            None if tcp.flags.rst => Ok(()),
            None => {
                debug!("No session for {}, sending RST", key);
                let (seq, ack, flags) = if tcp.flags.ack {
                    (tcp.ack, 0, TcpFlags { rst: true, ..Default::default() })
                } else {
                    let consumed = payload.len() as u32 + tcp.flags.fin as u32;
                    (0, tcp.seq.wrapping_add(consumed), TcpFlags::rst_ack())
                };
                self.send_segment(&key, seq, ack, flags, &[], None).await?;
                Ok(())
            }
        }
    }

    async fn handle_syn(self: &Arc<Self>, key: FlowKey, tcp: &TcpHeader) -> Result<()> {
        if let Some(existing) = self.session(&key) {
            let (isn, iss) = {
                let tcb = existing.tcb.lock();
                (tcb.their_isn, tcb.iss)
            };
            if isn == tcp.seq {
                // Retransmitted SYN; our SYN-ACK was lost
                self.send_segment(&key, iss, tcp.seq.wrapping_add(1), TcpFlags::syn_ack(), &[], Some(DEFAULT_MSS_V4))
                    .await?;
                return Ok(());
            }
            // Port reuse: the old connection is gone on the app side
            self.abort(&existing);
            self.remove_session(&existing);
            self.flows.close(&key);
        }

        // A failed earlier attempt leaves a closed record behind
        if self.flows.state(&key) == Some(RelayState::Closed) {
            self.flows.close(&key);
        }

        let (flow, _) = self.flows.record_or_get(&key, &self.config.defaults);
        self.flows.set_state(&key, RelayState::Handshaking);

        let iss: u32 = rand::random();
        let peer_mss = tcp.mss.unwrap_or(DEFAULT_MSS_V4).min(DEFAULT_MSS_V4);
        let (tx, rx) = mpsc::channel(self.config.uplink_queue);
        let session = Arc::new(TcpSession::new(key, iss, tcp.seq, peer_mss, tx, self.cancel.child_token()));
        session.touch();
        self.sessions.insert(key, session.clone());

        debug!("Flow #{} SYN {} (peer mss {})", flow.id, key, peer_mss);
        self.send_segment(&key, iss, tcp.seq.wrapping_add(1), TcpFlags::syn_ack(), &[], Some(DEFAULT_MSS_V4))
            .await?;

        let pipeline = Arc::clone(self);
        self.tracker.spawn(async move {
            pipeline.run_session(session, rx).await;
        });
        Ok(())
    }

    async fn handle_segment(&self, session: &Arc<TcpSession>, tcp: &TcpHeader, payload: &[u8]) -> Result<()> {
        let key = session.key;
        self.flows.touch(&key);
        session.touch();

        if tcp.flags.rst {
            debug!("App reset {}", key);
            self.abort(session);
            self.flows.close(&key);
            return Ok(());
        }

        let mut reply_ack = false;
        let mut fin_now = false;
        {
            let mut tcb = session.tcb.lock();
            let mut accepted = payload.is_empty();

            if !payload.is_empty() {
                if tcp.seq == tcb.rcv_nxt && !tcb.fin_received {
                    let queued = session
                        .uplink
                        .lock()
                        .as_ref()
                        .map(|tx| tx.try_send(Bytes::copy_from_slice(payload)));
                    match queued {
                        Some(Ok(())) => {
                            tcb.rcv_nxt = tcb.rcv_nxt.wrapping_add(payload.len() as u32);
                            accepted = true;
                            reply_ack = true;
                        }
                        // Unacknowledged; the app retransmits
                        Some(Err(mpsc::error::TrySendError::Full(_))) => {
                            self.stats.record_dropped();
                        }
                        Some(Err(mpsc::error::TrySendError::Closed(_))) | None => {}
                    }
                } else {
                    reply_ack = true;
                }
            }

            if tcp.flags.fin {
                let fin_seq = tcp.seq.wrapping_add(payload.len() as u32);
                if accepted && !tcb.fin_received && fin_seq == tcb.rcv_nxt {
                    tcb.rcv_nxt = tcb.rcv_nxt.wrapping_add(1);
                    tcb.fin_received = true;
                    fin_now = true;
                    reply_ack = true;
                } else if tcb.fin_received {
                    reply_ack = true;
                }
            }
        }

        if fin_now {
            debug!("App FIN {}", key);
            // Dropping the sender lets the uplink pump flush and half-close
            session.uplink.lock().take();
            self.advance(session, RelayState::Closing);
        }

        if !reply_ack {
            return Ok(());
        }
        // Out-of-order data gets the same ACK again
        let (seq, ack) = session.seq_ack();
        if let Err(e) = self.send_segment(&key, seq, ack, TcpFlags::ack_only(), &[], None).await {
            warn!("Device write failed for {}: {}", key, e);
            self.advance(session, RelayState::Closing);
            return Err(DataPlaneError::Io(e));
        }
        Ok(())
    }

    async fn run_session(self: Arc<Self>, session: Arc<TcpSession>, uplink_rx: mpsc::Receiver<Bytes>) {
        let key = session.key;
        let target = TargetAddr::Ip(key.dst);

        let connected = tokio::select! {
            biased;
            _ = session.cancel.cancelled() => Err(ConnectError::Cancelled),
            r = self.client.connect(&target, self.config.connect_timeout) => r,
        };

        let stream = match connected {
            Ok(stream) => stream,
            Err(ConnectError::Cancelled) => {
                self.abort(&session);
                self.remove_session(&session);
                return;
            }
            Err(e) => {
                if matches!(e, ConnectError::Timeout) {
                    self.stats.record_timeout();
                }
                self.stats.record_proxy_error();
                warn!("SOCKS5 connect for {} failed: {}", key, e);
                self.advance(&session, RelayState::Closed);
                let (seq, ack) = session.seq_ack();
                let _ = self.send_segment(&key, seq, ack, TcpFlags::rst_ack(), &[], None).await;
                self.remove_session(&session);
                return;
            }
        };

        // Closed while connecting
        if !self.advance(&session, RelayState::Relaying) {
            self.remove_session(&session);
            return;
        }
        debug!("Relaying {}", key);

        let (rd, wr) = stream.into_inner().into_split();
        let uplink = self.pump_uplink(&session, uplink_rx, wr);
        let downlink = self.pump_downlink(&session, rd);
        tokio::pin!(uplink, downlink);

        let first = tokio::select! {
            _ = session.cancel.cancelled() => None,
            r = &mut uplink => {
                if let Err(e) = r {
                    debug!("Uplink of {} ended: {}", key, e);
                }
                Some(true)
            }
            r = &mut downlink => {
                if let Err(e) = r {
                    debug!("Downlink of {} ended: {}", key, e);
                }
                Some(false)
            }
        };

        let graceful = match first {
            None => false,
            Some(uplink_done) => {
                self.advance(&session, RelayState::Closing);
                let remaining = async {
                    if uplink_done {
                        let _ = (&mut downlink).await;
                    } else {
                        let _ = (&mut uplink).await;
                    }
                };
                tokio::select! {
                    _ = session.cancel.cancelled() => false,
                    _ = tokio::time::timeout(self.config.drain_timeout, remaining) => true,
                }
            }
        };

        if graceful {
            let _ = self.send_fin(&session).await;
            self.advance(&session, RelayState::Closed);
            if let Some(flow) = self.flows.close(&key) {
                debug!(
                    "Flow #{} finished: up {} / down {}",
                    flow.id, flow.bytes_up, flow.bytes_down
                );
            }
        } else {
            self.abort(&session);
        }
        self.remove_session(&session);
    }

    async fn pump_uplink(
        &self,
        session: &TcpSession,
        mut rx: mpsc::Receiver<Bytes>,
        mut wr: OwnedWriteHalf,
    ) -> io::Result<()> {
        while let Some(chunk) = rx.recv().await {
            session.touch();
            self.flows.apply_traffic(&session.key, chunk.len() as u64, 0);
            tokio::time::timeout(self.config.idle_timeout, wr.write_all(&chunk))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "upstream write stalled"))??;
        }
        wr.shutdown().await
    }

    async fn pump_downlink(&self, session: &TcpSession, mut rd: OwnedReadHalf) -> io::Result<()> {
        let idle = self.config.idle_timeout;
        let mut buf = vec![0u8; DOWNLINK_BUF];
        loop {
            let n = match tokio::time::timeout(idle, rd.read(&mut buf)).await {
                Err(_) if session.idle_for() >= idle => {
                    self.stats.record_timeout();
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "session idle"));
                }
                Err(_) => continue,
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(e),
            };
            session.touch();
            self.flows.apply_traffic(&session.key, 0, n as u64);
            self.write_to_app(session, &buf[..n]).await?;
        }
        self.send_fin(session).await
    }

    /// Segment `data` to the peer MSS and write it to the device
    async fn write_to_app(&self, session: &TcpSession, data: &[u8]) -> io::Result<()> {
        let (base_seq, ack, mss) = {
            let mut tcb = session.tcb.lock();
            let seq = tcb.snd_nxt;
            tcb.snd_nxt = tcb.snd_nxt.wrapping_add(data.len() as u32);
            (seq, tcb.rcv_nxt, tcb.peer_mss as usize)
        };

        let mut seq = base_seq;
        let mut chunks = data.chunks(mss.max(1)).peekable();
        while let Some(chunk) = chunks.next() {
            let flags = if chunks.peek().is_none() {
                TcpFlags::psh_ack()
            } else {
                TcpFlags::ack_only()
            };
            self.send_segment(&session.key, seq, ack, flags, chunk, None).await?;
            seq = seq.wrapping_add(chunk.len() as u32);
        }
        Ok(())
    }

    async fn send_fin(&self, session: &TcpSession) -> io::Result<()> {
        let (seq, ack) = {
            let mut tcb = session.tcb.lock();
            if tcb.fin_sent {
                return Ok(());
            }
            tcb.fin_sent = true;
            let seq = tcb.snd_nxt;
            tcb.snd_nxt = tcb.snd_nxt.wrapping_add(1);
            (seq, tcb.rcv_nxt)
        };
        self.send_segment(&session.key, seq, ack, TcpFlags::fin_ack(), &[], None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{ChannelDevice, DeviceHandle};
    use crate::testutil::*;
    use crate::traffic::TrafficAccumulator;
    use async_trait::async_trait;
    use std::net::SocketAddrV4;
    use std::sync::atomic::{AtomicU16, AtomicUsize};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    struct Harness {
        relay: Arc<RelayPipeline>,
        flows: Arc<FlowTable>,
        stats: Arc<EngineStats>,
        handle: DeviceHandle,
        key: FlowKey,
    }

    fn test_config() -> RelayConfig {
        RelayConfig {
            connect_timeout: Duration::from_secs(2),
            drain_timeout: Duration::from_millis(500),
            ..RelayConfig::default()
        }
    }

    fn harness(proxy_port: u16) -> Harness {
        harness_with(proxy_port, test_config())
    }

    fn harness_with(proxy_port: u16, config: RelayConfig) -> Harness {
        let (device, handle) = ChannelDevice::pair(256);
        harness_on(Arc::new(device), handle, proxy_port, config)
    }

    fn harness_on(device: Arc<dyn PacketDevice>, handle: DeviceHandle, proxy_port: u16, config: RelayConfig) -> Harness {
        let flows = Arc::new(FlowTable::new(Arc::new(TrafficAccumulator::new()), 64));
        let stats = Arc::new(EngineStats::new());
        let relay = Arc::new(RelayPipeline::new(
            flows.clone(),
            device,
            Socks5Client::new("127.0.0.1", proxy_port),
            stats.clone(),
            TaskTracker::new(),
            CancellationToken::new(),
            config,
        ));
        let key = FlowKey::tcp(SocketAddr::V4(app()), SocketAddr::V4(remote()));
        Harness { relay, flows, stats, handle, key }
    }

    /// Hand a packet to the relay under the flow it belongs to
    async fn try_feed(h: &Harness, packet: Vec<u8>) -> Result<()> {
        let decoded = crate::packet::decode(&packet).unwrap();
        let payload = decoded.payload(&packet).to_vec();
        let key = FlowKey::tcp(decoded.src_socket().unwrap(), decoded.dst_socket().unwrap());
        match decoded.transport {
            crate::packet::Transport::Tcp(tcp) => h.relay.handle_tcp(key, &tcp, &payload).await,
            other => panic!("expected TCP, got {:?}", other),
        }
    }

    async fn feed(h: &Harness, packet: Vec<u8>) {
        try_feed(h, packet).await.unwrap();
    }

    /// Upstream that records what it reads and closes once the client does
    async fn read_all(mut stream: tokio::net::TcpStream, seen: Arc<parking_lot::Mutex<Vec<u8>>>) {
        let mut data = Vec::new();
        let _ = stream.read_to_end(&mut data).await;
        seen.lock().extend_from_slice(&data);
    }

    /// Channel device whose writes towards one app port fail
    struct FailingWrites {
        inner: ChannelDevice,
        port: AtomicU16,
    }

    #[async_trait]
    impl PacketDevice for FailingWrites {
        async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
            self.inner.recv(buf).await
        }

        async fn send(&self, packet: &[u8]) -> io::Result<()> {
            let dst_port = crate::packet::decode(packet)
                .ok()
                .and_then(|d| d.dst_socket())
                .map(|a| a.port());
            if dst_port == Some(self.port.load(Ordering::SeqCst)) {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "write refused"));
            }
            self.inner.send(packet).await
        }

        async fn close(&self) -> io::Result<()> {
            self.inner.close().await
        }
    }

    async fn next_tcp(h: &mut Harness) -> (TcpHeader, Vec<u8>) {
        let packet = tokio::time::timeout(Duration::from_secs(5), h.handle.next_packet())
            .await
            .unwrap()
            .unwrap();
        parse_tcp(&packet)
    }

    #[tokio::test]
    async fn test_syn_gets_syn_ack() {
        let port = socks5_server(|_stream, _target| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
        })
        .await;
        let mut h = harness(port);

        feed(&h, syn(app(), remote(), 1000)).await;
        let (synack, _) = next_tcp(&mut h).await;
        assert!(synack.flags.syn && synack.flags.ack);
        assert_eq!(synack.ack, 1001);
        assert_eq!(synack.mss, Some(DEFAULT_MSS_V4));
        assert_eq!(synack.src_port, 443);
        assert_eq!(synack.dst_port, 40000);

        // Retransmitted SYN is answered with the same sequence number
        feed(&h, syn(app(), remote(), 1000)).await;
        let (again, _) = next_tcp(&mut h).await;
        assert_eq!(again.seq, synack.seq);

        assert_eq!(h.relay.session_count(), 1);
        let relay = h.relay.clone();
        let key = h.key;
        assert!(wait_until(Duration::from_secs(2), || relay.session_state(&key) == Some(RelayState::Relaying)).await);
        assert_eq!(h.flows.state(&h.key), Some(RelayState::Relaying));
    }

    #[tokio::test]
    async fn test_unknown_segment_gets_rst() {
        let mut h = harness(closed_port().await);
        feed(&h, app_segment(app(), remote(), 500, 77, TcpFlags::ack_only(), b"abc")).await;
        let (rst, _) = next_tcp(&mut h).await;
        assert!(rst.flags.rst && !rst.flags.ack);
        assert_eq!(rst.seq, 77);

        // Without ACK the reset starts at zero and acknowledges the segment
        let fin = TcpFlags { fin: true, ..Default::default() };
        feed(&h, app_segment(app(), remote(), 900, 0, fin, b"xy")).await;
        let (rst, _) = next_tcp(&mut h).await;
        assert!(rst.flags.rst && rst.flags.ack);
        assert_eq!(rst.seq, 0);
        assert_eq!(rst.ack, 903);

        // A RST is never answered
        feed(&h, app_segment(app(), remote(), 500, 77, TcpFlags::rst_ack(), &[])).await;
        assert!(h.handle.try_next_packet().is_none());
    }

    #[tokio::test]
    async fn test_connect_failure_resets_app_and_keeps_flow() {
        let mut h = harness(closed_port().await);
        feed(&h, syn(app(), remote(), 1)).await;
        let (synack, _) = next_tcp(&mut h).await;
        assert!(synack.flags.syn);

        let (rst, _) = next_tcp(&mut h).await;
        assert!(rst.flags.rst);

        let relay = h.relay.clone();
        assert!(wait_until(Duration::from_secs(2), || relay.session_count() == 0).await);
        let flow = h.flows.get(&h.key).unwrap();
        assert_eq!(flow.state, RelayState::Closed);
        assert_eq!(flow.bytes_up, 0);
    }

    #[tokio::test]
    async fn test_rejected_method_relays_nothing() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let extra = Arc::new(AtomicUsize::new(usize::MAX));
        let seen = extra.clone();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            socket.read_exact(&mut greeting).await.unwrap();
            socket.write_all(&[0x05, 0x01]).await.unwrap();
            let mut rest = Vec::new();
            let _ = socket.read_to_end(&mut rest).await;
            seen.store(rest.len(), Ordering::SeqCst);
        });

        let mut h = harness(port);
        feed(&h, syn(app(), remote(), 10)).await;
        let (synack, _) = next_tcp(&mut h).await;
        feed(&h, app_segment(app(), remote(), 11, synack.seq.wrapping_add(1), TcpFlags::psh_ack(), b"hello")).await;

        let flows = h.flows.clone();
        let key = h.key;
        assert!(wait_until(Duration::from_secs(2), || flows.state(&key) == Some(RelayState::Closed)).await);
        assert!(wait_until(Duration::from_secs(2), || extra.load(Ordering::SeqCst) == 0).await);
        assert_eq!(h.flows.get(&h.key).unwrap().bytes_up, 0);
    }

    #[tokio::test]
    async fn test_out_of_order_gets_duplicate_ack() {
        let port = socks5_server(|_stream, _target| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
        })
        .await;
        let mut h = harness(port);
        feed(&h, syn(app(), remote(), 100)).await;
        let (synack, _) = next_tcp(&mut h).await;
        let ack = synack.seq.wrapping_add(1);

        feed(&h, app_segment(app(), remote(), 111, ack, TcpFlags::psh_ack(), b"later")).await;
        let (dup, _) = next_tcp(&mut h).await;
        assert!(dup.flags.ack && !dup.flags.psh);
        assert_eq!(dup.ack, 101);

        feed(&h, app_segment(app(), remote(), 101, ack, TcpFlags::psh_ack(), b"0123456789")).await;
        let (ok, _) = next_tcp(&mut h).await;
        assert_eq!(ok.ack, 111);
    }

    #[tokio::test]
    async fn test_app_fin_half_closes_upstream() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let upstream = seen.clone();
        let port = socks5_server(move |stream, _target| read_all(stream, upstream.clone())).await;
        let mut h = harness(port);

        feed(&h, syn(app(), remote(), 1000)).await;
        let (synack, _) = next_tcp(&mut h).await;
        let ack = synack.seq.wrapping_add(1);
        let relay = h.relay.clone();
        let key = h.key;
        assert!(wait_until(Duration::from_secs(2), || relay.session_state(&key) == Some(RelayState::Relaying)).await);

        feed(&h, app_segment(app(), remote(), 1001, ack, TcpFlags::psh_ack(), b"hello")).await;
        let (data_ack, _) = next_tcp(&mut h).await;
        assert_eq!(data_ack.ack, 1006);

        feed(&h, app_segment(app(), remote(), 1006, ack, TcpFlags::fin_ack(), &[])).await;
        let (fin_ack, _) = next_tcp(&mut h).await;
        assert!(fin_ack.flags.ack && !fin_ack.flags.fin);
        assert_eq!(fin_ack.ack, 1007);
        assert_eq!(h.flows.state(&h.key), Some(RelayState::Closing));

        // Upstream sees EOF and closes, which comes back as our FIN
        let (fin, _) = next_tcp(&mut h).await;
        assert!(fin.flags.fin);
        assert_eq!(fin.seq, ack);
        assert_eq!(fin.ack, 1007);

        let flows = h.flows.clone();
        assert!(wait_until(Duration::from_secs(2), || flows.get(&key).is_none()).await);
        assert!(wait_until(Duration::from_secs(1), || relay.session_count() == 0).await);
        assert_eq!(seen.lock().as_slice(), b"hello");
    }

    #[tokio::test]
    async fn test_idle_upstream_moves_to_closing() {
        let port = socks5_server(|stream, _target| read_all(stream, Default::default())).await;
        let config = RelayConfig {
            idle_timeout: Duration::from_millis(200),
            drain_timeout: Duration::from_secs(2),
            ..test_config()
        };
        let mut h = harness_with(port, config);

        feed(&h, syn(app(), remote(), 1)).await;
        let _ = next_tcp(&mut h).await;

        let flows = h.flows.clone();
        let key = h.key;
        assert!(wait_until(Duration::from_secs(2), || flows.state(&key) == Some(RelayState::Closing)).await);
        assert!(h.stats.snapshot().timeout_errors >= 1);
        assert!(flows.get(&key).is_some());
    }

    #[tokio::test]
    async fn test_drain_timeout_ends_closing_session() {
        // Upstream closes at once; the app never sends FIN
        let port = socks5_server(|_stream, _target| async move {}).await;
        let config = RelayConfig {
            drain_timeout: Duration::from_millis(300),
            ..test_config()
        };
        let mut h = harness_with(port, config);

        feed(&h, syn(app(), remote(), 1)).await;
        let _ = next_tcp(&mut h).await;
        let (fin, _) = next_tcp(&mut h).await;
        assert!(fin.flags.fin);
        let fin_at = Instant::now();

        let flows = h.flows.clone();
        let key = h.key;
        assert!(wait_until(Duration::from_millis(250), || flows.state(&key) == Some(RelayState::Closing)).await);
        assert!(wait_until(Duration::from_secs(2), || flows.get(&key).is_none()).await);
        assert!(fin_at.elapsed() >= Duration::from_millis(200));
        assert_eq!(h.relay.session_count(), 0);
        // The FIN is sent once
        assert!(h.handle.try_next_packet().is_none());
    }

    #[tokio::test]
    async fn test_device_write_failure_closes_only_that_session() {
        let port = socks5_server(|stream, _target| read_all(stream, Default::default())).await;
        let (inner, handle) = ChannelDevice::pair(256);
        let device = Arc::new(FailingWrites {
            inner,
            port: AtomicU16::new(0),
        });
        let mut h = harness_on(device.clone(), handle, port, test_config());

        let other_app = SocketAddrV4::new(*app().ip(), 40001);
        let other = FlowKey::tcp(SocketAddr::V4(other_app), SocketAddr::V4(remote()));
        feed(&h, syn(app(), remote(), 100)).await;
        feed(&h, syn(other_app, remote(), 500)).await;
        let _ = next_tcp(&mut h).await;
        let _ = next_tcp(&mut h).await;

        let relay = h.relay.clone();
        let key = h.key;
        assert!(
            wait_until(Duration::from_secs(2), || {
                relay.session_state(&key) == Some(RelayState::Relaying)
                    && relay.session_state(&other) == Some(RelayState::Relaying)
            })
            .await
        );

        device.port.store(app().port(), Ordering::SeqCst);
        let failed = try_feed(&h, app_segment(app(), remote(), 101, 0, TcpFlags::psh_ack(), b"lost")).await;
        assert!(matches!(failed, Err(DataPlaneError::Io(_))));
        assert_eq!(h.flows.state(&key), Some(RelayState::Closing));

        feed(&h, app_segment(other_app, remote(), 501, 0, TcpFlags::psh_ack(), b"fine")).await;
        let (ack, _) = next_tcp(&mut h).await;
        assert_eq!(ack.dst_port, 40001);
        assert_eq!(ack.ack, 505);
        assert_eq!(h.flows.state(&other), Some(RelayState::Relaying));
    }

    #[tokio::test]
    async fn test_close_session_marks_flow_closed() {
        let port = socks5_server(|_stream, _target| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
        })
        .await;
        let mut h = harness(port);
        feed(&h, syn(app(), remote(), 1)).await;
        let _ = next_tcp(&mut h).await;

        assert!(h.relay.close_session(&h.key));
        assert_eq!(h.flows.state(&h.key), Some(RelayState::Closed));
        let relay = h.relay.clone();
        assert!(wait_until(Duration::from_secs(2), || relay.session_count() == 0).await);
        assert!(!h.relay.close_session(&h.key));
    }
}
