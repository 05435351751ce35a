//! Best-effort UDP relay
//!
//! Every UDP flow gets an association: either a local socket connected to
//! the destination or a SOCKS5 UDP ASSOCIATE. Datagrams are queued to the
//! association task, which opens the upstream lazily and writes replies back
//! to the device. Nothing is retried.

use crate::config::{EngineConfig, UdpMode};
use crate::device::PacketDevice;
use crate::error::{ConnectError, Result};
use crate::flow::{FlowDefaults, FlowKey, RelayState};
use crate::flow_table::FlowTable;
use crate::packet::build_ipv4_udp;
use crate::protect::{protect_socket, SocketProtector};
use crate::socks5::{Socks5Client, TargetAddr, UdpAssociation};
use crate::stats::EngineStats;
use bytes::Bytes;
use dashmap::DashMap;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

const DATAGRAM_QUEUE: usize = 64;
const RECV_BUF: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct UdpConfig {
    pub mode: UdpMode,
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
    pub defaults: FlowDefaults,
}

impl From<&EngineConfig> for UdpConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            mode: config.udp_mode,
            idle_timeout: config.udp_timeout,
            connect_timeout: config.connect_timeout,
            defaults: FlowDefaults::new(config.proxy_label.clone()).with_state(RelayState::Relaying),
        }
    }
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

enum Upstream {
    Direct(UdpSocket),
    Socks5(UdpAssociation),
}

impl Upstream {
    async fn send(&self, target: SocketAddr, payload: &[u8]) -> std::result::Result<usize, ConnectError> {
        match self {
            Upstream::Direct(socket) => socket.send(payload).await.map_err(ConnectError::Io),
            Upstream::Socks5(assoc) => assoc.send_to(&TargetAddr::Ip(target), payload).await,
        }
    }

    /// Next reply and the address it claims to come from
    async fn recv(&self, buf: &mut [u8], target: SocketAddr) -> io::Result<(SocketAddr, usize)> {
        match self {
            Upstream::Direct(socket) => socket.recv(buf).await.map(|n| (target, n)),
            Upstream::Socks5(assoc) => {
                let (from, n) = assoc.recv_from(buf).await?;
                let from = match from {
                    TargetAddr::Ip(addr) => addr,
                    TargetAddr::Domain(..) => target,
                };
                Ok((from, n))
            }
        }
    }
}

struct Association {
    queue: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
    last_active: AtomicU64,
}

impl Association {
    fn touch(&self, nanos: u64) {
        self.last_active.fetch_max(nanos, Ordering::Relaxed);
    }
}

/// Per-flow UDP associations
pub struct UdpRelay {
    associations: DashMap<FlowKey, Arc<Association>>,
    flows: Arc<FlowTable>,
    device: Arc<dyn PacketDevice>,
    client: Socks5Client,
    protector: Option<SocketProtector>,
    stats: Arc<EngineStats>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    epoch: Instant,
    config: UdpConfig,
}

impl UdpRelay {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        flows: Arc<FlowTable>,
        device: Arc<dyn PacketDevice>,
        client: Socks5Client,
        protector: Option<SocketProtector>,
        stats: Arc<EngineStats>,
        tracker: TaskTracker,
        cancel: CancellationToken,
        config: UdpConfig,
    ) -> Self {
        Self {
            associations: DashMap::new(),
            flows,
            device,
            client,
            protector,
            stats,
            tracker,
            cancel,
            epoch: Instant::now(),
            config,
        }
    }

    fn nanos_at(&self, at: Instant) -> u64 {
        at.saturating_duration_since(self.epoch).as_nanos() as u64
    }

    pub fn association_count(&self) -> usize {
        self.associations.len()
    }

    /// Record the datagram and hand it to the flow's association
    pub fn handle_datagram(self: &Arc<Self>, key: FlowKey, payload: &[u8]) -> Result<()> {
        // A failed association stays closed until the flow record is swept
        if self.flows.state(&key) == Some(RelayState::Closed) {
            self.stats.record_dropped();
            return Ok(());
        }

        let (flow, created) = self.flows.record_or_get(&key, &self.config.defaults);
        if created {
            debug!("UDP flow #{} {}", flow.id, key);
        }
        self.flows.apply_traffic(&key, payload.len() as u64, 0);

        if self.config.mode == UdpMode::Disabled {
            return Ok(());
        }

        let assoc = self
            .associations
            .entry(key)
            .or_insert_with(|| self.spawn_association(key))
            .clone();
        assoc.touch(self.nanos_at(Instant::now()));

        match assoc.queue.try_send(Bytes::copy_from_slice(payload)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.stats.record_dropped();
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.stats.record_dropped();
                self.associations
                    .remove_if(&key, |_, a| Arc::ptr_eq(a, &assoc));
            }
        }
        Ok(())
    }

    fn spawn_association(self: &Arc<Self>, key: FlowKey) -> Arc<Association> {
        let (tx, rx) = mpsc::channel(DATAGRAM_QUEUE);
        let assoc = Arc::new(Association {
            queue: tx,
            cancel: self.cancel.child_token(),
            last_active: AtomicU64::new(self.nanos_at(Instant::now())),
        });
        let relay = Arc::clone(self);
        let task_assoc = Arc::clone(&assoc);
        self.tracker.spawn(async move {
            relay.run_association(key, task_assoc, rx).await;
        });
        assoc
    }

    async fn open(&self, key: &FlowKey) -> std::result::Result<Upstream, ConnectError> {
        match self.config.mode {
            UdpMode::Socks5 => {
                let assoc = self.client.udp_associate(self.config.connect_timeout).await?;
                Ok(Upstream::Socks5(assoc))
            }
            _ => {
                let bind_addr: SocketAddr = match key.dst {
                    SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
                    SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
                };
                let std_socket = std::net::UdpSocket::bind(bind_addr).map_err(ConnectError::Io)?;
                if !protect_socket(self.protector.as_ref(), &std_socket) {
                    warn!("UDP socket for {} left unprotected", key);
                }
                std_socket.set_nonblocking(true).map_err(ConnectError::Io)?;
                let socket = UdpSocket::from_std(std_socket).map_err(ConnectError::Io)?;
                socket.connect(key.dst).await.map_err(ConnectError::Io)?;
                Ok(Upstream::Direct(socket))
            }
        }
    }

    async fn run_association(
        self: Arc<Self>,
        key: FlowKey,
        assoc: Arc<Association>,
        mut rx: mpsc::Receiver<Bytes>,
    ) {
        let opened = tokio::select! {
            _ = assoc.cancel.cancelled() => Err(ConnectError::Cancelled),
            r = self.open(&key) => r,
        };

        let upstream = match opened {
            Ok(upstream) => upstream,
            Err(ConnectError::Cancelled) => {
                self.forget(&key, &assoc);
                return;
            }
            Err(e) => {
                if matches!(e, ConnectError::Timeout) {
                    self.stats.record_timeout();
                }
                self.stats.record_proxy_error();
                warn!("UDP association for {} failed: {}", key, e);
                self.flows.mark_closed(&key);
                self.forget(&key, &assoc);
                return;
            }
        };
        debug!("UDP association open for {}", key);

        let mut buf = vec![0u8; RECV_BUF];
        loop {
            tokio::select! {
                _ = assoc.cancel.cancelled() => break,
                datagram = rx.recv() => {
                    let Some(datagram) = datagram else { break };
                    if let Err(e) = upstream.send(key.dst, &datagram).await {
                        debug!("UDP send for {} failed: {}", key, e);
                        self.stats.record_dropped();
                    }
                }
                received = upstream.recv(&mut buf, key.dst) => match received {
                    Ok((from, n)) => {
                        assoc.touch(self.nanos_at(Instant::now()));
                        self.flows.apply_traffic(&key, 0, n as u64);
                        if let Err(e) = self.write_reply(&key, from, &buf[..n]).await {
                            warn!("Device write failed for {}: {}", key, e);
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("UDP receive for {} failed: {}", key, e);
                        self.stats.record_read_error();
                        break;
                    }
                },
            }
        }
        self.forget(&key, &assoc);
    }

    async fn write_reply(&self, key: &FlowKey, from: SocketAddr, payload: &[u8]) -> io::Result<()> {
        let (SocketAddr::V4(app), SocketAddr::V4(remote)) = (key.src, from) else {
            self.stats.record_dropped();
            return Ok(());
        };
        let packet = build_ipv4_udp(remote, app, payload);
        self.device.send(&packet).await?;
        self.stats.record_sent();
        Ok(())
    }

    fn forget(&self, key: &FlowKey, assoc: &Arc<Association>) {
        self.associations.remove_if(key, |_, a| Arc::ptr_eq(a, assoc));
    }

    /// Drop associations idle for longer than the UDP timeout and remove
    /// their flows
    pub fn expire_idle(&self, now: Instant) -> usize {
        let now = self.nanos_at(now);
        let limit = self.config.idle_timeout.as_nanos() as u64;
        let idle = |a: &Arc<Association>| now.saturating_sub(a.last_active.load(Ordering::Relaxed)) > limit;

        let candidates: Vec<FlowKey> = self
            .associations
            .iter()
            .filter(|e| idle(e.value()))
            .map(|e| *e.key())
            .collect();

        let mut expired = 0;
        for key in candidates {
            if let Some((_, assoc)) = self.associations.remove_if(&key, |_, a| idle(a)) {
                assoc.cancel.cancel();
                self.flows.close(&key);
                expired += 1;
            }
        }
        if expired > 0 {
            debug!("Expired {} UDP associations", expired);
        }
        expired
    }

    /// Stop the association of one flow. The flow record is left alone.
    pub fn close(&self, key: &FlowKey) -> bool {
        match self.associations.remove(key) {
            Some((_, assoc)) => {
                assoc.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn close_all(&self) -> usize {
        let keys: Vec<FlowKey> = self.associations.iter().map(|e| *e.key()).collect();
        let mut closed = 0;
        for key in keys {
            if let Some((_, assoc)) = self.associations.remove(&key) {
                assoc.cancel.cancel();
                self.flows.mark_closed(&key);
                closed += 1;
            }
        }
        closed
    }
}
