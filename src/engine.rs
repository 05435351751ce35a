//! TUN packet engine
//!
//! Owns the read loop over a [`PacketDevice`], dispatches decoded packets to
//! the TCP and UDP relays, and runs the maintenance tasks (flow sweep, speed
//! tick, UDP expiry). Every task is tracked so `stop()` can bound shutdown.

use crate::config::EngineConfig;
use crate::device::PacketDevice;
use crate::error::{DataPlaneError, Result};
use crate::flow::{Flow, FlowEvent, FlowKey, FlowProtocol};
use crate::flow_table::FlowTable;
use crate::packet::{decode, Transport};
use crate::relay::{RelayConfig, RelayPipeline};
use crate::socks5::Socks5Client;
use crate::stats::{EngineStats, StatsSnapshot};
use crate::traffic::{Direction, TrafficAccumulator, TrafficSnapshot};
use crate::udp::{UdpConfig, UdpRelay};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

const MIN_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Read-error delay, doubling up to `MAX_BACKOFF`
struct Backoff {
    current: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self { current: MIN_BACKOFF }
    }
}

impl Backoff {
    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(MAX_BACKOFF);
        delay
    }

    fn reset(&mut self) {
        self.current = MIN_BACKOFF;
    }
}

struct EngineInner {
    config: EngineConfig,
    device: Arc<dyn PacketDevice>,
    flows: Arc<FlowTable>,
    traffic: Arc<TrafficAccumulator>,
    stats: Arc<EngineStats>,
    relay: Arc<RelayPipeline>,
    udp: Arc<UdpRelay>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    device_closed: AtomicBool,
}

impl EngineInner {
    async fn process_packet(&self, data: &[u8]) {
        self.stats.record_received();

        let packet = match decode(data) {
            Ok(packet) => packet,
            Err(e) => {
                self.stats.record_invalid();
                debug!("Dropping undecodable packet ({} bytes): {}", data.len(), e);
                return;
            }
        };

        // IPv6 is accounted for but not relayed
        if packet.version == 6 {
            self.count_protocol(&packet.transport);
            self.traffic.record(Direction::Upload, data.len() as u64);
            return;
        }

        let (Some(src), Some(dst)) = (packet.src_socket(), packet.dst_socket()) else {
            self.count_protocol(&packet.transport);
            self.traffic.record(Direction::Upload, data.len() as u64);
            return;
        };
        let payload = packet.payload(data);

        match &packet.transport {
            Transport::Tcp(tcp) => {
                self.stats.record_tcp();
                let key = FlowKey::new(FlowProtocol::Tcp, src, dst);
                if let Err(e) = self.relay.handle_tcp(key, tcp, payload).await {
                    debug!("TCP segment for {} not handled: {} ({})", key, e, e.code());
                }
            }
            Transport::Udp(_) => {
                self.stats.record_udp();
                let key = FlowKey::new(FlowProtocol::Udp, src, dst);
                if let Err(e) = self.udp.handle_datagram(key, payload) {
                    debug!("UDP datagram for {} not handled: {}", key, e);
                }
            }
            other => {
                self.count_protocol(other);
                self.traffic.record(Direction::Upload, data.len() as u64);
            }
        }
    }

    fn count_protocol(&self, transport: &Transport) {
        match transport {
            Transport::Tcp(_) => self.stats.record_tcp(),
            Transport::Udp(_) => self.stats.record_udp(),
            Transport::Icmp(_) => self.stats.record_icmp(),
            Transport::Unsupported(_) => self.stats.record_other(),
        }
    }

    /// Close relays and the device; shared by `stop()` and device EOF
    async fn finish(&self) {
        let tcp = self.relay.close_all();
        let udp = self.udp.close_all();
        if tcp + udp > 0 {
            debug!("Closed {} TCP sessions and {} UDP associations", tcp, udp);
        }
        self.close_device().await;
    }

    async fn close_device(&self) {
        if self.device_closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.device.close().await {
            warn!("Failed to close TUN device: {}", e);
        }
    }
}

/// Closes the device if the read loop panics before reaching `finish`
struct DeviceGuard {
    inner: Arc<EngineInner>,
}

impl Drop for DeviceGuard {
    fn drop(&mut self) {
        if !std::thread::panicking() || self.inner.device_closed.load(Ordering::SeqCst) {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let inner = Arc::clone(&self.inner);
            handle.spawn(async move { inner.close_device().await });
        }
    }
}

/// Transparent-proxy data plane over one TUN device
pub struct TunPacketEngine {
    inner: Arc<EngineInner>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl TunPacketEngine {
    /// Build the engine; an invalid config is refused here
    pub fn new(config: EngineConfig, device: Arc<dyn PacketDevice>) -> Result<Self> {
        config.validate()?;

        let traffic = Arc::new(TrafficAccumulator::new());
        let flows = Arc::new(FlowTable::new(traffic.clone(), config.event_capacity));
        let stats = Arc::new(EngineStats::new());
        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();
        let client = Socks5Client::new(config.proxy_host.clone(), config.proxy_port)
            .with_protector(config.protector.clone());

        let relay = Arc::new(RelayPipeline::new(
            flows.clone(),
            device.clone(),
            client.clone(),
            stats.clone(),
            tracker.clone(),
            cancel.clone(),
            RelayConfig::from(&config),
        ));
        let udp = Arc::new(UdpRelay::new(
            flows.clone(),
            device.clone(),
            client,
            config.protector.clone(),
            stats.clone(),
            tracker.clone(),
            cancel.clone(),
            UdpConfig::from(&config),
        ));

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                device,
                flows,
                traffic,
                stats,
                relay,
                udp,
                tracker,
                cancel,
                device_closed: AtomicBool::new(false),
            }),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    /// Spawn the read loop and maintenance tasks. Calling it again while
    /// running is a no-op; a stopped engine cannot be restarted.
    pub fn start(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) || self.inner.cancel.is_cancelled() {
            return Err(DataPlaneError::DeviceClosed);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let inner = &self.inner;
        info!(
            "Packet engine starting: proxy {} mtu {} udp {:?}",
            inner.config.proxy_addr(),
            inner.config.mtu,
            inner.config.udp_mode
        );

        inner.tracker.spawn(read_loop(Arc::clone(inner)));
        inner.tracker.spawn(sweep_loop(Arc::clone(inner)));
        inner.tracker.spawn(tick_loop(Arc::clone(inner)));
        Ok(())
    }

    /// Cancel everything, wait at most the grace period for tasks, then mark
    /// what is left closed and release the device. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = &self.inner;
        info!("Packet engine stopping");

        inner.cancel.cancel();
        inner.tracker.close();
        if tokio::time::timeout(inner.config.shutdown_grace, inner.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                "{} tasks still running after {:?}",
                inner.tracker.len(),
                inner.config.shutdown_grace
            );
        }
        inner.finish().await;
        info!("Packet engine stopped");
    }

    /// Started and not yet stopped
    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.inner.cancel.is_cancelled()
    }

    /// Snapshot of every tracked flow
    pub fn all_flows(&self) -> Vec<Flow> {
        self.inner.flows.snapshot_all()
    }

    /// Get flow count
    pub fn flow_count(&self) -> usize {
        self.inner.flows.len()
    }

    /// Global totals and speeds
    pub fn traffic_snapshot(&self) -> TrafficSnapshot {
        self.inner.traffic.snapshot()
    }

    /// Tear down the relay of one flow and remove it
    pub fn close_flow(&self, key: &FlowKey) -> Option<Flow> {
        match key.protocol {
            FlowProtocol::Tcp => {
                self.inner.relay.close_session(key);
            }
            FlowProtocol::Udp => {
                self.inner.udp.close(key);
            }
        }
        self.inner.flows.close(key)
    }

    /// Close every relay and remove every flow
    pub fn close_all_flows(&self) -> usize {
        self.inner.relay.close_all();
        self.inner.udp.close_all();
        self.inner.flows.close_all()
    }

    /// Flow added/closed events and speed ticks
    pub fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
        self.inner.flows.subscribe()
    }

    /// Get packet statistics
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn flow_table(&self) -> &Arc<FlowTable> {
        &self.inner.flows
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }
}

async fn read_loop(inner: Arc<EngineInner>) {
    let _guard = DeviceGuard {
        inner: Arc::clone(&inner),
    };
    let mut buf = vec![0u8; inner.config.mtu];
    let mut backoff = Backoff::default();

    loop {
        let read = tokio::select! {
            _ = inner.cancel.cancelled() => return,
            read = inner.device.recv(&mut buf) => read,
        };

        match read {
            Ok(0) => {
                info!("TUN device reached end of stream");
                break;
            }
            Ok(n) => {
                backoff.reset();
                // A write back to a full device must not hold up shutdown
                tokio::select! {
                    _ = inner.cancel.cancelled() => return,
                    _ = inner.process_packet(&buf[..n]) => {}
                }
            }
            Err(e) => {
                inner.stats.record_read_error();
                let delay = backoff.next_delay();
                error!("TUN read failed: {} (retrying in {:?})", e, delay);
                tokio::select! {
                    _ = inner.cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    // End of stream takes the same path as stop(), minus waiting on ourselves
    inner.cancel.cancel();
    inner.finish().await;
}

async fn sweep_loop(inner: Arc<EngineInner>) {
    let mut ticker = tokio::time::interval(inner.config.sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = ticker.tick() => {
                let now = Instant::now();
                let swept = inner.flows.sweep_expired(now, inner.config.flow_timeout);
                let expired = inner.udp.expire_idle(now);
                if swept + expired > 0 {
                    debug!("Maintenance: {} flows swept, {} UDP associations expired", swept, expired);
                }
            }
        }
    }
}

async fn tick_loop(inner: Arc<EngineInner>) {
    let mut ticker = tokio::time::interval(inner.config.tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = ticker.tick() => {
                let now = Instant::now();
                inner.flows.update_speeds(now);
                let snapshot = inner
                    .traffic
                    .tick_at(now)
                    .unwrap_or_else(|| inner.traffic.snapshot());
                inner.flows.emit(FlowEvent::Tick(snapshot));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{ChannelDevice, DeviceHandle};
    use crate::flow::RelayState;
    use crate::packet::{build_ipv4_udp, decode, TcpFlags, TcpHeader};
    use crate::testutil::*;
    use async_trait::async_trait;
    use std::io;
    use std::net::{SocketAddr, SocketAddrV4};
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UdpSocket;

    fn test_config(proxy_port: u16) -> crate::config::EngineBuilder {
        EngineConfig::builder()
            .proxy(crate::config::DEFAULT_PROXY_HOST, proxy_port)
            .connect_timeout(Duration::from_secs(2))
            .tick_interval(Duration::from_millis(100))
    }

    fn engine(proxy_port: u16) -> (TunPacketEngine, DeviceHandle) {
        let (device, handle) = ChannelDevice::pair(1024);
        let engine = TunPacketEngine::new(test_config(proxy_port).build().unwrap(), Arc::new(device)).unwrap();
        (engine, handle)
    }

    fn icmp_echo() -> Vec<u8> {
        let mut icmp = vec![0u8; 28];
        icmp[0] = 0x45;
        icmp[2..4].copy_from_slice(&28u16.to_be_bytes());
        icmp[8] = 64;
        icmp[9] = 1;
        icmp[12..16].copy_from_slice(&[10, 0, 0, 2]);
        icmp[16..20].copy_from_slice(&[8, 8, 8, 8]);
        icmp[20] = 8;
        icmp
    }

    /// Channel device whose first reads fail
    struct FlakyReads {
        inner: ChannelDevice,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl PacketDevice for FlakyReads {
        async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(io::Error::new(io::ErrorKind::Other, "read failed"));
            }
            self.inner.recv(buf).await
        }

        async fn send(&self, packet: &[u8]) -> io::Result<()> {
            self.inner.send(packet).await
        }

        async fn close(&self) -> io::Result<()> {
            self.inner.close().await
        }
    }

    async fn next_tcp(handle: &mut DeviceHandle) -> (TcpHeader, Vec<u8>) {
        let packet = tokio::time::timeout(Duration::from_secs(5), handle.next_packet())
            .await
            .unwrap()
            .unwrap();
        parse_tcp(&packet)
    }

    async fn hold_open(mut stream: tokio::net::TcpStream, _target: crate::socks5::TargetAddr) {
        let mut buf = [0u8; 1024];
        while let Ok(n) = stream.read(&mut buf).await {
            if n == 0 {
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_relay_scenario() {
        let port = socks5_server(|mut stream, target| async move {
            assert_eq!(target.to_string(), "93.184.216.34:443");
            let mut request = vec![0u8; 1024];
            stream.read_exact(&mut request).await.unwrap();
            stream.write_all(&[0xAB; 2048]).await.unwrap();
            hold_open(stream, target).await;
        })
        .await;

        let (engine, mut handle) = engine(port);
        engine.start().unwrap();
        engine.start().unwrap();
        let mut events = engine.subscribe();

        handle.inject(syn(app(), remote(), 5000)).await.unwrap();
        let (synack, _) = next_tcp(&mut handle).await;
        assert!(synack.flags.syn && synack.flags.ack);
        let our_seq = synack.seq.wrapping_add(1);

        handle
            .inject(app_segment(app(), remote(), 5001, our_seq, TcpFlags::ack_only(), &[]))
            .await
            .unwrap();
        handle
            .inject(app_segment(app(), remote(), 5001, our_seq, TcpFlags::psh_ack(), &[0x11; 1024]))
            .await
            .unwrap();

        let mut received = Vec::new();
        while received.len() < 2048 {
            let (tcp, payload) = next_tcp(&mut handle).await;
            assert!(!tcp.flags.rst);
            if payload.is_empty() {
                continue;
            }
            assert!(payload.len() <= 1360);
            assert_eq!(tcp.seq, our_seq.wrapping_add(received.len() as u32));
            assert_eq!(tcp.ack, 5001 + 1024);
            received.extend_from_slice(&payload);
        }
        assert!(received.iter().all(|&b| b == 0xAB));

        let key = FlowKey::tcp(SocketAddr::V4(app()), SocketAddr::V4(remote()));
        let flow = engine.all_flows().into_iter().find(|f| f.key == key).unwrap();
        assert_eq!(flow.bytes_up, 1024);
        assert_eq!(flow.bytes_down, 2048);
        assert_eq!(flow.state, RelayState::Relaying);
        assert_eq!(flow.kind, crate::flow::AppKind::from_port(443));

        let totals = engine.traffic_snapshot();
        assert_eq!(totals.total_upload, 1024);
        assert_eq!(totals.total_download, 2048);

        let mut added = None;
        while let Ok(event) = events.try_recv() {
            if let FlowEvent::Added(flow) = event {
                added = Some(flow);
                break;
            }
        }
        assert_eq!(added.unwrap().key, key);

        let closed = engine.close_flow(&key).unwrap();
        assert_eq!(closed.bytes_up, 1024);
        assert_eq!(engine.flow_count(), 0);
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_stop_closes_relaying_flows() {
        let port = socks5_server(hold_open).await;
        let (engine, mut handle) = engine(port);
        engine.start().unwrap();

        for i in 0..10u16 {
            let src = SocketAddrV4::new(*app().ip(), 41000 + i);
            handle.inject(syn(src, remote(), 100)).await.unwrap();
        }
        for _ in 0..10 {
            let (synack, _) = next_tcp(&mut handle).await;
            assert!(synack.flags.syn);
        }

        let flows = engine.flow_table().clone();
        assert!(
            wait_until(Duration::from_secs(5), || {
                let all = flows.snapshot_all();
                all.len() == 10 && all.iter().all(|f| f.state == RelayState::Relaying)
            })
            .await
        );

        let started = Instant::now();
        engine.stop().await;
        assert!(started.elapsed() <= Duration::from_secs(1) + Duration::from_millis(250));

        let all = engine.all_flows();
        assert_eq!(all.len(), 10);
        assert!(all.iter().all(|f| f.state == RelayState::Closed));
        assert_eq!(handle.close_count(), 1);
        assert!(!engine.is_running());

        engine.stop().await;
        assert_eq!(handle.close_count(), 1);
        assert!(engine.start().is_err());
    }

    #[tokio::test]
    async fn test_undecodable_and_icmp_packets_are_counted() {
        let (engine, handle) = engine(closed_port().await);
        engine.start().unwrap();

        handle.inject(vec![0x45, 0x00, 0x00]).await.unwrap();
        handle.inject(vec![0x20; 40]).await.unwrap();
        handle.inject(icmp_echo()).await.unwrap();

        assert!(wait_until(Duration::from_secs(2), || engine.traffic_snapshot().total_upload == 28).await);
        let stats = engine.stats();
        assert_eq!(stats.packets_received, 3);
        assert_eq!(stats.packets_invalid, 2);
        assert_eq!(stats.parse_errors, 2);
        assert_eq!(stats.icmp_packets, 1);
        assert_eq!(engine.flow_count(), 0);
        engine.stop().await;
    }

    #[test]
    fn test_backoff_doubles_and_resets() {
        let mut backoff = Backoff::default();
        let delays: Vec<u64> = (0..9).map(|_| backoff.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![10, 20, 40, 80, 160, 320, 640, 1000, 1000]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), MIN_BACKOFF);
    }

    #[tokio::test]
    async fn test_read_errors_back_off_then_recover() {
        let (inner, handle) = ChannelDevice::pair(16);
        let device = Arc::new(FlakyReads {
            inner,
            failures: AtomicUsize::new(3),
        });
        let engine = TunPacketEngine::new(test_config(closed_port().await).build().unwrap(), device).unwrap();
        handle.inject(icmp_echo()).await.unwrap();

        let started = Instant::now();
        engine.start().unwrap();
        assert!(wait_until(Duration::from_secs(2), || engine.traffic_snapshot().total_upload == 28).await);

        // 10 + 20 + 40 ms of backoff before the packet is read
        assert!(started.elapsed() >= Duration::from_millis(70));
        let stats = engine.stats();
        assert_eq!(stats.read_errors, 3);
        assert_eq!(stats.packets_received, 1);
        assert!(engine.is_running());
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_stop_with_a_full_device_leaves_no_tasks() {
        // Nobody drains the device, so the second SYN-ACK blocks the read loop
        let (device, handle) = ChannelDevice::pair(1);
        let config = test_config(closed_port().await)
            .shutdown_grace(Duration::from_millis(300))
            .build()
            .unwrap();
        let engine = TunPacketEngine::new(config, Arc::new(device)).unwrap();
        engine.start().unwrap();

        for i in 0..3u16 {
            let src = SocketAddrV4::new(*app().ip(), 42000 + i);
            handle.inject(syn(src, remote(), 1)).await.unwrap();
        }
        let inner = engine.inner.clone();
        assert!(wait_until(Duration::from_secs(2), || inner.stats.snapshot().packets_received >= 2).await);

        let started = Instant::now();
        engine.stop().await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(wait_until(Duration::from_secs(2), || inner.tracker.is_empty()).await);
        assert_eq!(handle.close_count(), 1);
    }

    #[tokio::test]
    async fn test_close_flow_stops_udp_association() {
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = match echo.local_addr().unwrap() {
            SocketAddr::V4(addr) => addr,
            other => panic!("expected IPv4, got {}", other),
        };
        tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            while let Ok((n, from)) = echo.recv_from(&mut buf).await {
                let _ = echo.send_to(&buf[..n], from).await;
            }
        });

        let (engine, mut handle) = engine(closed_port().await);
        engine.start().unwrap();
        handle.inject(build_ipv4_udp(app(), echo_addr, b"ping")).await.unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(5), handle.next_packet())
            .await
            .unwrap()
            .unwrap();
        let decoded = decode(&reply).unwrap();
        assert_eq!(decoded.payload(&reply), b"ping");
        assert_eq!(engine.inner.udp.association_count(), 1);

        let key = FlowKey::udp(SocketAddr::V4(app()), SocketAddr::V4(echo_addr));
        let closed = engine.close_flow(&key).unwrap();
        assert_eq!(closed.bytes_up, 4);
        assert_eq!(engine.inner.udp.association_count(), 0);
        assert_eq!(engine.flow_count(), 0);
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_device_eof_shuts_down() {
        let (engine, handle) = engine(closed_port().await);
        engine.start().unwrap();
        // Dropping the handle ends the inbound stream
        drop(handle);

        let inner = engine.inner.clone();
        assert!(wait_until(Duration::from_secs(2), || inner.device_closed.load(Ordering::SeqCst)).await);
        assert!(!engine.is_running());
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_speed_ticks_are_published() {
        let (engine, _handle) = engine(closed_port().await);
        let mut events = engine.subscribe();
        engine.start().unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, FlowEvent::Tick(_)));
        engine.stop().await;
    }

    #[test]
    fn test_invalid_config_is_refused() {
        let (device, _handle) = ChannelDevice::pair(1);
        let mut config = EngineConfig::default();
        config.mtu = 100;
        assert!(matches!(
            TunPacketEngine::new(config, Arc::new(device)),
            Err(DataPlaneError::Config(_))
        ));
    }
}
