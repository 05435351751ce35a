//! Engine configuration
//!
//! Values are resolved by the profile layer and passed in at construction;
//! nothing here is read from disk.

use crate::error::ConfigError;
use crate::protect::SocketProtector;
use std::time::Duration;

pub const DEFAULT_MTU: usize = 1500;
pub const MIN_MTU: usize = 576;
pub const MAX_MTU: usize = 9000;
pub const DEFAULT_PROXY_HOST: &str = "127.0.0.1";
pub const DEFAULT_PROXY_PORT: u16 = 7897;
pub const DEFAULT_PROXY_LABEL: &str = "DIRECT";

/// How UDP datagrams leave the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UdpMode {
    /// Record the flow only
    Disabled,
    /// Protected local socket straight to the destination
    #[default]
    Direct,
    /// SOCKS5 UDP ASSOCIATE through the proxy
    Socks5,
}

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Local SOCKS5 proxy host
    pub proxy_host: String,
    /// Local SOCKS5 proxy port
    pub proxy_port: u16,
    /// Read buffer size for the TUN device
    pub mtu: usize,
    /// Flows idle for longer than this are evicted
    pub flow_timeout: Duration,
    /// How often the eviction sweep runs
    pub sweep_interval: Duration,
    /// Speed recomputation cadence
    pub tick_interval: Duration,
    /// Deadline shared by SOCKS5 connect and handshake
    pub connect_timeout: Duration,
    /// Relay read/write idle timeout
    pub idle_timeout: Duration,
    /// Time allowed for a closing session to drain
    pub drain_timeout: Duration,
    /// Grace period for outstanding tasks on stop()
    pub shutdown_grace: Duration,
    /// UDP forwarding mode
    pub udp_mode: UdpMode,
    /// Idle timeout for UDP associations
    pub udp_timeout: Duration,
    /// Queued app->proxy chunks per TCP session
    pub uplink_queue: usize,
    /// Capacity of the observer event channel
    pub event_capacity: usize,
    /// Label recorded on new flows
    pub proxy_label: String,
    /// Applied to sockets opened towards the network
    pub protector: Option<SocketProtector>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            proxy_host: DEFAULT_PROXY_HOST.to_string(),
            proxy_port: DEFAULT_PROXY_PORT,
            mtu: DEFAULT_MTU,
            flow_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
            tick_interval: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(2),
            shutdown_grace: Duration::from_secs(1),
            udp_mode: UdpMode::default(),
            udp_timeout: Duration::from_secs(60),
            uplink_queue: 512,
            event_capacity: 1024,
            proxy_label: DEFAULT_PROXY_LABEL.to_string(),
            protector: None,
        }
    }
}

impl EngineConfig {
    /// Check ranges before the engine starts
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_MTU..=MAX_MTU).contains(&self.mtu) {
            return Err(ConfigError::MtuOutOfRange(self.mtu));
        }
        if self.proxy_host.trim().is_empty() {
            return Err(ConfigError::EmptyProxyHost);
        }
        if self.proxy_port == 0 {
            return Err(ConfigError::ZeroProxyPort);
        }

        let durations = [
            ("flow_timeout", self.flow_timeout),
            ("sweep_interval", self.sweep_interval),
            ("tick_interval", self.tick_interval),
            ("connect_timeout", self.connect_timeout),
            ("idle_timeout", self.idle_timeout),
            ("drain_timeout", self.drain_timeout),
            ("shutdown_grace", self.shutdown_grace),
            ("udp_timeout", self.udp_timeout),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration(name));
            }
        }

        if self.uplink_queue == 0 {
            return Err(ConfigError::ZeroCapacity("uplink_queue"));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::ZeroCapacity("event_capacity"));
        }
        Ok(())
    }

    /// Start from the defaults
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// `host:port` of the SOCKS5 endpoint
    pub fn proxy_addr(&self) -> String {
        format!("{}:{}", self.proxy_host, self.proxy_port)
    }
}

/// Builder for fluent configuration
pub struct EngineBuilder {
    config: EngineConfig,
}

impl EngineBuilder {
    /// Builder over `EngineConfig::default()`
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
        }
    }

    /// Local SOCKS5 endpoint
    pub fn proxy(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config.proxy_host = host.into();
        self.config.proxy_port = port;
        self
    }

    /// Read buffer size, `MIN_MTU..=MAX_MTU`
    pub fn mtu(mut self, mtu: usize) -> Self {
        self.config.mtu = mtu;
        self
    }

    /// Idle time after which the sweep drops a flow
    pub fn flow_timeout(mut self, timeout: Duration) -> Self {
        self.config.flow_timeout = timeout;
        self
    }

    /// How often the sweep runs
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.config.sweep_interval = interval;
        self
    }

    /// Speed tick period
    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.config.tick_interval = interval;
        self
    }

    /// Deadline for the whole SOCKS5 handshake
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Relay idle limit
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    /// How long a closing session may flush
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.config.drain_timeout = timeout;
        self
    }

    /// How long `stop()` waits for tasks
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.config.shutdown_grace = grace;
        self
    }

    /// Set UDP mode
    pub fn udp_mode(mut self, mode: UdpMode) -> Self {
        self.config.udp_mode = mode;
        self
    }

    /// Idle limit for UDP associations
    pub fn udp_timeout(mut self, timeout: Duration) -> Self {
        self.config.udp_timeout = timeout;
        self
    }

    /// Segments buffered per session towards upstream
    pub fn uplink_queue(mut self, depth: usize) -> Self {
        self.config.uplink_queue = depth;
        self
    }

    /// Broadcast buffer for flow events
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    /// Label shown on new flows
    pub fn proxy_label(mut self, label: impl Into<String>) -> Self {
        self.config.proxy_label = label.into();
        self
    }

    /// Callback applied to every outbound socket
    pub fn protector(mut self, protector: SocketProtector) -> Self {
        self.config.protector = Some(protector);
        self
    }

    /// Validate and return the configuration
    pub fn build(self) -> Result<EngineConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
