//! Flow identity, lifecycle state and the snapshot handed to observers

use crate::traffic::TrafficSnapshot;
use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};

/// Transport of a tracked flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowProtocol {
    Tcp,
    Udp,
}

impl fmt::Display for FlowProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowProtocol::Tcp => f.write_str("tcp"),
            FlowProtocol::Udp => f.write_str("udp"),
        }
    }
}

/// Identity of a flow. The direction is kept as seen on the device, so a
/// reversed tuple is a different flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct FlowKey {
    pub protocol: FlowProtocol,
    pub src: SocketAddr,
    pub dst: SocketAddr,
}

impl FlowKey {
    pub fn new(protocol: FlowProtocol, src: SocketAddr, dst: SocketAddr) -> Self {
        Self { protocol, src, dst }
    }

    /// TCP key, app side first
    pub fn tcp(src: SocketAddr, dst: SocketAddr) -> Self {
        Self::new(FlowProtocol::Tcp, src, dst)
    }

    /// UDP key, app side first
    pub fn udp(src: SocketAddr, dst: SocketAddr) -> Self {
        Self::new(FlowProtocol::Udp, src, dst)
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {}", self.protocol, self.src, self.dst)
    }
}

/// Relay lifecycle of a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum RelayState {
    Pending = 0,
    Handshaking = 1,
    Relaying = 2,
    Closing = 3,
    Closed = 4,
}

impl RelayState {
    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            0 => RelayState::Pending,
            1 => RelayState::Handshaking,
            2 => RelayState::Relaying,
            3 => RelayState::Closing,
            _ => RelayState::Closed,
        }
    }

    /// Whether `self -> next` is a legal step. Any live state may close.
    pub fn can_transition(self, next: RelayState) -> bool {
        use RelayState::*;
        matches!(
            (self, next),
            (Pending, Handshaking)
                | (Handshaking, Relaying)
                | (Relaying, Closing)
                | (Pending | Handshaking | Relaying | Closing, Closed)
        )
    }

    pub fn is_closed(self) -> bool {
        self == RelayState::Closed
    }
}

/// Atomic [`RelayState`] that only takes legal steps
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new(state: RelayState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn load(&self) -> RelayState {
        RelayState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move to `next` if legal. Ok carries the previous state, Err the
    /// state that blocked the step.
    pub(crate) fn transition(&self, next: RelayState) -> Result<RelayState, RelayState> {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let from = RelayState::from_u8(current);
            if !from.can_transition(next) {
                return Err(from);
            }
            match self
                .0
                .compare_exchange_weak(current, next as u8, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(from),
                Err(actual) => current = actual,
            }
        }
    }
}

/// Application type guessed from the destination port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AppKind {
    Http,
    Https,
    #[serde(rename = "DNS-over-TLS")]
    DnsOverTls,
    Ssh,
    Ftp,
    Smtp,
    Pop3,
    Imap,
    Rdp,
    Vnc,
    Unknown,
}

impl AppKind {
    /// Guess the application from a destination port
    pub fn from_port(port: u16) -> Self {
        match port {
            80 => AppKind::Http,
            443 => AppKind::Https,
            853 => AppKind::DnsOverTls,
            22 => AppKind::Ssh,
            21 => AppKind::Ftp,
            25 => AppKind::Smtp,
            110 => AppKind::Pop3,
            143 => AppKind::Imap,
            3389 => AppKind::Rdp,
            5900 => AppKind::Vnc,
            _ => AppKind::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AppKind::Http => "HTTP",
            AppKind::Https => "HTTPS",
            AppKind::DnsOverTls => "DNS-over-TLS",
            AppKind::Ssh => "SSH",
            AppKind::Ftp => "FTP",
            AppKind::Smtp => "SMTP",
            AppKind::Pop3 => "POP3",
            AppKind::Imap => "IMAP",
            AppKind::Rdp => "RDP",
            AppKind::Vnc => "VNC",
            AppKind::Unknown => "Unknown",
        }
    }
}

/// Descriptive metadata of a flow, mutable while it lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowMeta {
    pub proxy_label: String,
    pub rule: String,
    pub rule_payload: String,
    pub chain: Vec<String>,
    pub host: Option<String>,
    pub process: Option<String>,
}

/// Values applied when a flow is first recorded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowDefaults {
    pub proxy_label: String,
    pub rule: Option<String>,
    pub rule_payload: String,
    pub chain: Option<Vec<String>>,
    pub host: Option<String>,
    pub process: Option<String>,
    pub initial_state: RelayState,
}

impl FlowDefaults {
    /// Defaults for new flows under `proxy_label`
    pub fn new(proxy_label: impl Into<String>) -> Self {
        Self {
            proxy_label: proxy_label.into(),
            rule: None,
            rule_payload: String::new(),
            chain: None,
            host: None,
            process: None,
            initial_state: RelayState::Pending,
        }
    }

    /// Initial state for new flows
    pub fn with_state(mut self, state: RelayState) -> Self {
        self.initial_state = state;
        self
    }

    /// Resolve into the stored metadata; the host falls back to the
    /// destination IP and the chain to the proxy label alone.
    pub(crate) fn to_meta(&self, key: &FlowKey) -> FlowMeta {
        FlowMeta {
            proxy_label: self.proxy_label.clone(),
            rule: self.rule.clone().unwrap_or_else(|| self.proxy_label.clone()),
            rule_payload: self.rule_payload.clone(),
            chain: self
                .chain
                .clone()
                .unwrap_or_else(|| vec![self.proxy_label.clone()]),
            host: Some(self.host.clone().unwrap_or_else(|| key.dst.ip().to_string())),
            process: self.process.clone(),
        }
    }
}

impl Default for FlowDefaults {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_PROXY_LABEL)
    }
}

/// Point-in-time copy of a tracked flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Flow {
    pub id: u64,
    pub key: FlowKey,
    pub proxy_label: String,
    /// Unix milliseconds
    pub created_at: u64,
    /// Unix milliseconds
    pub last_active_at: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub cur_up_speed: u64,
    pub cur_down_speed: u64,
    pub rule: String,
    pub rule_payload: String,
    pub chain: Vec<String>,
    pub host: Option<String>,
    pub process: Option<String>,
    pub kind: AppKind,
    pub state: RelayState,
}

/// Pushed to subscribers
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum FlowEvent {
    Added(Flow),
    Closed(Flow),
    Tick(TrafficSnapshot),
}
