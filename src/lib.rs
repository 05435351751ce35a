//! VeloGuard data plane - TUN packet engine for transparent proxy mode
//!
//! Reads raw IP packets from a TUN device, tracks every network flow, and
//! relays TCP payload (plus best-effort UDP) through the local SOCKS5
//! endpoint of the proxy core, with live per-flow and global traffic
//! accounting.
//!
//! # Architecture
//!
//! ```text
//! +-------------------------------------------------------------+
//! |                 Observers (UI / FFI)                        |
//! |   all_flows() / traffic_snapshot() / subscribe()            |
//! +-------------------------------------------------------------+
//!                              ^
//!                              |
//! +-------------------------------------------------------------+
//! |                   TunPacketEngine                           |
//! | +-------------+ +-------------+ +-------------------+       |
//! | |RelayPipeline| |  UdpRelay   | |   Maintenance     |       |
//! | | (TCP)       | |             | | (sweep, tick)     |       |
//! | +-------------+ +-------------+ +-------------------+       |
//! |        |               |                 |                  |
//! | +-----------------------------------------------------+    |
//! | |      FlowTable  -->  TrafficAccumulator             |    |
//! | +-----------------------------------------------------+    |
//! | +-----------------------------------------------------+    |
//! | |      PacketCodec (decode, build, checksums)         |    |
//! | +-----------------------------------------------------+    |
//! +-------------------------------------------------------------+
//!          |                                   |
//!          v                                   v
//! +------------------+              +-------------------------+
//! |  PacketDevice    |              |  Socks5Client           |
//! |  (TUN fd)        |              |  (127.0.0.1:7897)       |
//! +------------------+              +-------------------------+
//! ```
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use veloguard_dataplane::{EngineConfig, FdDevice, TunPacketEngine};
//!
//! #[tokio::main]
//! async fn main() -> veloguard_dataplane::Result<()> {
//!     let config = EngineConfig::builder().proxy("127.0.0.1", 7897).build()?;
//!     let device = Arc::new(FdDevice::from_raw_fd(tun_fd)?);
//!
//!     let engine = TunPacketEngine::new(config, device)?;
//!     engine.start()?;
//!
//!     let mut events = engine.subscribe();
//!     while let Ok(event) = events.recv().await {
//!         println!("{}", serde_json::to_string(&event).unwrap());
//!     }
//!
//!     engine.stop().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod flow;
pub mod flow_table;
pub mod logging;
pub mod packet;
pub mod protect;
pub mod relay;
pub mod socks5;
pub mod stats;
pub mod traffic;
pub mod udp;

#[cfg(test)]
mod testutil;

pub use config::{EngineBuilder, EngineConfig, UdpMode};
#[cfg(unix)]
pub use device::FdDevice;
pub use device::{ChannelDevice, DeviceHandle, PacketDevice};
pub use engine::TunPacketEngine;
pub use error::{ConfigError, ConnectError, DataPlaneError, DecodeError, Result};
pub use flow::{AppKind, Flow, FlowDefaults, FlowEvent, FlowKey, FlowMeta, FlowProtocol, RelayState};
pub use flow_table::FlowTable;
pub use logging::{init_logging, LogLevel};
pub use packet::{decode, DecodedPacket, TcpFlags, Transport};
pub use protect::SocketProtector;
pub use relay::{RelayConfig, RelayPipeline};
pub use socks5::{Socks5Client, TargetAddr};
pub use stats::{EngineStats, StatsSnapshot};
pub use traffic::{Direction, TrafficAccumulator, TrafficSnapshot};
pub use udp::{UdpConfig, UdpRelay};
