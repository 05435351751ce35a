//! Socket protection hook
//!
//! On Android every socket the data plane opens towards the network must be
//! handed to `VpnService.protect()` first, otherwise its traffic is routed
//! back into the TUN device. The callback is carried in the engine config
//! rather than a process global so that two engines never share it.

use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

#[cfg(unix)]
pub type RawSocket = std::os::unix::io::RawFd;
#[cfg(windows)]
pub type RawSocket = std::os::windows::io::RawSocket;

/// Platform callback excluding a socket from the VPN route
#[derive(Clone)]
pub struct SocketProtector {
    callback: Arc<dyn Fn(RawSocket) -> bool + Send + Sync>,
}

impl SocketProtector {
    /// Wrap a callback that returns false when protection failed
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(RawSocket) -> bool + Send + Sync + 'static,
    {
        Self {
            callback: Arc::new(callback),
        }
    }

    /// Protect a socket. Returns whether the platform accepted it.
    pub fn protect(&self, socket: RawSocket) -> bool {
        let ok = (self.callback)(socket);
        if ok {
            debug!("Socket {:?} protected", socket);
        } else {
            warn!("Failed to protect socket {:?}", socket);
        }
        ok
    }
}

impl fmt::Debug for SocketProtector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SocketProtector")
    }
}

/// Apply an optional protector to anything exposing a raw socket
#[cfg(unix)]
pub(crate) fn protect_socket<S: std::os::unix::io::AsRawFd>(
    protector: Option<&SocketProtector>,
    socket: &S,
) -> bool {
    match protector {
        Some(p) => p.protect(socket.as_raw_fd()),
        None => true,
    }
}

#[cfg(windows)]
pub(crate) fn protect_socket<S: std::os::windows::io::AsRawSocket>(
    protector: Option<&SocketProtector>,
    socket: &S,
) -> bool {
    match protector {
        Some(p) => p.protect(socket.as_raw_socket()),
        None => true,
    }
}
