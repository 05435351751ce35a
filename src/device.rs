//! TUN byte source/sink
//!
//! The engine only needs "read one packet", "write one packet" and "close".
//! [`ChannelDevice`] serves embedders that already pump the TUN fd
//! themselves (and tests); [`FdDevice`] drives a raw TUN fd directly.

use crate::error::{DataPlaneError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// One IP packet per call in each direction
#[async_trait]
pub trait PacketDevice: Send + Sync + 'static {
    /// Read one packet into `buf`. `Ok(0)` means end of stream.
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one complete packet
    async fn send(&self, packet: &[u8]) -> io::Result<()>;

    /// Release the device. Pending and later `recv` calls return `Ok(0)`.
    async fn close(&self) -> io::Result<()>;
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "device closed")
}

/// In-memory device backed by two packet channels
pub struct ChannelDevice {
    inbound: Mutex<mpsc::Receiver<Bytes>>,
    outbound: mpsc::Sender<Bytes>,
    shutdown: CancellationToken,
    closes: Arc<AtomicUsize>,
}

/// The other end of a [`ChannelDevice`]: injects packets "from the apps"
/// and receives what the engine writes back.
pub struct DeviceHandle {
    inject: mpsc::Sender<Bytes>,
    written: mpsc::Receiver<Bytes>,
    shutdown: CancellationToken,
    closes: Arc<AtomicUsize>,
}

impl ChannelDevice {
    /// A device and its handle, each direction buffering `capacity` packets
    pub fn pair(capacity: usize) -> (ChannelDevice, DeviceHandle) {
        let capacity = capacity.max(1);
        let (inject, inbound) = mpsc::channel(capacity);
        let (outbound, written) = mpsc::channel(capacity);
        let shutdown = CancellationToken::new();
        let closes = Arc::new(AtomicUsize::new(0));

        let device = ChannelDevice {
            inbound: Mutex::new(inbound),
            outbound,
            shutdown: shutdown.clone(),
            closes: closes.clone(),
        };
        let handle = DeviceHandle {
            inject,
            written,
            shutdown,
            closes,
        };
        (device, handle)
    }
}

#[async_trait]
impl PacketDevice for ChannelDevice {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inbound = self.inbound.lock().await;
        let packet = tokio::select! {
            _ = self.shutdown.cancelled() => return Ok(0),
            packet = inbound.recv() => packet,
        };
        match packet {
            Some(packet) => {
                let n = packet.len().min(buf.len());
                buf[..n].copy_from_slice(&packet[..n]);
                Ok(n)
            }
            None => Ok(0),
        }
    }

    async fn send(&self, packet: &[u8]) -> io::Result<()> {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(closed_error()),
            sent = self.outbound.send(Bytes::copy_from_slice(packet)) => sent.map_err(|_| closed_error()),
        }
    }

    async fn close(&self) -> io::Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.shutdown.cancel();
        Ok(())
    }
}

impl DeviceHandle {
    /// Hand a packet to the engine as if an app had written it
    pub async fn inject(&self, packet: impl Into<Bytes>) -> Result<()> {
        self.inject
            .send(packet.into())
            .await
            .map_err(|_| DataPlaneError::DeviceClosed)
    }

    /// Next packet the engine wrote to the device
    pub async fn next_packet(&mut self) -> Option<Bytes> {
        self.written.recv().await
    }

    /// Next written packet if one is already queued
    pub fn try_next_packet(&mut self) -> Option<Bytes> {
        self.written.try_recv().ok()
    }

    /// Whether the device side was closed
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// How many times the device side was closed
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[cfg(unix)]
pub use fd::FdDevice;

#[cfg(unix)]
mod fd {
    use super::*;
    use parking_lot::RwLock;
    use std::fs::File;
    use std::io::{Read, Write};
    use std::os::unix::io::{FromRawFd, RawFd};
    use std::sync::atomic::AtomicBool;
    use tokio::io::unix::AsyncFd;

    /// TUN device over a raw fd. The fd is duplicated, so the caller keeps
    /// ownership of the original (on Android it belongs to `VpnService`).
    pub struct FdDevice {
        inner: RwLock<Option<Arc<AsyncFd<File>>>>,
        shutdown: CancellationToken,
        closed: AtomicBool,
    }

    impl FdDevice {
        /// Wrap a TUN fd; the fd is duplicated and set non-blocking
        pub fn from_raw_fd(fd: RawFd) -> io::Result<Self> {
            // SAFETY: dup only reads the descriptor table; the result is checked
            let dup_fd = unsafe { libc::dup(fd) };
            if dup_fd < 0 {
                return Err(io::Error::last_os_error());
            }

            // SAFETY: dup_fd is a fresh descriptor owned by this function
            let file = unsafe { File::from_raw_fd(dup_fd) };
            set_nonblocking(dup_fd)?;

            let async_fd = AsyncFd::new(file)?;
            info!("TUN fd {} duplicated as {}", fd, dup_fd);

            Ok(Self {
                inner: RwLock::new(Some(Arc::new(async_fd))),
                shutdown: CancellationToken::new(),
                closed: AtomicBool::new(false),
            })
        }

        fn handle(&self) -> io::Result<Arc<AsyncFd<File>>> {
            self.inner.read().clone().ok_or_else(closed_error)
        }
    }

    fn set_nonblocking(fd: RawFd) -> io::Result<()> {
        // SAFETY: fcntl on a descriptor we own
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: as above
        if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[async_trait]
    impl PacketDevice for FdDevice {
        async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
            let Ok(async_fd) = self.handle() else {
                return Ok(0);
            };
            loop {
                let mut guard = tokio::select! {
                    _ = self.shutdown.cancelled() => return Ok(0),
                    guard = async_fd.readable() => guard?,
                };
                match guard.try_io(|inner| inner.get_ref().read(buf)) {
                    Ok(result) => return result,
                    Err(_would_block) => continue,
                }
            }
        }

        async fn send(&self, packet: &[u8]) -> io::Result<()> {
            let async_fd = self.handle()?;
            loop {
                let mut guard = tokio::select! {
                    _ = self.shutdown.cancelled() => return Err(closed_error()),
                    guard = async_fd.writable() => guard?,
                };
                match guard.try_io(|inner| inner.get_ref().write(packet)) {
                    Ok(result) => {
                        result?;
                        return Ok(());
                    }
                    Err(_would_block) => continue,
                }
            }
        }

        async fn close(&self) -> io::Result<()> {
            if self.closed.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            self.shutdown.cancel();
            // The descriptor closes once in-flight reads drop their handle
            self.inner.write().take();
            debug!("TUN fd device closed");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_device_round_trip() {
        let (device, mut handle) = ChannelDevice::pair(8);
        handle.inject(vec![1u8, 2, 3]).await.unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(device.recv(&mut buf).await.unwrap(), 3);
        assert_eq!(&buf[..3], &[1, 2, 3]);

        device.send(&[9, 9]).await.unwrap();
        assert_eq!(handle.next_packet().await.unwrap().as_ref(), &[9, 9]);
    }

    #[tokio::test]
    async fn test_channel_device_close_wakes_reader() {
        let (device, handle) = ChannelDevice::pair(8);
        let device = Arc::new(device);

        let reader = {
            let device = device.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 16];
                device.recv(&mut buf).await.unwrap()
            })
        };

        tokio::task::yield_now().await;
        device.close().await.unwrap();
        assert_eq!(reader.await.unwrap(), 0);
        assert!(handle.is_closed());
        assert_eq!(handle.close_count(), 1);
        assert!(device.send(&[1]).await.is_err());
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_writer() {
        let (device, _handle) = ChannelDevice::pair(1);
        let device = Arc::new(device);
        device.send(&[1]).await.unwrap();

        // Nobody drains the handle, so the second write waits for room
        let writer = {
            let device = device.clone();
            tokio::spawn(async move { device.send(&[2]).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!writer.is_finished());

        device.close().await.unwrap();
        let result = tokio::time::timeout(std::time::Duration::from_secs(1), writer)
            .await
            .expect("writer still blocked after close")
            .unwrap();
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_dropped_handle_is_eof() {
        let (device, handle) = ChannelDevice::pair(8);
        drop(handle);
        let mut buf = [0u8; 16];
        assert_eq!(device.recv(&mut buf).await.unwrap(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_fd_device_over_socketpair() {
        use std::os::unix::io::AsRawFd;
        use std::os::unix::net::UnixDatagram;

        let (ours, peer) = UnixDatagram::pair().unwrap();
        let device = FdDevice::from_raw_fd(ours.as_raw_fd()).unwrap();

        peer.send(b"packet").unwrap();
        let mut buf = [0u8; 64];
        let n = device.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"packet");

        device.send(b"reply").await.unwrap();
        let n = peer.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"reply");

        device.close().await.unwrap();
        device.close().await.unwrap();
        assert_eq!(device.recv(&mut buf).await.unwrap(), 0);
    }
}
