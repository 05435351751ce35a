//! Process-wide traffic totals and speeds
//!
//! Totals are plain atomics. Speeds are recomputed at most once per second
//! and published through an `ArcSwap`, so readers never take a lock.

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Minimum spacing between speed recomputations
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrafficSnapshot {
    pub total_upload: u64,
    pub total_download: u64,
    /// Bytes per second over the last tick window
    pub upload_speed: u64,
    pub download_speed: u64,
}

#[derive(Debug, Default)]
struct Speeds {
    upload: u64,
    download: u64,
}

#[derive(Debug)]
struct TickState {
    at: Instant,
    upload: u64,
    download: u64,
}

/// Floor of `delta` bytes per second over `elapsed`
pub(crate) fn rate(delta: u64, elapsed: Duration) -> u64 {
    let nanos = elapsed.as_nanos();
    if nanos == 0 {
        return 0;
    }
    (delta as u128 * 1_000_000_000 / nanos) as u64
}

#[derive(Debug)]
pub struct TrafficAccumulator {
    total_upload: AtomicU64,
    total_download: AtomicU64,
    speeds: ArcSwap<Speeds>,
    last_tick: Mutex<TickState>,
}

impl TrafficAccumulator {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    /// Accumulator whose first tick window opens at `start`
    pub fn starting_at(start: Instant) -> Self {
        Self {
            total_upload: AtomicU64::new(0),
            total_download: AtomicU64::new(0),
            speeds: ArcSwap::from_pointee(Speeds::default()),
            last_tick: Mutex::new(TickState {
                at: start,
                upload: 0,
                download: 0,
            }),
        }
    }

    /// Add bytes to a direction's total
    pub fn record(&self, direction: Direction, bytes: u64) {
        match direction {
            Direction::Upload => self.total_upload.fetch_add(bytes, Ordering::Relaxed),
            Direction::Download => self.total_download.fetch_add(bytes, Ordering::Relaxed),
        };

        // Someone else is ticking; their result covers these bytes next time
        if let Some(mut state) = self.last_tick.try_lock() {
            self.tick_locked(&mut state, Instant::now());
        }
    }

    /// Recompute speeds if at least one tick interval passed since the last one
    pub fn tick_at(&self, now: Instant) -> Option<TrafficSnapshot> {
        let mut state = self.last_tick.lock();
        self.tick_locked(&mut state, now)
    }

    fn tick_locked(&self, state: &mut TickState, now: Instant) -> Option<TrafficSnapshot> {
        let elapsed = now.saturating_duration_since(state.at);
        if elapsed < TICK_INTERVAL {
            return None;
        }

        let upload = self.total_upload.load(Ordering::Relaxed);
        let download = self.total_download.load(Ordering::Relaxed);
        let speeds = Speeds {
            upload: rate(upload.saturating_sub(state.upload), elapsed),
            download: rate(download.saturating_sub(state.download), elapsed),
        };
        let snapshot = TrafficSnapshot {
            total_upload: upload,
            total_download: download,
            upload_speed: speeds.upload,
            download_speed: speeds.download,
        };

        self.speeds.store(Arc::new(speeds));
        *state = TickState { at: now, upload, download };
        Some(snapshot)
    }

    pub fn snapshot(&self) -> TrafficSnapshot {
        let speeds = self.speeds.load();
        TrafficSnapshot {
            total_upload: self.total_upload.load(Ordering::Relaxed),
            total_download: self.total_download.load(Ordering::Relaxed),
            upload_speed: speeds.upload,
            download_speed: speeds.download,
        }
    }

    /// Zero all counters and forget the speed history
    pub fn reset(&self) {
        let mut state = self.last_tick.lock();
        self.total_upload.store(0, Ordering::Relaxed);
        self.total_download.store(0, Ordering::Relaxed);
        self.speeds.store(Arc::new(Speeds::default()));
        *state = TickState {
            at: Instant::now(),
            upload: 0,
            download: 0,
        };
    }
}

impl Default for TrafficAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_totals_are_exact_under_contention() {
        let acc = Arc::new(TrafficAccumulator::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let acc = acc.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        acc.record(Direction::Upload, 3);
                        acc.record(Direction::Download, 5);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let snap = acc.snapshot();
        assert_eq!(snap.total_upload, 24_000);
        assert_eq!(snap.total_download, 40_000);
    }

    #[test]
    fn test_tick_computes_floor_speed() {
        let start = Instant::now();
        let acc = TrafficAccumulator::starting_at(start);
        acc.record(Direction::Upload, 3001);
        acc.record(Direction::Download, 1500);

        assert!(acc.tick_at(start + Duration::from_millis(500)).is_none());

        let snap = acc.tick_at(start + Duration::from_secs(2)).unwrap();
        assert_eq!(snap.upload_speed, 1500);
        assert_eq!(snap.download_speed, 750);
        assert_eq!(acc.snapshot(), snap);

        acc.record(Direction::Upload, 1000);
        let snap = acc.tick_at(start + Duration::from_secs(3)).unwrap();
        assert_eq!(snap.upload_speed, 1000);
        assert_eq!(snap.download_speed, 0);
        assert_eq!(snap.total_upload, 4001);
    }

    #[test]
    fn test_reset() {
        let start = Instant::now();
        let acc = TrafficAccumulator::starting_at(start);
        acc.record(Direction::Download, 4096);
        acc.tick_at(start + Duration::from_secs(1)).unwrap();
        acc.reset();
        assert_eq!(acc.snapshot(), TrafficSnapshot::default());
    }

    #[test]
    fn test_rate_floor() {
        assert_eq!(rate(1001, Duration::from_secs(2)), 500);
        assert_eq!(rate(10, Duration::ZERO), 0);
        assert_eq!(rate(3, Duration::from_millis(1500)), 2);
    }
}
