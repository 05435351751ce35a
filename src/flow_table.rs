//! Concurrent flow table
//!
//! One slot per [`FlowKey`]. Counters, timestamps and state are atomics on
//! the slot; descriptive metadata sits behind a per-slot mutex. Map shard
//! guards are never held across an `.await` or any I/O: every operation
//! clones the slot `Arc` out of the map before touching it.

use crate::flow::{AppKind, Flow, FlowDefaults, FlowEvent, FlowKey, FlowMeta, RelayState, StateCell};
use crate::traffic::{rate, Direction, TrafficAccumulator};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, warn};

pub const DEFAULT_FLOW_TIMEOUT: Duration = Duration::from_secs(300);

fn unix_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

struct FlowSlot {
    id: u64,
    key: FlowKey,
    kind: AppKind,
    created_at: u64,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
    /// Nanoseconds since the table epoch
    last_active: AtomicU64,
    /// Unix milliseconds
    last_active_wall: AtomicU64,
    state: StateCell,
    up_speed: AtomicU64,
    down_speed: AtomicU64,
    mark_up: AtomicU64,
    mark_down: AtomicU64,
    meta: Mutex<FlowMeta>,
}

impl FlowSlot {
    fn touch(&self, nanos: u64) {
        self.last_active.fetch_max(nanos, Ordering::Relaxed);
        self.last_active_wall.store(unix_millis(), Ordering::Relaxed);
    }

    fn state(&self) -> RelayState {
        self.state.load()
    }

    fn transition(&self, next: RelayState) -> Result<RelayState, RelayState> {
        self.state.transition(next)
    }

    fn snapshot(&self) -> Flow {
        let meta = self.meta.lock().clone();
        Flow {
            id: self.id,
            key: self.key,
            proxy_label: meta.proxy_label,
            created_at: self.created_at,
            last_active_at: self.last_active_wall.load(Ordering::Relaxed),
            bytes_up: self.bytes_up.load(Ordering::Relaxed),
            bytes_down: self.bytes_down.load(Ordering::Relaxed),
            cur_up_speed: self.up_speed.load(Ordering::Relaxed),
            cur_down_speed: self.down_speed.load(Ordering::Relaxed),
            rule: meta.rule,
            rule_payload: meta.rule_payload,
            chain: meta.chain,
            host: meta.host,
            process: meta.process,
            kind: self.kind,
            state: self.state(),
        }
    }
}

/// Identity -> flow record table
pub struct FlowTable {
    flows: DashMap<FlowKey, Arc<FlowSlot>>,
    next_id: AtomicU64,
    epoch: Instant,
    last_speed_update: Mutex<Instant>,
    traffic: Arc<TrafficAccumulator>,
    events: broadcast::Sender<FlowEvent>,
}

impl FlowTable {
    /// Empty table feeding `traffic`
    pub fn new(traffic: Arc<TrafficAccumulator>, event_capacity: usize) -> Self {
        Self::with_epoch(Instant::now(), traffic, event_capacity)
    }

    fn with_epoch(epoch: Instant, traffic: Arc<TrafficAccumulator>, event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            flows: DashMap::new(),
            next_id: AtomicU64::new(1),
            epoch,
            last_speed_update: Mutex::new(epoch),
            traffic,
            events,
        }
    }

    fn nanos_at(&self, at: Instant) -> u64 {
        at.saturating_duration_since(self.epoch).as_nanos() as u64
    }

    fn now_nanos(&self) -> u64 {
        self.nanos_at(Instant::now())
    }

    fn slot(&self, key: &FlowKey) -> Option<Arc<FlowSlot>> {
        self.flows.get(key).map(|s| Arc::clone(s.value()))
    }

    /// Global accumulator fed by `apply_traffic`
    pub fn traffic(&self) -> &Arc<TrafficAccumulator> {
        &self.traffic
    }

    /// Receive flow events
    pub fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: FlowEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Return the flow for `key`, creating it if absent. The flag is true
    /// only for the caller that created it.
    pub fn record_or_get(&self, key: &FlowKey, defaults: &FlowDefaults) -> (Flow, bool) {
        let now = self.now_nanos();
        let (slot, created) = match self.flows.entry(*key) {
            Entry::Occupied(e) => (Arc::clone(e.get()), false),
            Entry::Vacant(e) => {
                let wall = unix_millis();
                let slot = Arc::new(FlowSlot {
                    id: self.next_id.fetch_add(1, Ordering::Relaxed),
                    key: *key,
                    kind: AppKind::from_port(key.dst.port()),
                    created_at: wall,
                    bytes_up: AtomicU64::new(0),
                    bytes_down: AtomicU64::new(0),
                    last_active: AtomicU64::new(now),
                    last_active_wall: AtomicU64::new(wall),
                    state: StateCell::new(defaults.initial_state),
                    up_speed: AtomicU64::new(0),
                    down_speed: AtomicU64::new(0),
                    mark_up: AtomicU64::new(0),
                    mark_down: AtomicU64::new(0),
                    meta: Mutex::new(defaults.to_meta(key)),
                });
                e.insert(Arc::clone(&slot));
                (slot, true)
            }
        };

        slot.touch(now);
        let flow = slot.snapshot();
        if created {
            debug!("Flow #{} added: {}", flow.id, key);
            self.emit(FlowEvent::Added(flow.clone()));
        }
        (flow, created)
    }

    /// Add payload bytes to a flow and the process totals
    pub fn apply_traffic(&self, key: &FlowKey, up: u64, down: u64) -> bool {
        let Some(slot) = self.slot(key) else {
            return false;
        };
        if up > 0 {
            slot.bytes_up.fetch_add(up, Ordering::Relaxed);
            self.traffic.record(Direction::Upload, up);
        }
        if down > 0 {
            slot.bytes_down.fetch_add(down, Ordering::Relaxed);
            self.traffic.record(Direction::Download, down);
        }
        slot.touch(self.now_nanos());
        true
    }

    /// Refresh last activity. False if the flow is unknown.
    pub fn touch(&self, key: &FlowKey) -> bool {
        match self.slot(key) {
            Some(slot) => {
                slot.touch(self.now_nanos());
                true
            }
            None => false,
        }
    }

    /// Advance the relay state; illegal transitions are refused
    pub fn set_state(&self, key: &FlowKey, state: RelayState) -> bool {
        let Some(slot) = self.slot(key) else {
            return false;
        };
        match slot.transition(state) {
            Ok(_) => true,
            Err(from) => {
                warn!("Flow #{} rejected transition {:?} -> {:?}", slot.id, from, state);
                false
            }
        }
    }

    /// Mark closed but keep the record for observers
    pub fn mark_closed(&self, key: &FlowKey) -> bool {
        self.slot(key)
            .map(|slot| slot.transition(RelayState::Closed).is_ok())
            .unwrap_or(false)
    }

    /// Current state of a flow
    pub fn state(&self, key: &FlowKey) -> Option<RelayState> {
        self.slot(key).map(|slot| slot.state())
    }

    /// Edit rule, chain, host or process of a flow
    pub fn update_metadata<F>(&self, key: &FlowKey, f: F) -> bool
    where
        F: FnOnce(&mut FlowMeta),
    {
        match self.slot(key) {
            Some(slot) => {
                f(&mut slot.meta.lock());
                true
            }
            None => false,
        }
    }

    /// Remove a flow and publish its final snapshot
    pub fn close(&self, key: &FlowKey) -> Option<Flow> {
        let (_, slot) = self.flows.remove(key)?;
        let _ = slot.transition(RelayState::Closed);
        let flow = slot.snapshot();
        debug!(
            "Flow #{} closed: {} (up {} / down {})",
            flow.id, key, flow.bytes_up, flow.bytes_down
        );
        self.emit(FlowEvent::Closed(flow.clone()));
        Some(flow)
    }

    /// Remove every flow, emitting `Closed` for each
    pub fn close_all(&self) -> usize {
        let keys: Vec<FlowKey> = self.flows.iter().map(|e| *e.key()).collect();
        keys.iter().filter(|key| self.close(key).is_some()).count()
    }

    /// Evict flows idle for longer than `timeout` as of `now`
    pub fn sweep_expired(&self, now: Instant, timeout: Duration) -> usize {
        let now_nanos = self.nanos_at(now);
        let limit = timeout.as_nanos() as u64;
        let expired = |slot: &Arc<FlowSlot>| {
            now_nanos.saturating_sub(slot.last_active.load(Ordering::Relaxed)) > limit
        };

        let candidates: Vec<FlowKey> = self
            .flows
            .iter()
            .filter(|e| expired(e.value()))
            .map(|e| *e.key())
            .collect();

        let mut removed = 0;
        for key in candidates {
            // Re-checked under the shard lock in case it was touched meanwhile
            if let Some((_, slot)) = self.flows.remove_if(&key, |_, slot| expired(slot)) {
                let _ = slot.transition(RelayState::Closed);
                self.emit(FlowEvent::Closed(slot.snapshot()));
                removed += 1;
            }
        }
        if removed > 0 {
            debug!("Swept {} idle flows, {} remain", removed, self.flows.len());
        }
        removed
    }

    /// Recompute per-flow speeds over the window since the previous call
    pub fn update_speeds(&self, now: Instant) {
        let mut last = self.last_speed_update.lock();
        let elapsed = now.saturating_duration_since(*last);
        if elapsed.is_zero() {
            return;
        }
        for entry in self.flows.iter() {
            let slot = entry.value();
            let up = slot.bytes_up.load(Ordering::Relaxed);
            let down = slot.bytes_down.load(Ordering::Relaxed);
            let prev_up = slot.mark_up.swap(up, Ordering::Relaxed);
            let prev_down = slot.mark_down.swap(down, Ordering::Relaxed);
            slot.up_speed.store(rate(up.saturating_sub(prev_up), elapsed), Ordering::Relaxed);
            slot.down_speed.store(rate(down.saturating_sub(prev_down), elapsed), Ordering::Relaxed);
        }
        *last = now;
    }

    /// Snapshot of one flow
    pub fn get(&self, key: &FlowKey) -> Option<Flow> {
        self.slot(key).map(|slot| slot.snapshot())
    }

    /// All flows ordered by id
    pub fn snapshot_all(&self) -> Vec<Flow> {
        let slots: Vec<Arc<FlowSlot>> = self.flows.iter().map(|e| Arc::clone(e.value())).collect();
        let mut flows: Vec<Flow> = slots.iter().map(|s| s.snapshot()).collect();
        flows.sort_by_key(|f| f.id);
        flows
    }

    /// Number of tracked flows
    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}
