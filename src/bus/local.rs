//! In-process implementations of the bus collaborators
//!
//! Used by the `serve` daemon and by tests. State sits behind mutexes so the
//! collaborators can be shared with whoever simulates the outside world
//! (a peer leaving the bus, a link dropping).

use super::{
    BusConnection, BusSignal, DeviceAllocator, DeviceId, InterfaceSpec, LivenessWatcher,
    NameResolver, SerialTransport, Subscription, WatchSink,
};
use crate::address::BdAddr;
use crate::error::{SerialBusError, SerialBusResult};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Object table plus a broadcast channel of emitted signals
pub struct LocalBus {
    objects: Mutex<BTreeMap<String, Vec<String>>>,
    max_objects: usize,
    reject_interfaces: AtomicBool,
    signals: broadcast::Sender<BusSignal>,
}

impl LocalBus {
    pub fn new(max_objects: usize, signal_capacity: usize) -> Self {
        let (signals, _) = broadcast::channel(signal_capacity.max(1));
        Self {
            objects: Mutex::new(BTreeMap::new()),
            max_objects,
            reject_interfaces: AtomicBool::new(false),
            signals,
        }
    }

    /// Receive every signal emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<BusSignal> {
        self.signals.subscribe()
    }

    /// Make interface registration fail, as a bus out of memory would
    pub fn reject_interfaces(&self, reject: bool) {
        self.reject_interfaces.store(reject, Ordering::SeqCst);
    }

    pub fn has_object(&self, path: &str) -> bool {
        lock(&self.objects).contains_key(path)
    }

    /// Interfaces registered on an object
    pub fn interfaces(&self, path: &str) -> Vec<String> {
        lock(&self.objects).get(path).cloned().unwrap_or_default()
    }

    pub fn object_count(&self) -> usize {
        lock(&self.objects).len()
    }
}

impl BusConnection for LocalBus {
    fn create_object_path(&self, path: &str) -> SerialBusResult<()> {
        let mut objects = lock(&self.objects);
        if objects.contains_key(path) {
            return Err(SerialBusError::registration(path, "object path already exists"));
        }
        if objects.len() >= self.max_objects {
            return Err(SerialBusError::ResourceExhausted(format!(
                "creating object {}",
                path
            )));
        }
        objects.insert(path.to_string(), Vec::new());
        Ok(())
    }

    fn register_interface(&self, path: &str, interface: &InterfaceSpec) -> SerialBusResult<()> {
        if self.reject_interfaces.load(Ordering::SeqCst) {
            return Err(SerialBusError::ResourceExhausted(format!(
                "registering {} on {}",
                interface.name, path
            )));
        }

        let mut objects = lock(&self.objects);
        let interfaces = objects
            .get_mut(path)
            .ok_or_else(|| SerialBusError::NotFound(path.to_string()))?;
        if !interfaces.iter().any(|i| i == interface.name) {
            interfaces.push(interface.name.to_string());
        }
        Ok(())
    }

    fn destroy_object_path(&self, path: &str) -> SerialBusResult<()> {
        lock(&self.objects)
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| SerialBusError::NotFound(path.to_string()))
    }

    fn emit_signal(&self, signal: BusSignal) -> SerialBusResult<()> {
        debug!("Signal {}.{} on {}", signal.interface, signal.member, signal.path);
        // No receivers is not an error: nobody is listening
        let _ = self.signals.send(signal);
        Ok(())
    }
}

/// Bus name tracker that fires when a client is declared gone
#[derive(Default)]
pub struct LocalLiveness {
    next_id: AtomicU64,
    watches: Mutex<BTreeMap<u64, (String, WatchSink)>>,
}

impl LocalLiveness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate `identity` leaving the bus. Returns how many watches fired.
    pub fn peer_exited(&self, identity: &str) -> usize {
        let fired: Vec<WatchSink> = {
            let mut watches = lock(&self.watches);
            let ids: Vec<u64> = watches
                .iter()
                .filter(|(_, (name, _))| name == identity)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| watches.remove(&id).map(|(_, sink)| sink))
                .collect()
        };

        let count = fired.len();
        for sink in fired {
            sink.fire();
        }
        count
    }

    /// Number of installed watches
    pub fn active(&self) -> usize {
        lock(&self.watches).len()
    }
}

/// Unique names look like `:1.42`, well-known names like `org.client.Z`
fn is_bus_name(name: &str) -> bool {
    if let Some(unique) = name.strip_prefix(':') {
        return !unique.is_empty();
    }
    name.contains('.') && name.split('.').all(|element| !element.is_empty())
}

impl LivenessWatcher for LocalLiveness {
    fn subscribe(&self, identity: &str, sink: WatchSink) -> SerialBusResult<Subscription> {
        if !is_bus_name(identity) {
            return Err(SerialBusError::InvalidRequest(format!(
                "not a bus name: {:?}",
                identity
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        lock(&self.watches).insert(id, (identity.to_string(), sink));
        Ok(Subscription::new(id, identity))
    }

    fn unsubscribe(&self, subscription: Subscription) {
        if lock(&self.watches).remove(&subscription.id()).is_none() {
            warn!(
                "Liveness watch {} for {} was not installed",
                subscription.id(),
                subscription.target()
            );
        }
    }
}

/// RFCOMM id space below a fixed limit
pub struct LocalAllocator {
    limit: u16,
    allocated: Mutex<BTreeSet<i16>>,
    released: Mutex<Vec<DeviceId>>,
}

impl LocalAllocator {
    pub fn new(limit: u16) -> Self {
        Self {
            limit: limit.min(i16::MAX as u16),
            allocated: Mutex::new(BTreeSet::new()),
            released: Mutex::new(Vec::new()),
        }
    }

    /// Hand out the lowest free id
    pub fn allocate(&self) -> SerialBusResult<DeviceId> {
        let mut allocated = lock(&self.allocated);
        let id = (0..self.limit as i16)
            .find(|id| !allocated.contains(id))
            .ok_or(SerialBusError::NoFreeDevice { limit: self.limit })?;
        allocated.insert(id);
        Ok(DeviceId(id))
    }

    /// Take a specific id
    pub fn claim(&self, id: DeviceId) -> SerialBusResult<()> {
        if id.0 < 0 || id.0 as u16 >= self.limit {
            return Err(SerialBusError::InvalidRequest(format!(
                "device id {} outside 0..{}",
                id, self.limit
            )));
        }
        if !lock(&self.allocated).insert(id.0) {
            return Err(SerialBusError::DeviceInUse(format!("/dev/rfcomm{}", id)));
        }
        Ok(())
    }

    pub fn is_allocated(&self, id: DeviceId) -> bool {
        lock(&self.allocated).contains(&id.0)
    }

    /// Every release seen so far, in order
    pub fn released(&self) -> Vec<DeviceId> {
        lock(&self.released).clone()
    }
}

impl DeviceAllocator for LocalAllocator {
    fn release(&self, id: DeviceId) {
        if !lock(&self.allocated).remove(&id.0) {
            warn!("Releasing RFCOMM device {} that was not allocated", id);
        }
        lock(&self.released).push(id);
    }
}

/// Static address book
#[derive(Default)]
pub struct LocalNames {
    names: Mutex<HashMap<(BdAddr, BdAddr), String>>,
}

impl LocalNames {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, local: BdAddr, peer: BdAddr, name: impl Into<String>) {
        lock(&self.names).insert((local, peer), name.into());
    }
}

impl NameResolver for LocalNames {
    fn device_name(&self, local: &BdAddr, peer: &BdAddr) -> Option<String> {
        lock(&self.names).get(&(*local, *peer)).cloned()
    }
}

#[derive(Debug, Default)]
struct TransportState {
    device: String,
    next_id: u64,
    watches: BTreeMap<u64, WatchSink>,
    closed: bool,
    hung_up: bool,
}

/// A simulated RFCOMM tty channel
#[derive(Debug)]
pub struct LocalTransport {
    state: Arc<Mutex<TransportState>>,
}

/// The far side of a `LocalTransport`, used to drop the link and observe it
#[derive(Debug, Clone)]
pub struct TransportProbe {
    state: Arc<Mutex<TransportState>>,
}

impl LocalTransport {
    /// Open a channel on `device`
    pub fn open(device: &str) -> (LocalTransport, TransportProbe) {
        let state = Arc::new(Mutex::new(TransportState {
            device: device.to_string(),
            ..TransportState::default()
        }));
        (
            LocalTransport {
                state: Arc::clone(&state),
            },
            TransportProbe { state },
        )
    }
}

impl SerialTransport for LocalTransport {
    fn watch_hangup(&mut self, sink: WatchSink) -> SerialBusResult<Subscription> {
        let mut state = lock(&self.state);
        if state.closed || state.hung_up {
            return Err(SerialBusError::io(
                format!("watching {}", state.device),
                std::io::Error::from(std::io::ErrorKind::NotConnected),
            ));
        }

        let id = state.next_id;
        state.next_id += 1;
        state.watches.insert(id, sink);
        Ok(Subscription::new(id, state.device.clone()))
    }

    fn unwatch(&mut self, subscription: Subscription) {
        lock(&self.state).watches.remove(&subscription.id());
    }

    fn close(&mut self) {
        let mut state = lock(&self.state);
        state.closed = true;
        state.watches.clear();
    }
}

impl TransportProbe {
    /// Drop the link. Returns false if the channel was already closed.
    pub fn hangup(&self) -> bool {
        let fired: Vec<WatchSink> = {
            let mut state = lock(&self.state);
            if state.closed || state.hung_up {
                return false;
            }
            state.hung_up = true;
            std::mem::take(&mut state.watches).into_values().collect()
        };

        for sink in fired {
            sink.fire();
        }
        true
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    pub fn watch_count(&self) -> usize {
        lock(&self.state).watches.len()
    }
}
