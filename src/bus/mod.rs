//! Collaborators the port registry depends on
//!
//! The registry never talks to a real message bus or RFCOMM socket. It is
//! handed trait objects for:
//! - the bus connection (object publication and signals)
//! - the peer liveness watcher (bus name tracking)
//! - the RFCOMM device allocator
//! - the device name resolver
//! - the serial transport of a connected port
//!
//! `local` provides in-process implementations of all of them.

pub mod local;

pub use local::{
    LocalAllocator, LocalBus, LocalLiveness, LocalNames, LocalTransport, TransportProbe,
};

use crate::address::BdAddr;
use crate::error::SerialBusResult;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

/// RFCOMM device id, the index behind `/dev/rfcommN`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub i16);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A method exposed on a bus interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MethodSpec {
    pub name: &'static str,
    /// Input signature
    pub input: &'static str,
    /// Output signature
    pub output: &'static str,
}

/// A bus interface with its method table
#[derive(Debug, Clone, Copy, Serialize)]
pub struct InterfaceSpec {
    pub name: &'static str,
    pub methods: &'static [MethodSpec],
}

/// A signal emitted on the bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusSignal {
    pub path: String,
    pub interface: String,
    pub member: String,
    pub args: Vec<String>,
}

/// What caused a watch to fire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Trigger {
    /// The transport reported error, hangup or an invalid descriptor
    Hangup,
    /// The owning bus client left the bus
    OwnerExited,
}

/// Delivered to the registry when a watch fires
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    /// Serial number of the session the watch belongs to
    pub serial: u64,
    pub device: String,
    pub trigger: Trigger,
}

/// The firing half of a watch.
///
/// `fire` consumes the sink, so a watch can fire at most once.
#[derive(Debug)]
pub struct WatchSink {
    tx: mpsc::UnboundedSender<WatchEvent>,
    event: WatchEvent,
}

impl WatchSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<WatchEvent>, event: WatchEvent) -> Self {
        Self { tx, event }
    }

    /// The event this sink will deliver
    pub fn event(&self) -> &WatchEvent {
        &self.event
    }

    /// Deliver the event. Returns false if the registry is gone.
    pub fn fire(self) -> bool {
        self.tx.send(self.event).is_ok()
    }
}

/// Capability for an installed watch.
///
/// Not `Clone`: handing it back to `unsubscribe`/`unwatch` consumes it.
#[derive(Debug, PartialEq, Eq)]
pub struct Subscription {
    id: u64,
    target: String,
}

impl Subscription {
    pub fn new(id: u64, target: impl Into<String>) -> Self {
        Self {
            id,
            target: target.into(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// What is being watched (bus name or device)
    pub fn target(&self) -> &str {
        &self.target
    }
}

/// Object publication and signal emission on the bus
pub trait BusConnection: Send + Sync {
    /// Create an object at `path`. Fails with `ResourceExhausted` when the
    /// bus cannot allocate it.
    fn create_object_path(&self, path: &str) -> SerialBusResult<()>;

    /// Attach an interface's method table to an existing object
    fn register_interface(&self, path: &str, interface: &InterfaceSpec) -> SerialBusResult<()>;

    /// Remove an object and every interface registered on it
    fn destroy_object_path(&self, path: &str) -> SerialBusResult<()>;

    /// Emit a signal
    fn emit_signal(&self, signal: BusSignal) -> SerialBusResult<()>;
}

/// Tracks whether bus clients are still connected
pub trait LivenessWatcher: Send + Sync {
    /// Fire `sink` once `identity` leaves the bus
    fn subscribe(&self, identity: &str, sink: WatchSink) -> SerialBusResult<Subscription>;

    /// Cancel a watch that has not fired
    fn unsubscribe(&self, subscription: Subscription);
}

/// Owner of the RFCOMM device id space
pub trait DeviceAllocator: Send + Sync {
    /// Give a device id back. Called exactly once per session.
    fn release(&self, id: DeviceId);
}

/// Looks up human-readable remote device names
pub trait NameResolver: Send + Sync {
    fn device_name(&self, local: &BdAddr, peer: &BdAddr) -> Option<String>;
}

/// An open serial I/O channel owned by a connected session
pub trait SerialTransport: Send + fmt::Debug {
    /// Fire `sink` on error, hangup or invalid-descriptor conditions
    fn watch_hangup(&mut self, sink: WatchSink) -> SerialBusResult<Subscription>;

    /// Cancel a watch that has not fired
    fn unwatch(&mut self, subscription: Subscription);

    /// Close the channel
    fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> WatchEvent {
        WatchEvent {
            serial: 7,
            device: "/dev/rfcomm3".to_string(),
            trigger: Trigger::Hangup,
        }
    }

    #[test]
    fn sink_delivers_event() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = WatchSink::new(tx, event());
        assert_eq!(sink.event().serial, 7);

        assert!(sink.fire());
        assert_eq!(rx.try_recv().unwrap(), event());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn sink_reports_closed_registry() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        assert!(!WatchSink::new(tx, event()).fire());
    }

    #[test]
    fn trigger_serializes_kebab_case() {
        assert_eq!(
            serde_json::to_string(&Trigger::OwnerExited).unwrap(),
            "\"owner-exited\""
        );
    }
}
