//! Port session lifecycle
//!
//! `PortManager` owns the registry and is the only thing that creates or
//! destroys sessions. Every way a session can end (disconnect request,
//! unregister request, owner leaving the bus, transport hangup, shutdown)
//! funnels into `release`, which frees what the record owns exactly once.

use super::object::{
    PortObject, MANAGER_INTERFACE, PORT_INTERFACE, PORT_INTERFACE_SPEC, SERVICE_DISCONNECTED,
};
use super::registry::SessionRegistry;
use super::state::{Collection, Session, SessionSummary};
use crate::address::BdAddr;
use crate::bus::{
    BusConnection, BusSignal, DeviceAllocator, DeviceId, LivenessWatcher, NameResolver,
    SerialTransport, Trigger, WatchEvent, WatchSink,
};
use crate::config::schema::SerialConfig;
use crate::error::{SerialBusError, SerialBusResult};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// External services the manager drives
#[derive(Clone)]
pub struct Collaborators {
    pub bus: Arc<dyn BusConnection>,
    pub liveness: Arc<dyn LivenessWatcher>,
    pub allocator: Arc<dyn DeviceAllocator>,
    pub names: Arc<dyn NameResolver>,
}

/// Register a port on the bus without a peer attached
#[derive(Debug, Clone)]
pub struct BindRequest {
    /// Device id the caller allocated; owned by the manager from here on
    pub id: DeviceId,
    pub local: BdAddr,
    pub peer: BdAddr,
    pub device: String,
    /// Falls back to the configured default when absent or empty
    pub service_name: Option<String>,
}

/// Attach a peer connection to a port
#[derive(Debug)]
pub struct ConnectRequest {
    /// Device id the caller allocated; owned by the manager from here on
    pub id: DeviceId,
    pub peer: BdAddr,
    pub transport: Box<dyn SerialTransport>,
    pub device: String,
    /// Bus client requesting the connection
    pub owner: String,
}

/// Why a session is being torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TeardownCause {
    /// Owner asked to disconnect
    Disconnected,
    /// Owner left the bus
    OwnerExited,
    /// Transport error or hangup
    Hangup,
    /// Bound port unregistered
    Unregistered,
    /// Manager shutting down
    Shutdown,
    /// Creation failed part way
    Aborted,
}

impl From<Trigger> for TeardownCause {
    fn from(trigger: Trigger) -> Self {
        match trigger {
            Trigger::Hangup => TeardownCause::Hangup,
            Trigger::OwnerExited => TeardownCause::OwnerExited,
        }
    }
}

/// Session lifecycle controller
pub struct PortManager {
    registry: SessionRegistry,
    collab: Collaborators,
    events: mpsc::UnboundedSender<WatchEvent>,
    manager_path: String,
    default_service_name: String,
    unique_devices: bool,
    next_serial: u64,
}

impl PortManager {
    /// Create a manager. Fired watches arrive on the returned receiver and
    /// must be fed back through `handle_watch_event`.
    pub fn new(
        config: &SerialConfig,
        collab: Collaborators,
    ) -> (Self, mpsc::UnboundedReceiver<WatchEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let manager = Self {
            registry: SessionRegistry::new(config.unique_devices),
            collab,
            events,
            manager_path: config.manager_path.clone(),
            default_service_name: config.default_service_name.clone(),
            unique_devices: config.unique_devices,
            next_serial: 1,
        };
        (manager, rx)
    }

    /// Bus path a bound port is published at
    pub fn port_path(&self, id: DeviceId) -> String {
        format!("{}/rfcomm{}", self.manager_path, id)
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Snapshot of every session, bound first
    pub fn list(&self) -> Vec<SessionSummary> {
        [Collection::Bound, Collection::Connected]
            .into_iter()
            .flat_map(|c| self.registry.iter(c).map(move |s| s.summary(c)))
            .collect()
    }

    fn next_serial(&mut self) -> u64 {
        let serial = self.next_serial;
        self.next_serial += 1;
        serial
    }

    fn sink(&self, session: &Session, trigger: Trigger) -> WatchSink {
        WatchSink::new(
            self.events.clone(),
            WatchEvent {
                serial: session.serial,
                device: session.device.clone(),
                trigger,
            },
        )
    }

    /// Publish a port on the bus and add it to the bound collection.
    ///
    /// Returns the object path. On any failure nothing stays published and
    /// the device id is released, unless another live port owns it.
    pub fn bind(&mut self, request: BindRequest) -> SerialBusResult<String> {
        // The id belongs to a live port, so it is not ours to release
        if self.registry.holds_id(request.id) {
            return Err(SerialBusError::DeviceInUse(format!("rfcomm id {}", request.id)));
        }

        let service_name = request
            .service_name
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| self.default_service_name.clone());
        let serial = self.next_serial();
        let mut session = Session::new(
            serial,
            request.id,
            request.local,
            request.peer,
            request.device,
            service_name,
        );

        if let Err(e) = self.registry.check_available(&session.device) {
            self.release(session, TeardownCause::Aborted, false);
            return Err(e);
        }

        let path = self.port_path(request.id);
        if let Err(e) = self.collab.bus.create_object_path(&path) {
            error!("Bus failed to register {} path: {}", path, e);
            self.release(session, TeardownCause::Aborted, false);
            return Err(SerialBusError::registration(path, e.to_string()));
        }
        session.object_path = Some(path.clone());

        if let Err(e) = self.collab.bus.register_interface(&path, &PORT_INTERFACE_SPEC) {
            error!("Bus failed to register {} interface: {}", PORT_INTERFACE, e);
            self.release(session, TeardownCause::Aborted, false);
            return Err(SerialBusError::registration(path, e.to_string()));
        }

        let device = session.device.clone();
        if let Err((e, session)) = self.registry.insert_bound(session) {
            self.release(session, TeardownCause::Aborted, false);
            return Err(e);
        }

        info!("Registered RFCOMM:{}, path:{}", device, path);
        Ok(path)
    }

    /// Attach a peer connection, watching the transport and the owner.
    ///
    /// A bound port on the same device is promoted into the connected
    /// collection when unique device paths are enforced. The bound record
    /// stays published until both watches are installed; if either fails
    /// only what this request brought is released.
    pub fn connect(&mut self, request: ConnectRequest) -> SerialBusResult<()> {
        let ConnectRequest {
            id,
            peer,
            mut transport,
            device,
            owner,
        } = request;

        let bound = self
            .registry
            .find(Collection::Bound, &device)
            .map(|s| (s.id, s.local, s.service_name.clone()));
        let promote = self.unique_devices
            && bound.as_ref().is_some_and(|(bound_id, ..)| *bound_id == id);

        // The id belongs to a live port, so it is not ours to release
        if !promote && self.registry.holds_id(id) {
            transport.close();
            return Err(SerialBusError::DeviceInUse(format!("rfcomm id {}", id)));
        }

        if self.unique_devices && bound.is_some() && !promote {
            transport.close();
            self.collab.allocator.release(id);
            return Err(SerialBusError::DeviceInUse(device));
        }

        let serial = self.next_serial();
        let mut session = match bound.filter(|_| promote) {
            Some((_, local, service_name)) => {
                Session::new(serial, id, local, peer, device.clone(), service_name)
            }
            None => Session::new(
                serial,
                id,
                BdAddr::ANY,
                peer,
                device.clone(),
                self.default_service_name.clone(),
            ),
        };
        session.owner = Some(owner.clone());

        if !promote {
            if let Err(e) = self.registry.check_available(&device) {
                session.transport = Some(transport);
                self.release(session, TeardownCause::Aborted, false);
                return Err(e);
            }
        }

        match transport.watch_hangup(self.sink(&session, Trigger::Hangup)) {
            Ok(watch) => session.hangup_watch = Some(watch),
            Err(e) => {
                error!("Unable to watch transport of {}: {}", device, e);
                session.transport = Some(transport);
                self.abort_connect(session, promote);
                return Err(SerialBusError::registration(device, e.to_string()));
            }
        }
        session.transport = Some(transport);

        match self
            .collab
            .liveness
            .subscribe(&owner, self.sink(&session, Trigger::OwnerExited))
        {
            Ok(watch) => session.liveness_watch = Some(watch),
            Err(e) => {
                error!("Unable to watch connect requestor {}: {}", owner, e);
                self.abort_connect(session, promote);
                return Err(SerialBusError::registration(device, e.to_string()));
            }
        }

        if promote {
            if let Some(mut bound) = self.registry.remove(Collection::Bound, &device) {
                debug!("Promoting bound port {} to connected", device);
                session.object_path = bound.object_path.take();
            }
        }

        if let Err((e, session)) = self.registry.insert_connected(session) {
            self.release(session, TeardownCause::Aborted, false);
            return Err(e);
        }

        info!("RFCOMM node {} connected by {}", device, owner);
        Ok(())
    }

    /// Undo a connect that failed part way. When promoting, the id and the
    /// bus object still belong to the bound record.
    fn abort_connect(&self, mut session: Session, promote: bool) {
        if promote {
            self.release_io(&mut session, TeardownCause::Aborted);
        } else {
            self.release(session, TeardownCause::Aborted, false);
        }
    }

    /// Tear down a connected port on behalf of its owner
    pub fn disconnect(&mut self, requester: &str, device: &str) -> SerialBusResult<()> {
        let session = self
            .registry
            .find(Collection::Connected, device)
            .ok_or_else(|| SerialBusError::NotFound(device.to_string()))?;

        if session.owner.as_deref() != Some(requester) {
            return Err(SerialBusError::Forbidden {
                device: device.to_string(),
                requester: requester.to_string(),
            });
        }

        self.teardown(Collection::Connected, device, TeardownCause::Disconnected);
        Ok(())
    }

    /// Unpublish a bound port.
    ///
    /// Accepts the object path returned by `bind` or the device path.
    pub fn unregister(&mut self, path: &str) -> SerialBusResult<()> {
        let device = self
            .device_for_path(path)
            .filter(|device| self.registry.find(Collection::Bound, device).is_some())
            .ok_or_else(|| SerialBusError::NotFound(path.to_string()))?;

        self.teardown(Collection::Bound, &device, TeardownCause::Unregistered);
        Ok(())
    }

    /// Tear down every connected port. Bound ports stay published.
    pub fn release_all(&mut self) -> usize {
        let sessions = self.registry.take_all(Collection::Connected);
        let count = sessions.len();
        for session in sessions {
            self.release(session, TeardownCause::Shutdown, true);
        }
        count
    }

    /// Route a fired watch into teardown. Events for sessions that are
    /// already gone are ignored.
    pub fn handle_watch_event(&mut self, event: WatchEvent) -> bool {
        let Some(session) = self.registry.remove_serial(Collection::Connected, event.serial) else {
            debug!(
                "Ignoring {:?} for {}: session already released",
                event.trigger, event.device
            );
            return false;
        };

        match event.trigger {
            Trigger::Hangup => debug!("RFCOMM node {} was disconnected", session.device),
            Trigger::OwnerExited => debug!(
                "Connect requestor {} exited. Releasing {} node",
                session.owner.as_deref().unwrap_or("?"),
                session.device
            ),
        }

        self.release(session, event.trigger.into(), true);
        true
    }

    /// Remove a session from `collection` and release it. Returns false if
    /// there was nothing to tear down.
    pub fn teardown(&mut self, collection: Collection, device: &str, cause: TeardownCause) -> bool {
        match self.registry.remove(collection, device) {
            Some(session) => {
                self.release(session, cause, collection == Collection::Connected);
                true
            }
            None => {
                debug!("No {:?} session on {} to tear down", collection, device);
                false
            }
        }
    }

    /// Free everything a detached record owns. Consuming the record is what
    /// makes this happen once.
    fn release(&self, mut session: Session, cause: TeardownCause, was_connected: bool) {
        debug!("Releasing {} ({:?})", session.device, cause);
        self.release_io(&mut session, cause);

        if let Some(path) = session.object_path.take() {
            match self.collab.bus.destroy_object_path(&path) {
                Ok(()) => debug!("Unregistered serial port: {}", session.device),
                Err(e) => warn!("Failed to unpublish {}: {}", path, e),
            }
        }

        self.collab.allocator.release(session.id);

        if was_connected {
            let signal = BusSignal {
                path: self.manager_path.clone(),
                interface: MANAGER_INTERFACE.to_string(),
                member: SERVICE_DISCONNECTED.to_string(),
                args: vec![session.device.clone()],
            };
            if let Err(e) = self.collab.bus.emit_signal(signal) {
                warn!("Failed to emit {} for {}: {}", SERVICE_DISCONNECTED, session.device, e);
            }
        }
    }

    /// Cancel the watches of a record and close its transport
    fn release_io(&self, session: &mut Session, cause: TeardownCause) {
        // A watch that fired has already been consumed by the watcher
        if let Some(watch) = session.liveness_watch.take() {
            if cause != TeardownCause::OwnerExited {
                self.collab.liveness.unsubscribe(watch);
            }
        }

        let mut transport = session.transport.take();
        if let Some(watch) = session.hangup_watch.take() {
            if cause != TeardownCause::Hangup {
                if let Some(transport) = transport.as_mut() {
                    transport.unwatch(watch);
                }
            }
        }
        if let Some(mut transport) = transport {
            transport.close();
        }
    }

    fn device_for_path(&self, path: &str) -> Option<String> {
        if path.starts_with("/dev/") {
            return Some(path.to_string());
        }
        let id: i16 = path
            .strip_prefix(self.manager_path.as_str())?
            .strip_prefix("/rfcomm")?
            .parse()
            .ok()?;
        Some(format!("/dev/rfcomm{}", id))
    }

    /// Query handlers for a port, by object path or by device path
    pub fn object(&self, path: &str) -> SerialBusResult<PortObject<'_>> {
        let session = self
            .registry
            .find_by_object_path(path)
            .map(|(_, s)| s)
            .or_else(|| self.registry.find(Collection::Connected, path))
            .or_else(|| self.registry.find(Collection::Bound, path))
            .ok_or_else(|| SerialBusError::NotFound(path.to_string()))?;

        Ok(PortObject::new(session, self.collab.names.as_ref()))
    }
}
