//! Bound and connected session collections

use super::state::{Collection, Session};
use crate::bus::DeviceId;
use crate::error::{SerialBusError, SerialBusResult};

/// Two ordered collections of session records, keyed by device path.
///
/// The registry only stores records. Releasing what a record owns is the
/// job of `PortManager::teardown`.
#[derive(Debug)]
pub struct SessionRegistry {
    bound: Vec<Session>,
    connected: Vec<Session>,
    unique_devices: bool,
}

impl SessionRegistry {
    /// `unique_devices` rejects a device path already present in either
    /// collection. Without it, inserts are unchecked.
    pub fn new(unique_devices: bool) -> Self {
        Self {
            bound: Vec::new(),
            connected: Vec::new(),
            unique_devices,
        }
    }

    fn list(&self, collection: Collection) -> &Vec<Session> {
        match collection {
            Collection::Bound => &self.bound,
            Collection::Connected => &self.connected,
        }
    }

    fn list_mut(&mut self, collection: Collection) -> &mut Vec<Session> {
        match collection {
            Collection::Bound => &mut self.bound,
            Collection::Connected => &mut self.connected,
        }
    }

    /// Check whether `device` may be inserted
    pub fn check_available(&self, device: &str) -> SerialBusResult<()> {
        if self.unique_devices && self.contains(device) {
            return Err(SerialBusError::DeviceInUse(device.to_string()));
        }
        Ok(())
    }

    /// Append to the bound collection. On rejection the session is handed
    /// back so the caller can release it.
    pub fn insert_bound(&mut self, session: Session) -> Result<(), (SerialBusError, Session)> {
        self.insert(Collection::Bound, session)
    }

    /// Append to the connected collection. On rejection the session is
    /// handed back so the caller can release it.
    pub fn insert_connected(&mut self, session: Session) -> Result<(), (SerialBusError, Session)> {
        self.insert(Collection::Connected, session)
    }

    fn insert(
        &mut self,
        collection: Collection,
        session: Session,
    ) -> Result<(), (SerialBusError, Session)> {
        if let Err(e) = self.check_available(&session.device) {
            return Err((e, session));
        }
        self.list_mut(collection).push(session);
        Ok(())
    }

    pub fn find(&self, collection: Collection, device: &str) -> Option<&Session> {
        self.list(collection).iter().find(|s| s.device == device)
    }

    pub fn find_by_object_path(&self, path: &str) -> Option<(Collection, &Session)> {
        [Collection::Bound, Collection::Connected]
            .into_iter()
            .find_map(|collection| {
                self.list(collection)
                    .iter()
                    .find(|s| s.object_path.as_deref() == Some(path))
                    .map(|s| (collection, s))
            })
    }

    /// Detach a record without releasing anything it owns
    pub fn remove(&mut self, collection: Collection, device: &str) -> Option<Session> {
        let list = self.list_mut(collection);
        let index = list.iter().position(|s| s.device == device)?;
        Some(list.remove(index))
    }

    /// Detach a record by its serial number
    pub fn remove_serial(&mut self, collection: Collection, serial: u64) -> Option<Session> {
        let list = self.list_mut(collection);
        let index = list.iter().position(|s| s.serial == serial)?;
        Some(list.remove(index))
    }

    /// Detach every record of a collection
    pub fn take_all(&mut self, collection: Collection) -> Vec<Session> {
        std::mem::take(self.list_mut(collection))
    }

    /// Whether a record in either collection owns `id`
    pub fn holds_id(&self, id: DeviceId) -> bool {
        self.bound.iter().chain(&self.connected).any(|s| s.id == id)
    }

    /// Whether a device path may appear only once across both collections
    pub fn unique_devices(&self) -> bool {
        self.unique_devices
    }

    /// Whether `device` is present in either collection
    pub fn contains(&self, device: &str) -> bool {
        self.find(Collection::Bound, device).is_some()
            || self.find(Collection::Connected, device).is_some()
    }

    pub fn len(&self, collection: Collection) -> usize {
        self.list(collection).len()
    }

    pub fn is_empty(&self) -> bool {
        self.bound.is_empty() && self.connected.is_empty()
    }

    pub fn iter(&self, collection: Collection) -> impl Iterator<Item = &Session> {
        self.list(collection).iter()
    }
}
