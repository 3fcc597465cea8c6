//! Session records

use crate::address::BdAddr;
use crate::bus::{DeviceId, SerialTransport, Subscription};
use serde::Serialize;

/// Which registry collection a session lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    /// Published but idle
    Bound,
    /// Carrying a peer connection
    Connected,
}

/// One managed RFCOMM serial port
#[derive(Debug)]
pub struct Session {
    /// Process-unique record number, never reused
    pub(crate) serial: u64,

    /// RFCOMM device id, released exactly once when the record is destroyed
    pub id: DeviceId,

    /// Local adapter address
    pub local: BdAddr,

    /// Remote device address
    pub peer: BdAddr,

    /// Device node, e.g. `/dev/rfcomm0`
    pub device: String,

    pub service_name: String,

    /// Bus object the port is published at, if it was bound
    pub object_path: Option<String>,

    /// Bus client that connected the port
    pub owner: Option<String>,

    pub(crate) transport: Option<Box<dyn SerialTransport>>,
    pub(crate) liveness_watch: Option<Subscription>,
    pub(crate) hangup_watch: Option<Subscription>,
}

impl Session {
    pub(crate) fn new(
        serial: u64,
        id: DeviceId,
        local: BdAddr,
        peer: BdAddr,
        device: impl Into<String>,
        service_name: impl Into<String>,
    ) -> Self {
        Self {
            serial,
            id,
            local,
            peer,
            device: device.into(),
            service_name: service_name.into(),
            object_path: None,
            owner: None,
            transport: None,
            liveness_watch: None,
            hangup_watch: None,
        }
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn has_transport(&self) -> bool {
        self.transport.is_some()
    }

    /// Both watches installed
    pub fn is_watched(&self) -> bool {
        self.liveness_watch.is_some() && self.hangup_watch.is_some()
    }

    pub fn summary(&self, collection: Collection) -> SessionSummary {
        SessionSummary {
            id: self.id,
            state: collection,
            device: self.device.clone(),
            local: self.local,
            peer: self.peer,
            service_name: self.service_name.clone(),
            object_path: self.object_path.clone(),
            owner: self.owner.clone(),
        }
    }
}

/// Serializable snapshot of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub id: DeviceId,
    pub state: Collection,
    pub device: String,
    pub local: BdAddr,
    pub peer: BdAddr,
    pub service_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_is_bare() {
        let session = Session::new(
            1,
            DeviceId(0),
            BdAddr::ANY,
            BdAddr::ANY,
            "/dev/rfcomm0",
            "OBEX",
        );

        assert_eq!(session.serial(), 1);
        assert!(session.owner.is_none());
        assert!(!session.has_transport());
        assert!(!session.is_watched());
    }

    #[test]
    fn summary_serialize() {
        let mut session = Session::new(
            3,
            DeviceId(2),
            BdAddr::ANY,
            "00:11:22:33:44:55".parse().unwrap(),
            "/dev/rfcomm2",
            "Serial Port",
        );
        session.owner = Some(":1.5".to_string());

        let json = serde_json::to_value(session.summary(Collection::Connected)).unwrap();
        assert_eq!(json["state"], "connected");
        assert_eq!(json["id"], 2);
        assert_eq!(json["peer"], "00:11:22:33:44:55");
        assert_eq!(json["owner"], ":1.5");
        assert!(json.get("object_path").is_none());
    }
}
