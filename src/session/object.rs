//! Read-only query handlers published for each port

use super::state::Session;
use crate::bus::{InterfaceSpec, MethodSpec, NameResolver};
use crate::error::{SerialBusError, SerialBusResult};
use serde::Serialize;
use std::collections::BTreeMap;

/// Interface carried by every port object
pub const PORT_INTERFACE: &str = "org.bluez.serial.Port";

/// Interface of the manager object, which emits `ServiceDisconnected`
pub const MANAGER_INTERFACE: &str = "org.bluez.serial.Manager";

pub const SERVICE_DISCONNECTED: &str = "ServiceDisconnected";

const fn query(name: &'static str, output: &'static str) -> MethodSpec {
    MethodSpec {
        name,
        input: "",
        output,
    }
}

const PORT_METHODS: &[MethodSpec] = &[
    query("GetAddress", "s"),
    query("GetDevice", "s"),
    query("GetAdapter", "s"),
    query("GetName", "s"),
    query("GetServiceName", "s"),
    query("GetInfo", "a{sv}"),
];

pub const PORT_INTERFACE_SPEC: InterfaceSpec = InterfaceSpec {
    name: PORT_INTERFACE,
    methods: PORT_METHODS,
};

/// Reply to a port method call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum MethodReply {
    Str(String),
    Dict(BTreeMap<String, String>),
}

/// A session as seen through the port interface
pub struct PortObject<'a> {
    session: &'a Session,
    names: &'a dyn NameResolver,
}

impl<'a> PortObject<'a> {
    pub fn new(session: &'a Session, names: &'a dyn NameResolver) -> Self {
        Self { session, names }
    }

    /// Remote device address
    pub fn address(&self) -> String {
        self.session.peer.to_string()
    }

    pub fn device(&self) -> String {
        self.session.device.clone()
    }

    /// Local adapter address
    pub fn adapter(&self) -> String {
        self.session.local.to_string()
    }

    /// Remote device name, or empty if the address book has none
    pub fn name(&self) -> String {
        self.names
            .device_name(&self.session.local, &self.session.peer)
            .unwrap_or_default()
    }

    pub fn service_name(&self) -> String {
        self.session.service_name.clone()
    }

    pub fn info(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("device".to_string(), self.device()),
            ("address".to_string(), self.address()),
        ])
    }

    /// Dispatch a method call by name
    pub fn call(&self, method: &str) -> SerialBusResult<MethodReply> {
        let reply = match method {
            "GetAddress" => MethodReply::Str(self.address()),
            "GetDevice" => MethodReply::Str(self.device()),
            "GetAdapter" => MethodReply::Str(self.adapter()),
            "GetName" => MethodReply::Str(self.name()),
            "GetServiceName" => MethodReply::Str(self.service_name()),
            "GetInfo" => MethodReply::Dict(self.info()),
            _ => {
                return Err(SerialBusError::UnknownMethod {
                    interface: PORT_INTERFACE.to_string(),
                    method: method.to_string(),
                })
            }
        };
        Ok(reply)
    }
}
