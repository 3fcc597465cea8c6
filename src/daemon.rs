//! Line-oriented port daemon
//!
//! Hosts a `PortManager` on the in-process bus and drives it from JSON
//! requests, one per line. A single task owns the manager: requests and
//! fired watches are handled one at a time, in arrival order.
//!
//! ```text
//! {"op":"bind","id":0,"service":"OBEX"}
//! {"op":"connect","device":"/dev/rfcomm0","owner":"org.client.Z"}
//! {"op":"disconnect","owner":"org.client.Z","device":"/dev/rfcomm0"}
//! ```

use crate::address::BdAddr;
use crate::audit::{AuditEvent, AuditLog};
use crate::bus::{
    BusSignal, DeviceId, LocalAllocator, LocalBus, LocalLiveness, LocalNames, LocalTransport,
    TransportProbe, WatchEvent,
};
use crate::config::Config;
use crate::error::{SerialBusError, SerialBusResult};
use crate::session::{
    BindRequest, Collaborators, Collection, ConnectRequest, PortManager, TeardownCause,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// A request read from the input stream
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum Request {
    /// Publish a port; id and device are picked when omitted
    Bind {
        id: Option<i16>,
        #[serde(default)]
        local: BdAddr,
        #[serde(default)]
        peer: BdAddr,
        device: Option<String>,
        service: Option<String>,
    },
    /// Attach a peer connection, promoting a bound port on the same device
    Connect {
        id: Option<i16>,
        device: Option<String>,
        #[serde(default)]
        peer: BdAddr,
        owner: String,
    },
    Disconnect {
        owner: String,
        device: String,
    },
    Unregister {
        path: String,
    },
    /// Invoke a port query method
    Call {
        path: String,
        method: String,
    },
    /// Add an address book entry
    SetName {
        local: BdAddr,
        peer: BdAddr,
        name: String,
    },
    /// Simulate a bus client leaving the bus
    PeerExit {
        owner: String,
    },
    /// Simulate the link of a connected port dropping
    Hangup {
        device: String,
    },
    List,
    ReleaseAll,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
    retryable: bool,
}

#[derive(Debug, Serialize)]
struct Reply {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorBody>,
}

impl From<SerialBusResult<Value>> for Reply {
    fn from(result: SerialBusResult<Value>) -> Self {
        match result {
            Ok(value) => Reply {
                ok: true,
                result: Some(value),
                error: None,
            },
            Err(e) => Reply {
                ok: false,
                result: None,
                error: Some(ErrorBody {
                    code: e.code(),
                    message: e.to_string(),
                    retryable: e.is_retryable(),
                }),
            },
        }
    }
}

/// The manager plus the simulated world around it
pub struct Daemon {
    manager: PortManager,
    events: mpsc::UnboundedReceiver<WatchEvent>,
    signals: broadcast::Receiver<BusSignal>,
    bus: Arc<LocalBus>,
    liveness: Arc<LocalLiveness>,
    allocator: Arc<LocalAllocator>,
    names: Arc<LocalNames>,
    transports: HashMap<String, TransportProbe>,
    audit: AuditLog,
}

impl Daemon {
    pub fn new(config: &Config, audit: AuditLog) -> Self {
        let bus = Arc::new(LocalBus::new(
            config.bus.max_objects,
            config.bus.signal_capacity,
        ));
        let liveness = Arc::new(LocalLiveness::new());
        let allocator = Arc::new(LocalAllocator::new(config.serial.max_devices));
        let names = Arc::new(LocalNames::new());

        let collab = Collaborators {
            bus: bus.clone(),
            liveness: liveness.clone(),
            allocator: allocator.clone(),
            names: names.clone(),
        };
        let signals = bus.subscribe();
        let (manager, events) = PortManager::new(&config.serial, collab);

        Self {
            manager,
            events,
            signals,
            bus,
            liveness,
            allocator,
            names,
            transports: HashMap::new(),
            audit,
        }
    }

    /// Serve requests until the input ends, then release every connected
    /// port.
    pub async fn run<R, W>(mut self, input: R, mut output: W) -> SerialBusResult<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = input.lines();
        info!("Serial port daemon ready");

        loop {
            tokio::select! {
                biased;
                Some(event) = self.events.recv() => {
                    self.on_watch_event(event).await;
                    self.flush_signals(&mut output).await?;
                }
                line = lines.next_line() => {
                    let line = line.map_err(|e| SerialBusError::io("reading request", e))?;
                    let Some(line) = line else { break };
                    if line.trim().is_empty() {
                        continue;
                    }

                    let reply = Reply::from(self.handle_line(&line).await);
                    self.drain_events().await;
                    self.flush_signals(&mut output).await?;
                    write_line(&mut output, &reply).await?;
                }
            }
        }

        self.drain_events().await;
        let released = self.manager.release_all();
        if released > 0 {
            info!("Released {} connected port(s) on shutdown", released);
            self.audit
                .record(&AuditEvent::Released {
                    count: released,
                    cause: TeardownCause::Shutdown,
                })
                .await;
        }
        debug!("{} bus object(s) left published", self.bus.object_count());
        self.flush_signals(&mut output).await?;
        output
            .flush()
            .await
            .map_err(|e| SerialBusError::io("flushing output", e))
    }

    async fn handle_line(&mut self, line: &str) -> SerialBusResult<Value> {
        let request: Request = serde_json::from_str(line)
            .map_err(|e| SerialBusError::InvalidRequest(e.to_string()))?;
        debug!("Request: {:?}", request);
        self.handle(request).await
    }

    /// Handle one request
    pub async fn handle(&mut self, request: Request) -> SerialBusResult<Value> {
        match request {
            Request::Bind {
                id,
                local,
                peer,
                device,
                service,
            } => {
                let id = self.take_id(id)?;
                let device = device.unwrap_or_else(|| format!("/dev/rfcomm{}", id));
                let path = self.manager.bind(BindRequest {
                    id,
                    local,
                    peer,
                    device: device.clone(),
                    service_name: service,
                })?;
                let result = json!({ "path": path, "device": device, "id": id });
                self.audit
                    .record(&AuditEvent::Bound { id, device, path })
                    .await;
                Ok(result)
            }
            Request::Connect {
                id,
                device,
                peer,
                owner,
            } => {
                // A bound port is promoted under its own id. Without unique
                // device paths the connection gets an id of its own.
                let registry = self.manager.registry();
                let bound_id = device
                    .as_deref()
                    .filter(|_| registry.unique_devices())
                    .and_then(|d| registry.find(Collection::Bound, d))
                    .map(|s| s.id);
                let id = match (bound_id, id) {
                    (Some(bound), Some(requested)) if bound.0 != requested => {
                        return Err(SerialBusError::DeviceInUse(format!(
                            "{} is bound to rfcomm id {}",
                            device.unwrap_or_default(),
                            bound
                        )));
                    }
                    (Some(bound), _) => bound,
                    (None, requested) => self.take_id(requested)?,
                };
                let device = device.unwrap_or_else(|| format!("/dev/rfcomm{}", id));
                let (transport, probe) = LocalTransport::open(&device);

                self.manager.connect(ConnectRequest {
                    id,
                    peer,
                    transport: Box::new(transport),
                    device: device.clone(),
                    owner: owner.clone(),
                })?;
                self.transports.insert(device.clone(), probe);

                let result = json!({ "device": device, "id": id, "owner": owner });
                self.audit
                    .record(&AuditEvent::Connected { id, device, owner })
                    .await;
                Ok(result)
            }
            Request::Disconnect { owner, device } => {
                self.manager.disconnect(&owner, &device)?;
                self.transports.remove(&device);
                let result = json!({ "device": device });
                self.audit
                    .record(&AuditEvent::Disconnected {
                        device,
                        cause: TeardownCause::Disconnected,
                    })
                    .await;
                Ok(result)
            }
            Request::Unregister { path } => {
                self.manager.unregister(&path)?;
                let result = json!({ "path": path });
                self.audit.record(&AuditEvent::Unregistered { path }).await;
                Ok(result)
            }
            Request::Call { path, method } => {
                let reply = self.manager.object(&path)?.call(&method)?;
                Ok(serde_json::to_value(reply)?)
            }
            Request::SetName { local, peer, name } => {
                self.names.insert(local, peer, name);
                Ok(Value::Null)
            }
            Request::PeerExit { owner } => {
                let fired = self.liveness.peer_exited(&owner);
                Ok(json!({ "watches": fired }))
            }
            Request::Hangup { device } => {
                let probe = self
                    .transports
                    .get(&device)
                    .ok_or_else(|| SerialBusError::NotFound(device.clone()))?;
                Ok(json!({ "hung_up": probe.hangup() }))
            }
            Request::List => Ok(serde_json::to_value(self.manager.list())?),
            Request::ReleaseAll => {
                let count = self.manager.release_all();
                self.transports.clear();
                self.audit
                    .record(&AuditEvent::Released {
                        count,
                        cause: TeardownCause::Shutdown,
                    })
                    .await;
                Ok(json!({ "released": count }))
            }
        }
    }

    /// Use the requested id or allocate the lowest free one
    fn take_id(&self, requested: Option<i16>) -> SerialBusResult<DeviceId> {
        match requested {
            Some(id) => {
                self.allocator.claim(DeviceId(id))?;
                Ok(DeviceId(id))
            }
            None => self.allocator.allocate(),
        }
    }

    async fn on_watch_event(&mut self, event: WatchEvent) {
        let device = event.device.clone();
        let trigger = event.trigger;
        if self.manager.handle_watch_event(event) {
            self.transports.remove(&device);
            self.audit
                .record(&AuditEvent::watch_fired(device, trigger))
                .await;
        }
    }

    async fn drain_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.on_watch_event(event).await;
        }
    }

    async fn flush_signals<W>(&mut self, output: &mut W) -> SerialBusResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        loop {
            match self.signals.try_recv() {
                Ok(signal) => write_line(output, &json!({ "signal": signal })).await?,
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    warn!("Dropped {} bus signals", missed);
                }
                Err(_) => return Ok(()),
            }
        }
    }
}

async fn write_line<W, T>(output: &mut W, value: &T) -> SerialBusResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    output
        .write_all(line.as_bytes())
        .await
        .map_err(|e| SerialBusError::io("writing reply", e))?;
    output
        .flush()
        .await
        .map_err(|e| SerialBusError::io("flushing output", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run_lines(config: &Config, input: &str) -> Vec<Value> {
        let daemon = Daemon::new(config, AuditLog::disabled());
        let mut out = Vec::new();
        daemon.run(input.as_bytes(), &mut out).await.unwrap();

        String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn parses_requests() {
        let req: Request = serde_json::from_str(
            r#"{"op":"bind","id":1,"local":"00:11:22:33:44:55","service":"OBEX"}"#,
        )
        .unwrap();
        match req {
            Request::Bind {
                id, local, peer, ..
            } => {
                assert_eq!(id, Some(1));
                assert_eq!(local.to_string(), "00:11:22:33:44:55");
                assert!(peer.is_any());
            }
            other => panic!("unexpected request: {other:?}"),
        }

        let req: Request = serde_json::from_str(r#"{"op":"release-all"}"#).unwrap();
        assert_eq!(req, Request::ReleaseAll);
        assert!(serde_json::from_str::<Request>(r#"{"op":"reboot"}"#).is_err());
    }

    #[tokio::test]
    async fn obex_session_over_the_wire() {
        let input = [
            r#"{"op":"bind","device":"/dev/rfcomm0","id":0,"service":"OBEX"}"#,
            r#"{"op":"connect","device":"/dev/rfcomm0","owner":"org.client.Z"}"#,
            r#"{"op":"disconnect","owner":"org.client.Y","device":"/dev/rfcomm0"}"#,
            r#"{"op":"disconnect","owner":"org.client.Z","device":"/dev/rfcomm0"}"#,
        ]
        .join("\n");

        let out = run_lines(&Config::default(), &input).await;
        assert_eq!(out.len(), 5);
        assert_eq!(out[0]["result"]["path"], "/org/bluez/serial/rfcomm0");
        assert_eq!(out[1]["ok"], true);
        assert_eq!(out[2]["error"]["code"], "forbidden");
        assert_eq!(out[3]["signal"]["member"], "ServiceDisconnected");
        assert_eq!(out[3]["signal"]["args"][0], "/dev/rfcomm0");
        assert_eq!(out[4]["ok"], true);
    }

    #[tokio::test]
    async fn hangup_signal_precedes_reply() {
        let input = [
            r#"{"op":"connect","owner":":1.3"}"#,
            r#"{"op":"hangup","device":"/dev/rfcomm0"}"#,
            r#"{"op":"list"}"#,
        ]
        .join("\n");

        let out = run_lines(&Config::default(), &input).await;
        assert_eq!(out[0]["result"]["device"], "/dev/rfcomm0");
        assert_eq!(out[1]["signal"]["args"][0], "/dev/rfcomm0");
        assert_eq!(out[2]["result"]["hung_up"], true);
        assert_eq!(out[3]["result"], json!([]));
    }

    #[tokio::test]
    async fn peer_exit_releases_port() {
        let input = [
            r#"{"op":"connect","owner":"org.client.Z"}"#,
            r#"{"op":"peer-exit","owner":"org.client.Z"}"#,
            r#"{"op":"connect","owner":"org.client.Z"}"#,
        ]
        .join("\n");

        let out = run_lines(&Config::default(), &input).await;
        assert_eq!(out[1]["signal"]["member"], "ServiceDisconnected");
        assert_eq!(out[2]["result"]["watches"], 1);
        // Id 0 was released and handed out again
        assert_eq!(out[3]["result"]["id"], 0);
        // Shutdown releases the second connection
        assert_eq!(out[4]["signal"]["args"][0], "/dev/rfcomm0");
        assert_eq!(out.len(), 5);
    }

    #[tokio::test]
    async fn queries_and_errors() {
        let input = [
            r#"{"op":"set-name","local":"00:11:22:33:44:55","peer":"AA:BB:CC:DD:EE:FF","name":"Phone"}"#,
            r#"{"op":"bind","id":2,"local":"00:11:22:33:44:55","peer":"AA:BB:CC:DD:EE:FF"}"#,
            r#"{"op":"call","path":"/org/bluez/serial/rfcomm2","method":"GetName"}"#,
            r#"{"op":"call","path":"/org/bluez/serial/rfcomm2","method":"GetInfo"}"#,
            r#"{"op":"call","path":"/org/bluez/serial/rfcomm2","method":"Explode"}"#,
            r#"{"op":"unregister","path":"/org/bluez/serial/rfcomm2"}"#,
            r#"{"op":"unregister","path":"/org/bluez/serial/rfcomm2"}"#,
            "not json",
        ]
        .join("\n");

        let out = run_lines(&Config::default(), &input).await;
        assert_eq!(out.len(), 8);
        assert_eq!(out[2]["result"], "Phone");
        assert_eq!(out[3]["result"]["device"], "/dev/rfcomm2");
        assert_eq!(out[3]["result"]["address"], "AA:BB:CC:DD:EE:FF");
        assert_eq!(out[4]["error"]["code"], "unknown-method");
        assert_eq!(out[5]["ok"], true);
        assert_eq!(out[6]["error"]["code"], "not-found");
        assert_eq!(out[7]["error"]["code"], "invalid-request");
    }

    #[tokio::test]
    async fn bus_exhaustion_is_registration_failure() {
        let mut config = Config::default();
        config.bus.max_objects = 1;
        let input = [r#"{"op":"bind"}"#, r#"{"op":"bind"}"#, r#"{"op":"bind"}"#].join("\n");

        let out = run_lines(&config, &input).await;
        assert_eq!(out[0]["result"]["id"], 0);
        assert_eq!(out[1]["error"]["code"], "registration-failure");
        // The failed bind gave id 1 back
        assert_eq!(out[2]["error"]["code"], "registration-failure");
        assert!(out[2]["error"]["message"]
            .as_str()
            .unwrap()
            .contains("/org/bluez/serial/rfcomm1"));
    }

    #[tokio::test]
    async fn connect_with_other_id_than_bound_port_is_rejected() {
        let input = [
            r#"{"op":"bind","id":0,"device":"/dev/rfcomm0"}"#,
            r#"{"op":"connect","id":3,"device":"/dev/rfcomm0","owner":":1.1"}"#,
            r#"{"op":"connect","id":3,"device":"/dev/rfcomm3","owner":":1.1"}"#,
            r#"{"op":"list"}"#,
        ]
        .join("\n");

        let out = run_lines(&Config::default(), &input).await;
        assert_eq!(out[1]["error"]["code"], "device-in-use");
        assert_eq!(out[1]["error"]["retryable"], false);
        // Id 3 was never claimed by the rejected request
        assert_eq!(out[2]["result"]["id"], 3);

        let list = out[3]["result"].as_array().unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0]["device"], "/dev/rfcomm0");
        assert_eq!(list[0]["state"], "bound");
    }

    #[tokio::test]
    async fn connect_with_matching_id_promotes() {
        let input = [
            r#"{"op":"bind","id":2,"device":"/dev/rfcomm2"}"#,
            r#"{"op":"connect","id":2,"device":"/dev/rfcomm2","owner":":1.1"}"#,
            r#"{"op":"list"}"#,
        ]
        .join("\n");

        let out = run_lines(&Config::default(), &input).await;
        assert_eq!(out[1]["result"]["id"], 2);
        let list = out[2]["result"].as_array().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0]["state"], "connected");
        assert_eq!(list[0]["object_path"], "/org/bluez/serial/rfcomm2");
    }

    #[tokio::test]
    async fn permissive_connect_gets_its_own_id() {
        let mut config = Config::default();
        config.serial.unique_devices = false;
        let input = [
            r#"{"op":"bind","id":0,"device":"/dev/rfcomm0"}"#,
            r#"{"op":"connect","device":"/dev/rfcomm0","owner":":1.1"}"#,
            r#"{"op":"connect","id":0,"device":"/dev/rfcomm0","owner":":1.2"}"#,
            r#"{"op":"disconnect","owner":":1.1","device":"/dev/rfcomm0"}"#,
            r#"{"op":"bind"}"#,
            r#"{"op":"list"}"#,
        ]
        .join("\n");

        let out = run_lines(&config, &input).await;
        assert_eq!(out[1]["result"]["id"], 1);
        assert_eq!(out[2]["error"]["code"], "device-in-use");
        let replies: Vec<&Value> = out.iter().filter(|v| v.get("ok").is_some()).collect();
        assert_eq!(replies[3]["ok"], true);
        // Id 0 still belongs to the bound port, so the freed id 1 is reused
        assert_eq!(replies[4]["result"]["id"], 1);

        let list = replies[5]["result"].as_array().unwrap();
        assert_eq!(list.len(), 2);
        assert!(list.iter().all(|s| s["state"] == "bound"));
    }

    #[tokio::test]
    async fn exhaustion_is_retryable() {
        let mut config = Config::default();
        config.serial.max_devices = 1;
        let input = [r#"{"op":"bind"}"#, r#"{"op":"bind"}"#].join("\n");

        let out = run_lines(&config, &input).await;
        assert_eq!(out[1]["error"]["code"], "no-free-device");
        assert_eq!(out[1]["error"]["retryable"], true);
    }

    #[tokio::test]
    async fn release_all_keeps_bound_ports() {
        let input = [
            r#"{"op":"bind","id":0}"#,
            r#"{"op":"connect","id":1,"owner":":1.1"}"#,
            r#"{"op":"connect","id":2,"owner":":1.2"}"#,
            r#"{"op":"release-all"}"#,
            r#"{"op":"list"}"#,
        ]
        .join("\n");

        let out = run_lines(&Config::default(), &input).await;
        let signals: Vec<&Value> = out.iter().filter(|v| v.get("signal").is_some()).collect();
        assert_eq!(signals.len(), 2);

        let reply = out.iter().find(|v| v["result"]["released"].is_number()).unwrap();
        assert_eq!(reply["result"]["released"], 2);

        let list = out.last().unwrap()["result"].as_array().unwrap().clone();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0]["state"], "bound");
    }
}
