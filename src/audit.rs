//! Audit trail of port lifecycle events
//!
//! Each event is appended as one JSON line to
//! `~/.local/state/serialbus/audit.log` when `general.audit_log` is on.

use crate::bus::{DeviceId, Trigger};
use crate::config::{schema::Config, ConfigManager};
use crate::session::TeardownCause;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// A port lifecycle change worth keeping a record of
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum AuditEvent {
    Bound {
        id: DeviceId,
        device: String,
        path: String,
    },
    Connected {
        id: DeviceId,
        device: String,
        owner: String,
    },
    Disconnected {
        device: String,
        cause: TeardownCause,
    },
    Unregistered {
        path: String,
    },
    /// Connected ports torn down in bulk
    Released {
        count: usize,
        cause: TeardownCause,
    },
}

impl AuditEvent {
    /// A connected port ended because one of its watches fired
    pub fn watch_fired(device: impl Into<String>, trigger: Trigger) -> Self {
        Self::Disconnected {
            device: device.into(),
            cause: trigger.into(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Bound { .. } => "port.bound",
            Self::Connected { .. } => "port.connected",
            Self::Disconnected { .. } => "port.disconnected",
            Self::Unregistered { .. } => "port.unregistered",
            Self::Released { .. } => "port.released",
        }
    }
}

#[derive(Serialize)]
struct AuditRecord<'a> {
    timestamp: DateTime<Utc>,
    event: &'static str,
    data: &'a AuditEvent,
}

/// Appends audit events to a file
pub struct AuditLog {
    enabled: bool,
    path: PathBuf,
}

impl AuditLog {
    pub fn new(config: &Config) -> Self {
        Self::with_path(config.general.audit_log, ConfigManager::audit_log_path())
    }

    pub fn with_path(enabled: bool, path: PathBuf) -> Self {
        Self { enabled, path }
    }

    /// A logger that records nothing
    pub fn disabled() -> Self {
        Self::with_path(false, PathBuf::new())
    }

    /// Record `event`. Failures are logged and never reach the request
    /// being audited.
    pub async fn record(&self, event: &AuditEvent) {
        if !self.enabled {
            return;
        }

        let record = AuditRecord {
            timestamp: Utc::now(),
            event: event.name(),
            data: event,
        };
        let mut line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to serialize {} audit event: {}", event.name(), e);
                return;
            }
        };
        line.push('\n');

        if let Err(e) = self.append(&line).await {
            warn!("Failed to write audit log {}: {}", self.path.display(), e);
        }
    }

    async fn append(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await
    }
}
