//! Serve command - run the port daemon on stdin/stdout

use crate::audit::AuditLog;
use crate::cli::args::ServeArgs;
use crate::config::Config;
use crate::daemon::Daemon;
use crate::error::SerialBusResult;
use tokio::io::BufReader;
use tracing::debug;

/// Execute the serve command
pub async fn execute(args: ServeArgs, config: &Config) -> SerialBusResult<()> {
    let mut config = config.clone();
    if args.permissive {
        debug!("Device path uniqueness disabled (--permissive)");
        config.serial.unique_devices = false;
    }
    if args.audit {
        config.general.audit_log = true;
    }

    let daemon = Daemon::new(&config, AuditLog::new(&config));
    daemon
        .run(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
        .await
}
