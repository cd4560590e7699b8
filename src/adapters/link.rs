//! Telemetry channel adapters.
//!
//! The real device client (broker connection, credentials, wire protocol)
//! is a separate component; these adapters are its integration points:
//!
//! - [`LogTelemetryLink`] streams every outbound aggregate to the logger —
//!   the development/simulation sink, and the shape a wire-backed link
//!   implements.
//! - [`NullTelemetryDevice`] is the inbound half with no traffic, useful
//!   until the real client is wired up.

use log::info;

use crate::app::ports::{InboundMessage, TelemetryDevice, TelemetryLink};
use crate::error::TelemetryError;
use crate::telemetry::object::ObjectEntry;

/// Adapter that logs every outbound aggregate.
pub struct LogTelemetryLink;

impl LogTelemetryLink {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LogTelemetryLink {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryLink for LogTelemetryLink {
    fn stream_aggregate(
        &self,
        interface: &str,
        path: &str,
        entries: &[ObjectEntry],
        timestamp: i64,
    ) -> Result<(), TelemetryError> {
        let mut fields = String::new();
        for entry in entries {
            if !fields.is_empty() {
                fields.push_str(", ");
            }
            fields.push_str(&format!("{}={:?}", entry.path, entry.value));
        }
        info!("TELEM | {}{} @{} | {}", interface, path, timestamp, fields);
        Ok(())
    }
}

/// A device client that is never connected and never delivers commands.
pub struct NullTelemetryDevice;

impl TelemetryDevice for NullTelemetryDevice {
    fn connect(&mut self) -> Result<(), TelemetryError> {
        info!("Telemetry device connected (null backend)");
        Ok(())
    }

    fn poll(&mut self) -> Result<Option<InboundMessage>, TelemetryError> {
        Ok(None)
    }
}
