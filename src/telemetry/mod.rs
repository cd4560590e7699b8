//! Telemetry channel data model and the OTA event publisher.
//!
//! The device client itself (connection, credentials, wire protocol) lives
//! outside this crate; everything here speaks in terms of *aggregate
//! objects* — named, typed fields sent atomically with one timestamp —
//! which is the unit both directions of the channel use.

pub mod object;
pub mod publisher;

/// Interface carrying inbound OTA commands.
pub const OTA_REQUEST_INTERFACE: &str = "io.outpost.fleet.OTARequest";
/// Interface carrying outbound OTA status events.
pub const OTA_EVENT_INTERFACE: &str = "io.outpost.fleet.OTAEvent";
/// Path under [`OTA_EVENT_INTERFACE`] for status events.
pub const OTA_EVENT_PATH: &str = "/event";
