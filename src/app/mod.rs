//! Application core — pure domain logic, zero I/O.
//!
//! This module contains the business rules for the Outpost agent: the OTA
//! state machine with its persistent record, bounded retries, cooperative
//! cancellation, and boot-time reconciliation.  All interaction with the
//! platform happens through **port traits** defined in [`ports`], keeping
//! this layer fully testable without real flash, bootloader, or network.

pub mod commands;
pub mod events;
pub mod ota;
pub mod ports;
