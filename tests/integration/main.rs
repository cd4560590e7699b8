//! Host-side integration tests for the OTA engine.
//!
//! These drive the real engine — worker thread, retry loop, run token,
//! persisted record — against scripted mock ports, and assert on the full
//! externally visible event traces.

#![cfg(not(target_os = "espidf"))]

mod mock_ports;

mod ota_flow_tests;
mod reconcile_tests;
