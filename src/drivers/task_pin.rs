//! Core-pinned thread spawning for ESP32 dual-core parts.
//!
//! Wraps `esp_pthread_set_cfg()` so that `std::thread::spawn` creates a
//! FreeRTOS task pinned to a specific CPU core with explicit priority
//! and stack size. On non-ESP targets, falls back to plain thread spawn.
//!
//! # ESP-IDF Threading Model
//!
//! ESP-IDF implements `std::thread` via pthreads, which are thin wrappers
//! around FreeRTOS tasks. `esp_pthread_set_cfg()` sets thread-local
//! configuration that applies to the *next* `pthread_create()` call from
//! the calling thread. This means the config→spawn pair must not be
//! interleaved with other thread creation on the same thread.

use std::io;

/// CPU core identifiers for dual-core ESP32 family parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Core {
    /// Core 0 (PRO_CPU) — protocol stacks (WiFi, lwIP).
    Pro = 0,
    /// Core 1 (APP_CPU) — application logic.
    App = 1,
}

/// Spawn a thread pinned to a specific core with explicit priority and stack.
///
/// On ESP-IDF, uses `esp_pthread_set_cfg()` to configure core affinity,
/// priority, and stack size before `std::thread::spawn`. The `name` parameter
/// must be a null-terminated string (e.g. `"ota-worker\0"`).
///
/// On non-ESP targets, ignores `core` and `priority`, using only `stack_kb`.
///
/// Spawn failures are returned, not asserted: the OTA engine reports them
/// to the backend as a failed update rather than halting the agent.
#[cfg(target_os = "espidf")]
pub fn spawn_on_core(
    core: Core,
    priority: u8,
    stack_kb: usize,
    name: &'static str,
    f: impl FnOnce() + Send + 'static,
) -> io::Result<std::thread::JoinHandle<()>> {
    unsafe {
        let mut cfg = esp_idf_svc::sys::esp_create_default_pthread_config();
        cfg.pin_to_core = core as i32;
        cfg.prio = priority as i32;
        cfg.stack_size = (stack_kb * 1024) as i32;
        cfg.thread_name = name.as_ptr() as *const _;
        let ret = esp_idf_svc::sys::esp_pthread_set_cfg(&cfg);
        if ret != esp_idf_svc::sys::ESP_OK as i32 {
            return Err(io::Error::other(format!(
                "esp_pthread_set_cfg failed: {ret}"
            )));
        }
    }

    let display_name = name.trim_end_matches('\0');
    log::info!(
        "Spawning '{}' on {:?} (pri={}, stack={}KB)",
        display_name,
        core,
        priority,
        stack_kb
    );

    std::thread::Builder::new().name(display_name.into()).spawn(f)
}

/// Simulation fallback — ignores core affinity and priority.
#[cfg(not(target_os = "espidf"))]
pub fn spawn_on_core(
    _core: Core,
    _priority: u8,
    stack_kb: usize,
    name: &'static str,
    f: impl FnOnce() + Send + 'static,
) -> io::Result<std::thread::JoinHandle<()>> {
    let display_name = name.trim_end_matches('\0');
    log::debug!(
        "Spawning '{}' (sim, no core pinning, stack={}KB)",
        display_name,
        stack_kb
    );

    std::thread::Builder::new()
        .name(display_name.into())
        .stack_size(stack_kb * 1024)
        .spawn(f)
}
