//! Agent configuration parameters
//!
//! All tunable timing and retry parameters for the Outpost agent.
//! Values can be overridden via NVS; defaults are the contract values the
//! backend relies on (the linear back-off keeps a failed download bounded
//! at ~20 s of waiting across five attempts).

use serde::{Deserialize, Serialize};

/// Core agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    // --- Task cadence ---
    /// Telemetry device client poll interval (milliseconds)
    pub telemetry_poll_interval_ms: u32,
    /// Agent task tick interval (milliseconds)
    pub agent_tick_interval_ms: u32,

    // --- OTA ---
    /// Wall-clock bound on one whole download attempt (milliseconds)
    pub ota_request_timeout_ms: u32,
    /// Maximum download attempts per update
    pub ota_max_retries: u8,
    /// Linear back-off unit between attempts: attempt index times this
    pub ota_retry_delay_ms: u32,
    /// Grace period between the Rebooting event and the warm reboot
    pub ota_reboot_delay_ms: u32,

    // --- Diagnostics ---
    /// Agent ticks between runtime-metrics log lines
    pub metrics_log_period_ticks: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            // Task cadence
            telemetry_poll_interval_ms: 100,
            agent_tick_interval_ms: 500,

            // OTA
            ota_request_timeout_ms: 60_000, // one GET per attempt
            ota_max_retries: 5,
            ota_retry_delay_ms: 2_000,
            ota_reboot_delay_ms: 5_000,

            // Diagnostics
            metrics_log_period_ticks: 60, // ~30 s at the default tick
        }
    }
}

/// Validate a configuration before persisting it.
///
/// Invalid values are rejected, not clamped: a compromised management
/// channel must not be able to disable the retry bound or stretch the
/// reboot window indefinitely.
pub fn validate_config(cfg: &AgentConfig) -> core::result::Result<(), &'static str> {
    if !(10..=10_000).contains(&cfg.telemetry_poll_interval_ms) {
        return Err("telemetry_poll_interval_ms must be 10-10000");
    }
    if !(10..=10_000).contains(&cfg.agent_tick_interval_ms) {
        return Err("agent_tick_interval_ms must be 10-10000");
    }
    if !(1_000..=600_000).contains(&cfg.ota_request_timeout_ms) {
        return Err("ota_request_timeout_ms must be 1000-600000");
    }
    if !(1..=10).contains(&cfg.ota_max_retries) {
        return Err("ota_max_retries must be 1-10");
    }
    if cfg.ota_retry_delay_ms > 30_000 {
        return Err("ota_retry_delay_ms must be <= 30000");
    }
    if cfg.ota_reboot_delay_ms > 60_000 {
        return Err("ota_reboot_delay_ms must be <= 60000");
    }
    if cfg.metrics_log_period_ticks == 0 {
        return Err("metrics_log_period_ticks must be > 0");
    }
    Ok(())
}
