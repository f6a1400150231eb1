//! Embedder-supplied configuration. No global mutable configuration state
//! lives in this crate: a [`XhciConfig`] is built by the embedder and
//! handed to `Controller::new`.

/// Bounded-wait and policy knobs for a [`crate::controller::Controller`].
///
/// Defaults match the bounded-wait values named throughout the core's
/// lifecycle and concurrency design.
#[derive(Debug, Clone, Copy)]
pub struct XhciConfig {
    /// Upper bound for a Command Ring submit-and-wait, in milliseconds.
    pub command_timeout_ms: u32,
    /// Upper bound for a Transfer Ring submit-and-wait, in milliseconds.
    pub transfer_timeout_ms: u32,
    /// Settle time after powering up a port before polling CCS, in milliseconds.
    pub port_power_settle_ms: u32,
    /// Upper bound for BIOS-to-OS ownership handoff polling, in milliseconds.
    pub bios_handoff_timeout_ms: u32,
    /// Whether to allocate and program the scratchpad buffer array
    /// (`HCSPARAMS2.Max Scratchpad Bufs`). Some controllers report zero and
    /// need none; an embedder short on DMA-capable memory may also disable
    /// this when it knows the controller doesn't require it.
    pub use_scratchpad_buffers: bool,
    /// Emit `trace`-level TRB dumps on every ring enqueue/dequeue. Off by
    /// default; enabling it on a busy controller is expensive.
    pub trace_trbs: bool,
}

impl Default for XhciConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: 120,
            transfer_timeout_ms: 400,
            port_power_settle_ms: 20,
            bios_handoff_timeout_ms: 5_000,
            use_scratchpad_buffers: true,
            trace_trbs: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_enable_scratchpad_buffers_and_disable_tracing() {
        let config = XhciConfig::default();
        assert!(config.use_scratchpad_buffers);
        assert!(!config.trace_trbs);
        assert!(config.command_timeout_ms > 0);
        assert!(config.transfer_timeout_ms > 0);
        assert!(config.port_power_settle_ms > 0);
        assert!(config.bios_handoff_timeout_ms > 0);
    }
}
