//! Execution control
//!
//! The per-generation sandboxed child, the loop that drives it, and the
//! harness interface the loop reports to.

pub mod harness;

#[cfg(target_os = "linux")]
pub mod child;
#[cfg(target_os = "linux")]
pub mod worker;

#[cfg(target_os = "linux")]
pub use worker::stress_opcode;

/// Stand-in for hosts without the sandboxing primitives.
#[cfg(not(target_os = "linux"))]
pub fn stress_opcode<H: harness::StressHarness + ?Sized>(
    _config: &crate::config::types::OpcodeConfig,
    harness: &mut H,
) -> crate::config::types::StressExit {
    log::info!("{}: not implemented on this platform", harness.name());
    crate::config::types::StressExit::NotImplemented
}
