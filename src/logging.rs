//! Logging facade.
//!
//! Replaces the teacher's kernel-coupled `debug!`/`logln!` macros
//! (`crates/kernel/src/logging.rs`, `crates/kernel/src/debug.rs`, which
//! reach into `KERNEL_ELF`, `PageString`, and a VGA/serial tty that do not
//! exist in a standalone driver crate) with the portable `log` crate: every
//! call site in this crate uses `log::{trace,debug,info,warn,error}!`
//! directly and assumes nothing about the installed sink.
//!
//! The one thing worth a macro of our own is trace-level TRB dumps, which
//! are hot-path and gated behind the `trace-trbs` feature so they cost
//! nothing in a build that doesn't enable it.

/// Logs a TRB at trace level when the `trace-trbs` feature is enabled;
/// compiles to nothing otherwise.
#[macro_export]
macro_rules! trace_trb {
    ($($arg:tt)*) => {
        #[cfg(feature = "trace-trbs")]
        log::trace!($($arg)*);
    };
}
