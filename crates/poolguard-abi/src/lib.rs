// Every extern "C" entry point takes raw pointers from instrumented C code
// and validates them in the runtime; per-function safety docs are kept only
// where a string argument adds a contract.
#![allow(clippy::missing_safety_doc)]
//! # poolguard-abi
//!
//! C entry points for programs instrumented with poolguard checks.
//!
//! ```text
//! instrumented code -> poolguard_* entry (this crate) -> Runtime -> pools/registry/checks
//! SIGSEGV/SIGBUS on a stale shadow -> fault handler -> Runtime::handle_fault
//! ```
//!
//! The crate builds a `cdylib` exporting unmangled `poolguard_*` symbols.
//! None of them collide with libc, so they stay exported in test builds.

pub mod check_abi;
#[cfg(target_os = "linux")]
pub mod fault_abi;
pub mod pool_abi;
mod runtime_state;
