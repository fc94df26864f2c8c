//! Embedded JavaScript capability host.
//!
//! Scripts run in isolated per-execution VMs on top of an event loop
//! that bridges async host work (timers, HTTP serving, outbound fetch)
//! back onto the single engine thread. Capabilities are granted through
//! a policy-gated module registry.

pub mod conversions;
pub mod error;
pub mod executor;
pub mod modules;
pub mod vm;

pub use error::{CoreError, Result};
pub use executor::{ExecuteOutcome, Executor, ExecutorConfig};
pub use vm::{Module, ModulePolicy, Vm, VmManager};
