pub mod event_loop;
pub mod loader;
pub mod manager;
pub mod module;

pub use event_loop::{EnqueueHandle, EventLoop, Job};
pub use manager::{Vm, VmManager, VmShared};
pub use module::{GlobalModule, Module, ModulePolicy, RequireModule};
