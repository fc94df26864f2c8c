//! VM construction and lifecycle.
//!
//! A [`Vm`] owns exactly one Boa [`Context`] plus the per-execution state
//! the capability modules hang off of it. The [`VmManager`] holds what is
//! shared across executions: the module registry and the policy deciding
//! which modules a script may touch.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use boa_engine::{Context, JsObject, JsValue, Source};
use boa_gc::{Finalize, Trace};

use crate::error::{CoreError, Result};
use crate::modules::console::{self, ConsoleSink};
use crate::modules::http::ServerTable;
use crate::modules::timers::TimerRegistry;
use crate::vm::event_loop::EventLoop;
use crate::vm::loader;
use crate::vm::module::{Module, ModulePolicy, ModuleRegistry};

/// Handles modules need to reach the host from inside a native function.
///
/// Cheap to clone. The `Rc` tables never leave the loop thread; only the
/// `Arc` members may be moved into spawned tasks.
#[derive(Clone)]
pub struct VmShared {
    pub event_loop: Arc<EventLoop>,
    pub rt: tokio::runtime::Handle,
    pub timers: Rc<RefCell<TimerRegistry>>,
    pub servers: Rc<RefCell<ServerTable>>,
    pub console: ConsoleSink,
}

/// Capture bundle for native functions that only need [`VmShared`].
///
/// The GC never traces through it; JS handles held inside the tables keep
/// themselves alive as roots.
#[derive(Clone, Trace, Finalize)]
pub(crate) struct SharedCaptures {
    #[unsafe_ignore_trace]
    pub shared: VmShared,
}

/// Notification invoked on the loop thread right after the initial script
/// settles, carrying its value converted to JSON (or the error text).
pub type OnSettled =
    Box<dyn FnOnce(std::result::Result<Option<serde_json::Value>, String>) + Send + 'static>;

pub struct VmManager {
    registry: ModuleRegistry,
    policy: ModulePolicy,
}

impl VmManager {
    pub fn new(policy: ModulePolicy) -> Self {
        Self {
            registry: ModuleRegistry::new(),
            policy,
        }
    }

    /// A manager with the built-in capability modules registered.
    pub fn with_default_modules(policy: ModulePolicy) -> Self {
        let mut manager = Self::new(policy);
        manager.register_module(Arc::new(crate::modules::timers::TimersModule));
        manager.register_module(Arc::new(crate::modules::http::HttpModule));
        manager.register_module(Arc::new(crate::modules::fetch::FetchModule::new()));
        manager.register_module(Arc::new(crate::modules::crypto::CryptoModule));
        manager.register_module(Arc::new(crate::modules::cache::CacheModule::new()));
        manager.register_module(Arc::new(crate::modules::kv::KvModule::new()));
        manager.register_module(Arc::new(crate::modules::buffer::BufferModule));
        manager.register_module(Arc::new(crate::modules::encoding::EncodingModule));
        manager.register_module(Arc::new(crate::modules::url::UrlModule));
        manager
    }

    pub fn register_module(&mut self, module: Arc<dyn Module>) {
        self.registry.register(module);
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn policy(&self) -> &ModulePolicy {
        &self.policy
    }

    /// Build a VM wired to `event_loop`.
    ///
    /// Installs the console and `require` first, then runs `setup` for
    /// every module the policy enables, in registration order, and
    /// finally installs module globals. Must be called on the thread
    /// that will run the VM; the returned [`Vm`] is not `Send`.
    ///
    /// # Arguments
    ///
    /// * `event_loop` - The loop this VM's jobs will run on
    /// * `rt` - Runtime handle capability modules spawn their tasks on
    /// * `console` - Sink receiving the script's console output
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Setup` from the first module whose `setup`
    /// fails; the partially built VM is discarded.
    pub fn create_vm(
        self: &Arc<Self>,
        event_loop: Arc<EventLoop>,
        rt: tokio::runtime::Handle,
        console: ConsoleSink,
    ) -> Result<Vm> {
        let mut context = Context::default();
        let shared = VmShared {
            event_loop,
            rt,
            timers: Rc::new(RefCell::new(TimerRegistry::new())),
            servers: Rc::new(RefCell::new(ServerTable::new())),
            console,
        };

        // Console is part of the host surface, not a gated capability.
        console::install(&mut context, &shared)?;
        loader::install_require(&mut context, Arc::clone(self), shared.clone())?;

        for module in self.registry.iter() {
            if !self.policy.is_enabled(module.name()) {
                continue;
            }
            module.setup(&mut context, &shared)?;
        }
        loader::install_globals(&mut context, self, &shared)?;

        Ok(Vm {
            context,
            shared,
            manager: Arc::clone(self),
            closed: false,
        })
    }
}

/// One script execution environment. Not `Send`; it lives and dies on the
/// thread that created it.
pub struct Vm {
    pub(crate) context: Context,
    pub(crate) shared: VmShared,
    manager: Arc<VmManager>,
    closed: bool,
}

impl Vm {
    pub fn shared(&self) -> &VmShared {
        &self.shared
    }

    pub fn context(&mut self) -> &mut Context {
        &mut self.context
    }

    /// Evaluate source and drain the engine's microtask queue.
    pub fn eval(&mut self, source: &str) -> Result<JsValue> {
        let value = self
            .context
            .eval(Source::from_bytes(source))
            .map_err(|e| CoreError::from_js(&e))?;
        self.drain_microtasks()?;
        Ok(value)
    }

    /// Evaluate source, reporting the completion value as JSON.
    /// `undefined` and `null` map to `None`.
    pub fn eval_to_json(&mut self, source: &str) -> Result<Option<serde_json::Value>> {
        let value = self.eval(source)?;
        if value.is_undefined() || value.is_null() {
            return Ok(None);
        }
        Ok(Some(crate::conversions::js_to_json(&value, &mut self.context)))
    }

    /// Call a script function and drain microtasks it scheduled.
    pub fn call_function(&mut self, func: &JsObject, args: &[JsValue]) -> Result<JsValue> {
        let result = func
            .call(&JsValue::undefined(), args, &mut self.context)
            .map_err(|e| CoreError::from_js(&e))?;
        self.drain_microtasks()?;
        Ok(result)
    }

    /// Run queued promise reactions until the engine queue is empty.
    /// Reaction failures surface through the rejected promise, not here.
    pub fn drain_microtasks(&mut self) -> Result<()> {
        self.context.run_jobs();
        Ok(())
    }

    /// Drive `source` through the event loop to quiescence. `on_settled`
    /// fires as soon as the top-level script finishes, which for server
    /// scripts is long before this returns.
    pub fn run_source(&mut self, source: String, on_settled: OnSettled) -> Result<()> {
        let event_loop = Arc::clone(&self.shared.event_loop);
        event_loop.run(
            self,
            Box::new(move |vm| match vm.eval_to_json(&source) {
                Ok(value) => {
                    on_settled(Ok(value));
                    Ok(())
                }
                Err(err) => {
                    on_settled(Err(err.to_string()));
                    Err(err)
                }
            }),
        )
    }

    /// Tear down per-execution resources: cancel timers, close servers,
    /// run module cleanup hooks. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        self.shared
            .timers
            .borrow_mut()
            .stop_all(&self.shared.event_loop);
        self.shared.servers.borrow_mut().close_all();

        for module in self.manager.registry.iter() {
            if !self.manager.policy.is_enabled(module.name()) {
                continue;
            }
            if let Err(err) = module.cleanup(&self.shared) {
                tracing::warn!(module = module.name(), error = %err, "module cleanup failed");
            }
        }
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// A VM backed by a leaked runtime, for loop-level unit tests.
    pub(crate) fn test_vm() -> (Vm, Arc<EventLoop>) {
        let rt = Box::leak(Box::new(
            tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .unwrap(),
        ));
        let event_loop = Arc::new(EventLoop::new());
        let manager = Arc::new(VmManager::with_default_modules(ModulePolicy::AllowAll));
        let vm = manager
            .create_vm(
                Arc::clone(&event_loop),
                rt.handle().clone(),
                ConsoleSink::default(),
            )
            .unwrap();
        (vm, event_loop)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::test_vm;
    use super::*;

    #[test]
    fn eval_returns_completion_value() {
        let (mut vm, _el) = test_vm();
        let value = vm.eval_to_json("1 + 2").unwrap();
        assert_eq!(value, Some(serde_json::json!(3.0)));
    }

    #[test]
    fn eval_undefined_maps_to_none() {
        let (mut vm, _el) = test_vm();
        assert_eq!(vm.eval_to_json("undefined").unwrap(), None);
        assert_eq!(vm.eval_to_json("null").unwrap(), None);
    }

    #[test]
    fn script_error_surfaces_with_message() {
        let (mut vm, _el) = test_vm();
        let err = vm.eval_to_json("throw new Error('boom')").unwrap_err();
        assert!(err.to_string().contains("boom"), "got {err}");
    }

    #[test]
    fn require_unknown_module_is_descriptive() {
        let (mut vm, _el) = test_vm();
        let err = vm.eval("require('nope')").unwrap_err();
        assert!(
            err.to_string().contains("Cannot find module 'nope'"),
            "got {err}"
        );
    }

    #[test]
    fn require_without_name_is_descriptive() {
        let (mut vm, _el) = test_vm();
        let err = vm.eval("require()").unwrap_err();
        assert!(
            err.to_string().contains("expects a module name"),
            "got {err}"
        );
    }

    #[test]
    fn deny_policy_blocks_module() {
        let rt = Box::leak(Box::new(
            tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .unwrap(),
        ));
        let manager = Arc::new(VmManager::with_default_modules(ModulePolicy::Deny(vec![
            "crypto".into(),
        ])));
        let mut vm = manager
            .create_vm(
                Arc::new(EventLoop::new()),
                rt.handle().clone(),
                ConsoleSink::default(),
            )
            .unwrap();
        let err = vm.eval("require('crypto')").unwrap_err();
        assert!(
            err.to_string().contains("is not enabled"),
            "got {err}"
        );
    }

    #[test]
    fn run_source_error_carries_a_single_prefix() {
        let (mut vm, _el) = test_vm();
        let (tx, rx) = std::sync::mpsc::channel();
        let err = vm
            .run_source(
                "throw new TypeError('bad input')".into(),
                Box::new(move |res| {
                    let _ = tx.send(res);
                }),
            )
            .unwrap_err();
        let message = err.to_string();
        assert_eq!(message.matches("script error:").count(), 1, "got {message}");
        let settled = rx.recv().unwrap().unwrap_err();
        assert_eq!(settled.matches("script error:").count(), 1, "got {settled}");
    }

    #[test]
    fn run_source_reports_settled_value() {
        let (mut vm, _el) = test_vm();
        let (tx, rx) = std::sync::mpsc::channel();
        vm.run_source(
            "40 + 2".into(),
            Box::new(move |res| {
                let _ = tx.send(res);
            }),
        )
        .unwrap();
        let settled = rx.recv().unwrap().unwrap();
        assert_eq!(settled, Some(serde_json::json!(42.0)));
    }
}
