//! Capability module abstraction.
//!
//! A module is a named bundle of host functionality a script may use.
//! Modules hook into a VM in up to three ways: unconditional setup when
//! the VM is created, a value handed out through `require(name)`, and a
//! global binding installed on `globalThis`. Whether a module is visible
//! to scripts at all is decided by the [`ModulePolicy`], never by the
//! module itself.

use std::sync::Arc;

use boa_engine::{Context, JsResult, JsValue};

use crate::error::Result;
use crate::vm::manager::VmShared;

/// Host functionality exposed to scripts under a stable name.
///
/// Implementations must be `Send + Sync`: a single module instance is
/// registered once and shared by every VM the manager creates, so any
/// cross-VM state (caches, HTTP clients) lives behind its own lock.
pub trait Module: Send + Sync {
    /// Stable name used for `require()` lookup and policy decisions.
    fn name(&self) -> &'static str;

    /// Called once while the VM is being built, before any script runs.
    fn setup(&self, _ctx: &mut Context, _shared: &VmShared) -> Result<()> {
        Ok(())
    }

    /// Called when the VM is torn down. Best-effort; failures are logged
    /// by the caller and never abort the teardown of other modules.
    fn cleanup(&self, _shared: &VmShared) -> Result<()> {
        Ok(())
    }

    /// The value returned from `require(name)`, if this module exports
    /// one. Invoked lazily, once per `require` call.
    fn as_require(&self) -> Option<&dyn RequireModule> {
        None
    }

    /// The global binding this module installs, if any.
    fn as_global(&self) -> Option<&dyn GlobalModule> {
        None
    }
}

/// A module reachable through `require(name)`.
pub trait RequireModule {
    fn create(&self, ctx: &mut Context, shared: &VmShared) -> JsResult<JsValue>;
}

/// A module that binds a value onto `globalThis` at VM creation.
pub trait GlobalModule {
    fn global_name(&self) -> &'static str;
    fn create_global(&self, ctx: &mut Context, shared: &VmShared) -> JsResult<JsValue>;
}

/// Which registered modules a VM may see.
///
/// Allow and deny lists are mutually exclusive by construction; there is
/// no way to express both at once.
#[derive(Debug, Clone, Default)]
pub enum ModulePolicy {
    /// Every registered module is enabled.
    #[default]
    AllowAll,
    /// Only the named modules are enabled.
    Allow(Vec<String>),
    /// Every registered module except the named ones is enabled.
    Deny(Vec<String>),
}

impl ModulePolicy {
    pub fn is_enabled(&self, name: &str) -> bool {
        match self {
            ModulePolicy::AllowAll => true,
            ModulePolicy::Allow(names) => names.iter().any(|n| n == name),
            ModulePolicy::Deny(names) => !names.iter().any(|n| n == name),
        }
    }
}

/// Ordered collection of registered modules. Registration order is
/// preserved because module setup order is observable from scripts.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: Vec<Arc<dyn Module>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module. A later registration with the same name
    /// replaces the earlier one.
    pub fn register(&mut self, module: Arc<dyn Module>) {
        if let Some(slot) = self.modules.iter_mut().find(|m| m.name() == module.name()) {
            *slot = module;
            return;
        }
        self.modules.push(module);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Module>> {
        self.modules.iter().find(|m| m.name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Module>> {
        self.modules.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy(&'static str);
    impl Module for Dummy {
        fn name(&self) -> &'static str {
            self.0
        }
    }

    #[test]
    fn policy_allow_all() {
        let p = ModulePolicy::AllowAll;
        assert!(p.is_enabled("http"));
        assert!(p.is_enabled("anything"));
    }

    #[test]
    fn policy_allow_list_is_exclusive() {
        let p = ModulePolicy::Allow(vec!["timers".into()]);
        assert!(p.is_enabled("timers"));
        assert!(!p.is_enabled("http"));
    }

    #[test]
    fn policy_deny_list_blocks_only_named() {
        let p = ModulePolicy::Deny(vec!["http".into()]);
        assert!(!p.is_enabled("http"));
        assert!(p.is_enabled("timers"));
    }

    #[test]
    fn registry_replaces_on_same_name() {
        let mut reg = ModuleRegistry::new();
        reg.register(Arc::new(Dummy("a")));
        reg.register(Arc::new(Dummy("b")));
        reg.register(Arc::new(Dummy("a")));
        assert_eq!(reg.iter().count(), 2);
        assert!(reg.get("a").is_some());
        assert!(reg.get("missing").is_none());
    }
}
