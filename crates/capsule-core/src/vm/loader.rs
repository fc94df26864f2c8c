//! Script-facing module resolution.
//!
//! Installs the `require()` function and the global bindings of enabled
//! modules. Lookup names go through a small alias table first so scripts
//! written against common import spellings keep working.

use std::sync::Arc;

use boa_engine::{
    js_string, object::FunctionObjectBuilder, Context, JsArgs, JsNativeError, JsResult, JsValue,
    NativeFunction,
};
use boa_gc::{Finalize, Trace};

use crate::error::{CoreError, Result};
use crate::vm::manager::{VmManager, VmShared};

/// Canonicalize a module name before registry lookup. The `node:` prefix
/// is stripped, and sub-path spellings map onto the module that owns
/// them.
pub(crate) fn resolve_alias(name: &str) -> &str {
    let name = name.strip_prefix("node:").unwrap_or(name);
    match name {
        "http/server" => "http",
        other => other,
    }
}

#[derive(Trace, Finalize)]
struct RequireCaptures {
    #[unsafe_ignore_trace]
    manager: Arc<VmManager>,
    #[unsafe_ignore_trace]
    shared: VmShared,
}

/// Bind `require` on the global object.
pub(crate) fn install_require(
    ctx: &mut Context,
    manager: Arc<VmManager>,
    shared: VmShared,
) -> Result<()> {
    let require = FunctionObjectBuilder::new(
        ctx.realm(),
        NativeFunction::from_copy_closure_with_captures(
            |_this, args, captures: &RequireCaptures, ctx| {
                let Some(name) = args.get_or_undefined(0).as_string() else {
                    return Err(JsNativeError::typ()
                        .with_message("require() expects a module name")
                        .into());
                };
                let name = name.to_std_string_escaped();
                require_module(ctx, &captures.manager, &captures.shared, &name)
            },
            RequireCaptures { manager, shared },
        ),
    )
    .name(js_string!("require"))
    .length(1)
    .build();

    ctx.global_object()
        .set(js_string!("require"), require, false, ctx)
        .map_err(|e| CoreError::Setup {
            module: "loader".into(),
            message: e.to_string(),
        })?;
    Ok(())
}

fn require_module(
    ctx: &mut Context,
    manager: &Arc<VmManager>,
    shared: &VmShared,
    name: &str,
) -> JsResult<JsValue> {
    let resolved = resolve_alias(name);

    let Some(module) = manager.registry().get(resolved) else {
        return Err(JsNativeError::typ()
            .with_message(format!("Cannot find module '{name}'"))
            .into());
    };

    if !manager.policy().is_enabled(resolved) {
        return Err(JsNativeError::typ()
            .with_message(format!("Module '{name}' is not enabled"))
            .into());
    }

    let Some(require) = module.as_require() else {
        return Err(JsNativeError::typ()
            .with_message(format!("Cannot find module '{name}'"))
            .into());
    };

    require.create(ctx, shared)
}

/// Install the global binding of every enabled module that has one.
pub(crate) fn install_globals(
    ctx: &mut Context,
    manager: &VmManager,
    shared: &VmShared,
) -> Result<()> {
    for module in manager.registry().iter() {
        if !manager.policy().is_enabled(module.name()) {
            continue;
        }
        let Some(global) = module.as_global() else {
            continue;
        };
        let value = global.create_global(ctx, shared).map_err(|e| CoreError::Setup {
            module: module.name().into(),
            message: e.to_string(),
        })?;
        ctx.global_object()
            .set(
                boa_engine::JsString::from(global.global_name()),
                value,
                false,
                ctx,
            )
            .map_err(|e| CoreError::Setup {
                module: module.name().into(),
                message: e.to_string(),
            })?;
    }
    Ok(())
}
