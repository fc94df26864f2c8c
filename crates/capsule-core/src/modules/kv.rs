//! Global `kv`: a JSON-valued key/value store shared across executions.
//!
//! Values are converted to JSON on write, so anything a script stores is
//! a plain data snapshot; later mutations of the original object do not
//! leak through.

use std::collections::HashMap;
use std::sync::Arc;

use boa_engine::{
    js_string, object::FunctionObjectBuilder, Context, JsArgs, JsObject, JsResult, JsValue,
    NativeFunction,
};
use boa_gc::{Finalize, Trace};
use parking_lot::Mutex;

use crate::modules::type_error;
use crate::vm::manager::VmShared;
use crate::vm::module::{GlobalModule, Module};

pub struct KvModule {
    store: Arc<Mutex<HashMap<String, serde_json::Value>>>,
}

impl KvModule {
    pub fn new() -> Self {
        Self {
            store: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl Default for KvModule {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for KvModule {
    fn name(&self) -> &'static str {
        "kv"
    }

    fn as_global(&self) -> Option<&dyn GlobalModule> {
        Some(self)
    }
}

#[derive(Trace, Finalize)]
struct StoreCaptures {
    #[unsafe_ignore_trace]
    store: Arc<Mutex<HashMap<String, serde_json::Value>>>,
}

fn key_arg(args: &[JsValue]) -> JsResult<String> {
    match args.get_or_undefined(0).as_string() {
        Some(s) => Ok(s.to_std_string_escaped()),
        None => Err(type_error("kv key must be a string")),
    }
}

impl GlobalModule for KvModule {
    fn global_name(&self) -> &'static str {
        "kv"
    }

    fn create_global(&self, ctx: &mut Context, _shared: &VmShared) -> JsResult<JsValue> {
        let kv = JsObject::with_object_proto(ctx.intrinsics());
        let captures = || StoreCaptures {
            store: Arc::clone(&self.store),
        };

        let get = FunctionObjectBuilder::new(
            ctx.realm(),
            NativeFunction::from_copy_closure_with_captures(
                |_this, args, captures: &StoreCaptures, ctx| {
                    let key = key_arg(args)?;
                    let value = captures.store.lock().get(&key).cloned();
                    match value {
                        Some(json) => crate::conversions::json_to_js(&json, ctx),
                        None => Ok(JsValue::null()),
                    }
                },
                captures(),
            ),
        )
        .name(js_string!("get"))
        .length(1)
        .build();
        kv.set(js_string!("get"), get, false, ctx)?;

        let set = FunctionObjectBuilder::new(
            ctx.realm(),
            NativeFunction::from_copy_closure_with_captures(
                |_this, args, captures: &StoreCaptures, ctx| {
                    let key = key_arg(args)?;
                    let json = crate::conversions::js_to_json(args.get_or_undefined(1), ctx);
                    captures.store.lock().insert(key, json);
                    Ok(JsValue::undefined())
                },
                captures(),
            ),
        )
        .name(js_string!("set"))
        .length(2)
        .build();
        kv.set(js_string!("set"), set, false, ctx)?;

        let delete = FunctionObjectBuilder::new(
            ctx.realm(),
            NativeFunction::from_copy_closure_with_captures(
                |_this, args, captures: &StoreCaptures, _ctx| {
                    let key = key_arg(args)?;
                    Ok(JsValue::from(
                        captures.store.lock().remove(&key).is_some(),
                    ))
                },
                captures(),
            ),
        )
        .name(js_string!("delete"))
        .length(1)
        .build();
        kv.set(js_string!("delete"), delete, false, ctx)?;

        Ok(kv.into())
    }
}
