//! `require('cache')`: in-memory cache shared across executions.
//!
//! Entries optionally carry a TTL in milliseconds; expiry is checked on
//! read, so stale entries cost nothing until someone asks for them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use boa_engine::{
    js_string, object::FunctionObjectBuilder, Context, JsArgs, JsObject, JsResult, JsValue,
    NativeFunction,
};
use boa_gc::{Finalize, Trace};
use parking_lot::Mutex;

use crate::modules::type_error;
use crate::vm::manager::VmShared;
use crate::vm::module::{Module, RequireModule};

enum CacheValue {
    Text(String),
    Bytes(Vec<u8>),
}

struct CacheEntry {
    value: CacheValue,
    deadline: Option<Instant>,
}

#[derive(Default)]
struct CacheStore {
    entries: HashMap<String, CacheEntry>,
}

impl CacheStore {
    fn get(&mut self, key: &str) -> Option<&CacheValue> {
        if let Some(entry) = self.entries.get(key) {
            if entry.deadline.is_some_and(|d| Instant::now() >= d) {
                self.entries.remove(key);
                return None;
            }
        }
        self.entries.get(key).map(|e| &e.value)
    }

    fn set(&mut self, key: String, value: CacheValue, ttl: Option<Duration>) {
        self.entries.insert(
            key,
            CacheEntry {
                value,
                deadline: ttl.map(|t| Instant::now() + t),
            },
        );
    }

    fn del(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }
}

pub struct CacheModule {
    store: Arc<Mutex<CacheStore>>,
}

impl CacheModule {
    pub fn new() -> Self {
        Self {
            store: Arc::new(Mutex::new(CacheStore::default())),
        }
    }
}

impl Default for CacheModule {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for CacheModule {
    fn name(&self) -> &'static str {
        "cache"
    }

    fn as_require(&self) -> Option<&dyn RequireModule> {
        Some(self)
    }
}

#[derive(Trace, Finalize)]
struct StoreCaptures {
    #[unsafe_ignore_trace]
    store: Arc<Mutex<CacheStore>>,
}

fn key_arg(args: &[JsValue]) -> JsResult<String> {
    match args.get_or_undefined(0).as_string() {
        Some(s) => Ok(s.to_std_string_escaped()),
        None => Err(type_error("cache key must be a string")),
    }
}

fn ttl_arg(args: &[JsValue], index: usize, ctx: &mut Context) -> JsResult<Option<Duration>> {
    let value = args.get_or_undefined(index);
    if value.is_undefined() || value.is_null() {
        return Ok(None);
    }
    let ms = value.to_number(ctx)?;
    if !ms.is_finite() || ms < 0.0 {
        return Err(type_error("ttl must be a non-negative number of milliseconds"));
    }
    Ok(Some(Duration::from_millis(ms as u64)))
}

fn bytes_arg(args: &[JsValue], index: usize, ctx: &mut Context) -> JsResult<Vec<u8>> {
    match super::array_to_bytes(args.get_or_undefined(index), ctx)? {
        Some(bytes) => Ok(bytes),
        None => Err(type_error("value must be an array of bytes")),
    }
}

impl RequireModule for CacheModule {
    fn create(&self, ctx: &mut Context, _shared: &VmShared) -> JsResult<JsValue> {
        let exports = JsObject::with_object_proto(ctx.intrinsics());
        let captures = || StoreCaptures {
            store: Arc::clone(&self.store),
        };

        let get = FunctionObjectBuilder::new(
            ctx.realm(),
            NativeFunction::from_copy_closure_with_captures(
                |_this, args, captures: &StoreCaptures, _ctx| {
                    let key = key_arg(args)?;
                    match captures.store.lock().get(&key) {
                        Some(CacheValue::Text(s)) => Ok(super::js_str(s)),
                        Some(CacheValue::Bytes(_)) | None => Ok(JsValue::null()),
                    }
                },
                captures(),
            ),
        )
        .name(js_string!("get"))
        .length(1)
        .build();
        exports.set(js_string!("get"), get, false, ctx)?;

        let get_bytes = FunctionObjectBuilder::new(
            ctx.realm(),
            NativeFunction::from_copy_closure_with_captures(
                |_this, args, captures: &StoreCaptures, ctx| {
                    let key = key_arg(args)?;
                    let bytes = match captures.store.lock().get(&key) {
                        Some(CacheValue::Bytes(b)) => b.clone(),
                        Some(CacheValue::Text(s)) => s.clone().into_bytes(),
                        None => return Ok(JsValue::null()),
                    };
                    Ok(super::bytes_to_array(&bytes, ctx)?.into())
                },
                captures(),
            ),
        )
        .name(js_string!("getBytes"))
        .length(1)
        .build();
        exports.set(js_string!("getBytes"), get_bytes, false, ctx)?;

        let set = FunctionObjectBuilder::new(
            ctx.realm(),
            NativeFunction::from_copy_closure_with_captures(
                |_this, args, captures: &StoreCaptures, ctx| {
                    let key = key_arg(args)?;
                    let Some(value) = args.get_or_undefined(1).as_string() else {
                        return Err(type_error("cache value must be a string"));
                    };
                    let ttl = ttl_arg(args, 2, ctx)?;
                    captures.store.lock().set(
                        key,
                        CacheValue::Text(value.to_std_string_escaped()),
                        ttl,
                    );
                    Ok(JsValue::undefined())
                },
                captures(),
            ),
        )
        .name(js_string!("set"))
        .length(2)
        .build();
        exports.set(js_string!("set"), set, false, ctx)?;

        let set_bytes = FunctionObjectBuilder::new(
            ctx.realm(),
            NativeFunction::from_copy_closure_with_captures(
                |_this, args, captures: &StoreCaptures, ctx| {
                    let key = key_arg(args)?;
                    let bytes = bytes_arg(args, 1, ctx)?;
                    let ttl = ttl_arg(args, 2, ctx)?;
                    captures.store.lock().set(key, CacheValue::Bytes(bytes), ttl);
                    Ok(JsValue::undefined())
                },
                captures(),
            ),
        )
        .name(js_string!("setBytes"))
        .length(2)
        .build();
        exports.set(js_string!("setBytes"), set_bytes, false, ctx)?;

        let del = FunctionObjectBuilder::new(
            ctx.realm(),
            NativeFunction::from_copy_closure_with_captures(
                |_this, args, captures: &StoreCaptures, _ctx| {
                    let key = key_arg(args)?;
                    Ok(JsValue::from(captures.store.lock().del(&key)))
                },
                captures(),
            ),
        )
        .name(js_string!("del"))
        .length(1)
        .build();
        exports.set(js_string!("del"), del, false, ctx)?;

        Ok(exports.into())
    }
}

#[cfg(test)]
mod tests {
    use crate::vm::manager::test_support::test_vm;
    use serde_json::json;

    #[test]
    fn set_then_get_round_trips() {
        let (mut vm, _el) = test_vm();
        let out = vm
            .eval_to_json(
                "const c = require('cache'); c.set('k', 'v'); c.get('k')",
            )
            .unwrap();
        assert_eq!(out, Some(json!("v")));
    }

    #[test]
    fn missing_key_is_null() {
        let (mut vm, _el) = test_vm();
        let out = vm
            .eval_to_json("require('cache').get('absent')")
            .unwrap();
        assert_eq!(out, None);
    }

    #[test]
    fn expired_entry_reads_as_null() {
        let (mut vm, _el) = test_vm();
        vm.eval("require('cache').set('temp', 'v', 20)").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));
        let out = vm.eval_to_json("require('cache').get('temp')").unwrap();
        assert_eq!(out, None);
    }

    #[test]
    fn del_reports_presence() {
        let (mut vm, _el) = test_vm();
        let out = vm
            .eval_to_json(
                "const c = require('cache'); c.set('k', 'v'); [c.del('k'), c.del('k')]",
            )
            .unwrap();
        assert_eq!(out, Some(json!([true, false])));
    }

    #[test]
    fn bytes_round_trip() {
        let (mut vm, _el) = test_vm();
        let out = vm
            .eval_to_json(
                "const c = require('cache'); c.setBytes('b', [1, 2, 255]); c.getBytes('b')",
            )
            .unwrap();
        assert_eq!(out, Some(json!([1.0, 2.0, 255.0])));
    }
}
