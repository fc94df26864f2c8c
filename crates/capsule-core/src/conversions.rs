//! Conversions between engine values and JSON.
//!
//! Script results cross a thread boundary on their way out of the VM, so
//! they are converted to `serde_json::Value` while still on the loop
//! thread. The JS-to-JSON direction is total: anything without a JSON
//! shape (functions, symbols, non-finite numbers) collapses to `null`,
//! the same way `JSON.stringify` drops it.

use boa_engine::{
    object::builtins::JsArray, property::PropertyKey, Context, JsObject, JsResult, JsString,
    JsValue,
};
use serde_json::Value;

/// Convert an engine value to `serde_json::Value`.
///
/// Conversion is total and never touches script code: getters are read
/// through the normal property access path, and anything that fails to
/// read becomes `null` rather than an error.
///
/// # Arguments
///
/// * `value` - The engine value to convert
/// * `ctx` - The context the value belongs to
///
/// # Type Mapping
///
/// | JavaScript | JSON |
/// |------------|------|
/// | null / undefined | null |
/// | boolean | boolean |
/// | finite number | number |
/// | NaN / Infinity | null |
/// | string | string |
/// | array | array |
/// | plain object | object (symbol keys, functions, and `undefined` properties skipped) |
/// | function / symbol | null |
///
/// # Examples
///
/// ```ignore
/// let json = js_to_json(&value, &mut ctx);
/// assert!(json.is_object());
/// ```
pub fn js_to_json(value: &JsValue, ctx: &mut Context) -> Value {
    if value.is_null() || value.is_undefined() {
        return Value::Null;
    }
    if let Some(b) = value.as_boolean() {
        return Value::Bool(b);
    }
    if let Some(n) = value.as_number() {
        return serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null);
    }
    if let Some(s) = value.as_string() {
        return Value::String(s.to_std_string_escaped());
    }
    if let Some(obj) = value.as_object() {
        if obj.is_callable() {
            return Value::Null;
        }
        if obj.is_array() {
            return array_to_json(obj, ctx);
        }
        return object_to_json(obj, ctx);
    }
    Value::Null
}

fn array_to_json(obj: &JsObject, ctx: &mut Context) -> Value {
    let Ok(arr) = JsArray::from_object(obj.clone()) else {
        return Value::Null;
    };
    let Ok(len) = arr.length(ctx) else {
        return Value::Null;
    };
    let mut out = Vec::with_capacity(len as usize);
    for i in 0..len {
        match arr.get(i, ctx) {
            Ok(item) => out.push(js_to_json(&item, ctx)),
            Err(_) => out.push(Value::Null),
        }
    }
    Value::Array(out)
}

fn object_to_json(obj: &JsObject, ctx: &mut Context) -> Value {
    let Ok(keys) = obj.own_property_keys(ctx) else {
        return Value::Null;
    };
    let mut map = serde_json::Map::new();
    for key in keys {
        let name = match &key {
            PropertyKey::String(s) => s.to_std_string_escaped(),
            PropertyKey::Index(i) => i.get().to_string(),
            PropertyKey::Symbol(_) => continue,
        };
        match obj.get(key, ctx) {
            Ok(item) => {
                if item.is_undefined() || item.as_object().is_some_and(|o| o.is_callable()) {
                    continue;
                }
                map.insert(name, js_to_json(&item, ctx));
            }
            Err(_) => continue,
        }
    }
    Value::Object(map)
}

/// Convert a `serde_json::Value` into an engine value.
///
/// # Errors
///
/// Fails only if the engine rejects an array push or property set, which
/// should not happen for freshly built objects.
pub fn json_to_js(value: &Value, ctx: &mut Context) -> JsResult<JsValue> {
    Ok(match value {
        Value::Null => JsValue::null(),
        Value::Bool(b) => JsValue::from(*b),
        Value::Number(n) => JsValue::from(n.as_f64().unwrap_or(f64::NAN)),
        Value::String(s) => JsValue::from(JsString::from(s.as_str())),
        Value::Array(items) => {
            let arr = JsArray::new(ctx);
            for item in items {
                let js = json_to_js(item, ctx)?;
                arr.push(js, ctx)?;
            }
            arr.into()
        }
        Value::Object(map) => {
            let obj = JsObject::with_object_proto(ctx.intrinsics());
            for (key, item) in map {
                let js = json_to_js(item, ctx)?;
                obj.set(JsString::from(key.as_str()), js, false, ctx)?;
            }
            obj.into()
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use boa_engine::Source;

    fn eval(ctx: &mut Context, src: &str) -> JsValue {
        ctx.eval(Source::from_bytes(src)).unwrap()
    }

    #[test]
    fn scalars_round_out() {
        let mut ctx = Context::default();
        let v = eval(&mut ctx, "({n: 1.5, s: 'hi', b: true, z: null})");
        let json = js_to_json(&v, &mut ctx);
        assert_eq!(
            json,
            serde_json::json!({"n": 1.5, "s": "hi", "b": true, "z": null})
        );
    }

    #[test]
    fn arrays_and_nesting() {
        let mut ctx = Context::default();
        let v = eval(&mut ctx, "[1, ['a'], {k: false}]");
        let json = js_to_json(&v, &mut ctx);
        assert_eq!(json, serde_json::json!([1.0, ["a"], {"k": false}]));
    }

    #[test]
    fn functions_collapse_to_null() {
        let mut ctx = Context::default();
        let v = eval(&mut ctx, "(function() {})");
        assert_eq!(js_to_json(&v, &mut ctx), serde_json::Value::Null);
    }

    #[test]
    fn json_round_trips_into_engine() {
        let mut ctx = Context::default();
        let json = serde_json::json!({"a": [1.0, "two"], "b": {"c": true}});
        let js = json_to_js(&json, &mut ctx).unwrap();
        assert_eq!(js_to_json(&js, &mut ctx), json);
    }
}
