//! Built-in capability modules.

pub mod buffer;
pub mod cache;
pub mod console;
pub mod crypto;
pub mod encoding;
pub mod fetch;
pub mod http;
pub mod kv;
pub mod timers;
pub mod url;

use boa_engine::{object::builtins::JsArray, Context, JsError, JsNativeError, JsResult, JsString, JsValue};

pub(crate) fn type_error(message: impl Into<String>) -> JsError {
    JsNativeError::typ().with_message(message.into()).into()
}

pub(crate) fn js_str(s: &str) -> JsValue {
    JsValue::from(JsString::from(s))
}

/// Render a script value for log output: strings verbatim, everything
/// else through the engine's display form.
pub(crate) fn display_value(value: &JsValue, _ctx: &mut Context) -> String {
    if let Some(s) = value.as_string() {
        return s.to_std_string_escaped();
    }
    value.display().to_string()
}

/// Read a script array of numbers in `0..=255` as bytes. `None` when the
/// value is not an array at all.
pub(crate) fn array_to_bytes(value: &JsValue, ctx: &mut Context) -> JsResult<Option<Vec<u8>>> {
    let Some(obj) = value.as_object().filter(|o| o.is_array()) else {
        return Ok(None);
    };
    let arr = JsArray::from_object(obj.clone())?;
    let len = arr.length(ctx)?;
    let mut out = Vec::with_capacity(len as usize);
    for i in 0..len {
        let n = arr.get(i, ctx)?.to_number(ctx)?;
        if !n.is_finite() || !(0.0..=255.0).contains(&n) {
            return Err(type_error("byte values must be between 0 and 255"));
        }
        out.push(n as u8);
    }
    Ok(Some(out))
}

/// Build a script array from bytes.
pub(crate) fn bytes_to_array(bytes: &[u8], ctx: &mut Context) -> JsResult<JsArray> {
    let arr = JsArray::new(ctx);
    for b in bytes {
        arr.push(JsValue::from(*b), ctx)?;
    }
    Ok(arr)
}
