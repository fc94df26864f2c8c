//! Global `Buffer`: byte strings with encoding-aware construction.
//!
//! Instances are plain objects whose methods close over their bytes, so
//! they behave like values; `slice` copies.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use boa_engine::{
    js_string, object::FunctionObjectBuilder, Context, JsArgs, JsObject, JsResult, JsValue,
    NativeFunction,
};
use boa_gc::{Finalize, Trace};

use crate::modules::type_error;
use crate::vm::manager::VmShared;
use crate::vm::module::{GlobalModule, Module};

#[derive(Trace, Finalize)]
struct BytesCaptures {
    #[unsafe_ignore_trace]
    bytes: Vec<u8>,
}

fn decode(data: &str, encoding: &str) -> JsResult<Vec<u8>> {
    match encoding {
        "utf8" | "utf-8" => Ok(data.as_bytes().to_vec()),
        "hex" => hex::decode(data).map_err(|e| type_error(format!("invalid hex data: {e}"))),
        "base64" => BASE64
            .decode(data)
            .map_err(|e| type_error(format!("invalid base64 data: {e}"))),
        other => Err(type_error(format!("unknown encoding '{other}'"))),
    }
}

fn encode(bytes: &[u8], encoding: &str) -> JsResult<String> {
    match encoding {
        "utf8" | "utf-8" => Ok(String::from_utf8_lossy(bytes).into_owned()),
        "hex" => Ok(hex::encode(bytes)),
        "base64" => Ok(BASE64.encode(bytes)),
        other => Err(type_error(format!("unknown encoding '{other}'"))),
    }
}

fn encoding_arg(args: &[JsValue], index: usize) -> String {
    args.get_or_undefined(index)
        .as_string()
        .map(|s| s.to_std_string_escaped())
        .unwrap_or_else(|| "utf8".into())
}

/// Build a buffer object around owned bytes.
fn make_buffer(ctx: &mut Context, bytes: Vec<u8>) -> JsResult<JsObject> {
    let buffer = JsObject::with_object_proto(ctx.intrinsics());
    buffer.set(
        js_string!("length"),
        JsValue::from(bytes.len() as u32),
        false,
        ctx,
    )?;

    let to_string = FunctionObjectBuilder::new(
        ctx.realm(),
        NativeFunction::from_copy_closure_with_captures(
            |_this, args, captures: &BytesCaptures, _ctx| {
                let encoding = encoding_arg(args, 0);
                Ok(super::js_str(&encode(&captures.bytes, &encoding)?))
            },
            BytesCaptures {
                bytes: bytes.clone(),
            },
        ),
    )
    .name(js_string!("toString"))
    .build();
    buffer.set(js_string!("toString"), to_string, false, ctx)?;

    let slice = FunctionObjectBuilder::new(
        ctx.realm(),
        NativeFunction::from_copy_closure_with_captures(
            |_this, args, captures: &BytesCaptures, ctx| {
                let len = captures.bytes.len() as f64;
                let resolve = |v: f64, default: f64| -> usize {
                    let v = if v.is_nan() { default } else { v };
                    let v = if v < 0.0 { (len + v).max(0.0) } else { v.min(len) };
                    v as usize
                };
                let start = resolve(args.get_or_undefined(0).to_number(ctx)?, 0.0);
                let end = resolve(args.get_or_undefined(1).to_number(ctx)?, len);
                let slice = if start < end {
                    captures.bytes[start..end].to_vec()
                } else {
                    Vec::new()
                };
                Ok(make_buffer(ctx, slice)?.into())
            },
            BytesCaptures {
                bytes: bytes.clone(),
            },
        ),
    )
    .name(js_string!("slice"))
    .length(2)
    .build();
    buffer.set(js_string!("slice"), slice, false, ctx)?;

    let bytes_fn = FunctionObjectBuilder::new(
        ctx.realm(),
        NativeFunction::from_copy_closure_with_captures(
            |_this, _args, captures: &BytesCaptures, ctx| {
                Ok(super::bytes_to_array(&captures.bytes, ctx)?.into())
            },
            BytesCaptures { bytes },
        ),
    )
    .name(js_string!("bytes"))
    .build();
    buffer.set(js_string!("bytes"), bytes_fn, false, ctx)?;

    Ok(buffer)
}

pub struct BufferModule;

impl Module for BufferModule {
    fn name(&self) -> &'static str {
        "buffer"
    }

    fn as_global(&self) -> Option<&dyn GlobalModule> {
        Some(self)
    }
}

impl GlobalModule for BufferModule {
    fn global_name(&self) -> &'static str {
        "Buffer"
    }

    fn create_global(&self, ctx: &mut Context, _shared: &VmShared) -> JsResult<JsValue> {
        let buffer = JsObject::with_object_proto(ctx.intrinsics());

        let from = FunctionObjectBuilder::new(
            ctx.realm(),
            NativeFunction::from_copy_closure(|_this, args, ctx| {
                let value = args.get_or_undefined(0);
                if let Some(s) = value.as_string() {
                    let encoding = encoding_arg(args, 1);
                    let bytes = decode(&s.to_std_string_escaped(), &encoding)?;
                    return Ok(make_buffer(ctx, bytes)?.into());
                }
                if let Some(bytes) = super::array_to_bytes(value, ctx)? {
                    return Ok(make_buffer(ctx, bytes)?.into());
                }
                Err(type_error("Buffer.from() expects a string or byte array"))
            }),
        )
        .name(js_string!("from"))
        .length(2)
        .build();
        buffer.set(js_string!("from"), from, false, ctx)?;

        let alloc = FunctionObjectBuilder::new(
            ctx.realm(),
            NativeFunction::from_copy_closure(|_this, args, ctx| {
                let n = args.get_or_undefined(0).to_number(ctx)?;
                if !n.is_finite() || n < 0.0 {
                    return Err(type_error("Buffer.alloc() expects a non-negative size"));
                }
                let fill = args.get_or_undefined(1);
                let fill = if fill.is_undefined() {
                    0u8
                } else {
                    let f = fill.to_number(ctx)?;
                    if !f.is_finite() || !(0.0..=255.0).contains(&f) {
                        return Err(type_error("fill byte must be between 0 and 255"));
                    }
                    f as u8
                };
                Ok(make_buffer(ctx, vec![fill; n as usize])?.into())
            }),
        )
        .name(js_string!("alloc"))
        .length(1)
        .build();
        buffer.set(js_string!("alloc"), alloc, false, ctx)?;

        Ok(buffer.into())
    }
}
