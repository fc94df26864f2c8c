//! `TextEncoder` / `TextDecoder` globals, UTF-8 only.

use boa_engine::{
    js_string, object::FunctionObjectBuilder, Context, JsArgs, JsObject, JsValue, NativeFunction,
};

use crate::error::{CoreError, Result};
use crate::modules::type_error;
use crate::vm::manager::VmShared;
use crate::vm::module::Module;

fn make_encoder(ctx: &mut Context) -> boa_engine::JsResult<JsObject> {
    let encoder = JsObject::with_object_proto(ctx.intrinsics());
    encoder.set(js_string!("encoding"), super::js_str("utf-8"), false, ctx)?;

    let encode = FunctionObjectBuilder::new(
        ctx.realm(),
        NativeFunction::from_copy_closure(|_this, args, ctx| {
            let text = args
                .get_or_undefined(0)
                .as_string()
                .map(|s| s.to_std_string_escaped())
                .unwrap_or_default();
            Ok(crate::modules::bytes_to_array(text.as_bytes(), ctx)?.into())
        }),
    )
    .name(js_string!("encode"))
    .length(1)
    .build();
    encoder.set(js_string!("encode"), encode, false, ctx)?;
    Ok(encoder)
}

fn make_decoder(ctx: &mut Context) -> boa_engine::JsResult<JsObject> {
    let decoder = JsObject::with_object_proto(ctx.intrinsics());
    decoder.set(js_string!("encoding"), super::js_str("utf-8"), false, ctx)?;

    let decode = FunctionObjectBuilder::new(
        ctx.realm(),
        NativeFunction::from_copy_closure(|_this, args, ctx| {
            let value = args.get_or_undefined(0);
            if value.is_undefined() {
                return Ok(super::js_str(""));
            }
            let Some(bytes) = crate::modules::array_to_bytes(value, ctx)? else {
                return Err(type_error("decode() expects a byte array"));
            };
            Ok(super::js_str(&String::from_utf8_lossy(&bytes)))
        }),
    )
    .name(js_string!("decode"))
    .length(1)
    .build();
    decoder.set(js_string!("decode"), decode, false, ctx)?;
    Ok(decoder)
}

pub struct EncodingModule;

impl Module for EncodingModule {
    fn name(&self) -> &'static str {
        "encoding"
    }

    fn setup(&self, ctx: &mut Context, _shared: &VmShared) -> Result<()> {
        let setup_err = |e: boa_engine::JsError| CoreError::Setup {
            module: "encoding".into(),
            message: e.to_string(),
        };

        let encoder_ctor = FunctionObjectBuilder::new(
            ctx.realm(),
            NativeFunction::from_copy_closure(|_this, _args, ctx| Ok(make_encoder(ctx)?.into())),
        )
        .name(js_string!("TextEncoder"))
        .constructor(true)
        .build();
        ctx.global_object()
            .set(js_string!("TextEncoder"), encoder_ctor, false, ctx)
            .map_err(setup_err)?;

        let decoder_ctor = FunctionObjectBuilder::new(
            ctx.realm(),
            NativeFunction::from_copy_closure(|_this, _args, ctx| Ok(make_decoder(ctx)?.into())),
        )
        .name(js_string!("TextDecoder"))
        .constructor(true)
        .build();
        ctx.global_object()
            .set(js_string!("TextDecoder"), decoder_ctor, false, ctx)
            .map_err(setup_err)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::vm::manager::test_support::test_vm;
    use serde_json::json;

    #[test]
    fn encode_decode_round_trip() {
        let (mut vm, _el) = test_vm();
        let out = vm
            .eval_to_json(
                "new TextDecoder().decode(new TextEncoder().encode('héllo'))",
            )
            .unwrap();
        assert_eq!(out, Some(json!("héllo")));
    }

    #[test]
    fn encode_yields_utf8_bytes() {
        let (mut vm, _el) = test_vm();
        let out = vm
            .eval_to_json("new TextEncoder().encode('hi')")
            .unwrap();
        assert_eq!(out, Some(json!([104.0, 105.0])));
    }
}
