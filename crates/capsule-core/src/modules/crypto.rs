//! `require('crypto')`: digests, HMAC, random bytes.
//!
//! Every operation returns an encoder object so scripts choose the
//! output form at the call site: `crypto.sha256(data).hex()`.

use boa_engine::{
    js_string, object::builtins::JsArray, object::FunctionObjectBuilder, Context, JsArgs,
    JsObject, JsResult, JsValue, NativeFunction,
};
use boa_gc::{Finalize, Trace};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use md5::Md5;
use rand::RngCore;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};

use crate::modules::type_error;
use crate::vm::manager::VmShared;
use crate::vm::module::{Module, RequireModule};

fn digest(alg: &str, data: &[u8]) -> Option<Vec<u8>> {
    Some(match alg {
        "md5" => Md5::digest(data).to_vec(),
        "sha1" => Sha1::digest(data).to_vec(),
        "sha256" => Sha256::digest(data).to_vec(),
        "sha384" => Sha384::digest(data).to_vec(),
        "sha512" => Sha512::digest(data).to_vec(),
        _ => return None,
    })
}

fn hmac_digest(alg: &str, key: &[u8], data: &[u8]) -> Option<Vec<u8>> {
    fn run<M: Mac + hmac::digest::KeyInit>(key: &[u8], data: &[u8]) -> Option<Vec<u8>> {
        let mut mac = <M as Mac>::new_from_slice(key).ok()?;
        mac.update(data);
        Some(mac.finalize().into_bytes().to_vec())
    }
    match alg {
        "md5" => run::<Hmac<Md5>>(key, data),
        "sha1" => run::<Hmac<Sha1>>(key, data),
        "sha256" => run::<Hmac<Sha256>>(key, data),
        "sha384" => run::<Hmac<Sha384>>(key, data),
        "sha512" => run::<Hmac<Sha512>>(key, data),
        _ => None,
    }
}

#[derive(Trace, Finalize)]
struct DigestCaptures {
    #[unsafe_ignore_trace]
    bytes: Vec<u8>,
}

/// Object exposing one digest in the caller's preferred encoding.
pub(crate) fn make_encoder(ctx: &mut Context, bytes: Vec<u8>) -> JsResult<JsObject> {
    let encoder = JsObject::with_object_proto(ctx.intrinsics());

    let hex_fn = FunctionObjectBuilder::new(
        ctx.realm(),
        NativeFunction::from_copy_closure_with_captures(
            |_this, _args, captures: &DigestCaptures, _ctx| {
                Ok(super::js_str(&hex::encode(&captures.bytes)))
            },
            DigestCaptures {
                bytes: bytes.clone(),
            },
        ),
    )
    .name(js_string!("hex"))
    .build();
    encoder.set(js_string!("hex"), hex_fn, false, ctx)?;

    let b64_fn = FunctionObjectBuilder::new(
        ctx.realm(),
        NativeFunction::from_copy_closure_with_captures(
            |_this, _args, captures: &DigestCaptures, _ctx| {
                Ok(super::js_str(&BASE64.encode(&captures.bytes)))
            },
            DigestCaptures {
                bytes: bytes.clone(),
            },
        ),
    )
    .name(js_string!("base64"))
    .build();
    encoder.set(js_string!("base64"), b64_fn, false, ctx)?;

    let bytes_fn = FunctionObjectBuilder::new(
        ctx.realm(),
        NativeFunction::from_copy_closure_with_captures(
            |_this, _args, captures: &DigestCaptures, ctx| {
                let arr = JsArray::new(ctx);
                for b in &captures.bytes {
                    arr.push(JsValue::from(*b), ctx)?;
                }
                Ok(arr.into())
            },
            DigestCaptures { bytes },
        ),
    )
    .name(js_string!("bytes"))
    .build();
    encoder.set(js_string!("bytes"), bytes_fn, false, ctx)?;

    Ok(encoder)
}

fn string_arg(args: &[JsValue], index: usize, what: &str) -> JsResult<String> {
    match args.get_or_undefined(index).as_string() {
        Some(s) => Ok(s.to_std_string_escaped()),
        None => Err(type_error(format!("{what} must be a string"))),
    }
}

pub struct CryptoModule;

impl Module for CryptoModule {
    fn name(&self) -> &'static str {
        "crypto"
    }

    fn as_require(&self) -> Option<&dyn RequireModule> {
        Some(self)
    }
}

#[derive(Trace, Finalize)]
struct AlgCaptures {
    #[unsafe_ignore_trace]
    alg: &'static str,
}

impl RequireModule for CryptoModule {
    fn create(&self, ctx: &mut Context, _shared: &VmShared) -> JsResult<JsValue> {
        let exports = JsObject::with_object_proto(ctx.intrinsics());

        for alg in ["md5", "sha1", "sha256", "sha384", "sha512"] {
            let func = FunctionObjectBuilder::new(
                ctx.realm(),
                NativeFunction::from_copy_closure_with_captures(
                    |_this, args, captures: &AlgCaptures, ctx| {
                        let data = string_arg(args, 0, "data")?;
                        let bytes = digest(captures.alg, data.as_bytes())
                            .ok_or_else(|| type_error("unknown digest"))?;
                        Ok(make_encoder(ctx, bytes)?.into())
                    },
                    AlgCaptures { alg },
                ),
            )
            .name(boa_engine::JsString::from(alg))
            .length(1)
            .build();
            exports.set(boa_engine::JsString::from(alg), func, false, ctx)?;
        }

        let hmac_fn = FunctionObjectBuilder::new(
            ctx.realm(),
            NativeFunction::from_copy_closure(|_this, args, ctx| {
                let alg = string_arg(args, 0, "algorithm")?;
                let key = string_arg(args, 1, "key")?;
                let data = string_arg(args, 2, "data")?;
                let bytes = hmac_digest(&alg, key.as_bytes(), data.as_bytes())
                    .ok_or_else(|| type_error(format!("unknown hmac algorithm '{alg}'")))?;
                Ok(make_encoder(ctx, bytes)?.into())
            }),
        )
        .name(js_string!("hmac"))
        .length(3)
        .build();
        exports.set(js_string!("hmac"), hmac_fn, false, ctx)?;

        let random_fn = FunctionObjectBuilder::new(
            ctx.realm(),
            NativeFunction::from_copy_closure(|_this, args, ctx| {
                let n = args.get_or_undefined(0).to_number(ctx)?;
                if !n.is_finite() || n < 0.0 || n > 65536.0 {
                    return Err(type_error("randomBytes size must be between 0 and 65536"));
                }
                let mut bytes = vec![0u8; n as usize];
                rand::thread_rng().fill_bytes(&mut bytes);
                Ok(make_encoder(ctx, bytes)?.into())
            }),
        )
        .name(js_string!("randomBytes"))
        .length(1)
        .build();
        exports.set(js_string!("randomBytes"), random_fn, false, ctx)?;

        Ok(exports.into())
    }
}

#[cfg(test)]
mod tests {
    use crate::vm::manager::test_support::test_vm;

    #[test]
    fn sha256_hex_matches_known_vector() {
        let (mut vm, _el) = test_vm();
        let out = vm
            .eval_to_json("require('crypto').sha256('abc').hex()")
            .unwrap();
        assert_eq!(
            out,
            Some(serde_json::json!(
                "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
            ))
        );
    }

    #[test]
    fn md5_base64_matches_known_vector() {
        let (mut vm, _el) = test_vm();
        let out = vm
            .eval_to_json("require('crypto').md5('hello').base64()")
            .unwrap();
        assert_eq!(out, Some(serde_json::json!("XUFAKrxLKna5cZ2REBfFkg==")));
    }

    #[test]
    fn hmac_sha256_matches_known_vector() {
        let (mut vm, _el) = test_vm();
        let out = vm
            .eval_to_json("require('crypto').hmac('sha256', 'key', 'message').hex()")
            .unwrap();
        assert_eq!(
            out,
            Some(serde_json::json!(
                "6e9ef29b75fffc5b7abae527d58fdadb2fe42e7219011976917343065f58ed4a"
            ))
        );
    }

    #[test]
    fn random_bytes_has_requested_length() {
        let (mut vm, _el) = test_vm();
        let out = vm
            .eval_to_json("require('crypto').randomBytes(16).bytes().length")
            .unwrap();
        assert_eq!(out, Some(serde_json::json!(16.0)));
    }

    #[test]
    fn unknown_hmac_algorithm_errors() {
        let (mut vm, _el) = test_vm();
        let err = vm
            .eval("require('crypto').hmac('crc32', 'k', 'm')")
            .unwrap_err();
        assert!(err.to_string().contains("unknown hmac algorithm"), "got {err}");
    }
}
