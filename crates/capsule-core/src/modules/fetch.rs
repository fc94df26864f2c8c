//! Global `fetch`.
//!
//! Outbound requests run synchronously on the loop thread with a hard
//! 30s timeout. Scripts see the usual shape: the returned object carries
//! status fields plus `text()` and `json()` readers over the buffered
//! body.
//!
//! The HTTP client is built lazily on first use. The module itself is
//! constructed wherever the manager is (often inside an async runtime,
//! where a blocking client must not be created); the first `fetch()`
//! call always runs on a plain VM thread.

use std::sync::Arc;
use std::time::Duration;

use boa_engine::{
    js_string, object::FunctionObjectBuilder, Context, JsArgs, JsObject, JsResult, JsString,
    JsValue, NativeFunction,
};
use boa_gc::{Finalize, Trace};
use parking_lot::Mutex;

use crate::modules::{display_value, type_error};
use crate::vm::manager::VmShared;
use crate::vm::module::{GlobalModule, Module};

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

type ClientSlot = Arc<Mutex<Option<reqwest::blocking::Client>>>;

#[derive(Default)]
pub struct FetchModule {
    client: ClientSlot,
}

impl FetchModule {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Module for FetchModule {
    fn name(&self) -> &'static str {
        "fetch"
    }

    fn as_global(&self) -> Option<&dyn GlobalModule> {
        Some(self)
    }
}

#[derive(Trace, Finalize)]
struct FetchCaptures {
    #[unsafe_ignore_trace]
    client: ClientSlot,
}

fn obtain_client(slot: &ClientSlot) -> JsResult<reqwest::blocking::Client> {
    let mut slot = slot.lock();
    if let Some(client) = &*slot {
        return Ok(client.clone());
    }
    let client = reqwest::blocking::Client::builder()
        .timeout(FETCH_TIMEOUT)
        .build()
        .map_err(|e| type_error(format!("fetch is unavailable: {e}")))?;
    *slot = Some(client.clone());
    Ok(client)
}

impl GlobalModule for FetchModule {
    fn global_name(&self) -> &'static str {
        "fetch"
    }

    fn create_global(&self, ctx: &mut Context, _shared: &VmShared) -> JsResult<JsValue> {
        let func = FunctionObjectBuilder::new(
            ctx.realm(),
            NativeFunction::from_copy_closure_with_captures(
                |_this, args, captures: &FetchCaptures, ctx| do_fetch(ctx, captures, args),
                FetchCaptures {
                    client: Arc::clone(&self.client),
                },
            ),
        )
        .name(js_string!("fetch"))
        .length(1)
        .build();
        Ok(func.into())
    }
}

fn do_fetch(ctx: &mut Context, captures: &FetchCaptures, args: &[JsValue]) -> JsResult<JsValue> {
    let Some(url) = args.get_or_undefined(0).as_string() else {
        return Err(type_error("fetch() expects a URL string"));
    };
    let url = url.to_std_string_escaped();

    let mut method = "GET".to_string();
    let mut headers: Vec<(String, String)> = Vec::new();
    let mut body: Option<String> = None;

    if let Some(opts) = args.get_or_undefined(1).as_object() {
        if let Some(m) = opts.get(js_string!("method"), ctx)?.as_string() {
            method = m.to_std_string_escaped();
        }
        if let Some(header_obj) = opts.get(js_string!("headers"), ctx)?.as_object() {
            for key in header_obj.own_property_keys(ctx)? {
                let boa_engine::property::PropertyKey::String(name) = &key else {
                    continue;
                };
                let name = name.to_std_string_escaped();
                let value = header_obj.get(key, ctx)?;
                if !value.is_undefined() {
                    headers.push((name, display_value(&value, ctx)));
                }
            }
        }
        let body_val = opts.get(js_string!("body"), ctx)?;
        if !body_val.is_undefined() && !body_val.is_null() {
            body = Some(display_value(&body_val, ctx));
        }
    }

    let method = reqwest::Method::from_bytes(method.as_bytes())
        .map_err(|_| type_error(format!("invalid method '{method}'")))?;
    let client = obtain_client(&captures.client)?;
    let mut request = client.request(method, &url);
    for (name, value) in headers {
        request = request.header(name, value);
    }
    if let Some(body) = body {
        request = request.body(body);
    }

    let response = request
        .send()
        .map_err(|e| type_error(format!("fetch failed: {e}")))?;

    let status = response.status();
    let final_url = response.url().to_string();
    let mut response_headers = Vec::new();
    for (name, value) in response.headers() {
        response_headers.push((
            name.as_str().to_string(),
            String::from_utf8_lossy(value.as_bytes()).into_owned(),
        ));
    }
    let text = response
        .text()
        .map_err(|e| type_error(format!("failed to read response body: {e}")))?;

    build_response_object(ctx, status, &final_url, &response_headers, text)
}

#[derive(Trace, Finalize)]
struct BodyCaptures {
    #[unsafe_ignore_trace]
    text: String,
}

fn build_response_object(
    ctx: &mut Context,
    status: reqwest::StatusCode,
    url: &str,
    headers: &[(String, String)],
    text: String,
) -> JsResult<JsValue> {
    let response = JsObject::with_object_proto(ctx.intrinsics());
    response.set(js_string!("status"), JsValue::from(status.as_u16()), false, ctx)?;
    response.set(
        js_string!("statusText"),
        super::js_str(status.canonical_reason().unwrap_or("")),
        false,
        ctx,
    )?;
    response.set(js_string!("ok"), JsValue::from(status.is_success()), false, ctx)?;
    response.set(js_string!("url"), super::js_str(url), false, ctx)?;

    let header_obj = JsObject::with_object_proto(ctx.intrinsics());
    for (name, value) in headers {
        header_obj.set(JsString::from(name.as_str()), super::js_str(value), false, ctx)?;
    }
    response.set(js_string!("headers"), header_obj, false, ctx)?;

    let text_fn = FunctionObjectBuilder::new(
        ctx.realm(),
        NativeFunction::from_copy_closure_with_captures(
            |_this, _args, captures: &BodyCaptures, _ctx| Ok(super::js_str(&captures.text)),
            BodyCaptures { text: text.clone() },
        ),
    )
    .name(js_string!("text"))
    .build();
    response.set(js_string!("text"), text_fn, false, ctx)?;

    let json_fn = FunctionObjectBuilder::new(
        ctx.realm(),
        NativeFunction::from_copy_closure_with_captures(
            |_this, _args, captures: &BodyCaptures, ctx| {
                let parsed: serde_json::Value = serde_json::from_str(&captures.text)
                    .map_err(|e| type_error(format!("invalid JSON in response body: {e}")))?;
                crate::conversions::json_to_js(&parsed, ctx)
            },
            BodyCaptures { text },
        ),
    )
    .name(js_string!("json"))
    .build();
    response.set(js_string!("json"), json_fn, false, ctx)?;

    Ok(response.into())
}

#[cfg(test)]
mod tests {
    use crate::vm::manager::test_support::test_vm;
    use crate::vm::manager::VmManager;
    use crate::vm::module::ModulePolicy;

    #[tokio::test(flavor = "multi_thread")]
    async fn module_construction_is_safe_inside_async_runtime() {
        // A blocking HTTP client must not be built here; the manager
        // (and this module) are routinely created from async callers.
        let manager = VmManager::with_default_modules(ModulePolicy::AllowAll);
        assert!(manager.policy().is_enabled("fetch"));
    }

    #[test]
    fn fetch_rejects_non_string_url() {
        let (mut vm, _el) = test_vm();
        let err = vm.eval("fetch(42)").unwrap_err();
        assert!(err.to_string().contains("expects a URL string"), "got {err}");
    }

    #[test]
    fn fetch_reports_connection_failure() {
        let (mut vm, _el) = test_vm();
        // Port 1 on localhost is essentially never listening.
        let err = vm.eval("fetch('http://127.0.0.1:1/')").unwrap_err();
        assert!(err.to_string().contains("fetch failed"), "got {err}");
    }
}
