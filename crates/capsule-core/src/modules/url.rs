//! `URL` and `URLSearchParams` globals.
//!
//! Parsing is delegated to the `url` crate. `searchParams` on a parsed
//! URL is its own object; mutating it does not rewrite `href`.

use std::cell::RefCell;
use std::rc::Rc;

use boa_engine::{
    js_string, object::builtins::JsArray, object::FunctionObjectBuilder, Context, JsArgs,
    JsObject, JsResult, JsValue, NativeFunction,
};
use boa_gc::{Finalize, Trace};

use crate::error::{CoreError, Result};
use crate::modules::type_error;
use crate::vm::manager::VmShared;
use crate::vm::module::Module;

type Params = Rc<RefCell<Vec<(String, String)>>>;

#[derive(Trace, Finalize)]
struct ParamsCaptures {
    #[unsafe_ignore_trace]
    params: Params,
}

fn make_search_params(ctx: &mut Context, params: Params) -> JsResult<JsObject> {
    let object = JsObject::with_object_proto(ctx.intrinsics());
    let cap = |params: &Params| ParamsCaptures {
        params: Rc::clone(params),
    };

    let get = FunctionObjectBuilder::new(
        ctx.realm(),
        NativeFunction::from_copy_closure_with_captures(
            |_this, args, captures: &ParamsCaptures, _ctx| {
                let Some(name) = args.get_or_undefined(0).as_string() else {
                    return Ok(JsValue::null());
                };
                let name = name.to_std_string_escaped();
                let found = captures
                    .params
                    .borrow()
                    .iter()
                    .find(|(k, _)| *k == name)
                    .map(|(_, v)| v.clone());
                Ok(found.map(|v| super::js_str(&v)).unwrap_or(JsValue::null()))
            },
            cap(&params),
        ),
    )
    .name(js_string!("get"))
    .length(1)
    .build();
    object.set(js_string!("get"), get, false, ctx)?;

    let get_all = FunctionObjectBuilder::new(
        ctx.realm(),
        NativeFunction::from_copy_closure_with_captures(
            |_this, args, captures: &ParamsCaptures, ctx| {
                let arr = JsArray::new(ctx);
                if let Some(name) = args.get_or_undefined(0).as_string() {
                    let name = name.to_std_string_escaped();
                    for (_, v) in captures.params.borrow().iter().filter(|(k, _)| *k == name) {
                        arr.push(super::js_str(v), ctx)?;
                    }
                }
                Ok(arr.into())
            },
            cap(&params),
        ),
    )
    .name(js_string!("getAll"))
    .length(1)
    .build();
    object.set(js_string!("getAll"), get_all, false, ctx)?;

    let has = FunctionObjectBuilder::new(
        ctx.realm(),
        NativeFunction::from_copy_closure_with_captures(
            |_this, args, captures: &ParamsCaptures, _ctx| {
                let Some(name) = args.get_or_undefined(0).as_string() else {
                    return Ok(JsValue::from(false));
                };
                let name = name.to_std_string_escaped();
                Ok(JsValue::from(
                    captures.params.borrow().iter().any(|(k, _)| *k == name),
                ))
            },
            cap(&params),
        ),
    )
    .name(js_string!("has"))
    .length(1)
    .build();
    object.set(js_string!("has"), has, false, ctx)?;

    let append = FunctionObjectBuilder::new(
        ctx.realm(),
        NativeFunction::from_copy_closure_with_captures(
            |_this, args, captures: &ParamsCaptures, ctx| {
                let name = args.get_or_undefined(0).to_string(ctx)?.to_std_string_escaped();
                let value = args.get_or_undefined(1).to_string(ctx)?.to_std_string_escaped();
                captures.params.borrow_mut().push((name, value));
                Ok(JsValue::undefined())
            },
            cap(&params),
        ),
    )
    .name(js_string!("append"))
    .length(2)
    .build();
    object.set(js_string!("append"), append, false, ctx)?;

    let set = FunctionObjectBuilder::new(
        ctx.realm(),
        NativeFunction::from_copy_closure_with_captures(
            |_this, args, captures: &ParamsCaptures, ctx| {
                let name = args.get_or_undefined(0).to_string(ctx)?.to_std_string_escaped();
                let value = args.get_or_undefined(1).to_string(ctx)?.to_std_string_escaped();
                let mut params = captures.params.borrow_mut();
                params.retain(|(k, _)| *k != name);
                params.push((name, value));
                Ok(JsValue::undefined())
            },
            cap(&params),
        ),
    )
    .name(js_string!("set"))
    .length(2)
    .build();
    object.set(js_string!("set"), set, false, ctx)?;

    let delete = FunctionObjectBuilder::new(
        ctx.realm(),
        NativeFunction::from_copy_closure_with_captures(
            |_this, args, captures: &ParamsCaptures, ctx| {
                let name = args.get_or_undefined(0).to_string(ctx)?.to_std_string_escaped();
                captures.params.borrow_mut().retain(|(k, _)| *k != name);
                Ok(JsValue::undefined())
            },
            cap(&params),
        ),
    )
    .name(js_string!("delete"))
    .length(1)
    .build();
    object.set(js_string!("delete"), delete, false, ctx)?;

    let to_string = FunctionObjectBuilder::new(
        ctx.realm(),
        NativeFunction::from_copy_closure_with_captures(
            |_this, _args, captures: &ParamsCaptures, _ctx| {
                let encoded = url::form_urlencoded::Serializer::new(String::new())
                    .extend_pairs(captures.params.borrow().iter())
                    .finish();
                Ok(super::js_str(&encoded))
            },
            cap(&params),
        ),
    )
    .name(js_string!("toString"))
    .build();
    object.set(js_string!("toString"), to_string, false, ctx)?;

    Ok(object)
}

fn make_url_object(ctx: &mut Context, parsed: &url::Url) -> JsResult<JsObject> {
    let object = JsObject::with_object_proto(ctx.intrinsics());
    object.set(js_string!("href"), super::js_str(parsed.as_str()), false, ctx)?;
    object.set(
        js_string!("protocol"),
        super::js_str(&format!("{}:", parsed.scheme())),
        false,
        ctx,
    )?;
    object.set(
        js_string!("hostname"),
        super::js_str(parsed.host_str().unwrap_or("")),
        false,
        ctx,
    )?;
    let host = match (parsed.host_str(), parsed.port()) {
        (Some(h), Some(p)) => format!("{h}:{p}"),
        (Some(h), None) => h.to_string(),
        _ => String::new(),
    };
    object.set(js_string!("host"), super::js_str(&host), false, ctx)?;
    object.set(
        js_string!("port"),
        super::js_str(&parsed.port().map(|p| p.to_string()).unwrap_or_default()),
        false,
        ctx,
    )?;
    object.set(js_string!("pathname"), super::js_str(parsed.path()), false, ctx)?;
    object.set(
        js_string!("search"),
        super::js_str(
            &parsed
                .query()
                .map(|q| format!("?{q}"))
                .unwrap_or_default(),
        ),
        false,
        ctx,
    )?;
    object.set(
        js_string!("hash"),
        super::js_str(
            &parsed
                .fragment()
                .map(|f| format!("#{f}"))
                .unwrap_or_default(),
        ),
        false,
        ctx,
    )?;
    object.set(
        js_string!("origin"),
        super::js_str(&parsed.origin().ascii_serialization()),
        false,
        ctx,
    )?;

    let params: Params = Rc::new(RefCell::new(
        parsed
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect(),
    ));
    let search_params = make_search_params(ctx, params)?;
    object.set(js_string!("searchParams"), search_params, false, ctx)?;

    #[derive(Trace, Finalize)]
    struct HrefCaptures {
        #[unsafe_ignore_trace]
        href: String,
    }
    let to_string = FunctionObjectBuilder::new(
        ctx.realm(),
        NativeFunction::from_copy_closure_with_captures(
            |_this, _args, captures: &HrefCaptures, _ctx| Ok(super::js_str(&captures.href)),
            HrefCaptures {
                href: parsed.as_str().to_string(),
            },
        ),
    )
    .name(js_string!("toString"))
    .build();
    object.set(js_string!("toString"), to_string, false, ctx)?;

    Ok(object)
}

pub struct UrlModule;

impl Module for UrlModule {
    fn name(&self) -> &'static str {
        "url"
    }

    fn setup(&self, ctx: &mut Context, _shared: &VmShared) -> Result<()> {
        let setup_err = |e: boa_engine::JsError| CoreError::Setup {
            module: "url".into(),
            message: e.to_string(),
        };

        let url_ctor = FunctionObjectBuilder::new(
            ctx.realm(),
            NativeFunction::from_copy_closure(|_this, args, ctx| {
                let Some(input) = args.get_or_undefined(0).as_string() else {
                    return Err(type_error("URL expects a string"));
                };
                let input = input.to_std_string_escaped();
                let parsed = match args.get_or_undefined(1).as_string() {
                    Some(base) => {
                        let base = url::Url::parse(&base.to_std_string_escaped())
                            .map_err(|e| type_error(format!("invalid base URL: {e}")))?;
                        base.join(&input)
                    }
                    None => url::Url::parse(&input),
                }
                .map_err(|e| type_error(format!("invalid URL '{input}': {e}")))?;
                Ok(make_url_object(ctx, &parsed)?.into())
            }),
        )
        .name(js_string!("URL"))
        .length(1)
        .constructor(true)
        .build();
        ctx.global_object()
            .set(js_string!("URL"), url_ctor, false, ctx)
            .map_err(setup_err)?;

        let params_ctor = FunctionObjectBuilder::new(
            ctx.realm(),
            NativeFunction::from_copy_closure(|_this, args, ctx| {
                let init = args
                    .get_or_undefined(0)
                    .as_string()
                    .map(|s| s.to_std_string_escaped())
                    .unwrap_or_default();
                let init = init.strip_prefix('?').unwrap_or(&init).to_string();
                let params: Params = Rc::new(RefCell::new(
                    url::form_urlencoded::parse(init.as_bytes())
                        .map(|(k, v)| (k.into_owned(), v.into_owned()))
                        .collect(),
                ));
                Ok(make_search_params(ctx, params)?.into())
            }),
        )
        .name(js_string!("URLSearchParams"))
        .length(1)
        .constructor(true)
        .build();
        ctx.global_object()
            .set(js_string!("URLSearchParams"), params_ctor, false, ctx)
            .map_err(setup_err)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::vm::manager::test_support::test_vm;
    use serde_json::json;

    #[test]
    fn url_exposes_components() {
        let (mut vm, _el) = test_vm();
        let out = vm
            .eval_to_json(
                "const u = new URL('https://example.com:8443/a/b?x=1#top');\n\
                 [u.protocol, u.hostname, u.port, u.pathname, u.search, u.hash]",
            )
            .unwrap();
        assert_eq!(
            out,
            Some(json!(["https:", "example.com", "8443", "/a/b", "?x=1", "#top"]))
        );
    }

    #[test]
    fn url_join_with_base() {
        let (mut vm, _el) = test_vm();
        let out = vm
            .eval_to_json("new URL('/p', 'https://example.com/q').toString()")
            .unwrap();
        assert_eq!(out, Some(json!("https://example.com/p")));
    }

    #[test]
    fn invalid_url_throws() {
        let (mut vm, _el) = test_vm();
        let err = vm.eval("new URL('not a url')").unwrap_err();
        assert!(err.to_string().contains("invalid URL"), "got {err}");
    }

    #[test]
    fn search_params_crud() {
        let (mut vm, _el) = test_vm();
        let out = vm
            .eval_to_json(
                "const p = new URLSearchParams('a=1&b=2&a=3');\n\
                 p.set('b', '9'); p.delete('a'); p.append('c', 'x');\n\
                 [p.get('b'), p.has('a'), p.toString()]",
            )
            .unwrap();
        assert_eq!(out, Some(json!(["9", false, "b=9&c=x"])));
    }

    #[test]
    fn get_all_returns_every_value() {
        let (mut vm, _el) = test_vm();
        let out = vm
            .eval_to_json("new URLSearchParams('a=1&a=2').getAll('a')")
            .unwrap();
        assert_eq!(out, Some(json!(["1", "2"])));
    }
}
