//! HTTP server capability.
//!
//! `require('http').serve(...)` binds a TCP listener synchronously (so a
//! port conflict surfaces as a thrown error at the call site) and then
//! serves connections from tokio tasks. Handlers always run on the loop
//! thread: each inbound request becomes a job carrying a one-shot
//! back-channel, and the connection task blocks on that channel until
//! the handler (or the error chain) produces a response.
//!
//! An open listener holds one listener slot and one enqueue reservation
//! on the event loop, which is what keeps a server script alive after
//! its top-level code returns.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::TcpListener as StdTcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use boa_engine::{
    builtins::promise::PromiseState,
    js_string,
    object::{builtins::JsPromise, FunctionObjectBuilder},
    Context, JsArgs, JsObject, JsResult, JsString, JsValue, NativeFunction,
};
use boa_gc::{Finalize, Trace};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioIo, TokioTimer};
use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinSet;

use crate::error::{CoreError, Result};
use crate::modules::console::ConsoleSink;
use crate::modules::{display_value, type_error};
use crate::vm::event_loop::{EnqueueHandle, EventLoop};
use crate::vm::manager::{SharedCaptures, Vm, VmShared};
use crate::vm::module::{Module, RequireModule};

const ERR_NOT_RESPONSE: &str =
    "return value from handler must be a response or a promise resolving to a response";

/// Everything a connection task needs from an inbound request, detached
/// from hyper's types so it can cross into a loop job.
pub(crate) struct RequestParts {
    method: String,
    uri: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

/// A response in plain owned data, buildable on the loop thread and
/// convertible back to a hyper response on the connection task.
pub(crate) struct ResponsePayload {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl ResponsePayload {
    fn internal_error() -> Self {
        Self {
            status: 500,
            headers: vec![("content-type".into(), "text/plain".into())],
            body: b"Internal Server Error".to_vec(),
        }
    }

    fn not_found() -> Self {
        Self {
            status: 404,
            headers: vec![("content-type".into(), "text/plain".into())],
            body: b"Not Found".to_vec(),
        }
    }

    fn into_response(self) -> Response<Full<Bytes>> {
        let mut builder = Response::builder().status(self.status);
        for (name, value) in &self.headers {
            builder = builder.header(name, value);
        }
        builder
            .body(Full::new(Bytes::from(self.body)))
            .unwrap_or_else(|_| {
                Response::builder()
                    .status(500)
                    .body(Full::new(Bytes::from_static(b"Internal Server Error")))
                    .unwrap_or_default()
            })
    }
}

/// Write-once reply channel for a single request. Cloned into promise
/// reaction closures; only the first `send` wins.
#[derive(Clone)]
pub(crate) struct Responder(Arc<Mutex<Option<oneshot::Sender<ResponsePayload>>>>);

impl Responder {
    fn new(tx: oneshot::Sender<ResponsePayload>) -> Self {
        Self(Arc::new(Mutex::new(Some(tx))))
    }

    fn send(&self, payload: ResponsePayload) {
        if let Some(tx) = self.0.lock().take() {
            let _ = tx.send(payload);
        }
    }
}

/// Send half of a server's lifecycle, shared with its accept task.
pub(crate) struct ServerControl {
    closed: AtomicBool,
    abort: Notify,
    drain: Notify,
    event_loop: Arc<EventLoop>,
    ref_token: Mutex<Option<EnqueueHandle>>,
}

impl ServerControl {
    fn new(event_loop: Arc<EventLoop>, token: EnqueueHandle) -> Arc<Self> {
        Arc::new(Self {
            closed: AtomicBool::new(false),
            abort: Notify::new(),
            drain: Notify::new(),
            event_loop,
            ref_token: Mutex::new(Some(token)),
        })
    }

    /// Give back the loop resources held for this listener. The first
    /// call wins; close/shutdown/teardown may all race here.
    fn release(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.event_loop.remove_listener();
        if let Some(token) = self.ref_token.lock().take() {
            token.submit(Box::new(|_vm| Ok(())));
        }
    }

    /// Stop accepting and drop in-flight connections.
    fn close(&self) {
        self.abort.notify_one();
        self.release();
    }

    /// Stop accepting but let in-flight requests finish.
    fn shutdown(&self) {
        self.drain.notify_one();
        self.release();
    }
}

struct ServerEntry {
    handler: Option<JsObject>,
    on_error: Option<JsObject>,
    control: Arc<ServerControl>,
}

/// Per-VM table of live servers.
#[derive(Default)]
pub struct ServerTable {
    next_id: u64,
    entries: HashMap<u64, ServerEntry>,
}

impl ServerTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(
        &mut self,
        handler: Option<JsObject>,
        on_error: Option<JsObject>,
        control: Arc<ServerControl>,
    ) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.entries.insert(
            id,
            ServerEntry {
                handler,
                on_error,
                control,
            },
        );
        id
    }

    fn snapshot(&self, id: u64) -> Option<(Option<JsObject>, Option<JsObject>)> {
        self.entries
            .get(&id)
            .map(|e| (e.handler.clone(), e.on_error.clone()))
    }

    pub fn close_all(&mut self) {
        for (_, entry) in self.entries.drain() {
            entry.control.close();
        }
    }
}

#[derive(Clone, Copy)]
struct Http1Options {
    max_header_size: Option<usize>,
    keep_alive_timeout: Option<Duration>,
    request_timeout: Option<Duration>,
}

struct ServeOptions {
    port: u16,
    hostname: String,
    handler: Option<JsObject>,
    on_error: Option<JsObject>,
    on_listen: Option<JsObject>,
    http1: Http1Options,
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            port: 8000,
            hostname: "127.0.0.1".into(),
            handler: None,
            on_error: None,
            on_listen: None,
            http1: Http1Options {
                max_header_size: None,
                keep_alive_timeout: None,
                request_timeout: None,
            },
        }
    }
}

fn get_prop(obj: &JsObject, name: &str, ctx: &mut Context) -> JsResult<JsValue> {
    obj.get(JsString::from(name), ctx)
}

fn opt_callable(value: &JsValue, what: &str) -> JsResult<Option<JsObject>> {
    if value.is_undefined() || value.is_null() {
        return Ok(None);
    }
    match value.as_object().filter(|o| o.is_callable()) {
        Some(obj) => Ok(Some(obj.clone())),
        None => Err(type_error(format!("{what} must be a function"))),
    }
}

fn opt_millis(value: &JsValue, ctx: &mut Context, what: &str) -> JsResult<Option<Duration>> {
    if value.is_undefined() || value.is_null() {
        return Ok(None);
    }
    let ms = value.to_number(ctx)?;
    if !ms.is_finite() || ms < 0.0 {
        return Err(type_error(format!("invalid {what}")));
    }
    Ok(Some(Duration::from_millis(ms as u64)))
}

fn parse_serve_args(ctx: &mut Context, args: &[JsValue]) -> JsResult<ServeOptions> {
    let mut opts = ServeOptions::default();

    let first = args.get_or_undefined(0);
    if first.is_number() {
        // serve(port, handler)
        let n = first.to_number(ctx)?;
        if !n.is_finite() || n.fract() != 0.0 || !(0.0..=65535.0).contains(&n) {
            return Err(type_error("invalid port"));
        }
        opts.port = n as u16;
    } else if let Some(obj) = first.as_object() {
        if obj.is_callable() {
            opts.handler = Some(obj.clone());
        } else {
            let port = get_prop(obj, "port", ctx)?;
            if !port.is_undefined() {
                let n = port.to_number(ctx)?;
                if !n.is_finite() || n.fract() != 0.0 || !(0.0..=65535.0).contains(&n) {
                    return Err(type_error("invalid port"));
                }
                opts.port = n as u16;
            }
            if let Some(host) = get_prop(obj, "hostname", ctx)?.as_string() {
                opts.hostname = host.to_std_string_escaped();
            }
            let max_header = get_prop(obj, "maxHeaderSize", ctx)?;
            if !max_header.is_undefined() {
                let n = max_header.to_number(ctx)?;
                if !n.is_finite() || n < 0.0 {
                    return Err(type_error("invalid maxHeaderSize"));
                }
                opts.http1.max_header_size = Some(n as usize);
            }
            opts.http1.keep_alive_timeout =
                opt_millis(&get_prop(obj, "keepAliveTimeout", ctx)?, ctx, "keepAliveTimeout")?;
            opts.http1.request_timeout =
                opt_millis(&get_prop(obj, "requestTimeout", ctx)?, ctx, "requestTimeout")?;
            opts.on_error = opt_callable(&get_prop(obj, "onError", ctx)?, "onError")?;
            opts.on_listen = opt_callable(&get_prop(obj, "onListen", ctx)?, "onListen")?;
            opts.handler = opt_callable(&get_prop(obj, "handler", ctx)?, "handler")?;
            if opts.handler.is_none() {
                opts.handler = opt_callable(&get_prop(obj, "fetch", ctx)?, "fetch")?;
            }
        }
    } else if !first.is_undefined() {
        return Err(type_error(
            "serve() expects a handler function or an options object",
        ));
    }

    if let Some(second) = args.get(1) {
        if let Some(handler) = opt_callable(second, "handler")? {
            opts.handler = Some(handler);
        }
    }

    Ok(opts)
}

fn server_url(hostname: &str, port: u16) -> String {
    if port == 80 {
        format!("http://{hostname}")
    } else {
        format!("http://{hostname}:{port}")
    }
}

fn serve(ctx: &mut Context, shared: &VmShared, args: &[JsValue]) -> JsResult<JsValue> {
    let opts = parse_serve_args(ctx, args)?;

    let listener = StdTcpListener::bind((opts.hostname.as_str(), opts.port)).map_err(|e| {
        type_error(format!(
            "failed to bind {}:{}: {e}",
            opts.hostname, opts.port
        ))
    })?;
    listener
        .set_nonblocking(true)
        .map_err(|e| type_error(format!("failed to configure listener: {e}")))?;
    let port = listener
        .local_addr()
        .map_err(|e| type_error(format!("failed to read listener address: {e}")))?
        .port();

    let event_loop = Arc::clone(&shared.event_loop);
    event_loop.add_listener();
    let control = ServerControl::new(Arc::clone(&event_loop), event_loop.enqueue_job());

    let id = shared.servers.borrow_mut().insert(
        opts.handler.clone(),
        opts.on_error.clone(),
        Arc::clone(&control),
    );

    let url = server_url(&opts.hostname, port);
    tracing::info!(%url, server = id, "listening");

    shared.rt.spawn(accept_loop(
        listener,
        Arc::clone(&control),
        Arc::clone(&event_loop),
        id,
        opts.http1,
    ));

    let server = build_server_object(ctx, &opts.hostname, port, &url, &control)?;

    if let Some(on_listen) = &opts.on_listen {
        let info = JsObject::with_object_proto(ctx.intrinsics());
        info.set(js_string!("hostname"), super::js_str(&opts.hostname), false, ctx)?;
        info.set(js_string!("port"), JsValue::from(port), false, ctx)?;
        info.set(js_string!("url"), super::js_str(&url), false, ctx)?;
        on_listen.call(&JsValue::undefined(), &[info.into()], ctx)?;
    }

    Ok(server.into())
}

#[derive(Trace, Finalize)]
struct ControlCaptures {
    #[unsafe_ignore_trace]
    control: Arc<ServerControl>,
}

fn build_server_object(
    ctx: &mut Context,
    hostname: &str,
    port: u16,
    url: &str,
    control: &Arc<ServerControl>,
) -> JsResult<JsObject> {
    let server = JsObject::with_object_proto(ctx.intrinsics());
    server.set(js_string!("hostname"), super::js_str(hostname), false, ctx)?;
    server.set(js_string!("port"), JsValue::from(port), false, ctx)?;
    server.set(js_string!("url"), super::js_str(url), false, ctx)?;

    let close = FunctionObjectBuilder::new(
        ctx.realm(),
        NativeFunction::from_copy_closure_with_captures(
            |_this, _args, captures: &ControlCaptures, _ctx| {
                captures.control.close();
                Ok(JsValue::undefined())
            },
            ControlCaptures {
                control: Arc::clone(control),
            },
        ),
    )
    .name(js_string!("close"))
    .build();
    server.set(js_string!("close"), close, false, ctx)?;

    let shutdown = FunctionObjectBuilder::new(
        ctx.realm(),
        NativeFunction::from_copy_closure_with_captures(
            |_this, _args, captures: &ControlCaptures, _ctx| {
                captures.control.shutdown();
                Ok(JsValue::undefined())
            },
            ControlCaptures {
                control: Arc::clone(control),
            },
        ),
    )
    .name(js_string!("shutdown"))
    .build();
    server.set(js_string!("shutdown"), shutdown, false, ctx)?;

    Ok(server)
}

async fn accept_loop(
    listener: StdTcpListener,
    control: Arc<ServerControl>,
    event_loop: Arc<EventLoop>,
    server_id: u64,
    http1: Http1Options,
) {
    let listener = match tokio::net::TcpListener::from_std(listener) {
        Ok(l) => l,
        Err(err) => {
            tracing::error!(%err, server = server_id, "failed to register listener");
            control.release();
            return;
        }
    };

    let mut connections: JoinSet<()> = JoinSet::new();
    loop {
        tokio::select! {
            _ = control.abort.notified() => {
                connections.abort_all();
                break;
            }
            _ = control.drain.notified() => {
                while connections.join_next().await.is_some() {}
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!(%peer, server = server_id, "accepted connection");
                        let event_loop = Arc::clone(&event_loop);
                        connections.spawn(serve_connection(stream, event_loop, server_id, http1));
                    }
                    Err(err) => {
                        tracing::warn!(%err, server = server_id, "accept failed");
                    }
                }
            }
        }
    }
    control.release();
}

async fn serve_connection(
    stream: tokio::net::TcpStream,
    event_loop: Arc<EventLoop>,
    server_id: u64,
    http1_opts: Http1Options,
) {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        handle_request(Arc::clone(&event_loop), server_id, http1_opts.request_timeout, req)
    });

    let mut builder = http1::Builder::new();
    builder.keep_alive(true);
    if let Some(max) = http1_opts.max_header_size {
        // hyper rejects read buffers smaller than its minimum.
        builder.max_buf_size(max.max(8192));
    }
    if let Some(idle) = http1_opts.keep_alive_timeout {
        builder.timer(TokioTimer::new()).header_read_timeout(idle);
    }

    if let Err(err) = builder.serve_connection(io, service).await {
        tracing::debug!(%err, server = server_id, "connection ended with error");
    }
}

async fn handle_request(
    event_loop: Arc<EventLoop>,
    server_id: u64,
    request_timeout: Option<Duration>,
    req: Request<Incoming>,
) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    let (head, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes().to_vec(),
        Err(_) => Vec::new(),
    };
    let headers = head
        .headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();
    let parts = RequestParts {
        method: head.method.to_string(),
        uri: head.uri.to_string(),
        headers,
        body,
    };

    let (tx, rx) = oneshot::channel();
    let responder = Responder::new(tx);
    event_loop
        .enqueue_job()
        .submit(Box::new(move |vm| dispatch(vm, server_id, parts, responder)));

    // A dropped sender (stopped loop, torn-down VM) degrades to a 500.
    let payload = match request_timeout {
        Some(limit) => match tokio::time::timeout(limit, rx).await {
            Ok(Ok(payload)) => payload,
            _ => ResponsePayload::internal_error(),
        },
        None => rx.await.unwrap_or_else(|_| ResponsePayload::internal_error()),
    };
    Ok(payload.into_response())
}

/// Loop-thread entry point for one request.
fn dispatch(vm: &mut Vm, server_id: u64, parts: RequestParts, responder: Responder) -> Result<()> {
    let entry = vm.shared().servers.borrow().snapshot(server_id);
    let Some((handler, on_error)) = entry else {
        responder.send(ResponsePayload::internal_error());
        return Ok(());
    };
    let sink = vm.shared().console.clone();

    let Some(handler) = handler else {
        responder.send(ResponsePayload::not_found());
        return Ok(());
    };

    let request = match build_request_object(vm.context(), &parts) {
        Ok(obj) => obj,
        Err(err) => {
            write_error(
                vm.context(),
                on_error.as_ref(),
                &responder,
                &sink,
                err.to_string(),
                &parts.method,
                &parts.uri,
            );
            return Ok(());
        }
    };

    match vm.call_function(&handler, &[request.into()]) {
        Ok(value) => settle_handler_result(
            vm.context(),
            on_error.as_ref(),
            &responder,
            &sink,
            &value,
            &parts.method,
            &parts.uri,
        ),
        Err(err) => write_error(
            vm.context(),
            on_error.as_ref(),
            &responder,
            &sink,
            err.to_string(),
            &parts.method,
            &parts.uri,
        ),
    }
    // Handler failures are reported through the response and diagnostics,
    // not as loop errors; one bad request must not stop the server.
    Ok(())
}

fn build_request_object(ctx: &mut Context, parts: &RequestParts) -> JsResult<JsObject> {
    let request = JsObject::with_object_proto(ctx.intrinsics());
    request.set(js_string!("method"), super::js_str(&parts.method), false, ctx)?;
    request.set(js_string!("url"), super::js_str(&parts.uri), false, ctx)?;

    let headers = JsObject::with_object_proto(ctx.intrinsics());
    for (name, value) in &parts.headers {
        headers.set(JsString::from(name.as_str()), super::js_str(value), false, ctx)?;
    }
    request.set(js_string!("headers"), headers, false, ctx)?;

    let body = String::from_utf8_lossy(&parts.body).into_owned();
    request.set(js_string!("body"), super::js_str(&body), false, ctx)?;

    #[derive(Trace, Finalize)]
    struct BodyCaptures {
        #[unsafe_ignore_trace]
        body: String,
    }

    let text = FunctionObjectBuilder::new(
        ctx.realm(),
        NativeFunction::from_copy_closure_with_captures(
            |_this, _args, captures: &BodyCaptures, _ctx| Ok(super::js_str(&captures.body)),
            BodyCaptures { body: body.clone() },
        ),
    )
    .name(js_string!("text"))
    .build();
    request.set(js_string!("text"), text, false, ctx)?;

    let json = FunctionObjectBuilder::new(
        ctx.realm(),
        NativeFunction::from_copy_closure_with_captures(
            |_this, _args, captures: &BodyCaptures, ctx| {
                let parsed: serde_json::Value = serde_json::from_str(&captures.body)
                    .map_err(|e| type_error(format!("invalid JSON body: {e}")))?;
                crate::conversions::json_to_js(&parsed, ctx)
            },
            BodyCaptures { body },
        ),
    )
    .name(js_string!("json"))
    .build();
    request.set(js_string!("json"), json, false, ctx)?;

    Ok(request)
}

/// Interpret a handler's return value. Promises are inspected by state:
/// already-settled ones are unwrapped in place, pending ones get
/// reactions attached and the reply waits for settlement.
fn settle_handler_result(
    ctx: &mut Context,
    on_error: Option<&JsObject>,
    responder: &Responder,
    sink: &ConsoleSink,
    value: &JsValue,
    method: &str,
    url: &str,
) {
    if let Some(obj) = value.as_object() {
        if let Ok(promise) = JsPromise::from_object(obj.clone()) {
            match promise.state() {
                PromiseState::Fulfilled(v) => match to_response(ctx, &v) {
                    Some(payload) => responder.send(payload),
                    None => write_error(
                        ctx,
                        on_error,
                        responder,
                        sink,
                        ERR_NOT_RESPONSE.into(),
                        method,
                        url,
                    ),
                },
                PromiseState::Rejected(v) => {
                    let message = display_value(&v, ctx);
                    write_error(ctx, on_error, responder, sink, message, method, url);
                }
                PromiseState::Pending => {
                    attach_settlement(ctx, obj, on_error, responder, sink, method, url);
                }
            }
            return;
        }
    }

    match to_response(ctx, value) {
        Some(payload) => responder.send(payload),
        None => write_error(
            ctx,
            on_error,
            responder,
            sink,
            ERR_NOT_RESPONSE.into(),
            method,
            url,
        ),
    }
}

#[derive(Trace, Finalize)]
struct SettleCaptures {
    #[unsafe_ignore_trace]
    responder: Responder,
    #[unsafe_ignore_trace]
    sink: ConsoleSink,
    on_error: Option<JsObject>,
    #[unsafe_ignore_trace]
    method: String,
    #[unsafe_ignore_trace]
    url: String,
}

/// Attach `then(resolve, reject)` to a pending promise so the response
/// is produced when it settles.
fn attach_settlement(
    ctx: &mut Context,
    promise: &JsObject,
    on_error: Option<&JsObject>,
    responder: &Responder,
    sink: &ConsoleSink,
    method: &str,
    url: &str,
) {
    let captures = SettleCaptures {
        responder: responder.clone(),
        sink: sink.clone(),
        on_error: on_error.cloned(),
        method: method.to_string(),
        url: url.to_string(),
    };

    let resolve = FunctionObjectBuilder::new(
        ctx.realm(),
        NativeFunction::from_copy_closure_with_captures(
            |_this, args, captures: &SettleCaptures, ctx| {
                let value = args.get_or_undefined(0);
                match to_response(ctx, value) {
                    Some(payload) => captures.responder.send(payload),
                    None => write_error(
                        ctx,
                        captures.on_error.as_ref(),
                        &captures.responder,
                        &captures.sink,
                        ERR_NOT_RESPONSE.into(),
                        &captures.method,
                        &captures.url,
                    ),
                }
                Ok(JsValue::undefined())
            },
            captures.duplicate(),
        ),
    )
    .build();

    let reject = FunctionObjectBuilder::new(
        ctx.realm(),
        NativeFunction::from_copy_closure_with_captures(
            |_this, args, captures: &SettleCaptures, ctx| {
                let message = display_value(args.get_or_undefined(0), ctx);
                write_error(
                    ctx,
                    captures.on_error.as_ref(),
                    &captures.responder,
                    &captures.sink,
                    message,
                    &captures.method,
                    &captures.url,
                );
                Ok(JsValue::undefined())
            },
            captures,
        ),
    )
    .build();

    let then = match promise.get(js_string!("then"), ctx) {
        Ok(v) => v,
        Err(_) => {
            responder.send(ResponsePayload::internal_error());
            return;
        }
    };
    let Some(then) = then.as_object().filter(|o| o.is_callable()) else {
        responder.send(ResponsePayload::internal_error());
        return;
    };
    if then
        .call(
            &promise.clone().into(),
            &[resolve.into(), reject.into()],
            ctx,
        )
        .is_err()
    {
        responder.send(ResponsePayload::internal_error());
    }
}

impl SettleCaptures {
    fn duplicate(&self) -> Self {
        Self {
            responder: self.responder.clone(),
            sink: self.sink.clone(),
            on_error: self.on_error.clone(),
            method: self.method.clone(),
            url: self.url.clone(),
        }
    }
}

/// Route a handler failure through the configured `onError` callback,
/// falling back to a fixed 500 when the callback itself misbehaves. The
/// fallback never re-enters the error chain.
fn write_error(
    ctx: &mut Context,
    on_error: Option<&JsObject>,
    responder: &Responder,
    sink: &ConsoleSink,
    message: String,
    method: &str,
    url: &str,
) {
    let Some(on_error) = on_error else {
        let line = format!("Internal Server Error {method} {url} {message}");
        tracing::error!("{line}");
        sink.push_line(&line);
        responder.send(ResponsePayload::internal_error());
        return;
    };

    let err_obj = match error_object(ctx, &message, method, url) {
        Ok(obj) => obj,
        Err(_) => {
            responder.send(ResponsePayload::internal_error());
            return;
        }
    };

    let result = on_error.call(&JsValue::undefined(), &[err_obj.into()], ctx);
    let _ = ctx.run_jobs();
    match result {
        Ok(value) => settle_error_result(ctx, responder, sink, &value),
        Err(err) => {
            tracing::error!(error = %err, "onError callback failed");
            responder.send(ResponsePayload::internal_error());
        }
    }
}

fn error_object(ctx: &mut Context, message: &str, method: &str, url: &str) -> JsResult<JsObject> {
    let err = JsObject::with_object_proto(ctx.intrinsics());
    err.set(js_string!("message"), super::js_str(message), false, ctx)?;
    err.set(js_string!("method"), super::js_str(method), false, ctx)?;
    err.set(js_string!("url"), super::js_str(url), false, ctx)?;
    Ok(err)
}

/// Like [`settle_handler_result`] but terminal: anything that is not a
/// response becomes the fixed 500.
fn settle_error_result(ctx: &mut Context, responder: &Responder, sink: &ConsoleSink, value: &JsValue) {
    if let Some(obj) = value.as_object() {
        if let Ok(promise) = JsPromise::from_object(obj.clone()) {
            match promise.state() {
                PromiseState::Fulfilled(v) => {
                    responder.send(to_response(ctx, &v).unwrap_or_else(ResponsePayload::internal_error));
                }
                PromiseState::Rejected(v) => {
                    let line = format!("onError rejected: {}", display_value(&v, ctx));
                    tracing::error!("{line}");
                    sink.push_line(&line);
                    responder.send(ResponsePayload::internal_error());
                }
                PromiseState::Pending => {
                    attach_error_settlement(ctx, obj, responder);
                }
            }
            return;
        }
    }
    responder.send(to_response(ctx, value).unwrap_or_else(ResponsePayload::internal_error));
}

#[derive(Trace, Finalize)]
struct ErrorSettleCaptures {
    #[unsafe_ignore_trace]
    responder: Responder,
}

fn attach_error_settlement(ctx: &mut Context, promise: &JsObject, responder: &Responder) {
    let resolve = FunctionObjectBuilder::new(
        ctx.realm(),
        NativeFunction::from_copy_closure_with_captures(
            |_this, args, captures: &ErrorSettleCaptures, ctx| {
                let value = args.get_or_undefined(0);
                captures
                    .responder
                    .send(to_response(ctx, value).unwrap_or_else(ResponsePayload::internal_error));
                Ok(JsValue::undefined())
            },
            ErrorSettleCaptures {
                responder: responder.clone(),
            },
        ),
    )
    .build();

    let reject = FunctionObjectBuilder::new(
        ctx.realm(),
        NativeFunction::from_copy_closure_with_captures(
            |_this, _args, captures: &ErrorSettleCaptures, _ctx| {
                captures.responder.send(ResponsePayload::internal_error());
                Ok(JsValue::undefined())
            },
            ErrorSettleCaptures {
                responder: responder.clone(),
            },
        ),
    )
    .build();

    let then_ok = promise
        .get(js_string!("then"), ctx)
        .ok()
        .and_then(|v| v.as_object().filter(|o| o.is_callable()).cloned())
        .and_then(|then| {
            then.call(
                &promise.clone().into(),
                &[resolve.into(), reject.into()],
                ctx,
            )
            .ok()
        });
    if then_ok.is_none() {
        responder.send(ResponsePayload::internal_error());
    }
}

/// Turn a script value into a response payload. Accepts anything with
/// the response shape: optional `status`, optional `headers` object, and
/// a body given either as a `body` string or a `text()` method.
fn to_response(ctx: &mut Context, value: &JsValue) -> Option<ResponsePayload> {
    let obj = value.as_object()?;
    if obj.is_callable() {
        return None;
    }

    let status = match obj.get(js_string!("status"), ctx) {
        Ok(v) if v.is_undefined() => 200,
        Ok(v) => {
            let n = v.as_number()?;
            if !(100.0..=999.0).contains(&n) {
                return None;
            }
            n as u16
        }
        Err(_) => return None,
    };

    let mut headers = Vec::new();
    if let Ok(v) = obj.get(js_string!("headers"), ctx) {
        if let Some(header_obj) = v.as_object() {
            if let Ok(keys) = header_obj.own_property_keys(ctx) {
                for key in keys {
                    let boa_engine::property::PropertyKey::String(name) = &key else {
                        continue;
                    };
                    let name = name.to_std_string_escaped();
                    if let Ok(val) = header_obj.get(key, ctx) {
                        if !val.is_undefined() {
                            headers.push((name, display_value(&val, ctx)));
                        }
                    }
                }
            }
        }
    }

    let body = match obj.get(js_string!("body"), ctx) {
        Ok(v) if !v.is_undefined() && !v.is_null() => {
            display_value(&v, ctx).into_bytes()
        }
        _ => match obj.get(js_string!("text"), ctx) {
            Ok(text) => match text.as_object().filter(|o| o.is_callable()) {
                Some(text_fn) => {
                    let out = text_fn.call(value, &[], ctx).ok()?;
                    display_value(&out, ctx).into_bytes()
                }
                None => Vec::new(),
            },
            Err(_) => Vec::new(),
        },
    };

    Some(ResponsePayload {
        status,
        headers,
        body,
    })
}

/// Global `Response` constructor: `new Response(body, {status, headers})`.
fn install_response_ctor(ctx: &mut Context) -> Result<()> {
    let ctor = FunctionObjectBuilder::new(
        ctx.realm(),
        NativeFunction::from_copy_closure(|_this, args, ctx| {
            let response = JsObject::with_object_proto(ctx.intrinsics());
            let body = args.get_or_undefined(0);
            if !body.is_undefined() && !body.is_null() {
                let text = display_value(body, ctx);
                response.set(js_string!("body"), super::js_str(&text), false, ctx)?;
            }
            let mut status = 200u16;
            if let Some(init) = args.get_or_undefined(1).as_object() {
                let status_val = init.get(js_string!("status"), ctx)?;
                if !status_val.is_undefined() {
                    let n = status_val.to_number(ctx)?;
                    if !n.is_finite() || !(100.0..=999.0).contains(&n) {
                        return Err(type_error("invalid response status"));
                    }
                    status = n as u16;
                }
                let headers = init.get(js_string!("headers"), ctx)?;
                if !headers.is_undefined() {
                    response.set(js_string!("headers"), headers, false, ctx)?;
                }
            }
            response.set(js_string!("status"), JsValue::from(status), false, ctx)?;
            response.set(
                js_string!("ok"),
                JsValue::from((200..300).contains(&status)),
                false,
                ctx,
            )?;
            Ok(response.into())
        }),
    )
    .name(js_string!("Response"))
    .length(2)
    .constructor(true)
    .build();

    ctx.global_object()
        .set(js_string!("Response"), ctor, false, ctx)
        .map_err(|e| CoreError::Setup {
            module: "http".into(),
            message: e.to_string(),
        })?;
    Ok(())
}

pub struct HttpModule;

impl Module for HttpModule {
    fn name(&self) -> &'static str {
        "http"
    }

    fn setup(&self, ctx: &mut Context, _shared: &VmShared) -> Result<()> {
        install_response_ctor(ctx)
    }

    fn as_require(&self) -> Option<&dyn RequireModule> {
        Some(self)
    }
}

impl RequireModule for HttpModule {
    fn create(&self, ctx: &mut Context, shared: &VmShared) -> JsResult<JsValue> {
        let exports = JsObject::with_object_proto(ctx.intrinsics());
        let serve_fn = FunctionObjectBuilder::new(
            ctx.realm(),
            NativeFunction::from_copy_closure_with_captures(
                |_this, args, captures: &SharedCaptures, ctx| serve(ctx, &captures.shared, args),
                SharedCaptures {
                    shared: shared.clone(),
                },
            ),
        )
        .name(js_string!("serve"))
        .length(1)
        .build();
        exports.set(js_string!("serve"), serve_fn, false, ctx)?;
        Ok(exports.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_omits_default_http_port() {
        assert_eq!(server_url("127.0.0.1", 80), "http://127.0.0.1");
        assert_eq!(server_url("127.0.0.1", 8080), "http://127.0.0.1:8080");
    }

    #[test]
    fn response_payload_conversion_preserves_fields() {
        let payload = ResponsePayload {
            status: 201,
            headers: vec![("x-test".into(), "1".into())],
            body: b"made".to_vec(),
        };
        let response = payload.into_response();
        assert_eq!(response.status(), 201);
        assert_eq!(response.headers().get("x-test").unwrap(), "1");
    }

    #[test]
    fn responder_only_first_send_wins() {
        let (tx, rx) = oneshot::channel();
        let responder = Responder::new(tx);
        responder.send(ResponsePayload::not_found());
        responder.send(ResponsePayload::internal_error());
        let got = rx.blocking_recv().unwrap();
        assert_eq!(got.status, 404);
    }
}
