//! HTTP control surface.
//!
//! Exposes script execution over two endpoints:
//!
//! - `POST /execute` with a JSON body `{"code": "...", "timeout_ms": n?}`.
//!   Responds with the execution outcome; a script that opened a listener
//!   reports `detached: true` and keeps serving in the background.
//! - `GET /health` with a liveness summary.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};

use capsule_core::vm::ModulePolicy;
use capsule_core::{Executor, ExecutorConfig, VmManager};

/// Scripts larger than this are rejected up front.
const MAX_SOURCE_BYTES: usize = 1 << 20;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Core(#[from] capsule_core::CoreError),
}

#[derive(Clone)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub timeout: Duration,
    pub policy: ModulePolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: ([127, 0, 0, 1], 8080).into(),
            timeout: Duration::from_secs(300),
            policy: ModulePolicy::AllowAll,
        }
    }
}

#[derive(Deserialize)]
struct ExecuteRequest {
    code: String,
    /// Per-request deadline override, capped by the configured timeout.
    timeout_ms: Option<u64>,
}

#[derive(Serialize)]
struct ExecuteResponse {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<serde_json::Value>,
    output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    detached: bool,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    detached: usize,
}

pub struct Server {
    listener: tokio::net::TcpListener,
    addr: SocketAddr,
    executor: Arc<Executor>,
}

impl Server {
    /// Bind the control socket and build the executor. Serving does not
    /// start until [`Server::serve`].
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let manager = Arc::new(VmManager::with_default_modules(config.policy.clone()));
        let executor = Arc::new(Executor::new(
            manager,
            ExecutorConfig {
                timeout: config.timeout,
            },
            tokio::runtime::Handle::current(),
        )?);
        let listener = tokio::net::TcpListener::bind(config.addr).await?;
        let addr = listener.local_addr()?;
        Ok(Self {
            listener,
            addr,
            executor,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Accept connections until the task is dropped.
    pub async fn serve(self) -> Result<(), ServerError> {
        tracing::info!(addr = %self.addr, "control server listening");
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    tracing::warn!(%err, "accept failed");
                    continue;
                }
            };
            tracing::debug!(%peer, "accepted control connection");
            let executor = Arc::clone(&self.executor);
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service =
                    service_fn(move |req| route(Arc::clone(&executor), req));
                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    tracing::debug!(%err, "control connection ended with error");
                }
            });
        }
    }
}

/// Bind and serve in one call.
pub async fn run(config: ServerConfig) -> Result<(), ServerError> {
    Server::bind(config).await?.serve().await
}

async fn route(
    executor: Arc<Executor>,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::POST, "/execute") => handle_execute(executor, req).await,
        (_, "/execute") => error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
        (&Method::GET, "/health") => json_response(
            StatusCode::OK,
            &HealthResponse {
                status: "ok",
                detached: executor.detached_count(),
            },
        ),
        _ => error_response(StatusCode::NOT_FOUND, "not found"),
    };
    Ok(response)
}

async fn handle_execute(
    executor: Arc<Executor>,
    req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                &format!("failed to read request body: {err}"),
            )
        }
    };
    if body.len() > MAX_SOURCE_BYTES {
        return error_response(StatusCode::PAYLOAD_TOO_LARGE, "script too large");
    }
    let request: ExecuteRequest = match serde_json::from_slice(&body) {
        Ok(parsed) => parsed,
        Err(err) => {
            return error_response(StatusCode::BAD_REQUEST, &format!("invalid request: {err}"))
        }
    };

    let timeout = request
        .timeout_ms
        .map(Duration::from_millis)
        .map(|t| t.min(executor.timeout()));
    let outcome = executor.execute_with_timeout(request.code, timeout).await;
    let status = if outcome.error.is_some() && !outcome.detached {
        StatusCode::UNPROCESSABLE_ENTITY
    } else {
        StatusCode::OK
    };
    json_response(
        status,
        &ExecuteResponse {
            ok: outcome.error.is_none(),
            result: outcome.result,
            output: outcome.output,
            error: outcome.error,
            detached: outcome.detached,
        },
    )
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from(body)))
            .unwrap_or_else(|_| Response::new(Full::new(Bytes::new()))),
        Err(err) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("failed to encode response: {err}"),
        ),
    }
}

fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let body = serde_json::json!({ "error": message });
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}
