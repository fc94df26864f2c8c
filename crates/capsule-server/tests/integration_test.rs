//! Control-surface tests against a live server on an ephemeral port.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use capsule_core::vm::ModulePolicy;
use capsule_server::{Server, ServerConfig};

async fn start_server(policy: ModulePolicy) -> std::net::SocketAddr {
    let server = Server::bind(ServerConfig {
        addr: ([127, 0, 0, 1], 0).into(),
        timeout: Duration::from_secs(10),
        policy,
    })
    .await
    .unwrap();
    let addr = server.local_addr();
    tokio::spawn(server.serve());
    addr
}

fn request(addr: std::net::SocketAddr, method: &str, path: &str, body: &str) -> (u16, String) {
    let mut stream = TcpStream::connect(addr).unwrap();
    write!(
        stream,
        "{method} {path} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\n\
         Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
    .unwrap();
    let mut raw = String::new();
    stream.read_to_string(&mut raw).unwrap();
    let status = raw
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok())
        .unwrap_or(0);
    let body = raw
        .split_once("\r\n\r\n")
        .map(|(_, b)| b.to_string())
        .unwrap_or_default();
    (status, body)
}

fn execute(addr: std::net::SocketAddr, source: &str) -> (u16, serde_json::Value) {
    let body = serde_json::json!({ "code": source }).to_string();
    let (status, body) = request(addr, "POST", "/execute", &body);
    let json = serde_json::from_str(&body).unwrap_or(serde_json::Value::Null);
    (status, json)
}

#[tokio::test(flavor = "multi_thread")]
async fn execute_returns_result_and_output() {
    let addr = start_server(ModulePolicy::AllowAll).await;
    let (status, json) = execute(addr, "console.log('hello'); 2 + 3");
    assert_eq!(status, 200);
    assert_eq!(json["ok"], serde_json::json!(true));
    assert_eq!(json["result"], serde_json::json!(5.0));
    assert_eq!(json["output"], serde_json::json!("hello\n"));
    assert_eq!(json["detached"], serde_json::json!(false));
}

#[tokio::test(flavor = "multi_thread")]
async fn execute_reports_script_errors() {
    let addr = start_server(ModulePolicy::AllowAll).await;
    let (status, json) = execute(addr, "throw new Error('broken')");
    assert_eq!(status, 422);
    assert_eq!(json["ok"], serde_json::json!(false));
    let error = json["error"].as_str().unwrap();
    assert!(error.contains("broken"), "got {error}");
}

#[tokio::test(flavor = "multi_thread")]
async fn execute_rejects_malformed_body() {
    let addr = start_server(ModulePolicy::AllowAll).await;
    let (status, _body) = request(addr, "POST", "/execute", "not json");
    assert_eq!(status, 400);
}

#[tokio::test(flavor = "multi_thread")]
async fn non_post_execute_is_405() {
    let addr = start_server(ModulePolicy::AllowAll).await;
    let (status, _body) = request(addr, "GET", "/execute", "");
    assert_eq!(status, 405);
}

#[tokio::test(flavor = "multi_thread")]
async fn per_request_timeout_is_honored() {
    let addr = start_server(ModulePolicy::AllowAll).await;
    let body = serde_json::json!({
        "code": "setTimeout(() => {}, 60000);",
        "timeout_ms": 200,
    })
    .to_string();
    let (status, body) = request(addr, "POST", "/execute", &body);
    assert_eq!(status, 422);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    let error = json["error"].as_str().unwrap();
    assert!(error.contains("timed out"), "got {error}");
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_path_is_404() {
    let addr = start_server(ModulePolicy::AllowAll).await;
    let (status, _body) = request(addr, "GET", "/nope", "");
    assert_eq!(status, 404);
}

#[tokio::test(flavor = "multi_thread")]
async fn health_reports_detached_servers() {
    let addr = start_server(ModulePolicy::AllowAll).await;
    let (status, json) = request(addr, "GET", "/health", "");
    let json: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(status, 200);
    assert_eq!(json["status"], serde_json::json!("ok"));
    assert_eq!(json["detached"], serde_json::json!(0));
}

#[tokio::test(flavor = "multi_thread")]
async fn policy_denies_modules_over_the_wire() {
    let addr = start_server(ModulePolicy::Deny(vec!["crypto".into()])).await;
    let (status, json) = execute(addr, "require('crypto').md5('x').hex()");
    assert_eq!(status, 422);
    let error = json["error"].as_str().unwrap();
    assert!(error.contains("is not enabled"), "got {error}");
}

#[tokio::test(flavor = "multi_thread")]
async fn server_scripts_detach_and_keep_serving() {
    let addr = start_server(ModulePolicy::AllowAll).await;
    let (status, json) = execute(
        addr,
        "const s = require('http').serve({ port: 0, handler: () => new Response('from script') });\n\
         s.port",
    );
    assert_eq!(status, 200);
    assert_eq!(json["detached"], serde_json::json!(true));
    let port = json["result"].as_f64().unwrap() as u16;

    let (script_status, body) = {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        write!(
            stream,
            "GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n"
        )
        .unwrap();
        let mut raw = String::new();
        stream.read_to_string(&mut raw).unwrap();
        let status = raw
            .lines()
            .next()
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|code| code.parse().ok())
            .unwrap_or(0u16);
        let body = raw
            .split_once("\r\n\r\n")
            .map(|(_, b)| b.to_string())
            .unwrap_or_default();
        (status, body)
    };
    assert_eq!(script_status, 200);
    assert_eq!(body, "from script");

    let (_, health) = request(addr, "GET", "/health", "");
    let health: serde_json::Value = serde_json::from_str(&health).unwrap();
    assert_eq!(health["detached"], serde_json::json!(1));
}
