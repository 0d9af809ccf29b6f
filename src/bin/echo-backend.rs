//! Echo backend used as a stand-in runtime in integration tests
//!
//! Invoked as `echo-backend <source-path>` with `PORT` set, like any runtime.
//! Source directives, one per line:
//! - `exit`: exit with status 3 before binding
//! - `delay <ms>`: wait before binding the port
//! - `oneshot`: answer one request per connection with a bare `200 ok`,
//!   then close without announcing it
//!
//! Requests are answered with the request body, `x-echo-method`,
//! `x-echo-path`, and every request header mirrored as `x-echo-<name>`.
//! `/sleep/{ms}` waits before answering and `/status/201...` answers 201.

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let port: u16 = std::env::var("PORT")?.parse()?;
    let source_path = std::env::args()
        .nth(1)
        .ok_or_else(|| anyhow::anyhow!("usage: echo-backend <source-path>"))?;
    let source = std::fs::read_to_string(&source_path)?;

    let mut oneshot = false;
    for line in source.lines().map(str::trim) {
        if line == "oneshot" {
            oneshot = true;
        }
        if line == "exit" {
            eprintln!("echo-backend: exiting on request");
            std::process::exit(3);
        }
        if let Some(ms) = line.strip_prefix("delay ").and_then(|v| v.trim().parse().ok()) {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    eprintln!("echo-backend: listening on port {}", port);

    loop {
        let (stream, _) = listener.accept().await?;
        if oneshot {
            tokio::spawn(answer_once(stream));
            continue;
        }
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(echo))
                .await
            {
                eprintln!("echo-backend: connection error: {}", e);
            }
        });
    }
}

/// Read one request head, reply, and drop the connection
async fn answer_once(mut stream: TcpStream) {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => head.extend_from_slice(&buf[..n]),
        }
    }
    let _ = stream
        .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok")
        .await;
    let _ = stream.shutdown().await;
}

async fn echo(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().to_string();
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    if let Some(ms) = req
        .uri()
        .path()
        .strip_prefix("/sleep/")
        .and_then(|v| v.parse::<u64>().ok())
    {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    let (parts, body) = req.into_parts();
    let body = body.collect().await?.to_bytes();

    let mut response = Response::new(Full::new(body));
    let headers = response.headers_mut();
    for (name, value) in &parts.headers {
        if let Ok(echoed) = HeaderName::from_bytes(format!("x-echo-{}", name).as_bytes()) {
            headers.append(echoed, value.clone());
        }
    }
    if let Some(content_type) = parts.headers.get(CONTENT_TYPE) {
        headers.insert(CONTENT_TYPE, content_type.clone());
    }
    if let Ok(value) = HeaderValue::from_str(&method) {
        headers.insert("x-echo-method", value);
    }
    if let Ok(value) = HeaderValue::from_str(&path) {
        headers.insert("x-echo-path", value);
    }

    *response.status_mut() = if path.starts_with("/status/201") {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok(response)
}
