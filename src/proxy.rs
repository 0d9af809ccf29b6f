use crate::config::ServerConfig;
use crate::dispatch::{ModelDispatcher, RunModelRequest};
use crate::error::{json_error_response, Error, ProxyErrorCode};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::registry::{AppRecord, AppRegistry, AppState};
use crate::submit::{extract_source, SubmissionEndpoint};
use crate::supervisor::Supervisor;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE, HOST};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Path prefix under which applications are mounted
const APPS_PREFIX: &str = "/apps";

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
/// Header name for the mount prefix stripped before forwarding
const X_FORWARDED_PREFIX: &str = "x-forwarded-prefix";

type ProxyResponse = Response<BoxBody<Bytes, hyper::Error>>;

/// A parsed public route
#[derive(Debug, PartialEq, Eq)]
enum Route<'a> {
    Submit,
    Teardown(&'a str),
    Forward { id: &'a str, rest: &'a str },
    ListModels,
    RunModel,
    NotFound,
}

fn route<'a>(method: &Method, path: &'a str) -> Route<'a> {
    match (method, path) {
        (&Method::POST, "/apps") | (&Method::POST, "/apps/") => return Route::Submit,
        (&Method::GET, "/api/list_models") => return Route::ListModels,
        (&Method::POST, "/api/run_model") => return Route::RunModel,
        _ => {}
    }

    let Some(tail) = path.strip_prefix("/apps/") else {
        return Route::NotFound;
    };

    match tail.split_once('/') {
        Some(("", _)) => Route::NotFound,
        Some((id, _)) => Route::Forward {
            id,
            rest: &tail[id.len()..],
        },
        None if tail.is_empty() => Route::NotFound,
        None if *method == Method::DELETE => Route::Teardown(tail),
        None => Route::Forward { id: tail, rest: "/" },
    }
}

/// Backend path and query for a forwarded request
fn backend_path(rest: &str, query: Option<&str>) -> String {
    let path = if rest.is_empty() { "/" } else { rest };
    match query {
        Some(q) => format!("{}?{}", path, q),
        None => path.to_string(),
    }
}

/// Host the client addressed, from `Host` or the URI authority (HTTP/2)
fn request_host<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> ProxyResponse {
    match serde_json::to_vec(value) {
        Ok(body) => Response::builder()
            .status(status)
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
            .expect("valid response with StatusCode enum and static header"),
        Err(e) => json_error_response(ProxyErrorCode::InternalError, e.to_string()),
    }
}

/// Collect a request body, refusing anything over `limit` bytes
async fn read_body(body: Incoming, limit: usize) -> Result<Bytes, Error> {
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => Err(Error::PayloadTooLarge(limit)),
        Err(e) => Err(Error::InvalidSubmission(format!("failed to read request body: {}", e))),
    }
}

/// Request handling shared by every connection
#[derive(Clone)]
struct Routes {
    registry: Arc<AppRegistry>,
    supervisor: Arc<Supervisor>,
    submissions: Arc<SubmissionEndpoint>,
    dispatcher: Arc<ModelDispatcher>,
    pool: Arc<ConnectionPool>,
    request_timeout: Duration,
    start_wait: Duration,
    max_body_bytes: usize,
}

impl Routes {
    async fn handle(
        &self,
        req: Request<Incoming>,
        client_addr: SocketAddr,
    ) -> Result<ProxyResponse, hyper::Error> {
        let path = req.uri().path().to_string();
        let response = match route(req.method(), &path) {
            Route::Submit => self.submit(req).await,
            Route::Teardown(id) => match self.submissions.teardown(id).await {
                Ok(body) => json_response(StatusCode::OK, &body),
                Err(e) => e.into_response(),
            },
            Route::Forward { id, rest } => self.forward(req, id, rest, client_addr).await,
            Route::ListModels => json_response(StatusCode::OK, &self.dispatcher.list_models()),
            Route::RunModel => self.run_model(req).await,
            Route::NotFound => json_error_response(ProxyErrorCode::NotFound, "Not found"),
        };
        Ok(response)
    }

    async fn submit(&self, req: Request<Incoming>) -> ProxyResponse {
        let base = format!(
            "http://{}",
            request_host(&req).unwrap_or_else(|| "localhost".to_string())
        );
        let content_type = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body = match read_body(req.into_body(), self.max_body_bytes).await {
            Ok(body) => body,
            Err(e) => return e.into_response(),
        };
        let source = match extract_source(content_type.as_deref(), body) {
            Ok(source) => source,
            Err(e) => return e.into_response(),
        };

        match self.submissions.submit(&source, &base).await {
            Ok(submitted) => json_response(StatusCode::OK, &submitted),
            Err(e) => {
                error!(error = %e, "Submission failed");
                e.into_response()
            }
        }
    }

    async fn run_model(&self, req: Request<Incoming>) -> ProxyResponse {
        let body = match read_body(req.into_body(), self.max_body_bytes).await {
            Ok(body) => body,
            Err(e) => return e.into_response(),
        };
        let request: RunModelRequest = match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(e) => {
                return Error::InvalidSubmission(format!("expected model, input and api_key: {}", e))
                    .into_response()
            }
        };

        match self.dispatcher.run(&request).await {
            Ok(output) => json_response(StatusCode::OK, &output),
            Err(e) => {
                warn!(model = %request.model, error = %e, "Model request failed");
                e.into_response()
            }
        }
    }

    /// Forward any method to the application's backend
    async fn forward(
        &self,
        mut req: Request<Incoming>,
        id: &str,
        rest: &str,
        client_addr: SocketAddr,
    ) -> ProxyResponse {
        let record = match self.registry.get(id) {
            Ok(record) => record,
            Err(_) => {
                return json_error_response(ProxyErrorCode::UnknownApp, "Unknown application")
            }
        };

        if let Err(e) = self.ensure_running(&record).await {
            debug!(app_id = id, state = ?record.state(), "Rejecting request for unavailable backend");
            return e.into_response();
        }

        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let host = request_host(&req);
        let path_and_query = backend_path(rest, req.uri().query());

        // Overwrite rather than append: this proxy is the first trusted hop
        let headers = req.headers_mut();
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            headers.insert(X_REQUEST_ID, value);
        }
        if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
            headers.insert(X_FORWARDED_FOR, value);
        }
        if let Some(value) = host.and_then(|h| HeaderValue::from_str(&h).ok()) {
            headers.insert(X_FORWARDED_HOST, value);
        }
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
        if let Ok(value) = HeaderValue::from_str(&format!("{}/{}", APPS_PREFIX, id)) {
            headers.insert(X_FORWARDED_PREFIX, value);
        }

        let port = record.port();
        debug!(app_id = id, port, method = %req.method(), path = %path_and_query, request_id, "Forwarding request");

        let _in_flight = record.begin_request();
        let started = Instant::now();
        let result = tokio::time::timeout(
            self.request_timeout,
            self.pool.send_request(req, port, &path_and_query),
        )
        .await;

        match result {
            Ok(Ok(response)) => {
                record.touch();
                debug!(
                    app_id = id,
                    status = response.status().as_u16(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Backend responded"
                );
                response
            }
            Ok(Err(e)) => {
                error!(app_id = id, port, error = %e, "Failed to forward request to backend");
                self.crash_in_background(&record, format!("connection failed: {}", e));
                json_error_response(ProxyErrorCode::ConnectionFailed, "Failed to connect to backend")
            }
            Err(_) => {
                warn!(
                    app_id = id,
                    port,
                    timeout_secs = self.request_timeout.as_secs(),
                    "Request timed out"
                );
                self.crash_in_background(
                    &record,
                    format!("no response within {} seconds", self.request_timeout.as_secs()),
                );
                Error::BackendTimeout(self.request_timeout).into_response()
            }
        }
    }

    /// Succeeds once the backend is `Running`, waiting out `Starting`
    async fn ensure_running(&self, record: &AppRecord) -> Result<(), Error> {
        let state = match record.state() {
            AppState::Starting => record.wait_until_started(self.start_wait).await,
            state => state,
        };

        match state {
            AppState::Running => Ok(()),
            AppState::Starting => Err(Error::BackendStarting),
            AppState::Crashed => Err(Error::BackendUnavailable(format!(
                "application {} has crashed",
                record.id()
            ))),
            AppState::Stopped => Err(Error::BackendUnavailable(format!(
                "application {} was stopped",
                record.id()
            ))),
        }
    }

    /// Mark the record crashed and reap its process without holding up the reply
    fn crash_in_background(&self, record: &Arc<AppRecord>, reason: String) {
        let supervisor = Arc::clone(&self.supervisor);
        let record = Arc::clone(record);
        tokio::spawn(async move {
            supervisor.mark_crashed(&record, reason).await;
        });
    }
}

/// The public server: submissions, model dispatch and the `/apps/{id}` proxy
pub struct ProxyServer {
    bind_addr: SocketAddr,
    shutdown_rx: watch::Receiver<bool>,
    routes: Routes,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        server: &ServerConfig,
        registry: Arc<AppRegistry>,
        supervisor: Arc<Supervisor>,
        dispatcher: Arc<ModelDispatcher>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let pool = Arc::new(ConnectionPool::new(PoolConfig {
            max_idle_per_host: server.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(server.pool_idle_timeout_secs),
        }));
        let submissions = Arc::new(SubmissionEndpoint::new(
            Arc::clone(&registry),
            Arc::clone(&supervisor),
            server.public_url.clone(),
        ));

        let routes = Routes {
            request_timeout: supervisor.runtime().request_timeout(),
            start_wait: supervisor.runtime().start_wait(),
            max_body_bytes: server.max_source_bytes,
            registry,
            supervisor,
            submissions,
            dispatcher,
            pool,
        };

        Self {
            bind_addr,
            shutdown_rx,
            routes,
        }
    }

    /// Get the connection pool (for statistics)
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.routes.pool
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(addr = %addr, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let routes = self.routes.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, routes).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, routes: Routes) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let routes = routes.clone();
        async move { routes.handle(req, addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_submission_and_api() {
        assert_eq!(route(&Method::POST, "/apps"), Route::Submit);
        assert_eq!(route(&Method::POST, "/apps/"), Route::Submit);
        assert_eq!(route(&Method::GET, "/api/list_models"), Route::ListModels);
        assert_eq!(route(&Method::POST, "/api/run_model"), Route::RunModel);

        assert_eq!(route(&Method::GET, "/apps"), Route::NotFound);
        assert_eq!(route(&Method::POST, "/api/list_models"), Route::NotFound);
        assert_eq!(route(&Method::GET, "/"), Route::NotFound);
        assert_eq!(route(&Method::GET, "/apps//x"), Route::NotFound);
    }

    #[test]
    fn test_route_forwarding() {
        assert_eq!(
            route(&Method::GET, "/apps/abc/"),
            Route::Forward { id: "abc", rest: "/" }
        );
        assert_eq!(
            route(&Method::PUT, "/apps/abc/items/7"),
            Route::Forward { id: "abc", rest: "/items/7" }
        );
        assert_eq!(
            route(&Method::GET, "/apps/abc"),
            Route::Forward { id: "abc", rest: "/" }
        );
        // DELETE on a sub-path is forwarded, on the app itself it is teardown
        assert_eq!(
            route(&Method::DELETE, "/apps/abc/items/7"),
            Route::Forward { id: "abc", rest: "/items/7" }
        );
        assert_eq!(route(&Method::DELETE, "/apps/abc"), Route::Teardown("abc"));
    }

    #[test]
    fn test_backend_path() {
        assert_eq!(backend_path("/", None), "/");
        assert_eq!(backend_path("", None), "/");
        assert_eq!(backend_path("/a/b", Some("x=1&y=2")), "/a/b?x=1&y=2");
    }

    #[test]
    fn test_request_host() {
        let req = Request::builder()
            .uri("/apps/x/")
            .header(HOST, "example.com:8000")
            .body(())
            .unwrap();
        assert_eq!(request_host(&req).as_deref(), Some("example.com:8000"));

        let req = Request::builder()
            .uri("http://h2.example.com/apps/x/")
            .body(())
            .unwrap();
        assert_eq!(request_host(&req).as_deref(), Some("h2.example.com"));

        let req = Request::builder().uri("/").body(()).unwrap();
        assert_eq!(request_host(&req), None);
    }

    #[test]
    fn test_json_response() {
        let response = json_response(StatusCode::OK, &serde_json::json!({"id": "a"}));
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get(CONTENT_TYPE).unwrap(), "application/json");
    }
}
