use crate::registry::AppRegistry;
use crate::supervisor::Supervisor;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the server
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

#[derive(Clone)]
struct AdminState {
    registry: Arc<AppRegistry>,
    supervisor: Arc<Supervisor>,
    auth_token: Arc<String>,
}

/// Internal API for readiness callbacks and application listings
pub struct AdminServer {
    bind_addr: SocketAddr,
    shutdown_rx: watch::Receiver<bool>,
    state: AdminState,
}

impl AdminServer {
    pub fn new(
        bind_addr: SocketAddr,
        registry: Arc<AppRegistry>,
        supervisor: Arc<Supervisor>,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: String,
    ) -> Self {
        Self {
            bind_addr,
            shutdown_rx,
            state: AdminState {
                registry,
                supervisor,
                auth_token: Arc::new(auth_token),
            },
        }
    }

    pub fn auth_token(&self) -> &str {
        &self.state.auth_token
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(addr = %addr, "Admin API server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = self.state.clone();
                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, state).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection(stream: TcpStream, state: AdminState) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let state = state.clone();
        async move { handle_admin_request(req, state).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

fn check_auth<B>(req: &Request<B>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| auth.strip_prefix("Bearer ").unwrap_or(auth).eq(expected_token))
        .unwrap_or(false)
}

async fn handle_admin_request(
    req: Request<hyper::body::Incoming>,
    state: AdminState,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    Ok(route_admin(&req, &state))
}

fn route_admin<B>(req: &Request<B>, state: &AdminState) -> Response<Full<Bytes>> {
    let path = req.uri().path();
    let method = req.method();

    debug!(%method, %path, "Admin API request");

    match (method, path) {
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            json_response(StatusCode::OK, version_info.to_string())
        }

        // Readiness callback from a backend: POST /ready/{id}
        // Accepts the admin token or the application's own ready token
        (&Method::POST, path) if path.starts_with("/ready/") => {
            let id = path.strip_prefix("/ready/").unwrap_or("");
            let app_token = state
                .registry
                .get(id)
                .ok()
                .and_then(|record| record.ready_token().map(str::to_string));
            let authorized = check_auth(req, &state.auth_token)
                || app_token.is_some_and(|token| check_auth(req, &token));
            if !authorized {
                warn!(path, "Unauthorized admin API request");
                return response(StatusCode::UNAUTHORIZED, "unauthorized");
            }
            if id.is_empty() {
                response(StatusCode::BAD_REQUEST, "missing application id")
            } else if state.supervisor.mark_ready(&state.registry, id) {
                info!(app_id = id, "Backend marked ready via callback");
                response(StatusCode::OK, "ok")
            } else {
                response(StatusCode::NOT_FOUND, "application not starting")
            }
        }

        (&Method::GET, "/apps") => {
            if !check_auth(req, &state.auth_token) {
                warn!(path, "Unauthorized admin API request");
                return response(StatusCode::UNAUTHORIZED, "unauthorized");
            }
            let apps = state.registry.list();
            let body = serde_json::json!({
                "count": apps.len(),
                "apps": apps,
            });
            json_response(StatusCode::OK, body.to_string())
        }

        _ => response(StatusCode::NOT_FOUND, "not found"),
    }
}
