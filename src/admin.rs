use crate::error::{json_error_response, ProxyErrorCode};
use crate::pool::AppPool;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the pool
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

/// One registry key as shown by `GET /apps`
#[derive(Debug, Serialize)]
pub struct AppEntry {
    /// Registry key (canonical name or alias)
    pub key: String,
    /// Canonical application name
    pub name: String,
    pub url: String,
    pub state: crate::app::AppState,
    pub public: bool,
    pub pid: Option<u32>,
    pub idle_secs: u64,
}

/// Snapshot of every registry key, sorted by key
pub fn list_apps(pool: &AppPool) -> Vec<AppEntry> {
    let mut entries = Vec::new();
    pool.for_each(|key, app| {
        entries.push(AppEntry {
            key: key.to_string(),
            name: app.name().to_string(),
            url: app.url(),
            state: app.status(),
            public: app.public(),
            pid: app.pid(),
            idle_secs: app.idle_for().as_secs(),
        });
    });
    entries.sort_by(|a, b| a.key.cmp(&b.key));
    entries
}

/// Admin/status API server
pub struct AdminServer {
    bind_addr: SocketAddr,
    pool: Arc<AppPool>,
    shutdown_rx: watch::Receiver<bool>,
    auth_token: Arc<String>,
}

impl AdminServer {
    pub fn new(
        bind_addr: SocketAddr,
        pool: Arc<AppPool>,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: String,
    ) -> Self {
        Self {
            bind_addr,
            pool,
            shutdown_rx,
            auth_token: Arc::new(auth_token),
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Admin API server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let pool = Arc::clone(&self.pool);
                            let auth_token = Arc::clone(&self.auth_token);

                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, pool, auth_token).await {
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

async fn serve_admin_connection(
    stream: TcpStream,
    pool: Arc<AppPool>,
    auth_token: Arc<String>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<hyper::body::Incoming>| {
        let pool = Arc::clone(&pool);
        let token = Arc::clone(&auth_token);
        async move {
            let authorized = check_auth(req.headers(), &token);
            let response = handle_admin_request(req.method(), req.uri().path(), authorized, &pool).await;
            Ok::<_, hyper::Error>(response)
        }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

fn check_auth(headers: &HeaderMap, expected_token: &str) -> bool {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| {
            // Support "Bearer <token>" format
            auth.strip_prefix("Bearer ")
                .unwrap_or(auth)
                .eq(expected_token)
        })
        .unwrap_or(false)
}

/// Split `/apps/{name}/{action}` into its parts
fn app_route(path: &str) -> Option<(&str, &str)> {
    let rest = path.strip_prefix("/apps/")?;
    let (name, action) = rest.split_once('/')?;
    if name.is_empty() || action.is_empty() {
        return None;
    }
    Some((name, action))
}

/// Route one admin request
pub async fn handle_admin_request(
    method: &Method,
    path: &str,
    authorized: bool,
    pool: &Arc<AppPool>,
) -> Response<Full<Bytes>> {
    debug!(%method, %path, "Admin API request");

    match (method, path) {
        // Health check for the admin API itself (no auth required)
        (&Method::GET, "/health") => return response(StatusCode::OK, "ok"),

        // Version endpoint: GET /version (no auth required)
        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            return json_response(StatusCode::OK, version_info.to_string());
        }
        _ => {}
    }

    if !authorized {
        warn!(path, "Unauthorized admin API request");
        return json_error_response(ProxyErrorCode::Unauthorized, "unauthorized");
    }

    match (method, path) {
        // List registry keys and their state: GET /apps
        (&Method::GET, "/apps") => {
            let apps = list_apps(pool);
            let body = serde_json::json!({
                "count": apps.len(),
                "apps": apps,
            });
            json_response(StatusCode::OK, body.to_string())
        }

        // Recent diagnostic events: GET /events
        (&Method::GET, "/events") => {
            let events = pool.events().recent();
            let body = serde_json::json!({ "events": events });
            json_response(StatusCode::OK, body.to_string())
        }

        // Kill every app: POST /purge
        (&Method::POST, "/purge") => {
            let count = pool.apps().len();
            pool.purge_all().await;
            info!(count, "Apps purged via admin API");
            json_response(StatusCode::OK, serde_json::json!({ "purged": count }).to_string())
        }

        (method, path) => match app_route(path) {
            // Rendered log ring: GET /apps/{name}/log
            Some((name, "log")) if *method == Method::GET => match pool.get(name) {
                Some(app) => response(StatusCode::OK, app.log()),
                None => json_error_response(
                    ProxyErrorCode::UnknownApp,
                    format!("unknown app: {}", name),
                ),
            },

            // Ask an app to stop: POST /apps/{name}/kill
            Some((name, "kill")) if *method == Method::POST => match pool.get(name) {
                Some(app) => match app.kill("admin request") {
                    Ok(()) => response(StatusCode::OK, "ok"),
                    Err(e) => json_error_response(
                        ProxyErrorCode::InternalError,
                        format!("failed to signal {}: {}", name, e),
                    ),
                },
                None => json_error_response(
                    ProxyErrorCode::UnknownApp,
                    format!("unknown app: {}", name),
                ),
            },

            _ => json_error_response(ProxyErrorCode::NotFound, "not found"),
        },
    }
}
