//! HTTP entry point
//!
//! Every inbound request is matched to an app by its Host header. Plugins get
//! the first look; otherwise the app is looked up in the registry (and started
//! if absent) and the request is forwarded through the proxy translator.

use crate::app::{App, AppContext, AppSpec};
use crate::config::ServerConfig;
use crate::error::{router_error_response, text_error_response, ProxyErrorCode, RouterError};
use crate::plugin::{Exchange, Plugin};
use crate::pool::PoolConfig;
use crate::proxy::{Proxy, ProxyBody, ProxyRequest};
use crate::registry::Registry;
use anyhow::Context;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;

/// State shared by every connection
struct RouterState {
    domain: String,
    registry: Arc<Registry>,
    ctx: AppContext,
    proxy: Proxy,
    plugins: Vec<Arc<dyn Plugin>>,
    request_timeout: Duration,
}

/// The HTTP front of the router
pub struct Router {
    bind_addr: SocketAddr,
    shutdown_rx: watch::Receiver<bool>,
    state: RouterState,
}

impl Router {
    pub fn new(
        server: &ServerConfig,
        ctx: AppContext,
        registry: Arc<Registry>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let bind_addr: SocketAddr = format!("{}:{}", server.bind, server.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", server.bind, server.port))?;

        Ok(Self {
            bind_addr,
            shutdown_rx,
            state: RouterState {
                domain: server.domain.trim_matches('.').to_lowercase(),
                registry,
                ctx,
                proxy: Proxy::new(PoolConfig::from(server)),
                plugins: Vec::new(),
                request_timeout: server.request_timeout(),
            },
        })
    }

    /// Add a plugin; plugins are consulted in the order they were added
    pub fn with_plugin(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.state.plugins.push(plugin);
        self
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr)
            .await
            .with_context(|| format!("Failed to bind {}", self.bind_addr))?;
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(
            addr = %listener.local_addr()?,
            domain = %self.state.domain,
            plugins = self.state.plugins.len(),
            "Router listening"
        );

        let mut shutdown_rx = self.shutdown_rx;
        let state = Arc::new(self.state);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&state);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, state).await {
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
                        let stats = state.proxy.pool().stats();
                        info!(
                            tcp_requests = stats.get_total_requests(),
                            tcp_failures = stats.get_failed_requests(),
                            "Router shutting down"
                        );
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    state: Arc<RouterState>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        async move { handle_request(req, state, addr).await }
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

async fn handle_request(
    req: Request<Incoming>,
    state: Arc<RouterState>,
    client_addr: SocketAddr,
) -> Result<Response<ProxyBody>, hyper::Error> {
    let started = Instant::now();
    let mut req = req.map(|body| body.boxed());

    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let hostname = match extract_hostname(&req) {
        Some(h) => h,
        None => {
            return Ok(text_error_response(
                ProxyErrorCode::MissingHostHeader,
                "-",
                "Missing or invalid Host header",
            ));
        }
    };

    debug!(hostname, method = %req.method(), uri = %req.uri(), request_id, "Incoming request");

    if let Some(plugin) = state.plugins.iter().find(|p| p.handles(&hostname, &req)) {
        debug!(hostname, plugin = plugin.name(), "Request claimed by plugin");
        return Ok(plugin.call(req).await);
    }

    let Some(app_name) = app_name_for(&hostname, &state.domain).map(String::from) else {
        debug!(hostname, "Host does not name an app");
        return Ok(router_error_response(&hostname, &RouterError::UnconfiguredHost));
    };

    let app = {
        let ctx = state.ctx.clone();
        let host = hostname.clone();
        let outcome = state
            .registry
            .get_or_start(&hostname, move || {
                AppSpec::resolve(&host, &app_name, &ctx).map(|spec| App::new(spec, &ctx))
            })
            .await;

        match outcome {
            Ok(app) => app,
            Err(RouterError::UnconfiguredHost) => {
                debug!(hostname, "Unconfigured host");
                return Ok(router_error_response(&hostname, &RouterError::UnconfiguredHost));
            }
            Err(e) => {
                error!(hostname, error = %e, "Failed to start app");
                return Ok(router_error_response(&hostname, &e));
            }
        }
    };

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        req.headers_mut().insert(X_REQUEST_ID, value);
    }

    let method = req.method().clone();
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let target = app.target().clone();

    let result = tokio::time::timeout(
        state.request_timeout,
        state.proxy.forward(&target, ProxyRequest::new(req, client_addr)),
    )
    .await;

    match result {
        Ok(Ok(response)) => {
            state.registry.hit(&hostname);

            let exchange = Exchange {
                request_id: &request_id,
                method: &method,
                path: &path,
                status: response.status,
                elapsed: started.elapsed(),
            };
            for plugin in &state.plugins {
                plugin.add_result(&app, &exchange);
            }

            debug!(
                hostname,
                status = response.status.as_u16(),
                elapsed_ms = exchange.elapsed.as_millis() as u64,
                request_id,
                "Request proxied"
            );
            Ok(response.into_response())
        }
        Ok(Err(e)) => {
            warn!(hostname, %target, error = %e, request_id, "Failed to forward request");
            Ok(router_error_response(
                &hostname,
                &RouterError::transport(target.to_string(), e),
            ))
        }
        Err(_) => {
            warn!(
                hostname,
                %target,
                timeout_secs = state.request_timeout.as_secs(),
                request_id,
                "Request timed out"
            );
            Ok(text_error_response(
                ProxyErrorCode::RequestTimeout,
                &hostname,
                format!(
                    "Request timed out after {} seconds",
                    state.request_timeout.as_secs()
                ),
            ))
        }
    }
}

/// Normalised hostname of a request: Host header (or URI authority) without
/// port or trailing dot, lowercased. `None` if absent or not a valid name.
pub fn extract_hostname<B>(req: &Request<B>) -> Option<String> {
    let raw = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().host())?;

    // Strip port if present
    let hostname = raw.split(':').next()?;
    let hostname = hostname.strip_suffix('.').unwrap_or(hostname);

    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return None;
    }

    // Validate characters: alphanumeric, hyphen, and dot only
    if !hostname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
    {
        return None;
    }

    Some(hostname.to_lowercase())
}

/// App directory name for `hostname`: the hostname with a trailing
/// `.<domain>` removed. Names that could escape the apps root are refused.
pub fn app_name_for<'a>(hostname: &'a str, domain: &str) -> Option<&'a str> {
    let name = hostname
        .strip_suffix(domain)
        .and_then(|rest| rest.strip_suffix('.'))
        .unwrap_or(hostname);

    if name.is_empty() || name.starts_with('.') {
        return None;
    }
    Some(name)
}
