//! Reverse proxy translator
//!
//! Turns an inbound request into a request against an app's target and the
//! backend's answer into the response relayed to the client. Unix socket
//! targets are driven through [`unix_http`](crate::unix_http); TCP targets go
//! through the pooled HTTP/1.1 client in [`pool`](crate::pool).

use crate::app::Target;
use crate::error::ProxyError;
use crate::pool::{ConnectionPool, PoolConfig};
use crate::unix_http;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Body as _, Bytes};
use hyper::header::{HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use tracing::debug;

/// Body type used for every request and response the router handles
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Header name for the forwarding chain
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Headers that only describe a single connection
const HOP_BY_HOP: [&str; 7] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Methods whose requests may carry a body
const BODY_METHODS: [&str; 8] = [
    "POST",
    "PUT",
    "PATCH",
    "PROPFIND",
    "PROPPATCH",
    "MKCOL",
    "LOCK",
    "UNLOCK",
];

/// An inbound request, detached from the connection it arrived on
pub struct ProxyRequest {
    pub method: Method,
    pub path_and_query: String,
    pub headers: HeaderMap,
    /// Present only when the method permits a body and one was sent
    pub body: Option<ProxyBody>,
    pub client_addr: SocketAddr,
}

impl ProxyRequest {
    pub fn new(req: Request<ProxyBody>, client_addr: SocketAddr) -> Self {
        let (parts, body) = req.into_parts();
        let body = if method_permits_body(&parts.method) && !body.is_end_stream() {
            Some(body)
        } else {
            None
        };

        Self {
            path_and_query: parts
                .uri
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| "/".to_string()),
            method: parts.method,
            headers: parts.headers,
            body,
            client_addr,
        }
    }
}

/// A backend's final response
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ProxyBody,
}

impl ProxyResponse {
    pub fn into_response(self) -> Response<ProxyBody> {
        let mut response = Response::new(self.body);
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// Forwards requests to app targets
pub struct Proxy {
    pool: ConnectionPool,
}

impl Proxy {
    pub fn new(pool_config: PoolConfig) -> Self {
        Self {
            pool: ConnectionPool::new(pool_config),
        }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Send `req` to `target` and translate the answer.
    ///
    /// No retries: a transport failure is returned to the caller as is.
    pub async fn forward(&self, target: &Target, req: ProxyRequest) -> Result<ProxyResponse, ProxyError> {
        let headers = outbound_headers(&req.headers, req.body.is_some(), req.client_addr.ip());
        debug!(%target, method = %req.method, path = %req.path_and_query, "Forwarding request");

        let (status, mut headers, body) = match target {
            Target::Unix(socket) => {
                let response =
                    unix_http::send(socket, &req.method, &req.path_and_query, &headers, req.body).await?;
                let body = Full::new(response.body).map_err(|never| match never {}).boxed();
                (response.status, response.headers, body)
            }
            Target::Tcp(port) => {
                let uri = hyper::Uri::from_str(&req.path_and_query)
                    .map_err(|e| ProxyError::InvalidRequest(e.to_string()))?;
                let body = req
                    .body
                    .unwrap_or_else(|| Empty::<Bytes>::new().map_err(|never| match never {}).boxed());

                let mut outbound = Request::new(body);
                *outbound.method_mut() = req.method;
                *outbound.uri_mut() = uri;
                *outbound.headers_mut() = headers;

                let (parts, body) = self.pool.send_request(outbound, *port).await?.into_parts();
                (parts.status, parts.headers, body.boxed())
            }
        };

        strip_response_headers(&mut headers);
        Ok(ProxyResponse {
            status,
            headers,
            body,
        })
    }
}

/// Whether a request with `method` may carry a body
pub fn method_permits_body(method: &Method) -> bool {
    BODY_METHODS.contains(&method.as_str())
}

/// Canonical `Capitalized-Hyphenated` form of a header name.
///
/// Underscores are read as hyphens, so `CONTENT_TYPE` becomes `Content-Type`.
pub fn canonical_header_name(name: &str) -> String {
    name.split(['-', '_'])
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

/// Append `client` to an existing forwarding chain, or start a new one
pub fn forwarded_for(existing: Option<&str>, client: IpAddr) -> String {
    let mut chain: Vec<String> = existing
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|hop| !hop.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();
    chain.push(client.to_string());
    chain.join(", ")
}

/// Headers to send to the backend.
///
/// Everything end-to-end is copied. `Content-Length` and `Content-Type` are
/// kept only when a body is forwarded, and the forwarding chain gains the
/// client address.
pub fn outbound_headers(inbound: &HeaderMap, has_body: bool, client: IpAddr) -> HeaderMap {
    let connection_listed = connection_tokens(inbound);
    let mut headers = HeaderMap::with_capacity(inbound.len() + 1);

    for (name, value) in inbound {
        if is_hop_by_hop(name) || connection_listed.iter().any(|listed| listed == name) {
            continue;
        }
        if name == X_FORWARDED_FOR {
            continue;
        }
        if !has_body && (name == CONTENT_LENGTH || name == CONTENT_TYPE) {
            continue;
        }
        headers.append(hyphenated(name), value.clone());
    }

    let existing: Vec<&str> = inbound
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    let existing = if existing.is_empty() {
        None
    } else {
        Some(existing.join(","))
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for(existing.as_deref(), client)) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    headers
}

/// `x_api_key` travels as `x-api-key`
fn hyphenated(name: &HeaderName) -> HeaderName {
    if !name.as_str().contains('_') {
        return name.clone();
    }
    HeaderName::from_str(&name.as_str().replace('_', "-")).unwrap_or_else(|_| name.clone())
}

/// Remove connection-scoped and length-framing headers from a backend
/// response; the server layer recomputes framing for the client.
pub fn strip_response_headers(headers: &mut HeaderMap) {
    for name in connection_tokens(headers) {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
    headers.remove(CONTENT_LENGTH);
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Header names listed in `Connection`
fn connection_tokens(headers: &HeaderMap) -> Vec<HeaderName> {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect()
}
