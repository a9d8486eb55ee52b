//! Request interceptors consulted before normal routing

use crate::app::App;
use crate::proxy::ProxyBody;
use async_trait::async_trait;
use hyper::{Method, Request, Response, StatusCode};
use std::time::Duration;

/// Summary of one proxied exchange, handed to [`Plugin::add_result`]
#[derive(Debug, Clone)]
pub struct Exchange<'a> {
    pub request_id: &'a str,
    pub method: &'a Method,
    pub path: &'a str,
    pub status: StatusCode,
    pub elapsed: Duration,
}

/// A plugin may claim requests outright and observes every proxied exchange.
///
/// The router asks plugins in registration order; the first one whose
/// [`handles`](Plugin::handles) returns true answers the request and no app
/// is looked up or started.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this plugin answers `req`. `hostname` is the normalised Host.
    fn handles(&self, hostname: &str, req: &Request<ProxyBody>) -> bool;

    /// Answer a claimed request
    async fn call(&self, req: Request<ProxyBody>) -> Response<ProxyBody>;

    /// Observe a request that was proxied to `app`
    fn add_result(&self, _app: &App, _exchange: &Exchange<'_>) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::{BodyExt, Full};
    use hyper::body::Bytes;

    struct Ping;

    #[async_trait]
    impl Plugin for Ping {
        fn name(&self) -> &str {
            "ping"
        }

        fn handles(&self, hostname: &str, req: &Request<ProxyBody>) -> bool {
            hostname.starts_with("ping.") && req.method() == Method::GET
        }

        async fn call(&self, _req: Request<ProxyBody>) -> Response<ProxyBody> {
            Response::new(Full::new(Bytes::from("pong")).map_err(|never| match never {}).boxed())
        }
    }

    fn empty_request(method: Method) -> Request<ProxyBody> {
        Request::builder()
            .method(method)
            .uri("/")
            .body(Full::new(Bytes::new()).map_err(|never| match never {}).boxed())
            .unwrap()
    }

    #[tokio::test]
    async fn test_plugin_as_trait_object() {
        let plugins: Vec<Box<dyn Plugin>> = vec![Box::new(Ping)];

        let get = empty_request(Method::GET);
        let claimed = plugins.iter().find(|p| p.handles("ping.dev", &get)).unwrap();
        assert_eq!(claimed.name(), "ping");

        let body = claimed.call(get).await.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"pong");

        let post = empty_request(Method::POST);
        assert!(plugins.iter().all(|p| !p.handles("ping.dev", &post)));
        assert!(plugins.iter().all(|p| !p.handles("blog.dev", &empty_request(Method::GET))));
    }
}
