use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use arc_swap::ArcSwap;
use axum::{
    Router,
    body::Body as AxumBody,
    extract::{ConnectInfo, Request},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Uri, Version, header},
    response::Response,
    routing::any,
};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::{
    adapters::websocket::{is_websocket_upgrade, proxy_upgrade},
    config::ServerConfig,
    core::{Backend, LoadBalancer},
};

pub const NO_BACKEND_BODY: &str = "No healthy backend available :(";
pub const BACKEND_ERROR_BODY: &str = "Error processing request.";

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Headers that only apply to a single hop and are not forwarded
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// One consistent configuration generation: a config and the balancer built for it.
pub struct ProxyGeneration {
    pub config: Arc<ServerConfig>,
    pub balancer: Arc<LoadBalancer>,
}

/// Reverse proxy request handler.
///
/// Every request works on a single snapshot of the current generation, so a
/// concurrent reload never mixes a config with a balancer from another generation.
pub struct ProxyHandler {
    current: ArcSwap<ProxyGeneration>,
}

impl ProxyHandler {
    pub fn new(config: Arc<ServerConfig>, balancer: Arc<LoadBalancer>) -> Self {
        Self {
            current: ArcSwap::from_pointee(ProxyGeneration { config, balancer }),
        }
    }

    pub fn snapshot(&self) -> Arc<ProxyGeneration> {
        self.current.load_full()
    }

    pub fn config(&self) -> Arc<ServerConfig> {
        self.current.load().config.clone()
    }

    pub fn load_balancer(&self) -> Arc<LoadBalancer> {
        self.current.load().balancer.clone()
    }

    /// Replace the configuration, keeping the current balancer.
    pub fn set_config(&self, config: Arc<ServerConfig>) {
        self.current.rcu(|current| ProxyGeneration {
            config: config.clone(),
            balancer: current.balancer.clone(),
        });
    }

    /// Replace the balancer, keeping the current configuration. The previous
    /// balancer is closed, which stops its backends' monitors.
    pub async fn set_load_balancer(&self, balancer: Arc<LoadBalancer>) {
        let previous = self.current.rcu(|current| ProxyGeneration {
            config: current.config.clone(),
            balancer: balancer.clone(),
        });
        Self::retire(&previous.balancer, &balancer).await;
    }

    /// Replace configuration and balancer in one step.
    pub async fn replace(&self, config: Arc<ServerConfig>, balancer: Arc<LoadBalancer>) {
        let previous = self.current.swap(Arc::new(ProxyGeneration {
            config,
            balancer: balancer.clone(),
        }));
        Self::retire(&previous.balancer, &balancer).await;
    }

    async fn retire(previous: &Arc<LoadBalancer>, next: &Arc<LoadBalancer>) {
        if !Arc::ptr_eq(previous, next) {
            previous.close().await;
        }
    }

    /// Close the active balancer.
    pub async fn close(&self) {
        self.load_balancer().close().await;
    }

    /// Forward one request to a healthy backend.
    pub async fn handle_request(&self, req: Request) -> Response<AxumBody> {
        let generation = self.snapshot();
        let client_addr = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);

        let Some(backend) = generation.balancer.backend() else {
            return text_response(StatusCode::SERVICE_UNAVAILABLE, NO_BACKEND_BODY);
        };

        let upgrade = is_websocket_upgrade(req.headers());
        let req = match prepare_request(req, &backend, &generation.config, client_addr, upgrade)
        {
            Ok(req) => req,
            Err(e) => {
                tracing::error!(backend = %backend.id(), error = %e, "Unable to build backend request");
                return text_response(StatusCode::SERVICE_UNAVAILABLE, BACKEND_ERROR_BODY);
            }
        };

        if upgrade {
            return proxy_upgrade(req, &backend, generation.config.backend.dial_timeout).await;
        }

        match backend.round_trip(req).await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(backend = %backend.id(), error = %e, "Error processing request");
                text_response(StatusCode::SERVICE_UNAVAILABLE, BACKEND_ERROR_BODY)
            }
        }
    }
}

/// Point the request at `backend`: absolute `http://` URI for the chosen host,
/// HTTP/1.1, optional `X-Forwarded-For`, and no hop-by-hop headers unless upgrading.
fn prepare_request(
    req: Request,
    backend: &Backend,
    config: &ServerConfig,
    client_addr: Option<SocketAddr>,
    upgrade: bool,
) -> Result<Request, axum::http::uri::InvalidUri> {
    let (mut parts, body) = req.into_parts();

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    parts.uri = format!("http://{}{}", backend.host(), path_and_query).parse::<Uri>()?;
    parts.version = Version::HTTP_11;

    if !upgrade {
        strip_hop_by_hop(&mut parts.headers);
    }
    if config.add_x_forwarded_for {
        if let Some(addr) = client_addr {
            append_forwarded_for(&mut parts.headers, addr.ip());
        }
    }

    Ok(Request::from_parts(parts, body))
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Append `client_ip`, folding values set by earlier proxies into one list.
///
/// Prior values are kept byte for byte, including ones that are not UTF-8.
fn append_forwarded_for(headers: &mut HeaderMap, client_ip: IpAddr) {
    let mut folded = Vec::new();
    for value in headers.get_all(&X_FORWARDED_FOR) {
        folded.extend_from_slice(value.as_bytes());
        folded.extend_from_slice(b", ");
    }
    folded.extend_from_slice(client_ip.to_string().as_bytes());
    if let Ok(value) = HeaderValue::from_bytes(&folded) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

pub(crate) fn text_response(status: StatusCode, body: &'static str) -> Response<AxumBody> {
    let mut response = Response::new(AxumBody::from(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Router sending every method and path through `handler`.
pub fn router(handler: Arc<ProxyHandler>) -> Router {
    let make_route = |handler: Arc<ProxyHandler>| {
        any(move |req: Request| {
            let handler = handler.clone();
            async move { handler.handle_request(req).await }
        })
    };

    Router::new()
        .route("/{*path}", make_route(handler.clone()))
        .route("/", make_route(handler))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
}

#[cfg(test)]
mod tests {
    use std::{sync::Mutex, time::Duration};

    use async_trait::async_trait;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;
    use crate::{
        config::LoadBalancerType,
        core::{Inventory, backend::tests::test_context},
        ports::http_client::{HttpClient, HttpClientError, HttpClientResult},
    };

    /// Records forwarded requests; fails every request when `fail` is set.
    #[derive(Default)]
    struct RecordingClient {
        seen: Mutex<Vec<(Uri, Version, HeaderMap)>>,
        fail: bool,
    }

    #[async_trait]
    impl HttpClient for RecordingClient {
        async fn send_request(&self, req: Request) -> HttpClientResult<Response<AxumBody>> {
            self.seen.lock().unwrap().push((
                req.uri().clone(),
                req.version(),
                req.headers().clone(),
            ));
            if self.fail {
                return Err(HttpClientError::ConnectionError("refused".to_string()));
            }
            Ok(Response::new(AxumBody::from("hello from backend")))
        }

        async fn probe(&self, _url: &str, _timeout: Duration) -> HttpClientResult<StatusCode> {
            Ok(StatusCode::OK)
        }
    }

    fn handler_with(client: Arc<RecordingClient>, backends: usize) -> ProxyHandler {
        let ctx = test_context(client, true);
        let inventory = Inventory::new(ctx.clone());
        for i in 0..backends {
            let backend =
                Backend::ephemeral(i.to_string(), "b", format!("10.0.0.{i}:8080"), "", &ctx)
                    .unwrap();
            inventory.add_backend(backend).unwrap();
        }
        let balancer = LoadBalancer::new(LoadBalancerType::RoundRobin, Arc::new(inventory));
        ProxyHandler::new(Arc::new(ServerConfig::default()), Arc::new(balancer))
    }

    fn request(uri: &str) -> Request {
        let mut req = Request::builder()
            .uri(uri)
            .header("x-forwarded-for", "1.1.1.1")
            .header("connection", "keep-alive, x-hop")
            .header("x-hop", "1")
            .body(AxumBody::empty())
            .unwrap();
        req.extensions_mut()
            .insert(ConnectInfo("192.0.2.7:5555".parse::<SocketAddr>().unwrap()));
        req
    }

    async fn body_text(response: Response<AxumBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_forwarded_for_keeps_opaque_prior_values() {
        let mut headers = HeaderMap::new();
        append_forwarded_for(&mut headers, "192.0.2.7".parse().unwrap());
        assert_eq!(headers[&X_FORWARDED_FOR], "192.0.2.7");

        let mut headers = HeaderMap::new();
        headers.append(&X_FORWARDED_FOR, HeaderValue::from_bytes(b"caf\xe9").unwrap());
        headers.append(&X_FORWARDED_FOR, HeaderValue::from_static("1.1.1.1"));
        append_forwarded_for(&mut headers, "192.0.2.7".parse().unwrap());

        let folded: Vec<_> = headers.get_all(&X_FORWARDED_FOR).iter().collect();
        assert_eq!(folded.len(), 1);
        assert_eq!(folded[0].as_bytes(), b"caf\xe9, 1.1.1.1, 192.0.2.7");
    }

    #[tokio::test]
    async fn test_no_backend_returns_503() {
        let handler = handler_with(Arc::new(RecordingClient::default()), 0);
        let response = handler.handle_request(request("/")).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_text(response).await, NO_BACKEND_BODY);
    }

    #[tokio::test]
    async fn test_transport_error_returns_503() {
        let client = Arc::new(RecordingClient {
            fail: true,
            ..RecordingClient::default()
        });
        let handler = handler_with(client, 1);
        let response = handler.handle_request(request("/")).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_text(response).await, BACKEND_ERROR_BODY);
    }

    #[tokio::test]
    async fn test_request_is_rewritten_for_backend() {
        let client = Arc::new(RecordingClient::default());
        let handler = handler_with(client.clone(), 1);

        let response = handler
            .handle_request(request("http://proxy.example/a/b?c=d"))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "hello from backend");

        let seen = client.seen.lock().unwrap();
        let (uri, version, headers) = &seen[0];
        assert_eq!(uri.to_string(), "http://10.0.0.0:8080/a/b?c=d");
        assert_eq!(*version, Version::HTTP_11);
        assert_eq!(headers.get("x-forwarded-for").unwrap(), "1.1.1.1, 192.0.2.7");
        assert!(headers.get("connection").is_none());
        assert!(headers.get("x-hop").is_none());
    }

    #[tokio::test]
    async fn test_forwarded_for_follows_config_swap() {
        let client = Arc::new(RecordingClient::default());
        let handler = handler_with(client.clone(), 1);

        let config = ServerConfig {
            add_x_forwarded_for: false,
            ..ServerConfig::default()
        };
        handler.set_config(Arc::new(config));
        handler.handle_request(request("/")).await;

        let seen = client.seen.lock().unwrap();
        assert_eq!(seen[0].2.get("x-forwarded-for").unwrap(), "1.1.1.1");
    }

    #[tokio::test]
    async fn test_set_load_balancer_swaps_backends() {
        let client = Arc::new(RecordingClient::default());
        let handler = handler_with(client.clone(), 0);
        let old_balancer = handler.load_balancer();

        let replacement = handler_with(client, 2).load_balancer();
        handler.set_load_balancer(replacement.clone()).await;

        assert!(Arc::ptr_eq(&handler.load_balancer(), &replacement));
        assert!(!Arc::ptr_eq(&old_balancer, &replacement));
        let response = handler.handle_request(request("/")).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_router_forwards_any_method_and_path() {
        let client = Arc::new(RecordingClient::default());
        let app = router(Arc::new(handler_with(client.clone(), 1)));

        for (method, uri) in [("GET", "/"), ("DELETE", "/deep/path"), ("PATCH", "/x?y=z")] {
            let req = Request::builder()
                .method(method)
                .uri(uri)
                .body(AxumBody::empty())
                .unwrap();
            let response = app.clone().oneshot(req).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK, "{method} {uri}");
        }
        assert_eq!(client.seen.lock().unwrap().len(), 3);
    }
}
