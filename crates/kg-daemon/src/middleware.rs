//! Middleware stack for the knowledge graph control plane's HTTP API:
//! request id, structured request logging, a sliding-window rate limiter,
//! and CORS.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tokio::sync::Mutex;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tracing::info;
use uuid::Uuid;

/// A unique request identifier, available as an Axum extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub Uuid);

/// Generates a [`RequestId`] for each request and sets the `x-request-id`
/// response header.
pub async fn request_id_middleware(mut req: Request, next: Next) -> Response {
    let id = RequestId(Uuid::new_v4());
    req.extensions_mut().insert(id);
    let mut resp = next.run(req).await;
    resp.headers_mut().insert(
        "x-request-id",
        HeaderValue::from_str(&id.0.to_string()).unwrap_or_else(|_| HeaderValue::from_static("invalid")),
    );
    resp
}

/// Logs method, path, status, and duration for each request.
pub async fn request_logger(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    let start = Instant::now();

    let resp = next.run(req).await;

    let duration = start.elapsed();
    info!(
        http.method = %method,
        http.path = %path,
        http.status = resp.status().as_u16(),
        http.duration_ms = duration.as_millis() as u64,
        "request completed"
    );

    resp
}

/// In-memory sliding-window rate limiter (spec §7 `RateLimitedServer`).
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Mutex<RateLimiterInner>>,
    max_requests: u32,
    window: Duration,
}

struct RateLimiterInner {
    timestamps: VecDeque<Instant>,
}

impl RateLimiter {
    /// A limiter allowing `max_requests` within a sliding `window`.
    #[must_use]
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self { inner: Arc::new(Mutex::new(RateLimiterInner { timestamps: VecDeque::new() })), max_requests, window }
    }

    async fn check(&self) -> Result<(), StatusCode> {
        let now = Instant::now();
        let mut guard = self.inner.lock().await;

        while let Some(&front) = guard.timestamps.front() {
            if now.duration_since(front) > self.window {
                guard.timestamps.pop_front();
            } else {
                break;
            }
        }

        if guard.timestamps.len() as u32 >= self.max_requests {
            return Err(StatusCode::TOO_MANY_REQUESTS);
        }
        guard.timestamps.push_back(now);
        Ok(())
    }

    /// Wrap this limiter into a Tower [`Layer`](tower::Layer).
    #[must_use]
    pub fn into_layer(self) -> RateLimiterLayer {
        RateLimiterLayer(self)
    }
}

/// Tower [`Layer`] wrapping a service with [`RateLimiter`] enforcement.
#[derive(Clone)]
pub struct RateLimiterLayer(RateLimiter);

impl<S: Clone> tower::Layer<S> for RateLimiterLayer {
    type Service = RateLimiterService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimiterService { limiter: self.0.clone(), inner }
    }
}

/// Tower [`Service`] enforcing [`RateLimiter`] before forwarding downstream.
#[derive(Clone)]
pub struct RateLimiterService<S> {
    limiter: RateLimiter,
    inner: S,
}

impl<S> tower::Service<Request<Body>> for RateLimiterService<S>
where
    S: tower::Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
    S::Error: IntoResponse,
{
    type Response = Response;
    type Error = S::Error;
    type Future = std::pin::Pin<Box<dyn std::future::Future<Output = Result<Response, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let limiter = self.limiter.clone();
        let mut inner = self.inner.clone();
        Box::pin(async move {
            if let Err(status) = limiter.check().await {
                return Ok((status, "too many requests").into_response());
            }
            inner.call(req).await
        })
    }
}

/// CORS configuration, converted into a [`tower_http::cors::CorsLayer`].
#[derive(Debug, Clone)]
pub struct CorsConfig {
    /// Allowed origins. An empty list permits none.
    pub allowed_origins: Vec<String>,
    /// Allowed HTTP methods.
    pub allowed_methods: Vec<String>,
    /// Allowed request headers.
    pub allowed_headers: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["*".to_string()],
            allowed_methods: vec!["GET".into(), "POST".into(), "DELETE".into()],
            allowed_headers: vec!["authorization".into(), "content-type".into()],
        }
    }
}

impl CorsConfig {
    /// Build the [`CorsLayer`] this configuration describes.
    #[must_use]
    pub fn to_cors_layer(&self) -> CorsLayer {
        if self.allowed_origins.iter().any(|o| o == "*") {
            return CorsLayer::new().allow_origin(AllowOrigin::any());
        }
        let origins: Vec<HeaderValue> = self.allowed_origins.iter().filter_map(|o| HeaderValue::from_str(o).ok()).collect();
        let methods: Vec<axum::http::Method> = self.allowed_methods.iter().filter_map(|m| m.parse().ok()).collect();
        let headers: Vec<axum::http::HeaderName> = self.allowed_headers.iter().filter_map(|h| h.parse().ok()).collect();

        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(AllowMethods::list(methods))
            .allow_headers(AllowHeaders::list(headers))
    }
}
