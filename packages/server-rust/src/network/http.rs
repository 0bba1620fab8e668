//! HTTP mapping for unary methods.
//!
//! Every `Method` blueprint is reachable at `/{contract}/{operation}`:
//! `GET` when it takes no arguments, `POST` with a JSON array body of
//! positional arguments otherwise. The response body is the JSON
//! [`ResponseEnvelope`].
//!
//! The embedding HTTP server authenticates the request and places the
//! caller's [`Principal`] in the request extensions.

use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use http::{header, Method, Request, Response, StatusCode};
use tether_core::{DynamicConverter, Element, OperationKind, Principal};
use tokio_util::sync::CancellationToken;
use tower::Service;
use tracing::debug;

use crate::service::blueprint::OperationBlueprint;
use crate::service::handler::RequestHandler;
use crate::service::operation::{OperationRequest, ResponseEnvelope, TransportContext};

/// Verb and path under which a method is exposed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRoute {
    pub method: Method,
    pub path: String,
}

impl HttpRoute {
    /// Route for `blueprint`, or `None` for non-method operations.
    #[must_use]
    pub fn for_blueprint(blueprint: &OperationBlueprint) -> Option<Self> {
        if blueprint.kind() != OperationKind::Method {
            return None;
        }
        let takes_arguments = blueprint.params().len() > blueprint.trailing_cancellation_count();
        Some(Self {
            method: if takes_arguments { Method::POST } else { Method::GET },
            path: format!("/{}/{}", blueprint.contract_name(), blueprint.operation_name()),
        })
    }
}

/// Tower service invoking unary methods over HTTP.
#[derive(Clone)]
pub struct HttpInvoker {
    handler: Arc<RequestHandler>,
}

impl HttpInvoker {
    #[must_use]
    pub fn new(handler: Arc<RequestHandler>) -> Self {
        Self { handler }
    }

    /// Routes for every registered method.
    #[must_use]
    pub fn routes(&self) -> Vec<HttpRoute> {
        let mut routes: Vec<HttpRoute> = self
            .handler
            .registry()
            .blueprints()
            .iter()
            .filter_map(|blueprint| HttpRoute::for_blueprint(blueprint))
            .collect();
        routes.sort_by(|a, b| a.path.cmp(&b.path));
        routes
    }

    async fn dispatch(handler: Arc<RequestHandler>, request: Request<Bytes>) -> Response<Bytes> {
        let Some((contract, operation)) = split_path(request.uri().path()) else {
            return plain(StatusCode::NOT_FOUND, "unknown route");
        };
        let route = handler
            .registry()
            .resolve(contract, operation)
            .and_then(|blueprint| HttpRoute::for_blueprint(&blueprint));
        let Some(route) = route else {
            return plain(StatusCode::NOT_FOUND, "unknown route");
        };
        if request.method() != route.method {
            return plain(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
        }

        let args = if route.method == Method::GET {
            Vec::new()
        } else {
            match decode_arguments(request.body()) {
                Ok(args) => args,
                Err(reason) => {
                    debug!(path = %route.path, %reason, "rejected request body");
                    return plain(StatusCode::BAD_REQUEST, &reason);
                }
            }
        };

        let transport = request
            .extensions()
            .get::<Principal>()
            .cloned()
            .map_or_else(TransportContext::anonymous, TransportContext::authenticated);
        let envelope = handler
            .invoke_method(
                OperationRequest::new(contract, operation, args),
                Some(transport),
                CancellationToken::new(),
            )
            .await;
        json(status_for(&envelope), &envelope)
    }
}

impl Service<Request<Bytes>> for HttpInvoker {
    type Response = Response<Bytes>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Response<Bytes>, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request<Bytes>) -> Self::Future {
        let handler = Arc::clone(&self.handler);
        async move { Ok(Self::dispatch(handler, request).await) }.boxed()
    }
}

impl std::fmt::Debug for HttpInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpInvoker").finish_non_exhaustive()
    }
}

fn split_path(path: &str) -> Option<(&str, &str)> {
    let (contract, operation) = path.strip_prefix('/')?.split_once('/')?;
    if contract.is_empty() || operation.is_empty() || operation.contains('/') {
        return None;
    }
    Some((contract, operation))
}

/// An empty body means no arguments.
fn decode_arguments(body: &[u8]) -> Result<Vec<Element>, String> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    let values: Vec<serde_json::Value> =
        serde_json::from_slice(body).map_err(|err| format!("body must be a JSON array: {err}"))?;
    let converter = DynamicConverter::new();
    values
        .iter()
        .map(|value| converter.serialize_to_element(value).map_err(|err| err.to_string()))
        .collect()
}

fn status_for(envelope: &ResponseEnvelope) -> StatusCode {
    if envelope.success {
        return StatusCode::OK;
    }
    match envelope.code.unwrap_or("internal") {
        "not_found" => StatusCode::NOT_FOUND,
        "invalid_argument" | "parameter_count_mismatch" => StatusCode::BAD_REQUEST,
        "unauthorized" => StatusCode::UNAUTHORIZED,
        "forbidden" => StatusCode::FORBIDDEN,
        "rate_limited" => StatusCode::TOO_MANY_REQUESTS,
        "timeout" => StatusCode::GATEWAY_TIMEOUT,
        "service_unavailable" => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn json(status: StatusCode, envelope: &ResponseEnvelope) -> Response<Bytes> {
    match serde_json::to_vec(envelope) {
        Ok(body) => respond(status, "application/json", Bytes::from(body)),
        Err(err) => plain(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("failed to encode response: {err}"),
        ),
    }
}

fn plain(status: StatusCode, message: &str) -> Response<Bytes> {
    respond(status, "text/plain; charset=utf-8", Bytes::from(message.to_owned()))
}

fn respond(status: StatusCode, content_type: &'static str, body: Bytes) -> Response<Bytes> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, header::HeaderValue::from_static(content_type));
    response
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;
    use crate::service::middleware::default_pipeline;
    use crate::service::registry::OperationRegistry;
    use crate::service::ServerConfig;
    use crate::subscription::LiveSubscriptionRegistry;
    use crate::test_support::{registry_with, services_with, Calculator};

    fn invoker() -> HttpInvoker {
        let config = ServerConfig::default();
        let registry: OperationRegistry = registry_with(default_pipeline(&config));
        HttpInvoker::new(Arc::new(RequestHandler::new(
            Arc::new(registry),
            services_with(Arc::new(Calculator::default())),
            Arc::new(LiveSubscriptionRegistry::new()),
            &config,
        )))
    }

    fn request(method: Method, path: &str, body: &str) -> Request<Bytes> {
        Request::builder()
            .method(method)
            .uri(path)
            .body(Bytes::from(body.to_owned()))
            .unwrap()
    }

    async fn call(request: Request<Bytes>) -> (StatusCode, Value) {
        let response = invoker().oneshot(request).await.unwrap();
        let status = response.status();
        let body = serde_json::from_slice(response.body()).unwrap_or(Value::Null);
        (status, body)
    }

    #[test]
    fn routes_follow_the_parameter_list() {
        let routes = invoker().routes();
        assert!(routes.contains(&HttpRoute {
            method: Method::GET,
            path: "/calculator/answer".to_string(),
        }));
        assert!(routes.contains(&HttpRoute {
            method: Method::POST,
            path: "/calculator/add".to_string(),
        }));
        assert!(
            routes.iter().all(|route| route.path != "/calculator/sum_lines"),
            "methods taking client streams are ingest operations"
        );
        assert!(routes.iter().all(|route| route.path != "/calculator/count_to"));
        assert!(routes.iter().all(|route| route.path != "/calculator/ticks"));
    }

    #[tokio::test]
    async fn get_returns_the_envelope() {
        let (status, body) = call(request(Method::GET, "/calculator/answer", "")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "success": true, "data": 42 }));
    }

    #[tokio::test]
    async fn post_passes_positional_arguments() {
        let (status, body) = call(request(Method::POST, "/calculator/add", "[2, 3]")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"], json!(5));
    }

    #[tokio::test]
    async fn unit_methods_have_no_data() {
        let (status, body) = call(request(Method::GET, "/calculator/reset", "")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "success": true }));
    }

    #[tokio::test]
    async fn routing_failures() {
        let (status, _) = call(request(Method::GET, "/calculator/missing", "")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(request(Method::POST, "/calculator/count_to", "[3]")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(request(Method::GET, "/calculator", "")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(request(Method::GET, "/calculator/add", "")).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn malformed_bodies_are_bad_requests() {
        let (status, _) = call(request(Method::POST, "/calculator/add", "{\"a\": 1}")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(request(Method::POST, "/calculator/add", "[1, \"two\"]")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], json!(false));
        assert_eq!(body["code"], json!("invalid_argument"));
    }

    #[tokio::test]
    async fn authorization_uses_the_request_principal() {
        let (status, _) = call(request(Method::GET, "/calculator/admin_only", "")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let mut req = request(Method::GET, "/calculator/admin_only", "");
        req.extensions_mut().insert(Principal::new("erin"));
        let (status, _) = call(req).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let mut req = request(Method::GET, "/calculator/admin_only", "");
        req.extensions_mut()
            .insert(Principal::new("erin").with_roles(["admin"]));
        let (status, body) = call(req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"], json!("granted"));
    }

    #[tokio::test]
    async fn internal_failures_are_redacted() {
        let (status, body) = call(request(Method::GET, "/calculator/fail", "")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], json!("internal server error"));
    }
}
