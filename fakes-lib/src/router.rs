//! Registry and dispatcher of the endpoints of a fake service.

use std::{
    any::Any,
    convert::Infallible,
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};

use parking_lot::Mutex;
use rama::{
    Service,
    error::{BoxError, ErrorContext as _},
    extensions::{ExtensionsMut as _, ExtensionsRef as _},
    http::{
        Body, HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode, Uri,
        body::util::BodyExt as _,
        header::CONTENT_TYPE,
        matcher::{PathMatcher, UriParams},
        service::web::response::IntoResponse,
    },
    telemetry::tracing,
};
use serde::de::DeserializeOwned;

use crate::{
    chaos::{FailureController, FailurePolicy},
    endpoint::{CallCounter, Endpoint},
};

/// Methods an endpoint answers to when none were declared.
pub const STANDARD_METHODS: [Method; 9] = [
    Method::GET,
    Method::DELETE,
    Method::HEAD,
    Method::OPTIONS,
    Method::PATCH,
    Method::POST,
    Method::PUT,
    Method::TRACE,
    Method::CONNECT,
];

static DEFAULT_CONTENT_TYPE: HeaderValue = HeaderValue::from_static("application/json");

#[derive(Clone)]
/// Response producing callback, used for override and failure handlers.
pub struct Handler(Arc<dyn Fn(&FakeRequest) -> Response + Send + Sync + 'static>);

impl Handler {
    pub fn new<F, R>(handler: F) -> Self
    where
        F: Fn(&FakeRequest) -> R + Send + Sync + 'static,
        R: IntoResponse,
    {
        Self(Arc::new(move |req: &FakeRequest| handler(req).into_response()))
    }

    #[inline(always)]
    pub fn call(&self, req: &FakeRequest) -> Response {
        (self.0)(req)
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handler").finish()
    }
}

#[derive(Clone)]
/// Assertion callback invoked with the requests of an endpoint.
pub struct Expectation(Arc<dyn Fn(&FakeRequest) + Send + Sync + 'static>);

impl Expectation {
    pub fn new<F>(expectation: F) -> Self
    where
        F: Fn(&FakeRequest) + Send + Sync + 'static,
    {
        Self(Arc::new(expectation))
    }

    /// Run the expectation, returning the panic message if it failed.
    fn check(&self, req: &FakeRequest) -> Result<(), String> {
        catch_unwind(AssertUnwindSafe(|| (self.0)(req))).map_err(panic_message)
    }
}

impl fmt::Debug for Expectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Expectation").finish()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "expectation panicked".to_owned()
    }
}

#[derive(Debug, Clone)]
/// Inbound request as seen by handlers and expectations,
/// with its body fully collected.
pub struct FakeRequest {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    params: Option<UriParams>,
    body: Vec<u8>,
}

impl FakeRequest {
    pub(crate) async fn from_request(req: Request) -> Self {
        let params = req.extensions().get::<UriParams>().cloned();
        let (parts, body) = req.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes().to_vec(),
            Err(err) => {
                tracing::debug!("failed to collect fake request body (use empty body): {err}");
                Vec::new()
            }
        };
        Self {
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            params,
            body,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn query(&self) -> Option<&str> {
        self.uri.query()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// First value of the given header, if present and valid utf-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    /// Value of a named path segment, e.g. `id` for `/users/{id}`.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.as_ref()?.get(name)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, BoxError> {
        serde_json::from_slice(&self.body).context("decode fake request body as json")
    }
}

#[derive(Debug)]
enum Responder {
    Render { status: StatusCode, body: Vec<u8> },
    Custom(Handler),
}

#[derive(Debug)]
/// An [`Endpoint`] resolved at registration, together with its call counter.
pub(crate) struct Route {
    pattern: String,
    matcher: PathMatcher,
    methods: Vec<Method>,
    responder: Responder,
    /// Configured content type, else `application/json`,
    /// also overriding the one set by a custom handler.
    content_type: HeaderValue,
    headers: Vec<(HeaderName, HeaderValue)>,
    expectation: Option<Expectation>,
    failure: Option<FailurePolicy>,
    counter: CallCounter,
}

impl Route {
    pub(crate) fn try_new(endpoint: Endpoint) -> Result<Self, BoxError> {
        let path = endpoint.path.clone();
        Self::try_resolve(endpoint)
            .context("resolve fake endpoint")
            .context_str_field("path", path.as_str())
    }

    fn try_resolve(endpoint: Endpoint) -> Result<Self, BoxError> {
        let Endpoint {
            path,
            methods,
            response,
            status_code,
            content_type,
            headers,
            handler,
            expectation,
            failure_rate_percent,
            failure_handler,
            max_failure_count,
        } = endpoint;

        let pattern = normalise_path(&path);
        let matcher = PathMatcher::new(pattern.as_str());

        let methods = if methods.is_empty() {
            STANDARD_METHODS.to_vec()
        } else {
            let mut unique = Vec::with_capacity(methods.len());
            for method in methods {
                if !unique.contains(&method) {
                    unique.push(method);
                }
            }
            unique
        };

        let responder = match handler {
            Some(handler) => Responder::Custom(handler),
            None => {
                let status = if status_code == 0 {
                    StatusCode::OK
                } else {
                    StatusCode::from_u16(status_code).context("parse endpoint status code")?
                };
                Responder::Render {
                    status,
                    body: response,
                }
            }
        };

        let content_type = content_type
            .map(|value| HeaderValue::from_str(&value).context("parse endpoint content type"))
            .transpose()?
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.clone());

        let headers = headers
            .into_iter()
            .map(|(name, value)| {
                let name = HeaderName::from_bytes(name.as_bytes())
                    .context("parse endpoint header name")
                    .context_str_field("name", name.as_str())?;
                let value = HeaderValue::from_str(&value)
                    .context("parse endpoint header value")
                    .context_str_field("name", name.as_str())?;
                Ok((name, value))
            })
            .collect::<Result<Vec<_>, BoxError>>()?;

        let failure =
            FailurePolicy::try_new(failure_rate_percent, failure_handler, max_failure_count)?;

        Ok(Self {
            pattern,
            matcher,
            methods,
            responder,
            content_type,
            headers,
            expectation,
            failure,
            counter: CallCounter::new(),
        })
    }

    pub(crate) fn pattern(&self) -> &str {
        &self.pattern
    }

    pub(crate) fn methods(&self) -> &[Method] {
        &self.methods
    }

    pub(crate) fn calls(&self) -> u64 {
        self.counter.calls()
    }

    /// Match the route against the request,
    /// storing the named path segments in the request extensions on a match.
    fn matches(&self, req: &mut Request, path: &str) -> bool {
        self.methods.contains(req.method())
            && self.matcher.matches_path(Some(req.extensions_mut()), path)
    }

    async fn dispatch(&self, req: Request, state: &DispatchState) -> Response {
        let req = FakeRequest::from_request(req).await;

        if state
            .chaos
            .should_fail(self.failure.as_ref(), &self.counter)
            && let Some(failure) = self.failure.as_ref()
        {
            tracing::debug!(
                http.request.method = %req.method(),
                url.full = %req.uri(),
                fake.endpoint = %self.pattern,
                "fake endpoint matched: induce failure",
            );
            return failure.handler().call(&req);
        }

        if let Some(expectation) = self.expectation.as_ref()
            && let Err(msg) = expectation.check(&req)
        {
            tracing::error!(
                http.request.method = %req.method(),
                url.full = %req.uri(),
                fake.endpoint = %self.pattern,
                "fake endpoint expectation failed: {msg}",
            );
            state.expectation_failures.lock().push(format!(
                "expectation of endpoint {} failed for {} {}: {msg}",
                self.pattern,
                req.method(),
                req.uri(),
            ));
        }

        let mut resp = match &self.responder {
            Responder::Render { status, body } => {
                let mut resp = Response::new(Body::from(body.clone()));
                *resp.status_mut() = *status;
                resp
            }
            Responder::Custom(handler) => handler.call(&req),
        };

        let headers = resp.headers_mut();
        headers.insert(CONTENT_TYPE, self.content_type.clone());
        for (name, value) in &self.headers {
            headers.insert(name.clone(), value.clone());
        }

        tracing::debug!(
            http.request.method = %req.method(),
            url.full = %req.uri(),
            fake.endpoint = %self.pattern,
            http.response.status_code = resp.status().as_u16(),
            "fake endpoint matched: normal response",
        );

        resp
    }
}

/// Turn a declared path into a rama path matcher pattern,
/// rewriting gin style segments (`:id`) into `{id}`.
pub(crate) fn normalise_path(path: &str) -> String {
    let segments = path
        .trim()
        .trim_start_matches('/')
        .split('/')
        .map(|segment| match segment.strip_prefix(':') {
            Some(name) if !name.is_empty() => format!("{{{name}}}"),
            _ => segment.to_owned(),
        })
        .collect::<Vec<_>>()
        .join("/");
    format!("/{segments}")
}

#[derive(Debug, Default)]
/// State shared by all routes of a single fake service.
pub(crate) struct DispatchState {
    chaos: FailureController,
    expectation_failures: Mutex<Vec<String>>,
}

impl DispatchState {
    pub(crate) fn new(chaos: FailureController) -> Self {
        Self {
            chaos,
            expectation_failures: Default::default(),
        }
    }

    pub(crate) fn expectation_failures(&self) -> Vec<String> {
        self.expectation_failures.lock().clone()
    }
}

#[derive(Debug, Clone)]
/// Routes requests to the first registered endpoint matching method and path.
///
/// Requests matching no endpoint are answered with `404 Not Found`.
pub(crate) struct FakeRouter {
    routes: Arc<[Arc<Route>]>,
    state: Arc<DispatchState>,
}

impl FakeRouter {
    pub(crate) fn new(routes: Arc<[Arc<Route>]>, state: Arc<DispatchState>) -> Self {
        Self { routes, state }
    }
}

impl Service<Request> for FakeRouter {
    type Output = Response;
    type Error = Infallible;

    async fn serve(&self, mut req: Request) -> Result<Self::Output, Self::Error> {
        let path = req.uri().path().to_owned();
        for route in self.routes.iter() {
            if route.matches(&mut req, &path) {
                return Ok(route.dispatch(req, &self.state).await);
            }
        }

        tracing::debug!(
            http.request.method = %req.method(),
            url.full = %req.uri(),
            "no fake endpoint matched: not found",
        );
        Ok(StatusCode::NOT_FOUND.into_response())
    }
}
