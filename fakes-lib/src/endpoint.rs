use std::fmt;

use parking_lot::Mutex;
use rama::http::{Method, service::web::response::IntoResponse};

use crate::router::{Expectation, FakeRequest, Handler};

/// Amount of induced failures an endpoint allows
/// when no explicit maximum was configured.
pub const DEFAULT_MAX_FAILURE_COUNT: u32 = 3;

#[derive(Clone)]
/// Declaration of a single route of a [`FakeService`].
///
/// The declaration is resolved (and validated) once,
/// at the moment it is registered on the service.
///
/// [`FakeService`]: crate::FakeService
pub struct Endpoint {
    pub(crate) path: String,
    pub(crate) methods: Vec<Method>,
    pub(crate) response: Vec<u8>,
    pub(crate) status_code: u16,
    pub(crate) content_type: Option<String>,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) handler: Option<Handler>,
    pub(crate) expectation: Option<Expectation>,
    pub(crate) failure_rate_percent: i32,
    pub(crate) failure_handler: Option<Handler>,
    pub(crate) max_failure_count: Option<u32>,
}

impl Endpoint {
    /// Declare a new endpoint for the given path.
    ///
    /// Paths follow the rama path matcher syntax (e.g. `/users/{id}` or `/assets/*`),
    /// gin style named segments such as `/users/:id` are accepted as well.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            methods: Vec::new(),
            response: Vec::new(),
            status_code: 0,
            content_type: None,
            headers: Vec::new(),
            handler: None,
            expectation: None,
            failure_rate_percent: 0,
            failure_handler: None,
            max_failure_count: None,
        }
    }

    /// Restrict the endpoint to the given methods.
    ///
    /// Without any methods the endpoint answers to all standard HTTP methods.
    pub fn with_methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.methods.extend(methods);
        self
    }

    /// Add a single method to which this endpoint answers.
    pub fn with_method(mut self, method: Method) -> Self {
        self.methods.push(method);
        self
    }

    /// Literal body returned on the normal path.
    pub fn with_response(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.response = body.into();
        self
    }

    /// Status code returned on the normal path, `0` means `200 OK`.
    pub fn with_status(mut self, status: impl Into<u16>) -> Self {
        self.status_code = status.into();
        self
    }

    /// Content type of the normal path, defaults to `application/json`.
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Header added to every normal response of this endpoint.
    ///
    /// Setting the same header name twice keeps the last value.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        self.headers
            .retain(|(existing, _)| !existing.eq_ignore_ascii_case(&name));
        self.headers.push((name, value.into()));
        self
    }

    /// Headers added to every normal response of this endpoint.
    pub fn with_headers<K, V>(mut self, headers: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        for (name, value) in headers {
            self = self.with_header(name, value);
        }
        self
    }

    /// Fully custom response for the normal path,
    /// taking precedence over the configured status code and body.
    ///
    /// The endpoint content type and headers are still applied to its response.
    pub fn with_handler<F, R>(mut self, handler: F) -> Self
    where
        F: Fn(&FakeRequest) -> R + Send + Sync + 'static,
        R: IntoResponse,
    {
        self.handler = Some(Handler::new(handler));
        self
    }

    /// Callback invoked with every request that takes the normal path,
    /// meant for assertions on the request made by the system under test.
    ///
    /// A panicking expectation is reported when tidying up the service.
    pub fn with_expectation<F>(mut self, expectation: F) -> Self
    where
        F: Fn(&FakeRequest) + Send + Sync + 'static,
    {
        self.expectation = Some(Expectation::new(expectation));
        self
    }

    /// Probability (in percent) that a call is answered by the failure handler.
    ///
    /// Values `<= 0` never fail, values `>= 100` always fail
    /// (as long as the failure budget is not exhausted).
    pub fn with_failure_rate(mut self, percent: i32) -> Self {
        self.failure_rate_percent = percent;
        self
    }

    /// Response used when chaos triggers for this endpoint.
    pub fn with_failure_handler<F, R>(mut self, handler: F) -> Self
    where
        F: Fn(&FakeRequest) -> R + Send + Sync + 'static,
        R: IntoResponse,
    {
        self.failure_handler = Some(Handler::new(handler));
        self
    }

    /// Upper bound of the calls which can be answered with an induced failure,
    /// defaults to [`DEFAULT_MAX_FAILURE_COUNT`].
    pub fn with_max_failure_count(mut self, count: u32) -> Self {
        self.max_failure_count = Some(count);
        self
    }

    /// Declared path of this endpoint.
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("path", &self.path)
            .field("methods", &self.methods)
            .field("response", &String::from_utf8_lossy(&self.response))
            .field("status_code", &self.status_code)
            .field("content_type", &self.content_type)
            .field("headers", &self.headers)
            .field("handler", &self.handler.is_some())
            .field("expectation", &self.expectation.is_some())
            .field("failure_rate_percent", &self.failure_rate_percent)
            .field("failure_handler", &self.failure_handler.is_some())
            .field("max_failure_count", &self.max_failure_count)
            .finish()
    }
}

#[derive(Debug, Default)]
/// Per endpoint call counter.
///
/// All reads and writes go through the same lock,
/// which is only ever held for O(1) work.
pub struct CallCounter {
    calls: Mutex<u64>,
}

impl CallCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a call and report whether an (already drawn) failure
    /// can still be delivered for it.
    ///
    /// The budget check is made against the count prior to this call,
    /// within the same critical section as the increment.
    pub fn record_and_check_budget(&self, failure_drawn: bool, max_failure_count: u32) -> bool {
        let mut calls = self.calls.lock();
        let previous = *calls;
        *calls = previous.saturating_add(1);
        failure_drawn && previous < u64::from(max_failure_count)
    }

    #[inline(always)]
    pub fn record_call(&self) {
        let _ = self.record_and_check_budget(false, 0);
    }

    pub fn calls(&self) -> u64 {
        *self.calls.lock()
    }
}
