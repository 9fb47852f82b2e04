//! JSON description of fake endpoints,
//! used to serve fakes without writing any code.
//!
//! ```json
//! {
//!   "endpoints": [
//!     { "path": "/hello", "methods": ["GET"], "response": { "message": "hello" } },
//!     {
//!       "path": "/flaky/:id",
//!       "failure_rate_percent": 100,
//!       "failure_status_code": 503,
//!       "max_failure_count": 2
//!     }
//!   ]
//! }
//! ```

use std::{collections::BTreeMap, path::Path};

use rama::{
    error::{BoxError, ErrorContext as _},
    http::{Body, HeaderValue, Method, Response, StatusCode, header::CONTENT_TYPE},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{endpoint::Endpoint, router::FakeRequest};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Fixture {
    #[serde(default)]
    pub endpoints: Vec<EndpointFixture>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointFixture {
    pub path: String,

    /// Empty means all standard methods.
    #[serde(default)]
    pub methods: Vec<String>,

    /// Strings are served verbatim as plain text, any other value as JSON.
    /// Either way an explicit `content_type` takes precedence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,

    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    #[serde(default)]
    pub failure_rate_percent: i32,

    #[serde(default = "default_failure_status_code")]
    pub failure_status_code: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_response: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_failure_count: Option<u32>,
}

fn default_failure_status_code() -> u16 {
    500
}

impl Fixture {
    pub fn from_json_str(s: &str) -> Result<Self, BoxError> {
        serde_json::from_str(s).context("decode fixture json")
    }

    pub async fn try_load(path: impl AsRef<Path>) -> Result<Self, BoxError> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path)
            .await
            .context("read fixture file")
            .with_context_debug_field("path", || path.to_path_buf())?;
        Self::from_json_str(&raw).with_context_debug_field("path", || path.to_path_buf())
    }

    /// Turn the fixture into endpoint declarations, in fixture order.
    pub fn into_endpoints(self) -> Result<Vec<Endpoint>, BoxError> {
        self.endpoints
            .into_iter()
            .map(EndpointFixture::try_into_endpoint)
            .collect()
    }
}

impl EndpointFixture {
    fn try_into_endpoint(self) -> Result<Endpoint, BoxError> {
        let Self {
            path,
            methods,
            response,
            status_code,
            content_type,
            headers,
            failure_rate_percent,
            failure_status_code,
            failure_response,
            max_failure_count,
        } = self;

        let methods = methods
            .iter()
            .map(|method| {
                Method::from_bytes(method.to_ascii_uppercase().as_bytes())
                    .context("parse fixture method")
                    .context_str_field("method", method.as_str())
            })
            .collect::<Result<Vec<_>, _>>()
            .context_str_field("path", path.as_str())?;

        let mut endpoint = Endpoint::new(path.as_str())
            .with_methods(methods)
            .with_headers(headers)
            .with_failure_rate(failure_rate_percent);

        let mut rendered_content_type = None;
        if let Some(response) = response {
            let (body, response_content_type) = render_value(&response)?;
            endpoint = endpoint.with_response(body);
            rendered_content_type = Some(response_content_type);
        }
        if let Some(status_code) = status_code {
            endpoint = endpoint.with_status(status_code);
        }
        if let Some(content_type) = content_type.or(rendered_content_type.map(str::to_owned)) {
            endpoint = endpoint.with_content_type(content_type);
        }
        if let Some(max_failure_count) = max_failure_count {
            endpoint = endpoint.with_max_failure_count(max_failure_count);
        }

        if failure_rate_percent > 0 {
            let status = StatusCode::from_u16(failure_status_code)
                .context("parse fixture failure status code")
                .context_field("failure_status_code", failure_status_code)
                .context_str_field("path", path.as_str())?;
            let (body, content_type) = match failure_response.as_ref() {
                Some(value) => {
                    let (body, content_type) = render_value(value)?;
                    (body, Some(HeaderValue::from_static(content_type)))
                }
                None => (Vec::new(), None),
            };
            endpoint = endpoint.with_failure_handler(move |_: &FakeRequest| {
                let mut resp = Response::new(Body::from(body.clone()));
                *resp.status_mut() = status;
                if let Some(content_type) = content_type.clone() {
                    resp.headers_mut().insert(CONTENT_TYPE, content_type);
                }
                resp
            });
        }

        Ok(endpoint)
    }
}

fn render_value(value: &Value) -> Result<(Vec<u8>, &'static str), BoxError> {
    match value {
        Value::String(s) => Ok((s.as_bytes().to_vec(), "text/plain; charset=utf-8")),
        value => Ok((
            serde_json::to_vec(value).context("encode fixture response as json")?,
            "application/json",
        )),
    }
}
