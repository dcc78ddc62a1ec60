//! Signed request construction for the three supported operations.

use crate::config::Credentials;
use crate::signer::{self, AMZ_DATE, Headers, SigningRequest, uri_encode};
use bytes::Bytes;
use chrono::{DateTime, SubsecRound, Utc};
use http::{Method, Request};
use http_body_util::Full;
use serde::Deserialize;

pub const API_VERSION: &str = "2015-03-31";
pub const JSON_CONTENT_TYPE: &str = "application/x-amz-json-1.0";
pub const INVOCATION_TYPE: &str = "x-amz-invocation-type";

/// `(service, region, domain)`. The derived host is used both as the `host`
/// header and as the TLS server name, so the two always agree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub service: String,
    pub region: String,
    pub domain: String,
}

impl Endpoint {
    pub fn new(
        service: impl Into<String>,
        region: impl Into<String>,
        domain: impl Into<String>,
    ) -> Self {
        Endpoint {
            service: service.into(),
            region: region.into(),
            domain: domain.into(),
        }
    }

    pub fn host(&self) -> String {
        format!("{}.{}.{}", self.service, self.region, self.domain)
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq, Hash)]
pub enum InvocationMode {
    /// Wait for the function result.
    #[default]
    RequestResponse,
    /// Queue the invocation and return immediately.
    Event,
    /// Validate parameters and permissions only.
    DryRun,
}

impl InvocationMode {
    pub const fn as_str(&self) -> &'static str {
        match self {
            InvocationMode::RequestResponse => "RequestResponse",
            InvocationMode::Event => "Event",
            InvocationMode::DryRun => "DryRun",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub function_name: String,
    pub payload: Bytes,
    pub qualifier: Option<String>,
    pub mode: InvocationMode,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Invoke(Invocation),
    ListFunctions,
    ListVersions { function_name: String },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Invoke(_) => "invoke",
            Operation::ListFunctions => "list_functions",
            Operation::ListVersions { .. } => "list_versions",
        }
    }
}

/// A fully signed request. It is never mutated or re-signed once built.
#[derive(Debug, Clone, PartialEq)]
pub struct SignedHttpMessage {
    method: Method,
    path: String,
    query: String,
    headers: Headers,
    body: Bytes,
}

impl SignedHttpMessage {
    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Origin-form request target, `path[?query]`.
    pub fn target(&self) -> String {
        if self.query.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, self.query)
        }
    }

    /// The wire form of the message, carrying exactly the signed headers.
    pub fn to_request(&self) -> Result<Request<Full<Bytes>>, http::Error> {
        let mut builder = Request::builder()
            .method(self.method.clone())
            .uri(self.target());
        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder.body(Full::new(self.body.clone()))
    }
}

/// Builds and signs `operation` against `endpoint`, stamped with the current
/// time truncated to whole seconds.
pub fn build_request_now(
    credentials: &Credentials,
    endpoint: &Endpoint,
    operation: &Operation,
) -> SignedHttpMessage {
    build_request(credentials, endpoint, operation, Utc::now().trunc_subsecs(0))
}

pub fn build_request(
    credentials: &Credentials,
    endpoint: &Endpoint,
    operation: &Operation,
    timestamp: DateTime<Utc>,
) -> SignedHttpMessage {
    let functions = format!("/{API_VERSION}/functions");
    let (method, path, query, body) = match operation {
        Operation::Invoke(invocation) => (
            Method::POST,
            format!(
                "{functions}/{}/invocations",
                uri_encode(&invocation.function_name, true)
            ),
            match invocation.qualifier.as_deref() {
                Some(qualifier) if !qualifier.is_empty() => {
                    format!("Qualifier={}", uri_encode(qualifier, true))
                }
                _ => String::new(),
            },
            invocation.payload.clone(),
        ),
        Operation::ListFunctions => (
            Method::GET,
            format!("{functions}/"),
            String::new(),
            Bytes::new(),
        ),
        Operation::ListVersions { function_name } => (
            Method::GET,
            format!("{functions}/{}/versions", uri_encode(function_name, true)),
            String::new(),
            Bytes::new(),
        ),
    };

    let mut headers = Headers::new();
    headers.insert("host".into(), endpoint.host());
    headers.insert(AMZ_DATE.into(), signer::amz_date(timestamp));
    if let Operation::Invoke(invocation) = operation {
        headers.insert("content-type".into(), JSON_CONTENT_TYPE.into());
        headers.insert("content-length".into(), body.len().to_string());
        headers.insert(INVOCATION_TYPE.into(), invocation.mode.as_str().into());
    }

    let signing = SigningRequest {
        method: method.as_str(),
        uri_path: &path,
        query: &query,
        payload: &body,
        region: &endpoint.region,
        service: &endpoint.service,
        timestamp,
    };
    let headers = signer::sign(&signing, credentials, headers);

    SignedHttpMessage {
        method,
        path,
        query,
        headers,
        body,
    }
}
