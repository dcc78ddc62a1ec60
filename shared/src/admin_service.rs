use crate::http::{make_boxed_error_response, make_boxed_json_response};
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Request, Response, StatusCode};
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

/// Source of the health information exposed on the admin listener.
pub trait HealthProbe: Send + Sync + 'static {
    /// Whether the process is ready to accept work.
    fn is_ready(&self) -> bool;

    /// Free-form status document served on `/status`.
    fn status(&self) -> serde_json::Value;
}

/// Serves `/health`, `/ready` and `/status` for a [`HealthProbe`].
pub struct AdminService<P, E> {
    probe: Arc<P>,
    _error: PhantomData<fn() -> E>,
}

impl<P, E> AdminService<P, E>
where
    P: HealthProbe,
{
    pub fn new(probe: Arc<P>) -> Self {
        Self {
            probe,
            _error: PhantomData,
        }
    }

    fn respond(&self, path: &str) -> Response<BoxBody<Bytes, E>> {
        match path {
            "/health" => {
                make_boxed_json_response(StatusCode::OK, &serde_json::json!({"status": "ok"}))
            }
            "/ready" if self.probe.is_ready() => {
                make_boxed_json_response(StatusCode::OK, &serde_json::json!({"ready": true}))
            }
            "/ready" => make_boxed_error_response(StatusCode::SERVICE_UNAVAILABLE),
            "/status" => make_boxed_json_response(StatusCode::OK, &self.probe.status()),
            _ => make_boxed_error_response(StatusCode::NOT_FOUND),
        }
    }
}

impl<P, E> Service<Request<Incoming>> for AdminService<P, E>
where
    P: HealthProbe,
    E: Send + 'static,
{
    type Response = Response<BoxBody<Bytes, E>>;
    type Error = E;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let res = self.respond(req.uri().path());
        Box::pin(async move { Ok(res) })
    }
}
