use crate::errors::BatcherError;
use crate::queue::{BatchQueue, LaunchBatch};
use http_body_util::BodyExt;
use http_body_util::combinators::BoxBody;
use hyper::body::{Body, Bytes, Incoming};
use hyper::service::Service;
use hyper::{Method, Request, Response, StatusCode};
use shared::http::{make_boxed_error_response, make_boxed_json_response};
use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;

pub const LAUNCH_PATH: &str = "/launch";

/// Accepts launch batches and acknowledges them as soon as they are queued.
pub struct BatcherService {
    queue: BatchQueue,
    max_launches: usize,
}

impl BatcherService {
    pub fn new(queue: BatchQueue, max_launches: usize) -> Self {
        BatcherService {
            queue,
            max_launches,
        }
    }
}

pub(crate) async fn handle<B>(
    queue: BatchQueue,
    max_launches: usize,
    req: Request<B>,
) -> Response<BoxBody<Bytes, BatcherError>>
where
    B: Body,
    B::Error: Display,
{
    if req.uri().path() != LAUNCH_PATH {
        return make_boxed_error_response(StatusCode::NOT_FOUND);
    }
    if req.method() != Method::POST {
        return make_boxed_error_response(StatusCode::METHOD_NOT_ALLOWED);
    }

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            tracing::warn!(error = %e, "failed to read request body");
            return make_boxed_error_response(StatusCode::BAD_REQUEST);
        }
    };

    let batch: LaunchBatch = match serde_json::from_slice(&body) {
        Ok(batch) => batch,
        Err(e) => {
            tracing::debug!(error = %e, "rejecting malformed batch");
            return make_boxed_error_response(StatusCode::BAD_REQUEST);
        }
    };
    if let Err(e) = batch.validate(max_launches) {
        tracing::debug!(error = %e, "rejecting invalid batch");
        return make_boxed_error_response(StatusCode::BAD_REQUEST);
    }

    let function = batch.function_name.clone();
    let launches = batch.launches;
    match queue.enqueue(batch) {
        Ok(()) => {
            tracing::debug!(%function, launches, "batch queued");
            let queued = serde_json::json!({"status": "queued"});
            make_boxed_json_response(StatusCode::ACCEPTED, &queued)
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to queue batch");
            make_boxed_error_response(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

impl Service<Request<Incoming>> for BatcherService {
    type Response = Response<BoxBody<Bytes, BatcherError>>;
    type Error = BatcherError;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let queue = self.queue.clone();
        let max_launches = self.max_launches;
        Box::pin(async move { Ok(handle(queue, max_launches, req).await) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::batch_queue;
    use http_body_util::Full;

    const BATCH: &str = r###"{
        "launches": 3,
        "function_name": "demo",
        "access_key_id": "AKIDEXAMPLE",
        "secret": "secret",
        "payload": "{\"id\":\"##ID##\"}",
        "regions": ["us-east-1"]
    }"###;

    const MAX_LAUNCHES: usize = 10_000;

    fn post(path: &str, body: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(Method::POST)
            .uri(path)
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap()
    }

    async fn body_string(response: Response<BoxBody<Bytes, BatcherError>>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn queues_valid_batch() {
        let (queue, mut receiver) = batch_queue();
        let response = handle(queue, MAX_LAUNCHES, post("/launch", BATCH)).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(body_string(response).await, r#"{"status":"queued"}"#);

        let drained = receiver.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].batch.launches, 3);
        assert_eq!(drained[0].batch.payload, r###"{"id":"##ID##"}"###);
    }

    #[tokio::test]
    async fn rejects_bad_requests() {
        let (queue, mut receiver) = batch_queue();

        let response = handle(queue.clone(), MAX_LAUNCHES, post("/launch", "not json")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let zero = BATCH.replace("\"launches\": 3", "\"launches\": 0");
        let response = handle(queue.clone(), MAX_LAUNCHES, post("/launch", &zero)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let no_regions = BATCH.replace("[\"us-east-1\"]", "[]");
        let response = handle(queue.clone(), MAX_LAUNCHES, post("/launch", &no_regions)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let huge = BATCH.replace("\"launches\": 3", "\"launches\": 18446744073709551615");
        let response = handle(queue.clone(), MAX_LAUNCHES, post("/launch", &huge)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let over = BATCH.replace("\"launches\": 3", "\"launches\": 10001");
        let response = handle(queue.clone(), MAX_LAUNCHES, post("/launch", &over)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = handle(queue.clone(), MAX_LAUNCHES, post("/other", BATCH)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let get = Request::builder()
            .uri("/launch")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = handle(queue, MAX_LAUNCHES, get).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

        assert!(receiver.drain().is_empty());
    }

    #[tokio::test]
    async fn unavailable_when_consumer_is_gone() {
        let (queue, receiver) = batch_queue();
        drop(receiver);
        let response = handle(queue, MAX_LAUNCHES, post("/launch", BATCH)).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
