//! The fan-out launch: build every slot's request, connect every slot, send
//! all requests back to back, then drain one response per connection.

use crate::config::{Credentials, LaunchSettings, ResponsePolicy, TransportKind};
use crate::connect::{Orchestrator, SlotId, Target};
use crate::error::{ConnectError, LaunchError};
use crate::metrics_defs::{LAUNCH_DURATION, RESPONSES_UNSUCCESSFUL, SEND_DURATION};
use crate::payload;
use crate::request::{Endpoint, Invocation, InvocationMode, Operation, build_request_now};
use crate::transport::{TcpTransport, TlsTransport, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use shared::{counter, histogram};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::oneshot;
use tokio::task::JoinSet;

/// Set by the function service when the invoked function itself failed,
/// even though the HTTP status is a success.
pub const FUNCTION_ERROR: &str = "x-amz-function-error";

/// One fan-out: `launches` invocations of `function_name` in each region.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchRequest {
    pub launches: usize,
    pub function_name: String,
    pub credentials: Credentials,
    /// May contain [`payload::ID_PLACEHOLDER`].
    pub payload: String,
    pub qualifier: Option<String>,
    pub mode: InvocationMode,
    /// Empty means the launcher's default regions.
    pub regions: Vec<String>,
}

impl LaunchRequest {
    /// A fire-and-forget launch in the default regions.
    pub fn new(
        function_name: impl Into<String>,
        credentials: Credentials,
        payload: impl Into<String>,
        launches: usize,
    ) -> Self {
        LaunchRequest {
            launches,
            function_name: function_name.into(),
            credentials,
            payload: payload.into(),
            qualifier: None,
            mode: InvocationMode::Event,
            regions: Vec::new(),
        }
    }

    pub fn with_regions(mut self, regions: Vec<String>) -> Self {
        self.regions = regions;
        self
    }
}

#[derive(Debug, Clone)]
pub enum SlotOutcome {
    /// The slot never got a connection and nothing was sent.
    ConnectFailed(ConnectError),
    /// The request was sent but no complete response came back.
    RequestFailed(String),
    Completed {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    },
}

impl SlotOutcome {
    pub fn is_sent(&self) -> bool {
        !matches!(self, SlotOutcome::ConnectFailed(_))
    }

    pub fn function_error(&self) -> Option<&str> {
        match self {
            SlotOutcome::Completed { headers, .. } => {
                headers.get(FUNCTION_ERROR).and_then(|v| v.to_str().ok())
            }
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        match self {
            SlotOutcome::Completed { status, .. } => {
                status.is_success() && self.function_error().is_none()
            }
            _ => false,
        }
    }

    fn failure_reason(&self) -> String {
        match self {
            SlotOutcome::ConnectFailed(e) => e.to_string(),
            SlotOutcome::RequestFailed(reason) => reason.clone(),
            SlotOutcome::Completed { status, .. } => match self.function_error() {
                Some(kind) => format!("status {status}, function error {kind}"),
                None => format!("status {status}"),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct SlotReport {
    pub slot: SlotId,
    pub outcome: SlotOutcome,
}

#[derive(Debug, Clone, Default)]
pub struct LaunchReport {
    /// One entry per slot, ordered by slot.
    pub slots: Vec<SlotReport>,
    pub send_duration: Duration,
}

impl LaunchReport {
    /// Slots that were connected and sent.
    pub fn sent(&self) -> usize {
        self.slots.iter().filter(|s| s.outcome.is_sent()).count()
    }

    pub fn connect_failed(&self) -> usize {
        self.slots.len() - self.sent()
    }

    pub fn succeeded(&self) -> usize {
        self.slots.iter().filter(|s| s.outcome.is_success()).count()
    }

    /// Sent slots without a successful response.
    pub fn unsuccessful(&self) -> usize {
        self.sent() - self.succeeded()
    }
}

/// Something that can run a fan-out launch.
#[async_trait]
pub trait Launch: Send + Sync {
    async fn launch(&self, request: &LaunchRequest) -> Result<LaunchReport, LaunchError>;
}

pub struct Launcher<T> {
    orchestrator: Orchestrator<T>,
    settings: LaunchSettings,
}

impl<T: Transport> Launcher<T> {
    pub fn new(transport: T, settings: LaunchSettings) -> Self {
        Launcher {
            orchestrator: Orchestrator::new(transport, settings.connect_timeout()),
            settings,
        }
    }

    pub fn settings(&self) -> &LaunchSettings {
        &self.settings
    }

    fn endpoint(&self, region: &str) -> Endpoint {
        Endpoint::new(&self.settings.service, region, &self.settings.domain)
    }

    fn target(&self, endpoint: &Endpoint) -> Target {
        Target {
            server_name: endpoint.host(),
            port: self.settings.port,
            connect_to: self.settings.connect_to,
        }
    }

    pub async fn fan_out(&self, request: &LaunchRequest) -> Result<LaunchReport, LaunchError> {
        if request.launches == 0 {
            return Err(LaunchError::NoLaunches);
        }
        let regions = if request.regions.is_empty() {
            &self.settings.default_regions
        } else {
            &request.regions
        };
        if regions.is_empty() {
            return Err(LaunchError::NoRegions);
        }

        let launches = request.launches;
        let too_many = LaunchError::TooManyLaunches {
            requested: launches,
            max: self.settings.max_launches,
        };
        if launches > self.settings.max_launches {
            return Err(too_many);
        }
        let total = regions.len().checked_mul(launches).ok_or(too_many)?;

        let started = Instant::now();
        let endpoints: Vec<Endpoint> = regions.iter().map(|region| self.endpoint(region)).collect();

        // Every request is signed up front so its timestamp reflects build time.
        let mut requests = Vec::with_capacity(total);
        for (region_index, endpoint) in endpoints.iter().enumerate() {
            for launch_index in 0..launches {
                let operation = Operation::Invoke(Invocation {
                    function_name: request.function_name.clone(),
                    payload: Bytes::from(payload::render(
                        &request.payload,
                        region_index,
                        launches,
                        launch_index,
                    )),
                    qualifier: request.qualifier.clone(),
                    mode: request.mode,
                });
                let message = build_request_now(&request.credentials, endpoint, &operation);
                requests.push(message.to_request()?);
            }
        }
        tracing::info!(
            function = %request.function_name,
            regions = endpoints.len(),
            launches,
            "requests built"
        );

        let targets: Vec<Target> = endpoints.iter().map(|e| self.target(e)).collect();
        let connections = self.orchestrator.connect_all(&targets, launches).await;

        let send_started = Instant::now();
        let mut slots = Vec::with_capacity(connections.len());
        let mut in_flight = JoinSet::new();
        let mut flushes = Vec::with_capacity(connections.len());
        for (connection, http_request) in connections.into_iter().zip(requests) {
            let slot = connection.slot;
            match connection.state {
                Err(e) => slots.push(SlotReport {
                    slot,
                    outcome: SlotOutcome::ConnectFailed(e),
                }),
                Ok(stream) => match dispatch(stream, http_request).await {
                    Ok((response, flushed)) => {
                        flushes.push(flushed);
                        in_flight.spawn(async move {
                            SlotReport {
                                slot,
                                outcome: response.await,
                            }
                        });
                    }
                    Err(reason) => slots.push(SlotReport {
                        slot,
                        outcome: SlotOutcome::RequestFailed(reason),
                    }),
                },
            }
        }
        // The connection tasks do the writing; the send phase ends once every
        // request has been flushed or its connection has gone away.
        for flushed in flushes {
            let _ = flushed.await;
        }
        let send_duration = send_started.elapsed();
        histogram!(SEND_DURATION).record(send_duration.as_secs_f64());
        tracing::info!(
            sent = in_flight.len(),
            elapsed_ms = send_duration.as_millis() as u64,
            "requests sent"
        );

        while let Some(joined) = in_flight.join_next().await {
            match joined {
                Ok(report) => slots.push(report),
                Err(e) => tracing::error!("response task panicked: {}", e),
            }
        }
        slots.sort_by_key(|report| report.slot);

        let report = LaunchReport {
            slots,
            send_duration,
        };
        counter!(RESPONSES_UNSUCCESSFUL).increment(report.unsuccessful() as u64);
        histogram!(LAUNCH_DURATION).record(started.elapsed().as_secs_f64());
        tracing::info!(
            sent = report.sent(),
            connect_failed = report.connect_failed(),
            succeeded = report.succeeded(),
            unsuccessful = report.unsuccessful(),
            "launch complete"
        );

        if self.settings.response_policy == ResponsePolicy::Strict
            && let Some(failed) = report
                .slots
                .iter()
                .find(|s| s.outcome.is_sent() && !s.outcome.is_success())
        {
            return Err(LaunchError::Rejected {
                slot: failed.slot,
                reason: failed.outcome.failure_reason(),
            });
        }

        Ok(report)
    }

    /// Sends a single signed request to `region` and returns its response.
    pub async fn request(
        &self,
        region: &str,
        credentials: &Credentials,
        operation: &Operation,
    ) -> Result<Response<Bytes>, LaunchError> {
        let endpoint = self.endpoint(region);
        let http_request = build_request_now(credentials, &endpoint, operation).to_request()?;
        let target = self.target(&endpoint);

        let connection = self
            .orchestrator
            .connect_all(std::slice::from_ref(&target), 1)
            .await
            .into_iter()
            .next()
            .ok_or_else(|| LaunchError::Request("no connection slot".into()))?;
        let stream = connection.state?;

        let (response, _flushed) = dispatch(stream, http_request)
            .await
            .map_err(LaunchError::Request)?;
        match response.await {
            SlotOutcome::Completed {
                status,
                headers,
                body,
            } => {
                tracing::debug!(operation = operation.name(), %status, "response received");
                let mut response = Response::new(body);
                *response.status_mut() = status;
                *response.headers_mut() = headers;
                Ok(response)
            }
            other => Err(LaunchError::Request(other.failure_reason())),
        }
    }
}

#[async_trait]
impl<T: Transport> Launch for Launcher<T> {
    async fn launch(&self, request: &LaunchRequest) -> Result<LaunchReport, LaunchError> {
        self.fan_out(request).await
    }
}

/// Starts an HTTP/1.1 exchange on `stream`. Hands back a future that
/// resolves once the single response has been read, and a receiver that
/// fires once the request has been flushed to the socket. The connection
/// closes when the response future completes.
async fn dispatch<S>(
    stream: S,
    request: Request<Full<Bytes>>,
) -> Result<(impl Future<Output = SlotOutcome> + Send + 'static, oneshot::Receiver<()>), String>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (stream, flushed) = FlushNotify::new(stream);
    let (mut sender, connection) = http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| format!("http handshake: {e}"))?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::debug!(error = %e, "connection closed with error");
        }
    });

    let response = sender.send_request(request);
    let outcome = async move {
        let outcome = match response.await {
            Ok(response) => read_response(response).await,
            Err(e) => SlotOutcome::RequestFailed(e.to_string()),
        };
        drop(sender);
        outcome
    };
    Ok((outcome, flushed))
}

/// Stream wrapper that reports the first flush following a write.
struct FlushNotify<S> {
    inner: S,
    written: bool,
    on_flush: Option<oneshot::Sender<()>>,
}

impl<S> FlushNotify<S> {
    fn new(inner: S) -> (Self, oneshot::Receiver<()>) {
        let (on_flush, flushed) = oneshot::channel();
        let stream = FlushNotify {
            inner,
            written: false,
            on_flush: Some(on_flush),
        };
        (stream, flushed)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for FlushNotify<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for FlushNotify<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(written)) = &poll {
            this.written |= *written > 0;
        }
        poll
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_write_vectored(cx, bufs);
        if let Poll::Ready(Ok(written)) = &poll {
            this.written |= *written > 0;
        }
        poll
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_flush(cx);
        if poll.is_ready()
            && this.written
            && let Some(on_flush) = this.on_flush.take()
        {
            let _ = on_flush.send(());
        }
        poll
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

async fn read_response(response: Response<Incoming>) -> SlotOutcome {
    let (parts, body) = response.into_parts();
    match body.collect().await {
        Ok(collected) => SlotOutcome::Completed {
            status: parts.status,
            headers: parts.headers,
            body: collected.to_bytes(),
        },
        Err(e) => SlotOutcome::RequestFailed(format!("reading body: {e}")),
    }
}

/// Builds the launcher the settings ask for.
pub fn launcher_from_settings(settings: &LaunchSettings) -> Result<Arc<dyn Launch>, LaunchError> {
    Ok(match settings.transport {
        TransportKind::Tls => Arc::new(Launcher::new(TlsTransport::new()?, settings.clone())),
        TransportKind::Tcp => Arc::new(Launcher::new(TcpTransport, settings.clone())),
    })
}

/// Sends one signed request with the transport the settings ask for.
pub async fn request_once(
    settings: &LaunchSettings,
    region: &str,
    credentials: &Credentials,
    operation: &Operation,
) -> Result<Response<Bytes>, LaunchError> {
    match settings.transport {
        TransportKind::Tls => {
            Launcher::new(TlsTransport::new()?, settings.clone())
                .request(region, credentials, operation)
                .await
        }
        TransportKind::Tcp => {
            Launcher::new(TcpTransport, settings.clone())
                .request(region, credentials, operation)
                .await
        }
    }
}

/// Runs a launch to completion on the calling thread.
///
/// All sockets are driven by a single-threaded runtime created for the call.
/// Must not be called from inside an async runtime; use [`Launch::launch`]
/// there instead.
pub fn launchpar(
    settings: &LaunchSettings,
    request: &LaunchRequest,
) -> Result<LaunchReport, LaunchError> {
    if tokio::runtime::Handle::try_current().is_ok() {
        return Err(LaunchError::Runtime(std::io::Error::other(
            "launchpar called from inside an async runtime",
        )));
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(LaunchError::Runtime)?;
    let launcher = launcher_from_settings(settings)?;
    runtime.block_on(launcher.launch(request))
}
