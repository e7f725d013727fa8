//! Server-side HTTP middleware stages.
//!
//! # Responsibilities
//! - Ensure every incoming request has a correlation id, echoed on the
//!   response
//! - Build a per-call logger and log the terminal status with level chosen by
//!   status class (5xx → error, 4xx → warn, otherwise info)
//! - Continue an inbound trace from the request headers
//! - Record in-flight, count, and duration metrics per method and path
//!
//! # Design Decisions
//! - The status is read from the returned response; nothing needs to wrap a
//!   response writer to capture it after the fact
//! - Stages observe only; the inner service's response and error pass through
//!   unchanged

use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Instant;

use futures_util::future::BoxFuture;
use http::header::HeaderValue;
use http::{Request, Response};
use metrics::Label;
use opentelemetry::global::{self, BoxedTracer};
use opentelemetry::trace::{SpanKind, TraceContextExt, Tracer};
use opentelemetry::KeyValue;
use tower::{Layer, Service};
use tracing::{error, info, info_span, warn};

use crate::http::propagation::HeaderExtractor;
use crate::http::{status_class, Stage, REQUEST_ID_HEADER};
use crate::metrics::RequestMetrics;
use crate::scope::{CallScope, RequestId};

const SERVER_SPAN_NAME: &str = "http-server-request";

/// Configuration for [`ServerMiddleware`].
#[derive(Default)]
pub struct ServerMiddlewareConfig {
    /// Emit a structured log record per request, and attach a per-call logger
    /// to the request scope.
    pub logging: bool,
    /// Instruments to record per-request metrics on.
    pub metrics: Option<RequestMetrics>,
    /// Tracer used to continue or start traces.
    pub tracer: Option<BoxedTracer>,
}

/// Builds the server-side middleware chain for incoming HTTP requests.
pub struct ServerMiddleware {
    logging: bool,
    metrics: Option<RequestMetrics>,
    tracer: Option<Arc<BoxedTracer>>,
}

impl ServerMiddleware {
    pub fn new(config: ServerMiddlewareConfig) -> Self {
        Self {
            logging: config.logging,
            metrics: config.metrics,
            tracer: config.tracer.map(Arc::new),
        }
    }

    /// Compose the given stages, in order, around `inner`. The first stage in
    /// the list sees the request first. Stages without a configured
    /// collaborator are skipped.
    pub fn pipeline<S, ReqB, ResB>(
        &self,
        stages: &[Stage],
        inner: S,
    ) -> tower::util::BoxCloneService<Request<ReqB>, Response<ResB>, S::Error>
    where
        S: Service<Request<ReqB>, Response = Response<ResB>> + Clone + Send + 'static,
        S::Future: Send + 'static,
        S::Error: Send + 'static,
        ReqB: Send + 'static,
        ResB: Send + 'static,
    {
        let tracing = self.tracer.clone().map(TracingLayer::new);
        let metrics = self.metrics.map(MetricsLayer::new);
        crate::http::compose(
            stages,
            &RequestIdLayer,
            self.logging.then_some(&LoggingLayer),
            tracing.as_ref(),
            metrics.as_ref(),
            inner,
        )
    }
}

/// Ensures incoming requests carry a correlation id.
///
/// The id is read from the `Request-Id` header or generated, attached to the
/// request scope and headers, and echoed on the response.
#[derive(Clone, Copy, Debug, Default)]
pub struct RequestIdLayer;

impl<S> Layer<S> for RequestIdLayer {
    type Service = RequestIdService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestIdService { inner }
    }
}

#[derive(Clone, Debug)]
pub struct RequestIdService<S> {
    inner: S,
}

impl<S, ReqB, ResB> Service<Request<ReqB>> for RequestIdService<S>
where
    S: Service<Request<ReqB>, Response = Response<ResB>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqB: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<S::Response, S::Error>>;

    fn poll_ready(&mut self, cx: &mut TaskContext<'_>) -> Poll<Result<(), S::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<ReqB>) -> Self::Future {
        let request_id = req
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .filter(|id| !id.is_empty())
            .map(RequestId::from)
            .unwrap_or_default();

        let header_value = HeaderValue::from_str(request_id.as_str()).ok();
        if let Some(value) = &header_value {
            req.headers_mut().insert(REQUEST_ID_HEADER, value.clone());
        }
        req.extensions_mut().insert(CallScope::new(request_id));

        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        Box::pin(async move {
            let mut res = inner.call(req).await?;
            if let Some(value) = header_value {
                res.headers_mut().insert(REQUEST_ID_HEADER, value);
            }
            Ok(res)
        })
    }
}

/// Logs one structured record per request, at a level picked from the status
/// class, inside a per-call logger span attached to the request scope.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingLayer;

impl<S> Layer<S> for LoggingLayer {
    type Service = LoggingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LoggingService { inner }
    }
}

#[derive(Clone, Debug)]
pub struct LoggingService<S> {
    inner: S,
}

impl<S, ReqB, ResB> Service<Request<ReqB>> for LoggingService<S>
where
    S: Service<Request<ReqB>, Response = Response<ResB>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqB: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<S::Response, S::Error>>;

    fn poll_ready(&mut self, cx: &mut TaskContext<'_>) -> Poll<Result<(), S::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<ReqB>) -> Self::Future {
        let proto = format!("{:?}", req.version());
        let method = req.method().to_string();
        let url = req.uri().path().to_string();

        let logger = info_span!(
            "http_server_request",
            http.kind = "server",
            req.proto = %proto,
            req.method = %method,
            req.url = %url,
            requestId = tracing::field::Empty,
        );
        if let Some(scope) = req.extensions().get::<CallScope>().cloned() {
            logger.record("requestId", tracing::field::display(scope.request_id()));
            req.extensions_mut().insert(scope.with_logger(logger.clone()));
        }

        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        Box::pin(async move {
            let start = Instant::now();
            let result = inner.call(req).await;
            let duration = start.elapsed().as_secs_f64();

            if let Ok(res) = &result {
                let status_code = res.status().as_u16();
                let class = status_class(status_code);
                match status_code {
                    s if s >= 500 => error!(
                        parent: &logger,
                        res.statusCode = status_code,
                        res.statusClass = %class,
                        responseTime = duration,
                        "{} {} {} {:.6}", method, url, status_code, duration,
                    ),
                    s if s >= 400 => warn!(
                        parent: &logger,
                        res.statusCode = status_code,
                        res.statusClass = %class,
                        responseTime = duration,
                        "{} {} {} {:.6}", method, url, status_code, duration,
                    ),
                    _ => info!(
                        parent: &logger,
                        res.statusCode = status_code,
                        res.statusClass = %class,
                        responseTime = duration,
                        "{} {} {} {:.6}", method, url, status_code, duration,
                    ),
                }
            }

            result
        })
    }
}

/// Continues an inbound trace: extracts the parent context from the request
/// headers, starts a server span, and tags it with the request outcome.
#[derive(Clone)]
pub struct TracingLayer {
    tracer: Arc<BoxedTracer>,
}

impl TracingLayer {
    pub fn new(tracer: Arc<BoxedTracer>) -> Self {
        Self { tracer }
    }
}

impl<S> Layer<S> for TracingLayer {
    type Service = TracingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TracingService {
            inner,
            tracer: self.tracer.clone(),
        }
    }
}

#[derive(Clone)]
pub struct TracingService<S> {
    inner: S,
    tracer: Arc<BoxedTracer>,
}

impl<S, ReqB, ResB> Service<Request<ReqB>> for TracingService<S>
where
    S: Service<Request<ReqB>, Response = Response<ResB>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqB: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<S::Response, S::Error>>;

    fn poll_ready(&mut self, cx: &mut TaskContext<'_>) -> Poll<Result<(), S::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<ReqB>) -> Self::Future {
        let proto = format!("{:?}", req.version());
        let method = req.method().to_string();
        let url = req.uri().path().to_string();

        // Extraction failure yields an invalid remote context, which starts a
        // new root span; the request is never failed over it.
        let parent_cx = global::get_text_map_propagator(|propagator| {
            propagator.extract(&HeaderExtractor(req.headers()))
        });
        let span = self
            .tracer
            .span_builder(SERVER_SPAN_NAME)
            .with_kind(SpanKind::Server)
            .start_with_context(self.tracer.as_ref(), &parent_cx);
        let cx = parent_cx.with_span(span);

        if let Some(scope) = req.extensions().get::<CallScope>().cloned() {
            req.extensions_mut().insert(scope.with_trace_cx(cx.clone()));
        }

        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        Box::pin(async move {
            let result = inner.call(req).await;

            let span = cx.span();
            span.set_attribute(KeyValue::new("http.proto", proto));
            span.set_attribute(KeyValue::new("http.method", method));
            span.set_attribute(KeyValue::new("http.url", url));
            if let Ok(res) = &result {
                span.set_attribute(KeyValue::new(
                    "http.status_code",
                    i64::from(res.status().as_u16()),
                ));
            }
            span.end();

            result
        })
    }
}

/// Records the in-flight gauge and, once the response is known, the counter
/// and duration series labeled by method, path, and status.
#[derive(Clone, Copy)]
pub struct MetricsLayer {
    metrics: RequestMetrics,
}

impl MetricsLayer {
    pub fn new(metrics: RequestMetrics) -> Self {
        Self { metrics }
    }
}

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService {
            inner,
            metrics: self.metrics,
        }
    }
}

#[derive(Clone)]
pub struct MetricsService<S> {
    inner: S,
    metrics: RequestMetrics,
}

impl<S, ReqB, ResB> Service<Request<ReqB>> for MetricsService<S>
where
    S: Service<Request<ReqB>, Response = Response<ResB>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqB: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<S::Response, S::Error>>;

    fn poll_ready(&mut self, cx: &mut TaskContext<'_>) -> Poll<Result<(), S::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqB>) -> Self::Future {
        let labels = vec![
            Label::new("method", req.method().to_string()),
            Label::new("url", req.uri().path().to_string()),
        ];
        let metrics = self.metrics;
        metrics.in_flight_inc(labels.clone());

        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        Box::pin(async move {
            let start = Instant::now();
            let result = inner.call(req).await;
            let duration = start.elapsed().as_secs_f64();

            // The gauge balances on every exit path; the terminal instruments
            // need a status and are skipped when the service itself failed.
            metrics.in_flight_dec(labels.clone());
            if let Ok(res) = &result {
                let status_code = res.status().as_u16();
                let mut labels = labels;
                labels.push(Label::new("statusCode", status_code.to_string()));
                labels.push(Label::new("statusClass", status_class(status_code)));
                metrics.observe(labels, duration);
            }

            result
        })
    }
}
