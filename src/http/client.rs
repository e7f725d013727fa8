//! Client-side HTTP middleware stages.
//!
//! # Responsibilities
//! - Propagate the caller's correlation id on outgoing requests, generating
//!   one when the caller has none
//! - Log the terminal status of each outgoing request
//! - Start a child (or root) span and inject it into the request headers
//! - Record in-flight, count, and duration metrics per method and path
//!
//! # Design Decisions
//! - A transport failure has no HTTP status; it is recorded with status code
//!   `-1` and an empty status class, and logged at info level since no status
//!   class applies
//! - The `Request-Id` header is appended rather than replaced, preserving any
//!   value a caller set directly on the request

use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Instant;

use futures_util::future::BoxFuture;
use http::header::HeaderValue;
use http::{Request, Response};
use metrics::Label;
use opentelemetry::global::{self, BoxedTracer};
use opentelemetry::trace::{SpanKind, TraceContextExt, Tracer};
use opentelemetry::{Context, KeyValue};
use tower::{Layer, Service};
use tracing::{error, info, warn};

use crate::http::propagation::HeaderInjector;
use crate::http::{status_class, Stage, REQUEST_ID_HEADER};
use crate::metrics::RequestMetrics;
use crate::scope::{CallScope, RequestId};

const CLIENT_SPAN_NAME: &str = "http-client-request";

/// Configuration for [`ClientMiddleware`].
#[derive(Default)]
pub struct ClientMiddlewareConfig {
    /// Emit a structured log record per request.
    pub logging: bool,
    /// Instruments to record per-request metrics on.
    pub metrics: Option<RequestMetrics>,
    /// Tracer used to start and propagate spans.
    pub tracer: Option<BoxedTracer>,
}

/// Builds the client-side middleware chain for outgoing HTTP requests.
pub struct ClientMiddleware {
    logging: bool,
    metrics: Option<RequestMetrics>,
    tracer: Option<Arc<BoxedTracer>>,
}

impl ClientMiddleware {
    pub fn new(config: ClientMiddlewareConfig) -> Self {
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

/// Puts the caller's correlation id on outgoing requests.
///
/// The id comes from the scope on the request extensions, then from an
/// already-set `Request-Id` header, and is generated as a last resort.
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
        let from_scope = req
            .extensions()
            .get::<CallScope>()
            .map(|scope| scope.request_id().clone())
            .filter(|id| !id.as_str().is_empty());
        let from_header = req
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .filter(|id| !id.is_empty())
            .map(RequestId::from);

        let request_id = from_scope.or(from_header).unwrap_or_default();

        if let Ok(value) = HeaderValue::from_str(request_id.as_str()) {
            req.headers_mut().append(REQUEST_ID_HEADER, value);
        }
        if req.extensions().get::<CallScope>().is_none() {
            req.extensions_mut().insert(CallScope::new(request_id));
        }

        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        Box::pin(async move { inner.call(req).await })
    }
}

/// Logs one structured record per outgoing request, at a level picked from
/// the response status class.
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

    fn call(&mut self, req: Request<ReqB>) -> Self::Future {
        let proto = format!("{:?}", req.version());
        let method = req.method().to_string();
        let url = req.uri().path().to_string();
        let request_id = req
            .extensions()
            .get::<CallScope>()
            .map(|scope| scope.request_id().to_string());

        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        Box::pin(async move {
            let start = Instant::now();
            let result = inner.call(req).await;
            let duration = start.elapsed().as_secs_f64();

            let (status_code, class): (i64, String) = match &result {
                Ok(res) => {
                    let code = res.status().as_u16();
                    (i64::from(code), status_class(code))
                }
                Err(_) => (-1, String::new()),
            };
            let request_id = request_id.as_deref();
            match status_code {
                s if s >= 500 => error!(
                    http.kind = "client",
                    req.proto = %proto,
                    req.method = %method,
                    req.url = %url,
                    res.statusCode = status_code,
                    res.statusClass = %class,
                    responseTime = duration,
                    requestId = request_id,
                    "{} {} {} {:.6}", method, url, status_code, duration,
                ),
                s if s >= 400 => warn!(
                    http.kind = "client",
                    req.proto = %proto,
                    req.method = %method,
                    req.url = %url,
                    res.statusCode = status_code,
                    res.statusClass = %class,
                    responseTime = duration,
                    requestId = request_id,
                    "{} {} {} {:.6}", method, url, status_code, duration,
                ),
                _ => info!(
                    http.kind = "client",
                    req.proto = %proto,
                    req.method = %method,
                    req.url = %url,
                    res.statusCode = status_code,
                    res.statusClass = %class,
                    responseTime = duration,
                    requestId = request_id,
                    "{} {} {} {:.6}", method, url, status_code, duration,
                ),
            }

            result
        })
    }
}

/// Starts a client span for each outgoing request and injects its context
/// into the request headers.
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

        // The span parents on the caller's scope when one is attached,
        // becoming a root span otherwise.
        let parent_cx = req
            .extensions()
            .get::<CallScope>()
            .map(|scope| scope.trace_cx().clone())
            .unwrap_or_else(Context::new);
        let span = self
            .tracer
            .span_builder(CLIENT_SPAN_NAME)
            .with_kind(SpanKind::Client)
            .start_with_context(self.tracer.as_ref(), &parent_cx);
        let cx = parent_cx.with_span(span);

        let mut injector = HeaderInjector::new(req.headers_mut());
        global::get_text_map_propagator(|propagator| {
            propagator.inject_context(&cx, &mut injector)
        });
        if injector.dropped() {
            // Non-fatal: the request proceeds with partial trace headers.
            cx.span()
                .add_event("trace injection dropped header entries", vec![]);
        }

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
            let status_code = match &result {
                Ok(res) => i64::from(res.status().as_u16()),
                Err(_) => -1,
            };
            span.set_attribute(KeyValue::new("http.status_code", status_code));
            span.end();

            result
        })
    }
}

/// Records the in-flight gauge and, once the outcome is known, the counter
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

            metrics.in_flight_dec(labels.clone());
            let (status_code, class) = match &result {
                Ok(res) => {
                    let code = res.status().as_u16();
                    (code.to_string(), status_class(code))
                }
                Err(_) => ("-1".to_string(), String::new()),
            };
            let mut labels = labels;
            labels.push(Label::new("statusCode", status_code));
            labels.push(Label::new("statusClass", class));
            metrics.observe(labels, duration);

            result
        })
    }
}
