//! Server-side gRPC interceptor.
//!
//! # Responsibilities
//! - Extract or generate the correlation id for incoming calls
//! - Build a per-call logger enriched with call metadata
//! - Continue an inbound trace (or start a new one) and record the outcome
//!
//! # Design Decisions
//! - The enriched scope is attached to the request extensions so handlers can
//!   read it; for streaming calls the inbound stream is wrapped so the scope
//!   travels with it
//! - Extraction failure starts a root span instead of failing the call
//! - The handler's result is returned unchanged

use std::future::Future;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use std::time::Instant;

use futures_util::Stream;
use metrics::Label;
use opentelemetry::global::{self, BoxedTracer};
use opentelemetry::trace::{SpanKind, Status as SpanStatus, TraceContextExt, Tracer};
use opentelemetry::KeyValue;
use tonic::{Request, Response, Status};
use tracing::{error, info, info_span};

use crate::grpc::propagation::MetadataExtractor;
use crate::grpc::{MethodDescriptor, REQUEST_ID_KEY};
use crate::metrics::RequestMetrics;
use crate::scope::{CallScope, RequestId};

const SERVER_SPAN_NAME: &str = "grpc-server-request";
const SERVER_KIND: &str = "server";

/// Configuration for [`ServerInterceptor`].
#[derive(Default)]
pub struct ServerInterceptorConfig {
    /// Emit a structured log record per call, and attach a per-call logger to
    /// the request scope.
    pub logging: bool,
    /// Instruments to record per-call metrics on.
    pub metrics: Option<RequestMetrics>,
    /// Tracer used to continue or start traces.
    pub tracer: Option<BoxedTracer>,
}

/// Intercepts incoming unary and streaming gRPC calls for logging, metrics,
/// and tracing.
pub struct ServerInterceptor {
    logging: bool,
    metrics: Option<RequestMetrics>,
    tracer: Option<BoxedTracer>,
}

impl ServerInterceptor {
    pub fn new(config: ServerInterceptorConfig) -> Self {
        Self {
            logging: config.logging,
            metrics: config.metrics,
            tracer: config.tracer,
        }
    }

    /// The correlation id from incoming metadata, or a fresh one.
    fn request_id<T>(request: &Request<T>) -> RequestId {
        request
            .metadata()
            .get(REQUEST_ID_KEY)
            .and_then(|value| value.to_str().ok())
            .filter(|id| !id.is_empty())
            .map(RequestId::from)
            .unwrap_or_default()
    }

    /// Build the per-call scope: id, logger, trace context.
    fn call_scope<T>(
        &self,
        request: &Request<T>,
        descriptor: &MethodDescriptor,
        stream: bool,
    ) -> CallScope {
        let request_id = Self::request_id(request);
        let mut scope = CallScope::new(request_id);

        if self.logging {
            let logger = info_span!(
                "grpc_server_request",
                requestId = %scope.request_id(),
                grpc.kind = SERVER_KIND,
                grpc.package = %descriptor.package,
                grpc.service = %descriptor.service,
                grpc.method = %descriptor.method,
                grpc.stream = if stream { "true" } else { "false" },
            );
            scope = scope.with_logger(logger);
        }

        if let Some(tracer) = &self.tracer {
            // An unparseable or absent trace context yields an invalid remote
            // span, which makes this a root span. Never fails the call.
            let parent_cx = global::get_text_map_propagator(|propagator| {
                propagator.extract(&MetadataExtractor(request.metadata()))
            });
            let span = tracer
                .span_builder(SERVER_SPAN_NAME)
                .with_kind(SpanKind::Server)
                .start_with_context(tracer, &parent_cx);
            scope = scope.with_trace_cx(parent_cx.with_span(span));
        }

        scope
    }

    /// Record the outcome of a handled call in logs, metrics, and span tags.
    fn record_outcome(
        &self,
        scope: &CallScope,
        descriptor: &MethodDescriptor,
        stream: bool,
        labels: Vec<Label>,
        duration: f64,
        error_message: Option<&str>,
    ) {
        let success = error_message.is_none();

        if self.logging {
            let logger = scope.logger();
            match error_message {
                None => info!(
                    parent: logger,
                    grpc.success = success,
                    responseTime = duration,
                    "{} {}.{}.{} {:.6}",
                    SERVER_KIND,
                    descriptor.package,
                    descriptor.service,
                    descriptor.method,
                    duration,
                ),
                Some(message) => error!(
                    parent: logger,
                    grpc.success = success,
                    responseTime = duration,
                    grpc.error = message,
                    "{} {}.{}.{} {:.6}",
                    SERVER_KIND,
                    descriptor.package,
                    descriptor.service,
                    descriptor.method,
                    duration,
                ),
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.in_flight_dec(labels.clone());
            let mut labels = labels;
            labels.push(Label::new("success", if success { "true" } else { "false" }));
            metrics.observe(labels, duration);
        }

        if self.tracer.is_some() {
            let span = scope.trace_cx().span();
            span.set_attribute(KeyValue::new("grpc.package", descriptor.package.clone()));
            span.set_attribute(KeyValue::new("grpc.service", descriptor.service.clone()));
            span.set_attribute(KeyValue::new("grpc.method", descriptor.method.clone()));
            span.set_attribute(KeyValue::new("grpc.stream", stream));
            span.set_attribute(KeyValue::new("grpc.success", success));
            if let Some(message) = error_message {
                span.set_attribute(KeyValue::new("error", true));
                span.add_event(
                    "grpc.error",
                    vec![KeyValue::new("grpc.error", message.to_string())],
                );
                span.set_status(SpanStatus::error(message.to_string()));
            }
            span.end();
        }
    }

    /// Intercept a unary call. The handler receives the request with the
    /// enriched [`CallScope`] attached to its extensions.
    pub async fn unary<Req, Res, F, Fut>(
        &self,
        full_method: &str,
        mut request: Request<Req>,
        handler: F,
    ) -> Result<Response<Res>, Status>
    where
        F: FnOnce(Request<Req>) -> Fut,
        Fut: Future<Output = Result<Response<Res>, Status>>,
    {
        let Some(descriptor) = MethodDescriptor::parse(full_method) else {
            return handler(request).await;
        };

        let labels = descriptor.labels(false);
        if let Some(metrics) = &self.metrics {
            metrics.in_flight_inc(labels.clone());
        }

        let scope = self.call_scope(&request, &descriptor, false);
        request.extensions_mut().insert(scope.clone());

        let start = Instant::now();
        let result = handler(request).await;
        let duration = start.elapsed().as_secs_f64();

        self.record_outcome(
            &scope,
            &descriptor,
            false,
            labels,
            duration,
            result.as_ref().err().map(Status::message),
        );

        result
    }

    /// Intercept a stream-opening call. The handler receives the inbound
    /// stream wrapped in a [`ScopedStream`] carrying the enriched scope, and
    /// the same scope on the request extensions.
    ///
    /// The measured duration covers the handler invocation only, i.e. stream
    /// establishment; messages flow after the span has finished.
    pub async fn streaming<S, Res, F, Fut>(
        &self,
        full_method: &str,
        request: Request<S>,
        handler: F,
    ) -> Result<Response<Res>, Status>
    where
        F: FnOnce(Request<ScopedStream<S>>) -> Fut,
        Fut: Future<Output = Result<Response<Res>, Status>>,
    {
        let Some(descriptor) = MethodDescriptor::parse(full_method) else {
            return handler(request.map(ScopedStream::wrap)).await;
        };

        let labels = descriptor.labels(true);
        if let Some(metrics) = &self.metrics {
            metrics.in_flight_inc(labels.clone());
        }

        let scope = self.call_scope(&request, &descriptor, true);

        let (metadata, mut extensions, inner) = request.into_parts();
        extensions.insert(scope.clone());
        let stream = ScopedStream::wrap(inner).attach(scope.clone());
        let request = Request::from_parts(metadata, extensions, stream);

        let start = Instant::now();
        let result = handler(request).await;
        let duration = start.elapsed().as_secs_f64();

        self.record_outcome(
            &scope,
            &descriptor,
            true,
            labels,
            duration,
            result.as_ref().err().map(Status::message),
        );

        result
    }
}

/// An inbound stream carrying the per-call scope, so nested reads observe the
/// enriched call state rather than the bare transport stream.
#[derive(Debug)]
pub struct ScopedStream<S> {
    inner: S,
    scope: Option<CallScope>,
}

impl<S> ScopedStream<S> {
    /// Wrap a stream with no scope attached yet.
    pub fn wrap(inner: S) -> Self {
        Self { inner, scope: None }
    }

    /// Attach a scope. A stream that already carries one is returned as-is,
    /// so repeated enrichment never overwrites the original scope.
    pub fn attach(mut self, scope: CallScope) -> Self {
        if self.scope.is_none() {
            self.scope = Some(scope);
        }
        self
    }

    /// The scope attached to this stream, if any.
    pub fn scope(&self) -> Option<&CallScope> {
        self.scope.as_ref()
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: Stream + Unpin> Stream for ScopedStream<S> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().inner).poll_next(cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}
