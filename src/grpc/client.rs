//! Client-side gRPC interceptor.
//!
//! # Responsibilities
//! - Derive or propagate the correlation id for outgoing calls
//! - Start a child (or root) span and inject it into call metadata
//! - Measure latency and record the outcome in logs, metrics, and span tags
//!
//! # Design Decisions
//! - Unary and streaming calls run the exact same pipeline; a streaming call
//!   measures only the time to establish the stream
//! - The invoker's result is returned byte-for-byte; this layer only observes
//! - A malformed method name or a filter match invokes the call with the
//!   original, unmodified request

use std::future::Future;
use std::time::Instant;

use metrics::Label;
use opentelemetry::global::{self, BoxedTracer};
use opentelemetry::trace::{SpanKind, Status as SpanStatus, TraceContextExt, Tracer};
use opentelemetry::{Context, KeyValue};
use tonic::metadata::MetadataValue;
use tonic::{Request, Response, Status};
use tracing::{error, info};

use crate::grpc::propagation::MetadataInjector;
use crate::grpc::{FilterRule, MethodDescriptor, CLIENT_NAME_KEY, REQUEST_ID_KEY};
use crate::metrics::RequestMetrics;
use crate::scope::{CallScope, RequestId};

const CLIENT_SPAN_NAME: &str = "grpc-client-request";
const CLIENT_KIND: &str = "client";

/// Configuration for [`ClientInterceptor`].
///
/// Every concern is optional; a field left unset disables that concern for
/// all calls going through the interceptor.
#[derive(Default)]
pub struct ClientInterceptorConfig {
    /// Name of this client, propagated as `client-name` metadata.
    pub name: String,
    /// Calls matching any rule bypass instrumentation entirely.
    pub filters: Vec<FilterRule>,
    /// Emit a structured log record per call.
    pub logging: bool,
    /// Instruments to record per-call metrics on.
    pub metrics: Option<RequestMetrics>,
    /// Tracer used to start and propagate spans.
    pub tracer: Option<BoxedTracer>,
}

/// Intercepts outgoing unary and streaming gRPC calls for logging, metrics,
/// and tracing.
pub struct ClientInterceptor {
    name: String,
    filters: Vec<FilterRule>,
    logging: bool,
    metrics: Option<RequestMetrics>,
    tracer: Option<BoxedTracer>,
}

impl ClientInterceptor {
    pub fn new(config: ClientInterceptorConfig) -> Self {
        Self {
            name: config.name,
            filters: config.filters,
            logging: config.logging,
            metrics: config.metrics,
            tracer: config.tracer,
        }
    }

    /// Intercept a unary call.
    ///
    /// `parent` is the caller's ambient scope, if it has one: an existing
    /// correlation id is propagated unchanged, and an active span becomes the
    /// parent of the new client span.
    pub async fn unary<Req, Res, F, Fut>(
        &self,
        parent: Option<&CallScope>,
        full_method: &str,
        request: Request<Req>,
        invoker: F,
    ) -> Result<Response<Res>, Status>
    where
        F: FnOnce(Request<Req>) -> Fut,
        Fut: Future<Output = Result<Response<Res>, Status>>,
    {
        self.call(parent, full_method, false, request, invoker)
            .await
    }

    /// Intercept a stream-opening call.
    ///
    /// The measured duration covers only stream establishment; sends and
    /// receives on the opened stream happen after the span has finished and
    /// the metrics are recorded.
    pub async fn streaming<Req, Res, F, Fut>(
        &self,
        parent: Option<&CallScope>,
        full_method: &str,
        request: Request<Req>,
        invoker: F,
    ) -> Result<Response<Res>, Status>
    where
        F: FnOnce(Request<Req>) -> Fut,
        Fut: Future<Output = Result<Response<Res>, Status>>,
    {
        self.call(parent, full_method, true, request, invoker).await
    }

    async fn call<Req, Res, F, Fut>(
        &self,
        parent: Option<&CallScope>,
        full_method: &str,
        stream: bool,
        mut request: Request<Req>,
        invoker: F,
    ) -> Result<Response<Res>, Status>
    where
        F: FnOnce(Request<Req>) -> Fut,
        Fut: Future<Output = Result<Response<Res>, Status>>,
    {
        let Some(descriptor) = MethodDescriptor::parse(full_method) else {
            return invoker(request).await;
        };

        if self.filters.iter().any(|f| f.matches(&descriptor)) {
            return invoker(request).await;
        }

        // Propagate an existing correlation id, generate one otherwise.
        let request_id = match parent.map(CallScope::request_id) {
            Some(id) if !id.as_str().is_empty() => id.clone(),
            _ => RequestId::new(),
        };

        {
            let metadata = request.metadata_mut();
            if let Ok(value) = MetadataValue::try_from(request_id.as_str()) {
                metadata.insert(REQUEST_ID_KEY, value);
            }
            if let Ok(value) = MetadataValue::try_from(self.name.as_str()) {
                metadata.insert(CLIENT_NAME_KEY, value);
            }
        }

        let labels = descriptor.labels(stream);
        if let Some(metrics) = &self.metrics {
            metrics.in_flight_inc(labels.clone());
        }

        let trace_cx = self.tracer.as_ref().map(|tracer| {
            let parent_cx = parent
                .map(|scope| scope.trace_cx().clone())
                .unwrap_or_else(Context::new);
            let span = tracer
                .span_builder(CLIENT_SPAN_NAME)
                .with_kind(SpanKind::Client)
                .start_with_context(tracer, &parent_cx);
            let cx = parent_cx.with_span(span);

            let mut injector = MetadataInjector::new(request.metadata_mut());
            global::get_text_map_propagator(|propagator| {
                propagator.inject_context(&cx, &mut injector)
            });
            if injector.dropped() {
                // Non-fatal: the call proceeds with partial trace metadata.
                cx.span()
                    .add_event("trace injection dropped metadata entries", vec![]);
            }
            cx
        });

        let start = Instant::now();
        let result = invoker(request).await;
        let duration = start.elapsed().as_secs_f64();
        let success = result.is_ok();

        if self.logging {
            let stream_text = if stream { "true" } else { "false" };
            match &result {
                Ok(_) => info!(
                    grpc.kind = CLIENT_KIND,
                    grpc.package = %descriptor.package,
                    grpc.service = %descriptor.service,
                    grpc.method = %descriptor.method,
                    grpc.stream = stream_text,
                    grpc.success = success,
                    responseTime = duration,
                    requestId = %request_id,
                    "{} {}.{}.{} {:.6}",
                    CLIENT_KIND,
                    descriptor.package,
                    descriptor.service,
                    descriptor.method,
                    duration,
                ),
                Err(status) => error!(
                    grpc.kind = CLIENT_KIND,
                    grpc.package = %descriptor.package,
                    grpc.service = %descriptor.service,
                    grpc.method = %descriptor.method,
                    grpc.stream = stream_text,
                    grpc.success = success,
                    responseTime = duration,
                    grpc.error = %status.message(),
                    requestId = %request_id,
                    "{} {}.{}.{} {:.6}",
                    CLIENT_KIND,
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

        if let Some(cx) = trace_cx {
            let span = cx.span();
            span.set_attribute(KeyValue::new("grpc.package", descriptor.package.clone()));
            span.set_attribute(KeyValue::new("grpc.service", descriptor.service.clone()));
            span.set_attribute(KeyValue::new("grpc.method", descriptor.method.clone()));
            span.set_attribute(KeyValue::new("grpc.stream", stream));
            span.set_attribute(KeyValue::new("grpc.success", success));
            if let Err(status) = &result {
                span.set_attribute(KeyValue::new("error", true));
                span.add_event(
                    "grpc.error",
                    vec![KeyValue::new("grpc.error", status.message().to_string())],
                );
                span.set_status(SpanStatus::error(status.message().to_string()));
            }
            span.end();
        }

        result
    }
}
