mod common;

use std::panic::AssertUnwindSafe;

use futures_util::{FutureExt, StreamExt};
use metrics::Label;
use metrics_util::debugging::{DebugValue, DebuggingRecorder};
use opentelemetry::trace::TraceId;
use opentelemetry::Value;
use tonic::metadata::MetadataValue;
use tonic::{Request, Response, Status};
use tracing_test::traced_test;
use uuid::Uuid;

use spyglass::{CallScope, RequestMetrics, ScopedStream, ServerInterceptor, ServerInterceptorConfig};

/// Handler that hands back the request id it observed on its scope.
async fn echo_scope_id(req: Request<()>) -> Result<Response<Option<String>>, Status> {
    let id = CallScope::from_grpc(&req).map(|scope| scope.request_id().to_string());
    Ok(Response::new(id))
}

#[tokio::test]
async fn test_unary_propagates_incoming_request_id() {
    let interceptor = ServerInterceptor::new(ServerInterceptorConfig::default());

    let mut request = Request::new(());
    request
        .metadata_mut()
        .insert("request-id", MetadataValue::from_static("aaaa-bbbb"));

    let id = interceptor
        .unary("/billing.Invoice/Create", request, echo_scope_id)
        .await
        .unwrap()
        .into_inner();

    assert_eq!(id.as_deref(), Some("aaaa-bbbb"));
}

#[tokio::test]
async fn test_unary_generates_request_id_when_missing() {
    let interceptor = ServerInterceptor::new(ServerInterceptorConfig::default());

    let id = interceptor
        .unary("/billing.Invoice/Create", Request::new(()), echo_scope_id)
        .await
        .unwrap()
        .into_inner()
        .unwrap();

    assert!(Uuid::parse_str(&id).is_ok());
}

#[tokio::test]
async fn test_malformed_method_bypasses_instrumentation() {
    let interceptor = ServerInterceptor::new(ServerInterceptorConfig::default());

    let id = interceptor
        .unary("not-a-method", Request::new(()), echo_scope_id)
        .await
        .unwrap()
        .into_inner();

    assert!(id.is_none());
}

#[tokio::test]
async fn test_streaming_scope_travels_with_the_stream() {
    let interceptor = ServerInterceptor::new(ServerInterceptorConfig::default());

    let mut request = Request::new(futures_util::stream::iter(vec![1, 2, 3]));
    request
        .metadata_mut()
        .insert("request-id", MetadataValue::from_static("aaaa-bbbb"));

    let (scope_id, items) = interceptor
        .streaming(
            "/billing.Invoice/Watch",
            request,
            |req: Request<ScopedStream<_>>| async move {
                let stream = req.into_inner();
                let scope_id = stream.scope().unwrap().request_id().to_string();
                let items: Vec<i32> = stream.collect().await;
                Ok(Response::new((scope_id, items)))
            },
        )
        .await
        .unwrap()
        .into_inner();

    assert_eq!(scope_id, "aaaa-bbbb");
    assert_eq!(items, vec![1, 2, 3]);
}

#[test]
fn test_metrics_labels_and_balance() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();

    metrics::with_local_recorder(&recorder, || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        runtime.block_on(async {
            let interceptor = ServerInterceptor::new(ServerInterceptorConfig {
                metrics: Some(RequestMetrics::grpc_server()),
                ..ServerInterceptorConfig::default()
            });
            let _ = interceptor
                .unary(
                    "/billing.Invoice/Create",
                    Request::new(()),
                    |_req: Request<()>| async {
                        Err::<Response<()>, _>(Status::internal("boom"))
                    },
                )
                .await;
        });
    });

    let snapshot = snapshotter.snapshot().into_vec();
    assert!(!snapshot.is_empty());
    for (key, _, _, value) in snapshot {
        assert!(key.key().name().starts_with("grpc_server_"));
        let labels: Vec<Label> = key.key().labels().cloned().collect();
        assert!(labels.contains(&Label::new("package", "billing")));
        assert!(labels.contains(&Label::new("stream", "false")));
        match value {
            DebugValue::Gauge(v) => assert_eq!(v.into_inner(), 0.0),
            DebugValue::Counter(v) => {
                assert_eq!(v, 1);
                assert!(labels.contains(&Label::new("success", "false")));
            }
            DebugValue::Histogram(v) => assert_eq!(v.len(), 1),
        }
    }
}

#[tokio::test]
#[traced_test]
async fn test_failed_call_logged_with_error() {
    let interceptor = ServerInterceptor::new(ServerInterceptorConfig {
        logging: true,
        ..ServerInterceptorConfig::default()
    });

    let _ = interceptor
        .unary(
            "/billing.Invoice/Create",
            Request::new(()),
            |_req: Request<()>| async { Err::<Response<()>, _>(Status::internal("boom")) },
        )
        .await;

    assert!(logs_contain("grpc.success=false"));
    assert!(logs_contain("boom"));
}

#[tokio::test]
async fn test_span_continues_inbound_trace() {
    let exporter = common::span_exporter();
    let interceptor = ServerInterceptor::new(ServerInterceptorConfig {
        tracer: Some(opentelemetry::global::tracer("grpc-server-tests")),
        ..ServerInterceptorConfig::default()
    });

    let mut request = Request::new(());
    request.metadata_mut().insert(
        "traceparent",
        MetadataValue::from_static("00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01"),
    );

    interceptor
        .unary("/tracing_case.Spans/Continued", request, |req: Request<()>| async move {
            Ok(Response::new(CallScope::from_grpc(&req).is_some()))
        })
        .await
        .unwrap();

    let span = exporter
        .get_finished_spans()
        .unwrap()
        .into_iter()
        .find(|span| {
            span.attributes
                .iter()
                .any(|kv| kv.key.as_str() == "grpc.package"
                    && kv.value == Value::from("tracing_case"))
        })
        .unwrap();
    assert_eq!(span.name, "grpc-server-request");
    assert_eq!(
        span.span_context.trace_id(),
        TraceId::from_hex("0af7651916cd43dd8448eb211c80319c").unwrap()
    );
    assert!(span
        .attributes
        .iter()
        .any(|kv| kv.key.as_str() == "grpc.success" && kv.value == Value::Bool(true)));
}

async fn give_up(_req: Request<()>) -> Result<Response<()>, Status> {
    panic!("handler gave up")
}

#[tokio::test]
async fn test_span_finished_exactly_once_when_handler_panics() {
    let exporter = common::span_exporter();
    let interceptor = ServerInterceptor::new(ServerInterceptorConfig {
        tracer: Some(opentelemetry::global::tracer("grpc-server-tests")),
        ..ServerInterceptorConfig::default()
    });

    // A unique trace id picks this call's span out of the shared exporter.
    let mut request = Request::new(());
    request.metadata_mut().insert(
        "traceparent",
        MetadataValue::from_static("00-6e5b0b9e3c1f4a2d8f0a1b2c3d4e5f60-b7ad6b7169203331-01"),
    );

    let call = interceptor.unary("/tracing_case.Spans/Panicked", request, give_up);
    let outcome = AssertUnwindSafe(call).catch_unwind().await;
    assert!(outcome.is_err());

    let trace_id = TraceId::from_hex("6e5b0b9e3c1f4a2d8f0a1b2c3d4e5f60").unwrap();
    let finished: Vec<_> = exporter
        .get_finished_spans()
        .unwrap()
        .into_iter()
        .filter(|span| span.span_context.trace_id() == trace_id)
        .collect();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].name, "grpc-server-request");
}
