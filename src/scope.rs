//! Correlation ids and the per-call scope.
//!
//! # Responsibilities
//! - Generate globally-unique request ids (UUID v4)
//! - Carry the per-call instrumentation state (id, logger, trace context)
//! - Attach/read the scope on gRPC and HTTP request extensions
//!
//! # Design Decisions
//! - The scope is an explicit immutable structure, not an opaque context bag;
//!   enrichment returns a new scope and leaves the original untouched
//! - The scope travels in request extensions under its own type, so it cannot
//!   collide with unrelated extension values
//! - An id is generated only when none is present; downstream hops never
//!   regenerate one

use std::fmt;

use opentelemetry::Context;
use tracing::Span;
use uuid::Uuid;

/// An opaque identifier tying together all logs, metrics, and traces that
/// belong to one logical end-to-end call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestId(String);

impl RequestId {
    /// Generate a new unique request id.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for RequestId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The state every instrumented call carries: the correlation id, the
/// per-call logger, and the active trace context.
///
/// A scope is created once at the edge of a call and enriched step by step;
/// each enrichment produces a new scope. Handlers read it back from the
/// request extensions via [`CallScope::from_grpc`] or [`CallScope::from_http`].
#[derive(Clone, Debug)]
pub struct CallScope {
    request_id: RequestId,
    logger: Span,
    trace_cx: Context,
}

impl CallScope {
    /// Create a scope with the given request id, no per-call logger, and an
    /// empty trace context.
    pub fn new(request_id: RequestId) -> Self {
        Self {
            request_id,
            logger: Span::none(),
            trace_cx: Context::new(),
        }
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// The per-call logger. A disabled (`none`) span when logging is off.
    pub fn logger(&self) -> &Span {
        &self.logger
    }

    /// The trace context holding the active span, if tracing is enabled.
    pub fn trace_cx(&self) -> &Context {
        &self.trace_cx
    }

    /// A copy of this scope with the per-call logger attached.
    pub fn with_logger(&self, logger: Span) -> Self {
        Self {
            logger,
            ..self.clone()
        }
    }

    /// A copy of this scope with the trace context attached.
    pub fn with_trace_cx(&self, trace_cx: Context) -> Self {
        Self {
            trace_cx,
            ..self.clone()
        }
    }

    /// Read the scope attached to a gRPC request, if any.
    pub fn from_grpc<T>(request: &tonic::Request<T>) -> Option<&CallScope> {
        request.extensions().get::<CallScope>()
    }

    /// Read the scope attached to an HTTP request, if any.
    pub fn from_http<T>(request: &http::Request<T>) -> Option<&CallScope> {
        request.extensions().get::<CallScope>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_unique() {
        let a = RequestId::new();
        let b = RequestId::new();
        assert_ne!(a, b);
        assert!(Uuid::parse_str(a.as_str()).is_ok());
    }

    #[test]
    #[tracing_test::traced_test]
    fn test_scope_enrichment_is_non_destructive() {
        let base = CallScope::new(RequestId::from("aaaa-bbbb"));
        let enriched = base.with_logger(tracing::info_span!("call"));

        assert!(base.logger().is_none());
        assert!(!enriched.logger().is_none());
        assert_eq!(enriched.request_id().as_str(), "aaaa-bbbb");
    }

    #[test]
    fn test_scope_round_trips_through_extensions() {
        let scope = CallScope::new(RequestId::from("aaaa-bbbb"));

        let mut grpc = tonic::Request::new(());
        grpc.extensions_mut().insert(scope.clone());
        assert_eq!(
            CallScope::from_grpc(&grpc).unwrap().request_id().as_str(),
            "aaaa-bbbb"
        );

        let mut http = http::Request::new(());
        http.extensions_mut().insert(scope);
        assert_eq!(
            CallScope::from_http(&http).unwrap().request_id().as_str(),
            "aaaa-bbbb"
        );
    }
}
