//! Observability middleware for gRPC and HTTP services.
//!
//! Wraps calls on both sides of both protocols with a uniform set of
//! concerns: a correlation id that survives every hop, a per-call structured
//! logger, latency and outcome metrics, and distributed trace spans that
//! propagate over the wire.
//!
//! # Layout
//! - [`scope`]: the correlation id and the per-call state attached to each
//!   request
//! - [`grpc`]: client and server interceptors for unary and streaming calls,
//!   method parsing, and endpoint filtering
//! - [`http`]: client and server middleware stages composed as `tower` layers
//! - [`metrics`]: the instrument set recorded per call
//!
//! # Data Flow
//! ```text
//! caller scope ──► client interceptor/middleware
//!                     id + client name on the wire, span injected
//!                         │
//!                         ▼  network
//!                  server interceptor/middleware
//!                     id extracted or minted, span continued,
//!                     enriched scope on request extensions
//!                         │
//!                         ▼
//!                      handler (reads the scope, calls onward)
//! ```

pub mod grpc;
pub mod http;
pub mod metrics;
pub mod scope;

pub use crate::grpc::{
    ClientInterceptor, ClientInterceptorConfig, FilterRule, MethodDescriptor, ScopedStream,
    ServerInterceptor, ServerInterceptorConfig,
};
pub use crate::http::{
    ClientMiddleware, ClientMiddlewareConfig, ServerMiddleware, ServerMiddlewareConfig, Stage,
    DEFAULT_STAGES,
};
pub use crate::metrics::RequestMetrics;
pub use crate::scope::{CallScope, RequestId};
