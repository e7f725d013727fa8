//! HTTP middleware for logging, metrics, and tracing.
//!
//! # Data Flow
//! ```text
//! request
//!     → request id stage (ensure id on headers + scope)
//!     → logging stage    (per-call logger, terminal record)
//!     → tracing stage    (span, header propagation)
//!     → metrics stage    (in-flight gauge, duration)
//!     → wrapped service / upstream call
//! ```
//!
//! # Design Decisions
//! - Each concern is one independently composable `tower` layer over plain
//!   `http` request/response types, so the same stages fit an Axum router and
//!   a Hyper client alike
//! - Composition is an explicit ordered stage list folded over a boxed
//!   service, not a nest of closures; the request id stage goes first so the
//!   other stages can rely on the id being present
//! - Stages whose collaborator is not configured are skipped, leaving the
//!   wrapped service untouched

use http::{HeaderName, Request, Response};
use tower::util::BoxCloneService;
use tower::{Layer, Service};

pub mod client;
pub mod propagation;
pub mod server;

pub use client::{ClientMiddleware, ClientMiddlewareConfig};
pub use server::{ServerMiddleware, ServerMiddlewareConfig};

/// Header carrying the correlation id across HTTP hops (`Request-Id`).
pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("request-id");

/// One concern of the middleware chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    RequestId,
    Logging,
    Tracing,
    Metrics,
}

/// The conventional stage order: correlation id first, then the mutually
/// independent observers.
pub const DEFAULT_STAGES: [Stage; 4] = [
    Stage::RequestId,
    Stage::Logging,
    Stage::Tracing,
    Stage::Metrics,
];

/// The `"Nxx"` class of a status code.
pub(crate) fn status_class(status_code: u16) -> String {
    format!("{}xx", status_code / 100)
}

type Boxed<ReqB, ResB, E> = BoxCloneService<Request<ReqB>, Response<ResB>, E>;

/// Fold an ordered stage list over `inner`, boxing after each applied layer.
/// An unconfigured stage (a `None` layer) leaves the service untouched. Both
/// middleware sides compose through here with their own layer set.
pub(crate) fn compose<S, ReqB, ResB, Rid, Log, Trc, Met>(
    stages: &[Stage],
    request_id: &Rid,
    logging: Option<&Log>,
    tracing: Option<&Trc>,
    metrics: Option<&Met>,
    inner: S,
) -> Boxed<ReqB, ResB, S::Error>
where
    S: Service<Request<ReqB>, Response = Response<ResB>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    ReqB: Send + 'static,
    ResB: Send + 'static,
    Rid: Layer<Boxed<ReqB, ResB, S::Error>>,
    Rid::Service:
        Service<Request<ReqB>, Response = Response<ResB>, Error = S::Error> + Clone + Send + 'static,
    <Rid::Service as Service<Request<ReqB>>>::Future: Send + 'static,
    Log: Layer<Boxed<ReqB, ResB, S::Error>>,
    Log::Service:
        Service<Request<ReqB>, Response = Response<ResB>, Error = S::Error> + Clone + Send + 'static,
    <Log::Service as Service<Request<ReqB>>>::Future: Send + 'static,
    Trc: Layer<Boxed<ReqB, ResB, S::Error>>,
    Trc::Service:
        Service<Request<ReqB>, Response = Response<ResB>, Error = S::Error> + Clone + Send + 'static,
    <Trc::Service as Service<Request<ReqB>>>::Future: Send + 'static,
    Met: Layer<Boxed<ReqB, ResB, S::Error>>,
    Met::Service:
        Service<Request<ReqB>, Response = Response<ResB>, Error = S::Error> + Clone + Send + 'static,
    <Met::Service as Service<Request<ReqB>>>::Future: Send + 'static,
{
    let mut service = BoxCloneService::new(inner);
    for stage in stages.iter().rev() {
        service = match stage {
            Stage::RequestId => BoxCloneService::new(request_id.layer(service)),
            Stage::Logging => match logging {
                Some(layer) => BoxCloneService::new(layer.layer(service)),
                None => service,
            },
            Stage::Tracing => match tracing {
                Some(layer) => BoxCloneService::new(layer.layer(service)),
                None => service,
            },
            Stage::Metrics => match metrics {
                Some(layer) => BoxCloneService::new(layer.layer(service)),
                None => service,
            },
        };
    }
    service
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_class() {
        assert_eq!(status_class(200), "2xx");
        assert_eq!(status_class(404), "4xx");
        assert_eq!(status_class(503), "5xx");
    }
}
