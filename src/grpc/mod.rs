//! gRPC interceptors for logging, metrics, and tracing.
//!
//! # Data Flow
//! ```text
//! outgoing call
//!     → client.rs (parse, filter, id, span, metadata, invoke, record)
//! incoming call
//!     → server.rs (parse, id, logger, span extraction, handle, record)
//! both sides
//!     → propagation.rs (trace context ↔ call metadata)
//! ```
//!
//! # Design Decisions
//! - A malformed method name skips instrumentation entirely; the call still
//!   executes and its result is returned unchanged
//! - Filters are evaluated before any instrumentation begins; a matched call
//!   is invoked with the original, unmodified request

use serde::Deserialize;

pub mod client;
pub mod propagation;
pub mod server;

pub use client::{ClientInterceptor, ClientInterceptorConfig};
pub use server::{ScopedStream, ServerInterceptor, ServerInterceptorConfig};

/// Metadata key carrying the correlation id across gRPC hops.
pub const REQUEST_ID_KEY: &str = "request-id";

/// Metadata key identifying the calling client.
pub const CLIENT_NAME_KEY: &str = "client-name";

/// The (package, service, method) triple derived from a fully-qualified
/// method name of the form `/package.Service/Method`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub package: String,
    pub service: String,
    pub method: String,
}

impl MethodDescriptor {
    /// Parse a fully-qualified method name.
    ///
    /// Returns `None` unless the input splits on `/` and `.` into exactly a
    /// leading empty segment and three non-empty components. Parsing never
    /// fails any harder than that; callers treat `None` as "skip
    /// instrumentation", not as an error.
    pub fn parse(full_method: &str) -> Option<MethodDescriptor> {
        let mut parts = Vec::with_capacity(4);
        let mut rest = full_method;
        for _ in 0..3 {
            match rest.find(['/', '.']) {
                Some(at) => {
                    parts.push(&rest[..at]);
                    rest = &rest[at + 1..];
                }
                None => break,
            }
        }
        parts.push(rest);

        match parts.as_slice() {
            ["", package, service, method]
                if !package.is_empty() && !service.is_empty() && !method.is_empty() =>
            {
                Some(MethodDescriptor {
                    package: (*package).to_string(),
                    service: (*service).to_string(),
                    method: (*method).to_string(),
                })
            }
            _ => None,
        }
    }

    /// Labels shared by every instrument observing this call.
    pub(crate) fn labels(&self, stream: bool) -> Vec<metrics::Label> {
        vec![
            metrics::Label::new("package", self.package.clone()),
            metrics::Label::new("service", self.service.clone()),
            metrics::Label::new("method", self.method.clone()),
            metrics::Label::new("stream", if stream { "true" } else { "false" }),
        ]
    }
}

/// Excludes a package, a service, or a method from being observed.
///
/// A rule with only `package` set matches every call in that package; a rule
/// with `package` and `service` set matches every method in that service; a
/// fully specified rule matches exactly one method. Rules are evaluated as a
/// disjunction: if any rule matches, the call is not instrumented.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FilterRule {
    pub package: String,
    pub service: String,
    pub method: String,
}

impl FilterRule {
    /// Filter every call in a package.
    pub fn package(package: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            ..Self::default()
        }
    }

    /// Filter every method of a service.
    pub fn service(package: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            service: service.into(),
            ..Self::default()
        }
    }

    /// Filter a single method.
    pub fn method(
        package: impl Into<String>,
        service: impl Into<String>,
        method: impl Into<String>,
    ) -> Self {
        Self {
            package: package.into(),
            service: service.into(),
            method: method.into(),
        }
    }

    /// Whether this rule matches the given call.
    pub fn matches(&self, descriptor: &MethodDescriptor) -> bool {
        self.package == descriptor.package
            && (self.service.is_empty()
                || (self.service == descriptor.service
                    && (self.method.is_empty() || self.method == descriptor.method)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(package: &str, service: &str, method: &str) -> MethodDescriptor {
        MethodDescriptor {
            package: package.to_string(),
            service: service.to_string(),
            method: method.to_string(),
        }
    }

    #[test]
    fn test_parse_well_formed() {
        let d = MethodDescriptor::parse("/billing.Invoice/Create").unwrap();
        assert_eq!(d, descriptor("billing", "Invoice", "Create"));
    }

    #[test]
    fn test_parse_keeps_remainder_in_method() {
        let d = MethodDescriptor::parse("/a.b/c.d").unwrap();
        assert_eq!(d, descriptor("a", "b", "c.d"));
    }

    #[test]
    fn test_parse_malformed() {
        for input in [
            "",
            "/",
            "//",
            "billing.Invoice/Create",
            "/billingInvoice/Create",
            "/billing.Invoice",
            "/.Invoice/Create",
            "/billing./Create",
            "/billing.Invoice/",
            "x/billing.Invoice/Create",
        ] {
            assert!(MethodDescriptor::parse(input).is_none(), "{input:?}");
        }
    }

    #[test]
    fn test_filter_package_only() {
        let rule = FilterRule::package("billing");
        assert!(rule.matches(&descriptor("billing", "Invoice", "Create")));
        assert!(rule.matches(&descriptor("billing", "Payment", "Refund")));
        assert!(!rule.matches(&descriptor("shipping", "Invoice", "Create")));
    }

    #[test]
    fn test_filter_package_and_service() {
        let rule = FilterRule::service("billing", "Invoice");
        assert!(rule.matches(&descriptor("billing", "Invoice", "Create")));
        assert!(rule.matches(&descriptor("billing", "Invoice", "Delete")));
        assert!(!rule.matches(&descriptor("billing", "Payment", "Create")));
    }

    #[test]
    fn test_filter_fully_specified() {
        let rule = FilterRule::method("billing", "Invoice", "Create");
        assert!(rule.matches(&descriptor("billing", "Invoice", "Create")));
        assert!(!rule.matches(&descriptor("billing", "Invoice", "Delete")));
    }

    #[test]
    fn test_filter_empty_service_ignores_rule_method() {
        // An empty service matches the whole package, whatever the rule's
        // method field says.
        let rule = FilterRule {
            package: "billing".to_string(),
            service: String::new(),
            method: "Create".to_string(),
        };
        assert!(rule.matches(&descriptor("billing", "Invoice", "Delete")));
    }

    #[test]
    fn test_filter_deserializes_with_optional_fields() {
        let rule: FilterRule =
            serde_json::from_str(r#"{"package":"billing","service":"Invoice"}"#).unwrap();
        assert_eq!(rule, FilterRule::service("billing", "Invoice"));
    }
}
