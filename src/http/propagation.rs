//! Trace context propagation over HTTP headers.
//!
//! The HTTP twin of [`crate::grpc::propagation`]: adapts `http::HeaderMap` to
//! the OpenTelemetry carrier traits. Entries that are not valid header
//! names/values are dropped; the drop is reported to the middleware, never to
//! the caller.

use http::header::{HeaderMap, HeaderName, HeaderValue};
use opentelemetry::propagation::{Extractor, Injector};

/// Writes trace context entries into outgoing request headers.
pub struct HeaderInjector<'a> {
    headers: &'a mut HeaderMap,
    dropped: bool,
}

impl<'a> HeaderInjector<'a> {
    pub fn new(headers: &'a mut HeaderMap) -> Self {
        Self {
            headers,
            dropped: false,
        }
    }

    /// Whether any entry could not be carried by the headers.
    pub fn dropped(&self) -> bool {
        self.dropped
    }
}

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        match (
            HeaderName::from_bytes(key.to_lowercase().as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            (Ok(name), Ok(value)) => {
                self.headers.append(name, value);
            }
            _ => self.dropped = true,
        }
    }
}

/// Reads trace context entries from incoming request headers.
pub struct HeaderExtractor<'a>(pub &'a HeaderMap);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|value| value.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(HeaderName::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_injector_appends_normalized_entries() {
        let mut headers = HeaderMap::new();
        let mut injector = HeaderInjector::new(&mut headers);
        injector.set("TraceParent", "00-aa-bb-01".to_string());
        assert!(!injector.dropped());
        assert_eq!(headers.get("traceparent").unwrap(), "00-aa-bb-01");
    }

    #[test]
    fn test_extractor_reads_entries() {
        let mut headers = HeaderMap::new();
        headers.insert("traceparent", HeaderValue::from_static("00-aa-bb-01"));

        let extractor = HeaderExtractor(&headers);
        assert_eq!(extractor.get("traceparent"), Some("00-aa-bb-01"));
        assert_eq!(extractor.keys(), vec!["traceparent"]);
    }
}
