//! Trace context propagation over gRPC call metadata.
//!
//! # Responsibilities
//! - Adapt `tonic::metadata::MetadataMap` to the OpenTelemetry carrier traits
//! - Inject on the caller side, extract on the callee side
//!
//! # Design Decisions
//! - Keys are normalized to lowercase and values appended, so multi-valued
//!   metadata survives injection
//! - Entries that do not fit gRPC metadata (non-ASCII) are dropped and the
//!   drop is surfaced to the interceptor, which records it as a span event;
//!   propagation failure never fails the call

use opentelemetry::propagation::{Extractor, Injector};
use tonic::metadata::{KeyRef, MetadataKey, MetadataMap, MetadataValue};

/// Writes trace context entries into outgoing call metadata.
pub struct MetadataInjector<'a> {
    metadata: &'a mut MetadataMap,
    dropped: bool,
}

impl<'a> MetadataInjector<'a> {
    pub fn new(metadata: &'a mut MetadataMap) -> Self {
        Self {
            metadata,
            dropped: false,
        }
    }

    /// Whether any entry could not be carried by the metadata.
    pub fn dropped(&self) -> bool {
        self.dropped
    }
}

impl Injector for MetadataInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        let key = key.to_lowercase();
        match (
            MetadataKey::from_bytes(key.as_bytes()),
            MetadataValue::try_from(value.as_str()),
        ) {
            (Ok(key), Ok(value)) => {
                self.metadata.append(key, value);
            }
            _ => self.dropped = true,
        }
    }
}

/// Reads trace context entries from incoming call metadata.
pub struct MetadataExtractor<'a>(pub &'a MetadataMap);

impl Extractor for MetadataExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|value| value.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0
            .keys()
            .filter_map(|key| match key {
                KeyRef::Ascii(key) => Some(key.as_str()),
                KeyRef::Binary(_) => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_normalizes_and_appends() {
        let mut metadata = MetadataMap::new();
        let mut injector = MetadataInjector::new(&mut metadata);
        injector.set("TraceParent", "00-aa-bb-01".to_string());
        injector.set("traceparent", "00-cc-dd-01".to_string());
        assert!(!injector.dropped());

        let values: Vec<&str> = metadata
            .get_all("traceparent")
            .iter()
            .map(|v| v.to_str().unwrap())
            .collect();
        assert_eq!(values, vec!["00-aa-bb-01", "00-cc-dd-01"]);
    }

    #[test]
    fn test_set_tracks_dropped_entries() {
        let mut metadata = MetadataMap::new();
        let mut injector = MetadataInjector::new(&mut metadata);
        injector.set("traceparent", "não-ascii".to_string());
        assert!(injector.dropped());
        assert!(metadata.get("traceparent").is_none());
    }

    #[test]
    fn test_extractor_reads_keys_and_values() {
        let mut metadata = MetadataMap::new();
        metadata.insert("traceparent", "00-aa-bb-01".parse().unwrap());

        let extractor = MetadataExtractor(&metadata);
        assert_eq!(extractor.get("traceparent"), Some("00-aa-bb-01"));
        assert_eq!(extractor.get("tracestate"), None);
        assert_eq!(extractor.keys(), vec!["traceparent"]);
    }
}
