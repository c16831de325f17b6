//! Stream labels attached to each push.

use std::collections::BTreeMap;
use std::fmt;
use tracebus::event::{ErrorEvent, EventKind, JobOutcomeEvent, TraceEvent};
use tracebus::settings::ProcessIdentity;

/// Sorted label map. Empty values are never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSet(BTreeMap<String, String>);

impl LabelSet {
    /// The fixed process labels: `app`, `version`, `hostname`, `env`.
    pub fn for_process(identity: &ProcessIdentity) -> Self {
        let mut labels = Self::default();
        labels.insert("app", &identity.app);
        labels.insert("version", &identity.version);
        labels.insert("hostname", &identity.hostname);
        labels.insert("env", &identity.env);
        labels
    }

    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        if !value.is_empty() {
            self.0.insert(key.to_string(), value);
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn with_kind(&self, kind: EventKind) -> Self {
        let mut labels = self.clone();
        labels.insert("kind", kind.as_str());
        labels
    }

    pub fn for_trace(&self, event: &TraceEvent) -> Self {
        let mut labels = self.with_kind(EventKind::Trace);
        labels.insert("uri", &event.uri);
        labels.insert("method", &event.method);
        labels.insert("status", event.status.to_string());
        labels.insert("operator", &event.operator);
        labels.insert("tenant", &event.tenant);
        labels
    }

    pub fn for_error(&self, event: &ErrorEvent) -> Self {
        let mut labels = self.with_kind(EventKind::Error);
        labels.insert("uri", &event.uri);
        labels
    }

    pub fn for_job(&self, event: &JobOutcomeEvent) -> Self {
        let mut labels = self.with_kind(EventKind::JobOutcome);
        labels.insert("job", &event.job);
        labels.insert("succeed", event.succeed.to_string());
        labels
    }
}

/// Prometheus-style selector text, e.g. `{app="orders",kind="tracing"}`.
impl fmt::Display for LabelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (key, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{key}=\"")?;
            for c in value.chars() {
                match c {
                    '\\' => f.write_str("\\\\")?,
                    '"' => f.write_str("\\\"")?,
                    '\n' => f.write_str("\\n")?,
                    other => write!(f, "{other}")?,
                }
            }
            f.write_str("\"")?;
        }
        f.write_str("}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn identity() -> ProcessIdentity {
        ProcessIdentity::new("orders", "1.2.0", "web-1", "prd")
    }

    #[test]
    fn trace_labels_merge_process_and_event_fields() {
        let event = TraceEvent::new("POST", "/api/orders?x=1").with_status(201).with_identity("acme", "bob");
        let labels = LabelSet::for_process(&identity()).for_trace(&event);

        assert_eq!(labels.get("app"), Some("orders"));
        assert_eq!(labels.get("env"), Some("prd"));
        assert_eq!(labels.get("kind"), Some("tracing"));
        assert_eq!(labels.get("uri"), Some("/api/orders?x=1"));
        assert_eq!(labels.get("status"), Some("201"));
        assert_eq!(labels.get("operator"), Some("bob"));
        assert_eq!(labels.get("tenant"), Some("acme"));
    }

    #[test]
    fn empty_values_are_skipped() {
        let labels = LabelSet::for_process(&identity()).for_trace(&TraceEvent::new("GET", "/"));
        assert_eq!(labels.get("tenant"), None);
        assert_eq!(labels.len(), 8);
    }

    #[test]
    fn job_labels() {
        let event = JobOutcomeEvent::new("orders", "reindex", false, Duration::from_secs(1));
        let labels = LabelSet::for_process(&identity()).for_job(&event);
        assert_eq!(labels.get("kind"), Some("schedule"));
        assert_eq!(labels.get("succeed"), Some("false"));
    }

    #[test]
    fn selector_text_is_sorted_and_escaped() {
        let mut labels = LabelSet::default();
        labels.insert("b", "say \"hi\"");
        labels.insert("a", "x");
        assert_eq!(labels.to_string(), r#"{a="x",b="say \"hi\""}"#);
    }
}
