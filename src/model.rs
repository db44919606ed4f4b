//! Core data types shared by the decoder, transformer and forwarder.

use std::collections::HashMap;

pub const MAX_PROPERTIES: usize = 20;
pub const MAX_KEY_LEN: usize = 50;
pub const MAX_VALUE_LEN: usize = 150;
pub const TAG_PREFIX: &str = "anodot_tag_";
pub const METRIC_NAME_LABEL: &str = "__name__";

/// One label name/value pair. Kept as an owned pair (rather than a
/// reference into the decoded request) because every pipeline stage
/// downstream mutates label sets in place.
pub type Label = (String, String);

/// A single decoded sample: an ordered label set, a millisecond
/// timestamp and a value. `labels` is ordered as received on the wire;
/// nothing downstream depends on that order except for determinism of
/// property assembly, which re-sorts explicitly.
#[derive(Debug, Clone, Default)]
pub struct Sample {
    pub labels: Vec<Label>,
    pub timestamp_ms: i64,
    pub value: f64,
}

impl Sample {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn set(&mut self, name: &str, value: String) {
        if let Some(entry) = self.labels.iter_mut().find(|(k, _)| k == name) {
            entry.1 = value;
        } else {
            self.labels.push((name.to_string(), value));
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.labels.retain(|(k, _)| k != name);
    }
}

/// An outgoing metric in the anomaly-detection backend's wire format.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct OutgoingMetric {
    pub properties: HashMap<String, String>,
    pub tags: HashMap<String, String>,
    pub timestamp: i64,
    pub value: f64,
}

impl OutgoingMetric {
    pub fn what(&self) -> Option<&str> {
        self.properties.get("what").map(|s| s.as_str())
    }
}

pub(crate) fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        // Byte-safe truncation at a char boundary, matching the
        // original's plain byte-slice truncation closely enough for
        // the ASCII-dominated label alphabet these metrics use.
        let mut end = max_len;
        while end > 0 && !s.is_char_boundary(end) {
            end -= 1;
        }
        s[..end].to_string()
    }
}
