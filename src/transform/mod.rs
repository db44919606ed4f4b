//! Converts decoded [`Sample`]s into [`OutgoingMetric`]s: validity
//! checks, relabeling, pod-name remapping, tag extraction, property
//! assembly and filtering.

pub mod podmap;
pub mod relabel;

use std::collections::HashMap;
use std::sync::Arc;

use itertools::Itertools;

use crate::metrics;
use crate::model::{truncate, OutgoingMetric, Sample, MAX_KEY_LEN, MAX_PROPERTIES, MAX_VALUE_LEN, METRIC_NAME_LABEL, TAG_PREFIX};
use crate::transform::podmap::PodMappingSnapshot;
use crate::transform::relabel::RelabelRule;

/// A chain processor applied to a sample's label set in order.
/// Returning `false` drops the sample.
pub trait Processor: Send + Sync {
    fn name(&self) -> &str;
    fn mutate(&self, sample: &mut Sample) -> bool;
}

pub struct RelabelProcessor {
    pub rules: Vec<RelabelRule>,
}

impl Processor for RelabelProcessor {
    fn name(&self) -> &str {
        "relabel"
    }

    fn mutate(&self, sample: &mut Sample) -> bool {
        relabel::apply(sample, &self.rules)
    }
}

pub struct PodMapProcessor {
    pub snapshot: Arc<PodMappingSnapshot>,
}

impl Processor for PodMapProcessor {
    fn name(&self) -> &str {
        "pod_map"
    }

    fn mutate(&self, sample: &mut Sample) -> bool {
        podmap::apply(sample, &self.snapshot)
    }
}

/// Parses decoded samples into metrics the backend accepts, applying
/// the configured processors, tag extraction and filter.
pub struct Transformer {
    processors: Vec<Box<dyn Processor>>,
    tags: HashMap<String, String>,
    filter_in: Option<HashMap<String, String>>,
    filter_out: Option<HashMap<String, String>>,
}

impl Transformer {
    pub fn new(
        processors: Vec<Box<dyn Processor>>,
        tags: HashMap<String, String>,
        filter_in: Option<HashMap<String, String>>,
        filter_out: Option<HashMap<String, String>>,
    ) -> Self {
        Transformer {
            processors,
            tags,
            filter_in,
            filter_out,
        }
    }

    /// Transform a batch of samples into outgoing metrics, dropping
    /// whichever samples fail validity checks, processors, or the
    /// filter.
    pub fn process_all(&self, samples: Vec<Sample>) -> Vec<OutgoingMetric> {
        samples
            .into_iter()
            .filter_map(|s| self.process_one(s))
            .collect()
    }

    fn process_one(&self, mut sample: Sample) -> Option<OutgoingMetric> {
        if !sample.value.is_finite() {
            metrics::VALUE_NOT_ACCEPTED.inc();
            return None;
        }

        if sample.labels.len() > MAX_PROPERTIES {
            metrics::MAX_NUMBER_LABELS_REACHED.inc();
            return None;
        }

        for processor in &self.processors {
            if !processor.mutate(&mut sample) {
                return None;
            }
        }

        if sample.labels.is_empty() {
            return None;
        }

        let metric = build_metric(&sample, &self.tags);
        if self.passes_filter(&metric) {
            Some(metric)
        } else {
            None
        }
    }

    fn passes_filter(&self, metric: &OutgoingMetric) -> bool {
        if let Some(filter_in) = &self.filter_in {
            return filter_in
                .iter()
                .any(|(k, v)| metric.properties.get(k) == Some(v));
        }
        if let Some(filter_out) = &self.filter_out {
            return !filter_out
                .iter()
                .any(|(k, v)| metric.properties.get(k) == Some(v));
        }
        true
    }
}

fn build_metric(sample: &Sample, static_tags: &HashMap<String, String>) -> OutgoingMetric {
    let mut tags = static_tags.clone();
    let mut properties = HashMap::new();

    let sorted_labels = sample
        .labels
        .iter()
        .sorted_unstable_by_key(|(name, _)| name.clone());

    for (name, value) in sorted_labels {
        if name.is_empty() || value.is_empty() {
            continue;
        }
        if let Some(tag_name) = name.strip_prefix(TAG_PREFIX) {
            tags.insert(truncate(tag_name, MAX_KEY_LEN), truncate(value, MAX_VALUE_LEN));
            continue;
        }
        let key = truncate(name, MAX_KEY_LEN);
        let value = truncate(value, MAX_VALUE_LEN);
        if name == METRIC_NAME_LABEL {
            properties.insert("what".to_string(), value);
        } else {
            properties.insert(key, value);
        }
    }

    OutgoingMetric {
        properties,
        tags,
        timestamp: sample.timestamp_ms.div_euclid(1000),
        value: sample.value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;

    fn sample(name: &str, value: f64, extra: &[(&str, &str)]) -> Sample {
        let mut labels = vec![(METRIC_NAME_LABEL.to_string(), name.to_string())];
        labels.extend(extra.iter().map(|(k, v)| (k.to_string(), v.to_string())));
        Sample {
            labels,
            timestamp_ms: 1_000,
            value,
        }
    }

    fn transformer(filter_in: Option<&[(&str, &str)]>, filter_out: Option<&[(&str, &str)]>) -> Transformer {
        let to_map = |pairs: &[(&str, &str)]| {
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
        };
        Transformer::new(
            vec![],
            HashMap::new(),
            filter_in.map(to_map),
            filter_out.map(to_map),
        )
    }

    #[test]
    fn test_filter_out() {
        let t = transformer(None, Some(&[("test_label", "v2")]));
        let samples = vec![
            sample("testmetric", 13.0, &[("test_label", "v1")]),
            sample("testmetric", 1.0, &[("test_label", "v2")]),
        ];
        let out = t.process_all(samples);
        pretty_assert_eq!(out.len(), 1);
        pretty_assert_eq!(out[0].what(), Some("testmetric"));
        pretty_assert_eq!(out[0].value, 13.0);
    }

    #[test]
    fn test_filter_in() {
        let t = transformer(Some(&[("test_label", "v2")]), None);
        let samples = vec![
            sample("testmetric", 13.0, &[("test_label", "v1")]),
            sample("testmetric", 1.0, &[("test_label", "v2")]),
        ];
        let out = t.process_all(samples);
        pretty_assert_eq!(out.len(), 1);
        pretty_assert_eq!(out[0].properties.get("what").map(String::as_str), Some("testmetric"));
        pretty_assert_eq!(out[0].properties.get("test_label").map(String::as_str), Some("v2"));
    }

    #[test]
    fn test_infinity_dropped() {
        let t = transformer(None, None);
        let out = t.process_all(vec![sample("testmetric", f64::INFINITY, &[])]);
        pretty_assert_eq!(out.len(), 0);
    }

    #[test]
    fn test_too_many_labels_dropped() {
        let t = transformer(None, None);
        let extra: Vec<(String, String)> = (0..21).map(|i| (format!("l{i}"), "v".to_string())).collect();
        let extra_refs: Vec<(&str, &str)> = extra.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        let out = t.process_all(vec![sample("testmetric", 1.0, &extra_refs)]);
        pretty_assert_eq!(out.len(), 0);
    }

    #[test]
    fn test_tag_extraction() {
        let t = transformer(None, None);
        let out = t.process_all(vec![sample("testmetric", 1.0, &[("anodot_tag_x", "v")])]);
        pretty_assert_eq!(out.len(), 1);
        pretty_assert_eq!(out[0].tags.get("x").map(String::as_str), Some("v"));
        assert!(!out[0].properties.contains_key("x"));
        assert!(!out[0].properties.contains_key("anodot_tag_x"));
    }

    #[test]
    fn test_timestamp_conversion() {
        let t = transformer(None, None);
        let out = t.process_all(vec![sample("testmetric", 1.0, &[])]);
        pretty_assert_eq!(out[0].timestamp, 1);
    }
}
