//! Rewrites or drops samples based on a Kubernetes pod-name mapping
//! fetched periodically by [`crate::pod_mapping`].

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use lazy_static::lazy_static;
use regex::Regex;

use crate::metrics;
use crate::model::Sample;

lazy_static! {
    static ref STATEFULSET_SUFFIX: Regex = Regex::new(r"^.+-\d+$").unwrap();
}

/// (namespace, pod_name) -> rewritten pod name.
pub type PodKey = (String, String);

/// An atomically-swappable snapshot of the whitelisted/excluded pod
/// tables fetched from the relabel service.
#[derive(Default)]
pub struct PodMappingSnapshot {
    whitelisted: RwLock<HashMap<PodKey, String>>,
    excluded: RwLock<HashMap<PodKey, String>>,
}

impl PodMappingSnapshot {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn replace(&self, whitelisted: HashMap<PodKey, String>, excluded: HashMap<PodKey, String>) {
        *self.whitelisted.write().unwrap() = whitelisted;
        *self.excluded.write().unwrap() = excluded;
    }

    fn lookup(table: &RwLock<HashMap<PodKey, String>>, namespace: &str, pod_name: &str) -> Option<String> {
        let guard = table.read().unwrap();
        if let Some(v) = guard.get(&(namespace.to_string(), pod_name.to_string())) {
            return Some(v.clone());
        }
        // Ambiguous across namespaces (more than one match) counts as absent.
        let mut matches = guard.iter().filter(|((_, p), _)| p == pod_name);
        let first = matches.next();
        match (first, matches.next()) {
            (Some((_, v)), None) => Some(v.clone()),
            _ => None,
        }
    }

    pub fn lookup_excluded(&self, namespace: &str, pod_name: &str) -> Option<String> {
        Self::lookup(&self.excluded, namespace, pod_name)
    }

    pub fn lookup_whitelisted(&self, namespace: &str, pod_name: &str) -> Option<String> {
        Self::lookup(&self.whitelisted, namespace, pod_name)
    }
}

const ORIGINAL_POD_NAME_TAG: &str = "anodot_tag_originalPodName";

/// Mutate `sample` in place based on its `pod`/`pod_name` label.
/// Returns `false` if the sample should be dropped.
pub fn apply(sample: &mut Sample, snapshot: &PodMappingSnapshot) -> bool {
    let pod_label = sample
        .labels
        .iter()
        .find(|(k, _)| k == "pod" || k == "pod_name")
        .map(|(k, _)| k.clone());

    let Some(pod_label) = pod_label else {
        return true;
    };
    let pod_name = sample.get(&pod_label).unwrap().to_string();

    if STATEFULSET_SUFFIX.is_match(&pod_name) {
        return true;
    }

    let namespace = sample.get("namespace").unwrap_or("").to_string();

    if snapshot.lookup_excluded(&namespace, &pod_name).is_some() {
        return true;
    }

    if let Some(rewritten) = snapshot.lookup_whitelisted(&namespace, &pod_name) {
        if !rewritten.is_empty() {
            sample.set(&pod_label, rewritten);
        }
        sample.set(ORIGINAL_POD_NAME_TAG, pod_name);
        return true;
    }

    metrics::KUBERNETES_RELABELING_METRICS_DROPPED.inc();
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;

    fn sample(pod: &str, namespace: &str) -> Sample {
        Sample {
            labels: vec![
                ("pod".to_string(), pod.to_string()),
                ("namespace".to_string(), namespace.to_string()),
            ],
            timestamp_ms: 0,
            value: 1.0,
        }
    }

    #[test]
    fn test_statefulset_suffix_untouched() {
        let snap = PodMappingSnapshot::default();
        let mut s = sample("web-0", "default");
        assert!(apply(&mut s, &snap));
        pretty_assert_eq!(s.get("pod"), Some("web-0"));
    }

    #[test]
    fn test_whitelisted_rewrite() {
        let snap = PodMappingSnapshot::default();
        let mut whitelisted = HashMap::new();
        whitelisted.insert(("default".to_string(), "api-7f8".to_string()), "api".to_string());
        snap.replace(whitelisted, HashMap::new());

        let mut s = sample("api-7f8", "default");
        assert!(apply(&mut s, &snap));
        pretty_assert_eq!(s.get("pod"), Some("api"));
        pretty_assert_eq!(s.get(ORIGINAL_POD_NAME_TAG), Some("api-7f8"));
    }

    #[test]
    fn test_excluded_passes_through_untouched() {
        let snap = PodMappingSnapshot::default();
        let mut excluded = HashMap::new();
        excluded.insert(("default".to_string(), "noisy-xyz".to_string()), String::new());
        snap.replace(HashMap::new(), excluded);

        let mut s = sample("noisy-xyz", "default");
        assert!(apply(&mut s, &snap));
        pretty_assert_eq!(s.get("pod"), Some("noisy-xyz"));
    }

    #[test]
    fn test_unmapped_is_dropped() {
        let snap = PodMappingSnapshot::default();
        let mut s = sample("ghost-abc", "default");
        assert!(!apply(&mut s, &snap));
    }

    #[test]
    fn test_ambiguous_across_namespaces_is_absent() {
        let snap = PodMappingSnapshot::default();
        let mut whitelisted = HashMap::new();
        whitelisted.insert(("ns1".to_string(), "svc-abc".to_string()), "svc".to_string());
        whitelisted.insert(("ns2".to_string(), "svc-abc".to_string()), "svc".to_string());
        snap.replace(whitelisted, HashMap::new());

        let mut s = sample("svc-abc", "unknown-ns");
        assert!(!apply(&mut s, &snap));
    }

    #[test]
    fn test_no_pod_label_is_noop() {
        let snap = PodMappingSnapshot::default();
        let mut s = Sample {
            labels: vec![("__name__".to_string(), "up".to_string())],
            timestamp_ms: 0,
            value: 1.0,
        };
        assert!(apply(&mut s, &snap));
    }
}
