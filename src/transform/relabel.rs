//! Prometheus-style label relabeling: replace, keep, drop, hashmod,
//! labelmap, labeldrop, labelkeep.

use std::fmt;

use md5::{Digest, Md5};
use regex::Regex;
use serde::de::Error as SerdeError;
use serde::{Deserialize, Deserializer};

use crate::model::Sample;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelabelAction {
    Replace,
    Keep,
    Drop,
    Hashmod,
    Labelmap,
    Labeldrop,
    Labelkeep,
}

impl fmt::Display for RelabelAction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            RelabelAction::Replace => "replace",
            RelabelAction::Keep => "keep",
            RelabelAction::Drop => "drop",
            RelabelAction::Hashmod => "hashmod",
            RelabelAction::Labelmap => "labelmap",
            RelabelAction::Labeldrop => "labeldrop",
            RelabelAction::Labelkeep => "labelkeep",
        };
        write!(f, "{s}")
    }
}

fn anchored_regex<'de, D>(deserializer: D) -> Result<Regex, D::Error>
where
    D: Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    let anchored = format!("^(?:{s})$");
    Regex::new(&anchored).map_err(D::Error::custom)
}

fn default_source_labels() -> Vec<String> {
    vec!["__name__".to_string()]
}

fn default_separator() -> String {
    ";".to_string()
}

fn default_regex() -> Regex {
    Regex::new("^(?:(.*))$").unwrap()
}

fn default_replacement() -> String {
    "$1".to_string()
}

fn default_action() -> RelabelAction {
    RelabelAction::Replace
}

/// A single relabel rule, as loaded from YAML. `source_labels` is kept
/// as `Option` so validation can tell "omitted" from "explicitly set
/// to the default", which matters for `labeldrop`/`labelkeep`.
#[derive(Debug, Clone, Deserialize)]
pub struct RawRelabelRule {
    pub source_labels: Option<Vec<String>>,
    #[serde(default = "default_separator")]
    pub separator: String,
    #[serde(default = "default_regex", deserialize_with = "anchored_regex")]
    pub regex: Regex,
    #[serde(default)]
    pub modulus: u64,
    #[serde(default)]
    pub target_label: String,
    #[serde(default = "default_replacement")]
    pub replacement: String,
    #[serde(default = "default_action")]
    pub action: RelabelAction,
}

/// A validated relabel rule, ready to apply.
#[derive(Debug, Clone)]
pub struct RelabelRule {
    pub source_labels: Vec<String>,
    pub separator: String,
    pub regex: Regex,
    pub modulus: u64,
    pub target_label: String,
    pub replacement: String,
    pub action: RelabelAction,
}

#[derive(Debug)]
pub enum RelabelRuleError {
    ZeroModulus,
    MissingTargetLabel(RelabelAction),
    InvalidTargetLabel(String, RelabelAction),
    InvalidReplacement(String),
    ExtraFieldsOnLabelAction(RelabelAction),
}

impl fmt::Display for RelabelRuleError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RelabelRuleError::ZeroModulus => {
                write!(f, "relabel configuration for hashmod requires non-zero modulus")
            }
            RelabelRuleError::MissingTargetLabel(a) => {
                write!(f, "relabel configuration for {a} action requires 'target_label' value")
            }
            RelabelRuleError::InvalidTargetLabel(t, a) => {
                write!(f, "{t:?} is invalid 'target_label' for {a} action")
            }
            RelabelRuleError::InvalidReplacement(r) => {
                write!(f, "{r:?} is invalid 'replacement' for labelmap action")
            }
            RelabelRuleError::ExtraFieldsOnLabelAction(a) => {
                write!(f, "{a} action requires only 'regex', and no other fields")
            }
        }
    }
}

impl std::error::Error for RelabelRuleError {}

fn valid_label_name_template(s: &str) -> bool {
    // Mirrors the target-label grammar: letters, digits, underscore,
    // and `$name`/`${name}` capture-group references.
    static PATTERN: &str = r"^(?:(?:[a-zA-Z_]|\$(?:\{\w+\}|\w+))+\w*)+$";
    lazy_static::lazy_static! {
        static ref RE: Regex = Regex::new(PATTERN).unwrap();
    }
    RE.is_match(s)
}

impl TryFrom<RawRelabelRule> for RelabelRule {
    type Error = RelabelRuleError;

    fn try_from(raw: RawRelabelRule) -> Result<Self, Self::Error> {
        use RelabelAction::*;

        if raw.action == Hashmod && raw.modulus == 0 {
            return Err(RelabelRuleError::ZeroModulus);
        }
        if (raw.action == Replace || raw.action == Hashmod) && raw.target_label.is_empty() {
            return Err(RelabelRuleError::MissingTargetLabel(raw.action));
        }
        if raw.action == Replace && !valid_label_name_template(&raw.target_label) {
            return Err(RelabelRuleError::InvalidTargetLabel(
                raw.target_label.clone(),
                raw.action,
            ));
        }
        if raw.action == Hashmod && !is_valid_label_name(&raw.target_label) {
            return Err(RelabelRuleError::InvalidTargetLabel(
                raw.target_label.clone(),
                raw.action,
            ));
        }
        if raw.action == Labelmap && !valid_label_name_template(&raw.replacement) {
            return Err(RelabelRuleError::InvalidReplacement(raw.replacement.clone()));
        }
        if matches!(raw.action, Labeldrop | Labelkeep)
            && (raw.source_labels.is_some()
                || !raw.target_label.is_empty()
                || raw.modulus != 0
                || raw.separator != default_separator()
                || raw.replacement != default_replacement())
        {
            return Err(RelabelRuleError::ExtraFieldsOnLabelAction(raw.action));
        }

        Ok(RelabelRule {
            source_labels: raw.source_labels.unwrap_or_else(default_source_labels),
            separator: raw.separator,
            regex: raw.regex,
            modulus: raw.modulus,
            target_label: raw.target_label,
            replacement: raw.replacement,
            action: raw.action,
        })
    }
}

fn is_valid_label_name(s: &str) -> bool {
    lazy_static::lazy_static! {
        static ref RE: Regex = Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").unwrap();
    }
    !s.is_empty() && RE.is_match(s)
}

fn label_value(sample: &Sample, name: &str) -> String {
    sample.get(name).unwrap_or("").to_string()
}

/// Sum the last 8 bytes of a 16-byte MD5 digest, big-endian, into a
/// u64. This mirrors a Go shift-by-`(15-i)*8` accumulation over all
/// 16 bytes: shifts of 64 or more on a `uint64` are defined to yield
/// zero, so only bytes 8..16 ever contribute.
fn sum64(digest: [u8; 16]) -> u64 {
    u64::from_be_bytes(digest[8..16].try_into().unwrap())
}

/// Apply one rule to a sample's label set. Returns `false` if the
/// sample should be dropped.
pub fn apply_rule(sample: &mut Sample, rule: &RelabelRule) -> bool {
    let values: Vec<String> = rule
        .source_labels
        .iter()
        .map(|name| label_value(sample, name))
        .collect();
    let val = values.join(&rule.separator);

    match rule.action {
        RelabelAction::Drop => {
            if rule.regex.is_match(&val) {
                return false;
            }
        }
        RelabelAction::Keep => {
            if !rule.regex.is_match(&val) {
                return false;
            }
        }
        RelabelAction::Replace => {
            if let Some(caps) = rule.regex.captures(&val) {
                let mut target = String::new();
                caps.expand(&rule.target_label, &mut target);
                if !is_valid_label_name(&target) {
                    sample.remove(&rule.target_label);
                } else {
                    let mut replacement = String::new();
                    caps.expand(&rule.replacement, &mut replacement);
                    if replacement.is_empty() {
                        sample.remove(&rule.target_label);
                    } else {
                        sample.set(&target, replacement);
                    }
                }
            }
        }
        RelabelAction::Hashmod => {
            let mut hasher = Md5::new();
            hasher.update(val.as_bytes());
            let digest: [u8; 16] = hasher.finalize().into();
            let modded = sum64(digest) % rule.modulus;
            sample.set(&rule.target_label, modded.to_string());
        }
        RelabelAction::Labelmap => {
            let matches: Vec<(String, String)> = sample
                .labels
                .iter()
                .filter(|(name, _)| rule.regex.is_match(name))
                .map(|(name, value)| {
                    let new_name = rule.regex.replace(name, rule.replacement.as_str()).into_owned();
                    (new_name, value.clone())
                })
                .collect();
            for (name, value) in matches {
                sample.set(&name, value);
            }
        }
        RelabelAction::Labeldrop => {
            sample.labels.retain(|(name, _)| !rule.regex.is_match(name));
        }
        RelabelAction::Labelkeep => {
            sample.labels.retain(|(name, _)| rule.regex.is_match(name));
        }
    }
    true
}

/// Apply an ordered list of rules. Returns `false` if the sample was
/// dropped by any rule along the way.
pub fn apply(sample: &mut Sample, rules: &[RelabelRule]) -> bool {
    for rule in rules {
        if !apply_rule(sample, rule) {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;

    fn rule(yaml: &str) -> RelabelRule {
        let raw: RawRelabelRule = serde_yaml::from_str(yaml).unwrap();
        RelabelRule::try_from(raw).unwrap()
    }

    fn sample(pairs: &[(&str, &str)]) -> Sample {
        Sample {
            labels: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            timestamp_ms: 0,
            value: 0.0,
        }
    }

    #[test]
    fn test_replace() {
        let r = rule(
            r#"
source_labels: [a]
regex: "f(.*)"
target_label: d
replacement: "ch${1}-ch${1}"
action: replace
"#,
        );
        let mut s = sample(&[("a", "foo"), ("b", "bar"), ("c", "baz")]);
        assert!(apply_rule(&mut s, &r));
        pretty_assert_eq!(s.get("d"), Some("choo-choo"));
        pretty_assert_eq!(s.get("a"), Some("foo"));
    }

    #[test]
    fn test_drop() {
        let r = rule("regex: \"foo\"\naction: drop\nsource_labels: [a]\n");
        let mut s = sample(&[("a", "foo")]);
        assert!(!apply_rule(&mut s, &r));
    }

    #[test]
    fn test_keep() {
        let r = rule("regex: \"foo\"\naction: keep\nsource_labels: [a]\n");
        let mut miss = sample(&[("a", "bar")]);
        assert!(!apply_rule(&mut miss, &r));
        let mut hit = sample(&[("a", "foo")]);
        assert!(apply_rule(&mut hit, &r));
    }

    #[test]
    fn test_hashmod() {
        let r = rule(
            r#"
source_labels: [a]
action: hashmod
modulus: 100
target_label: shard
"#,
        );
        let mut s = sample(&[("a", "foo")]);
        assert!(apply_rule(&mut s, &r));
        let shard: u64 = s.get("shard").unwrap().parse().unwrap();
        assert!(shard < 100);
    }

    #[test]
    fn test_labeldrop() {
        let r = rule("regex: \"^tmp_.*$\"\naction: labeldrop\n");
        let mut s = sample(&[("a", "1"), ("tmp_x", "2")]);
        assert!(apply_rule(&mut s, &r));
        pretty_assert_eq!(s.get("tmp_x"), None);
        pretty_assert_eq!(s.get("a"), Some("1"));
    }

    #[test]
    fn test_labelkeep() {
        let r = rule("regex: \"^a$\"\naction: labelkeep\n");
        let mut s = sample(&[("a", "1"), ("b", "2")]);
        assert!(apply_rule(&mut s, &r));
        pretty_assert_eq!(s.get("b"), None);
        pretty_assert_eq!(s.get("a"), Some("1"));
    }

    #[test]
    fn test_labelmap() {
        let r = rule("regex: \"^meta_(.*)$\"\naction: labelmap\nreplacement: \"$1\"\n");
        let mut s = sample(&[("meta_env", "prod")]);
        assert!(apply_rule(&mut s, &r));
        pretty_assert_eq!(s.get("env"), Some("prod"));
        pretty_assert_eq!(s.get("meta_env"), Some("prod"));
    }

    #[test]
    fn test_labeldrop_rejects_extra_fields() {
        let raw: RawRelabelRule = serde_yaml::from_str(
            "regex: \"x\"\naction: labeldrop\ntarget_label: oops\n",
        )
        .unwrap();
        assert!(RelabelRule::try_from(raw).is_err());
    }

    #[test]
    fn test_hashmod_requires_modulus() {
        let raw: RawRelabelRule = serde_yaml::from_str(
            "action: hashmod\ntarget_label: shard\n",
        )
        .unwrap();
        assert!(RelabelRule::try_from(raw).is_err());
    }
}
