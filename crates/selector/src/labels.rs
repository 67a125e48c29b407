//! Label requirements: operator parsing, Kubernetes-style validation and matching.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::NodeSelectorRequirement;
use once_cell::sync::Lazy;
use regex::Regex;
use smallvec::SmallVec;

use crate::path::{FieldError, FieldPath};

const NAME_MAX_LEN: usize = 63;
const PREFIX_MAX_LEN: usize = 253;

static QUALIFIED_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([A-Za-z0-9][-A-Za-z0-9_.]*)?[A-Za-z0-9]$").expect("qualified name regex")
});
static DNS_SUBDOMAIN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$").expect("dns subdomain regex")
});
static LABEL_VALUE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(([A-Za-z0-9][-A-Za-z0-9_.]*)?[A-Za-z0-9])?$").expect("label value regex")
});

/// Operators accepted in `matchExpressions`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LabelOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
    GreaterThan,
    LessThan,
}

impl LabelOperator {
    pub const SUPPORTED: &'static [&'static str] = &["In", "NotIn", "Exists", "DoesNotExist", "Gt", "Lt"];

    pub fn parse(op: &str) -> Option<Self> {
        match op {
            "In" => Some(Self::In),
            "NotIn" => Some(Self::NotIn),
            "Exists" => Some(Self::Exists),
            "DoesNotExist" => Some(Self::DoesNotExist),
            "Gt" => Some(Self::GreaterThan),
            "Lt" => Some(Self::LessThan),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::In => "In",
            Self::NotIn => "NotIn",
            Self::Exists => "Exists",
            Self::DoesNotExist => "DoesNotExist",
            Self::GreaterThan => "Gt",
            Self::LessThan => "Lt",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Predicate {
    In(BTreeSet<String>),
    NotIn(BTreeSet<String>),
    Exists,
    DoesNotExist,
    GreaterThan(i64),
    LessThan(i64),
}

/// One validated `key <op> values` clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelRequirement {
    key: String,
    predicate: Predicate,
}

impl LabelRequirement {
    /// Validate and build a requirement; every problem found is returned, not just the first.
    pub fn new(key: &str, op: LabelOperator, values: &[String], path: &FieldPath) -> Result<Self, Vec<FieldError>> {
        let mut errs = validate_label_key(key, &path.child("key"));
        let values_path = path.child("values");

        match op {
            LabelOperator::In | LabelOperator::NotIn => {
                if values.is_empty() {
                    errs.push(FieldError::invalid(values_path.clone(), &values, "for 'in', 'notin' operators, values set can't be empty"));
                }
            }
            LabelOperator::Exists | LabelOperator::DoesNotExist => {
                if !values.is_empty() {
                    errs.push(FieldError::invalid(values_path.clone(), &values, "values set must be empty for exists and does not exist"));
                }
            }
            LabelOperator::GreaterThan | LabelOperator::LessThan => {
                if values.len() != 1 {
                    errs.push(FieldError::invalid(values_path.clone(), &values, "for 'Gt', 'Lt' operators, exactly one value is required"));
                }
                for (i, v) in values.iter().enumerate() {
                    if v.parse::<i64>().is_err() {
                        errs.push(FieldError::invalid(values_path.index(i), v, "for 'Gt', 'Lt' operators, the value must be an integer"));
                    }
                }
            }
        }
        for (i, v) in values.iter().enumerate() {
            errs.extend(validate_label_value(v, &values_path.index(i)));
        }
        if !errs.is_empty() {
            return Err(errs);
        }

        let set = || values.iter().cloned().collect::<BTreeSet<_>>();
        // Gt/Lt parse was checked above.
        let bound = || values.first().and_then(|v| v.parse::<i64>().ok()).unwrap_or_default();
        let predicate = match op {
            LabelOperator::In => Predicate::In(set()),
            LabelOperator::NotIn => Predicate::NotIn(set()),
            LabelOperator::Exists => Predicate::Exists,
            LabelOperator::DoesNotExist => Predicate::DoesNotExist,
            LabelOperator::GreaterThan => Predicate::GreaterThan(bound()),
            LabelOperator::LessThan => Predicate::LessThan(bound()),
        };
        Ok(Self { key: key.to_string(), predicate })
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let actual = labels.get(&self.key);
        match &self.predicate {
            Predicate::In(set) => actual.map(|v| set.contains(v)).unwrap_or(false),
            Predicate::NotIn(set) => actual.map(|v| !set.contains(v)).unwrap_or(true),
            Predicate::Exists => actual.is_some(),
            Predicate::DoesNotExist => actual.is_none(),
            // Non-integer label values never satisfy an ordering.
            Predicate::GreaterThan(bound) => actual.and_then(|v| v.parse::<i64>().ok()).map(|n| n > *bound).unwrap_or(false),
            Predicate::LessThan(bound) => actual.and_then(|v| v.parse::<i64>().ok()).map(|n| n < *bound).unwrap_or(false),
        }
    }
}

/// Conjunction of label requirements from one term.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: SmallVec<[LabelRequirement; 4]>,
}

impl LabelSelector {
    /// Compile `matchExpressions`; requirements are indexed under `path`.
    pub fn compile(exprs: &[NodeSelectorRequirement], path: &FieldPath) -> Result<Self, Vec<FieldError>> {
        let mut errs = Vec::new();
        let mut requirements = SmallVec::new();
        for (i, expr) in exprs.iter().enumerate() {
            let p = path.index(i);
            let Some(op) = LabelOperator::parse(&expr.operator) else {
                errs.push(FieldError::not_supported(p.child("operator"), &expr.operator, LabelOperator::SUPPORTED));
                continue;
            };
            let values = expr.values.as_deref().unwrap_or_default();
            match LabelRequirement::new(&expr.key, op, values, &p) {
                Ok(r) => requirements.push(r),
                Err(e) => errs.extend(e),
            }
        }
        if errs.is_empty() { Ok(Self { requirements }) } else { Err(errs) }
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }
}

fn validate_label_key(key: &str, path: &FieldPath) -> Vec<FieldError> {
    let mut errs = Vec::new();
    let parts: Vec<&str> = key.split('/').collect();
    let name = match parts.as_slice() {
        [name] => *name,
        [prefix, name] => {
            if prefix.is_empty() {
                errs.push(FieldError::invalid(path.clone(), &key, "prefix part must be non-empty"));
            } else if prefix.len() > PREFIX_MAX_LEN {
                errs.push(FieldError::invalid(path.clone(), &key, format!("prefix part must be no more than {} characters", PREFIX_MAX_LEN)));
            } else if !DNS_SUBDOMAIN.is_match(prefix) {
                errs.push(FieldError::invalid(path.clone(), &key, "prefix part must be a lowercase RFC 1123 subdomain"));
            }
            *name
        }
        _ => {
            errs.push(FieldError::invalid(
                path.clone(),
                &key,
                "a qualified name must consist of alphanumeric characters, '-', '_' or '.', with an optional DNS subdomain prefix and '/'",
            ));
            return errs;
        }
    };
    if name.is_empty() {
        errs.push(FieldError::invalid(path.clone(), &key, "name part must be non-empty"));
    } else if name.len() > NAME_MAX_LEN {
        errs.push(FieldError::invalid(path.clone(), &key, format!("name part must be no more than {} characters", NAME_MAX_LEN)));
    } else if !QUALIFIED_NAME.is_match(name) {
        errs.push(FieldError::invalid(
            path.clone(),
            &key,
            "name part must consist of alphanumeric characters, '-', '_' or '.', and must start and end with an alphanumeric character",
        ));
    }
    errs
}

fn validate_label_value(value: &str, path: &FieldPath) -> Option<FieldError> {
    if value.len() > NAME_MAX_LEN {
        return Some(FieldError::invalid(path.clone(), &value, format!("must be no more than {} characters", NAME_MAX_LEN)));
    }
    if !LABEL_VALUE.is_match(value) {
        return Some(FieldError::invalid(
            path.clone(),
            &value,
            "a valid label must be an empty string or consist of alphanumeric characters, '-', '_' or '.', and must start and end with an alphanumeric character",
        ));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect()
    }

    fn vals(v: &[&str]) -> Vec<String> { v.iter().map(|s| s.to_string()).collect() }

    fn req(key: &str, op: LabelOperator, v: &[&str]) -> LabelRequirement {
        LabelRequirement::new(key, op, &vals(v), &FieldPath::root("m")).unwrap()
    }

    #[test]
    fn set_operators() {
        let l = labels(&[("region", "eu"), ("tier", "gold")]);
        assert!(req("region", LabelOperator::In, &["eu", "us"]).matches(&l));
        assert!(!req("region", LabelOperator::In, &["us"]).matches(&l));
        assert!(!req("zone", LabelOperator::In, &["a"]).matches(&l));
        assert!(req("region", LabelOperator::NotIn, &["us"]).matches(&l));
        assert!(req("zone", LabelOperator::NotIn, &["a"]).matches(&l), "absent key satisfies NotIn");
        assert!(!req("tier", LabelOperator::NotIn, &["gold"]).matches(&l));
    }

    #[test]
    fn existence_operators() {
        let l = labels(&[("gpu", "")]);
        assert!(req("gpu", LabelOperator::Exists, &[]).matches(&l));
        assert!(!req("gpu", LabelOperator::DoesNotExist, &[]).matches(&l));
        assert!(req("fpga", LabelOperator::DoesNotExist, &[]).matches(&l));
    }

    #[test]
    fn ordering_operators_compare_integers() {
        let l = labels(&[("cores", "16"), ("flavor", "large")]);
        assert!(req("cores", LabelOperator::GreaterThan, &["8"]).matches(&l));
        assert!(!req("cores", LabelOperator::GreaterThan, &["16"]).matches(&l));
        assert!(req("cores", LabelOperator::LessThan, &["17"]).matches(&l));
        assert!(!req("flavor", LabelOperator::LessThan, &["100"]).matches(&l));
        assert!(!req("missing", LabelOperator::GreaterThan, &["-1"]).matches(&l));
    }

    #[test]
    fn arity_and_value_validation() {
        let p = FieldPath::root("t");
        assert!(LabelRequirement::new("k", LabelOperator::In, &[], &p).is_err());
        assert!(LabelRequirement::new("k", LabelOperator::Exists, &vals(&["x"]), &p).is_err());
        assert!(LabelRequirement::new("k", LabelOperator::GreaterThan, &vals(&["1", "2"]), &p).is_err());

        let errs = LabelRequirement::new("k", LabelOperator::LessThan, &vals(&["ten"]), &p).unwrap_err();
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].path().as_str(), "t.values[0]");
        assert!(errs[0].to_string().contains("must be an integer"));

        let errs = LabelRequirement::new("k", LabelOperator::In, &vals(&["bad value!"]), &p).unwrap_err();
        assert_eq!(errs[0].path().as_str(), "t.values[0]");
    }

    #[test]
    fn key_validation() {
        let p = FieldPath::root("t");
        assert!(LabelRequirement::new("topology.kubernetes.io/region", LabelOperator::Exists, &[], &p).is_ok());
        let long = "x".repeat(64);
        for bad in ["", "-lead", "a/b/c", "/name", "UPPER.Prefix/name", long.as_str()] {
            let errs = LabelRequirement::new(bad, LabelOperator::Exists, &[], &p).unwrap_err();
            assert_eq!(errs[0].path().as_str(), "t.key", "key {:?}", bad);
        }
    }

    #[test]
    fn unsupported_operator_is_structured() {
        let exprs = vec![
            NodeSelectorRequirement { key: "a".into(), operator: "Like".into(), values: Some(vals(&["x"])) },
            NodeSelectorRequirement { key: "b".into(), operator: "In".into(), values: None },
        ];
        let errs = LabelSelector::compile(&exprs, &FieldPath::root("matchExpressions")).unwrap_err();
        assert_eq!(errs.len(), 2, "all requirement errors are collected");
        assert!(matches!(&errs[0], FieldError::NotSupported { value, .. } if value == "Like"));
        assert_eq!(errs[0].path().as_str(), "matchExpressions[0].operator");
        assert_eq!(errs[1].path().as_str(), "matchExpressions[1].values");
    }
}
