//! Field paths and the structured errors reported against them.

use std::fmt;

/// Dotted path into the selector document, e.g. `nodeSelectorTerms[0].matchFields[1].values`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct FieldPath(String);

impl FieldPath {
    /// Parse a dotted root such as `spec.clusterSelector`. Empty input yields the empty root.
    pub fn root(path: &str) -> Self { Self(path.to_string()) }

    pub fn child(&self, name: &str) -> Self {
        if self.0.is_empty() { Self(name.to_string()) } else { Self(format!("{}.{}", self.0, name)) }
    }

    pub fn index(&self, i: usize) -> Self { Self(format!("{}[{}]", self.0, i)) }

    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

/// A single compile-time problem with one requirement of a selector term.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FieldError {
    #[error("{path}: Invalid value: {value}: {detail}")]
    Invalid { path: FieldPath, value: String, detail: String },
    #[error("{path}: Unsupported value: {value:?}: supported values: {}", quote_all(.supported))]
    NotSupported { path: FieldPath, value: String, supported: &'static [&'static str] },
}

impl FieldError {
    pub fn invalid(path: FieldPath, value: &impl fmt::Debug, detail: impl Into<String>) -> Self {
        FieldError::Invalid { path, value: format!("{:?}", value), detail: detail.into() }
    }

    pub fn not_supported(path: FieldPath, value: &str, supported: &'static [&'static str]) -> Self {
        FieldError::NotSupported { path, value: value.to_string(), supported }
    }

    pub fn path(&self) -> &FieldPath {
        match self {
            FieldError::Invalid { path, .. } | FieldError::NotSupported { path, .. } => path,
        }
    }
}

fn quote_all(values: &[&str]) -> String {
    values.iter().map(|v| format!("{:?}", v)).collect::<Vec<_>>().join(", ")
}

/// Deduplicated aggregate of term errors, surfaced only when no term matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectorErrors(Vec<FieldError>);

impl SelectorErrors {
    /// Collapse duplicates (by rendered message) keeping first-seen order; `None` when empty.
    pub fn collect(errs: Vec<FieldError>) -> Option<Self> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::with_capacity(errs.len());
        for e in errs {
            if seen.insert(e.to_string()) { out.push(e); }
        }
        if out.is_empty() { None } else { Some(Self(out)) }
    }

    pub fn errors(&self) -> &[FieldError] { &self.0 }
    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
}

impl fmt::Display for SelectorErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.as_slice() {
            [single] => write!(f, "{}", single),
            many => {
                f.write_str("[")?;
                for (i, e) in many.iter().enumerate() {
                    if i > 0 { f.write_str(", ")?; }
                    write!(f, "{}", e)?;
                }
                f.write_str("]")
            }
        }
    }
}

impl std::error::Error for SelectorErrors {}
