//! Field requirements: single-value equality over the fields a candidate exposes.

use fleetmap_core::FieldSet;
use k8s_openapi::api::core::v1::NodeSelectorRequirement;
use smallvec::SmallVec;

use crate::path::{FieldError, FieldPath};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldOperator {
    In,
    NotIn,
}

impl FieldOperator {
    pub const SUPPORTED: &'static [&'static str] = &["In", "NotIn"];

    pub fn parse(op: &str) -> Option<Self> {
        match op {
            "In" => Some(Self::In),
            "NotIn" => Some(Self::NotIn),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRequirement {
    key: String,
    op: FieldOperator,
    value: String,
}

impl FieldRequirement {
    /// A field the candidate does not expose reads as the empty string.
    pub fn matches(&self, fields: &FieldSet<'_>) -> bool {
        let actual = fields.get(&self.key).unwrap_or("");
        match self.op {
            FieldOperator::In => actual == self.value,
            FieldOperator::NotIn => actual != self.value,
        }
    }
}

/// Conjunction of field requirements from one term.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldSelector {
    requirements: SmallVec<[FieldRequirement; 2]>,
}

impl FieldSelector {
    /// Compile `matchFields`. Each requirement must carry exactly one value.
    pub fn compile(exprs: &[NodeSelectorRequirement], path: &FieldPath) -> Result<Self, Vec<FieldError>> {
        let mut errs = Vec::new();
        let mut requirements = SmallVec::new();
        for (i, expr) in exprs.iter().enumerate() {
            let p = path.index(i);
            let Some(op) = FieldOperator::parse(&expr.operator) else {
                errs.push(FieldError::not_supported(p.child("operator"), &expr.operator, FieldOperator::SUPPORTED));
                continue;
            };
            match expr.values.as_deref().unwrap_or_default() {
                [value] => requirements.push(FieldRequirement { key: expr.key.clone(), op, value: value.clone() }),
                other => errs.push(FieldError::invalid(p.child("values"), &other, "must have one element")),
            }
        }
        if errs.is_empty() { Ok(Self { requirements }) } else { Err(errs) }
    }

    pub fn matches(&self, fields: &FieldSet<'_>) -> bool {
        self.requirements.iter().all(|r| r.matches(fields))
    }
}
