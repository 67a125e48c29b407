//! fleetmap selector: compile a cluster selector (a Kubernetes `NodeSelector`) once and
//! evaluate it against virtual-node candidates.
//!
//! Terms are OR-ed, requirements inside a term are AND-ed. Compile errors stay attached to
//! the term that produced them and only surface when no term matches.

#![forbid(unsafe_code)]

pub mod fields;
pub mod labels;
pub mod path;

use fleetmap_core::{Candidate, FieldSet};
use k8s_openapi::api::core::v1::{NodeSelector, NodeSelectorTerm};

pub use fields::{FieldOperator, FieldSelector};
pub use labels::{LabelOperator, LabelRequirement, LabelSelector};
pub use path::{FieldError, FieldPath, SelectorErrors};

/// Executable form of a cluster selector.
#[derive(Debug, Clone)]
pub struct CompiledSelector {
    /// The source expression had no terms at all.
    match_all: bool,
    terms: Vec<CompiledTerm>,
}

#[derive(Debug, Clone, Default)]
struct CompiledTerm {
    labels: Option<LabelSelector>,
    fields: Option<FieldSelector>,
    errors: Vec<FieldError>,
}

enum TermOutcome<'a> {
    Matched,
    Missed,
    Invalid(&'a [FieldError]),
}

impl CompiledTerm {
    fn compile(term: &NodeSelectorTerm, path: &FieldPath) -> Self {
        let mut out = CompiledTerm::default();
        if let Some(exprs) = term.match_expressions.as_deref().filter(|e| !e.is_empty()) {
            match LabelSelector::compile(exprs, &path.child("matchExpressions")) {
                Ok(s) => out.labels = Some(s),
                Err(e) => out.errors.extend(e),
            }
        }
        if let Some(exprs) = term.match_fields.as_deref().filter(|e| !e.is_empty()) {
            match FieldSelector::compile(exprs, &path.child("matchFields")) {
                Ok(s) => out.fields = Some(s),
                Err(e) => out.errors.extend(e),
            }
        }
        out
    }

    fn evaluate(&self, labels: &std::collections::BTreeMap<String, String>, fields: &FieldSet<'_>) -> TermOutcome<'_> {
        if !self.errors.is_empty() {
            return TermOutcome::Invalid(&self.errors);
        }
        if let Some(l) = &self.labels {
            if !l.matches(labels) { return TermOutcome::Missed; }
        }
        // An empty observed field set has nothing to contradict the field requirements.
        if let Some(f) = &self.fields {
            if !fields.is_empty() && !f.matches(fields) { return TermOutcome::Missed; }
        }
        TermOutcome::Matched
    }
}

fn is_degenerate(term: &NodeSelectorTerm) -> bool {
    term.match_expressions.as_ref().map_or(true, Vec::is_empty) && term.match_fields.as_ref().map_or(true, Vec::is_empty)
}

impl CompiledSelector {
    pub fn compile(selector: &NodeSelector) -> Self {
        Self::compile_at(selector, &FieldPath::default())
    }

    /// Compile with error paths rooted at `root` (e.g. `spec.clusterSelector`).
    pub fn compile_at(selector: &NodeSelector, root: &FieldPath) -> Self {
        let base = root.child("nodeSelectorTerms");
        let terms = selector
            .node_selector_terms
            .iter()
            .enumerate()
            .filter(|(_, t)| !is_degenerate(t))
            .map(|(i, t)| CompiledTerm::compile(t, &base.index(i)))
            .collect();
        Self { match_all: selector.node_selector_terms.is_empty(), terms }
    }

    /// Number of non-degenerate terms retained after compilation.
    pub fn term_count(&self) -> usize { self.terms.len() }

    pub fn matches_everything(&self) -> bool { self.match_all }

    /// Evaluate against one candidate. The first matching term wins and masks errors from
    /// other terms; errors are returned only when nothing matched.
    pub fn matches(&self, candidate: Option<&Candidate>) -> Result<bool, SelectorErrors> {
        let Some(candidate) = candidate else { return Ok(false) };
        if self.match_all {
            return Ok(true);
        }
        let fields = candidate.fields();
        let mut errs: Vec<FieldError> = Vec::new();
        for term in &self.terms {
            match term.evaluate(&candidate.labels, &fields) {
                TermOutcome::Matched => return Ok(true),
                TermOutcome::Missed => {}
                TermOutcome::Invalid(e) => errs.extend_from_slice(e),
            }
        }
        match SelectorErrors::collect(errs) {
            Some(e) => Err(e),
            None => Ok(false),
        }
    }
}

/// One-shot compile and match. An expression without terms matches before the candidate
/// is looked at, so it holds even for an absent candidate.
pub fn match_selector_terms(candidate: Option<&Candidate>, selector: &NodeSelector) -> Result<bool, SelectorErrors> {
    if selector.node_selector_terms.is_empty() {
        return Ok(true);
    }
    CompiledSelector::compile(selector).matches(candidate)
}
