// ── Query and watch filters ──

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::{Id, Object};

/// Filter set accepted by the catalog's `Query` and `Watch` operations.
///
/// All populated parts must match. `relation` is resolved by the catalog
/// (it needs the graph); the other parts can be evaluated locally with
/// [`Filters::matches`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filters {
    /// Label equality; every entry must be present on the object.
    pub labels: BTreeMap<String, String>,
    /// Kind selection; empty means any kind.
    pub kinds: Vec<String>,
    /// Aspect presence; the object must carry at least one of these.
    pub with_aspects: Vec<String>,
    /// Graph lookup: objects that are targets of a matching relation.
    pub relation: Option<RelationFilter>,
}

/// Selects the targets of relations with a given source, relation kind,
/// and target entity kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationFilter {
    pub src: Id,
    pub kind: String,
    pub target_kind: String,
}

impl Filters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_kinds<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.kinds = kinds.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_aspects<I, S>(mut self, aspects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.with_aspects = aspects.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_relation(mut self, src: impl Into<Id>, kind: impl Into<String>, target_kind: impl Into<String>) -> Self {
        self.relation = Some(RelationFilter {
            src: src.into(),
            kind: kind.into(),
            target_kind: target_kind.into(),
        });
        self
    }

    /// Evaluate the label, kind, and aspect parts against one object.
    ///
    /// The relation part is ignored here; only the catalog can resolve it.
    pub fn matches(&self, object: &Object) -> bool {
        for (key, value) in &self.labels {
            if object.labels.get(key) != Some(value) {
                return false;
            }
        }
        if !self.kinds.is_empty() && !self.kinds.iter().any(|k| k == object.kind()) {
            return false;
        }
        if !self.with_aspects.is_empty()
            && !self.with_aspects.iter().any(|name| object.aspects.contains(name))
        {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{kind, StratumAgents};

    fn device(id: &str, pod: &str) -> Object {
        Object::entity(id, kind::SWITCH)
            .with_label("pod", pod)
            .with_label("rack", "rack-01-1")
            .with_aspect(&StratumAgents {
                p4rt_endpoint: "sim:20000".into(),
                telemetry_endpoint: "sim:20000".into(),
            })
            .unwrap()
    }

    #[test]
    fn label_equality() {
        let f = Filters::new().with_label("pod", "all");
        assert!(f.matches(&device("spine1", "all")));
        assert!(!f.matches(&device("spine1", "other")));
    }

    #[test]
    fn kind_selection() {
        let f = Filters::new().with_kinds([kind::SWITCH, kind::IPU]);
        assert!(f.matches(&device("spine1", "all")));
        assert!(!f.matches(&Object::entity("p", kind::POD)));
    }

    #[test]
    fn aspect_presence_is_any_of() {
        let f = Filters::new().with_aspects([crate::model::aspect::STRATUM_AGENTS, crate::model::aspect::LOCAL_AGENTS]);
        assert!(f.matches(&device("spine1", "all")));
        assert!(!f.matches(&Object::entity("r", kind::RACK)));
    }

    #[test]
    fn relation_part_is_ignored_locally() {
        let f = Filters::new().with_relation("spine1", kind::HAS, kind::PORT);
        assert!(f.matches(&Object::entity("anything", kind::POD)));
    }
}
