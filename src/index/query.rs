// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Query AST for the search index.
//!
//! Small on purpose: it covers what the sync pipeline and parent-scoped reads
//! need, and translates one-to-one to the Elasticsearch query DSL.
//!
//! # Example
//!
//! ```rust
//! use plan_sync::index::IndexQuery;
//! use serde_json::json;
//!
//! // All services whose join relation points at plan-1
//! let q = IndexQuery::children_of("plan-1");
//! assert_eq!(q.to_dsl(), json!({"parent_id": {"type": "service", "id": "plan-1"}}));
//!
//! // svc-1, but only while it is a child of an existing plan-1
//! let q = IndexQuery::child_of("svc-1", "plan-1");
//! assert!(q.to_dsl()["bool"]["must"].is_array());
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{PLAN_RELATION, SERVICE_RELATION};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IndexQuery {
    MatchAll,
    /// Document id in the given set.
    Ids(Vec<String>),
    /// Exact value on a (dotted) source field.
    Term { field: String, value: Value },
    /// Children of `child_type` whose join parent is `parent_id`.
    ParentId { child_type: String, parent_id: String },
    /// Children whose parent (of `parent_type`) matches `query`.
    HasParent { parent_type: String, query: Box<IndexQuery> },
    /// All clauses must match.
    And(Vec<IndexQuery>),
}

impl IndexQuery {
    pub fn ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Ids(ids.into_iter().map(Into::into).collect())
    }

    pub fn term(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Term {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Every service document joined to `parent_id`.
    pub fn children_of(parent_id: impl Into<String>) -> Self {
        Self::ParentId {
            child_type: SERVICE_RELATION.to_string(),
            parent_id: parent_id.into(),
        }
    }

    /// One service, constrained to children of an indexed plan `parent_id`.
    pub fn child_of(child_id: impl Into<String>, parent_id: impl Into<String>) -> Self {
        Self::And(vec![
            Self::Ids(vec![child_id.into()]),
            Self::HasParent {
                parent_type: PLAN_RELATION.to_string(),
                query: Box::new(Self::Ids(vec![parent_id.into()])),
            },
        ])
    }

    #[must_use]
    pub fn and(self, other: IndexQuery) -> Self {
        match self {
            Self::And(mut clauses) => {
                clauses.push(other);
                Self::And(clauses)
            }
            first => Self::And(vec![first, other]),
        }
    }

    /// Elasticsearch query DSL for this node.
    #[must_use]
    pub fn to_dsl(&self) -> Value {
        match self {
            Self::MatchAll => json!({"match_all": {}}),
            Self::Ids(ids) => json!({"ids": {"values": ids}}),
            Self::Term { field, value } => json!({"term": { field.as_str(): value }}),
            Self::ParentId { child_type, parent_id } => {
                json!({"parent_id": {"type": child_type, "id": parent_id}})
            }
            Self::HasParent { parent_type, query } => {
                json!({"has_parent": {"parent_type": parent_type, "query": query.to_dsl()}})
            }
            Self::And(clauses) => {
                let must: Vec<Value> = clauses.iter().map(IndexQuery::to_dsl).collect();
                json!({"bool": {"must": must}})
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_dsl() {
        assert_eq!(IndexQuery::ids(["a", "b"]).to_dsl(), json!({"ids": {"values": ["a", "b"]}}));
    }

    #[test]
    fn test_term_dsl() {
        assert_eq!(
            IndexQuery::term("planType", "inNetwork").to_dsl(),
            json!({"term": {"planType": "inNetwork"}})
        );
    }

    #[test]
    fn test_child_of_dsl() {
        assert_eq!(
            IndexQuery::child_of("svc-1", "plan-1").to_dsl(),
            json!({"bool": {"must": [
                {"ids": {"values": ["svc-1"]}},
                {"has_parent": {"parent_type": "plan", "query": {"ids": {"values": ["plan-1"]}}}}
            ]}})
        );
    }

    #[test]
    fn test_and_flattens() {
        let q = IndexQuery::term("a", 1).and(IndexQuery::term("b", 2)).and(IndexQuery::MatchAll);
        match q {
            IndexQuery::And(clauses) => assert_eq!(clauses.len(), 3),
            other => panic!("expected And, got {:?}", other),
        }
    }
}
