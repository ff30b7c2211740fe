// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory search index with join semantics.
//!
//! Mirrors the behavior the sync worker relies on from Elasticsearch:
//! - a child (join object form) cannot be written without routing equal to
//!   its parent id
//! - `has_parent` only matches children whose parent document is indexed
//! - `parent_id` matches on the join relation alone, parent present or not
//! - partial updates deep-merge objects and replace everything else

use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use super::{join_name, join_parent, IndexError, IndexHit, IndexQuery, SearchIndex};

#[derive(Debug, Clone)]
struct Stored {
    source: Value,
    routing: Option<String>,
}

pub struct InMemoryIndex {
    docs: DashMap<String, Stored>,
}

impl InMemoryIndex {
    #[must_use]
    pub fn new() -> Self {
        Self { docs: DashMap::new() }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.docs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Every document, sorted by id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<IndexHit> {
        let mut hits: Vec<IndexHit> = self
            .docs
            .iter()
            .map(|entry| IndexHit {
                id: entry.key().clone(),
                routing: entry.value().routing.clone(),
                source: entry.value().source.clone(),
            })
            .collect();
        hits.sort_by(|a, b| a.id.cmp(&b.id));
        hits
    }

    fn check_routing(id: &str, body: &Value, routing: Option<&str>) -> Result<(), IndexError> {
        if let Some(parent) = join_parent(body) {
            if routing != Some(parent) {
                return Err(IndexError::MissingRouting {
                    id: id.to_string(),
                    parent: parent.to_string(),
                });
            }
        }
        Ok(())
    }

    fn lookup(&self, id: &str, routing: Option<&str>) -> Option<Stored> {
        self.docs
            .get(id)
            .filter(|entry| entry.routing.as_deref() == routing)
            .map(|entry| entry.value().clone())
    }
}

impl Default for InMemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

/// Recursive object merge; arrays and scalars in `patch` replace the target.
fn deep_merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                match target.get_mut(key) {
                    Some(existing) if existing.is_object() && value.is_object() => deep_merge(existing, value),
                    _ => {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

fn field_path<'a>(source: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(source, |value, segment| value.get(segment))
}

fn matches(id: &str, doc: &Stored, query: &IndexQuery, all: &HashMap<String, Stored>) -> bool {
    match query {
        IndexQuery::MatchAll => true,
        IndexQuery::Ids(ids) => ids.iter().any(|candidate| candidate == id),
        IndexQuery::Term { field, value } => match field_path(&doc.source, field) {
            Some(Value::Array(items)) => items.contains(value),
            Some(found) => found == value,
            None => false,
        },
        IndexQuery::ParentId { child_type, parent_id } => {
            join_name(&doc.source) == Some(child_type.as_str())
                && join_parent(&doc.source) == Some(parent_id.as_str())
        }
        IndexQuery::HasParent { parent_type, query } => {
            let Some(parent_id) = join_parent(&doc.source) else {
                return false;
            };
            match all.get(parent_id) {
                Some(parent) => {
                    join_name(&parent.source) == Some(parent_type.as_str())
                        && matches(parent_id, parent, query, all)
                }
                None => false,
            }
        }
        IndexQuery::And(clauses) => clauses.iter().all(|clause| matches(id, doc, clause, all)),
    }
}

#[async_trait]
impl SearchIndex for InMemoryIndex {
    async fn index_doc(&self, id: &str, body: &Value, routing: Option<&str>) -> Result<(), IndexError> {
        Self::check_routing(id, body, routing)?;
        self.docs.insert(
            id.to_string(),
            Stored {
                source: body.clone(),
                routing: routing.map(str::to_string),
            },
        );
        Ok(())
    }

    async fn update_doc(&self, id: &str, partial: &Value, routing: Option<&str>, upsert: bool) -> Result<(), IndexError> {
        let source = match self.lookup(id, routing) {
            Some(mut existing) => {
                deep_merge(&mut existing.source, partial);
                existing.source
            }
            None if upsert => partial.clone(),
            None => return Err(IndexError::NotFound(id.to_string())),
        };
        Self::check_routing(id, &source, routing)?;
        self.docs.insert(
            id.to_string(),
            Stored {
                source,
                routing: routing.map(str::to_string),
            },
        );
        Ok(())
    }

    async fn delete_doc(&self, id: &str, routing: Option<&str>) -> Result<(), IndexError> {
        self.docs.remove_if(id, |_, stored| stored.routing.as_deref() == routing);
        Ok(())
    }

    async fn get_doc(&self, id: &str, routing: Option<&str>) -> Result<Option<IndexHit>, IndexError> {
        Ok(self.lookup(id, routing).map(|stored| IndexHit {
            id: id.to_string(),
            routing: stored.routing,
            source: stored.source,
        }))
    }

    async fn search(&self, query: &IndexQuery) -> Result<Vec<IndexHit>, IndexError> {
        let all: HashMap<String, Stored> = self
            .docs
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut hits: Vec<IndexHit> = all
            .iter()
            .filter(|(id, doc)| matches(id, doc, query, &all))
            .map(|(id, doc)| IndexHit {
                id: id.clone(),
                routing: doc.routing.clone(),
                source: doc.source.clone(),
            })
            .collect();
        hits.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(hits)
    }

    async fn delete_by_query(&self, query: &IndexQuery) -> Result<u64, IndexError> {
        let hits = self.search(query).await?;
        let mut deleted = 0u64;
        for hit in hits {
            if self.docs.remove(&hit.id).is_some() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}
