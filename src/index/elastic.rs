// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Elasticsearch adapter over the REST API.
//!
//! # Requests
//!
//! ```text
//! index_doc        PUT    /{index}/_doc/{id}?refresh=true[&routing=r]
//! update_doc       POST   /{index}/_update/{id}?refresh=true[&routing=r]   {"doc", "doc_as_upsert"}
//! delete_doc       DELETE /{index}/_doc/{id}?refresh=true[&routing=r]      404 is success
//! get_doc          GET    /{index}/_doc/{id}[?routing=r]                   404 is None
//! search           POST   /{index}/_search                                 {"query", "size"}
//! delete_by_query  POST   /{index}/_delete_by_query?refresh=true           {"query"}
//! ```
//!
//! Writes refresh immediately so the next event in the stream (a
//! `has_parent` lookup, say) observes them. Transport errors, `429` and `5xx`
//! responses are retried with [`RetryConfig::query`]; other statuses surface
//! as [`IndexError::Request`].

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{IndexError, IndexHit, IndexQuery, SearchIndex, JOIN_FIELD, PARENT_ID_FIELD, PLAN_RELATION, SERVICE_RELATION};
use crate::document::OBJECT_ID;
use crate::resilience::retry::{retry_if, RetryConfig};

/// Upper bound on hits returned by a single search.
pub const MAX_SEARCH_HITS: usize = 10_000;

#[derive(Clone)]
pub struct ElasticIndex {
    client: Client,
    base_url: Url,
    index: String,
    retry: RetryConfig,
}

impl ElasticIndex {
    pub fn new(base_url: &str, index: &str) -> Result<Self, IndexError> {
        Self::with_client(Client::new(), base_url, index)
    }

    pub fn with_client(client: Client, base_url: &str, index: &str) -> Result<Self, IndexError> {
        let base_url = Url::parse(base_url).map_err(|e| IndexError::Unavailable(format!("invalid index url '{base_url}': {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(IndexError::Unavailable(format!("invalid index url '{base_url}'")));
        }
        Ok(Self {
            client,
            base_url,
            index: index.to_string(),
            retry: RetryConfig::query(),
        })
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn index_name(&self) -> &str {
        &self.index
    }

    /// Create the index with the plan/service join mapping if it does not
    /// exist yet. Returns whether it was created.
    pub async fn ensure_index(&self) -> Result<bool, IndexError> {
        let url = self.url(&[], None, false)?;
        let response = self.send("index_exists", || self.client.head(url.clone())).await?;
        if response.status().is_success() {
            return Ok(false);
        }
        if response.status() != StatusCode::NOT_FOUND {
            return Err(request_error(response).await);
        }

        let body = index_mapping();
        let response = self
            .send("index_create", || self.client.put(url.clone()).json(&body))
            .await?;
        if response.status().is_success() {
            info!(index = %self.index, "Created search index with join mapping");
            return Ok(true);
        }
        let err = request_error(response).await;
        // Lost a creation race with another worker
        if let IndexError::Request { status: 400, body } = &err {
            if body.contains("resource_already_exists_exception") {
                return Ok(false);
            }
        }
        Err(err)
    }

    fn url(&self, segments: &[&str], routing: Option<&str>, refresh: bool) -> Result<Url, IndexError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| IndexError::Unavailable(format!("invalid index url '{}'", self.base_url)))?
            .pop_if_empty()
            .push(&self.index)
            .extend(segments);
        {
            let mut query = url.query_pairs_mut();
            if refresh {
                query.append_pair("refresh", "true");
            }
            if let Some(routing) = routing {
                query.append_pair("routing", routing);
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }
        Ok(url)
    }

    async fn send<F>(&self, operation: &str, build: F) -> Result<Response, IndexError>
    where
        F: Fn() -> RequestBuilder,
    {
        retry_if(operation, &self.retry, IndexError::is_transient, || {
            let request = build();
            async move {
                let response = request
                    .send()
                    .await
                    .map_err(|e| IndexError::Unavailable(e.to_string()))?;
                let status = response.status();
                if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                    return Err(request_error(response).await);
                }
                Ok(response)
            }
        })
        .await
    }

    async fn write(&self, operation: &str, method: Method, url: Url, body: &Value) -> Result<Response, IndexError> {
        self.send(operation, || self.client.request(method.clone(), url.clone()).json(body))
            .await
    }
}

/// Index settings: the plan/service join plus keyword ids.
#[must_use]
pub fn index_mapping() -> Value {
    json!({
        "mappings": {
            "properties": {
                JOIN_FIELD: {
                    "type": "join",
                    "relations": { PLAN_RELATION: SERVICE_RELATION }
                },
                OBJECT_ID: { "type": "keyword" },
                PARENT_ID_FIELD: { "type": "keyword" }
            }
        }
    })
}

async fn request_error(response: Response) -> IndexError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    IndexError::Request { status, body }
}

async fn ensure_success(response: Response) -> Result<Response, IndexError> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(request_error(response).await)
    }
}

async fn json_body(response: Response) -> Result<Value, IndexError> {
    response
        .json::<Value>()
        .await
        .map_err(|e| IndexError::Response(e.to_string()))
}

fn parse_hit(hit: &Value) -> Result<IndexHit, IndexError> {
    let id = hit
        .get("_id")
        .and_then(Value::as_str)
        .ok_or_else(|| IndexError::Response(format!("hit without _id: {hit}")))?;
    Ok(IndexHit {
        id: id.to_string(),
        routing: hit.get("_routing").and_then(Value::as_str).map(str::to_string),
        source: hit.get("_source").cloned().unwrap_or(Value::Null),
    })
}

/// Hits of a `_search` response body.
pub fn parse_hits(body: &Value) -> Result<Vec<IndexHit>, IndexError> {
    body.pointer("/hits/hits")
        .and_then(Value::as_array)
        .ok_or_else(|| IndexError::Response("search response without hits.hits".to_string()))?
        .iter()
        .map(parse_hit)
        .collect()
}

#[async_trait]
impl SearchIndex for ElasticIndex {
    async fn index_doc(&self, id: &str, body: &Value, routing: Option<&str>) -> Result<(), IndexError> {
        let url = self.url(&["_doc", id], routing, true)?;
        let response = self.write("index_doc", Method::PUT, url, body).await?;
        ensure_success(response).await?;
        debug!(index = %self.index, id, routing, "Indexed document");
        Ok(())
    }

    async fn update_doc(&self, id: &str, partial: &Value, routing: Option<&str>, upsert: bool) -> Result<(), IndexError> {
        let url = self.url(&["_update", id], routing, true)?;
        let body = json!({"doc": partial, "doc_as_upsert": upsert});
        let response = self.write("update_doc", Method::POST, url, &body).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(IndexError::NotFound(id.to_string()));
        }
        ensure_success(response).await?;
        debug!(index = %self.index, id, routing, upsert, "Updated document");
        Ok(())
    }

    async fn delete_doc(&self, id: &str, routing: Option<&str>) -> Result<(), IndexError> {
        let url = self.url(&["_doc", id], routing, true)?;
        let response = self.send("delete_doc", || self.client.delete(url.clone())).await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!(index = %self.index, id, "Delete of absent document");
            return Ok(());
        }
        ensure_success(response).await?;
        Ok(())
    }

    async fn get_doc(&self, id: &str, routing: Option<&str>) -> Result<Option<IndexHit>, IndexError> {
        let url = self.url(&["_doc", id], routing, false)?;
        let response = self.send("get_doc", || self.client.get(url.clone())).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = json_body(ensure_success(response).await?).await?;
        if body.get("found").and_then(Value::as_bool) != Some(true) {
            return Ok(None);
        }
        parse_hit(&body).map(Some)
    }

    async fn search(&self, query: &IndexQuery) -> Result<Vec<IndexHit>, IndexError> {
        let url = self.url(&["_search"], None, false)?;
        let body = json!({"query": query.to_dsl(), "size": MAX_SEARCH_HITS});
        let response = self.write("search", Method::POST, url, &body).await?;
        let body = json_body(ensure_success(response).await?).await?;
        parse_hits(&body)
    }

    async fn delete_by_query(&self, query: &IndexQuery) -> Result<u64, IndexError> {
        let url = self.url(&["_delete_by_query"], None, true)?;
        let body = json!({"query": query.to_dsl()});
        let response = self.write("delete_by_query", Method::POST, url, &body).await?;
        let body = json_body(ensure_success(response).await?).await?;
        body.get("deleted")
            .and_then(Value::as_u64)
            .ok_or_else(|| IndexError::Response("delete_by_query response without deleted".to_string()))
    }
}
