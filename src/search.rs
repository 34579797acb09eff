//! Result index: a thin `reqwest`-based HTTP client over a
//! Meilisearch-compatible document index, rather than embedding a
//! full-text engine in-process.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SearchError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchDocument {
    pub job_id: Uuid,
    pub user_id: String,
    pub filename: Option<String>,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub job_id: Uuid,
    pub filename: Option<String>,
    pub snippet: String,
}

#[async_trait]
pub trait ResultIndex: Send + Sync {
    async fn index(&self, doc: SearchDocument) -> Result<(), SearchError>;
    async fn remove(&self, job_id: Uuid) -> Result<(), SearchError>;
    async fn search(&self, user_id: &str, query: &str, limit: usize) -> Result<Vec<SearchHit>, SearchError>;
}

pub struct MeilisearchIndex {
    client: reqwest::Client,
    endpoint: String,
    index_name: String,
}

impl MeilisearchIndex {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            index_name: "pipeline_documents".to_string(),
        }
    }

    fn documents_url(&self) -> String {
        format!("{}/indexes/{}/documents", self.endpoint, self.index_name)
    }

    fn search_url(&self) -> String {
        format!("{}/indexes/{}/search", self.endpoint, self.index_name)
    }
}

#[derive(Serialize)]
struct IndexedDocument<'a> {
    id: Uuid,
    user_id: &'a str,
    filename: Option<&'a str>,
    content: &'a str,
}

#[derive(Serialize)]
struct SearchRequest<'a> {
    q: &'a str,
    filter: String,
    limit: usize,
}

#[derive(Deserialize)]
struct SearchResponse {
    hits: Vec<SearchResponseHit>,
}

#[derive(Deserialize)]
struct SearchResponseHit {
    id: Uuid,
    filename: Option<String>,
    #[serde(default)]
    content: String,
}

#[async_trait]
impl ResultIndex for MeilisearchIndex {
    async fn index(&self, doc: SearchDocument) -> Result<(), SearchError> {
        let payload = vec![IndexedDocument {
            id: doc.job_id,
            user_id: &doc.user_id,
            filename: doc.filename.as_deref(),
            content: &doc.content,
        }];

        let response = self
            .client
            .post(self.documents_url())
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(SearchError::Backend(format!(
                "index request failed with status {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn remove(&self, job_id: Uuid) -> Result<(), SearchError> {
        let url = format!("{}/{}", self.documents_url(), job_id);
        let response = self.client.delete(url).send().await?;
        if !response.status().is_success() && response.status().as_u16() != 404 {
            return Err(SearchError::Backend(format!(
                "delete request failed with status {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn search(&self, user_id: &str, query: &str, limit: usize) -> Result<Vec<SearchHit>, SearchError> {
        let request = SearchRequest {
            q: query,
            filter: format!("user_id = \"{user_id}\""),
            limit,
        };

        let response = self.client.post(self.search_url()).json(&request).send().await?;
        if !response.status().is_success() {
            return Err(SearchError::Backend(format!(
                "search request failed with status {}",
                response.status()
            )));
        }

        let parsed: SearchResponse = response.json().await?;
        Ok(parsed
            .hits
            .into_iter()
            .map(|hit| SearchHit {
                job_id: hit.id,
                filename: hit.filename,
                snippet: hit.content.chars().take(240).collect(),
            })
            .collect())
    }
}

/// In-memory result index for tests.
#[derive(Default)]
pub struct InMemoryResultIndex {
    docs: tokio::sync::RwLock<Vec<SearchDocument>>,
}

impl InMemoryResultIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResultIndex for InMemoryResultIndex {
    async fn index(&self, doc: SearchDocument) -> Result<(), SearchError> {
        let mut docs = self.docs.write().await;
        docs.retain(|d| d.job_id != doc.job_id);
        docs.push(doc);
        Ok(())
    }

    async fn remove(&self, job_id: Uuid) -> Result<(), SearchError> {
        self.docs.write().await.retain(|d| d.job_id != job_id);
        Ok(())
    }

    async fn search(&self, user_id: &str, query: &str, limit: usize) -> Result<Vec<SearchHit>, SearchError> {
        let docs = self.docs.read().await;
        let needle = query.to_lowercase();
        Ok(docs
            .iter()
            .filter(|d| d.user_id == user_id)
            .filter(|d| d.content.to_lowercase().contains(&needle))
            .take(limit)
            .map(|d| SearchHit {
                job_id: d.job_id,
                filename: d.filename.clone(),
                snippet: d.content.chars().take(240).collect(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_index_scopes_search_to_owner() {
        let index = InMemoryResultIndex::new();
        let job_a = Uuid::new_v4();
        let job_b = Uuid::new_v4();

        index
            .index(SearchDocument {
                job_id: job_a,
                user_id: "alice".to_string(),
                filename: Some("a.pdf".to_string()),
                content: "quarterly revenue report".to_string(),
            })
            .await
            .unwrap();
        index
            .index(SearchDocument {
                job_id: job_b,
                user_id: "bob".to_string(),
                filename: Some("b.pdf".to_string()),
                content: "quarterly revenue report".to_string(),
            })
            .await
            .unwrap();

        let hits = index.search("alice", "revenue", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].job_id, job_a);
    }
}
