use crate::config::Settings;
use crate::http::build_client;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("http error: {0}")]
    Http(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Color palette attached to a template. Slots in the skeleton reference
/// these by name.
#[derive(Debug, Clone, Deserialize)]
pub struct Palette {
    pub primary: String,
    pub secondary: String,
    pub text: String,
}

impl Default for Palette {
    fn default() -> Self {
        Self {
            primary: "#1a1a2e".into(),
            secondary: "#e9e9ef".into(),
            text: "#222222".into(),
        }
    }
}

/// A design template returned by the vector index, with its semantic
/// distance to the query (lower is closer).
#[derive(Debug, Clone)]
pub struct TemplateMatch {
    pub template_id: String,
    pub block_type: String,
    pub html: String,
    pub palette: Palette,
    pub distance: f64,
}

#[async_trait]
pub trait TemplateSearch: Send + Sync {
    async fn query(&self, text: &str, n_results: usize)
    -> Result<Vec<TemplateMatch>, SearchError>;
}

/// Chroma-compatible vector index over the template library.
pub struct ChromaBackend {
    http: Client,
    base_url: String,
    collection: String,
}

impl ChromaBackend {
    pub fn from_env() -> Self {
        Self {
            http: build_client(),
            base_url: std::env::var("TEMPLATE_INDEX_URL")
                .unwrap_or_else(|_| "http://localhost:8001".into())
                .trim_end_matches('/')
                .to_string(),
            collection: std::env::var("TEMPLATE_COLLECTION")
                .unwrap_or_else(|_| "page-templates".into()),
        }
    }
}

#[derive(Debug, Serialize)]
struct QueryRequest<'a> {
    query_texts: [&'a str; 1],
    n_results: usize,
    include: [&'a str; 3],
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    ids: Vec<Vec<String>>,
    documents: Vec<Vec<String>>,
    metadatas: Vec<Vec<Value>>,
    distances: Vec<Vec<f64>>,
}

#[async_trait]
impl TemplateSearch for ChromaBackend {
    async fn query(
        &self,
        text: &str,
        n_results: usize,
    ) -> Result<Vec<TemplateMatch>, SearchError> {
        let body = QueryRequest {
            query_texts: [text],
            n_results,
            include: ["documents", "metadatas", "distances"],
        };
        let response = self
            .http
            .post(format!(
                "{}/api/v1/collections/{}/query",
                self.base_url, self.collection
            ))
            .json(&body)
            .send()
            .await
            .map_err(|err| SearchError::Http(err.to_string()))?;
        if !response.status().is_success() {
            return Err(SearchError::Http(format!("HTTP {}", response.status())));
        }
        let payload: QueryResponse = response
            .json()
            .await
            .map_err(|err| SearchError::InvalidResponse(err.to_string()))?;

        let ids = payload.ids.into_iter().next().unwrap_or_default();
        let documents = payload.documents.into_iter().next().unwrap_or_default();
        let metadatas = payload.metadatas.into_iter().next().unwrap_or_default();
        let distances = payload.distances.into_iter().next().unwrap_or_default();

        let mut matches = Vec::with_capacity(ids.len());
        for (i, id) in ids.into_iter().enumerate() {
            let Some(distance) = distances.get(i).copied() else {
                continue;
            };
            let metadata = metadatas.get(i);
            matches.push(TemplateMatch {
                template_id: id,
                block_type: metadata
                    .and_then(|m| m.get("block_type"))
                    .and_then(Value::as_str)
                    .unwrap_or("generic")
                    .to_string(),
                html: documents.get(i).cloned().unwrap_or_default(),
                palette: metadata
                    .and_then(|m| m.get("palette"))
                    .and_then(|p| serde_json::from_value(p.clone()).ok())
                    .unwrap_or_default(),
                distance,
            });
        }
        Ok(matches)
    }
}

/// Relevance-gated template lookup: over-fetches from the index, keeps only
/// matches under the distance threshold, and returns the closest few in a
/// deterministic order.
pub struct RecommendationEngine {
    backend: Arc<dyn TemplateSearch>,
    distance_threshold: f64,
    top_k: usize,
}

impl RecommendationEngine {
    pub fn new(backend: Arc<dyn TemplateSearch>, settings: &Settings) -> Self {
        Self {
            backend,
            distance_threshold: f64::from(settings.distance_threshold),
            top_k: settings.top_k,
        }
    }

    /// The index regularly scores near-misses just past the cutoff, so fetch
    /// well past `top_k` before filtering.
    fn fetch_count(&self) -> usize {
        (self.top_k * 3).max(10)
    }

    pub async fn recommend(&self, query: &str) -> Vec<TemplateMatch> {
        let raw = match self.backend.query(query, self.fetch_count()).await {
            Ok(matches) => matches,
            Err(err) => {
                warn!(
                    target = "pagecraft.templates",
                    error = %err,
                    "template index unreachable, recommending nothing"
                );
                return Vec::new();
            }
        };
        let fetched = raw.len();
        let mut kept: Vec<TemplateMatch> = raw
            .into_iter()
            .filter(|m| m.distance <= self.distance_threshold)
            .collect();
        kept.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.template_id.cmp(&b.template_id))
        });
        kept.truncate(self.top_k);
        debug!(
            target = "pagecraft.templates",
            fetched,
            kept = kept.len(),
            "template recommendation"
        );
        kept
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub struct ScriptedSearch {
        pub matches: Vec<TemplateMatch>,
        pub unreachable: bool,
    }

    impl ScriptedSearch {
        pub fn with(matches: Vec<(&str, f64)>) -> Self {
            Self {
                matches: matches
                    .into_iter()
                    .map(|(id, distance)| TemplateMatch {
                        template_id: id.to_string(),
                        block_type: "generic".into(),
                        html: format!(
                            "<section style=\"color:{{text}};background:{{secondary}}\">\
                             <h2 style=\"color:{{primary}}\">{{title}}</h2>{{body}}\
                             <!-- {id} --></section>"
                        ),
                        palette: Palette::default(),
                        distance,
                    })
                    .collect(),
                unreachable: false,
            }
        }

        pub fn unreachable() -> Self {
            Self {
                matches: Vec::new(),
                unreachable: true,
            }
        }
    }

    #[async_trait]
    impl TemplateSearch for ScriptedSearch {
        async fn query(
            &self,
            _text: &str,
            n_results: usize,
        ) -> Result<Vec<TemplateMatch>, SearchError> {
            if self.unreachable {
                return Err(SearchError::Http("connection refused".into()));
            }
            Ok(self.matches.iter().take(n_results).cloned().collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedSearch;
    use super::*;

    fn engine(backend: ScriptedSearch) -> RecommendationEngine {
        RecommendationEngine::new(Arc::new(backend), &Settings::default())
    }

    #[tokio::test]
    async fn far_matches_are_dropped() {
        let engine = engine(ScriptedSearch::with(vec![
            ("tpl-a", 0.9),
            ("tpl-b", 2.0),
            ("tpl-c", 1.5),
        ]));
        let out = engine.recommend("hero section").await;
        let ids: Vec<_> = out.iter().map(|m| m.template_id.as_str()).collect();
        // 1.5 sits exactly on the threshold and is kept; 2.0 is not.
        assert_eq!(ids, vec!["tpl-a", "tpl-c"]);
    }

    #[tokio::test]
    async fn results_sorted_by_distance_then_id() {
        let engine = engine(ScriptedSearch::with(vec![
            ("tpl-z", 0.5),
            ("tpl-a", 0.5),
            ("tpl-m", 0.2),
            ("tpl-b", 0.8),
        ]));
        let out = engine.recommend("specs table").await;
        let ids: Vec<_> = out.iter().map(|m| m.template_id.as_str()).collect();
        assert_eq!(ids, vec!["tpl-m", "tpl-a", "tpl-z"]);
    }

    #[tokio::test]
    async fn truncates_to_top_k() {
        let engine = engine(ScriptedSearch::with(vec![
            ("t1", 0.1),
            ("t2", 0.2),
            ("t3", 0.3),
            ("t4", 0.4),
            ("t5", 0.5),
        ]));
        assert_eq!(engine.recommend("faq").await.len(), 3);
    }

    #[tokio::test]
    async fn unreachable_index_yields_empty() {
        let engine = engine(ScriptedSearch::unreachable());
        assert!(engine.recommend("intro").await.is_empty());
    }

    #[tokio::test]
    async fn recommendation_is_deterministic() {
        let matches = vec![("b", 0.4), ("a", 0.4), ("c", 0.1)];
        let first = engine(ScriptedSearch::with(matches.clone()))
            .recommend("q")
            .await;
        let second = engine(ScriptedSearch::with(matches)).recommend("q").await;
        let ids = |v: &[TemplateMatch]| {
            v.iter()
                .map(|m| m.template_id.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(ids(&first), ids(&second));
    }
}
