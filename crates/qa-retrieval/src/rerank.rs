use async_trait::async_trait;
use qa_core::RetrievedChunk;
use qa_error::{QaError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::instrument;

/// 重排器抽象接口。重排只能对既有分块重打分/重排序，不得新增分块。
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(&self, query: &str, chunks: Vec<RetrievedChunk>) -> Result<Vec<RetrievedChunk>>;

    fn name(&self) -> &str;
}

/// 排序并重新编号：分数降序，确定性平手处理
pub fn sort_and_rank(mut chunks: Vec<RetrievedChunk>) -> Vec<RetrievedChunk> {
    chunks.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.source_id.cmp(&b.source_id))
    });
    for (rank, chunk) in chunks.iter_mut().enumerate() {
        chunk.rank = rank;
    }
    chunks
}

/// 关闭重排时的恒等实现：可选阶段作为接口变体，而非散落各处的条件判断
pub struct NoopReranker;

#[async_trait]
impl Reranker for NoopReranker {
    async fn rerank(&self, _query: &str, chunks: Vec<RetrievedChunk>) -> Result<Vec<RetrievedChunk>> {
        Ok(chunks)
    }

    fn name(&self) -> &str {
        "noop"
    }
}

/// 基于关键词重叠的简单重排器，无需外部服务
pub struct KeywordReranker {
    name: String,
    boost_factor: f32,
}

impl KeywordReranker {
    pub fn new(boost_factor: f32) -> Self {
        Self {
            name: "keyword".to_string(),
            boost_factor,
        }
    }

    fn calculate_keyword_score(&self, query: &str, text: &str) -> f32 {
        let query_lower = query.to_lowercase();
        let query_words: Vec<&str> = query_lower.split_whitespace().collect();
        if query_words.is_empty() {
            return 0.0;
        }

        let text_content = text.to_lowercase();
        let matches = query_words
            .iter()
            .filter(|word| text_content.contains(**word))
            .count();

        (matches as f32 / query_words.len() as f32) * self.boost_factor
    }
}

#[async_trait]
impl Reranker for KeywordReranker {
    #[instrument(skip(self, chunks))]
    async fn rerank(
        &self,
        query: &str,
        mut chunks: Vec<RetrievedChunk>,
    ) -> Result<Vec<RetrievedChunk>> {
        // 关键词分数与原始相似度分数结合，截断回 [0, 1]
        for chunk in &mut chunks {
            let keyword_score = self.calculate_keyword_score(query, &chunk.text);
            chunk.score = (chunk.score * (1.0 + keyword_score)).clamp(0.0, 1.0);
        }

        let reranked = sort_and_rank(chunks);

        tracing::debug!(
            results_count = reranked.len(),
            "Keyword reranking completed"
        );

        Ok(reranked)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Cohere API 重排器
pub struct CohereReranker {
    name: String,
    client: reqwest::Client,
    api_key: String,
    model: String,
    api_url: String,
}

#[derive(Serialize)]
struct CohereRerankRequest<'a> {
    model: &'a str,
    query: &'a str,
    documents: Vec<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_n: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    return_documents: Option<bool>,
}

#[derive(Deserialize)]
struct CohereRerankResultItem {
    index: usize,
    relevance_score: f32,
}

#[derive(Deserialize)]
struct CohereRerankResponse {
    results: Vec<CohereRerankResultItem>,
}

impl CohereReranker {
    pub fn new(api_key: String, model: Option<String>) -> Self {
        Self {
            name: "cohere".to_string(),
            client: reqwest::Client::new(),
            api_key,
            model: model.unwrap_or_else(|| "rerank-multilingual-v3.0".to_string()),
            api_url: "https://api.cohere.ai/v1/rerank".to_string(),
        }
    }

    pub fn with_custom_url(mut self, url: String) -> Self {
        self.api_url = url;
        self
    }
}

#[async_trait]
impl Reranker for CohereReranker {
    #[instrument(skip(self, chunks))]
    async fn rerank(&self, query: &str, chunks: Vec<RetrievedChunk>) -> Result<Vec<RetrievedChunk>> {
        if chunks.is_empty() {
            return Ok(chunks);
        }

        let documents: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        let request = CohereRerankRequest {
            model: &self.model,
            query,
            documents,
            top_n: None,
            return_documents: Some(false),
        };

        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .header("Cohere-Version", "2022-12-06")
            .json(&request)
            .send()
            .await
            .map_err(|e| QaError::Network {
                operation: "cohere_rerank".to_string(),
                message: e.to_string(),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(QaError::RetrievalFailed {
                operation: "cohere_rerank".to_string(),
                message: format!("status={}", status),
                retry_after: if status.as_u16() == 429 {
                    Some(std::time::Duration::from_secs(60))
                } else {
                    None
                },
            });
        }

        let cohere_response: CohereRerankResponse =
            response.json().await.map_err(|e| QaError::Serialization {
                format: "json".to_string(),
                message: e.to_string(),
            })?;

        // 仅把返回的 index 映射回输入集合：不会引入新分块
        let mut reranked = Vec::with_capacity(chunks.len());
        for item in cohere_response.results {
            if let Some(mut chunk) = chunks.get(item.index).cloned() {
                chunk.score = item.relevance_score.clamp(0.0, 1.0);
                reranked.push(chunk);
            }
        }

        let reranked = sort_and_rank(reranked);

        tracing::info!(
            original_count = chunks.len(),
            reranked_count = reranked.len(),
            "Cohere reranking completed"
        );

        Ok(reranked)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// 重排器工厂：按生效配置选择实现
pub struct RerankerFactory;

impl RerankerFactory {
    /// rerank 关闭 → Noop；配置了 cohere 模型且有凭证 → Cohere；否则关键词重排
    pub fn create(
        rerank_enabled: bool,
        rerank_model: Option<&str>,
        cohere_api_key: Option<&str>,
    ) -> Arc<dyn Reranker> {
        if !rerank_enabled {
            return Arc::new(NoopReranker);
        }
        match (rerank_model, cohere_api_key) {
            (Some(model), Some(key)) if model.starts_with("rerank") => {
                Arc::new(CohereReranker::new(key.to_string(), Some(model.to_string())))
            }
            (None, Some(key)) => Arc::new(CohereReranker::new(key.to_string(), None)),
            _ => Arc::new(KeywordReranker::new(0.2)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(source: &str, text: &str, score: f32) -> RetrievedChunk {
        RetrievedChunk {
            source_id: source.to_string(),
            document_title: format!("doc-{}", source),
            text: text.to_string(),
            score,
            rank: 0,
        }
    }

    #[tokio::test]
    async fn test_noop_is_identity() {
        let chunks = vec![chunk("s1", "alpha", 0.9), chunk("s2", "beta", 0.5)];
        let out = NoopReranker.rerank("query", chunks.clone()).await.unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].source_id, chunks[0].source_id);
        assert_eq!(out[0].score, chunks[0].score);
    }

    #[tokio::test]
    async fn test_keyword_reranker_promotes_matching_chunk() {
        let chunks = vec![
            chunk("s1", "nothing in common", 0.6),
            chunk("s2", "rust borrow checker details", 0.55),
        ];
        let out = KeywordReranker::new(0.5)
            .rerank("rust borrow checker", chunks)
            .await
            .unwrap();
        assert_eq!(out[0].source_id, "s2");
        // 只重排，不新增
        assert_eq!(out.len(), 2);
        for pair in out.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
        assert_eq!(out[0].rank, 0);
        assert_eq!(out[1].rank, 1);
    }

    #[tokio::test]
    async fn test_keyword_scores_stay_in_unit_range() {
        let chunks = vec![chunk("s1", "rust rust rust", 0.95)];
        let out = KeywordReranker::new(2.0)
            .rerank("rust", chunks)
            .await
            .unwrap();
        assert!(out[0].score <= 1.0);
    }

    #[test]
    fn test_factory_noop_when_disabled() {
        let reranker = RerankerFactory::create(false, Some("rerank-v3"), Some("key"));
        assert_eq!(reranker.name(), "noop");
    }

    #[test]
    fn test_factory_keyword_fallback_without_credentials() {
        let reranker = RerankerFactory::create(true, None, None);
        assert_eq!(reranker.name(), "keyword");
    }

    #[test]
    fn test_factory_cohere_with_model_and_key() {
        let reranker = RerankerFactory::create(true, Some("rerank-multilingual-v3.0"), Some("key"));
        assert_eq!(reranker.name(), "cohere");
    }
}
