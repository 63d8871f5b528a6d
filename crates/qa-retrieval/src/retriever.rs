use crate::index::{IndexHit, VectorIndex};
use qa_core::{RetrievedChunk, SearchStrategy};
use qa_error::{QaError, Result};
use qa_llm::EmbedModel;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// 检索器配置：融合权重与重试参数
#[derive(Debug, Clone)]
pub struct RetrieverConfig {
    /// 混合检索中向量信号的权重
    pub vector_weight: f32,
    /// 混合检索中词汇信号的权重
    pub lexical_weight: f32,
    /// 各引擎召回量 = top_k * multiplier，给融合留余量
    pub retrieval_multiplier: f32,
    pub max_attempts: u32,
    pub retry_base_ms: u64,
    pub timeout_ms: u64,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            vector_weight: 0.7,
            lexical_weight: 0.3,
            retrieval_multiplier: 2.0,
            max_attempts: 3,
            retry_base_ms: 200,
            timeout_ms: 10_000,
        }
    }
}

/// 检索器：把查询向量化后按策略执行向量/混合检索，
/// 输出分数单调不增的分块列表。
pub struct Retriever {
    index: Arc<dyn VectorIndex>,
    embed: Arc<dyn EmbedModel>,
    config: RetrieverConfig,
}

/// 词汇分数无上界，按最大值缩放到 [0, 1]，保留相对比例
fn scale_by_max(hits: &mut [IndexHit]) {
    let max = hits.iter().map(|h| h.score).fold(0.0f32, f32::max);
    if max <= f32::EPSILON {
        return;
    }
    for hit in hits.iter_mut() {
        hit.score /= max;
    }
}

fn to_chunks(hits: Vec<IndexHit>, top_k: usize) -> Vec<RetrievedChunk> {
    hits.into_iter()
        .take(top_k)
        .enumerate()
        .map(|(rank, hit)| RetrievedChunk {
            source_id: hit.source_id,
            document_title: hit.document_title,
            text: hit.text,
            score: hit.score.clamp(0.0, 1.0),
            rank,
        })
        .collect()
}

impl Retriever {
    pub fn new(
        index: Arc<dyn VectorIndex>,
        embed: Arc<dyn EmbedModel>,
        config: RetrieverConfig,
    ) -> Self {
        Self {
            index,
            embed,
            config,
        }
    }

    /// 执行检索。失败时对可重试错误做有界指数退避，整体受超时约束。
    #[instrument(skip(self))]
    pub async fn retrieve(
        &self,
        namespace: &str,
        query: &str,
        strategy: SearchStrategy,
        top_k: usize,
    ) -> Result<Vec<RetrievedChunk>> {
        let timeout = Duration::from_millis(self.config.timeout_ms);
        tokio::time::timeout(timeout, self.retrieve_with_retry(namespace, query, strategy, top_k))
            .await
            .map_err(|_| QaError::Timeout {
                operation: "retrieve".to_string(),
                timeout_ms: self.config.timeout_ms,
            })?
    }

    async fn retrieve_with_retry(
        &self,
        namespace: &str,
        query: &str,
        strategy: SearchStrategy,
        top_k: usize,
    ) -> Result<Vec<RetrievedChunk>> {
        let mut last_err: Option<QaError> = None;
        for attempt in 1..=self.config.max_attempts {
            match self.retrieve_once(namespace, query, strategy, top_k).await {
                Ok(chunks) => {
                    info!(
                        namespace,
                        strategy = strategy.as_str(),
                        results = chunks.len(),
                        attempt,
                        "检索完成"
                    );
                    return Ok(chunks);
                }
                Err(e) if e.is_retryable() && attempt < self.config.max_attempts => {
                    let backoff =
                        Duration::from_millis(self.config.retry_base_ms * 2u64.pow(attempt - 1));
                    warn!(
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "检索失败，退避后重试"
                    );
                    tokio::time::sleep(backoff).await;
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| QaError::RetrievalFailed {
            operation: "retrieve".to_string(),
            message: "重试次数耗尽".to_string(),
            retry_after: None,
        }))
    }

    async fn retrieve_once(
        &self,
        namespace: &str,
        query: &str,
        strategy: SearchStrategy,
        top_k: usize,
    ) -> Result<Vec<RetrievedChunk>> {
        let embeddings = self
            .embed
            .embed(&[query.to_string()])
            .await
            .map_err(|e| match e {
                e @ QaError::GenerationFailed { .. } | e @ QaError::Network { .. } => {
                    QaError::RetrievalFailed {
                        operation: "embed_query".to_string(),
                        message: e.to_string(),
                        retry_after: e.retry_after(),
                    }
                }
                other => other,
            })?;
        let query_embedding = embeddings.into_iter().next().ok_or_else(|| {
            QaError::RetrievalFailed {
                operation: "embed_query".to_string(),
                message: "嵌入服务返回空结果".to_string(),
                retry_after: None,
            }
        })?;

        match strategy {
            SearchStrategy::SemanticOnly => {
                let hits = self.index.search(namespace, &query_embedding, top_k).await?;
                Ok(to_chunks(hits, top_k))
            }
            SearchStrategy::Hybrid | SearchStrategy::HybridNoRerank => {
                self.hybrid_retrieve(namespace, query, &query_embedding, top_k)
                    .await
            }
        }
    }

    /// 混合检索：向量侧保留原始余弦分数（截断到 [0, 1]），
    /// 词汇侧按最大值缩放，加权求和融合。权重和为 1 时融合分数
    /// 保持在 [0, 1]，且不会抬高绝对置信度——与查询无关的语料
    /// 融合后依然是低分，拦截阈值才有意义。
    async fn hybrid_retrieve(
        &self,
        namespace: &str,
        query: &str,
        query_embedding: &[f32],
        top_k: usize,
    ) -> Result<Vec<RetrievedChunk>> {
        let fetch_k = ((top_k as f32) * self.config.retrieval_multiplier).ceil() as usize;

        let (vector_hits, lexical_hits) = tokio::join!(
            self.index.search(namespace, query_embedding, fetch_k),
            self.index.keyword_search(namespace, query, fetch_k),
        );
        let vector_hits = vector_hits?;
        let mut lexical_hits = lexical_hits?;

        debug!(
            vector = vector_hits.len(),
            lexical = lexical_hits.len(),
            "两路召回完成"
        );

        scale_by_max(&mut lexical_hits);

        // 按分块 id 融合加权分数
        let mut fused: HashMap<Uuid, IndexHit> = HashMap::new();
        for mut hit in vector_hits {
            hit.score = hit.score.clamp(0.0, 1.0) * self.config.vector_weight;
            fused.insert(hit.id, hit);
        }
        for hit in lexical_hits {
            let weighted = hit.score * self.config.lexical_weight;
            fused
                .entry(hit.id)
                .and_modify(|existing| existing.score += weighted)
                .or_insert_with(|| {
                    let mut h = hit;
                    h.score = weighted;
                    h
                });
        }

        let mut hits: Vec<IndexHit> = fused.into_values().collect();
        crate::index::sort_hits(&mut hits);
        Ok(to_chunks(hits, top_k))
    }
}
