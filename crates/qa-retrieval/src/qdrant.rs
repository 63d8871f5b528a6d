use crate::index::{IndexHit, IndexedChunk, MemoryVectorIndex, VectorIndex};
use async_trait::async_trait;
use qa_error::{QaError, Result};
use qdrant_client::{
    qdrant::{
        vectors_config::Config, with_payload_selector::SelectorOptions, Condition,
        CreateCollection, Distance, Filter, PointStruct, SearchPoints, UpsertPoints, VectorParams,
        VectorsConfig, WithPayloadSelector,
    },
    Payload, Qdrant,
};
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// 基于 Qdrant 的向量索引。namespace 以 payload 过滤实现；
/// 词汇信号由 upsert 时同步维护的进程内倒排索引提供。
pub struct QdrantVectorIndex {
    client: Qdrant,
    collection_name: String,
    vector_size: usize,
    lexical: MemoryVectorIndex,
}

impl QdrantVectorIndex {
    pub async fn new(url: &str, collection_name: String, vector_size: usize) -> Result<Self> {
        let client = Qdrant::from_url(url).build().map_err(|e| QaError::VectorStore {
            operation: "connect".to_string(),
            message: format!("Failed to connect to Qdrant: {}", e),
        })?;

        let index = Self {
            client,
            collection_name,
            vector_size,
            lexical: MemoryVectorIndex::new(),
        };
        index.ensure_collection().await?;
        Ok(index)
    }

    /// 确保 collection 存在
    async fn ensure_collection(&self) -> Result<()> {
        match self.client.collection_exists(&self.collection_name).await {
            Ok(exists) => {
                if !exists {
                    self.create_collection().await?;
                }
            }
            Err(e) => {
                warn!("Failed to check collection existence: {}", e);
                self.create_collection().await?;
            }
        }
        Ok(())
    }

    async fn create_collection(&self) -> Result<()> {
        let vectors_config = VectorsConfig {
            config: Some(Config::Params(VectorParams {
                size: self.vector_size as u64,
                distance: Distance::Cosine.into(),
                ..Default::default()
            })),
        };

        let create_collection = CreateCollection {
            collection_name: self.collection_name.clone(),
            vectors_config: Some(vectors_config),
            ..Default::default()
        };

        self.client
            .create_collection(create_collection)
            .await
            .map_err(|e| QaError::VectorStore {
                operation: "create_collection".to_string(),
                message: format!(
                    "Failed to create collection {}: {}",
                    self.collection_name, e
                ),
            })?;

        info!("Created Qdrant collection: {}", self.collection_name);
        Ok(())
    }

    fn payload_str(
        payload: &std::collections::HashMap<String, qdrant_client::qdrant::Value>,
        key: &str,
    ) -> String {
        payload
            .get(key)
            .and_then(|v| match &v.kind {
                Some(qdrant_client::qdrant::value::Kind::StringValue(s)) => Some(s.clone()),
                _ => None,
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl VectorIndex for QdrantVectorIndex {
    #[instrument(skip(self, embedding))]
    async fn search(
        &self,
        namespace: &str,
        embedding: &[f32],
        top_k: usize,
    ) -> Result<Vec<IndexHit>> {
        let search_points = SearchPoints {
            collection_name: self.collection_name.clone(),
            vector: embedding.to_vec(),
            limit: top_k as u64,
            filter: Some(Filter::must([Condition::matches(
                "namespace",
                namespace.to_string(),
            )])),
            with_payload: Some(WithPayloadSelector {
                selector_options: Some(SelectorOptions::Enable(true)),
            }),
            ..Default::default()
        };

        let search_result = self
            .client
            .search_points(search_points)
            .await
            .map_err(|e| QaError::VectorStore {
                operation: "search".to_string(),
                message: format!("Failed to search points: {}", e),
            })?;

        let mut hits = Vec::new();
        for scored_point in search_result.result {
            let payload = scored_point.payload;
            let id = Uuid::parse_str(&Self::payload_str(&payload, "chunk_id"))
                .unwrap_or_else(|_| Uuid::nil());
            hits.push(IndexHit {
                id,
                source_id: Self::payload_str(&payload, "source_id"),
                document_title: Self::payload_str(&payload, "document_title"),
                text: Self::payload_str(&payload, "text"),
                score: scored_point.score.clamp(0.0, 1.0),
            });
        }
        crate::index::sort_hits(&mut hits);
        Ok(hits)
    }

    async fn keyword_search(
        &self,
        namespace: &str,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<IndexHit>> {
        self.lexical.keyword_search(namespace, query, top_k).await
    }

    #[instrument(skip(self, chunks))]
    async fn upsert(&self, namespace: &str, chunks: Vec<IndexedChunk>) -> Result<()> {
        let mut points = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            let payload: Payload = serde_json::json!({
                "chunk_id": chunk.id.to_string(),
                "namespace": namespace,
                "source_id": chunk.source_id,
                "document_title": chunk.document_title,
                "text": chunk.text,
            })
            .try_into()
            .map_err(|e| QaError::Serialization {
                format: "qdrant_payload".to_string(),
                message: format!("{:?}", e),
            })?;

            points.push(PointStruct::new(
                chunk.id.to_string(),
                chunk.embedding.clone(),
                payload,
            ));
        }

        let upsert = UpsertPoints {
            collection_name: self.collection_name.clone(),
            points,
            ..Default::default()
        };

        self.client
            .upsert_points(upsert)
            .await
            .map_err(|e| QaError::VectorStore {
                operation: "upsert".to_string(),
                message: format!("Failed to upsert points: {}", e),
            })?;

        // 词汇侧索引与向量库同步写入
        self.lexical.upsert(namespace, chunks).await
    }
}
