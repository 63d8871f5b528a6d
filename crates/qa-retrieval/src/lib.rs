//! 检索层：向量索引抽象、策略路由、混合检索融合、重排、
//! 上下文组装与证据充分性拦截。

pub mod assemble;
pub mod blocking;
pub mod index;
pub mod qdrant;
pub mod rerank;
pub mod retriever;
pub mod strategy;

pub use assemble::ContextAssembler;
pub use blocking::{BlockReason, BlockingPolicy};
pub use index::{cosine_similarity, IndexHit, IndexedChunk, MemoryVectorIndex, VectorIndex};
pub use qdrant::QdrantVectorIndex;
pub use rerank::{CohereReranker, KeywordReranker, NoopReranker, Reranker, RerankerFactory};
pub use retriever::{Retriever, RetrieverConfig};
pub use strategy::{resolve_strategy, EffectiveStrategy, StrategyDefaults, StrategyOverride};
