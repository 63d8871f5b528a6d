use async_trait::async_trait;
use once_cell::sync::Lazy;
use qa_error::Result;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, instrument};
use uuid::Uuid;

/// 待写入索引的分块
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedChunk {
    pub id: Uuid,
    pub source_id: String,
    pub document_title: String,
    pub text: String,
    pub embedding: Vec<f32>,
}

/// 索引命中结果（分数语义由实现决定，Retriever 负责归一化）
#[derive(Debug, Clone)]
pub struct IndexHit {
    pub id: Uuid,
    pub source_id: String,
    pub document_title: String,
    pub text: String,
    pub score: f32,
}

/// 向量索引的统一抽象。namespace 按 Agent 隔离
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// 纯最近邻搜索
    async fn search(&self, namespace: &str, embedding: &[f32], top_k: usize)
        -> Result<Vec<IndexHit>>;

    /// 词汇信号搜索（TF-IDF），用于混合检索
    async fn keyword_search(&self, namespace: &str, query: &str, top_k: usize)
        -> Result<Vec<IndexHit>>;

    async fn upsert(&self, namespace: &str, chunks: Vec<IndexedChunk>) -> Result<()>;
}

/// 余弦相似度计算函数
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return 0.0;
    }

    let mut dot_product = 0.0;
    let mut norm_a = 0.0;
    let mut norm_b = 0.0;

    for i in 0..a.len() {
        dot_product += a[i] * b[i];
        norm_a += a[i] * a[i];
        norm_b += b[i] * b[i];
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a.sqrt() * norm_b.sqrt())
}

static STOP_WORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    let mut set = HashSet::new();
    // 中文停用词
    for word in &[
        "的", "了", "在", "是", "我", "有", "和", "就", "不", "人", "都", "一", "一个", "上", "也",
        "很", "到", "说", "要", "去", "你", "会", "着", "没有", "看", "好", "自己", "这",
    ] {
        set.insert(*word);
    }
    // 英文停用词
    for word in &[
        "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by",
        "this", "that", "is", "are", "was", "were", "be", "been", "have", "has", "had", "do",
        "does", "did", "will", "would", "could", "should",
    ] {
        set.insert(*word);
    }
    set
});

const MIN_WORD_LENGTH: usize = 2;
const MAX_QUERY_TERMS: usize = 20;

/// 分词和预处理：按空白与中英文标点切分，过滤停用词
pub(crate) fn tokenize(text: &str) -> Vec<String> {
    let text = text.to_lowercase();
    let chinese_punct = [
        '，', '。', '！', '？', '；', '：', '"', '"', '\'', '\'', '（', '）', '【', '】', '《',
        '》',
    ];
    text.split(|c: char| {
        c.is_whitespace() || c.is_ascii_punctuation() || chinese_punct.contains(&c)
    })
    .filter_map(|word| {
        let trimmed = word.trim();
        if trimmed.len() >= MIN_WORD_LENGTH && !STOP_WORDS.contains(trimmed) {
            Some(trimmed.to_string())
        } else {
            None
        }
    })
    .take(MAX_QUERY_TERMS)
    .collect()
}

/// 单个 namespace 的内存索引：向量 + 倒排
#[derive(Default)]
struct NamespaceIndex {
    chunks: Vec<IndexedChunk>,
    /// chunk -> 词频统计
    term_freq: HashMap<Uuid, HashMap<String, u32>>,
    /// 词 -> 包含该词的 chunk 集合
    inverted: HashMap<String, HashSet<Uuid>>,
}

/// 内存向量索引：固定语料下完全确定性，测试与单机部署使用
#[derive(Default)]
pub struct MemoryVectorIndex {
    namespaces: Arc<RwLock<HashMap<String, NamespaceIndex>>>,
}

impl MemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn chunk_count(&self, namespace: &str) -> usize {
        let namespaces = self.namespaces.read().await;
        namespaces.get(namespace).map(|n| n.chunks.len()).unwrap_or(0)
    }

    /// TF-IDF 打分 + 关键词覆盖度奖励
    fn lexical_score(
        query_tokens: &[String],
        chunk_id: Uuid,
        ns: &NamespaceIndex,
    ) -> f32 {
        let Some(doc_term_freq) = ns.term_freq.get(&chunk_id) else {
            return 0.0;
        };
        let total_docs = ns.chunks.len().max(1) as f32;
        let mut score = 0.0;
        let mut matched_terms = 0;

        for query_term in query_tokens {
            if let Some(&term_freq) = doc_term_freq.get(query_term) {
                matched_terms += 1;
                let tf = term_freq as f32;
                let doc_freq = ns
                    .inverted
                    .get(query_term)
                    .map(|docs| docs.len())
                    .unwrap_or(1) as f32;
                let idf = (total_docs / doc_freq).ln().max(0.0);
                score += tf * idf * 0.7;
            }
        }

        if matched_terms > 0 {
            score += (matched_terms as f32 / query_tokens.len() as f32) * 0.3;
        }

        score
    }
}

/// 确定性排序：分数降序，相同分数按 source_id / chunk id 升序
pub(crate) fn sort_hits(hits: &mut [IndexHit]) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.source_id.cmp(&b.source_id))
            .then_with(|| a.id.cmp(&b.id))
    });
}

#[async_trait]
impl VectorIndex for MemoryVectorIndex {
    #[instrument(skip(self, embedding))]
    async fn search(
        &self,
        namespace: &str,
        embedding: &[f32],
        top_k: usize,
    ) -> Result<Vec<IndexHit>> {
        let namespaces = self.namespaces.read().await;
        let Some(ns) = namespaces.get(namespace) else {
            return Ok(vec![]);
        };

        let mut hits: Vec<IndexHit> = ns
            .chunks
            .iter()
            .map(|chunk| IndexHit {
                id: chunk.id,
                source_id: chunk.source_id.clone(),
                document_title: chunk.document_title.clone(),
                text: chunk.text.clone(),
                // 余弦相似度截断到 [0, 1]
                score: cosine_similarity(embedding, &chunk.embedding).clamp(0.0, 1.0),
            })
            .collect();

        sort_hits(&mut hits);
        hits.truncate(top_k);
        Ok(hits)
    }

    #[instrument(skip(self))]
    async fn keyword_search(
        &self,
        namespace: &str,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<IndexHit>> {
        let query_tokens = tokenize(query);
        if query_tokens.is_empty() {
            return Ok(vec![]);
        }

        let namespaces = self.namespaces.read().await;
        let Some(ns) = namespaces.get(namespace) else {
            return Ok(vec![]);
        };

        // 收集候选分块
        let mut candidates = HashSet::new();
        for token in &query_tokens {
            if let Some(docs) = ns.inverted.get(token) {
                candidates.extend(docs.iter().copied());
            }
        }

        let mut hits = Vec::new();
        for chunk in &ns.chunks {
            if !candidates.contains(&chunk.id) {
                continue;
            }
            let score = Self::lexical_score(&query_tokens, chunk.id, ns);
            if score > 0.0 {
                hits.push(IndexHit {
                    id: chunk.id,
                    source_id: chunk.source_id.clone(),
                    document_title: chunk.document_title.clone(),
                    text: chunk.text.clone(),
                    score,
                });
            }
        }

        sort_hits(&mut hits);
        hits.truncate(top_k);

        debug!(
            namespace,
            candidates = candidates.len(),
            results = hits.len(),
            "词汇搜索完成"
        );

        Ok(hits)
    }

    #[instrument(skip(self, chunks))]
    async fn upsert(&self, namespace: &str, chunks: Vec<IndexedChunk>) -> Result<()> {
        let mut namespaces = self.namespaces.write().await;
        let ns = namespaces.entry(namespace.to_string()).or_default();

        for chunk in chunks {
            let tokens = tokenize(&chunk.text);
            let mut term_freq: HashMap<String, u32> = HashMap::new();
            for token in &tokens {
                *term_freq.entry(token.clone()).or_insert(0) += 1;
            }
            for term in term_freq.keys() {
                ns.inverted
                    .entry(term.clone())
                    .or_insert_with(HashSet::new)
                    .insert(chunk.id);
            }
            ns.term_freq.insert(chunk.id, term_freq);
            // 同 id 覆盖写
            ns.chunks.retain(|c| c.id != chunk.id);
            ns.chunks.push(chunk);
        }

        debug!(namespace, total = ns.chunks.len(), "分块已写入内存索引");
        Ok(())
    }
}
