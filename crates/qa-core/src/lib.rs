use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

pub use qa_error::{QaError as Error, QaError, Result};

/// 检索策略 - 随请求传递的值对象，不落库
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchStrategy {
    SemanticOnly,
    Hybrid,
    HybridNoRerank,
}

impl SearchStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchStrategy::SemanticOnly => "semantic_only",
            SearchStrategy::Hybrid => "hybrid",
            SearchStrategy::HybridNoRerank => "hybrid_no_rerank",
        }
    }
}

impl FromStr for SearchStrategy {
    type Err = QaError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "semantic_only" => Ok(SearchStrategy::SemanticOnly),
            "hybrid" => Ok(SearchStrategy::Hybrid),
            "hybrid_no_rerank" => Ok(SearchStrategy::HybridNoRerank),
            other => Err(QaError::InvalidRequest {
                reason: format!("unknown search strategy: {}", other),
            }),
        }
    }
}

/// 模型提供商类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    OpenaiCompat,
    Anthropic,
}

/// 知识助手配置实体 - 在单次对话轮次内只读
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub name: String,
    pub provider: ProviderKind,
    pub base_url: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub system_prompt: String,
    pub active: bool,
    /// 凭证引用：存放 API Key 的环境变量名，绝不存明文
    pub api_key_env: String,
    #[serde(default)]
    pub retrieval: AgentRetrievalConfig,
}

/// 每个 Agent 的检索/拦截配置。策略与重排开关未设置时回退全局默认
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentRetrievalConfig {
    pub default_strategy: Option<SearchStrategy>,
    pub rerank_enabled: Option<bool>,
    pub rerank_model: Option<String>,
    pub top_k: u16,
    /// 最低置信度阈值，低于此分数的最佳结果会触发拦截
    pub min_confidence: f32,
    pub context_budget_chars: usize,
    pub allow_multiple_chunks_per_source: bool,
    /// 提示词中保留的最近历史消息条数
    pub history_cap: usize,
}

impl Default for AgentRetrievalConfig {
    fn default() -> Self {
        Self {
            default_strategy: None,
            rerank_enabled: None,
            rerank_model: None,
            top_k: 10,
            min_confidence: 0.35,
            context_budget_chars: 6000,
            allow_multiple_chunks_per_source: false,
            history_cap: 20,
        }
    }
}

/// 会话线程：归属于创建它的用户
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub user_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rating {
    Up,
    Down,
}

/// 单条消息 - 追加写入；仅 rating / rating_comment 可覆盖
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub session_id: Uuid,
    /// 会话内严格递增，决定消息顺序
    pub seq: i64,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub rating: Option<Rating>,
    pub rating_comment: Option<String>,
    /// 助手消息的上下文审计信息：记录生成时实际使用的来源
    pub context: Option<MessageContextMeta>,
}

/// 检索到的段落 - 请求级临时对象，不持久化
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub source_id: String,
    pub document_title: String,
    pub text: String,
    /// 相似度分数，范围 [0, 1]，越高越相关
    pub score: f32,
    /// 排名，从 0 开始
    pub rank: usize,
}

/// 组装后的上下文 - 请求级临时聚合
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssembledContext {
    pub chunks: Vec<RetrievedChunk>,
    pub total_length: usize,
    pub source_count: usize,
}

impl AssembledContext {
    pub fn best_score(&self) -> Option<f32> {
        self.chunks.first().map(|c| c.score)
    }
}

/// 上下文来源归属信息（返回给调用方并随消息落库审计）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSource {
    pub source_id: String,
    pub document_title: String,
    pub score: f32,
}

/// 助手消息的上下文元数据
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageContextMeta {
    pub sources: Vec<ContextSource>,
    pub context_length: usize,
    pub blocked: bool,
    pub rerank_degraded: bool,
}

// === HTTP DTO ===

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurnRequest {
    pub messages: Vec<IncomingMessage>,
    pub session_id: Option<Uuid>,
    pub search_strategy: Option<String>,
    pub enable_reranking: Option<bool>,
    pub rerank_model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnPerformance {
    pub total_time_ms: u64,
    pub vector_search_time_ms: Option<u64>,
    pub context_processing_time_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurnResponse {
    pub message: String,
    pub session_id: Uuid,
    pub context_used: bool,
    pub context_length: usize,
    pub context_sources: Vec<ContextSource>,
    pub blocked: bool,
    pub reason: Option<String>,
    pub rerank_degraded: bool,
    pub performance: TurnPerformance,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSessionSummary {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<ChatSession> for ChatSessionSummary {
    fn from(s: ChatSession) -> Self {
        Self {
            id: s.id,
            agent_id: s.agent_id,
            created_at: s.created_at,
            updated_at: s.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateRequest {
    pub rating: Rating,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorSearchRequest {
    pub query: String,
    pub agent_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorSearchHit {
    pub text: String,
    pub score: f32,
    pub source_id: String,
    pub document_title: String,
}
