use async_trait::async_trait;
use qa_core::{Agent, AssembledContext, ChatMessage};
use qa_error::{QaError, Result};
use qa_llm::{make_chat_model, ChatModel, ChatPrompt, HistoryTurn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// 按 Agent 解析生成模型客户端
#[async_trait]
pub trait ChatModels: Send + Sync {
    async fn for_agent(&self, agent: &Agent) -> Result<Arc<dyn ChatModel>>;

    /// Agent 配置变更后丢弃缓存的客户端
    async fn invalidate(&self, agent_id: Uuid);
}

/// 从环境变量解析凭证并缓存客户端。
/// Agent 只持有环境变量名，明文密钥不进配置也不进日志。
pub struct EnvChatModels {
    timeout_ms: u64,
    cache: RwLock<HashMap<Uuid, Arc<dyn ChatModel>>>,
}

impl EnvChatModels {
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            timeout_ms,
            cache: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ChatModels for EnvChatModels {
    async fn for_agent(&self, agent: &Agent) -> Result<Arc<dyn ChatModel>> {
        {
            let cache = self.cache.read().await;
            if let Some(model) = cache.get(&agent.id) {
                return Ok(model.clone());
            }
        }

        let api_key =
            std::env::var(&agent.api_key_env).map_err(|_| QaError::Configuration {
                key: agent.api_key_env.clone(),
                reason: "环境变量未设置".to_string(),
            })?;

        let model: Arc<dyn ChatModel> = Arc::from(make_chat_model(
            agent.provider,
            agent.base_url.clone(),
            agent.model.clone(),
            api_key,
            self.timeout_ms,
        ));

        let mut cache = self.cache.write().await;
        cache.insert(agent.id, model.clone());
        Ok(model)
    }

    async fn invalidate(&self, agent_id: Uuid) {
        let mut cache = self.cache.write().await;
        cache.remove(&agent_id);
    }
}

/// 把组装好的上下文渲染成提示词片段
pub fn format_context(ctx: &AssembledContext) -> String {
    let mut out = String::with_capacity(ctx.total_length + ctx.chunks.len() * 64);
    for (i, chunk) in ctx.chunks.iter().enumerate() {
        out.push_str(&format!(
            "[{}] (source={} title={} score={:.2})\n{}\n\n",
            i + 1,
            chunk.source_id,
            chunk.document_title,
            chunk.score,
            chunk.text
        ));
    }
    out
}

pub struct GeneratorConfig {
    pub max_attempts: u32,
    pub retry_base_ms: u64,
    pub timeout_ms: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_base_ms: 200,
            timeout_ms: 60_000,
        }
    }
}

/// 回答生成器：组 prompt、调模型、失败时有界退避重试
pub struct AnswerGenerator {
    models: Arc<dyn ChatModels>,
    config: GeneratorConfig,
}

impl AnswerGenerator {
    pub fn new(models: Arc<dyn ChatModels>, config: GeneratorConfig) -> Self {
        Self { models, config }
    }

    /// 历史截断到 history_cap 条最近消息，顺序保持原样
    fn build_prompt(
        agent: &Agent,
        history: &[ChatMessage],
        ctx: &AssembledContext,
        question: &str,
    ) -> ChatPrompt {
        let cap = agent.retrieval.history_cap;
        let start = history.len().saturating_sub(cap);
        let history_turns: Vec<HistoryTurn> = history[start..]
            .iter()
            .map(|m| HistoryTurn {
                role: m.role,
                content: m.content.clone(),
            })
            .collect();

        let context = if ctx.chunks.is_empty() {
            None
        } else {
            Some(format_context(ctx))
        };

        ChatPrompt {
            system: agent.system_prompt.clone(),
            history: history_turns,
            context,
            user: question.to_string(),
            temperature: agent.temperature,
        }
    }

    #[instrument(skip(self, agent, history, ctx))]
    pub async fn generate(
        &self,
        agent: &Agent,
        history: &[ChatMessage],
        ctx: &AssembledContext,
        question: &str,
    ) -> Result<String> {
        let model = self.models.for_agent(agent).await?;
        let prompt = Self::build_prompt(agent, history, ctx, question);
        let timeout = Duration::from_millis(self.config.timeout_ms);

        tokio::time::timeout(timeout, self.generate_with_retry(agent, &*model, &prompt))
            .await
            .map_err(|_| QaError::Timeout {
                operation: "generate".to_string(),
                timeout_ms: self.config.timeout_ms,
            })?
    }

    async fn generate_with_retry(
        &self,
        agent: &Agent,
        model: &dyn ChatModel,
        prompt: &ChatPrompt,
    ) -> Result<String> {
        let mut last_err: Option<QaError> = None;
        for attempt in 1..=self.config.max_attempts {
            match model.chat(prompt).await {
                Ok(answer) => {
                    info!(agent = %agent.name, attempt, chars = answer.len(), "回答生成完成");
                    return Ok(answer);
                }
                Err(e) if e.is_retryable() && attempt < self.config.max_attempts => {
                    let backoff =
                        Duration::from_millis(self.config.retry_base_ms * 2u64.pow(attempt - 1));
                    warn!(
                        agent = %agent.name,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "生成失败，退避后重试"
                    );
                    tokio::time::sleep(backoff).await;
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| QaError::GenerationFailed {
            provider: agent.name.clone(),
            message: "重试次数耗尽".to_string(),
            retry_after: None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qa_core::{AgentRetrievalConfig, ProviderKind, RetrievedChunk, Role};
    use std::sync::Mutex;

    fn sample_agent() -> Agent {
        Agent {
            id: Uuid::new_v4(),
            name: "docs".to_string(),
            provider: ProviderKind::OpenaiCompat,
            base_url: None,
            model: "gpt-4o".to_string(),
            temperature: 0.2,
            system_prompt: "你是知识助手".to_string(),
            active: true,
            api_key_env: "OPENAI_API_KEY".to_string(),
            retrieval: AgentRetrievalConfig {
                history_cap: 2,
                ..AgentRetrievalConfig::default()
            },
        }
    }

    fn sample_ctx() -> AssembledContext {
        AssembledContext {
            chunks: vec![RetrievedChunk {
                source_id: "s1".into(),
                document_title: "指南".into(),
                text: "所有权规则".into(),
                score: 0.9,
                rank: 0,
            }],
            total_length: 12,
            source_count: 1,
        }
    }

    fn message(role: Role, content: &str, seq: i64) -> ChatMessage {
        ChatMessage {
            id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            seq,
            role,
            content: content.to_string(),
            created_at: chrono::Utc::now(),
            rating: None,
            rating_comment: None,
            context: None,
        }
    }

    /// 记录最后一次收到的 prompt
    struct CapturingModel {
        last: Mutex<Option<ChatPrompt>>,
    }

    #[async_trait]
    impl ChatModel for CapturingModel {
        async fn chat(&self, prompt: &ChatPrompt) -> Result<String> {
            *self.last.lock().unwrap() = Some(prompt.clone());
            Ok("回答".to_string())
        }
    }

    struct FailingModel;

    #[async_trait]
    impl ChatModel for FailingModel {
        async fn chat(&self, _prompt: &ChatPrompt) -> Result<String> {
            Err(QaError::GenerationFailed {
                provider: "mock".to_string(),
                message: "unavailable".to_string(),
                retry_after: None,
            })
        }
    }

    struct FixedModels(Arc<dyn ChatModel>);

    #[async_trait]
    impl ChatModels for FixedModels {
        async fn for_agent(&self, _agent: &Agent) -> Result<Arc<dyn ChatModel>> {
            Ok(self.0.clone())
        }
        async fn invalidate(&self, _agent_id: Uuid) {}
    }

    fn fast_config() -> GeneratorConfig {
        GeneratorConfig {
            retry_base_ms: 1,
            ..GeneratorConfig::default()
        }
    }

    #[tokio::test]
    async fn test_history_capped_and_context_attached() {
        let model = Arc::new(CapturingModel {
            last: Mutex::new(None),
        });
        let generator = AnswerGenerator::new(Arc::new(FixedModels(model.clone())), fast_config());
        let history = vec![
            message(Role::User, "第一问", 0),
            message(Role::Assistant, "第一答", 1),
            message(Role::User, "第二问", 2),
        ];

        let answer = generator
            .generate(&sample_agent(), &history, &sample_ctx(), "当前问题")
            .await
            .unwrap();
        assert_eq!(answer, "回答");

        let prompt = model.last.lock().unwrap().clone().unwrap();
        // history_cap = 2，只保留最近两条
        assert_eq!(prompt.history.len(), 2);
        assert_eq!(prompt.history[0].content, "第一答");
        let ctx = prompt.context.unwrap();
        assert!(ctx.contains("source=s1"));
        assert!(ctx.contains("所有权规则"));
    }

    #[tokio::test]
    async fn test_persistent_failure_surfaces_generation_error() {
        let generator =
            AnswerGenerator::new(Arc::new(FixedModels(Arc::new(FailingModel))), fast_config());
        let err = generator
            .generate(&sample_agent(), &[], &sample_ctx(), "问题")
            .await
            .unwrap_err();
        assert!(matches!(err, QaError::GenerationFailed { .. }));
    }

    #[test]
    fn test_format_context_numbering() {
        let rendered = format_context(&sample_ctx());
        assert!(rendered.starts_with("[1] (source=s1"));
        assert!(rendered.contains("score=0.90"));
    }
}
