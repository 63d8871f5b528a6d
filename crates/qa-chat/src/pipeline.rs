use crate::agent::AgentDirectory;
use crate::generate::AnswerGenerator;
use crate::store::{ChatStore, SessionLocks};
use qa_core::{
    Agent, ChatMessage, ChatSession, ChatSessionSummary, ChatTurnRequest, ChatTurnResponse,
    ContextSource, MessageContextMeta, RateRequest, Role, TurnPerformance, VectorSearchHit,
    VectorSearchRequest,
};
use qa_error::{QaError, Result};
use qa_retrieval::{
    resolve_strategy, BlockingPolicy, ContextAssembler, Reranker, RerankerFactory, Retriever,
    StrategyDefaults, StrategyOverride,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// 证据不足时返回并落库的固定回复
const BLOCKED_NOTICE: &str =
    "根据现有知识库内容，我无法可靠地回答这个问题。请换一种问法，或补充相关资料后再试。";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub defaults: StrategyDefaults,
    /// Cohere 重排凭证，缺失时自动降级为关键词重排
    pub cohere_api_key: Option<String>,
    pub rerank_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            defaults: StrategyDefaults::default(),
            cohere_api_key: None,
            rerank_timeout_ms: 5_000,
        }
    }
}

/// 单轮问答管线：校验 → 会话 → 检索 → 重排 → 组装 → 拦截 → 生成 → 落库。
/// 同一会话的轮次串行执行，不同会话并发互不干扰。
pub struct ChatPipeline {
    agents: Arc<dyn AgentDirectory>,
    store: Arc<dyn ChatStore>,
    retriever: Arc<Retriever>,
    generator: AnswerGenerator,
    locks: SessionLocks,
    config: PipelineConfig,
    /// 指定则绕过工厂，直接使用该重排器
    reranker: Option<Arc<dyn Reranker>>,
}

fn ms(elapsed: Duration) -> u64 {
    elapsed.as_millis() as u64
}

fn context_sources(chunks: &[qa_core::RetrievedChunk]) -> Vec<ContextSource> {
    chunks
        .iter()
        .map(|c| ContextSource {
            source_id: c.source_id.clone(),
            document_title: c.document_title.clone(),
            score: c.score,
        })
        .collect()
}

impl ChatPipeline {
    pub fn new(
        agents: Arc<dyn AgentDirectory>,
        store: Arc<dyn ChatStore>,
        retriever: Arc<Retriever>,
        generator: AnswerGenerator,
        config: PipelineConfig,
    ) -> Self {
        Self {
            agents,
            store,
            retriever,
            generator,
            locks: SessionLocks::new(),
            config,
            reranker: None,
        }
    }

    /// 替换重排器实现，不再按生效配置走工厂选择
    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    /// Agent 的检索命名空间
    fn namespace(agent: &Agent) -> String {
        agent.id.to_string()
    }

    /// 执行一轮对话
    #[instrument(skip(self, request), fields(agent_id = %agent_id))]
    pub async fn handle_turn(
        &self,
        user_id: Uuid,
        agent_id: Uuid,
        request: ChatTurnRequest,
    ) -> Result<ChatTurnResponse> {
        let started = Instant::now();

        let agent = self.agents.get(agent_id).await?;
        if !agent.active {
            return Err(QaError::InvalidRequest {
                reason: format!("agent {} 已停用", agent.name),
            });
        }

        let question = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| QaError::InvalidRequest {
                reason: "请求中没有非空的用户消息".to_string(),
            })?;

        let overrides = StrategyOverride::parse(
            request.search_strategy.as_deref(),
            request.enable_reranking,
            request.rerank_model.clone(),
        )?;
        let effective = resolve_strategy(&overrides, &agent.retrieval, &self.config.defaults);

        let session = match request.session_id {
            Some(id) => {
                let session = self.store.get_session(id, user_id).await?;
                if session.agent_id != agent_id {
                    return Err(QaError::InvalidRequest {
                        reason: "会话不属于该 agent".to_string(),
                    });
                }
                session
            }
            None => self.store.create_session(agent_id, user_id).await?,
        };

        // 会话级互斥：整轮持锁，保证 seq 与历史快照一致
        let lock = self.locks.acquire(session.id).await;
        let _guard = lock.lock().await;

        // 历史快照在写入本轮用户消息之前读取
        let history = self.store.history(session.id).await?;
        self.store
            .append_message(session.id, Role::User, question.clone(), None)
            .await?;

        let search_started = Instant::now();
        let mut chunks = self
            .retriever
            .retrieve(
                &Self::namespace(&agent),
                &question,
                effective.strategy,
                agent.retrieval.top_k as usize,
            )
            .await?;
        let vector_search_time_ms = ms(search_started.elapsed());

        // 重排失败或超时不阻断整轮：保留检索顺序并标记降级
        let mut rerank_degraded = false;
        if effective.rerank_enabled && !chunks.is_empty() {
            let reranker = match &self.reranker {
                Some(r) => Arc::clone(r),
                None => RerankerFactory::create(
                    true,
                    effective.rerank_model.as_deref(),
                    self.config.cohere_api_key.as_deref(),
                ),
            };
            let timeout = Duration::from_millis(self.config.rerank_timeout_ms);
            match tokio::time::timeout(timeout, reranker.rerank(&question, chunks.clone())).await {
                Ok(Ok(reranked)) => chunks = reranked,
                Ok(Err(e)) => {
                    warn!(reranker = reranker.name(), error = %e, "重排失败，降级使用检索顺序");
                    rerank_degraded = true;
                }
                Err(_) => {
                    warn!(reranker = reranker.name(), "重排超时，降级使用检索顺序");
                    rerank_degraded = true;
                }
            }
        }

        let assemble_started = Instant::now();
        let assembler = ContextAssembler::new(
            agent.retrieval.context_budget_chars,
            agent.retrieval.allow_multiple_chunks_per_source,
        );
        let ctx = assembler.assemble(&chunks);
        let context_processing_time_ms = ms(assemble_started.elapsed());

        let policy = BlockingPolicy::new(agent.retrieval.min_confidence);
        if let Some(reason) = policy.evaluate(&ctx) {
            info!(
                session_id = %session.id,
                reason = reason.as_str(),
                best_score = ctx.best_score().unwrap_or(0.0),
                "证据不足，拦截生成"
            );
            self.store
                .append_message(
                    session.id,
                    Role::Assistant,
                    BLOCKED_NOTICE.to_string(),
                    Some(MessageContextMeta {
                        sources: vec![],
                        context_length: 0,
                        blocked: true,
                        rerank_degraded,
                    }),
                )
                .await?;
            return Ok(ChatTurnResponse {
                message: BLOCKED_NOTICE.to_string(),
                session_id: session.id,
                context_used: false,
                context_length: 0,
                context_sources: vec![],
                blocked: true,
                reason: Some(reason.as_str().to_string()),
                rerank_degraded,
                performance: TurnPerformance {
                    total_time_ms: ms(started.elapsed()),
                    vector_search_time_ms: Some(vector_search_time_ms),
                    context_processing_time_ms: Some(context_processing_time_ms),
                },
            });
        }

        // 生成失败直接向上传播：本轮不落助手消息，用户消息保留
        let answer = self
            .generator
            .generate(&agent, &history, &ctx, &question)
            .await?;

        let sources = context_sources(&ctx.chunks);
        self.store
            .append_message(
                session.id,
                Role::Assistant,
                answer.clone(),
                Some(MessageContextMeta {
                    sources: sources.clone(),
                    context_length: ctx.total_length,
                    blocked: false,
                    rerank_degraded,
                }),
            )
            .await?;

        Ok(ChatTurnResponse {
            message: answer,
            session_id: session.id,
            context_used: !ctx.chunks.is_empty(),
            context_length: ctx.total_length,
            context_sources: sources,
            blocked: false,
            reason: None,
            rerank_degraded,
            performance: TurnPerformance {
                total_time_ms: ms(started.elapsed()),
                vector_search_time_ms: Some(vector_search_time_ms),
                context_processing_time_ms: Some(context_processing_time_ms),
            },
        })
    }

    pub async fn create_session(&self, user_id: Uuid, agent_id: Uuid) -> Result<ChatSession> {
        // 创建前确认 agent 存在
        let agent = self.agents.get(agent_id).await?;
        self.store.create_session(agent.id, user_id).await
    }

    pub async fn list_sessions(
        &self,
        user_id: Uuid,
        agent_id: Option<Uuid>,
    ) -> Result<Vec<ChatSessionSummary>> {
        let sessions = self.store.list_sessions(user_id, agent_id).await?;
        Ok(sessions.into_iter().map(ChatSessionSummary::from).collect())
    }

    pub async fn history(&self, user_id: Uuid, session_id: Uuid) -> Result<Vec<ChatMessage>> {
        self.store.get_session(session_id, user_id).await?;
        self.store.history(session_id).await
    }

    pub async fn rate_message(
        &self,
        user_id: Uuid,
        message_id: Uuid,
        request: RateRequest,
    ) -> Result<ChatMessage> {
        self.store
            .rate_message(message_id, user_id, request.rating, request.comment)
            .await
    }

    /// 直接向量检索调试入口，不产生会话与消息
    #[instrument(skip(self, request))]
    pub async fn vector_search(&self, request: VectorSearchRequest) -> Result<Vec<VectorSearchHit>> {
        let agent = self.agents.get(request.agent_id).await?;
        let chunks = self
            .retriever
            .retrieve(
                &Self::namespace(&agent),
                &request.query,
                agent
                    .retrieval
                    .default_strategy
                    .unwrap_or(self.config.defaults.strategy),
                agent.retrieval.top_k as usize,
            )
            .await?;
        Ok(chunks
            .into_iter()
            .map(|c| VectorSearchHit {
                text: c.text,
                score: c.score,
                source_id: c.source_id,
                document_title: c.document_title,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::StaticAgentDirectory;
    use crate::generate::{ChatModels, GeneratorConfig};
    use crate::store::MemoryChatStore;
    use async_trait::async_trait;
    use qa_core::{AgentRetrievalConfig, IncomingMessage, ProviderKind, SearchStrategy};
    use qa_llm::{ChatModel, ChatPrompt, EmbedModel};
    use qa_retrieval::VectorIndex;
    use qa_retrieval::{IndexedChunk, MemoryVectorIndex, RetrieverConfig};

    struct MockEmbedModel;

    #[async_trait]
    impl EmbedModel for MockEmbedModel {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| {
                    let t = t.to_lowercase();
                    if t.contains("rust") {
                        vec![1.0, 0.0, 0.0]
                    } else if t.contains("python") {
                        vec![0.0, 1.0, 0.0]
                    } else {
                        vec![0.0, 0.0, 1.0]
                    }
                })
                .collect())
        }
    }

    struct EchoModel;

    #[async_trait]
    impl ChatModel for EchoModel {
        async fn chat(&self, prompt: &ChatPrompt) -> Result<String> {
            Ok(format!("回答：{}", prompt.user))
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

    fn sample_agent(strategy: SearchStrategy) -> Agent {
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
                default_strategy: Some(strategy),
                rerank_enabled: Some(false),
                min_confidence: 0.35,
                ..AgentRetrievalConfig::default()
            },
        }
    }

    async fn seeded_index(namespace: &str) -> Arc<MemoryVectorIndex> {
        let index = Arc::new(MemoryVectorIndex::new());
        index
            .upsert(
                namespace,
                vec![
                    IndexedChunk {
                        id: Uuid::new_v4(),
                        source_id: "s1".into(),
                        document_title: "Rust 指南".into(),
                        text: "Rust ownership and borrowing".into(),
                        embedding: vec![1.0, 0.0, 0.0],
                    },
                    IndexedChunk {
                        id: Uuid::new_v4(),
                        source_id: "s2".into(),
                        document_title: "Python 指南".into(),
                        text: "Python scripting basics".into(),
                        embedding: vec![0.0, 1.0, 0.0],
                    },
                ],
            )
            .await
            .unwrap();
        index
    }

    fn build_pipeline_inner(
        agent: Agent,
        index: Arc<MemoryVectorIndex>,
        model: Arc<dyn ChatModel>,
    ) -> ChatPipeline {
        let retriever = Arc::new(Retriever::new(
            index,
            Arc::new(MockEmbedModel),
            RetrieverConfig {
                retry_base_ms: 1,
                ..RetrieverConfig::default()
            },
        ));
        let generator = AnswerGenerator::new(
            Arc::new(FixedModels(model)),
            GeneratorConfig {
                retry_base_ms: 1,
                ..GeneratorConfig::default()
            },
        );
        ChatPipeline::new(
            Arc::new(StaticAgentDirectory::new(vec![agent])),
            Arc::new(MemoryChatStore::new()),
            retriever,
            generator,
            PipelineConfig::default(),
        )
    }

    fn build_pipeline(
        agent: Agent,
        index: Arc<MemoryVectorIndex>,
        model: Arc<dyn ChatModel>,
    ) -> Arc<ChatPipeline> {
        Arc::new(build_pipeline_inner(agent, index, model))
    }

    fn turn_request(content: &str, session_id: Option<Uuid>) -> ChatTurnRequest {
        ChatTurnRequest {
            messages: vec![IncomingMessage {
                role: Role::User,
                content: content.to_string(),
            }],
            session_id,
            search_strategy: None,
            enable_reranking: None,
            rerank_model: None,
        }
    }

    #[tokio::test]
    async fn test_answered_turn_persists_pair_with_context() {
        let agent = sample_agent(SearchStrategy::SemanticOnly);
        let agent_id = agent.id;
        let index = seeded_index(&agent_id.to_string()).await;
        let pipeline = build_pipeline(agent, index, Arc::new(EchoModel));
        let user = Uuid::new_v4();

        let response = pipeline
            .handle_turn(user, agent_id, turn_request("rust 的所有权是什么", None))
            .await
            .unwrap();

        assert!(!response.blocked);
        assert!(response.context_used);
        assert!(response.message.starts_with("回答："));
        assert_eq!(response.context_sources[0].source_id, "s1");

        let history = pipeline.history(user, response.session_id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[1].role, Role::Assistant);
        let meta = history[1].context.as_ref().unwrap();
        assert!(!meta.blocked);
        assert_eq!(meta.sources[0].source_id, "s1");
    }

    #[tokio::test]
    async fn test_no_sources_blocks_and_persists_notice() {
        let agent = sample_agent(SearchStrategy::SemanticOnly);
        let agent_id = agent.id;
        // 空命名空间
        let pipeline = build_pipeline(agent, Arc::new(MemoryVectorIndex::new()), Arc::new(EchoModel));
        let user = Uuid::new_v4();

        let response = pipeline
            .handle_turn(user, agent_id, turn_request("rust 问题", None))
            .await
            .unwrap();

        assert!(response.blocked);
        assert_eq!(response.reason.as_deref(), Some("no_relevant_sources"));
        assert!(!response.context_used);
        assert_eq!(response.message, BLOCKED_NOTICE);

        let history = pipeline.history(user, response.session_id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[1].context.as_ref().unwrap().blocked);
    }

    #[tokio::test]
    async fn test_low_confidence_blocks() {
        let agent = sample_agent(SearchStrategy::SemanticOnly);
        let agent_id = agent.id;
        let index = seeded_index(&agent_id.to_string()).await;
        let pipeline = build_pipeline(agent, index, Arc::new(EchoModel));

        // 嵌入方向与语料正交，余弦为 0，低于阈值
        let response = pipeline
            .handle_turn(Uuid::new_v4(), agent_id, turn_request("天气如何", None))
            .await
            .unwrap();
        assert!(response.blocked);
        assert_eq!(
            response.reason.as_deref(),
            Some("below_confidence_threshold")
        );
    }

    #[tokio::test]
    async fn test_hybrid_low_confidence_blocks() {
        // 混合检索的融合不得抬高无关结果的分数：
        // 查询与全部语料正交时依然要触发拦截
        let agent = sample_agent(SearchStrategy::Hybrid);
        let agent_id = agent.id;
        let index = seeded_index(&agent_id.to_string()).await;
        let pipeline = build_pipeline(agent, index, Arc::new(EchoModel));

        let response = pipeline
            .handle_turn(Uuid::new_v4(), agent_id, turn_request("天气如何", None))
            .await
            .unwrap();
        assert!(response.blocked);
        assert_eq!(
            response.reason.as_deref(),
            Some("below_confidence_threshold")
        );
    }

    #[tokio::test]
    async fn test_rerank_failure_degrades_and_keeps_retrieval_order() {
        struct BrokenReranker;

        #[async_trait]
        impl Reranker for BrokenReranker {
            async fn rerank(
                &self,
                _query: &str,
                _chunks: Vec<qa_core::RetrievedChunk>,
            ) -> Result<Vec<qa_core::RetrievedChunk>> {
                Err(QaError::RetrievalFailed {
                    operation: "rerank".to_string(),
                    message: "service unavailable".to_string(),
                    retry_after: None,
                })
            }

            fn name(&self) -> &str {
                "broken"
            }
        }

        let mut agent = sample_agent(SearchStrategy::SemanticOnly);
        agent.retrieval.rerank_enabled = Some(true);
        let agent_id = agent.id;
        let index = seeded_index(&agent_id.to_string()).await;
        let pipeline = Arc::new(
            build_pipeline_inner(agent, index, Arc::new(EchoModel))
                .with_reranker(Arc::new(BrokenReranker)),
        );
        let user = Uuid::new_v4();

        let response = pipeline
            .handle_turn(user, agent_id, turn_request("rust 的所有权是什么", None))
            .await
            .unwrap();

        // 重排失败只降级，不阻断：保留检索顺序并标记
        assert!(!response.blocked);
        assert!(response.rerank_degraded);
        assert_eq!(response.context_sources[0].source_id, "s1");

        let history = pipeline.history(user, response.session_id).await.unwrap();
        let meta = history[1].context.as_ref().unwrap();
        assert!(meta.rerank_degraded);
        assert_eq!(meta.sources[0].source_id, "s1");
    }

    #[tokio::test]
    async fn test_generation_failure_keeps_user_message_only() {
        let agent = sample_agent(SearchStrategy::SemanticOnly);
        let agent_id = agent.id;
        let index = seeded_index(&agent_id.to_string()).await;
        let pipeline = build_pipeline(agent, index, Arc::new(FailingModel));
        let user = Uuid::new_v4();

        let session = pipeline.create_session(user, agent_id).await.unwrap();
        let err = pipeline
            .handle_turn(user, agent_id, turn_request("rust 问题", Some(session.id)))
            .await
            .unwrap_err();
        assert!(matches!(err, QaError::GenerationFailed { .. }));

        let history = pipeline.history(user, session.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, Role::User);
    }

    #[tokio::test]
    async fn test_inactive_agent_rejected() {
        let mut agent = sample_agent(SearchStrategy::SemanticOnly);
        agent.active = false;
        let agent_id = agent.id;
        let pipeline = build_pipeline(agent, Arc::new(MemoryVectorIndex::new()), Arc::new(EchoModel));

        let err = pipeline
            .handle_turn(Uuid::new_v4(), agent_id, turn_request("问题", None))
            .await
            .unwrap_err();
        assert!(matches!(err, QaError::InvalidRequest { .. }));
    }

    #[tokio::test]
    async fn test_unknown_strategy_rejected_before_side_effects() {
        let agent = sample_agent(SearchStrategy::SemanticOnly);
        let agent_id = agent.id;
        let pipeline = build_pipeline(agent, Arc::new(MemoryVectorIndex::new()), Arc::new(EchoModel));
        let user = Uuid::new_v4();

        let mut request = turn_request("rust 问题", None);
        request.search_strategy = Some("graph".to_string());
        let err = pipeline
            .handle_turn(user, agent_id, request)
            .await
            .unwrap_err();
        assert!(matches!(err, QaError::InvalidRequest { .. }));
        // 校验失败不应创建会话
        assert!(pipeline.list_sessions(user, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_session_ownership_enforced() {
        let agent = sample_agent(SearchStrategy::SemanticOnly);
        let agent_id = agent.id;
        let index = seeded_index(&agent_id.to_string()).await;
        let pipeline = build_pipeline(agent, index, Arc::new(EchoModel));
        let owner = Uuid::new_v4();

        let session = pipeline.create_session(owner, agent_id).await.unwrap();
        let err = pipeline
            .handle_turn(
                Uuid::new_v4(),
                agent_id,
                turn_request("rust 问题", Some(session.id)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, QaError::Unauthorized { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_turns_keep_seq_order() {
        let agent = sample_agent(SearchStrategy::SemanticOnly);
        let agent_id = agent.id;
        let index = seeded_index(&agent_id.to_string()).await;
        let pipeline = build_pipeline(agent, index, Arc::new(EchoModel));
        let user = Uuid::new_v4();
        let session = pipeline.create_session(user, agent_id).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..4 {
            let pipeline = pipeline.clone();
            let session_id = session.id;
            handles.push(tokio::spawn(async move {
                pipeline
                    .handle_turn(
                        user,
                        agent_id,
                        turn_request(&format!("rust 问题 {}", i), Some(session_id)),
                    )
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let history = pipeline.history(user, session.id).await.unwrap();
        assert_eq!(history.len(), 8);
        for pair in history.windows(2) {
            assert!(pair[0].seq < pair[1].seq);
        }
        // 轮次内消息成对出现：用户在前，助手在后
        for turn in history.chunks(2) {
            assert_eq!(turn[0].role, Role::User);
            assert_eq!(turn[1].role, Role::Assistant);
        }
    }
}
