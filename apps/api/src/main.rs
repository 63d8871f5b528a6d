use dotenv::dotenv;
use qa_chat::{
    AnswerGenerator, ChatPipeline, ChatStore, EnvChatModels, GeneratorConfig, MemoryChatStore,
    PipelineConfig, SledChatStore, StaticAgentDirectory,
};
use qa_core::{Agent, SearchStrategy};
use qa_llm::EmbedProviderConfig;
use qa_retrieval::{
    MemoryVectorIndex, QdrantVectorIndex, Retriever, RetrieverConfig, StrategyDefaults,
    VectorIndex,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

mod chat_routes;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<ChatPipeline>,
}

#[derive(Debug, Deserialize)]
struct AppConfig {
    server: ServerCfg,
    chat_defaults: Option<ChatDefaultsCfg>,
    embedding_provider: EmbedCfgYaml,
    vector_store: VectorStoreCfg,
    store: StoreCfg,
    llm: Option<LlmCfg>,
    agents: Vec<Agent>,
}

#[derive(Debug, Deserialize)]
struct ServerCfg {
    host: String,
    port: u16,
}

#[derive(Debug, Deserialize)]
struct ChatDefaultsCfg {
    strategy: Option<String>,
    rerank_enabled: Option<bool>,
    rerank_model: Option<String>,
    /// Cohere 凭证的环境变量名
    cohere_api_key_env: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EmbedCfgYaml {
    kind: String,
    base_url: Option<String>,
    api_key_env: Option<String>,
    model: String,
}

#[derive(Debug, Deserialize)]
struct VectorStoreCfg {
    kind: String,
    url: Option<String>,
    collection: Option<String>,
    vector_size: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct StoreCfg {
    kind: String,
    path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LlmCfg {
    timeout_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    dotenv().ok();

    let cfg: AppConfig = load_config()?;
    let llm_timeout_ms = cfg.llm.as_ref().and_then(|l| l.timeout_ms).unwrap_or(60_000);

    let embed_cfg = match cfg.embedding_provider.kind.as_str() {
        "openai_compat" => EmbedProviderConfig::OpenAiCompat {
            base_url: cfg
                .embedding_provider
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com".into()),
            api_key: read_env(
                &cfg.embedding_provider
                    .api_key_env
                    .clone()
                    .unwrap_or_else(|| "OPENAI_API_KEY".into()),
            )?,
            model: cfg.embedding_provider.model.clone(),
        },
        other => anyhow::bail!("unsupported embedding provider kind={}", other),
    };
    let embed: Arc<dyn qa_llm::EmbedModel> =
        Arc::from(qa_llm::make_embed_model(embed_cfg, llm_timeout_ms));

    let index: Arc<dyn VectorIndex> = match cfg.vector_store.kind.as_str() {
        "qdrant" => {
            let url = cfg
                .vector_store
                .url
                .clone()
                .unwrap_or_else(|| "http://localhost:6334".into());
            let collection = cfg
                .vector_store
                .collection
                .clone()
                .unwrap_or_else(|| "qa_chunks".into());
            let vector_size = cfg.vector_store.vector_size.unwrap_or(1536);
            info!(%url, %collection, "使用 Qdrant 向量索引");
            Arc::new(QdrantVectorIndex::new(&url, collection, vector_size).await?)
        }
        _ => {
            info!("使用内存向量索引");
            Arc::new(MemoryVectorIndex::new())
        }
    };

    let store: Arc<dyn ChatStore> = match cfg.store.kind.as_str() {
        "sled" => {
            let path = cfg
                .store
                .path
                .clone()
                .unwrap_or_else(|| "data/chat".into());
            let db = sled::open(&path)?;
            info!(%path, "使用 sled 消息存储");
            Arc::new(SledChatStore::open(&db)?)
        }
        _ => {
            info!("使用内存消息存储");
            Arc::new(MemoryChatStore::new())
        }
    };

    let defaults = match cfg.chat_defaults.as_ref() {
        Some(d) => StrategyDefaults {
            strategy: d
                .strategy
                .as_deref()
                .map(|s| s.parse::<SearchStrategy>())
                .transpose()?
                .unwrap_or(SearchStrategy::Hybrid),
            rerank_enabled: d.rerank_enabled.unwrap_or(true),
            rerank_model: d.rerank_model.clone(),
        },
        None => StrategyDefaults::default(),
    };
    let cohere_api_key = cfg
        .chat_defaults
        .as_ref()
        .and_then(|d| d.cohere_api_key_env.as_ref())
        .and_then(|env| std::env::var(env).ok());

    let retriever = Arc::new(Retriever::new(index, embed, RetrieverConfig::default()));
    let generator = AnswerGenerator::new(
        Arc::new(EnvChatModels::new(llm_timeout_ms)),
        GeneratorConfig {
            timeout_ms: llm_timeout_ms,
            ..GeneratorConfig::default()
        },
    );
    let agents = Arc::new(StaticAgentDirectory::new(cfg.agents));

    let pipeline = Arc::new(ChatPipeline::new(
        agents,
        store,
        retriever,
        generator,
        PipelineConfig {
            defaults,
            cohere_api_key,
            rerank_timeout_ms: 5_000,
        },
    ));

    let state = AppState { pipeline };
    let app = chat_routes::router(state);

    let addr: SocketAddr = format!("{}:{}", cfg.server.host, cfg.server.port).parse()?;
    tracing::info!(%addr, "qa-api listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};
    let fmt_layer = fmt::layer().with_target(false);
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,tower_http=info"))
        .unwrap();
    let subscriber = Registry::default().with(filter).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber).ok();
}

fn load_config() -> anyhow::Result<AppConfig> {
    let s = std::fs::read_to_string("configs/default.yaml")?;
    let cfg: AppConfig = serde_yaml::from_str(&s)?;
    info!(
        agents = cfg.agents.len(),
        vector_store = %cfg.vector_store.kind,
        store = %cfg.store.kind,
        "load_config"
    );
    Ok(cfg)
}

fn read_env(key: &str) -> anyhow::Result<String> {
    std::env::var(key).map_err(|_| anyhow::anyhow!("missing env {}", key))
}
