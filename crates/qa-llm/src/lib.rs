use async_trait::async_trait;
use qa_core::{ProviderKind, Role};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::instrument;

pub use qa_error::{QaError, Result};

/// 一次生成调用的完整输入：系统提示词 + 按原始顺序的历史 + 已组装上下文 + 当前问题
#[derive(Debug, Clone)]
pub struct ChatPrompt {
    pub system: String,
    pub history: Vec<HistoryTurn>,
    pub context: Option<String>,
    pub user: String,
    pub temperature: f32,
}

#[derive(Debug, Clone)]
pub struct HistoryTurn {
    pub role: Role,
    pub content: String,
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn chat(&self, prompt: &ChatPrompt) -> Result<String>;
}

#[async_trait]
pub trait EmbedModel: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

fn retry_after_for_status(status: reqwest::StatusCode) -> Option<Duration> {
    if status.as_u16() == 429 || status.is_server_error() {
        Some(Duration::from_secs(2))
    } else {
        None
    }
}

// ========== OpenAI-compatible (covers OpenAI, DeepSeek, some Qwen proxies) ==========

#[derive(Clone)]
pub struct OpenAiCompatConfig {
    pub base_url: String,                // e.g. https://api.openai.com
    pub api_key: String,                 // Bearer token
    pub chat_model: String,              // e.g. gpt-4o, deepseek-chat
    pub embedding_model: Option<String>, // e.g. text-embedding-3-small
    pub timeout_ms: u64,
}

#[derive(Clone)]
pub struct OpenAiCompatClient {
    http: Client,
    cfg: OpenAiCompatConfig,
}

impl OpenAiCompatClient {
    pub fn new(cfg: OpenAiCompatConfig) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { http, cfg }
    }
}

#[derive(Serialize)]
struct OaiChatReqMsg {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct OaiChatReq {
    model: String,
    messages: Vec<OaiChatReqMsg>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Deserialize)]
struct OaiChatRespChoiceMsg {
    content: String,
}

#[derive(Deserialize)]
struct OaiChatRespChoice {
    message: OaiChatRespChoiceMsg,
}

#[derive(Deserialize)]
struct OaiChatResp {
    choices: Vec<OaiChatRespChoice>,
}

fn user_content(prompt: &ChatPrompt) -> String {
    match prompt.context.as_deref() {
        Some(ctx) => format!("{}\n\nContext:\n{}", prompt.user, ctx),
        None => prompt.user.clone(),
    }
}

#[async_trait]
impl ChatModel for OpenAiCompatClient {
    #[instrument(skip(self, prompt))]
    async fn chat(&self, prompt: &ChatPrompt) -> Result<String> {
        let url = format!(
            "{}/v1/chat/completions",
            self.cfg.base_url.trim_end_matches('/')
        );
        let mut messages = vec![OaiChatReqMsg {
            role: "system".into(),
            content: prompt.system.clone(),
        }];
        for turn in &prompt.history {
            messages.push(OaiChatReqMsg {
                role: role_name(turn.role).into(),
                content: turn.content.clone(),
            });
        }
        messages.push(OaiChatReqMsg {
            role: "user".into(),
            content: user_content(prompt),
        });

        let body = OaiChatReq {
            model: self.cfg.chat_model.clone(),
            messages,
            temperature: Some(prompt.temperature),
        };

        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.cfg.api_key)
            .json(&body)
            .send()
            .await
            .map_err(QaError::from)?;

        if !resp.status().is_success() {
            let status = resp.status();
            let txt = resp.text().await.unwrap_or_default();
            return Err(QaError::GenerationFailed {
                provider: "openai_compat".to_string(),
                message: format!("status={} body={}", status, txt),
                retry_after: retry_after_for_status(status),
            });
        }

        let data: OaiChatResp = resp.json().await.map_err(QaError::from)?;
        let content = data
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .unwrap_or_default();
        Ok(content)
    }
}

#[derive(Serialize)]
struct OaiEmbedReq {
    model: String,
    input: Vec<String>,
}

#[derive(Deserialize)]
struct OaiEmbedData {
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct OaiEmbedResp {
    data: Vec<OaiEmbedData>,
}

#[async_trait]
impl EmbedModel for OpenAiCompatClient {
    #[instrument(skip(self, texts))]
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let model = self
            .cfg
            .embedding_model
            .clone()
            .ok_or_else(|| QaError::Configuration {
                key: "embedding_model".to_string(),
                reason: "not configured".to_string(),
            })?;
        let url = format!("{}/v1/embeddings", self.cfg.base_url.trim_end_matches('/'));
        let body = OaiEmbedReq {
            model,
            input: texts.to_vec(),
        };

        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.cfg.api_key)
            .json(&body)
            .send()
            .await
            .map_err(QaError::from)?;

        if !resp.status().is_success() {
            let status = resp.status();
            let txt = resp.text().await.unwrap_or_default();
            return Err(QaError::RetrievalFailed {
                operation: "embed".to_string(),
                message: format!("status={} body={}", status, txt),
                retry_after: retry_after_for_status(status),
            });
        }

        let data: OaiEmbedResp = resp.json().await.map_err(QaError::from)?;
        Ok(data.data.into_iter().map(|d| d.embedding).collect())
    }
}

// ========== Anthropic (Claude) ==========

#[derive(Clone)]
pub struct AnthropicConfig {
    pub api_key: String,
    pub model: String,   // e.g. claude-3-5-sonnet-latest
    pub api_url: String, // default https://api.anthropic.com
    pub timeout_ms: u64,
}

#[derive(Clone)]
pub struct AnthropicClient {
    http: Client,
    cfg: AnthropicConfig,
}

impl AnthropicClient {
    pub fn new(cfg: AnthropicConfig) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { http, cfg }
    }
}

#[derive(Serialize)]
struct AnthMessageReqMsg {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct AnthMessageReq {
    model: String,
    system: String,
    messages: Vec<AnthMessageReqMsg>,
    max_tokens: u32,
    temperature: Option<f32>,
}

#[derive(Deserialize)]
struct AnthMessageRespContent {
    #[allow(dead_code)]
    r#type: String,
    text: Option<String>,
}

#[derive(Deserialize)]
struct AnthMessageResp {
    content: Vec<AnthMessageRespContent>,
}

#[async_trait]
impl ChatModel for AnthropicClient {
    #[instrument(skip(self, prompt))]
    async fn chat(&self, prompt: &ChatPrompt) -> Result<String> {
        let url = format!("{}/v1/messages", self.cfg.api_url.trim_end_matches('/'));
        let mut messages: Vec<AnthMessageReqMsg> = prompt
            .history
            .iter()
            .map(|turn| AnthMessageReqMsg {
                role: role_name(turn.role),
                content: turn.content.clone(),
            })
            .collect();
        messages.push(AnthMessageReqMsg {
            role: "user",
            content: user_content(prompt),
        });

        let body = AnthMessageReq {
            model: self.cfg.model.clone(),
            system: prompt.system.clone(),
            messages,
            max_tokens: 2048,
            temperature: Some(prompt.temperature),
        };

        let resp = self
            .http
            .post(url)
            .header("x-api-key", &self.cfg.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(QaError::from)?;

        if !resp.status().is_success() {
            let status = resp.status();
            let txt = resp.text().await.unwrap_or_default();
            return Err(QaError::GenerationFailed {
                provider: "anthropic".to_string(),
                message: format!("status={} body={}", status, txt),
                retry_after: retry_after_for_status(status),
            });
        }

        let data: AnthMessageResp = resp.json().await.map_err(QaError::from)?;
        let mut out = String::new();
        for c in data.content.into_iter() {
            if let Some(t) = c.text {
                out.push_str(&t);
            }
        }
        Ok(out)
    }
}

// ========== Provider Factory & Config ==========

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum EmbedProviderConfig {
    #[serde(rename = "openai_compat")]
    OpenAiCompat {
        base_url: String,
        api_key: String,
        model: String,
    },
}

/// 按 Agent 配置构建聊天模型客户端。凭证由调用方解析后传入，
/// 本层不触碰环境变量（可测试性要求）。
pub fn make_chat_model(
    provider: ProviderKind,
    base_url: Option<String>,
    model: String,
    api_key: String,
    timeout_ms: u64,
) -> Box<dyn ChatModel> {
    match provider {
        ProviderKind::OpenaiCompat => Box::new(OpenAiCompatClient::new(OpenAiCompatConfig {
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com".into()),
            api_key,
            chat_model: model,
            embedding_model: None,
            timeout_ms,
        })),
        ProviderKind::Anthropic => Box::new(AnthropicClient::new(AnthropicConfig {
            api_url: base_url.unwrap_or_else(|| "https://api.anthropic.com".into()),
            api_key,
            model,
            timeout_ms,
        })),
    }
}

pub fn make_embed_model(cfg: EmbedProviderConfig, timeout_ms: u64) -> Box<dyn EmbedModel> {
    match cfg {
        EmbedProviderConfig::OpenAiCompat {
            base_url,
            api_key,
            model,
        } => Box::new(OpenAiCompatClient::new(OpenAiCompatConfig {
            base_url,
            api_key,
            chat_model: "".into(),
            embedding_model: Some(model),
            timeout_ms,
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_content_appends_context() {
        let prompt = ChatPrompt {
            system: "sys".into(),
            history: vec![],
            context: Some("[1] 片段".into()),
            user: "问题".into(),
            temperature: 0.2,
        };
        let content = user_content(&prompt);
        assert!(content.starts_with("问题"));
        assert!(content.contains("Context:\n[1] 片段"));

        let bare = ChatPrompt {
            context: None,
            ..prompt
        };
        assert_eq!(user_content(&bare), "问题");
    }

    #[test]
    fn test_retry_after_for_status() {
        assert!(retry_after_for_status(reqwest::StatusCode::TOO_MANY_REQUESTS).is_some());
        assert!(retry_after_for_status(reqwest::StatusCode::BAD_GATEWAY).is_some());
        assert!(retry_after_for_status(reqwest::StatusCode::BAD_REQUEST).is_none());
        assert!(retry_after_for_status(reqwest::StatusCode::OK).is_none());
    }
}
