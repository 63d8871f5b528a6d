//! 对话层：Agent 目录、会话与消息存储、回答生成、单轮问答管线。

pub mod agent;
pub mod generate;
pub mod pipeline;
pub mod store;

pub use agent::{AgentDirectory, StaticAgentDirectory};
pub use generate::{AnswerGenerator, ChatModels, EnvChatModels, GeneratorConfig};
pub use pipeline::{ChatPipeline, PipelineConfig};
pub use store::{ChatStore, MemoryChatStore, SessionLocks, SledChatStore};
