use async_trait::async_trait;
use chrono::Utc;
use qa_core::{ChatMessage, ChatSession, MessageContextMeta, Rating, Role};
use qa_error::{QaError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, instrument};
use uuid::Uuid;

/// 会话与消息存储。消息追加写入，仅评分字段可覆盖。
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn create_session(&self, agent_id: Uuid, user_id: Uuid) -> Result<ChatSession>;

    /// 读取会话并校验归属：不存在 → NotFound，非本人 → Unauthorized
    async fn get_session(&self, session_id: Uuid, user_id: Uuid) -> Result<ChatSession>;

    async fn list_sessions(
        &self,
        user_id: Uuid,
        agent_id: Option<Uuid>,
    ) -> Result<Vec<ChatSession>>;

    /// 追加消息，seq 在会话内严格递增
    async fn append_message(
        &self,
        session_id: Uuid,
        role: Role,
        content: String,
        context: Option<MessageContextMeta>,
    ) -> Result<ChatMessage>;

    /// 按 seq 升序返回会话全部消息
    async fn history(&self, session_id: Uuid) -> Result<Vec<ChatMessage>>;

    /// 评分：仅助手消息可评，后写覆盖先写
    async fn rate_message(
        &self,
        message_id: Uuid,
        user_id: Uuid,
        rating: Rating,
        comment: Option<String>,
    ) -> Result<ChatMessage>;
}

/// 会话级互斥锁表：同一会话的轮次串行执行，不同会话互不阻塞
#[derive(Default)]
pub struct SessionLocks {
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, session_id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        // 顺手回收已无持有者的条目，锁表不随会话数无限增长
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks
            .entry(session_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// 当前锁表中的条目数
    pub async fn tracked(&self) -> usize {
        self.locks.lock().await.len()
    }
}

fn rating_precheck(message: &ChatMessage) -> Result<()> {
    if message.role != Role::Assistant {
        return Err(QaError::InvalidRequest {
            reason: "只有助手消息可以评分".to_string(),
        });
    }
    Ok(())
}

// ===== 内存实现 =====

#[derive(Default)]
struct MemoryInner {
    sessions: HashMap<Uuid, ChatSession>,
    /// session_id -> 按 seq 升序的消息列表
    messages: HashMap<Uuid, Vec<ChatMessage>>,
    /// message_id -> session_id
    message_index: HashMap<Uuid, Uuid>,
}

/// 内存存储：测试与单机演示使用
#[derive(Default)]
pub struct MemoryChatStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChatStore for MemoryChatStore {
    async fn create_session(&self, agent_id: Uuid, user_id: Uuid) -> Result<ChatSession> {
        let now = Utc::now();
        let session = ChatSession {
            id: Uuid::new_v4(),
            agent_id,
            user_id,
            created_at: now,
            updated_at: now,
        };
        let mut inner = self.inner.write().await;
        inner.sessions.insert(session.id, session.clone());
        Ok(session)
    }

    async fn get_session(&self, session_id: Uuid, user_id: Uuid) -> Result<ChatSession> {
        let inner = self.inner.read().await;
        let session = inner
            .sessions
            .get(&session_id)
            .ok_or_else(|| QaError::NotFound {
                resource: format!("session {}", session_id),
            })?;
        if session.user_id != user_id {
            return Err(QaError::Unauthorized {
                operation: "access_session".to_string(),
            });
        }
        Ok(session.clone())
    }

    async fn list_sessions(
        &self,
        user_id: Uuid,
        agent_id: Option<Uuid>,
    ) -> Result<Vec<ChatSession>> {
        let inner = self.inner.read().await;
        let mut sessions: Vec<ChatSession> = inner
            .sessions
            .values()
            .filter(|s| s.user_id == user_id)
            .filter(|s| agent_id.map(|a| s.agent_id == a).unwrap_or(true))
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions)
    }

    async fn append_message(
        &self,
        session_id: Uuid,
        role: Role,
        content: String,
        context: Option<MessageContextMeta>,
    ) -> Result<ChatMessage> {
        let mut guard = self.inner.write().await;
        let inner = &mut *guard;
        if !inner.sessions.contains_key(&session_id) {
            return Err(QaError::NotFound {
                resource: format!("session {}", session_id),
            });
        }

        let messages = inner.messages.entry(session_id).or_default();
        let seq = messages.last().map(|m| m.seq + 1).unwrap_or(0);
        let message = ChatMessage {
            id: Uuid::new_v4(),
            session_id,
            seq,
            role,
            content,
            created_at: Utc::now(),
            rating: None,
            rating_comment: None,
            context,
        };
        messages.push(message.clone());
        inner.message_index.insert(message.id, session_id);
        if let Some(session) = inner.sessions.get_mut(&session_id) {
            session.updated_at = message.created_at;
        }
        Ok(message)
    }

    async fn history(&self, session_id: Uuid) -> Result<Vec<ChatMessage>> {
        let inner = self.inner.read().await;
        Ok(inner.messages.get(&session_id).cloned().unwrap_or_default())
    }

    async fn rate_message(
        &self,
        message_id: Uuid,
        user_id: Uuid,
        rating: Rating,
        comment: Option<String>,
    ) -> Result<ChatMessage> {
        let mut inner = self.inner.write().await;
        let session_id = *inner
            .message_index
            .get(&message_id)
            .ok_or_else(|| QaError::NotFound {
                resource: format!("message {}", message_id),
            })?;
        let owner = inner
            .sessions
            .get(&session_id)
            .map(|s| s.user_id)
            .ok_or_else(|| QaError::NotFound {
                resource: format!("session {}", session_id),
            })?;
        if owner != user_id {
            return Err(QaError::Unauthorized {
                operation: "rate_message".to_string(),
            });
        }

        let messages = inner.messages.get_mut(&session_id).ok_or_else(|| {
            QaError::NotFound {
                resource: format!("message {}", message_id),
            }
        })?;
        let message = messages
            .iter_mut()
            .find(|m| m.id == message_id)
            .ok_or_else(|| QaError::NotFound {
                resource: format!("message {}", message_id),
            })?;
        rating_precheck(message)?;
        message.rating = Some(rating);
        message.rating_comment = comment;
        Ok(message.clone())
    }
}

// ===== sled 实现 =====

const SESSIONS_TREE: &str = "sessions";
const MESSAGES_TREE: &str = "messages";
const MESSAGE_INDEX_TREE: &str = "message_index";

fn sled_err(operation: &str, e: sled::Error) -> QaError {
    QaError::Internal {
        message: format!("存储操作失败: {}", operation),
        details: Some(e.to_string()),
    }
}

/// 消息键：session_id (16 字节) + seq 大端编码 (8 字节)，
/// 前缀扫描即按 seq 升序返回
fn message_key(session_id: Uuid, seq: i64) -> [u8; 24] {
    let mut key = [0u8; 24];
    key[..16].copy_from_slice(session_id.as_bytes());
    key[16..].copy_from_slice(&(seq as u64).to_be_bytes());
    key
}

/// 基于 sled 的持久化存储
pub struct SledChatStore {
    sessions: sled::Tree,
    messages: sled::Tree,
    message_index: sled::Tree,
    /// seq 分配在会话级锁内完成：同会话并发追加不重号，不同会话互不阻塞
    locks: SessionLocks,
}

impl SledChatStore {
    pub fn open(db: &sled::Db) -> Result<Self> {
        Ok(Self {
            sessions: db
                .open_tree(SESSIONS_TREE)
                .map_err(|e| sled_err("open_tree", e))?,
            messages: db
                .open_tree(MESSAGES_TREE)
                .map_err(|e| sled_err("open_tree", e))?,
            message_index: db
                .open_tree(MESSAGE_INDEX_TREE)
                .map_err(|e| sled_err("open_tree", e))?,
            locks: SessionLocks::new(),
        })
    }

    fn load_session(&self, session_id: Uuid) -> Result<ChatSession> {
        let bytes = self
            .sessions
            .get(session_id.as_bytes())
            .map_err(|e| sled_err("get_session", e))?
            .ok_or_else(|| QaError::NotFound {
                resource: format!("session {}", session_id),
            })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn save_session(&self, session: &ChatSession) -> Result<()> {
        self.sessions
            .insert(session.id.as_bytes(), serde_json::to_vec(session)?)
            .map_err(|e| sled_err("save_session", e))?;
        Ok(())
    }

    fn save_message(&self, message: &ChatMessage) -> Result<()> {
        let key = message_key(message.session_id, message.seq);
        self.messages
            .insert(key, serde_json::to_vec(message)?)
            .map_err(|e| sled_err("save_message", e))?;
        self.message_index
            .insert(message.id.as_bytes(), &key[..])
            .map_err(|e| sled_err("save_message_index", e))?;
        Ok(())
    }

    fn next_seq(&self, session_id: Uuid) -> Result<i64> {
        let last = self
            .messages
            .scan_prefix(session_id.as_bytes())
            .last()
            .transpose()
            .map_err(|e| sled_err("scan_messages", e))?;
        match last {
            Some((key, _)) => {
                let mut seq_bytes = [0u8; 8];
                seq_bytes.copy_from_slice(&key[16..24]);
                Ok(u64::from_be_bytes(seq_bytes) as i64 + 1)
            }
            None => Ok(0),
        }
    }
}

#[async_trait]
impl ChatStore for SledChatStore {
    #[instrument(skip(self))]
    async fn create_session(&self, agent_id: Uuid, user_id: Uuid) -> Result<ChatSession> {
        let now = Utc::now();
        let session = ChatSession {
            id: Uuid::new_v4(),
            agent_id,
            user_id,
            created_at: now,
            updated_at: now,
        };
        self.save_session(&session)?;
        debug!(session_id = %session.id, "会话已创建");
        Ok(session)
    }

    async fn get_session(&self, session_id: Uuid, user_id: Uuid) -> Result<ChatSession> {
        let session = self.load_session(session_id)?;
        if session.user_id != user_id {
            return Err(QaError::Unauthorized {
                operation: "access_session".to_string(),
            });
        }
        Ok(session)
    }

    async fn list_sessions(
        &self,
        user_id: Uuid,
        agent_id: Option<Uuid>,
    ) -> Result<Vec<ChatSession>> {
        let mut sessions = Vec::new();
        for entry in self.sessions.iter() {
            let (_, bytes) = entry.map_err(|e| sled_err("iter_sessions", e))?;
            let session: ChatSession = serde_json::from_slice(&bytes)?;
            if session.user_id == user_id
                && agent_id.map(|a| session.agent_id == a).unwrap_or(true)
            {
                sessions.push(session);
            }
        }
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions)
    }

    #[instrument(skip(self, content, context))]
    async fn append_message(
        &self,
        session_id: Uuid,
        role: Role,
        content: String,
        context: Option<MessageContextMeta>,
    ) -> Result<ChatMessage> {
        let lock = self.locks.acquire(session_id).await;
        let _guard = lock.lock().await;
        let mut session = self.load_session(session_id)?;

        let message = ChatMessage {
            id: Uuid::new_v4(),
            session_id,
            seq: self.next_seq(session_id)?,
            role,
            content,
            created_at: Utc::now(),
            rating: None,
            rating_comment: None,
            context,
        };
        self.save_message(&message)?;

        session.updated_at = message.created_at;
        self.save_session(&session)?;
        Ok(message)
    }

    async fn history(&self, session_id: Uuid) -> Result<Vec<ChatMessage>> {
        let mut messages = Vec::new();
        for entry in self.messages.scan_prefix(session_id.as_bytes()) {
            let (_, bytes) = entry.map_err(|e| sled_err("scan_messages", e))?;
            messages.push(serde_json::from_slice(&bytes)?);
        }
        Ok(messages)
    }

    #[instrument(skip(self, comment))]
    async fn rate_message(
        &self,
        message_id: Uuid,
        user_id: Uuid,
        rating: Rating,
        comment: Option<String>,
    ) -> Result<ChatMessage> {
        // 评分整值覆盖写入，后写覆盖先写，无需持锁
        let key = self
            .message_index
            .get(message_id.as_bytes())
            .map_err(|e| sled_err("get_message_index", e))?
            .ok_or_else(|| QaError::NotFound {
                resource: format!("message {}", message_id),
            })?;
        let bytes = self
            .messages
            .get(&key)
            .map_err(|e| sled_err("get_message", e))?
            .ok_or_else(|| QaError::NotFound {
                resource: format!("message {}", message_id),
            })?;
        let mut message: ChatMessage = serde_json::from_slice(&bytes)?;

        let session = self.load_session(message.session_id)?;
        if session.user_id != user_id {
            return Err(QaError::Unauthorized {
                operation: "rate_message".to_string(),
            });
        }
        rating_precheck(&message)?;

        message.rating = Some(rating);
        message.rating_comment = comment;
        self.save_message(&message)?;
        Ok(message)
    }
}
