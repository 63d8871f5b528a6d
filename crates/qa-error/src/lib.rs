use serde::{Deserialize, Serialize};
use thiserror::Error;

#[cfg(feature = "axum")]
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json},
};

/// 系统统一错误类型
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum QaError {
    // === 业务错误 ===
    #[error("资源未找到: {resource}")]
    NotFound { resource: String },

    #[error("请求无效: {reason}")]
    InvalidRequest { reason: String },

    #[error("权限不足: {operation}")]
    Unauthorized { operation: String },

    // === 外部服务错误 ===
    #[error("检索失败: {operation}")]
    RetrievalFailed {
        operation: String,
        message: String,
        #[serde(skip)]
        retry_after: Option<std::time::Duration>,
    },

    #[error("生成失败 ({provider})")]
    GenerationFailed {
        provider: String,
        message: String,
        #[serde(skip)]
        retry_after: Option<std::time::Duration>,
    },

    #[error("向量存储错误: {operation} 失败")]
    VectorStore { operation: String, message: String },

    // === 系统错误 ===
    #[error("内部系统错误: {message}")]
    Internal {
        message: String,
        details: Option<String>,
    },

    #[error("配置错误: {key} - {reason}")]
    Configuration { key: String, reason: String },

    #[error("序列化错误: {format}")]
    Serialization { format: String, message: String },

    #[error("网络错误: {operation}")]
    Network { operation: String, message: String },

    #[error("超时错误: {operation} 超过 {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("并发错误: {operation}")]
    Concurrency { operation: String, message: String },
}

/// 错误严重级别
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Low,      // 可预期的业务错误
    Medium,   // 技术错误但不影响核心功能
    High,     // 影响核心功能的错误
    Critical, // 系统级严重错误
}

impl QaError {
    /// 获取错误的严重级别
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            QaError::NotFound { .. } | QaError::InvalidRequest { .. } => ErrorSeverity::Low,
            QaError::Unauthorized { .. } => ErrorSeverity::Medium,
            QaError::RetrievalFailed { .. }
            | QaError::GenerationFailed { .. }
            | QaError::Network { .. }
            | QaError::Timeout { .. } => ErrorSeverity::Medium,
            QaError::VectorStore { .. }
            | QaError::Serialization { .. }
            | QaError::Concurrency { .. } => ErrorSeverity::High,
            QaError::Internal { .. } | QaError::Configuration { .. } => ErrorSeverity::Critical,
        }
    }

    /// 是否为可重试错误
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            QaError::RetrievalFailed { .. }
                | QaError::GenerationFailed { .. }
                | QaError::Network { .. }
                | QaError::Timeout { .. }
                | QaError::Concurrency { .. }
        )
    }

    /// 获取重试延迟时间
    pub fn retry_after(&self) -> Option<std::time::Duration> {
        match self {
            QaError::RetrievalFailed { retry_after, .. }
            | QaError::GenerationFailed { retry_after, .. } => *retry_after,
            QaError::Network { .. } => Some(std::time::Duration::from_millis(500)),
            QaError::Timeout { .. } => Some(std::time::Duration::from_millis(1000)),
            QaError::Concurrency { .. } => Some(std::time::Duration::from_millis(100)),
            _ => None,
        }
    }

    /// 转换为 HTTP 状态码
    pub fn to_http_status(&self) -> u16 {
        match self {
            QaError::NotFound { .. } => 404,
            QaError::InvalidRequest { .. } => 400,
            QaError::Unauthorized { .. } => 401,
            QaError::RetrievalFailed { .. } | QaError::VectorStore { .. } => 502,
            QaError::GenerationFailed { .. } => 502,
            QaError::Timeout { .. } => 504,
            _ => 500,
        }
    }

    /// 获取用户友好的错误消息
    pub fn user_message(&self) -> String {
        match self {
            QaError::NotFound { .. } => "请求的资源不存在".to_string(),
            QaError::InvalidRequest { .. } => "请求参数有误，请检查后重试".to_string(),
            QaError::Unauthorized { .. } => "没有权限执行此操作".to_string(),
            QaError::RetrievalFailed { .. } | QaError::VectorStore { .. } => {
                "知识库检索暂时不可用，请稍后重试".to_string()
            }
            QaError::GenerationFailed { .. } => "回答生成失败，请稍后重试".to_string(),
            QaError::Timeout { .. } => "请求超时，请重试".to_string(),
            _ => "系统内部错误，请联系管理员".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, QaError>;

// === 转换实现 ===

impl From<serde_json::Error> for QaError {
    fn from(err: serde_json::Error) -> Self {
        QaError::Serialization {
            format: "json".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for QaError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            QaError::Timeout {
                operation: "http_request".to_string(),
                timeout_ms: 30000,
            }
        } else if err.is_connect() {
            QaError::Network {
                operation: "connect".to_string(),
                message: err.to_string(),
            }
        } else {
            QaError::Network {
                operation: "http_request".to_string(),
                message: err.to_string(),
            }
        }
    }
}

impl From<uuid::Error> for QaError {
    fn from(err: uuid::Error) -> Self {
        QaError::Serialization {
            format: "uuid".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<tokio::task::JoinError> for QaError {
    fn from(err: tokio::task::JoinError) -> Self {
        QaError::Concurrency {
            operation: "task_join".to_string(),
            message: err.to_string(),
        }
    }
}

// Axum integration
#[cfg(feature = "axum")]
impl IntoResponse for QaError {
    fn into_response(self) -> axum::response::Response {
        let status_code = match self {
            QaError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            QaError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            QaError::NotFound { .. } => StatusCode::NOT_FOUND,
            QaError::RetrievalFailed { .. }
            | QaError::GenerationFailed { .. }
            | QaError::VectorStore { .. } => StatusCode::BAD_GATEWAY,
            QaError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = serde_json::json!({
            "error": self.to_string(),
            "message": self.user_message()
        });

        (status_code, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(
            QaError::NotFound {
                resource: "session".into()
            }
            .to_http_status(),
            404
        );
        assert_eq!(
            QaError::InvalidRequest {
                reason: "bad strategy".into()
            }
            .to_http_status(),
            400
        );
        assert_eq!(
            QaError::RetrievalFailed {
                operation: "vector_search".into(),
                message: "down".into(),
                retry_after: None,
            }
            .to_http_status(),
            502
        );
        assert_eq!(
            QaError::Timeout {
                operation: "generate".into(),
                timeout_ms: 1000
            }
            .to_http_status(),
            504
        );
    }

    #[test]
    fn test_retryability() {
        assert!(QaError::RetrievalFailed {
            operation: "search".into(),
            message: "unavailable".into(),
            retry_after: None,
        }
        .is_retryable());
        assert!(!QaError::InvalidRequest {
            reason: "unknown strategy".into()
        }
        .is_retryable());
        assert!(!QaError::Unauthorized {
            operation: "rate_message".into()
        }
        .is_retryable());
    }
}
