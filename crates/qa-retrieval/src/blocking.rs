use qa_core::AssembledContext;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// 拦截原因：随响应返回，便于解释为什么没有生成回答
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    NoRelevantSources,
    BelowConfidenceThreshold,
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockReason::NoRelevantSources => "no_relevant_sources",
            BlockReason::BelowConfidenceThreshold => "below_confidence_threshold",
        }
    }
}

/// 证据充分性判定。拦截是正常控制流分支，不是错误。
/// 阈值来自 Agent 级配置，不在此处写死。
#[derive(Debug, Clone)]
pub struct BlockingPolicy {
    pub min_confidence: f32,
}

impl BlockingPolicy {
    pub fn new(min_confidence: f32) -> Self {
        Self { min_confidence }
    }

    /// 返回 Some(reason) 表示应拦截，None 表示可以进入生成阶段
    pub fn evaluate(&self, ctx: &AssembledContext) -> Option<BlockReason> {
        // 零来源时无条件拦截
        if ctx.source_count == 0 {
            return Some(BlockReason::NoRelevantSources);
        }

        let best = ctx.best_score().unwrap_or(0.0);
        if best < self.min_confidence {
            debug!(
                best_score = best,
                threshold = self.min_confidence,
                "最佳分数低于置信阈值，拦截生成"
            );
            return Some(BlockReason::BelowConfidenceThreshold);
        }

        None
    }
}
