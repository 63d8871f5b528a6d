use qa_core::{AgentRetrievalConfig, Result, SearchStrategy};
use serde::{Deserialize, Serialize};

/// 全局检索默认值，由配置显式传入，不做进程级单例
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyDefaults {
    pub strategy: SearchStrategy,
    pub rerank_enabled: bool,
    pub rerank_model: Option<String>,
}

impl Default for StrategyDefaults {
    fn default() -> Self {
        Self {
            strategy: SearchStrategy::Hybrid,
            rerank_enabled: true,
            rerank_model: None,
        }
    }
}

/// 单次请求携带的覆盖项
#[derive(Debug, Clone, Default)]
pub struct StrategyOverride {
    pub strategy: Option<SearchStrategy>,
    pub rerank_enabled: Option<bool>,
    pub rerank_model: Option<String>,
}

impl StrategyOverride {
    /// 从请求中的原始字符串解析；未知策略名返回 InvalidRequest
    pub fn parse(
        strategy: Option<&str>,
        rerank_enabled: Option<bool>,
        rerank_model: Option<String>,
    ) -> Result<Self> {
        let strategy = match strategy {
            Some(s) => Some(s.parse::<SearchStrategy>()?),
            None => None,
        };
        Ok(Self {
            strategy,
            rerank_enabled,
            rerank_model,
        })
    }
}

/// 解析后的生效策略
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveStrategy {
    pub strategy: SearchStrategy,
    pub rerank_enabled: bool,
    pub rerank_model: Option<String>,
}

/// 策略路由：请求覆盖 > Agent 默认 > 全局默认。纯函数，无副作用。
pub fn resolve_strategy(
    req: &StrategyOverride,
    agent: &AgentRetrievalConfig,
    defaults: &StrategyDefaults,
) -> EffectiveStrategy {
    let strategy = req
        .strategy
        .or(agent.default_strategy)
        .unwrap_or(defaults.strategy);

    let rerank_enabled = match strategy {
        // hybrid_no_rerank 强制关闭重排
        SearchStrategy::HybridNoRerank => false,
        _ => req
            .rerank_enabled
            .or(agent.rerank_enabled)
            .unwrap_or(defaults.rerank_enabled),
    };

    let rerank_model = req
        .rerank_model
        .clone()
        .or_else(|| agent.rerank_model.clone())
        .or_else(|| defaults.rerank_model.clone());

    EffectiveStrategy {
        strategy,
        rerank_enabled,
        rerank_model,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qa_core::QaError;

    #[test]
    fn test_global_default_is_hybrid_with_rerank() {
        let effective = resolve_strategy(
            &StrategyOverride::default(),
            &AgentRetrievalConfig::default(),
            &StrategyDefaults::default(),
        );
        assert_eq!(effective.strategy, SearchStrategy::Hybrid);
        assert!(effective.rerank_enabled);
    }

    #[test]
    fn test_agent_default_beats_global() {
        let agent = AgentRetrievalConfig {
            default_strategy: Some(SearchStrategy::SemanticOnly),
            rerank_enabled: Some(false),
            ..AgentRetrievalConfig::default()
        };
        let effective = resolve_strategy(
            &StrategyOverride::default(),
            &agent,
            &StrategyDefaults::default(),
        );
        assert_eq!(effective.strategy, SearchStrategy::SemanticOnly);
        assert!(!effective.rerank_enabled);
    }

    #[test]
    fn test_agent_rerank_on_beats_global_off() {
        let agent = AgentRetrievalConfig {
            rerank_enabled: Some(true),
            ..AgentRetrievalConfig::default()
        };
        let defaults = StrategyDefaults {
            rerank_enabled: false,
            ..StrategyDefaults::default()
        };
        let effective = resolve_strategy(&StrategyOverride::default(), &agent, &defaults);
        assert!(effective.rerank_enabled);
    }

    #[test]
    fn test_request_override_beats_agent() {
        let agent = AgentRetrievalConfig {
            default_strategy: Some(SearchStrategy::SemanticOnly),
            rerank_enabled: Some(false),
            rerank_model: Some("agent-model".into()),
            ..AgentRetrievalConfig::default()
        };
        let req = StrategyOverride {
            strategy: Some(SearchStrategy::Hybrid),
            rerank_enabled: Some(true),
            rerank_model: Some("request-model".into()),
        };
        let effective = resolve_strategy(&req, &agent, &StrategyDefaults::default());
        assert_eq!(effective.strategy, SearchStrategy::Hybrid);
        assert!(effective.rerank_enabled);
        assert_eq!(effective.rerank_model.as_deref(), Some("request-model"));
    }

    #[test]
    fn test_hybrid_no_rerank_forces_rerank_off() {
        let req = StrategyOverride {
            strategy: Some(SearchStrategy::HybridNoRerank),
            rerank_enabled: Some(true),
            rerank_model: None,
        };
        let effective = resolve_strategy(
            &req,
            &AgentRetrievalConfig::default(),
            &StrategyDefaults::default(),
        );
        assert_eq!(effective.strategy, SearchStrategy::HybridNoRerank);
        assert!(!effective.rerank_enabled);
    }

    #[test]
    fn test_unknown_strategy_name_rejected() {
        let err = StrategyOverride::parse(Some("graph"), None, None).unwrap_err();
        assert!(matches!(err, QaError::InvalidRequest { .. }));
    }
}
