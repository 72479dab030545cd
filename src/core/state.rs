// 全局状态：配置、任务存储、身份解析与限流器。

use crate::config::Config;
use crate::identity::IdentityResolver;
use crate::services::rate_limit::{parse_rules, RateRule, RequestRateLimiter};
use crate::storage::{build_task_store, TaskStore};
use anyhow::{Context, Result};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct RatePolicy {
    pub enabled: bool,
    pub trust_forwarded_for: bool,
    /// 按客户端地址计数，作用于所有请求。
    pub global: Vec<RateRule>,
    /// 按路由 + 客户端地址计数，作用于任务相关路由。
    pub endpoint: Vec<RateRule>,
}

impl RatePolicy {
    pub fn from_config(config: &Config) -> Self {
        let settings = &config.rate_limit;
        Self {
            enabled: settings.enabled,
            trust_forwarded_for: settings.trust_forwarded_for,
            global: parse_rules(&settings.default_limits),
            endpoint: parse_rules(&settings.endpoint_limits),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn TaskStore>,
    pub identity: IdentityResolver,
    pub limiter: RequestRateLimiter,
    pub rate_policy: RatePolicy,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self> {
        let store = init_storage(&config)?;
        Ok(Self::with_store(config, store))
    }

    pub fn with_store(config: Config, store: Arc<dyn TaskStore>) -> Self {
        let identity = IdentityResolver::new(&config.identity, &config.security);
        let rate_policy = RatePolicy::from_config(&config);
        Self {
            config,
            store,
            identity,
            limiter: RequestRateLimiter::new(),
            rate_policy,
        }
    }
}

fn init_storage(config: &Config) -> Result<Arc<dyn TaskStore>> {
    let store = build_task_store(&config.storage)?;
    store
        .ensure_initialized()
        .with_context(|| format!("任务存储初始化失败: {}", config.storage.db_path))?;
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_policy_uses_configured_rules() {
        let mut config = Config::default();
        config.rate_limit.default_limits = vec!["50/hour".to_string(), "bogus".to_string()];
        config.rate_limit.endpoint_limits = vec!["3 per minute".to_string()];
        let policy = RatePolicy::from_config(&config);
        assert!(policy.enabled);
        assert_eq!(policy.global, vec![RateRule::per_hour(50)]);
        assert_eq!(policy.endpoint, vec![RateRule::per_minute(3)]);
    }

    #[test]
    fn default_policy_matches_documented_limits() {
        let policy = RatePolicy::from_config(&Config::default());
        assert_eq!(policy.global, vec![RateRule::per_hour(100)]);
        assert_eq!(policy.endpoint, vec![RateRule::per_minute(20)]);
        assert!(!policy.trust_forwarded_for);
    }
}
