// 请求限流：按 (作用域 key, 规则) 记录滑动窗口内的放行时刻，所有规则都放行才计数，拒绝的请求不计数。
use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::warn;

const PRUNE_INTERVAL: u64 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RateRule {
    pub limit: u32,
    pub window: Duration,
}

impl RateRule {
    pub const fn new(limit: u32, window: Duration) -> Self {
        Self { limit, window }
    }

    pub const fn per_minute(limit: u32) -> Self {
        Self::new(limit, Duration::from_secs(60))
    }

    pub const fn per_hour(limit: u32) -> Self {
        Self::new(limit, Duration::from_secs(60 * 60))
    }

    /// 支持 `"20 per minute"`、`"100/hour"`、`"5 per 10 seconds"` 等写法。
    pub fn parse(text: &str) -> Option<Self> {
        let normalized = text.trim().to_ascii_lowercase();
        let (count, period) = if let Some((count, period)) = normalized.split_once(" per ") {
            (count, period)
        } else {
            normalized.split_once('/')?
        };
        let limit = count.trim().parse::<u32>().ok()?;
        let mut parts = period.split_whitespace();
        let first = parts.next()?;
        let (multiplier, unit) = match first.parse::<u64>() {
            Ok(value) => (value, parts.next()?),
            Err(_) => (1, first),
        };
        if parts.next().is_some() || multiplier == 0 {
            return None;
        }
        let unit_secs: u64 = match unit {
            "second" | "seconds" | "sec" | "s" => 1,
            "minute" | "minutes" | "min" | "m" => 60,
            "hour" | "hours" | "h" => 60 * 60,
            "day" | "days" | "d" => 24 * 60 * 60,
            _ => return None,
        };
        let window_secs = unit_secs.checked_mul(multiplier)?;
        Some(Self::new(limit, Duration::from_secs(window_secs)))
    }
}

impl fmt::Display for RateRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} per {}s", self.limit, self.window.as_secs())
    }
}

/// 解析配置中的规则；无效或重复的规则会被跳过。
pub fn parse_rules(values: &[String]) -> Vec<RateRule> {
    let mut rules: Vec<RateRule> = Vec::new();
    for value in values {
        let Some(rule) = RateRule::parse(value) else {
            warn!("忽略无效的限流规则: {value}");
            continue;
        };
        if rules.contains(&rule) {
            warn!("忽略重复的限流规则: {value}");
            continue;
        }
        rules.push(rule);
    }
    rules
}

/// 针对某个 key 检查一条规则。
#[derive(Debug, Clone)]
pub struct RateCheck {
    pub key: String,
    pub rule: RateRule,
}

impl RateCheck {
    pub fn new(key: impl Into<String>, rule: RateRule) -> Self {
        Self {
            key: key.into(),
            rule,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitExceeded {
    pub key: String,
    pub rule: RateRule,
    pub retry_after: Duration,
}

impl fmt::Display for RateLimitExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rate limit {} exceeded for {}", self.rule, self.key)
    }
}

impl std::error::Error for RateLimitExceeded {}

#[derive(Clone, Default)]
pub struct RequestRateLimiter {
    windows: Arc<Mutex<HashMap<(String, RateRule), VecDeque<Instant>>>>,
    checks: Arc<AtomicU64>,
}

impl RequestRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&self, checks: &[RateCheck]) -> Result<(), RateLimitExceeded> {
        self.check_at(Instant::now(), checks)
    }

    pub(crate) fn check_at(&self, now: Instant, checks: &[RateCheck]) -> Result<(), RateLimitExceeded> {
        let count = self.checks.fetch_add(1, Ordering::Relaxed);
        let mut windows = self.windows.lock();
        if count > 0 && count % PRUNE_INTERVAL == 0 {
            prune(&mut windows, now);
        }

        for check in checks {
            if check.rule.limit == 0 {
                return Err(RateLimitExceeded {
                    key: check.key.clone(),
                    rule: check.rule,
                    retry_after: check.rule.window,
                });
            }
            let Some(admitted) = windows.get_mut(&(check.key.clone(), check.rule)) else {
                continue;
            };
            expire(admitted, now, check.rule.window);
            if admitted.len() >= check.rule.limit as usize {
                let retry_after = admitted
                    .front()
                    .map(|oldest| (*oldest + check.rule.window).saturating_duration_since(now))
                    .unwrap_or(check.rule.window);
                return Err(RateLimitExceeded {
                    key: check.key.clone(),
                    rule: check.rule,
                    retry_after,
                });
            }
        }

        for check in checks {
            match windows.entry((check.key.clone(), check.rule)) {
                Entry::Occupied(mut entry) => entry.get_mut().push_back(now),
                Entry::Vacant(entry) => {
                    entry.insert(VecDeque::from([now]));
                }
            }
        }
        Ok(())
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows.lock().len()
    }

    #[cfg(test)]
    pub(crate) fn prune_at(&self, now: Instant) {
        prune(&mut self.windows.lock(), now);
    }
}

fn expire(admitted: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(oldest) = admitted.front() {
        if now.saturating_duration_since(*oldest) >= window {
            admitted.pop_front();
        } else {
            break;
        }
    }
}

fn prune(windows: &mut HashMap<(String, RateRule), VecDeque<Instant>>, now: Instant) {
    windows.retain(|(_, rule), admitted| {
        expire(admitted, now, rule.window);
        !admitted.is_empty()
    });
}
