// 请求守卫：限流准入与 panic 兜底，均在进入处理函数之前执行。
use crate::api::errors::{error_response, rate_limited_response, MESSAGE_INTERNAL};
use crate::services::rate_limit::{RateCheck, RateRule};
use crate::state::AppState;
use axum::extract::{ConnectInfo, MatchedPath, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;
use futures::FutureExt;
use std::any::Any;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{error, warn};

const UNKNOWN_CLIENT: &str = "unknown";

/// 任务路由：全局规则 + 路由规则同时生效。
pub(crate) async fn endpoint_rate_limit(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let policy = &state.rate_policy;
    if !policy.enabled {
        return next.run(request).await;
    }
    let client = client_key(&request, policy.trust_forwarded_for);
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let mut checks = global_checks(&client, &policy.global);
    checks.extend(
        policy
            .endpoint
            .iter()
            .map(|rule| RateCheck::new(format!("{route}|{client}"), *rule)),
    );
    admit(&state, &checks, request, next).await
}

/// 非任务路由（静态资源）只受全局规则约束。
pub(crate) async fn global_rate_limit(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let policy = &state.rate_policy;
    if !policy.enabled {
        return next.run(request).await;
    }
    let client = client_key(&request, policy.trust_forwarded_for);
    let checks = global_checks(&client, &policy.global);
    admit(&state, &checks, request, next).await
}

async fn admit(state: &AppState, checks: &[RateCheck], request: Request, next: Next) -> Response {
    match state.limiter.check(checks) {
        Ok(()) => next.run(request).await,
        Err(exceeded) => {
            warn!(
                key = %exceeded.key,
                rule = %exceeded.rule,
                path = %request.uri().path(),
                "请求超出限流阈值"
            );
            rate_limited_response(&exceeded)
        }
    }
}

fn global_checks(client: &str, rules: &[RateRule]) -> Vec<RateCheck> {
    rules
        .iter()
        .map(|rule| RateCheck::new(client, *rule))
        .collect()
}

pub(crate) fn client_key(request: &Request, trust_forwarded_for: bool) -> String {
    if trust_forwarded_for {
        let forwarded = request
            .headers()
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|value| !value.is_empty());
        if let Some(forwarded) = forwarded {
            return forwarded.to_string();
        }
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

pub(crate) async fn panic_guard(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let result = AssertUnwindSafe(next.run(request)).catch_unwind().await;
    match result {
        Ok(response) => response,
        Err(panic) => {
            let detail = panic_message(panic.as_ref());
            error!("panic while handling {method} {path}: {detail}");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                MESSAGE_INTERNAL,
            )
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        return message.to_string();
    }
    if let Some(message) = panic.downcast_ref::<String>() {
        return message.clone();
    }
    "unknown panic".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request_from(addr: Option<&str>, forwarded: Option<&str>) -> Request {
        let mut builder = axum::http::Request::builder().uri("/");
        if let Some(forwarded) = forwarded {
            builder = builder.header("x-forwarded-for", forwarded);
        }
        let mut request = builder.body(Body::empty()).unwrap();
        if let Some(addr) = addr {
            let addr: SocketAddr = addr.parse().unwrap();
            request.extensions_mut().insert(ConnectInfo(addr));
        }
        request
    }

    #[test]
    fn client_key_uses_peer_ip() {
        let request = request_from(Some("192.168.1.9:40000"), Some("1.2.3.4"));
        assert_eq!(client_key(&request, false), "192.168.1.9");
    }

    #[test]
    fn client_key_prefers_forwarded_when_trusted() {
        let request = request_from(Some("10.0.0.1:1234"), Some(" 1.2.3.4 , 10.0.0.1"));
        assert_eq!(client_key(&request, true), "1.2.3.4");
        let request = request_from(Some("10.0.0.1:1234"), Some(""));
        assert_eq!(client_key(&request, true), "10.0.0.1");
    }

    #[test]
    fn client_key_without_connection_info_is_unknown() {
        let request = request_from(None, None);
        assert_eq!(client_key(&request, false), UNKNOWN_CLIENT);
    }

    #[test]
    fn panic_message_reads_common_payloads() {
        let text: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(text.as_ref()), "boom");
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned boom"));
        assert_eq!(panic_message(owned.as_ref()), "owned boom");
        let other: Box<dyn Any + Send> = Box::new(42_u8);
        assert_eq!(panic_message(other.as_ref()), "unknown panic");
    }
}
