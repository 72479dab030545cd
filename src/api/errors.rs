use crate::services::rate_limit::RateLimitExceeded;
use crate::storage::TaskError;
use axum::http::header::{HeaderName, HeaderValue, RETRY_AFTER};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::error;
use uuid::Uuid;

pub(crate) const TRACE_HEADER: &str = "x-trace-id";
pub(crate) const ERROR_CODE_HEADER: &str = "x-error-code";

pub(crate) const MESSAGE_UNAUTHORIZED: &str = "Unauthorized";
pub(crate) const MESSAGE_NOT_FOUND: &str = "Task not found.";
pub(crate) const MESSAGE_RATE_LIMITED: &str = "Too many requests. Please slow down.";
pub(crate) const MESSAGE_INTERNAL: &str = "An error occurred while processing the request.";

pub fn error_response(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    let trace_id = format!("err_{}", Uuid::new_v4().simple());
    let mut response = (status, message.into()).into_response();
    if let Ok(value) = HeaderValue::from_str(&trace_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(TRACE_HEADER), value);
    }
    if let Ok(value) = HeaderValue::from_str(code) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(ERROR_CODE_HEADER), value);
    }
    response
}

pub(crate) fn status_for_task_error(err: &TaskError) -> StatusCode {
    match err {
        TaskError::Validation(_) => StatusCode::BAD_REQUEST,
        TaskError::NotFound(_) => StatusCode::NOT_FOUND,
        TaskError::Forbidden(_) => StatusCode::FORBIDDEN,
        TaskError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for TaskError {
    fn into_response(self) -> Response {
        let status = status_for_task_error(&self);
        let message = match &self {
            TaskError::Validation(message) => message.clone(),
            TaskError::NotFound(_) => MESSAGE_NOT_FOUND.to_string(),
            TaskError::Forbidden(_) => MESSAGE_UNAUTHORIZED.to_string(),
            // 存储细节只写日志，不回传客户端。
            TaskError::Storage(err) => {
                error!("任务存储失败: {err:#}");
                MESSAGE_INTERNAL.to_string()
            }
        };
        error_response(status, self.code(), message)
    }
}

pub fn rate_limited_response(exceeded: &RateLimitExceeded) -> Response {
    let mut response = error_response(
        StatusCode::TOO_MANY_REQUESTS,
        "RATE_LIMITED",
        MESSAGE_RATE_LIMITED,
    );
    let retry_after = exceeded.retry_after.as_secs().max(1);
    if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
        response.headers_mut().insert(RETRY_AFTER, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::rate_limit::RateRule;
    use axum::body::to_bytes;
    use std::time::Duration;

    const MESSAGE_EMPTY_CONTENT: &str = "Task content cannot be empty.";

    async fn body_text(response: Response) -> String {
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read response body");
        String::from_utf8(body.to_vec()).expect("utf8 body")
    }

    fn header(response: &Response, name: &str) -> String {
        response
            .headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string()
    }

    #[tokio::test]
    async fn task_errors_map_to_status_codes() {
        let cases = [
            (
                TaskError::Validation(MESSAGE_EMPTY_CONTENT.to_string()),
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR",
            ),
            (TaskError::NotFound(7), StatusCode::NOT_FOUND, "NOT_FOUND"),
            (TaskError::Forbidden(7), StatusCode::FORBIDDEN, "FORBIDDEN"),
            (
                TaskError::Storage(anyhow::anyhow!("database is locked")),
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
            ),
        ];
        for (err, status, code) in cases {
            let response = err.into_response();
            assert_eq!(response.status(), status);
            assert_eq!(header(&response, ERROR_CODE_HEADER), code);
            assert!(header(&response, TRACE_HEADER).starts_with("err_"));
        }
    }

    #[tokio::test]
    async fn storage_details_are_not_leaked() {
        let response = TaskError::Storage(anyhow::anyhow!("disk I/O error at /var/db")).into_response();
        let body = body_text(response).await;
        assert_eq!(body, MESSAGE_INTERNAL);
    }

    #[tokio::test]
    async fn validation_message_is_returned_verbatim() {
        let err = crate::storage::normalize_content("   ").unwrap_err();
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_text(response).await, MESSAGE_EMPTY_CONTENT);
    }

    #[test]
    fn rate_limited_response_sets_retry_after() {
        let response = rate_limited_response(&RateLimitExceeded {
            key: "127.0.0.1".to_string(),
            rule: RateRule::per_minute(20),
            retry_after: Duration::from_millis(1500),
        });
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(header(&response, "retry-after"), "1");
        assert_eq!(header(&response, ERROR_CODE_HEADER), "RATE_LIMITED");
    }
}
