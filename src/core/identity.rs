// 匿名身份：从 Cookie 中解析 owner 标识，缺失或无效时签发新的随机标识。
use crate::config::{IdentityConfig, SecurityConfig};
use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::{HeaderMap, HeaderValue};
use axum::response::Response;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, warn};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

const MAX_TOKEN_CHARS: usize = 100;

/// 当前请求的 owner 标识；`issued` 表示本次请求新签发，需要写回 Cookie。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    owner_id: String,
    issued: bool,
}

impl ClientIdentity {
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn is_issued(&self) -> bool {
        self.issued
    }
}

#[derive(Clone)]
pub struct IdentityResolver {
    cookie_name: String,
    max_age_s: Option<u64>,
    secure: bool,
    secret_key: Option<Vec<u8>>,
}

impl IdentityResolver {
    pub fn new(identity: &IdentityConfig, security: &SecurityConfig) -> Self {
        let cookie_name = identity.cookie_name.trim();
        let cookie_name = if cookie_name.is_empty() {
            "user_id".to_string()
        } else {
            cookie_name.to_string()
        };
        Self {
            cookie_name,
            max_age_s: identity.cookie_max_age_s,
            secure: identity.secure,
            secret_key: security.secret_key().map(|key| key.as_bytes().to_vec()),
        }
    }

    pub fn resolve(&self, headers: &HeaderMap) -> ClientIdentity {
        let incoming = extract_cookie(headers, &self.cookie_name);
        self.resolve_token(incoming.as_deref())
    }

    /// 携带有效标识时原样返回，否则签发新的 UUID v4。
    pub fn resolve_token(&self, incoming: Option<&str>) -> ClientIdentity {
        if let Some(owner_id) = incoming.and_then(|value| self.verify(value)) {
            return ClientIdentity {
                owner_id,
                issued: false,
            };
        }
        let owner_id = Uuid::new_v4().to_string();
        debug!("签发新的匿名身份");
        ClientIdentity {
            owner_id,
            issued: true,
        }
    }

    fn verify(&self, value: &str) -> Option<String> {
        let value = value.trim();
        let Some(key) = self.secret_key.as_deref() else {
            return is_valid_token(value).then(|| value.to_string());
        };
        let (token, signature) = value.rsplit_once('.')?;
        if !is_valid_token(token) {
            return None;
        }
        let signature = hex::decode(signature).ok()?;
        let mut mac = HmacSha256::new_from_slice(key).ok()?;
        mac.update(token.as_bytes());
        mac.verify_slice(&signature).ok()?;
        Some(token.to_string())
    }

    fn cookie_value(&self, owner_id: &str) -> String {
        let Some(key) = self.secret_key.as_deref() else {
            return owner_id.to_string();
        };
        match HmacSha256::new_from_slice(key) {
            Ok(mut mac) => {
                mac.update(owner_id.as_bytes());
                let signature = hex::encode(mac.finalize().into_bytes());
                format!("{owner_id}.{signature}")
            }
            Err(err) => {
                warn!("身份 Cookie 签名失败: {err}");
                owner_id.to_string()
            }
        }
    }

    pub fn set_cookie_value(&self, identity: &ClientIdentity) -> Option<HeaderValue> {
        let mut cookie = format!(
            "{}={}; Path=/; HttpOnly; SameSite=Lax",
            self.cookie_name,
            self.cookie_value(identity.owner_id())
        );
        if let Some(max_age) = self.max_age_s {
            cookie.push_str(&format!("; Max-Age={max_age}"));
        }
        if self.secure {
            cookie.push_str("; Secure");
        }
        HeaderValue::from_str(&cookie).ok()
    }

    pub fn attach(&self, response: &mut Response, identity: &ClientIdentity) {
        if let Some(value) = self.set_cookie_value(identity) {
            response.headers_mut().append(SET_COOKIE, value);
        }
    }

    /// 仅在本次新签发时写回。
    pub fn attach_if_issued(&self, response: &mut Response, identity: &ClientIdentity) {
        if identity.is_issued() {
            self.attach(response, identity);
        }
    }
}

fn is_valid_token(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= MAX_TOKEN_CHARS
        && value
            .bytes()
            .all(|byte| byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_')
}

pub fn extract_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|text| text.split(';'))
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| key.trim() == name)
        .map(|(_, value)| value.trim().trim_matches('"').to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver(secret_key: Option<&str>) -> IdentityResolver {
        IdentityResolver::new(
            &IdentityConfig::default(),
            &SecurityConfig {
                secret_key: secret_key.map(str::to_string),
            },
        )
    }

    fn cookie_headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn existing_token_is_returned_unchanged() {
        let resolver = resolver(None);
        let headers = cookie_headers("theme=dark; user_id=abc-123_def");
        let identity = resolver.resolve(&headers);
        assert_eq!(identity.owner_id(), "abc-123_def");
        assert!(!identity.is_issued());
    }

    #[test]
    fn missing_or_malformed_token_issues_uuid() {
        let resolver = resolver(None);
        for headers in [
            HeaderMap::new(),
            cookie_headers("user_id="),
            cookie_headers("user_id=<script>"),
            cookie_headers(&format!("user_id={}", "a".repeat(101))),
        ] {
            let identity = resolver.resolve(&headers);
            assert!(identity.is_issued());
            assert!(Uuid::parse_str(identity.owner_id()).is_ok());
        }
    }

    #[test]
    fn issued_tokens_are_unique() {
        let resolver = resolver(None);
        let first = resolver.resolve_token(None);
        let second = resolver.resolve_token(None);
        assert_ne!(first.owner_id(), second.owner_id());
    }

    #[test]
    fn signed_cookie_round_trips() {
        let resolver = resolver(Some("s3cret"));
        let issued = resolver.resolve_token(None);
        let header = resolver.set_cookie_value(&issued).unwrap();
        let header = header.to_str().unwrap();
        let value = header
            .strip_prefix("user_id=")
            .and_then(|rest| rest.split(';').next())
            .unwrap();
        assert!(value.starts_with(issued.owner_id()));

        let resolved = resolver.resolve_token(Some(value));
        assert_eq!(resolved.owner_id(), issued.owner_id());
        assert!(!resolved.is_issued());
    }

    #[test]
    fn tampered_or_unsigned_cookie_is_rejected_when_key_configured() {
        let resolver = resolver(Some("s3cret"));
        let other = self::resolver(Some("different"));
        let victim = other.resolve_token(None);
        let forged = other.cookie_value(victim.owner_id());

        assert!(resolver.resolve_token(Some(&forged)).is_issued());
        assert!(resolver.resolve_token(Some(victim.owner_id())).is_issued());
        assert!(resolver.resolve_token(Some("abc.zz")).is_issued());
    }

    #[test]
    fn set_cookie_carries_attributes() {
        let resolver = IdentityResolver::new(
            &IdentityConfig {
                cookie_name: "todo_owner".to_string(),
                cookie_max_age_s: Some(60),
                secure: true,
            },
            &SecurityConfig::default(),
        );
        let identity = resolver.resolve_token(Some("owner-1"));
        let header = resolver.set_cookie_value(&identity).unwrap();
        assert_eq!(
            header.to_str().unwrap(),
            "todo_owner=owner-1; Path=/; HttpOnly; SameSite=Lax; Max-Age=60; Secure"
        );
    }
}
