use axum::http::{HeaderMap, HeaderValue, header};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 提前视为过期的时间窗口（毫秒）：避免令牌在请求途中失效。
/// 有效期很短的令牌最多提前其寿命的一半。
pub const EXPIRY_SKEW_MS: i64 = 300_000;

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthToken {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    /// 有效期（秒）；0 表示未知，视为有效直到上游返回 401/403。
    #[serde(default)]
    pub expires_in: i64,
    /// 颁发时间（毫秒时间戳）。
    #[serde(default)]
    pub timestamp: i64,
}

impl OAuthToken {
    pub fn expires_at_ms(&self) -> Option<i64> {
        if self.timestamp <= 0 || self.expires_in <= 0 {
            return None;
        }
        Some(self.timestamp.saturating_add(self.expires_in.saturating_mul(1000)))
    }

    /// 应当刷新的时间点；过期时间未知时为 None。
    pub fn refresh_due_ms(&self) -> Option<i64> {
        let at = self.expires_at_ms()?;
        let skew = EXPIRY_SKEW_MS.min(self.expires_in.saturating_mul(1000) / 2);
        Some(at - skew)
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        if self.access_token.trim().is_empty() {
            return true;
        }
        self.refresh_due_ms().is_some_and(|due| now_ms >= due)
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at_ms()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
    }
}

/// 账号凭证。只有 Vault 持有原值；网关拿到的是 `AuthCapability`。
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credential {
    ApiKey { api_key: String },
    Bearer { token: String },
    #[serde(rename = "oauth")]
    OAuth(OAuthToken),
}

impl Credential {
    pub fn is_oauth(&self) -> bool {
        matches!(self, Self::OAuth(_))
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        match self {
            Self::OAuth(t) => t.is_expired(now_ms),
            Self::ApiKey { api_key } => api_key.trim().is_empty(),
            Self::Bearer { token } => token.trim().is_empty(),
        }
    }

    pub fn refresh_token(&self) -> Option<&str> {
        match self {
            Self::OAuth(t) if !t.refresh_token.trim().is_empty() => Some(t.refresh_token.as_str()),
            _ => None,
        }
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::OAuth(t) => t.expires_at(),
            _ => None,
        }
    }

    pub fn refresh_due_ms(&self) -> Option<i64> {
        match self {
            Self::OAuth(t) => t.refresh_due_ms(),
            _ => None,
        }
    }

    /// 构造一次性使用的授权能力；secret 为空时返回 None。
    pub fn capability(&self) -> Option<AuthCapability> {
        let secret = match self {
            Self::ApiKey { api_key } => api_key,
            Self::Bearer { token } => token,
            Self::OAuth(t) => &t.access_token,
        };
        let secret = secret.trim();
        if secret.is_empty() {
            return None;
        }
        let mut value = HeaderValue::from_str(&format!("Bearer {secret}")).ok()?;
        value.set_sensitive(true);
        Some(AuthCapability { value })
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ApiKey { .. } => f.write_str("Credential::ApiKey(***)"),
            Self::Bearer { .. } => f.write_str("Credential::Bearer(***)"),
            Self::OAuth(t) => f
                .debug_struct("Credential::OAuth")
                .field("expires_in", &t.expires_in)
                .field("timestamp", &t.timestamp)
                .finish_non_exhaustive(),
        }
    }
}

impl fmt::Debug for OAuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthToken")
            .field("expires_in", &self.expires_in)
            .field("timestamp", &self.timestamp)
            .finish_non_exhaustive()
    }
}

/// 使用凭证的能力：只能写入请求头，不能读出原值。
#[derive(Clone)]
pub struct AuthCapability {
    value: HeaderValue,
}

impl AuthCapability {
    pub fn authorize(&self, headers: &mut HeaderMap) {
        headers.insert(header::AUTHORIZATION, self.value.clone());
    }
}

impl fmt::Debug for AuthCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthCapability(***)")
    }
}
