use crate::config::Config;
use crate::credential::types::AuthCapability;
use crate::logging::{self, LogLevel};
use async_trait::async_trait;
use axum::body::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT};
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;

const MAX_ERROR_BODY_BYTES: usize = 1 << 20;

pub struct UpstreamRequest {
    pub url: String,
    pub body: Bytes,
    pub stream: bool,
    pub auth: AuthCapability,
    pub timeout: Duration,
    /// 仅用于日志与测试桩，不会发往上游。
    pub account_id: String,
}

pub enum UpstreamBody {
    Full(Bytes),
    Stream(BoxStream<'static, Result<Bytes, std::io::Error>>),
}

impl fmt::Debug for UpstreamBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(b) => write!(f, "Full({} bytes)", b.len()),
            Self::Stream(_) => f.write_str("Stream"),
        }
    }
}

#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: UpstreamBody,
}

#[derive(Debug, Clone, Error)]
pub enum UpstreamError {
    #[error("上游返回 HTTP {status}: {message}")]
    Http {
        status: u16,
        message: String,
        body: Bytes,
        content_type: Option<String>,
    },

    #[error("上游连接失败: {0}")]
    Transport(String),

    #[error("上游请求超时（{}ms）", .0.as_millis())]
    Timeout(Duration),
}

impl UpstreamError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// 401/403：凭证被拒。
    pub fn is_auth_failure(&self) -> bool {
        matches!(self.status(), Some(401 | 403))
    }

    /// 传输错误、超时、5xx 与 429：换下一个账号重试。
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout(_) => true,
            Self::Http { status, .. } => *status == 429 || *status >= 500,
        }
    }
}

/// 上游 chat-completions 接口。生产实现走 HTTP，测试中替换为脚本化桩。
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn forward(&self, req: UpstreamRequest) -> Result<UpstreamResponse, UpstreamError>;

    /// 用凭证访问探活地址；只读，不改变任何状态。
    async fn probe(
        &self,
        url: &str,
        auth: &AuthCapability,
        timeout: Duration,
    ) -> Result<(), UpstreamError>;

    async fn fetch_json(
        &self,
        url: &str,
        auth: &AuthCapability,
        timeout: Duration,
    ) -> Result<serde_json::Value, UpstreamError>;
}

#[derive(Debug, Clone)]
pub struct HttpUpstream {
    http: reqwest::Client,
    user_agent: HeaderValue,
    log_level: LogLevel,
}

impl HttpUpstream {
    pub fn new(cfg: &Config) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .pool_max_idle_per_host(16)
            .pool_idle_timeout(Duration::from_secs(90));
        if !cfg.proxy.trim().is_empty() {
            builder = builder.proxy(reqwest::Proxy::all(cfg.proxy.trim())?);
        }
        Ok(Self {
            http: builder.build()?,
            user_agent: HeaderValue::from_str(&cfg.user_agent)
                .unwrap_or(HeaderValue::from_static("relaygate")),
            log_level: cfg.log_level(),
        })
    }

    fn build_headers(&self, auth: &AuthCapability, stream: bool) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(USER_AGENT, self.user_agent.clone());
        h.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        h.insert(
            ACCEPT,
            HeaderValue::from_static(if stream {
                "text/event-stream"
            } else {
                "application/json"
            }),
        );
        auth.authorize(&mut h);
        h
    }

    async fn get(
        &self,
        url: &str,
        auth: &AuthCapability,
        timeout: Duration,
    ) -> Result<Bytes, UpstreamError> {
        let headers = self.build_headers(auth, false);
        let fut = async {
            let resp = self
                .http
                .get(url)
                .headers(headers)
                .send()
                .await
                .map_err(transport)?;
            let status = resp.status().as_u16();
            let content_type = content_type(resp.headers());
            let bytes = resp.bytes().await.map_err(transport)?;
            if !(200..300).contains(&status) {
                return Err(http_error(status, content_type, bytes));
            }
            Ok(bytes)
        };
        tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| UpstreamError::Timeout(timeout))?
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn forward(&self, req: UpstreamRequest) -> Result<UpstreamResponse, UpstreamError> {
        let headers = self.build_headers(&req.auth, req.stream);
        if self.log_level.backend_enabled() {
            logging::backend_request(self.log_level, &req.url, &headers, &req.body);
        }

        let start = Instant::now();
        let timeout = req.timeout;
        let send = async {
            let resp = self
                .http
                .post(&req.url)
                .headers(headers)
                .body(req.body.clone())
                .send()
                .await
                .map_err(transport)?;

            let status = resp.status().as_u16();
            let content_type = content_type(resp.headers());

            if !(200..300).contains(&status) {
                let bytes = resp.bytes().await.map_err(transport)?;
                if self.log_level.backend_enabled() {
                    logging::backend_response(self.log_level, status, start.elapsed(), &bytes);
                }
                return Err(http_error(status, content_type, bytes));
            }

            if req.stream {
                // 超时只约束到响应头；流式正文按上游节奏透传。
                let stream = resp
                    .bytes_stream()
                    .map(|r| r.map_err(std::io::Error::other))
                    .boxed();
                return Ok(UpstreamResponse {
                    status,
                    content_type,
                    body: UpstreamBody::Stream(stream),
                });
            }

            let bytes = resp.bytes().await.map_err(transport)?;
            if self.log_level.backend_enabled() {
                logging::backend_response(self.log_level, status, start.elapsed(), &bytes);
            }
            Ok(UpstreamResponse {
                status,
                content_type,
                body: UpstreamBody::Full(bytes),
            })
        };

        tokio::time::timeout(timeout, send)
            .await
            .map_err(|_| UpstreamError::Timeout(timeout))?
    }

    async fn probe(
        &self,
        url: &str,
        auth: &AuthCapability,
        timeout: Duration,
    ) -> Result<(), UpstreamError> {
        self.get(url, auth, timeout).await.map(|_| ())
    }

    async fn fetch_json(
        &self,
        url: &str,
        auth: &AuthCapability,
        timeout: Duration,
    ) -> Result<serde_json::Value, UpstreamError> {
        let bytes = self.get(url, auth, timeout).await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| UpstreamError::Transport(format!("响应不是合法 JSON: {e}")))
    }
}

fn transport(e: reqwest::Error) -> UpstreamError {
    UpstreamError::Transport(e.to_string())
}

fn content_type(headers: &HeaderMap) -> Option<String> {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// 从 OpenAI 风格的错误体中提取 message；解析失败时退化为截断后的原文。
fn http_error(status: u16, content_type: Option<String>, body: Bytes) -> UpstreamError {
    #[derive(serde::Deserialize)]
    struct ErrResp {
        error: ErrInner,
    }
    #[derive(serde::Deserialize)]
    struct ErrInner {
        #[serde(default)]
        message: String,
    }

    let body = if body.len() > MAX_ERROR_BODY_BYTES {
        body.slice(..MAX_ERROR_BODY_BYTES)
    } else {
        body
    };
    let message = match sonic_rs::from_slice::<ErrResp>(&body) {
        Ok(r) if !r.error.message.trim().is_empty() => r.error.message,
        _ => {
            let raw = String::from_utf8_lossy(&body);
            let raw = raw.trim();
            if raw.is_empty() {
                "Unknown error".to_string()
            } else {
                raw.chars().take(512).collect()
            }
        }
    };
    UpstreamError::Http {
        status,
        message,
        body,
        content_type,
    }
}

/// 从余额接口响应中找出第一个数值型余额字段（支持数字或数字字符串，可嵌套）。
pub fn extract_balance(v: &serde_json::Value) -> Option<f64> {
    const KEYS: [&str; 5] = [
        "balance",
        "total_balance",
        "total_available",
        "credits",
        "total_credits",
    ];

    fn as_number(v: &serde_json::Value) -> Option<f64> {
        match v {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    match v {
        serde_json::Value::Object(map) => {
            for key in KEYS {
                if let Some(n) = map.get(key).and_then(as_number) {
                    return Some(n);
                }
            }
            map.values().find_map(extract_balance)
        }
        serde_json::Value::Array(items) => items.iter().find_map(extract_balance),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn error_classification() {
        let http = |status| http_error(status, None, Bytes::new());
        assert!(http(401).is_auth_failure());
        assert!(http(403).is_auth_failure());
        assert!(!http(401).is_retryable());
        assert!(http(429).is_retryable());
        assert!(http(502).is_retryable());
        assert!(!http(400).is_retryable());
        assert!(UpstreamError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(UpstreamError::Transport("reset".to_string()).is_retryable());
    }

    #[test]
    fn http_error_extracts_openai_message() {
        let body = Bytes::from_static(br#"{"error":{"message":"Rate limit reached","type":"requests"}}"#);
        let err = http_error(429, Some("application/json".to_string()), body.clone());
        assert!(err.to_string().contains("Rate limit reached"));
        let UpstreamError::Http { body: kept, .. } = err else {
            panic!("expected http error");
        };
        assert_eq!(kept, body);

        let err = http_error(500, None, Bytes::from_static(b"  "));
        assert!(err.to_string().contains("Unknown error"));
    }

    #[test]
    fn balance_is_found_in_vendor_shapes() {
        let deepseek = json!({
            "is_available": true,
            "balance_infos": [{"currency": "CNY", "total_balance": "110.00"}]
        });
        assert_eq!(extract_balance(&deepseek), Some(110.0));

        let openrouter = json!({"data": {"total_credits": 25.5, "total_usage": 3}});
        assert_eq!(extract_balance(&openrouter), Some(25.5));

        assert_eq!(extract_balance(&json!({"balance": 7})), Some(7.0));
        assert_eq!(extract_balance(&json!({"ok": true})), None);
    }
}
