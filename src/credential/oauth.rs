use crate::config::Config;
use crate::credential::types::OAuthToken;
use crate::error::GatewayError;
use crate::pool::types::OAuthSettings;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;

const MAX_TOKEN_RESPONSE_BYTES: usize = 1 << 20;

#[derive(Debug, Clone, serde::Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default)]
    pub expires_in: i64,
}

impl TokenResponse {
    /// 转成落库的 token；响应未返回新 refresh_token 时沿用旧值。
    pub fn into_token(self, previous_refresh_token: &str) -> OAuthToken {
        let refresh_token = if self.refresh_token.trim().is_empty() {
            previous_refresh_token.to_string()
        } else {
            self.refresh_token
        };
        OAuthToken {
            access_token: self.access_token,
            refresh_token,
            expires_in: self.expires_in,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// 刷新失败原因。可 Clone：同一次刷新的结果会分发给所有等待者。
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RefreshError {
    #[error("缺少 refresh_token")]
    MissingRefreshToken,
    #[error("provider 未配置 OAuth")]
    NotConfigured,
    #[error("令牌端点拒绝（HTTP {status}）：{message}")]
    Rejected { status: u16, message: String },
    #[error("令牌端点请求失败：{0}")]
    Transport(String),
    #[error("令牌端点响应无效：{0}")]
    InvalidResponse(String),
    #[error("刷新期间凭证已被删除")]
    Revoked,
}

/// OAuth 令牌端点。生产实现走 HTTP，测试中用计数 mock 替换。
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    async fn refresh(
        &self,
        settings: &OAuthSettings,
        refresh_token: &str,
    ) -> Result<OAuthToken, RefreshError>;

    async fn exchange_code(
        &self,
        settings: &OAuthSettings,
        code: &str,
        redirect_uri: &str,
    ) -> Result<OAuthToken, RefreshError>;
}

#[derive(Debug, Clone)]
pub struct OAuthClient {
    http: reqwest::Client,
    user_agent: String,
}

impl OAuthClient {
    pub fn new(cfg: &Config) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(Duration::from_millis(cfg.timeout_ms.max(1_000)));
        if !cfg.proxy.trim().is_empty() {
            builder = builder.proxy(reqwest::Proxy::all(cfg.proxy.trim())?);
        }
        Ok(Self {
            http: builder.build()?,
            user_agent: cfg.user_agent.clone(),
        })
    }

    async fn post_form(
        &self,
        token_url: &str,
        form: &[(&str, &str)],
    ) -> Result<TokenResponse, RefreshError> {
        let resp = self
            .http
            .post(token_url)
            .header(reqwest::header::USER_AGENT, self.user_agent.as_str())
            .form(form)
            .send()
            .await
            .map_err(|e| RefreshError::Transport(e.to_string()))?;

        let status = resp.status();
        let body = resp
            .bytes()
            .await
            .map_err(|e| RefreshError::Transport(e.to_string()))?;
        if body.len() > MAX_TOKEN_RESPONSE_BYTES {
            return Err(RefreshError::InvalidResponse("响应过大".to_string()));
        }
        if !status.is_success() {
            let message = crate::logging::truncate_text_for_log(&String::from_utf8_lossy(&body));
            tracing::warn!("OAuth 令牌端点返回 HTTP {}：{message}", status.as_u16());
            return Err(RefreshError::Rejected {
                status: status.as_u16(),
                message,
            });
        }
        sonic_rs::from_slice::<TokenResponse>(&body)
            .map_err(|e| RefreshError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl TokenEndpoint for OAuthClient {
    async fn refresh(
        &self,
        settings: &OAuthSettings,
        refresh_token: &str,
    ) -> Result<OAuthToken, RefreshError> {
        let refresh_token = refresh_token.trim();
        if refresh_token.is_empty() {
            return Err(RefreshError::MissingRefreshToken);
        }
        let token = self
            .post_form(
                &settings.token_url,
                &[
                    ("client_id", settings.client_id.as_str()),
                    ("client_secret", settings.client_secret.as_str()),
                    ("grant_type", "refresh_token"),
                    ("refresh_token", refresh_token),
                ],
            )
            .await?;
        Ok(token.into_token(refresh_token))
    }

    async fn exchange_code(
        &self,
        settings: &OAuthSettings,
        code: &str,
        redirect_uri: &str,
    ) -> Result<OAuthToken, RefreshError> {
        let token = self
            .post_form(
                &settings.token_url,
                &[
                    ("code", code.trim()),
                    ("client_id", settings.client_id.as_str()),
                    ("client_secret", settings.client_secret.as_str()),
                    ("redirect_uri", redirect_uri.trim()),
                    ("grant_type", "authorization_code"),
                ],
            )
            .await?;
        if token.refresh_token.trim().is_empty() {
            return Err(RefreshError::InvalidResponse(
                "授权响应中缺少 refresh_token".to_string(),
            ));
        }
        Ok(token.into_token(""))
    }
}

pub fn build_auth_url(
    settings: &OAuthSettings,
    redirect_uri: &str,
    state: &str,
) -> Result<String, GatewayError> {
    if redirect_uri.trim().is_empty() {
        return Err(GatewayError::bad_request("缺少 redirect_uri"));
    }
    let mut url = reqwest::Url::parse(settings.auth_url.trim())
        .map_err(|e| GatewayError::config(format!("auth_url 无效: {e}")))?;
    url.query_pairs_mut()
        .append_pair("access_type", "offline")
        .append_pair("client_id", &settings.client_id)
        .append_pair("prompt", "consent")
        .append_pair("redirect_uri", redirect_uri.trim())
        .append_pair("response_type", "code")
        .append_pair("scope", &settings.scopes.join(" "))
        .append_pair("state", state);
    Ok(url.to_string())
}

/// 从粘贴的回调地址中取出 (code, state)。
pub fn parse_callback_url(callback_url: &str) -> Result<(String, String), GatewayError> {
    let u = reqwest::Url::parse(callback_url.trim())
        .map_err(|e| GatewayError::bad_request(format!("回调 URL 无效: {e}")))?;
    let mut code = String::new();
    let mut state = String::new();
    for (k, v) in u.query_pairs() {
        match k.as_ref() {
            "code" => code = v.into_owned(),
            "state" => state = v.into_owned(),
            _ => {}
        }
    }
    if code.trim().is_empty() {
        return Err(GatewayError::bad_request("回调 URL 中缺少 code 参数"));
    }
    Ok((code, state))
}

// ===== OAuth state（防 CSRF，单次有效）=====

pub const OAUTH_STATE_TTL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Default)]
pub struct OAuthStates {
    states: Mutex<HashMap<String, (String, Instant)>>,
}

impl OAuthStates {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为某个 provider 签发 state。
    pub async fn issue(&self, provider_id: &str) -> String {
        let state = crate::util::id::oauth_state();
        let now = Instant::now();
        let mut guard = self.states.lock().await;
        guard.retain(|_, (_, exp)| now < *exp);
        guard.insert(state.clone(), (provider_id.to_string(), now + OAUTH_STATE_TTL));
        state
    }

    /// 消费 state：有效则返回签发时的 provider id；无论结果如何 state 都不能再次使用。
    pub async fn take(&self, state: &str) -> Option<String> {
        let state = state.trim();
        if state.is_empty() {
            return None;
        }
        let now = Instant::now();
        let mut guard = self.states.lock().await;
        let (provider_id, expires_at) = guard.remove(state)?;
        (now < expires_at).then_some(provider_id)
    }
}

/// OAuth 进度通知（单向广播，没有订阅者时直接丢弃）。
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum OAuthEvent {
    #[serde(rename_all = "camelCase")]
    LoginStarted { provider_id: String, auth_url: String },
    #[serde(rename_all = "camelCase")]
    LoginSucceeded {
        provider_id: String,
        account_id: String,
    },
    #[serde(rename_all = "camelCase")]
    LoginFailed { provider_id: String, message: String },
    #[serde(rename_all = "camelCase")]
    TokenRefreshed { account_id: String },
    #[serde(rename_all = "camelCase")]
    RefreshFailed { account_id: String, message: String },
}
