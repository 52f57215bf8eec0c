use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    ApiKey,
    #[serde(rename = "oauth")]
    OAuth,
    Bearer,
}

/// 凭证字段描述（控制面据此渲染表单，创建账号时据此校验）。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialField {
    pub name: String,
    pub label: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub secret: bool,
}

impl CredentialField {
    fn new(name: &str, label: &str, required: bool, secret: bool) -> Self {
        Self {
            name: name.to_string(),
            label: label.to_string(),
            required,
            secret,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthSettings {
    pub auth_url: String,
    pub token_url: String,
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub redirect_uri: String,
}

/// 展示给控制面的密钥掩码；更新时原样提交表示保留原值。
pub const REDACTED_SECRET: &str = "********";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provider {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub builtin: bool,
    pub auth_type: AuthType,
    pub base_url: String,
    /// 声明支持的上游模型；为空表示不限制。
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub credential_fields: Vec<CredentialField>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth: Option<OAuthSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credits_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validate_path: Option<String>,
}

impl Provider {
    pub fn supports_model(&self, model: &str) -> bool {
        self.models.is_empty() || self.models.iter().any(|m| m == model)
    }

    pub fn chat_url(&self) -> String {
        self.join("/chat/completions")
    }

    /// 凭证探活地址：默认 `{base}/models`。
    pub fn probe_url(&self) -> String {
        self.join(self.validate_path.as_deref().unwrap_or("/models"))
    }

    pub fn credits_url(&self) -> Option<String> {
        self.credits_path.as_deref().map(|p| self.join(p))
    }

    /// 对外展示用的副本：client_secret 被掩码替换。
    pub fn redacted(mut self) -> Self {
        if let Some(o) = self.oauth.as_mut()
            && !o.client_secret.is_empty()
        {
            o.client_secret = REDACTED_SECRET.to_string();
        }
        self
    }

    fn join(&self, path: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        if path.starts_with('/') {
            format!("{base}{path}")
        } else {
            format!("{base}/{path}")
        }
    }
}

/// 按认证方式给出默认凭证字段。
pub fn default_credential_fields(auth_type: AuthType) -> Vec<CredentialField> {
    match auth_type {
        AuthType::ApiKey => vec![CredentialField::new("api_key", "API Key", true, true)],
        AuthType::Bearer => vec![CredentialField::new("token", "Bearer Token", true, true)],
        AuthType::OAuth => vec![
            CredentialField::new("refresh_token", "Refresh Token", true, true),
            CredentialField::new("access_token", "Access Token", false, true),
        ],
    }
}

/// 内置 provider（首次启动时写入注册表）。
pub fn builtin_providers() -> Vec<Provider> {
    let make = |id: &str, name: &str, auth_type: AuthType, base_url: &str| Provider {
        id: id.to_string(),
        name: name.to_string(),
        builtin: true,
        auth_type,
        base_url: base_url.to_string(),
        models: Vec::new(),
        credential_fields: default_credential_fields(auth_type),
        oauth: None,
        credits_path: None,
        validate_path: None,
    };

    let mut deepseek = make(
        "deepseek",
        "DeepSeek",
        AuthType::ApiKey,
        "https://api.deepseek.com/v1",
    );
    deepseek.credits_path = Some("/user/balance".to_string());

    let mut openrouter = make(
        "openrouter",
        "OpenRouter",
        AuthType::Bearer,
        "https://openrouter.ai/api/v1",
    );
    openrouter.credits_path = Some("/credits".to_string());

    vec![
        make("openai", "OpenAI", AuthType::ApiKey, "https://api.openai.com/v1"),
        deepseek,
        openrouter,
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Online,
    Offline,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceSnapshot {
    pub amount: f64,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: String,
    pub provider_id: String,
    pub name: String,
    #[serde(default)]
    pub status: AccountStatus,
    pub enabled: bool,
    pub daily_quota: u64,
    #[serde(default)]
    pub used: u64,
    pub last_reset: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance: Option<BalanceSnapshot>,
    #[serde(default)]
    pub consecutive_failures: u32,
    pub created_at: DateTime<Utc>,
    /// 稳定排序序号（轮询游标基于它推进）。
    #[serde(default)]
    pub seq: u64,
}

impl Account {
    pub fn is_eligible(&self) -> bool {
        self.enabled && self.status != AccountStatus::Offline && self.used < self.daily_quota
    }

    pub fn usage_ratio(&self) -> f64 {
        if self.daily_quota == 0 {
            return 1.0;
        }
        self.used as f64 / self.daily_quota as f64
    }
}

/// 一次健康探测或真实请求的结果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthOutcome {
    Success,
    TransportFailure,
    AuthFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageOutcome {
    pub used: u64,
    pub daily_quota: u64,
    pub exhausted: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAccount {
    pub provider_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub daily_quota: Option<u64>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountPatch {
    pub name: Option<String>,
    pub daily_quota: Option<u64>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderPatch {
    pub name: Option<String>,
    pub base_url: Option<String>,
    pub models: Option<Vec<String>>,
    pub credential_fields: Option<Vec<CredentialField>>,
    pub oauth: Option<OAuthSettings>,
    pub credits_path: Option<String>,
    pub validate_path: Option<String>,
}
