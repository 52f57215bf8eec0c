//! 引擎装配：把保险库、令牌管理、账号池、负载均衡、网关与统计串起来，
//! 并提供控制面使用的全部操作（provider/账号 CRUD、OAuth、日志、配置、代理启停）。

use crate::balancer::LoadBalancer;
use crate::config::Config;
use crate::credential::oauth::{self, OAuthClient, OAuthEvent, OAuthStates, TokenEndpoint};
use crate::credential::types::{Credential, OAuthToken};
use crate::credential::{TokenManager, Vault};
use crate::error::GatewayError;
use crate::gateway::Gateway;
use crate::pool::AccountPool;
use crate::pool::types::{
    Account, AccountPatch, AccountStatus, AuthType, BalanceSnapshot, HealthOutcome, NewAccount,
    Provider, ProviderPatch,
};
use crate::runtime_config::{ConfigView, RuntimeConfig, SettingsPatch};
use crate::server::{ProxyServer, ProxyStatus};
use crate::stats::{
    Aggregator, ExportFormat, Level, LogEntry, LogFilter, LogStats, NewLog, ProxyStatistics,
    TrendPoint,
};
use crate::upstream::{HttpUpstream, Upstream, UpstreamError, extract_balance};
use anyhow::Context;
use chrono::{DateTime, Utc};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const OAUTH_EVENT_CAPACITY: usize = 256;
const CREDITS_CACHE_TTL: Duration = Duration::from_secs(60);
const CREDITS_CACHE_CAPACITY: u64 = 10_000;

/// 控制面看到的账号：账号本身 + 凭证摘要（不含任何密钥）。
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountView {
    #[serde(flatten)]
    pub account: Account,
    pub credential_type: Option<&'static str>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAccount {
    pub provider_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub daily_quota: Option<u64>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub credentials: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateAccount {
    #[serde(flatten)]
    pub patch: AccountPatch,
    #[serde(default)]
    pub credentials: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenValidation {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginStart {
    pub auth_url: String,
    pub state: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteLogin {
    #[serde(default)]
    pub callback_url: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub name: String,
}

pub struct Engine {
    pub cfg: Config,
    pub pool: Arc<AccountPool>,
    pub vault: Arc<Vault>,
    pub tokens: Arc<TokenManager>,
    pub balancer: Arc<LoadBalancer>,
    pub stats: Arc<Aggregator>,
    pub settings: Arc<RuntimeConfig>,
    pub gateway: Arc<Gateway>,
    pub server: ProxyServer,
    upstream: Arc<dyn Upstream>,
    endpoint: Arc<dyn TokenEndpoint>,
    oauth_states: OAuthStates,
    events: broadcast::Sender<OAuthEvent>,
    credits: Cache<String, BalanceSnapshot>,
}

impl Engine {
    /// 生产装配：上游与令牌端点都走 reqwest。
    pub fn new(cfg: Config) -> anyhow::Result<Self> {
        let upstream = Arc::new(HttpUpstream::new(&cfg).context("初始化上游 HTTP 客户端失败")?);
        let endpoint = Arc::new(OAuthClient::new(&cfg).context("初始化 OAuth 客户端失败")?);
        Ok(Self::with_parts(cfg, upstream, endpoint))
    }

    pub fn with_parts(
        cfg: Config,
        upstream: Arc<dyn Upstream>,
        endpoint: Arc<dyn TokenEndpoint>,
    ) -> Self {
        let settings = Arc::new(RuntimeConfig::from_config(&cfg));
        let live = settings.live();
        let pool = Arc::new(AccountPool::new(
            cfg.data_path("pool.json"),
            live.failure_threshold,
        ));
        let vault = Arc::new(Vault::new(cfg.data_path("credentials.json")));
        let stats = Arc::new(Aggregator::new(live.log_capacity));
        let (events, _) = broadcast::channel(OAUTH_EVENT_CAPACITY);
        let tokens = Arc::new(TokenManager::new(
            vault.clone(),
            pool.clone(),
            stats.clone(),
            endpoint.clone(),
            events.clone(),
        ));
        let balancer = Arc::new(LoadBalancer::new());
        let gateway = Arc::new(Gateway {
            pool: pool.clone(),
            tokens: tokens.clone(),
            balancer: balancer.clone(),
            upstream: upstream.clone(),
            stats: stats.clone(),
            settings: settings.clone(),
            log_level: cfg.log_level(),
        });
        let server = ProxyServer::new(gateway.clone());
        let credits = Cache::builder()
            .max_capacity(CREDITS_CACHE_CAPACITY)
            .time_to_live(CREDITS_CACHE_TTL)
            .build();

        Self {
            cfg,
            pool,
            vault,
            tokens,
            balancer,
            stats,
            settings,
            gateway,
            server,
            upstream,
            endpoint,
            oauth_states: OAuthStates::new(),
            events,
            credits,
        }
    }

    /// 加载落盘状态（设置、provider/账号、凭证）。文件缺失视为首次启动。
    pub async fn load(&self) -> anyhow::Result<()> {
        self.settings.load().await.context("加载 settings.json 失败")?;
        self.pool.load().await.context("加载 pool.json 失败")?;
        self.vault.load().await.context("加载 credentials.json 失败")?;

        let live = self.settings.live();
        self.pool.set_failure_threshold(live.failure_threshold);
        self.stats.set_log_capacity(live.log_capacity).await;
        Ok(())
    }

    async fn save_pool(&self) -> Result<(), GatewayError> {
        self.pool.save().await.context("保存 pool.json 失败")?;
        Ok(())
    }

    async fn save_vault(&self) -> Result<(), GatewayError> {
        self.vault.save().await.context("保存 credentials.json 失败")?;
        Ok(())
    }

    // ===== 代理 =====

    pub async fn proxy_start(&self, port: Option<u16>) -> Result<bool, GatewayError> {
        let started = self.server.start(port).await?;
        if started {
            let status = self.server.status().await;
            self.stats
                .append(
                    NewLog::new(
                        Level::Info,
                        format!("代理服务已启动，端口 {}", status.port.unwrap_or_default()),
                    )
                    .event("proxy_started"),
                )
                .await;
        }
        Ok(started)
    }

    pub async fn proxy_stop(&self) -> bool {
        let stopped = self.server.stop().await;
        if stopped {
            self.stats
                .append(NewLog::new(Level::Info, "代理服务已停止").event("proxy_stopped"))
                .await;
        }
        stopped
    }

    pub async fn proxy_status(&self) -> ProxyStatus {
        self.server.status().await
    }

    pub async fn statistics(&self) -> ProxyStatistics {
        self.stats.statistics().await
    }

    pub async fn clear_statistics(&self) {
        self.stats.clear_statistics().await;
    }

    // ===== Provider =====

    /// 返回给控制面的 provider 一律掩码 client_secret。
    pub async fn list_providers(&self) -> Vec<Provider> {
        self.pool
            .list_providers()
            .await
            .into_iter()
            .map(Provider::redacted)
            .collect()
    }

    pub async fn add_provider(&self, provider: Provider) -> Result<Provider, GatewayError> {
        let p = self.pool.add_provider(provider).await?;
        self.save_pool().await?;
        Ok(p.redacted())
    }

    pub async fn update_provider(
        &self,
        provider_id: &str,
        patch: ProviderPatch,
    ) -> Result<Provider, GatewayError> {
        let p = self.pool.update_provider(provider_id, patch).await?;
        self.save_pool().await?;
        Ok(p.redacted())
    }

    pub async fn remove_provider(&self, provider_id: &str) -> Result<Provider, GatewayError> {
        let p = self.pool.remove_provider(provider_id).await?;
        self.save_pool().await?;
        Ok(p.redacted())
    }

    // ===== 账号 =====

    async fn view(&self, account: Account) -> AccountView {
        let (credential_type, expires_at) = match self.vault.get(&account.id).await {
            Ok(entry) => (
                Some(credential_kind(&entry.credential)),
                entry.credential.expires_at(),
            ),
            Err(_) => (None, None),
        };
        AccountView {
            account,
            credential_type,
            expires_at,
        }
    }

    pub async fn list_accounts(&self) -> Vec<AccountView> {
        let mut out = Vec::new();
        for a in self.pool.list_accounts().await {
            out.push(self.view(a).await);
        }
        out
    }

    pub async fn get_account(&self, account_id: &str) -> Result<AccountView, GatewayError> {
        let a = self.require_account(account_id).await?;
        Ok(self.view(a).await)
    }

    async fn require_account(&self, account_id: &str) -> Result<Account, GatewayError> {
        self.pool
            .get_account(account_id)
            .await
            .ok_or_else(|| GatewayError::not_found(format!("账号 {account_id}")))
    }

    async fn require_provider(&self, provider_id: &str) -> Result<Provider, GatewayError> {
        self.pool
            .get_provider(provider_id)
            .await
            .ok_or_else(|| GatewayError::not_found(format!("provider {provider_id}")))
    }

    pub async fn create_account(&self, req: CreateAccount) -> Result<AccountView, GatewayError> {
        let provider = self.require_provider(&req.provider_id).await?;
        let credential = build_credential(&provider, &req.credentials)?;
        let account = self
            .pool
            .add_account(NewAccount {
                provider_id: req.provider_id,
                name: req.name,
                daily_quota: req.daily_quota,
                enabled: req.enabled,
            })
            .await?;
        self.vault.put(&account.id, credential).await;
        self.save_pool().await?;
        self.save_vault().await?;
        tracing::info!(account_id = %account.id, provider_id = %account.provider_id, "已添加账号");
        Ok(self.view(account).await)
    }

    pub async fn update_account(
        &self,
        account_id: &str,
        req: UpdateAccount,
    ) -> Result<AccountView, GatewayError> {
        let account = self.require_account(account_id).await?;
        let credential = match &req.credentials {
            Some(fields) => {
                let provider = self.require_provider(&account.provider_id).await?;
                Some(build_credential(&provider, fields)?)
            }
            None => None,
        };

        let account = self.pool.update_account(account_id, req.patch).await?;
        if let Some(credential) = credential {
            self.vault.put(account_id, credential).await;
            self.tokens.forget(account_id).await;
            self.credits.invalidate(account_id).await;
            self.save_vault().await?;
        }
        self.save_pool().await?;
        Ok(self.view(account).await)
    }

    pub async fn delete_account(&self, account_id: &str) -> Result<Account, GatewayError> {
        let removed = self.pool.remove_account(account_id).await?;
        self.vault.delete(account_id).await;
        self.tokens.forget(account_id).await;
        self.balancer.forget_account(account_id).await;
        self.credits.invalidate(account_id).await;
        self.save_pool().await?;
        self.save_vault().await?;
        tracing::info!(account_id, "已删除账号");
        Ok(removed)
    }

    /// 用账号凭证探测上游，结果计入健康状态；OAuth 凭证过期时会先刷新。
    pub async fn check_status(&self, account_id: &str) -> Result<AccountView, GatewayError> {
        let account = self.require_account(account_id).await?;
        let provider = self.require_provider(&account.provider_id).await?;
        let timeout = self.settings.live().timeout();

        let outcome = match self.tokens.ensure_valid(account_id).await {
            Ok(grant) => match self
                .upstream
                .probe(&provider.probe_url(), &grant.capability, timeout)
                .await
            {
                Ok(()) => HealthOutcome::Success,
                Err(e) => health_of(&e),
            },
            Err(_) => HealthOutcome::AuthFailure,
        };
        let status = self.pool.mark_health(account_id, outcome).await?;
        self.save_pool().await?;

        let level = if status == AccountStatus::Offline {
            Level::Warn
        } else {
            Level::Info
        };
        self.stats
            .append(
                NewLog::new(level, format!("账号 {} 状态检查：{:?}", account.name, status))
                    .event("status_checked")
                    .account(account_id)
                    .provider(&provider.id),
            )
            .await;
        self.get_account(account_id).await
    }

    /// 校验凭证是否可用；不刷新、不改动任何状态。
    pub async fn validate_token(&self, account_id: &str) -> Result<TokenValidation, GatewayError> {
        let account = self.require_account(account_id).await?;
        let provider = self.require_provider(&account.provider_id).await?;
        let entry = self.vault.get(account_id).await?;

        if entry.credential.is_expired(Utc::now().timestamp_millis()) {
            return Ok(TokenValidation {
                valid: false,
                message: Some("凭证已过期".to_string()),
            });
        }
        let Some(cap) = entry.credential.capability() else {
            return Ok(TokenValidation {
                valid: false,
                message: Some("凭证为空".to_string()),
            });
        };
        let timeout = self.settings.live().timeout();
        Ok(
            match self.upstream.probe(&provider.probe_url(), &cap, timeout).await {
                Ok(()) => TokenValidation {
                    valid: true,
                    message: None,
                },
                Err(e) => TokenValidation {
                    valid: false,
                    message: Some(e.to_string()),
                },
            },
        )
    }

    /// 查询余额（60 秒内命中缓存）。
    pub async fn get_credits(&self, account_id: &str) -> Result<BalanceSnapshot, GatewayError> {
        if let Some(hit) = self.credits.get(account_id).await {
            return Ok(hit);
        }

        let account = self.require_account(account_id).await?;
        let provider = self.require_provider(&account.provider_id).await?;
        let url = provider.credits_url().ok_or_else(|| {
            GatewayError::bad_request(format!("provider {} 不支持余额查询", provider.id))
        })?;
        let grant = self.tokens.ensure_valid(account_id).await?;
        let timeout = self.settings.live().timeout();

        let value = self
            .upstream
            .fetch_json(&url, &grant.capability, timeout)
            .await
            .map_err(|e| GatewayError::UpstreamTransport(e.to_string()))?;
        let amount = extract_balance(&value).ok_or_else(|| {
            GatewayError::UpstreamTransport("余额响应中未找到数值字段".to_string())
        })?;

        self.pool.set_balance(account_id, amount).await?;
        let snapshot = self
            .pool
            .get_account(account_id)
            .await
            .and_then(|a| a.balance)
            .unwrap_or(BalanceSnapshot {
                amount,
                fetched_at: Utc::now(),
            });
        self.credits
            .insert(account_id.to_string(), snapshot.clone())
            .await;
        self.save_pool().await?;
        Ok(snapshot)
    }

    // ===== OAuth =====

    pub fn subscribe_oauth(&self) -> broadcast::Receiver<OAuthEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: OAuthEvent) {
        let _ = self.events.send(event);
    }

    pub async fn start_login(&self, provider_id: &str) -> Result<LoginStart, GatewayError> {
        let provider = self.require_provider(provider_id).await?;
        let settings = oauth_settings(&provider)?;
        let state = self.oauth_states.issue(provider_id).await;
        let auth_url = oauth::build_auth_url(settings, &settings.redirect_uri, &state)?;
        self.emit(OAuthEvent::LoginStarted {
            provider_id: provider_id.to_string(),
            auth_url: auth_url.clone(),
        });
        Ok(LoginStart { auth_url, state })
    }

    /// 授权回调：校验 state，用授权码换取令牌并创建账号。
    pub async fn complete_login(
        &self,
        provider_id: &str,
        req: CompleteLogin,
    ) -> Result<AccountView, GatewayError> {
        let result = self.complete_login_inner(provider_id, req).await;
        match &result {
            Ok(view) => self.emit(OAuthEvent::LoginSucceeded {
                provider_id: provider_id.to_string(),
                account_id: view.account.id.clone(),
            }),
            Err(e) => self.emit(OAuthEvent::LoginFailed {
                provider_id: provider_id.to_string(),
                message: e.to_string(),
            }),
        }
        result
    }

    async fn complete_login_inner(
        &self,
        provider_id: &str,
        req: CompleteLogin,
    ) -> Result<AccountView, GatewayError> {
        let provider = self.require_provider(provider_id).await?;
        let settings = oauth_settings(&provider)?;

        let (code, state) = match req.callback_url.as_deref().filter(|s| !s.trim().is_empty()) {
            Some(url) => oauth::parse_callback_url(url)?,
            None => (
                req.code.unwrap_or_default(),
                req.state.unwrap_or_default(),
            ),
        };
        if code.trim().is_empty() {
            return Err(GatewayError::bad_request("缺少授权码"));
        }
        if self.oauth_states.take(&state).await.as_deref() != Some(provider_id) {
            return Err(GatewayError::bad_request("state 无效或已过期，请重新发起登录"));
        }

        let token = self
            .endpoint
            .exchange_code(settings, code.trim(), &settings.redirect_uri)
            .await
            .map_err(|e| GatewayError::bad_request(format!("授权码换取令牌失败：{e}")))?;

        let account = self
            .pool
            .add_account(NewAccount {
                provider_id: provider_id.to_string(),
                name: req.name,
                daily_quota: None,
                enabled: None,
            })
            .await?;
        self.vault.put(&account.id, Credential::OAuth(token)).await;
        self.save_pool().await?;
        self.save_vault().await?;
        self.stats
            .append(
                NewLog::new(Level::Info, format!("OAuth 登录成功，新增账号 {}", account.name))
                    .event("oauth_login")
                    .account(&account.id)
                    .provider(provider_id),
            )
            .await;
        Ok(self.view(account).await)
    }

    /// 用粘贴的 refresh_token 创建账号，并立即刷新一次；刷新失败时不保留账号。
    pub async fn login_with_token(
        &self,
        provider_id: &str,
        refresh_token: &str,
        name: &str,
    ) -> Result<AccountView, GatewayError> {
        let result = self
            .login_with_token_inner(provider_id, refresh_token, name)
            .await;
        match &result {
            Ok(view) => self.emit(OAuthEvent::LoginSucceeded {
                provider_id: provider_id.to_string(),
                account_id: view.account.id.clone(),
            }),
            Err(e) => self.emit(OAuthEvent::LoginFailed {
                provider_id: provider_id.to_string(),
                message: e.to_string(),
            }),
        }
        result
    }

    async fn login_with_token_inner(
        &self,
        provider_id: &str,
        refresh_token: &str,
        name: &str,
    ) -> Result<AccountView, GatewayError> {
        let provider = self.require_provider(provider_id).await?;
        oauth_settings(&provider)?;
        let refresh_token = refresh_token.trim();
        if refresh_token.is_empty() {
            return Err(GatewayError::bad_request("refresh_token 不能为空"));
        }

        let account = self
            .pool
            .add_account(NewAccount {
                provider_id: provider_id.to_string(),
                name: name.to_string(),
                daily_quota: None,
                enabled: None,
            })
            .await?;
        self.vault
            .put(
                &account.id,
                Credential::OAuth(OAuthToken {
                    access_token: String::new(),
                    refresh_token: refresh_token.to_string(),
                    expires_in: 0,
                    timestamp: 0,
                }),
            )
            .await;

        if let Err(e) = self.tokens.refresh(&account.id).await {
            let _ = self.pool.remove_account(&account.id).await;
            self.vault.delete(&account.id).await;
            self.tokens.forget(&account.id).await;
            return Err(e);
        }
        self.pool
            .mark_health(&account.id, HealthOutcome::Success)
            .await?;
        self.save_pool().await?;
        self.save_vault().await?;
        self.get_account(&account.id).await
    }

    /// 显式刷新 OAuth 令牌（忽略此前的失败记录）。
    pub async fn refresh_token(&self, account_id: &str) -> Result<AccountView, GatewayError> {
        self.require_account(account_id).await?;
        self.tokens.refresh(account_id).await?;
        // 刷新成功说明凭证可用：离线账号恢复在线。
        let account = self.require_account(account_id).await?;
        if account.status == AccountStatus::Offline {
            self.pool
                .mark_health(account_id, HealthOutcome::Success)
                .await?;
            self.save_pool().await?;
        }
        self.get_account(account_id).await
    }

    // ===== 日志 =====

    pub async fn logs(&self, filter: &LogFilter) -> Vec<LogEntry> {
        self.stats.query(filter).await
    }

    pub async fn log_stats(&self) -> LogStats {
        self.stats.log_stats().await
    }

    pub async fn trend(&self, days: u32) -> Vec<TrendPoint> {
        self.stats.trend(days).await
    }

    pub async fn clear_logs(&self) {
        self.stats.clear_logs().await;
    }

    pub async fn export_logs(&self, format: ExportFormat) -> Result<String, GatewayError> {
        Ok(self.stats.export(format).await?)
    }

    pub fn subscribe_logs(&self) -> broadcast::Receiver<LogEntry> {
        self.stats.subscribe()
    }

    // ===== 配置 =====

    pub async fn config_view(&self) -> ConfigView {
        let running = self.server.running_binding().await;
        self.settings.view(running.as_ref())
    }

    /// 部分更新配置：校验通过后立即对新请求生效；host/port 需重启代理。
    pub async fn update_config(&self, patch: SettingsPatch) -> Result<ConfigView, GatewayError> {
        let providers = self.pool.provider_ids().await;
        let (live, _) = self.settings.update(patch, &providers).await?;
        self.pool.set_failure_threshold(live.failure_threshold);
        self.stats.set_log_capacity(live.log_capacity).await;
        self.stats
            .append(NewLog::new(Level::Info, "配置已更新").event("config_updated"))
            .await;
        Ok(self.config_view().await)
    }
}

fn credential_kind(c: &Credential) -> &'static str {
    match c {
        Credential::ApiKey { .. } => "api_key",
        Credential::Bearer { .. } => "bearer",
        Credential::OAuth(_) => "oauth",
    }
}

fn health_of(e: &UpstreamError) -> HealthOutcome {
    if e.is_auth_failure() {
        HealthOutcome::AuthFailure
    } else {
        HealthOutcome::TransportFailure
    }
}

fn oauth_settings(provider: &Provider) -> Result<&crate::pool::types::OAuthSettings, GatewayError> {
    match (&provider.auth_type, &provider.oauth) {
        (AuthType::OAuth, Some(s)) => Ok(s),
        _ => Err(GatewayError::bad_request(format!(
            "provider {} 未配置 OAuth",
            provider.id
        ))),
    }
}

/// 按 provider 声明的凭证字段构造凭证：先校验必填字段，再取认证方式对应的字段。
fn build_credential(
    provider: &Provider,
    fields: &HashMap<String, String>,
) -> Result<Credential, GatewayError> {
    let value = |name: &str| {
        fields
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    };
    for f in &provider.credential_fields {
        if f.required && value(&f.name).is_none() {
            return Err(GatewayError::bad_request(format!("缺少必填字段：{}", f.label)));
        }
    }
    // 自定义字段名时，退回到第一个声明的字段。
    let primary = |canonical: &str| {
        value(canonical).or_else(|| {
            provider
                .credential_fields
                .first()
                .and_then(|f| value(&f.name))
        })
    };
    let missing = |name: &str| GatewayError::bad_request(format!("缺少凭证字段：{name}"));

    match provider.auth_type {
        AuthType::ApiKey => Ok(Credential::ApiKey {
            api_key: primary("api_key").ok_or_else(|| missing("api_key"))?.to_string(),
        }),
        AuthType::Bearer => Ok(Credential::Bearer {
            token: primary("token").ok_or_else(|| missing("token"))?.to_string(),
        }),
        AuthType::OAuth => {
            let refresh_token = value("refresh_token").ok_or_else(|| missing("refresh_token"))?;
            let access_token = value("access_token").unwrap_or_default();
            let expires_in = value("expires_in")
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(0);
            Ok(Credential::OAuth(OAuthToken {
                access_token: access_token.to_string(),
                refresh_token: refresh_token.to_string(),
                expires_in,
                timestamp: if access_token.is_empty() {
                    0
                } else {
                    Utc::now().timestamp_millis()
                },
            }))
        }
    }
}
