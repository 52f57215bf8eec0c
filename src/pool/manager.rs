use crate::error::GatewayError;
use crate::pool::types::{
    Account, AccountPatch, AccountStatus, BalanceSnapshot, HealthOutcome, NewAccount, Provider,
    ProviderPatch, REDACTED_SECRET, UsageOutcome, builtin_providers, default_credential_fields,
};
use crate::util::id;
use anyhow::{Context, anyhow};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tokio::sync::{Mutex, RwLock};

pub const DEFAULT_DAILY_QUOTA: u64 = 1_000;

/// 账号池：provider 注册表 + 每个账号的健康/用量状态。
///
/// 账号结构（增删）由外层 RwLock 保护；单个账号的用量与状态由各自的 Mutex 保护，
/// 不同账号之间的记账互不阻塞。
#[derive(Debug)]
pub struct AccountPool {
    providers: RwLock<HashMap<String, Provider>>,
    inner: RwLock<Inner>,
    next_seq: AtomicU64,
    failure_threshold: AtomicU32,
    file_path: Option<PathBuf>,
}

#[derive(Debug, Default)]
struct Inner {
    accounts: HashMap<String, Arc<Mutex<Account>>>,
    order: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PoolSnapshot {
    providers: Vec<Provider>,
    accounts: Vec<Account>,
}

impl AccountPool {
    pub fn new(file_path: Option<PathBuf>, failure_threshold: u32) -> Self {
        let providers = builtin_providers()
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect();
        Self {
            providers: RwLock::new(providers),
            inner: RwLock::new(Inner::default()),
            next_seq: AtomicU64::new(1),
            failure_threshold: AtomicU32::new(failure_threshold.max(1)),
            file_path,
        }
    }

    pub fn set_failure_threshold(&self, threshold: u32) {
        self.failure_threshold
            .store(threshold.max(1), Ordering::Relaxed);
    }

    // ===== 持久化 =====

    pub async fn load(&self) -> anyhow::Result<()> {
        let Some(path) = &self.file_path else {
            return Ok(());
        };
        let data = match tokio::fs::read(path).await {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e).context("读取 pool.json 失败"),
        };
        let snapshot: PoolSnapshot = sonic_rs::from_slice(&data)
            .map_err(|e| anyhow!(e))
            .context("解析 pool.json 失败")?;

        {
            let mut providers = self.providers.write().await;
            for p in snapshot.providers {
                providers.insert(p.id.clone(), p);
            }
        }

        let mut accounts = snapshot.accounts;
        accounts.sort_by_key(|a| a.seq);
        let max_seq = accounts.iter().map(|a| a.seq).max().unwrap_or(0);
        self.next_seq.store(max_seq + 1, Ordering::SeqCst);

        let mut inner = self.inner.write().await;
        inner.accounts.clear();
        inner.order.clear();
        for a in accounts {
            inner.order.push(a.id.clone());
            inner.accounts.insert(a.id.clone(), Arc::new(Mutex::new(a)));
        }
        Ok(())
    }

    pub async fn save(&self) -> anyhow::Result<()> {
        let Some(path) = &self.file_path else {
            return Ok(());
        };
        let snapshot = PoolSnapshot {
            providers: self.list_providers().await,
            accounts: self.list_accounts().await,
        };
        ensure_parent_dir(path).await?;
        let data = sonic_rs::to_vec_pretty(&snapshot).context("序列化 pool.json 失败")?;
        tokio::fs::write(path, data)
            .await
            .context("写入 pool.json 失败")
    }

    // ===== Provider 注册表 =====

    pub async fn list_providers(&self) -> Vec<Provider> {
        let providers = self.providers.read().await;
        let mut out: Vec<Provider> = providers.values().cloned().collect();
        out.sort_by(|a, b| b.builtin.cmp(&a.builtin).then_with(|| a.id.cmp(&b.id)));
        out
    }

    pub async fn get_provider(&self, provider_id: &str) -> Option<Provider> {
        self.providers.read().await.get(provider_id).cloned()
    }

    pub async fn provider_ids(&self) -> HashSet<String> {
        self.providers.read().await.keys().cloned().collect()
    }

    pub async fn add_provider(&self, mut provider: Provider) -> Result<Provider, GatewayError> {
        if provider.name.trim().is_empty() {
            return Err(GatewayError::bad_request("provider 名称不能为空"));
        }
        validate_base_url(&provider.base_url)?;
        if provider.id.trim().is_empty() {
            provider.id = id::provider_slug(&provider.name);
        }
        provider.builtin = false;
        if provider.credential_fields.is_empty() {
            provider.credential_fields = default_credential_fields(provider.auth_type);
        }
        if provider.auth_type == crate::pool::types::AuthType::OAuth && provider.oauth.is_none()
        {
            return Err(GatewayError::bad_request("OAuth provider 缺少 oauth 配置"));
        }

        let mut providers = self.providers.write().await;
        if providers.contains_key(&provider.id) {
            return Err(GatewayError::bad_request(format!(
                "provider 已存在: {}",
                provider.id
            )));
        }
        providers.insert(provider.id.clone(), provider.clone());
        Ok(provider)
    }

    pub async fn update_provider(
        &self,
        provider_id: &str,
        patch: ProviderPatch,
    ) -> Result<Provider, GatewayError> {
        if let Some(url) = &patch.base_url {
            validate_base_url(url)?;
        }
        let mut providers = self.providers.write().await;
        let p = providers
            .get_mut(provider_id)
            .ok_or_else(|| GatewayError::not_found(format!("provider {provider_id}")))?;

        if let Some(name) = patch.name.filter(|n| !n.trim().is_empty()) {
            p.name = name.trim().to_string();
        }
        if let Some(url) = patch.base_url {
            p.base_url = url.trim().to_string();
        }
        if let Some(models) = patch.models {
            p.models = models;
        }
        if let Some(fields) = patch.credential_fields {
            p.credential_fields = fields;
        }
        if let Some(mut oauth) = patch.oauth {
            if oauth.client_secret == REDACTED_SECRET {
                oauth.client_secret = p
                    .oauth
                    .as_ref()
                    .map(|o| o.client_secret.clone())
                    .unwrap_or_default();
            }
            p.oauth = Some(oauth);
        }
        if let Some(path) = patch.credits_path {
            p.credits_path = Some(path).filter(|s| !s.trim().is_empty());
        }
        if let Some(path) = patch.validate_path {
            p.validate_path = Some(path).filter(|s| !s.trim().is_empty());
        }
        Ok(p.clone())
    }

    pub async fn remove_provider(&self, provider_id: &str) -> Result<Provider, GatewayError> {
        let owned = self
            .list_accounts()
            .await
            .iter()
            .filter(|a| a.provider_id == provider_id)
            .count();
        let mut providers = self.providers.write().await;
        let Some(p) = providers.get(provider_id) else {
            return Err(GatewayError::not_found(format!("provider {provider_id}")));
        };
        if p.builtin {
            return Err(GatewayError::bad_request("内置 provider 不能删除"));
        }
        if owned > 0 {
            return Err(GatewayError::bad_request(format!(
                "provider {provider_id} 下仍有 {owned} 个账号"
            )));
        }
        providers
            .remove(provider_id)
            .ok_or_else(|| GatewayError::not_found(format!("provider {provider_id}")))
    }

    // ===== 账号 =====

    pub async fn add_account(&self, new: NewAccount) -> Result<Account, GatewayError> {
        if self.get_provider(&new.provider_id).await.is_none() {
            return Err(GatewayError::not_found(format!(
                "provider {}",
                new.provider_id
            )));
        }

        let now = Utc::now();
        let account_id = id::account_id();
        let name = if new.name.trim().is_empty() {
            account_id.clone()
        } else {
            new.name.trim().to_string()
        };
        let account = Account {
            id: account_id,
            provider_id: new.provider_id,
            name,
            status: AccountStatus::Unknown,
            enabled: new.enabled.unwrap_or(true),
            daily_quota: new.daily_quota.unwrap_or(DEFAULT_DAILY_QUOTA),
            used: 0,
            last_reset: now,
            balance: None,
            consecutive_failures: 0,
            created_at: now,
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
        };

        let mut inner = self.inner.write().await;
        inner.order.push(account.id.clone());
        inner
            .accounts
            .insert(account.id.clone(), Arc::new(Mutex::new(account.clone())));
        Ok(account)
    }

    pub async fn get_account(&self, account_id: &str) -> Option<Account> {
        let slot = self.slot(account_id).await?;
        let guard = slot.lock().await;
        Some(guard.clone())
    }

    pub async fn list_accounts(&self) -> Vec<Account> {
        let slots = self.ordered_slots().await;
        let mut out = Vec::with_capacity(slots.len());
        for slot in slots {
            out.push(slot.lock().await.clone());
        }
        out
    }

    pub async fn update_account(
        &self,
        account_id: &str,
        patch: AccountPatch,
    ) -> Result<Account, GatewayError> {
        let slot = self.require_slot(account_id).await?;
        let mut a = slot.lock().await;
        if let Some(name) = patch.name.filter(|n| !n.trim().is_empty()) {
            a.name = name.trim().to_string();
        }
        if let Some(quota) = patch.daily_quota {
            a.daily_quota = quota;
            a.used = a.used.min(quota);
        }
        if let Some(enabled) = patch.enabled {
            // 重新启用离线账号：状态回到 unknown，使其重新参与选择。
            if enabled && !a.enabled && a.status == AccountStatus::Offline {
                a.status = AccountStatus::Unknown;
                a.consecutive_failures = 0;
            }
            a.enabled = enabled;
        }
        Ok(a.clone())
    }

    pub async fn remove_account(&self, account_id: &str) -> Result<Account, GatewayError> {
        let slot = {
            let mut inner = self.inner.write().await;
            let slot = inner
                .accounts
                .remove(account_id)
                .ok_or_else(|| GatewayError::not_found(format!("账号 {account_id}")))?;
            inner.order.retain(|id| id != account_id);
            slot
        };
        let removed = slot.lock().await.clone();
        Ok(removed)
    }

    pub async fn set_balance(&self, account_id: &str, amount: f64) -> Result<(), GatewayError> {
        let slot = self.require_slot(account_id).await?;
        slot.lock().await.balance = Some(BalanceSnapshot {
            amount,
            fetched_at: Utc::now(),
        });
        Ok(())
    }

    /// 可参与选择的账号：启用、非离线、未用尽配额；按稳定顺序返回。
    pub async fn list_eligible(
        &self,
        provider_id: Option<&str>,
        model: Option<&str>,
    ) -> Vec<Account> {
        let providers = self.providers.read().await.clone();
        let slots = self.ordered_slots().await;

        let mut out = Vec::new();
        for slot in slots {
            let a = slot.lock().await;
            if !a.is_eligible() {
                continue;
            }
            if provider_id.is_some_and(|p| p != a.provider_id) {
                continue;
            }
            if let Some(model) = model {
                let supported = providers
                    .get(&a.provider_id)
                    .is_some_and(|p| p.supports_model(model));
                if !supported {
                    continue;
                }
            }
            out.push(a.clone());
        }
        out
    }

    /// 原子地累加用量。超出配额的部分被截断（used 永不超过 daily_quota），
    /// 并把账号标记为本窗口内不可用，而不是拒绝这次记账。
    pub async fn record_usage(
        &self,
        account_id: &str,
        delta: u64,
    ) -> Result<UsageOutcome, GatewayError> {
        let slot = self.require_slot(account_id).await?;
        let mut a = slot.lock().await;
        a.used = a.used.saturating_add(delta).min(a.daily_quota);
        let exhausted = a.used >= a.daily_quota;
        if exhausted {
            tracing::info!(account_id, used = a.used, "账号今日配额已用尽");
        }
        Ok(UsageOutcome {
            used: a.used,
            daily_quota: a.daily_quota,
            exhausted,
        })
    }

    /// 根据最近一次探测/请求结果更新账号状态。
    ///
    /// 单次传输失败不会直接置为离线，连续失败达到阈值或确认鉴权失败才会。
    pub async fn mark_health(
        &self,
        account_id: &str,
        outcome: HealthOutcome,
    ) -> Result<AccountStatus, GatewayError> {
        let threshold = self.failure_threshold.load(Ordering::Relaxed);
        let slot = self.require_slot(account_id).await?;
        let mut a = slot.lock().await;
        match outcome {
            HealthOutcome::Success => {
                a.consecutive_failures = 0;
                a.status = AccountStatus::Online;
            }
            HealthOutcome::TransportFailure => {
                a.consecutive_failures = a.consecutive_failures.saturating_add(1);
                if a.consecutive_failures >= threshold {
                    if a.status != AccountStatus::Offline {
                        tracing::warn!(
                            account_id,
                            failures = a.consecutive_failures,
                            "连续失败达到阈值，账号置为离线"
                        );
                    }
                    a.status = AccountStatus::Offline;
                }
            }
            HealthOutcome::AuthFailure => {
                a.consecutive_failures = a.consecutive_failures.saturating_add(1);
                a.status = AccountStatus::Offline;
            }
        }
        Ok(a.status)
    }

    pub async fn mark_offline(&self, account_id: &str) -> Result<(), GatewayError> {
        self.mark_health(account_id, HealthOutcome::AuthFailure)
            .await
            .map(|_| ())
    }

    /// 滚动窗口到期的账号清零用量；返回被重置的账号数。
    pub async fn reset_due(&self, now: DateTime<Utc>, window: ChronoDuration) -> usize {
        let slots = self.ordered_slots().await;
        let mut reset = 0usize;
        for slot in slots {
            let mut a = slot.lock().await;
            if now - a.last_reset >= window {
                a.used = 0;
                a.last_reset = now;
                reset += 1;
            }
        }
        reset
    }

    async fn slot(&self, account_id: &str) -> Option<Arc<Mutex<Account>>> {
        self.inner.read().await.accounts.get(account_id).cloned()
    }

    async fn require_slot(&self, account_id: &str) -> Result<Arc<Mutex<Account>>, GatewayError> {
        self.slot(account_id)
            .await
            .ok_or_else(|| GatewayError::not_found(format!("账号 {account_id}")))
    }

    async fn ordered_slots(&self) -> Vec<Arc<Mutex<Account>>> {
        let inner = self.inner.read().await;
        inner
            .order
            .iter()
            .filter_map(|id| inner.accounts.get(id).cloned())
            .collect()
    }
}

fn validate_base_url(url: &str) -> Result<(), GatewayError> {
    let parsed = reqwest::Url::parse(url.trim())
        .map_err(|e| GatewayError::bad_request(format!("base_url 无效: {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(GatewayError::bad_request("base_url 必须是 http 或 https"));
    }
    Ok(())
}

async fn ensure_parent_dir(path: &Path) -> anyhow::Result<()> {
    let Some(dir) = path.parent() else {
        return Ok(());
    };
    tokio::fs::create_dir_all(dir)
        .await
        .context("创建数据目录失败")
}
