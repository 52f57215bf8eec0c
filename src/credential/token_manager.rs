//! 令牌管理：保证账号凭证可用，并对同一账号的并发刷新去重。
//!
//! 每个账号同时至多一个刷新任务。任务以 `tokio::spawn` 独立运行，结果通过 `Shared` 分发给
//! 所有等待者；等待者被取消不会中断刷新本身。刷新失败会记住失败时的凭证版本，
//! 在凭证被替换或管理端显式刷新之前不再自动重试。

use crate::credential::oauth::{OAuthEvent, RefreshError, TokenEndpoint};
use crate::credential::store::{CasConflict, Vault, VaultEntry};
use crate::credential::types::{AuthCapability, Credential};
use crate::error::GatewayError;
use crate::pool::AccountPool;
use crate::pool::types::HealthOutcome;
use crate::stats::{Aggregator, Level, NewLog};
use chrono::Utc;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, broadcast};

type RefreshResult = Result<VaultEntry, RefreshError>;
type InFlight = Shared<BoxFuture<'static, RefreshResult>>;

/// 可直接用于转发的凭证：授权能力 + 对应的凭证版本。
#[derive(Debug, Clone)]
pub struct Grant {
    pub capability: AuthCapability,
    pub version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// 仅在过期时刷新。
    IfExpired,
    /// 上游拒绝了该版本的凭证。
    Rejected(u64),
    /// 管理端显式刷新：忽略失败记录。
    Explicit,
}

#[derive(Clone)]
struct Ctx {
    vault: Arc<Vault>,
    pool: Arc<AccountPool>,
    stats: Arc<Aggregator>,
    endpoint: Arc<dyn TokenEndpoint>,
    events: broadcast::Sender<OAuthEvent>,
    inflight: Arc<Mutex<HashMap<String, (u64, InFlight)>>>,
    failures: Arc<Mutex<HashMap<String, (u64, RefreshError)>>>,
}

pub struct TokenManager {
    ctx: Ctx,
    next_gen: AtomicU64,
}

impl TokenManager {
    pub fn new(
        vault: Arc<Vault>,
        pool: Arc<AccountPool>,
        stats: Arc<Aggregator>,
        endpoint: Arc<dyn TokenEndpoint>,
        events: broadcast::Sender<OAuthEvent>,
    ) -> Self {
        Self {
            ctx: Ctx {
                vault,
                pool,
                stats,
                endpoint,
                events,
                inflight: Arc::new(Mutex::new(HashMap::new())),
                failures: Arc::new(Mutex::new(HashMap::new())),
            },
            next_gen: AtomicU64::new(1),
        }
    }

    /// 返回可用凭证；过期的 OAuth 凭证会先刷新（与并发调用者共享同一次刷新）。
    pub async fn ensure_valid(&self, account_id: &str) -> Result<Grant, GatewayError> {
        let expired = || GatewayError::CredentialExpired(account_id.to_string());
        let entry = self.ctx.vault.get(account_id).await.map_err(|_| expired())?;

        let now_ms = Utc::now().timestamp_millis();
        if !entry.credential.is_expired(now_ms) {
            return grant(&entry).ok_or_else(expired);
        }
        if !entry.credential.is_oauth() {
            return Err(expired());
        }

        let entry = self
            .refresh_shared(account_id, Mode::IfExpired)
            .await
            .map_err(|_| expired())?;
        grant(&entry).ok_or_else(expired)
    }

    /// 上游以 401/403 拒绝了 `rejected_version` 对应的凭证时调用；每个请求最多调用一次。
    ///
    /// 非 OAuth 凭证无法刷新，直接返回 `CredentialExpired`。
    pub async fn force_refresh(
        &self,
        account_id: &str,
        rejected_version: u64,
    ) -> Result<Grant, GatewayError> {
        let expired = || GatewayError::CredentialExpired(account_id.to_string());
        let entry = self.ctx.vault.get(account_id).await.map_err(|_| expired())?;
        if !entry.credential.is_oauth() {
            return Err(expired());
        }
        let entry = self
            .refresh_shared(account_id, Mode::Rejected(rejected_version))
            .await
            .map_err(|_| expired())?;
        grant(&entry).ok_or_else(expired)
    }

    /// 管理端显式刷新。
    pub async fn refresh(&self, account_id: &str) -> Result<VaultEntry, GatewayError> {
        let entry = self.ctx.vault.get(account_id).await?;
        if !entry.credential.is_oauth() {
            return Err(GatewayError::bad_request(format!(
                "账号 {account_id} 不是 OAuth 凭证，无法刷新"
            )));
        }
        self.refresh_shared(account_id, Mode::Explicit)
            .await
            .map_err(|e| GatewayError::RefreshFailed {
                account_id: account_id.to_string(),
                message: e.to_string(),
            })
    }

    /// 凭证被替换或账号被删除后调用，清除失败记录。
    pub async fn forget(&self, account_id: &str) {
        self.ctx.failures.lock().await.remove(account_id);
    }

    async fn refresh_shared(&self, account_id: &str, mode: Mode) -> RefreshResult {
        let fut = {
            let mut inflight = self.ctx.inflight.lock().await;
            if let Some((_, f)) = inflight.get(account_id) {
                f.clone()
            } else {
                let entry = self
                    .ctx
                    .vault
                    .get(account_id)
                    .await
                    .map_err(|_| RefreshError::MissingRefreshToken)?;

                match mode {
                    Mode::IfExpired
                        if !entry.credential.is_expired(Utc::now().timestamp_millis()) =>
                    {
                        return Ok(entry);
                    }
                    Mode::Rejected(v) if v != entry.version => return Ok(entry),
                    _ => {}
                }
                if mode != Mode::Explicit
                    && let Some((v, err)) = self.ctx.failures.lock().await.get(account_id)
                    && *v == entry.version
                {
                    return Err(err.clone());
                }

                let generation = self.next_gen.fetch_add(1, Ordering::Relaxed);
                let handle = tokio::spawn(run_refresh(
                    self.ctx.clone(),
                    account_id.to_string(),
                    entry,
                    generation,
                ));
                let fut: InFlight = async move {
                    handle
                        .await
                        .unwrap_or_else(|e| Err(RefreshError::Transport(format!("刷新任务异常: {e}"))))
                }
                .boxed()
                .shared();
                inflight.insert(account_id.to_string(), (generation, fut.clone()));
                fut
            }
        };
        fut.await
    }
}

fn grant(entry: &VaultEntry) -> Option<Grant> {
    Some(Grant {
        capability: entry.credential.capability()?,
        version: entry.version,
    })
}

async fn run_refresh(ctx: Ctx, account_id: String, entry: VaultEntry, generation: u64) -> RefreshResult {
    let result = refresh_once(&ctx, &account_id, &entry).await;

    match &result {
        Ok(fresh) => {
            ctx.failures.lock().await.remove(&account_id);
            if let Err(e) = ctx.vault.save().await {
                tracing::warn!("刷新后保存凭证失败：{e:#}");
            }
            tracing::info!(account_id = %account_id, version = fresh.version, "已刷新 access_token");
            let _ = ctx.events.send(OAuthEvent::TokenRefreshed {
                account_id: account_id.clone(),
            });
        }
        Err(RefreshError::Revoked) => {
            ctx.failures.lock().await.remove(&account_id);
            tracing::info!(account_id = %account_id, "账号已删除，丢弃刷新结果");
        }
        Err(err) => {
            ctx.failures
                .lock()
                .await
                .insert(account_id.clone(), (entry.version, err.clone()));
            let _ = ctx
                .pool
                .mark_health(&account_id, HealthOutcome::AuthFailure)
                .await;

            let provider_id = ctx
                .pool
                .get_account(&account_id)
                .await
                .map(|a| a.provider_id)
                .unwrap_or_default();
            tracing::error!(account_id = %account_id, "刷新 access_token 失败：{err}");
            ctx.stats
                .append(
                    NewLog::new(Level::Error, format!("账号 {account_id} 刷新凭证失败：{err}"))
                        .event("refresh_failed")
                        .account(&account_id)
                        .provider(&provider_id),
                )
                .await;
            let _ = ctx.events.send(OAuthEvent::RefreshFailed {
                account_id: account_id.clone(),
                message: err.to_string(),
            });
        }
    }

    // 副作用全部落地后再摘除 in-flight 记录，后来者一定能看到新凭证或失败记录。
    let mut inflight = ctx.inflight.lock().await;
    if inflight.get(&account_id).is_some_and(|(g, _)| *g == generation) {
        inflight.remove(&account_id);
    }
    result
}

async fn refresh_once(ctx: &Ctx, account_id: &str, entry: &VaultEntry) -> RefreshResult {
    let refresh_token = entry
        .credential
        .refresh_token()
        .ok_or(RefreshError::MissingRefreshToken)?
        .to_string();

    let account = ctx
        .pool
        .get_account(account_id)
        .await
        .ok_or(RefreshError::NotConfigured)?;
    let settings = ctx
        .pool
        .get_provider(&account.provider_id)
        .await
        .and_then(|p| p.oauth)
        .ok_or(RefreshError::NotConfigured)?;

    let token = ctx.endpoint.refresh(&settings, &refresh_token).await?;

    // 刷新期间凭证被人工替换：以人工写入的为准；被删除则不再写回。
    match ctx
        .vault
        .put_if_version(account_id, entry.version, Credential::OAuth(token))
        .await
    {
        Ok(fresh) => Ok(fresh),
        Err(CasConflict::Stale(current)) => Ok(current),
        Err(CasConflict::Gone) => Err(RefreshError::Revoked),
    }
}
