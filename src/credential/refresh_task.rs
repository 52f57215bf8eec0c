use crate::credential::store::Vault;
use crate::credential::token_manager::TokenManager;
use crate::pool::AccountPool;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// 最大并发刷新数量（避免对 OAuth 端点造成突发压力）。
const MAX_CONCURRENT_REFRESHES: usize = 3;

/// 启动后台 token 刷新任务（主动刷新层）。
///
/// 根据最早的刷新时间点动态安排下一轮检查，过期时间未知的令牌不参与；刷新统一走 `TokenManager::ensure_valid`，
/// 与请求路径上的刷新共享去重，失败不重试。
pub fn spawn_token_refresh_task(
    vault: Arc<Vault>,
    pool: Arc<AccountPool>,
    tokens: Arc<TokenManager>,
) {
    tokio::spawn(async move {
        loop {
            let wait = refresh_cycle(&vault, &pool, &tokens).await;
            // 至少等 1 秒，最多等 30 分钟。
            let wait = wait
                .max(Duration::from_secs(1))
                .min(Duration::from_secs(30 * 60));
            tracing::debug!("下次 token 刷新检查将在 {:?} 后", wait);
            tokio::time::sleep(wait).await;
        }
    });
}

/// 执行一轮刷新，返回下一轮前应等待的时长。
pub async fn refresh_cycle(vault: &Vault, pool: &AccountPool, tokens: &Arc<TokenManager>) -> Duration {
    let due = vault.oauth_refresh_due().await;
    let now_ms = Utc::now().timestamp_millis();
    let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_REFRESHES));
    let mut handles = Vec::new();

    for (account_id, due_at) in due {
        let Some(due_at) = due_at else {
            continue;
        };
        if now_ms < due_at || !is_candidate(pool, &account_id).await {
            continue;
        }

        let tokens = tokens.clone();
        let semaphore = semaphore.clone();
        handles.push(tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return;
            };
            match tokens.ensure_valid(&account_id).await {
                Ok(_) => tracing::debug!(account_id = %account_id, "定时刷新检查完成"),
                Err(e) => tracing::warn!(account_id = %account_id, "定时刷新失败：{e}"),
            }
        }));
    }

    for h in handles {
        let _ = h.await;
    }

    // 刷新结束后，基于最新凭证计算最早需要刷新的时间点。
    let now_ms = Utc::now().timestamp_millis();
    let mut next_at_ms: Option<i64> = None;
    for (account_id, due_at) in vault.oauth_refresh_due().await {
        let Some(at) = due_at else {
            continue;
        };
        if !is_candidate(pool, &account_id).await {
            continue;
        }
        next_at_ms = Some(next_at_ms.map_or(at, |t| t.min(at)));
    }

    match next_at_ms {
        Some(t) => Duration::from_millis((t - now_ms).max(1000) as u64),
        None => Duration::from_secs(5 * 60),
    }
}

// 禁用、离线或配额用尽的账号不参与主动刷新；失败后的账号已离线，不会被反复刷新。
async fn is_candidate(pool: &AccountPool, account_id: &str) -> bool {
    pool.get_account(account_id)
        .await
        .is_some_and(|a| a.is_eligible())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::token_manager::tests::{MockEndpoint, expired_token, oauth_provider};
    use crate::credential::types::{Credential, OAuthToken};
    use crate::pool::types::NewAccount;
    use crate::stats::Aggregator;
    use std::sync::atomic::Ordering;
    use tokio::sync::broadcast;

    struct Fixture {
        vault: Arc<Vault>,
        pool: Arc<AccountPool>,
        endpoint: Arc<MockEndpoint>,
        tokens: Arc<TokenManager>,
        account_id: String,
    }

    async fn fixture(endpoint: MockEndpoint) -> Fixture {
        let vault = Arc::new(Vault::new(None));
        let pool = Arc::new(AccountPool::new(None, 3));
        let endpoint = Arc::new(endpoint);
        let (events, _) = broadcast::channel(4);
        let tokens = Arc::new(TokenManager::new(
            vault.clone(),
            pool.clone(),
            Arc::new(Aggregator::new(10)),
            endpoint.clone(),
            events,
        ));

        pool.add_provider(oauth_provider()).await.unwrap();
        let a = pool
            .add_account(NewAccount {
                provider_id: "corp".to_string(),
                name: String::new(),
                daily_quota: None,
                enabled: None,
            })
            .await
            .unwrap();
        Fixture {
            vault,
            pool,
            endpoint,
            tokens,
            account_id: a.id,
        }
    }

    #[tokio::test]
    async fn cycle_refreshes_expiring_tokens_once() {
        let Fixture {
            vault,
            pool,
            endpoint,
            tokens,
            account_id,
        } = fixture(MockEndpoint::new(false)).await;
        vault.put(&account_id, expired_token()).await;

        let wait = refresh_cycle(&vault, &pool, &tokens).await;
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 1);
        // 新 token 一小时后过期：下一轮安排在 55 分钟左右之后。
        assert!(wait > Duration::from_secs(50 * 60));

        refresh_cycle(&vault, &pool, &tokens).await;
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn token_without_known_expiry_is_left_alone() {
        let Fixture {
            vault,
            pool,
            endpoint,
            tokens,
            account_id,
        } = fixture(MockEndpoint::new(false)).await;
        vault
            .put(
                &account_id,
                Credential::OAuth(OAuthToken {
                    access_token: "at".to_string(),
                    refresh_token: "rt".to_string(),
                    expires_in: 0,
                    timestamp: Utc::now().timestamp_millis(),
                }),
            )
            .await;

        for _ in 0..3 {
            let wait = refresh_cycle(&vault, &pool, &tokens).await;
            assert_eq!(wait, Duration::from_secs(5 * 60));
        }
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 0);
    }
}
