//! 后台配额重置：按滚动窗口清零账号用量，与请求流量无关（空闲账号同样会被重置）。

use crate::pool::AccountPool;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

/// 滚动窗口长度：每个账号从自己的 `last_reset` 起算 24 小时。
pub const QUOTA_WINDOW_HOURS: i64 = 24;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub fn spawn_quota_reset_task(pool: Arc<AccountPool>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            sweep_once(&pool).await;
        }
    });
}

pub async fn sweep_once(pool: &AccountPool) -> usize {
    let reset = pool
        .reset_due(Utc::now(), chrono::Duration::hours(QUOTA_WINDOW_HOURS))
        .await;
    if reset > 0 {
        tracing::info!("配额重置：{reset} 个账号用量已清零");
        if let Err(e) = pool.save().await {
            tracing::warn!("配额重置后保存账号池失败：{e:#}");
        }
    }
    reset
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::types::NewAccount;

    #[tokio::test]
    async fn sweep_leaves_fresh_accounts_alone() {
        let pool = AccountPool::new(None, 3);
        let a = pool
            .add_account(NewAccount {
                provider_id: "openai".to_string(),
                name: String::new(),
                daily_quota: Some(5),
                enabled: None,
            })
            .await
            .unwrap();
        pool.record_usage(&a.id, 5).await.unwrap();

        assert_eq!(sweep_once(&pool).await, 0);
        assert_eq!(pool.get_account(&a.id).await.unwrap().used, 5);
    }
}
