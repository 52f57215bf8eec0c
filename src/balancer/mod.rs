//! 负载均衡：在可用账号中按全局策略选出一个。
//!
//! 选择本身是纯函数（见 `selector`），这里只持有跨调用的状态：每个作用域（通常是 provider）
//! 一个轮询游标与一组平滑权重累加器。状态只在选择的瞬间加锁，不跨网络请求持有。

pub mod selector;
pub mod strategy;

pub use strategy::Strategy;

use crate::error::GatewayError;
use crate::pool::types::Account;
use std::collections::HashMap;
use tokio::sync::Mutex;

#[derive(Debug, Default)]
pub struct LoadBalancer {
    state: Mutex<HashMap<String, ScopeState>>,
}

#[derive(Debug, Default)]
struct ScopeState {
    cursor: Option<u64>,
    weighted: HashMap<String, i64>,
}

impl LoadBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn select(
        &self,
        eligible: &[Account],
        strategy: Strategy,
        weights: &HashMap<String, u32>,
        scope: &str,
    ) -> Result<Account, GatewayError> {
        if eligible.is_empty() {
            return Err(GatewayError::NoEligibleAccount(scope.to_string()));
        }

        let mut candidates = eligible.to_vec();
        candidates.sort_by_key(|a| a.seq);

        let mut state = self.state.lock().await;
        let st = state.entry(scope.to_string()).or_default();

        let idx = match strategy {
            Strategy::RoundRobin => selector::round_robin(&candidates, st.cursor),
            Strategy::Weighted => selector::smooth_weighted(&candidates, weights, &mut st.weighted),
            Strategy::LeastUsed => selector::least_used(&candidates, st.cursor),
            Strategy::Random => selector::random(&candidates),
        }
        .ok_or_else(|| GatewayError::NoEligibleAccount(scope.to_string()))?;

        let chosen = candidates.swap_remove(idx);
        st.cursor = Some(chosen.seq);
        Ok(chosen)
    }

    /// 清理已删除账号残留的权重累加器。
    pub async fn forget_account(&self, account_id: &str) {
        let mut state = self.state.lock().await;
        for st in state.values_mut() {
            st.weighted.remove(account_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::types::AccountStatus;
    use chrono::Utc;

    fn accounts(n: u64) -> Vec<Account> {
        let now = Utc::now();
        (1..=n)
            .map(|seq| Account {
                id: format!("acc-{seq}"),
                provider_id: "p".to_string(),
                name: format!("acc-{seq}"),
                status: AccountStatus::Online,
                enabled: true,
                daily_quota: 100,
                used: 0,
                last_reset: now,
                balance: None,
                consecutive_failures: 0,
                created_at: now,
                seq,
            })
            .collect()
    }

    #[tokio::test]
    async fn round_robin_is_fair_without_churn() {
        let lb = LoadBalancer::new();
        let eligible = accounts(4);
        let mut counts = HashMap::<String, u32>::new();
        for _ in 0..4 * 25 {
            let a = lb
                .select(&eligible, Strategy::RoundRobin, &HashMap::new(), "p")
                .await
                .unwrap();
            *counts.entry(a.id).or_default() += 1;
        }
        assert_eq!(counts.len(), 4);
        assert!(counts.values().all(|&c| c == 25));
    }

    #[tokio::test]
    async fn weighted_converges_to_configured_ratio() {
        let lb = LoadBalancer::new();
        let eligible = accounts(3);
        let weights = HashMap::from([
            ("acc-1".to_string(), 1),
            ("acc-2".to_string(), 2),
            ("acc-3".to_string(), 7),
        ]);
        let mut counts = HashMap::<String, u32>::new();
        for _ in 0..10_000 {
            let a = lb
                .select(&eligible, Strategy::Weighted, &weights, "p")
                .await
                .unwrap();
            *counts.entry(a.id).or_default() += 1;
        }
        for (id, w) in &weights {
            let expected = 10_000.0 * f64::from(*w) / 10.0;
            let got = f64::from(counts[id]);
            assert!((got - expected).abs() / expected < 0.02, "{id}: {got} vs {expected}");
        }
    }

    #[tokio::test]
    async fn random_covers_every_account() {
        let lb = LoadBalancer::new();
        let eligible = accounts(3);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..500 {
            let a = lb
                .select(&eligible, Strategy::Random, &HashMap::new(), "p")
                .await
                .unwrap();
            seen.insert(a.id);
        }
        assert_eq!(seen.len(), 3);
    }

    #[tokio::test]
    async fn empty_set_is_no_eligible_account() {
        let lb = LoadBalancer::new();
        let err = lb
            .select(&[], Strategy::LeastUsed, &HashMap::new(), "p")
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NoEligibleAccount(_)));
    }

    #[tokio::test]
    async fn scopes_keep_independent_cursors() {
        let lb = LoadBalancer::new();
        let eligible = accounts(2);
        let none = HashMap::new();
        let a = lb.select(&eligible, Strategy::RoundRobin, &none, "x").await.unwrap();
        let b = lb.select(&eligible, Strategy::RoundRobin, &none, "y").await.unwrap();
        assert_eq!(a.id, b.id);
    }
}
