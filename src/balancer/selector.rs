//! 各策略的选择函数。候选集合由调用方给出（已按 seq 稳定排序），
//! 需要跨调用保存的状态（游标、平滑权重累加器）由调用方持有并传入。

use crate::pool::types::Account;
use std::cell::Cell;
use std::cmp::Ordering;
use std::collections::HashMap;

thread_local! {
    static RNG_STATE: Cell<u64> = Cell::new(seed());
}

fn seed() -> u64 {
    let u = uuid::Uuid::new_v4().as_u128();
    let s = (u as u64) ^ ((u >> 64) as u64);
    if s == 0 { 0x9E37_79B9_7F4A_7C15 } else { s }
}

fn next_u64() -> u64 {
    RNG_STATE.with(|state| {
        // xorshift64*
        let mut x = state.get();
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        state.set(x);
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    })
}

pub fn random_index(upper: usize) -> usize {
    if upper <= 1 {
        return 0;
    }
    (next_u64() % upper as u64) as usize
}

/// 轮询：取 seq 严格大于游标的第一个候选，否则回绕到第一个。
///
/// 游标记录的是上次选中账号的 seq，而不是下标；候选集合变化（账号失效/新增）
/// 不会让其他账号的轮转位置跳变。
pub fn round_robin(candidates: &[Account], cursor: Option<u64>) -> Option<usize> {
    if candidates.is_empty() {
        return None;
    }
    let Some(cursor) = cursor else {
        return Some(0);
    };
    Some(
        candidates
            .iter()
            .position(|a| a.seq > cursor)
            .unwrap_or(0),
    )
}

/// 平滑加权轮询（nginx 风格）：每轮给所有候选加上自身权重，选出当前值最大者，再减去总权重。
/// N 次调用内各账号被选中的次数严格按权重比例分配。
pub fn smooth_weighted(
    candidates: &[Account],
    weights: &HashMap<String, u32>,
    current: &mut HashMap<String, i64>,
) -> Option<usize> {
    if candidates.is_empty() {
        return None;
    }
    let mut total: i64 = 0;
    let mut best: Option<(usize, i64)> = None;
    for (i, a) in candidates.iter().enumerate() {
        let w = i64::from(weights.get(&a.id).copied().unwrap_or(1).max(1));
        total += w;
        let cur = current.entry(a.id.clone()).or_insert(0);
        *cur += w;
        if best.is_none_or(|(_, b)| *cur > b) {
            best = Some((i, *cur));
        }
    }
    let (idx, _) = best?;
    if let Some(cur) = current.get_mut(&candidates[idx].id) {
        *cur -= total;
    }
    Some(idx)
}

/// 最少使用：used/daily_quota 最小者；并列时按轮询顺序（游标之后的第一个）打破平局。
pub fn least_used(candidates: &[Account], cursor: Option<u64>) -> Option<usize> {
    if candidates.is_empty() {
        return None;
    }
    let mut tied: Vec<usize> = vec![0];
    for i in 1..candidates.len() {
        match compare_ratio(&candidates[i], &candidates[tied[0]]) {
            Ordering::Less => {
                tied.clear();
                tied.push(i);
            }
            Ordering::Equal => tied.push(i),
            Ordering::Greater => {}
        }
    }
    if tied.len() == 1 {
        return Some(tied[0]);
    }
    let Some(cursor) = cursor else {
        return Some(tied[0]);
    };
    Some(
        tied.iter()
            .copied()
            .find(|&i| candidates[i].seq > cursor)
            .unwrap_or(tied[0]),
    )
}

pub fn random(candidates: &[Account]) -> Option<usize> {
    if candidates.is_empty() {
        return None;
    }
    Some(random_index(candidates.len()))
}

// used_a/quota_a 与 used_b/quota_b 交叉相乘比较，避免浮点误差。
fn compare_ratio(a: &Account, b: &Account) -> Ordering {
    let lhs = u128::from(a.used) * u128::from(b.daily_quota.max(1));
    let rhs = u128::from(b.used) * u128::from(a.daily_quota.max(1));
    lhs.cmp(&rhs)
}
