use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

const RATE_BUCKETS: usize = 60;
/// 按天统计最多保留的天数。
const DAILY_RETENTION_DAYS: u64 = 366;

/// 一次请求的终态（每个入站请求只记录一次）。
#[derive(Debug, Clone)]
pub struct Outcome {
    pub model: String,
    pub provider_id: Option<String>,
    pub account_id: Option<String>,
    pub success: bool,
    pub latency: Duration,
    pub timestamp: DateTime<Utc>,
}

/// 60 个 1 秒桶组成的滑动窗口；每个桶记住自己所属的秒，过期桶在写入或读取时视为 0。
#[derive(Debug, Clone)]
pub struct RateWindow {
    buckets: [(i64, u64); RATE_BUCKETS],
}

impl Default for RateWindow {
    fn default() -> Self {
        Self {
            buckets: [(i64::MIN, 0); RATE_BUCKETS],
        }
    }
}

impl RateWindow {
    pub fn record(&mut self, now_sec: i64) {
        let idx = now_sec.rem_euclid(RATE_BUCKETS as i64) as usize;
        let bucket = &mut self.buckets[idx];
        if bucket.0 != now_sec {
            *bucket = (now_sec, 0);
        }
        bucket.1 += 1;
    }

    /// 最近 60 秒内的请求数。
    pub fn per_minute(&self, now_sec: i64) -> u64 {
        self.buckets
            .iter()
            .filter(|(sec, _)| {
                now_sec
                    .checked_sub(*sec)
                    .is_some_and(|age| (0..RATE_BUCKETS as i64).contains(&age))
            })
            .map(|(_, n)| *n)
            .sum()
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProxyStatistics {
    pub total_requests: u64,
    pub success_requests: u64,
    pub failed_requests: u64,
    pub total_latency_ms: u64,
    pub latency_count: u64,
    pub average_latency_ms: f64,
    pub requests_per_minute: u64,
    pub model_usage: BTreeMap<String, u64>,
    pub provider_usage: BTreeMap<String, u64>,
    pub account_usage: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct DayCount {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TrendPoint {
    pub date: NaiveDate,
    #[serde(flatten)]
    pub counts: DayCount,
}

#[derive(Debug, Default)]
pub struct Counters {
    total: u64,
    success: u64,
    failed: u64,
    latency_sum_ms: u64,
    latency_count: u64,
    rate: RateWindow,
    models: HashMap<String, u64>,
    providers: HashMap<String, u64>,
    accounts: HashMap<String, u64>,
    daily: BTreeMap<NaiveDate, DayCount>,
}

impl Counters {
    pub fn record(&mut self, o: &Outcome) {
        self.total += 1;
        if o.success {
            self.success += 1;
        } else {
            self.failed += 1;
        }
        let ms = u64::try_from(o.latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_sum_ms = self.latency_sum_ms.saturating_add(ms);
        self.latency_count += 1;
        self.rate.record(o.timestamp.timestamp());

        *self.models.entry(o.model.clone()).or_default() += 1;
        if let Some(p) = &o.provider_id {
            *self.providers.entry(p.clone()).or_default() += 1;
        }
        if let Some(a) = &o.account_id {
            *self.accounts.entry(a.clone()).or_default() += 1;
        }

        let day = o.timestamp.date_naive();
        let c = self.daily.entry(day).or_default();
        c.total += 1;
        if o.success {
            c.success += 1;
        } else {
            c.failed += 1;
        }
        if let Some(cutoff) = day.checked_sub_days(Days::new(DAILY_RETENTION_DAYS)) {
            self.daily = self.daily.split_off(&cutoff);
        }
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> ProxyStatistics {
        let average_latency_ms = if self.latency_count == 0 {
            0.0
        } else {
            self.latency_sum_ms as f64 / self.latency_count as f64
        };
        ProxyStatistics {
            total_requests: self.total,
            success_requests: self.success,
            failed_requests: self.failed,
            total_latency_ms: self.latency_sum_ms,
            latency_count: self.latency_count,
            average_latency_ms,
            requests_per_minute: self.rate.per_minute(now.timestamp()),
            model_usage: self.models.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            provider_usage: self.providers.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            account_usage: self.accounts.iter().map(|(k, v)| (k.clone(), *v)).collect(),
        }
    }

    /// 最近 `days` 天（含今天）的按日计数，旧日期在前，无数据的日期补 0。
    pub fn trend(&self, days: u32, today: NaiveDate) -> Vec<TrendPoint> {
        let days = days.max(1);
        (0..days)
            .rev()
            .filter_map(|back| today.checked_sub_days(Days::new(u64::from(back))))
            .map(|date| TrendPoint {
                date,
                counts: self.daily.get(&date).copied().unwrap_or_default(),
            })
            .collect()
    }
}
