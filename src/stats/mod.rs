//! 统计与日志聚合：终态计数、滑动速率、有界日志缓冲与推送。
//!
//! 计数与日志各自一把锁，只在记账瞬间持有；推送走 broadcast，慢订阅者会丢消息但不会阻塞写入。

pub mod counters;
pub mod logs;

pub use counters::{Outcome, ProxyStatistics, TrendPoint};
pub use logs::{ExportFormat, Level, LogEntry, LogFilter, LogStats, NewLog};

use chrono::Utc;
use counters::Counters;
use logs::LogBuffer;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{RwLock, broadcast};

const LOG_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug)]
pub struct Aggregator {
    counters: RwLock<Counters>,
    logs: RwLock<LogBuffer>,
    next_id: AtomicU64,
    log_tx: broadcast::Sender<LogEntry>,
}

impl Aggregator {
    pub fn new(log_capacity: usize) -> Self {
        let (log_tx, _) = broadcast::channel(LOG_CHANNEL_CAPACITY);
        Self {
            counters: RwLock::new(Counters::default()),
            logs: RwLock::new(LogBuffer::new(log_capacity)),
            next_id: AtomicU64::new(1),
            log_tx,
        }
    }

    pub async fn record(&self, outcome: &Outcome) {
        self.counters.write().await.record(outcome);
    }

    pub async fn statistics(&self) -> ProxyStatistics {
        self.counters.read().await.snapshot(Utc::now())
    }

    pub async fn clear_statistics(&self) {
        *self.counters.write().await = Counters::default();
    }

    pub async fn trend(&self, days: u32) -> Vec<TrendPoint> {
        self.counters
            .read()
            .await
            .trend(days, Utc::now().date_naive())
    }

    pub async fn append(&self, log: NewLog) -> LogEntry {
        // 编号、时间戳与入队在同一把锁下完成，缓冲区内的顺序与编号一致。
        let mut logs = self.logs.write().await;
        let entry = LogEntry {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            timestamp: Utc::now(),
            level: log.level.unwrap_or(Level::Info),
            message: log.message,
            event: log.event,
            model: log.model,
            account_id: log.account_id,
            provider_id: log.provider_id,
            request_id: log.request_id,
        };
        logs.push(entry.clone());
        let _ = self.log_tx.send(entry.clone());
        entry
    }

    pub async fn query(&self, filter: &LogFilter) -> Vec<LogEntry> {
        self.logs.read().await.query(filter)
    }

    pub async fn log_stats(&self) -> LogStats {
        self.logs.read().await.stats()
    }

    pub async fn clear_logs(&self) {
        self.logs.write().await.clear();
    }

    pub async fn set_log_capacity(&self, capacity: usize) {
        self.logs.write().await.set_capacity(capacity);
    }

    pub async fn export(&self, format: ExportFormat) -> anyhow::Result<String> {
        let entries = self.query(&LogFilter::default()).await;
        logs::export(&entries, format)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.log_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn appended_entries_are_pushed_to_subscribers() {
        let agg = Aggregator::new(3);
        let mut rx = agg.subscribe();

        let e = agg
            .append(NewLog::new(Level::Error, "refresh failed").event("refresh_failed"))
            .await;
        let pushed = rx.recv().await.unwrap();
        assert_eq!(pushed, e);

        for i in 0..5 {
            agg.append(NewLog::new(Level::Info, format!("n{i}"))).await;
        }
        let all = agg.query(&LogFilter::default()).await;
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].message, "n4");
        assert_eq!(agg.log_stats().await.total, 3);

        agg.clear_logs().await;
        assert_eq!(agg.log_stats().await.total, 0);
    }

    #[tokio::test]
    async fn append_without_subscribers_never_fails() {
        let agg = Aggregator::new(10);
        agg.append(NewLog::new(Level::Debug, "nobody listening")).await;
        assert_eq!(agg.log_stats().await.debug, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_appends_keep_ids_in_buffer_order() {
        let agg = std::sync::Arc::new(Aggregator::new(256));
        let mut handles = Vec::new();
        for t in 0..8 {
            let agg = agg.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..16 {
                    agg.append(NewLog::new(Level::Info, format!("t{t}-{i}"))).await;
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let all = agg.query(&LogFilter::default()).await;
        assert_eq!(all.len(), 128);
        for pair in all.windows(2) {
            assert!(pair[0].id > pair[1].id, "{} !> {}", pair[0].id, pair[1].id);
            assert!(pair[0].timestamp >= pair[1].timestamp);
        }
    }

    #[tokio::test]
    async fn fresh_aggregator_reports_empty_statistics() {
        let agg = Aggregator::new(10);
        let stats = agg.statistics().await;
        assert_eq!(stats, ProxyStatistics::default());

        agg.record(&Outcome {
            model: "m".to_string(),
            provider_id: None,
            account_id: None,
            success: true,
            latency: Duration::from_millis(5),
            timestamp: Utc::now(),
        })
        .await;
        let stats = agg.statistics().await;
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.requests_per_minute, 1);
    }

    #[tokio::test]
    async fn statistics_reset_only_on_clear() {
        let agg = Aggregator::new(10);
        agg.record(&Outcome {
            model: "m".to_string(),
            provider_id: None,
            account_id: None,
            success: false,
            latency: Duration::from_millis(5),
            timestamp: Utc::now(),
        })
        .await;
        agg.clear_logs().await;
        assert_eq!(agg.statistics().await.failed_requests, 1);
        agg.clear_statistics().await;
        assert_eq!(agg.statistics().await.total_requests, 0);
    }
}
