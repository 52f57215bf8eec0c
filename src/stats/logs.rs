use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// 一条代理决策或错误记录，写入后不再修改。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub level: Level,
    pub message: String,
    /// 机器可读的事件名，例如 `attempt_failed`、`refresh_failed`。
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// 追加日志时的草稿；id 与时间戳由聚合器分配。
#[derive(Debug, Clone, Default)]
pub struct NewLog {
    pub level: Option<Level>,
    pub message: String,
    pub event: Option<String>,
    pub model: Option<String>,
    pub account_id: Option<String>,
    pub provider_id: Option<String>,
    pub request_id: Option<String>,
}

impl NewLog {
    pub fn new(level: Level, message: impl Into<String>) -> Self {
        Self {
            level: Some(level),
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn event(mut self, event: &str) -> Self {
        self.event = Some(event.to_string());
        self
    }

    pub fn model(mut self, model: &str) -> Self {
        self.model = Some(model.to_string());
        self
    }

    pub fn account(mut self, account_id: &str) -> Self {
        self.account_id = Some(account_id.to_string());
        self
    }

    pub fn provider(mut self, provider_id: &str) -> Self {
        self.provider_id = Some(provider_id.to_string());
        self
    }

    pub fn request(mut self, request_id: &str) -> Self {
        self.request_id = Some(request_id.to_string());
        self
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogFilter {
    pub level: Option<Level>,
    pub keyword: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl LogFilter {
    fn matches(&self, e: &LogEntry, keyword: Option<&str>) -> bool {
        if self.level.is_some_and(|l| l != e.level) {
            return false;
        }
        if self.from.is_some_and(|from| e.timestamp < from) {
            return false;
        }
        if self.to.is_some_and(|to| e.timestamp > to) {
            return false;
        }
        let Some(keyword) = keyword else {
            return true;
        };
        [
            Some(e.message.as_str()),
            e.event.as_deref(),
            e.model.as_deref(),
            e.account_id.as_deref(),
            e.provider_id.as_deref(),
            e.request_id.as_deref(),
        ]
        .into_iter()
        .flatten()
        .any(|field| field.to_lowercase().contains(keyword))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LogStats {
    pub total: usize,
    pub debug: usize,
    pub info: usize,
    pub warn: usize,
    pub error: usize,
}

/// 有界日志缓冲：最新在前，超过容量时淘汰最旧的条目。
#[derive(Debug)]
pub struct LogBuffer {
    entries: VecDeque<LogEntry>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    pub fn push(&mut self, entry: LogEntry) {
        self.entries.push_front(entry);
        self.entries.truncate(self.capacity);
    }

    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        self.entries.truncate(self.capacity);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// 按过滤条件返回匹配的条目（最新在前）；不修改缓冲。
    pub fn query(&self, filter: &LogFilter) -> Vec<LogEntry> {
        let keyword = filter
            .keyword
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_lowercase);
        let limit = filter.limit.unwrap_or(usize::MAX);
        self.entries
            .iter()
            .filter(|e| filter.matches(e, keyword.as_deref()))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> LogStats {
        let mut s = LogStats {
            total: self.entries.len(),
            ..LogStats::default()
        };
        for e in &self.entries {
            match e.level {
                Level::Debug => s.debug += 1,
                Level::Info => s.info += 1,
                Level::Warn => s.warn += 1,
                Level::Error => s.error += 1,
            }
        }
        s
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Json,
    Csv,
}

impl ExportFormat {
    pub fn content_type(self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Csv => "text/csv; charset=utf-8",
        }
    }
}

pub fn export(entries: &[LogEntry], format: ExportFormat) -> anyhow::Result<String> {
    match format {
        ExportFormat::Json => Ok(sonic_rs::to_string(entries)?),
        ExportFormat::Csv => Ok(to_csv(entries)),
    }
}

fn to_csv(entries: &[LogEntry]) -> String {
    let mut out = String::from("timestamp,level,message,account,provider,request_id\r\n");
    for e in entries {
        let row = [
            e.timestamp.to_rfc3339(),
            e.level.as_str().to_string(),
            e.message.clone(),
            e.account_id.clone().unwrap_or_default(),
            e.provider_id.clone().unwrap_or_default(),
            e.request_id.clone().unwrap_or_default(),
        ];
        let cells: Vec<String> = row.iter().map(|c| csv_field(c)).collect();
        out.push_str(&cells.join(","));
        out.push_str("\r\n");
    }
    out
}

fn csv_field(s: &str) -> String {
    if s.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}
