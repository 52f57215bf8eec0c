use axum::http::HeaderMap;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// 详细日志等级：
/// - off：不输出请求/响应明细
/// - low：输出客户端请求摘要与终态
/// - medium：额外输出上游请求/响应（请求头脱敏、大包截断）
/// - high：上游请求/响应完全原始输出
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Low = 1,
    Medium = 2,
    High = 3,
}

impl LogLevel {
    pub fn parse(debug: &str) -> Self {
        match debug.trim().to_lowercase().as_str() {
            "low" | "client" => Self::Low,
            "medium" | "backend" => Self::Medium,
            "high" | "all" | "raw" => Self::High,
            _ => Self::Off,
        }
    }

    pub fn client_enabled(self) -> bool {
        self >= Self::Low
    }

    pub fn backend_enabled(self) -> bool {
        self >= Self::Medium
    }

    pub fn raw_enabled(self) -> bool {
        self >= Self::High
    }
}

/// 初始化 tracing。依赖库默认 warn，本项目自身至少 info（DEBUG=off 时完全关闭明细但保留 info）。
pub fn init_tracing(level: LogLevel, json: bool) {
    let env = std::env::var("RUST_LOG").unwrap_or_default();
    let env = env.trim();
    let own = if level.client_enabled() {
        "relaygate=debug"
    } else {
        "relaygate=info"
    };
    let filter = if env.is_empty() {
        EnvFilter::new(format!("warn,{own}"))
    } else if env.contains("relaygate") {
        EnvFilter::new(env)
    } else {
        EnvFilter::new(format!("{env},{own}"))
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

pub fn format_duration_ms(d: Duration) -> i64 {
    d.as_millis().min(i64::MAX as u128) as i64
}

pub fn client_request(request_id: &str, model: &str, stream: bool, body_len: usize) {
    tracing::info!(
        request_id,
        model,
        stream,
        body_len,
        "[客户端请求] POST /v1/chat/completions"
    );
}

pub fn client_response(request_id: &str, status: u16, duration: Duration) {
    tracing::info!(
        request_id,
        status,
        duration_ms = format_duration_ms(duration),
        "[客户端响应]"
    );
}

pub fn backend_request(level: LogLevel, url: &str, headers: &HeaderMap, body: &[u8]) {
    if level.raw_enabled() {
        tracing::info!(
            "\n=================== 上游请求（RAW） ===================\n[上游请求] POST {url}\n{}\n{}\n=========================================================",
            format_headers(headers, false),
            String::from_utf8_lossy(body),
        );
    } else {
        tracing::info!(
            "\n====================== 上游请求 ========================\n[上游请求] POST {url}\n{}\n{}\n==========================================================",
            format_headers(headers, true),
            truncate_text_for_log(&String::from_utf8_lossy(body)),
        );
    }
}

pub fn backend_response(level: LogLevel, status: u16, duration: Duration, body: &[u8]) {
    let body = if level.raw_enabled() {
        String::from_utf8_lossy(body).to_string()
    } else {
        truncate_text_for_log(&String::from_utf8_lossy(body))
    };
    tracing::info!(
        "\n====================== 上游响应 ========================\n[上游响应] {} {}ms\n{}\n==========================================================",
        status,
        format_duration_ms(duration),
        body
    );
}

fn format_headers(headers: &HeaderMap, redact: bool) -> String {
    let mut out = String::new();
    for (name, value) in headers.iter() {
        let key = name.as_str();
        let sensitive = key.eq_ignore_ascii_case("authorization")
            || key.eq_ignore_ascii_case("proxy-authorization")
            || key.eq_ignore_ascii_case("x-api-key");
        out.push_str(key);
        out.push_str(": ");
        if redact && sensitive {
            out.push_str("Bearer ***");
        } else {
            out.push_str(value.to_str().unwrap_or("<non-utf8>"));
        }
        out.push('\n');
    }
    out
}

pub fn truncate_text_for_log(s: &str) -> String {
    const MAX_CHARS: usize = 32 * 1024;
    if s.chars().count() <= MAX_CHARS {
        return s.to_string();
    }
    let mut out: String = s.chars().take(MAX_CHARS).collect();
    out.push_str("...[TRUNCATED]");
    out
}
