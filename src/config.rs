use figment::Figment;
use figment::providers::{Env, Format, Toml};
use serde::Deserialize;
use std::path::{Path, PathBuf};

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8045;
const DEFAULT_ADMIN_HOST: &str = "127.0.0.1";
const DEFAULT_ADMIN_PORT: u16 = 8046;
const DEFAULT_TIMEOUT_MS: u64 = 120_000;
const DEFAULT_RETRY_COUNT: u32 = 3;
const DEFAULT_LOG_CAPACITY: usize = 10_000;
const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
const DEFAULT_USER_AGENT: &str = "relaygate/0.1";
const CONFIG_FILE: &str = "relaygate.toml";

/// 启动配置：只在进程启动时读取一次。
///
/// 运行期间可修改的部分由 `runtime_config` 接管；这里的值只作为初始默认值。
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,

    pub admin_host: String,
    pub admin_port: u16,
    pub admin_key: String,

    pub timeout_ms: u64,
    pub retry_count: u32,
    pub load_balance: String,
    pub failure_threshold: u32,
    pub cors_origins: Vec<String>,

    pub log_capacity: usize,
    pub debug: String,
    /// 以 JSON 行输出进程日志（LOG_FORMAT=json）。
    pub log_json: bool,

    pub proxy: String,
    pub user_agent: String,

    pub data_dir: String,
    pub autostart: bool,
}

#[derive(Debug, Default, Deserialize)]
struct RawEnv {
    #[serde(alias = "HOST")]
    host: Option<String>,
    #[serde(alias = "PORT")]
    port: Option<u16>,

    #[serde(alias = "ADMIN_HOST")]
    admin_host: Option<String>,
    #[serde(alias = "ADMIN_PORT")]
    admin_port: Option<u16>,
    #[serde(alias = "ADMIN_KEY")]
    admin_key: Option<String>,

    #[serde(alias = "TIMEOUT")]
    timeout: Option<u64>,
    #[serde(alias = "RETRY_COUNT")]
    retry_count: Option<u32>,
    #[serde(alias = "LOAD_BALANCE")]
    load_balance: Option<String>,
    #[serde(alias = "FAILURE_THRESHOLD")]
    failure_threshold: Option<u32>,
    #[serde(alias = "CORS_ORIGINS")]
    cors_origins: Option<String>,

    #[serde(alias = "LOG_CAPACITY")]
    log_capacity: Option<usize>,
    #[serde(alias = "DEBUG")]
    debug: Option<String>,
    #[serde(alias = "LOG_FORMAT")]
    log_format: Option<String>,

    #[serde(alias = "PROXY")]
    proxy: Option<String>,
    #[serde(alias = "USER_AGENT")]
    user_agent: Option<String>,

    #[serde(alias = "DATA_DIR")]
    data_dir: Option<String>,
    #[serde(alias = "AUTOSTART")]
    autostart: Option<bool>,
}

impl Config {
    pub fn load() -> Self {
        load_dotenv();

        // 优先级：环境变量 > relaygate.toml > 默认值。
        let raw = Figment::from(Toml::file(CONFIG_FILE))
            .merge(Env::raw())
            .extract::<RawEnv>()
            .unwrap_or_default();

        let mut cfg = Self::from_raw(raw);

        // 命令行覆盖：-debug <level>
        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            if arg == "-debug"
                && let Some(v) = args.next()
            {
                cfg.debug = v;
            }
        }

        cfg
    }

    fn from_raw(raw: RawEnv) -> Self {
        Self {
            host: raw.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: raw.port.unwrap_or(DEFAULT_PORT),
            admin_host: raw
                .admin_host
                .unwrap_or_else(|| DEFAULT_ADMIN_HOST.to_string()),
            admin_port: raw.admin_port.unwrap_or(DEFAULT_ADMIN_PORT),
            admin_key: raw.admin_key.unwrap_or_default(),
            timeout_ms: raw.timeout.filter(|v| *v > 0).unwrap_or(DEFAULT_TIMEOUT_MS),
            retry_count: raw
                .retry_count
                .filter(|v| *v > 0)
                .unwrap_or(DEFAULT_RETRY_COUNT),
            load_balance: raw
                .load_balance
                .unwrap_or_else(|| "round-robin".to_string()),
            failure_threshold: raw
                .failure_threshold
                .filter(|v| *v > 0)
                .unwrap_or(DEFAULT_FAILURE_THRESHOLD),
            cors_origins: parse_origins(raw.cors_origins.as_deref()),
            log_capacity: raw
                .log_capacity
                .filter(|v| *v > 0)
                .unwrap_or(DEFAULT_LOG_CAPACITY),
            debug: raw.debug.unwrap_or_else(|| "off".to_string()),
            log_json: raw
                .log_format
                .is_some_and(|f| f.trim().eq_ignore_ascii_case("json")),
            proxy: raw.proxy.unwrap_or_default(),
            user_agent: raw
                .user_agent
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            data_dir: raw.data_dir.unwrap_or_else(|| "./data".to_string()),
            autostart: raw.autostart.unwrap_or(true),
        }
    }

    pub fn log_level(&self) -> crate::logging::LogLevel {
        crate::logging::LogLevel::parse(&self.debug)
    }

    pub fn data_path(&self, file: &str) -> Option<PathBuf> {
        let dir = self.data_dir.trim();
        if dir.is_empty() {
            None
        } else {
            Some(PathBuf::from(dir).join(file))
        }
    }
}

impl Default for Config {
    /// 纯内存配置（不落盘），主要用于测试。
    fn default() -> Self {
        let mut cfg = Self::from_raw(RawEnv::default());
        cfg.data_dir = String::new();
        cfg.autostart = false;
        cfg
    }
}

fn parse_origins(value: Option<&str>) -> Vec<String> {
    let Some(value) = value else {
        return Vec::new();
    };
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn load_dotenv() {
    let Some(dotenv_path) = find_dotenv_path() else {
        return;
    };
    let Ok(content) = std::fs::read_to_string(&dotenv_path) else {
        return;
    };

    for line in content.lines() {
        let Some((key, value)) = parse_dotenv_line(line) else {
            continue;
        };
        // 已显式设置的环境变量优先于 .env。
        if std::env::var_os(&key).is_some() {
            continue;
        }
        // Rust 2024：set_var 为 unsafe。这里只在启动阶段、未并发访问环境变量时调用。
        unsafe {
            std::env::set_var(key, value);
        }
    }
}

fn find_dotenv_path() -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok()?;
    let mut dir: &Path = cwd.as_path();

    loop {
        let candidate = dir.join(".env");
        if candidate.is_file() {
            return Some(candidate);
        }
        // 不越过项目根目录。
        if dir.join("Cargo.toml").is_file() || dir.join(".git").is_dir() {
            return None;
        }
        dir = dir.parent()?;
    }
}

fn parse_dotenv_line(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let line = line.strip_prefix("export ").map(str::trim_start).unwrap_or(line);

    let (key, raw) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }

    let raw = raw.trim();
    for quote in ['"', '\''] {
        if raw.len() >= 2 && raw.starts_with(quote) && raw.ends_with(quote) {
            return Some((key.to_string(), raw[1..raw.len() - 1].to_string()));
        }
    }

    // 行内注释：仅识别前面带空白的 #。
    let value = match raw.find(" #").or_else(|| raw.find("\t#")) {
        Some(idx) => raw[..idx].trim_end(),
        None => raw,
    };
    Some((key.to_string(), value.to_string()))
}
