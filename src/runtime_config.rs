//! 运行时配置。
//!
//! 分成两部分：
//! - `LiveSettings`：策略、权重、模型映射、超时、重试次数、CORS 等，每个请求读取最新快照，修改立即生效；
//! - `BindingSettings`：监听地址与端口，只在代理 stop/start 时生效。
//!
//! 快照放在 ArcSwap 中无锁读取；更新先完整校验补丁，再整体替换，不会出现部分生效。

use crate::balancer::Strategy;
use crate::config::Config;
use crate::error::GatewayError;
use crate::gateway::mapping::{self, ModelMapping};
use anyhow::{Context, anyhow};
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindingSettings {
    pub host: String,
    pub port: u16,
}

impl BindingSettings {
    /// 解析为监听地址；host 必须是 IP 字面量（IPv6 可带方括号）。
    pub fn socket_addr(&self) -> Result<SocketAddr, GatewayError> {
        let host = self.host.trim();
        let literal = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        let ip: IpAddr = literal
            .parse()
            .map_err(|e| GatewayError::config(format!("监听地址 {host} 无效: {e}")))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveSettings {
    pub strategy: Strategy,
    /// 账号权重（weighted 策略使用），缺省为 1。
    #[serde(default)]
    pub weights: BTreeMap<String, u32>,
    #[serde(default)]
    pub mappings: Vec<ModelMapping>,
    pub timeout_ms: u64,
    pub retry_count: u32,
    #[serde(default)]
    pub cors_origins: Vec<String>,
    pub failure_threshold: u32,
    pub log_capacity: usize,
}

impl LiveSettings {
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.timeout_ms)
    }

    pub fn weight_map(&self) -> std::collections::HashMap<String, u32> {
        self.weights.iter().map(|(k, v)| (k.clone(), *v)).collect()
    }
}

/// `config.update` 的部分补丁；未给出的字段保持不变。
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SettingsPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub strategy: Option<String>,
    pub weights: Option<BTreeMap<String, u32>>,
    /// 整体替换映射表。
    pub mappings: Option<Vec<ModelMapping>>,
    /// 逐条新增或覆盖。
    pub upsert_mappings: Option<Vec<ModelMapping>>,
    pub remove_mappings: Option<Vec<String>>,
    pub timeout_ms: Option<u64>,
    pub retry_count: Option<u32>,
    pub cors_origins: Option<Vec<String>>,
    pub failure_threshold: Option<u32>,
    pub log_capacity: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigView {
    pub binding: BindingSettings,
    pub live: LiveSettings,
    /// 监听地址已修改，需要 stop/start 代理后才生效。
    pub restart_required: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedSettings {
    binding: BindingSettings,
    live: LiveSettings,
}

#[derive(Debug)]
pub struct RuntimeConfig {
    live: ArcSwap<LiveSettings>,
    binding: ArcSwap<BindingSettings>,
    file_path: Option<PathBuf>,
    write_lock: Mutex<()>,
}

impl RuntimeConfig {
    pub fn from_config(cfg: &Config) -> Self {
        let strategy = cfg.load_balance.parse().unwrap_or_else(|e| {
            tracing::warn!("{e}，使用默认策略 round-robin");
            Strategy::default()
        });
        let live = LiveSettings {
            strategy,
            weights: BTreeMap::new(),
            mappings: Vec::new(),
            timeout_ms: cfg.timeout_ms,
            retry_count: cfg.retry_count.max(1),
            cors_origins: cfg.cors_origins.clone(),
            failure_threshold: cfg.failure_threshold.max(1),
            log_capacity: cfg.log_capacity.max(1),
        };
        let binding = BindingSettings {
            host: cfg.host.clone(),
            port: cfg.port,
        };
        Self {
            live: ArcSwap::from_pointee(live),
            binding: ArcSwap::from_pointee(binding),
            file_path: cfg.data_path("settings.json"),
            write_lock: Mutex::new(()),
        }
    }

    pub fn live(&self) -> Arc<LiveSettings> {
        self.live.load_full()
    }

    pub fn binding(&self) -> Arc<BindingSettings> {
        self.binding.load_full()
    }

    pub fn view(&self, running: Option<&BindingSettings>) -> ConfigView {
        let binding = self.binding();
        ConfigView {
            restart_required: running.is_some_and(|r| *r != *binding),
            binding: (*binding).clone(),
            live: (*self.live()).clone(),
        }
    }

    /// 读取 settings.json（覆盖环境变量给出的默认值）；文件不存在时保持不变。
    pub async fn load(&self) -> anyhow::Result<()> {
        let Some(path) = &self.file_path else {
            return Ok(());
        };
        let data = match tokio::fs::read(path).await {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e).context("读取 settings.json 失败"),
        };
        let persisted: PersistedSettings = sonic_rs::from_slice(&data)
            .map_err(|e| anyhow!(e))
            .context("解析 settings.json 失败")?;
        let mut live = persisted.live;
        live.mappings = mapping::normalize(live.mappings);
        self.live.store(Arc::new(live));
        self.binding.store(Arc::new(persisted.binding));
        Ok(())
    }

    async fn save(&self) -> anyhow::Result<()> {
        let Some(path) = &self.file_path else {
            return Ok(());
        };
        let persisted = PersistedSettings {
            binding: (*self.binding()).clone(),
            live: (*self.live()).clone(),
        };
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .context("创建数据目录失败")?;
        }
        let data = sonic_rs::to_vec_pretty(&persisted).context("序列化 settings.json 失败")?;
        tokio::fs::write(path, data)
            .await
            .context("写入 settings.json 失败")
    }

    /// 校验并应用补丁。任何一项不合法都整体拒绝，不做部分修改。
    pub async fn update(
        &self,
        patch: SettingsPatch,
        known_providers: &HashSet<String>,
    ) -> Result<(Arc<LiveSettings>, Arc<BindingSettings>), GatewayError> {
        let _guard = self.write_lock.lock().await;
        let (live, binding) = apply_patch(&self.live(), &self.binding(), patch, known_providers)?;

        self.live.store(Arc::new(live));
        self.binding.store(Arc::new(binding));
        if let Err(e) = self.save().await {
            tracing::warn!("保存 settings.json 失败：{e:#}");
        }
        Ok((self.live(), self.binding()))
    }
}

fn apply_patch(
    live: &LiveSettings,
    binding: &BindingSettings,
    patch: SettingsPatch,
    known_providers: &HashSet<String>,
) -> Result<(LiveSettings, BindingSettings), GatewayError> {
    let mut live = live.clone();
    let mut binding = binding.clone();

    if let Some(host) = patch.host {
        let host = host.trim();
        if host.is_empty() {
            return Err(GatewayError::config("host 不能为空"));
        }
        binding.host = host.to_string();
    }
    if let Some(port) = patch.port {
        if port == 0 {
            return Err(GatewayError::config("端口必须在 1-65535 之间"));
        }
        binding.port = port;
    }
    // 与启动监听时使用同一套解析，保存下来的地址一定能启动。
    binding.socket_addr()?;

    if let Some(s) = patch.strategy {
        live.strategy = s.parse().map_err(GatewayError::Config)?;
    }
    if let Some(weights) = patch.weights {
        if let Some((id, _)) = weights.iter().find(|(_, w)| **w == 0) {
            return Err(GatewayError::config(format!("账号 {id} 的权重必须 ≥ 1")));
        }
        live.weights = weights;
    }
    if let Some(ms) = patch.timeout_ms {
        if ms == 0 {
            return Err(GatewayError::config("timeout 必须大于 0"));
        }
        live.timeout_ms = ms;
    }
    if let Some(n) = patch.retry_count {
        if n == 0 {
            return Err(GatewayError::config("retryCount 必须 ≥ 1"));
        }
        live.retry_count = n;
    }
    if let Some(n) = patch.failure_threshold {
        if n == 0 {
            return Err(GatewayError::config("failureThreshold 必须 ≥ 1"));
        }
        live.failure_threshold = n;
    }
    if let Some(n) = patch.log_capacity {
        if n == 0 {
            return Err(GatewayError::config("logCapacity 必须 ≥ 1"));
        }
        live.log_capacity = n;
    }
    if let Some(origins) = patch.cors_origins {
        let origins: Vec<String> = origins
            .into_iter()
            .map(|o| o.trim().to_string())
            .filter(|o| !o.is_empty())
            .collect();
        for o in &origins {
            if o != "*" && !(o.starts_with("http://") || o.starts_with("https://")) {
                return Err(GatewayError::config(format!("CORS origin 无效: {o}")));
            }
        }
        live.cors_origins = origins;
    }

    if let Some(all) = patch.mappings {
        validate_mappings(&all, known_providers)?;
        live.mappings = mapping::normalize(all);
    }
    if let Some(upserts) = patch.upsert_mappings {
        validate_mappings(&upserts, known_providers)?;
        let merged = live.mappings.iter().cloned().chain(upserts);
        live.mappings = mapping::normalize(merged);
    }
    if let Some(keys) = patch.remove_mappings {
        let keys: HashSet<String> = keys.iter().map(|k| k.trim().to_string()).collect();
        live.mappings.retain(|m| !keys.contains(&m.request_model));
    }

    Ok((live, binding))
}

fn validate_mappings(
    mappings: &[ModelMapping],
    known_providers: &HashSet<String>,
) -> Result<(), GatewayError> {
    for m in mappings {
        if m.request_model.trim().is_empty() || m.upstream_model.trim().is_empty() {
            return Err(GatewayError::config("模型映射的 requestModel/upstreamModel 不能为空"));
        }
        if !known_providers.contains(m.provider_id.trim()) {
            return Err(GatewayError::config(format!(
                "模型映射 {} 引用了未知 provider: {}",
                m.request_model.trim(),
                m.provider_id.trim()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn providers() -> HashSet<String> {
        ["openai", "deepseek"].iter().map(|s| s.to_string()).collect()
    }

    fn mapping(req: &str, provider: &str) -> ModelMapping {
        ModelMapping {
            request_model: req.to_string(),
            provider_id: provider.to_string(),
            upstream_model: format!("{req}-upstream"),
        }
    }

    #[tokio::test]
    async fn invalid_patch_is_rejected_without_partial_apply() {
        let rt = RuntimeConfig::from_config(&Config::default());
        let before = rt.live();

        let err = rt
            .update(
                SettingsPatch {
                    strategy: Some("least-used".to_string()),
                    retry_count: Some(0),
                    ..Default::default()
                },
                &providers(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
        assert_eq!(*rt.live(), *before);

        let err = rt
            .update(
                SettingsPatch {
                    mappings: Some(vec![mapping("gpt", "nowhere")]),
                    ..Default::default()
                },
                &providers(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("nowhere"));

        assert!(
            rt.update(
                SettingsPatch {
                    port: Some(0),
                    ..Default::default()
                },
                &providers()
            )
            .await
            .is_err()
        );
    }

    #[tokio::test]
    async fn host_must_be_a_bindable_address() {
        let rt = RuntimeConfig::from_config(&Config::default());
        let before = rt.binding();

        for bad in ["localhost", "bad host", "10.0.0", "0.0.0.0:80"] {
            let err = rt
                .update(
                    SettingsPatch {
                        host: Some(bad.to_string()),
                        ..Default::default()
                    },
                    &providers(),
                )
                .await
                .unwrap_err();
            assert!(matches!(err, GatewayError::Config(_)), "{bad}");
            assert_eq!(*rt.binding(), *before);
        }

        for good in ["127.0.0.1", "::1", "[::1]"] {
            rt.update(
                SettingsPatch {
                    host: Some(good.to_string()),
                    ..Default::default()
                },
                &providers(),
            )
            .await
            .unwrap();
            let addr = rt.binding().socket_addr().unwrap();
            assert_eq!(addr.port(), before.port);
            assert!(addr.ip().is_loopback());
        }
    }

    #[tokio::test]
    async fn live_settings_swap_immediately_binding_needs_restart() {
        let rt = RuntimeConfig::from_config(&Config::default());
        let running = (*rt.binding()).clone();

        let (live, binding) = rt
            .update(
                SettingsPatch {
                    strategy: Some("weighted".to_string()),
                    weights: Some(BTreeMap::from([("acc-1".to_string(), 3)])),
                    upsert_mappings: Some(vec![mapping("gpt", "openai"), mapping("chat", "deepseek")]),
                    port: Some(9100),
                    ..Default::default()
                },
                &providers(),
            )
            .await
            .unwrap();
        assert_eq!(live.strategy, Strategy::Weighted);
        assert_eq!(live.mappings.len(), 2);
        assert_eq!(binding.port, 9100);
        assert!(rt.view(Some(&running)).restart_required);
        assert!(!rt.view(None).restart_required);

        rt.update(
            SettingsPatch {
                remove_mappings: Some(vec!["gpt".to_string()]),
                ..Default::default()
            },
            &providers(),
        )
        .await
        .unwrap();
        assert_eq!(rt.live().mappings.len(), 1);
    }

    #[tokio::test]
    async fn settings_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config {
            data_dir: dir.path().to_string_lossy().to_string(),
            ..Config::default()
        };

        let rt = RuntimeConfig::from_config(&cfg);
        rt.update(
            SettingsPatch {
                timeout_ms: Some(5_000),
                mappings: Some(vec![mapping("gpt", "openai")]),
                ..Default::default()
            },
            &providers(),
        )
        .await
        .unwrap();

        let restored = RuntimeConfig::from_config(&cfg);
        restored.load().await.unwrap();
        assert_eq!(restored.live().timeout_ms, 5_000);
        assert_eq!(restored.live().mappings, rt.live().mappings);
    }

    #[test]
    fn unknown_patch_fields_are_rejected() {
        let res: Result<SettingsPatch, _> = serde_json::from_str(r#"{"prot": 1}"#);
        assert!(res.is_err());
    }
}
