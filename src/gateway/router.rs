//! 请求生命周期：模型映射 → 选号 → 确认凭证 → 转发 → 失败换号（有上限）→ 记录终态。
//!
//! 所有锁只在记账瞬间持有，网络往返期间不持有任何锁。

use crate::balancer::LoadBalancer;
use crate::credential::{Grant, TokenManager};
use crate::error::GatewayError;
use crate::gateway::mapping::{self, Route};
use crate::logging;
use crate::pool::AccountPool;
use crate::pool::types::{Account, HealthOutcome};
use crate::runtime_config::RuntimeConfig;
use crate::stats::{Aggregator, Level, NewLog, Outcome};
use crate::upstream::{Upstream, UpstreamBody, UpstreamError, UpstreamRequest, UpstreamResponse};
use axum::body::Bytes;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct Gateway {
    pub pool: Arc<AccountPool>,
    pub tokens: Arc<TokenManager>,
    pub balancer: Arc<LoadBalancer>,
    pub upstream: Arc<dyn Upstream>,
    pub stats: Arc<Aggregator>,
    pub settings: Arc<RuntimeConfig>,
    pub log_level: logging::LogLevel,
}

/// 一次入站请求的上下文（仅用于日志与统计打标签）。
struct RequestCtx<'a> {
    request_id: &'a str,
    model: &'a str,
    started: Instant,
}

enum Attempt {
    Success(UpstreamResponse),
    /// 非重试类 4xx：原样返回给客户端，账号健康状态不变。
    PassThrough(UpstreamResponse, String),
    Failed(String),
}

#[derive(Debug, Serialize)]
pub struct ModelList {
    pub object: &'static str,
    pub data: Vec<ModelEntry>,
}

#[derive(Debug, Serialize)]
pub struct ModelEntry {
    pub id: String,
    pub object: &'static str,
    pub owned_by: String,
}

impl Gateway {
    /// 客户端可见的模型列表（来自当前映射表）。
    pub fn models(&self) -> ModelList {
        let live = self.settings.live();
        ModelList {
            object: "list",
            data: live
                .mappings
                .iter()
                .map(|m| ModelEntry {
                    id: m.request_model.clone(),
                    object: "model",
                    owned_by: m.provider_id.clone(),
                })
                .collect(),
        }
    }

    pub async fn dispatch(
        &self,
        request_id: &str,
        body: &[u8],
    ) -> Result<UpstreamResponse, GatewayError> {
        let started = Instant::now();
        let live = self.settings.live();

        let mut req: serde_json::Value = serde_json::from_slice(body)
            .map_err(|_| GatewayError::bad_request("请求 JSON 解析失败，请检查请求体格式。"))?;
        let model = req
            .get("model")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| GatewayError::bad_request("缺少 model 字段"))?
            .to_string();
        let stream = req.get("stream").and_then(|v| v.as_bool()).unwrap_or(false);

        if self.log_level.client_enabled() {
            logging::client_request(request_id, &model, stream, body.len());
        }
        let ctx = RequestCtx {
            request_id,
            model: &model,
            started,
        };

        // 1. 模型映射：未映射的模型在触碰任何账号之前拒绝。
        let route = mapping::resolve(&live.mappings, &model);
        let provider = match &route {
            Some(r) => self.pool.get_provider(&r.provider_id).await,
            None => None,
        };
        let (Some(route), Some(provider)) = (route, provider) else {
            let err = GatewayError::ModelNotSupported(model.clone());
            self.finish_failure(&ctx, None, &[], &err).await;
            return Err(err);
        };

        if let Some(obj) = req.as_object_mut() {
            obj.insert(
                "model".to_string(),
                serde_json::Value::String(route.upstream_model.clone()),
            );
        }
        let upstream_body = Bytes::from(
            serde_json::to_vec(&req).map_err(|e| GatewayError::Internal(e.into()))?,
        );
        let url = provider.chat_url();
        let weights = live.weight_map();
        let ceiling = live.retry_count.max(1) as usize;
        let timeout = live.timeout();

        // 2~4. 依次选号尝试，已试过的账号从候选中排除。
        let mut tried: Vec<String> = Vec::new();
        let mut last_error = String::new();
        while tried.len() < ceiling {
            let eligible: Vec<Account> = self
                .pool
                .list_eligible(Some(&route.provider_id), Some(&route.upstream_model))
                .await
                .into_iter()
                .filter(|a| !tried.contains(&a.id))
                .collect();

            let account = match self
                .balancer
                .select(&eligible, live.strategy, &weights, &route.provider_id)
                .await
            {
                Ok(a) => a,
                Err(err) if tried.is_empty() => {
                    self.finish_failure(&ctx, Some(&route), &tried, &err).await;
                    return Err(err);
                }
                Err(_) => break,
            };
            tried.push(account.id.clone());

            let attempt = self
                .attempt(&ctx, &route, &account, &url, &upstream_body, stream, timeout)
                .await;
            match attempt {
                Attempt::Success(resp) => {
                    if let Err(e) = self.pool.record_usage(&account.id, 1).await {
                        tracing::warn!("记录账号用量失败：{e}");
                    }
                    let _ = self
                        .pool
                        .mark_health(&account.id, HealthOutcome::Success)
                        .await;
                    self.finish_success(&ctx, &route, &account, &tried, resp.status)
                        .await;
                    return Ok(resp);
                }
                Attempt::PassThrough(resp, message) => {
                    let err = GatewayError::UpstreamTransport(message);
                    self.finish_failure(&ctx, Some(&route), &tried, &err).await;
                    return Ok(resp);
                }
                Attempt::Failed(message) => last_error = message,
            }
        }

        let err = GatewayError::UpstreamExhausted {
            attempted: tried.clone(),
            last_error,
        };
        self.finish_failure(&ctx, Some(&route), &tried, &err).await;
        Err(err)
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt(
        &self,
        ctx: &RequestCtx<'_>,
        route: &Route,
        account: &Account,
        url: &str,
        body: &Bytes,
        stream: bool,
        timeout: Duration,
    ) -> Attempt {
        let grant = match self.tokens.ensure_valid(&account.id).await {
            Ok(g) => g,
            Err(e) => {
                let _ = self
                    .pool
                    .mark_health(&account.id, HealthOutcome::AuthFailure)
                    .await;
                return self.attempt_failed(ctx, route, account, e.to_string()).await;
            }
        };

        let first = self
            .forward(url, body, stream, timeout, account, &grant)
            .await;
        let err = match first {
            Ok(resp) => return Attempt::Success(resp),
            Err(e) => e,
        };
        if !err.is_auth_failure() {
            return self.classify(ctx, route, account, err).await;
        }

        // 凭证被拒：刷新一次后在同一账号上重试，不占用额外的重试名额。
        tracing::info!(
            request_id = ctx.request_id,
            account_id = %account.id,
            status = err.status().unwrap_or_default(),
            "上游拒绝凭证，尝试刷新后重试"
        );
        let refreshed = match self.tokens.force_refresh(&account.id, grant.version).await {
            Ok(g) => g,
            Err(e) => {
                let _ = self
                    .pool
                    .mark_health(&account.id, HealthOutcome::AuthFailure)
                    .await;
                return self
                    .attempt_failed(ctx, route, account, format!("{err}；{e}"))
                    .await;
            }
        };
        match self
            .forward(url, body, stream, timeout, account, &refreshed)
            .await
        {
            Ok(resp) => Attempt::Success(resp),
            Err(e) if e.is_auth_failure() => {
                let _ = self
                    .pool
                    .mark_health(&account.id, HealthOutcome::AuthFailure)
                    .await;
                self.attempt_failed(ctx, route, account, e.to_string()).await
            }
            Err(e) => self.classify(ctx, route, account, e).await,
        }
    }

    async fn forward(
        &self,
        url: &str,
        body: &Bytes,
        stream: bool,
        timeout: Duration,
        account: &Account,
        grant: &Grant,
    ) -> Result<UpstreamResponse, UpstreamError> {
        self.upstream
            .forward(UpstreamRequest {
                url: url.to_string(),
                body: body.clone(),
                stream,
                auth: grant.capability.clone(),
                timeout,
                account_id: account.id.clone(),
            })
            .await
    }

    async fn classify(
        &self,
        ctx: &RequestCtx<'_>,
        route: &Route,
        account: &Account,
        err: UpstreamError,
    ) -> Attempt {
        if err.is_retryable() {
            let _ = self
                .pool
                .mark_health(&account.id, HealthOutcome::TransportFailure)
                .await;
            return self.attempt_failed(ctx, route, account, err.to_string()).await;
        }
        let message = err.to_string();
        match err {
            UpstreamError::Http {
                status,
                body,
                content_type,
                ..
            } => Attempt::PassThrough(
                UpstreamResponse {
                    status,
                    content_type,
                    body: UpstreamBody::Full(body),
                },
                message,
            ),
            _ => self.attempt_failed(ctx, route, account, message).await,
        }
    }

    async fn attempt_failed(
        &self,
        ctx: &RequestCtx<'_>,
        route: &Route,
        account: &Account,
        message: String,
    ) -> Attempt {
        tracing::warn!(
            request_id = ctx.request_id,
            account_id = %account.id,
            provider_id = %route.provider_id,
            "上游尝试失败，切换下一个账号：{message}"
        );
        self.stats
            .append(
                NewLog::new(
                    Level::Warn,
                    format!("账号 {} 请求失败：{message}", account.id),
                )
                .event("attempt_failed")
                .model(ctx.model)
                .account(&account.id)
                .provider(&route.provider_id)
                .request(ctx.request_id),
            )
            .await;
        Attempt::Failed(message)
    }

    async fn finish_success(
        &self,
        ctx: &RequestCtx<'_>,
        route: &Route,
        account: &Account,
        tried: &[String],
        status: u16,
    ) {
        let latency = ctx.started.elapsed();
        self.stats
            .record(&Outcome {
                model: ctx.model.to_string(),
                provider_id: Some(route.provider_id.clone()),
                account_id: Some(account.id.clone()),
                success: true,
                latency,
                timestamp: Utc::now(),
            })
            .await;
        self.stats
            .append(
                NewLog::new(
                    Level::Info,
                    format!(
                        "请求成功：{} → {}/{}（账号 {}，第 {} 次尝试，{}ms）",
                        ctx.model,
                        route.provider_id,
                        route.upstream_model,
                        account.id,
                        tried.len(),
                        logging::format_duration_ms(latency)
                    ),
                )
                .event("request_completed")
                .model(ctx.model)
                .account(&account.id)
                .provider(&route.provider_id)
                .request(ctx.request_id),
            )
            .await;
        if self.log_level.client_enabled() {
            logging::client_response(ctx.request_id, status, latency);
        }
    }

    /// 记录失败终态；日志中带上模型、已尝试账号与最终错误，足以还原决策过程。
    async fn finish_failure(
        &self,
        ctx: &RequestCtx<'_>,
        route: Option<&Route>,
        tried: &[String],
        err: &GatewayError,
    ) {
        let latency = ctx.started.elapsed();
        self.stats
            .record(&Outcome {
                model: ctx.model.to_string(),
                provider_id: route.map(|r| r.provider_id.clone()),
                account_id: tried.last().cloned(),
                success: false,
                latency,
                timestamp: Utc::now(),
            })
            .await;

        let attempted = if tried.is_empty() {
            "无".to_string()
        } else {
            tried.join(", ")
        };
        tracing::warn!(
            request_id = ctx.request_id,
            model = ctx.model,
            kind = err.kind(),
            "请求失败（已尝试账号：{attempted}）：{err}"
        );
        let mut log = NewLog::new(
            Level::Error,
            format!(
                "请求失败：模型 {}，已尝试账号 [{attempted}]，错误 {}：{err}",
                ctx.model,
                err.kind()
            ),
        )
        .event("request_failed")
        .model(ctx.model)
        .request(ctx.request_id);
        if let Some(r) = route {
            log = log.provider(&r.provider_id);
        }
        if let Some(last) = tried.last() {
            log = log.account(last);
        }
        self.stats.append(log).await;

        if self.log_level.client_enabled() {
            logging::client_response(ctx.request_id, err.status_code().as_u16(), latency);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::Config;
    use crate::credential::Vault;
    use crate::credential::token_manager::tests::{MockEndpoint, expired_token, oauth_provider};
    use crate::credential::types::Credential;
    use crate::gateway::mapping::ModelMapping;
    use crate::pool::types::{AccountStatus, NewAccount};
    use crate::runtime_config::SettingsPatch;
    use crate::stats::LogFilter;
    use async_trait::async_trait;
    use axum::http::{HeaderMap, header};
    use std::collections::{HashMap, HashSet, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::{Mutex, broadcast};

    #[derive(Debug, Clone)]
    pub(crate) enum Reply {
        Ok,
        Status(u16),
        Transport,
    }

    /// 按账号脚本化的上游桩：每个账号一串回复，用完后返回 200。
    #[derive(Default)]
    pub(crate) struct ScriptedUpstream {
        pub scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
        pub calls: AtomicUsize,
        pub seen: Mutex<Vec<(String, String, serde_json::Value)>>,
    }

    impl ScriptedUpstream {
        pub(crate) async fn script(&self, account_id: &str, replies: Vec<Reply>) {
            self.scripts
                .lock()
                .await
                .insert(account_id.to_string(), replies.into());
        }
    }

    #[async_trait]
    impl Upstream for ScriptedUpstream {
        async fn forward(&self, req: UpstreamRequest) -> Result<UpstreamResponse, UpstreamError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut h = HeaderMap::new();
            req.auth.authorize(&mut h);
            let auth = h
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            let body: serde_json::Value = serde_json::from_slice(&req.body).unwrap_or_default();
            self.seen
                .lock()
                .await
                .push((req.account_id.clone(), auth, body));

            let reply = self
                .scripts
                .lock()
                .await
                .get_mut(&req.account_id)
                .and_then(|q| q.pop_front())
                .unwrap_or(Reply::Ok);
            match reply {
                Reply::Ok => Ok(UpstreamResponse {
                    status: 200,
                    content_type: Some("application/json".to_string()),
                    body: UpstreamBody::Full(Bytes::from_static(br#"{"id":"chatcmpl-1"}"#)),
                }),
                Reply::Status(status) => Err(UpstreamError::Http {
                    status,
                    message: format!("status {status}"),
                    body: Bytes::from(format!(r#"{{"error":{{"message":"status {status}"}}}}"#)),
                    content_type: Some("application/json".to_string()),
                }),
                Reply::Transport => Err(UpstreamError::Transport("connection reset".to_string())),
            }
        }

        async fn probe(
            &self,
            _url: &str,
            _auth: &crate::credential::types::AuthCapability,
            _timeout: Duration,
        ) -> Result<(), UpstreamError> {
            Ok(())
        }

        async fn fetch_json(
            &self,
            _url: &str,
            _auth: &crate::credential::types::AuthCapability,
            _timeout: Duration,
        ) -> Result<serde_json::Value, UpstreamError> {
            Ok(serde_json::json!({}))
        }
    }

    pub(crate) struct Harness {
        pub gateway: Gateway,
        pub upstream: Arc<ScriptedUpstream>,
        pub endpoint: Arc<MockEndpoint>,
        pub vault: Arc<Vault>,
    }

    pub(crate) async fn harness(strategy: &str, retry_count: u32, refresh_fails: bool) -> Harness {
        let pool = Arc::new(AccountPool::new(None, 3));
        pool.add_provider(oauth_provider()).await.unwrap();
        let vault = Arc::new(Vault::new(None));
        let stats = Arc::new(Aggregator::new(1000));
        let endpoint = Arc::new(MockEndpoint::new(refresh_fails));
        let (events, _) = broadcast::channel(16);
        let tokens = Arc::new(TokenManager::new(
            vault.clone(),
            pool.clone(),
            stats.clone(),
            endpoint.clone(),
            events,
        ));

        let settings = Arc::new(RuntimeConfig::from_config(&Config::default()));
        let providers: HashSet<String> = pool.provider_ids().await;
        settings
            .update(
                SettingsPatch {
                    strategy: Some(strategy.to_string()),
                    retry_count: Some(retry_count),
                    mappings: Some(vec![
                        ModelMapping {
                            request_model: "gpt".to_string(),
                            provider_id: "openai".to_string(),
                            upstream_model: "gpt-4o".to_string(),
                        },
                        ModelMapping {
                            request_model: "corp-chat".to_string(),
                            provider_id: "corp".to_string(),
                            upstream_model: "corp-large".to_string(),
                        },
                    ]),
                    ..Default::default()
                },
                &providers,
            )
            .await
            .unwrap();

        let upstream = Arc::new(ScriptedUpstream::default());
        let gateway = Gateway {
            pool,
            tokens,
            balancer: Arc::new(LoadBalancer::new()),
            upstream: upstream.clone(),
            stats,
            settings,
            log_level: logging::LogLevel::Off,
        };
        Harness {
            gateway,
            upstream,
            endpoint,
            vault,
        }
    }

    impl Harness {
        pub(crate) async fn api_key_account(&self, name: &str, quota: u64, used: u64) -> String {
            let a = self
                .gateway
                .pool
                .add_account(NewAccount {
                    provider_id: "openai".to_string(),
                    name: name.to_string(),
                    daily_quota: Some(quota),
                    enabled: None,
                })
                .await
                .unwrap();
            if used > 0 {
                self.gateway.pool.record_usage(&a.id, used).await.unwrap();
            }
            self.vault
                .put(
                    &a.id,
                    Credential::ApiKey {
                        api_key: format!("sk-{name}"),
                    },
                )
                .await;
            a.id
        }

        async fn account(&self, id: &str) -> Account {
            self.gateway.pool.get_account(id).await.unwrap()
        }

        async fn logs(&self, event: &str) -> usize {
            self.gateway
                .stats
                .query(&LogFilter {
                    keyword: Some(event.to_string()),
                    ..Default::default()
                })
                .await
                .len()
        }
    }

    pub(crate) const GPT: &[u8] = br#"{"model":"gpt","messages":[{"role":"user","content":"hi"}],"temperature":0.2}"#;

    #[tokio::test]
    async fn first_attempt_success_counts_once() {
        let h = harness("round-robin", 3, false).await;
        let a = h.api_key_account("a", 10, 0).await;

        let resp = h.gateway.dispatch("req-1", GPT).await.unwrap();
        assert_eq!(resp.status, 200);

        let s = h.gateway.stats.statistics().await;
        assert_eq!((s.total_requests, s.success_requests, s.failed_requests), (1, 1, 0));
        assert_eq!(h.account(&a).await.used, 1);
        assert_eq!(h.account(&a).await.status, AccountStatus::Online);

        // 模型名被改写，其余字段原样转发。
        let seen = h.upstream.seen.lock().await;
        let (acc, auth, body) = &seen[0];
        assert_eq!(acc, &a);
        assert_eq!(auth, "Bearer sk-a");
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["temperature"], 0.2);
        assert_eq!(body["messages"][0]["content"], "hi");
    }

    #[tokio::test]
    async fn unmapped_model_touches_no_account() {
        let h = harness("round-robin", 3, false).await;
        h.api_key_account("a", 10, 0).await;

        let err = h
            .gateway
            .dispatch("req-1", br#"{"model":"claude"}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ModelNotSupported(_)));
        assert_eq!(h.upstream.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.gateway.stats.statistics().await.failed_requests, 1);
    }

    #[tokio::test]
    async fn least_used_prefers_lower_ratio() {
        let h = harness("least-used", 3, false).await;
        let a = h.api_key_account("a", 10, 9).await;
        let b = h.api_key_account("b", 10, 0).await;

        h.gateway.dispatch("req-1", GPT).await.unwrap();
        assert_eq!(h.upstream.seen.lock().await[0].0, b);
        assert_eq!(h.account(&b).await.used, 1);
        assert_eq!(h.account(&a).await.used, 9);
    }

    #[tokio::test]
    async fn transport_failure_fails_over_to_next_account() {
        let h = harness("round-robin", 2, false).await;
        let a = h.api_key_account("a", 10, 0).await;
        let b = h.api_key_account("b", 10, 0).await;
        h.upstream.script(&a, vec![Reply::Transport]).await;

        let resp = h.gateway.dispatch("req-1", GPT).await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(h.upstream.calls.load(Ordering::SeqCst), 2);

        let s = h.gateway.stats.statistics().await;
        assert_eq!((s.success_requests, s.failed_requests), (1, 0));
        assert_eq!(h.logs("attempt_failed").await, 1);

        // 单次传输失败不会让账号离线，也不计用量。
        let acc_a = h.account(&a).await;
        assert_eq!(acc_a.used, 0);
        assert_ne!(acc_a.status, AccountStatus::Offline);
        assert_eq!(h.account(&b).await.used, 1);
    }

    #[tokio::test]
    async fn retry_ceiling_bounds_attempts() {
        let h = harness("round-robin", 2, false).await;
        for name in ["a", "b", "c"] {
            let id = h.api_key_account(name, 10, 0).await;
            h.upstream.script(&id, vec![Reply::Status(503)]).await;
        }

        let err = h.gateway.dispatch("req-1", GPT).await.unwrap_err();
        let GatewayError::UpstreamExhausted { attempted, .. } = err else {
            panic!("expected exhausted");
        };
        assert_eq!(attempted.len(), 2);
        assert_eq!(h.upstream.calls.load(Ordering::SeqCst), 2);
        assert_eq!(h.gateway.stats.statistics().await.failed_requests, 1);
        assert_eq!(h.logs("request_failed").await, 1);
    }

    #[tokio::test]
    async fn no_accounts_is_no_eligible_account() {
        let h = harness("round-robin", 3, false).await;
        let err = h.gateway.dispatch("req-1", GPT).await.unwrap_err();
        assert!(matches!(err, GatewayError::NoEligibleAccount(_)));
        assert_eq!(h.upstream.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn client_errors_pass_through_without_penalty() {
        let h = harness("round-robin", 3, false).await;
        let a = h.api_key_account("a", 10, 0).await;
        h.api_key_account("b", 10, 0).await;
        h.upstream.script(&a, vec![Reply::Status(400)]).await;

        let resp = h.gateway.dispatch("req-1", GPT).await.unwrap();
        assert_eq!(resp.status, 400);
        assert_eq!(h.upstream.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.account(&a).await.consecutive_failures, 0);
        assert_eq!(h.gateway.stats.statistics().await.failed_requests, 1);
    }

    #[tokio::test]
    async fn expired_credential_with_failing_refresh_goes_offline() {
        let h = harness("round-robin", 3, true).await;
        let c = h
            .gateway
            .pool
            .add_account(NewAccount {
                provider_id: "corp".to_string(),
                name: "c".to_string(),
                daily_quota: Some(10),
                enabled: None,
            })
            .await
            .unwrap();
        h.vault.put(&c.id, expired_token()).await;

        let err = h
            .gateway
            .dispatch("req-1", br#"{"model":"corp-chat","stream":true}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamExhausted { .. }));
        assert_eq!(h.upstream.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.endpoint.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.account(&c.id).await.status, AccountStatus::Offline);
        assert_eq!(h.logs("refresh_failed").await, 1);

        // 账号已离线：后续请求直接无可用账号。
        let err = h
            .gateway
            .dispatch("req-2", br#"{"model":"corp-chat"}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NoEligibleAccount(_)));
    }

    #[tokio::test]
    async fn auth_rejection_refreshes_once_on_same_account() {
        let h = harness("round-robin", 1, false).await;
        let c = h
            .gateway
            .pool
            .add_account(NewAccount {
                provider_id: "corp".to_string(),
                name: "c".to_string(),
                daily_quota: Some(10),
                enabled: None,
            })
            .await
            .unwrap();
        h.vault.put(&c.id, expired_token()).await;
        h.upstream.script(&c.id, vec![Reply::Status(401)]).await;

        // retryCount=1：刷新后的重试不占用名额。
        let resp = h
            .gateway
            .dispatch("req-1", br#"{"model":"corp-chat"}"#)
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(h.endpoint.calls.load(Ordering::SeqCst), 2);

        let seen = h.upstream.seen.lock().await;
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].1, "Bearer fresh-1");
        assert_eq!(seen[1].1, "Bearer fresh-2");
        assert_eq!(h.account(&c.id).await.used, 1);
    }

    #[tokio::test]
    async fn rejected_api_key_goes_offline_and_fails_over() {
        let h = harness("round-robin", 3, false).await;
        let a = h.api_key_account("a", 10, 0).await;
        let b = h.api_key_account("b", 10, 0).await;
        h.upstream.script(&a, vec![Reply::Status(403)]).await;

        h.gateway.dispatch("req-1", GPT).await.unwrap();
        assert_eq!(h.account(&a).await.status, AccountStatus::Offline);
        assert_eq!(h.account(&b).await.used, 1);
        assert_eq!(h.endpoint.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn concurrent_requests_never_exceed_quota() {
        let h = Arc::new(harness("round-robin", 3, false).await);
        let a = h.api_key_account("a", 5, 0).await;

        let mut handles = Vec::new();
        for i in 0..20 {
            let h = h.clone();
            handles.push(tokio::spawn(async move {
                h.gateway.dispatch(&format!("req-{i}"), GPT).await.is_ok()
            }));
        }
        let mut ok = 0;
        for handle in handles {
            if handle.await.unwrap() {
                ok += 1;
            }
        }
        let used = h.account(&a).await.used;
        assert!(used <= 5);
        assert!(ok >= 5);
    }

    #[tokio::test]
    async fn model_list_comes_from_mappings() {
        let h = harness("round-robin", 3, false).await;
        let list = h.gateway.models();
        let ids: Vec<&str> = list.data.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["corp-chat", "gpt"]);
    }
}
