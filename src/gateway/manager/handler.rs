//! 控制面 JSON 接口。
//!
//! 所有处理器共享 `Arc<Engine>`；配置了 ADMIN_KEY 时需要携带 `Authorization: Bearer <key>`。

use crate::engine::{CompleteLogin, CreateAccount, Engine, UpdateAccount};
use crate::error::GatewayError;
use crate::pool::types::{Provider, ProviderPatch};
use crate::runtime_config::SettingsPatch;
use crate::stats::{ExportFormat, LogFilter};
use axum::extract::{Path, Query, Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::Next;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::Stream;
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

type AdminResult<T> = Result<Json<T>, GatewayError>;

pub async fn admin_auth_middleware(
    State(engine): State<Arc<Engine>>,
    request: Request,
    next: Next,
) -> Response {
    let key = engine.cfg.admin_key.trim();
    if key.is_empty() {
        return next.run(request).await;
    }
    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    if presented == Some(key) {
        return next.run(request).await;
    }
    GatewayError::Unauthorized("缺少或错误的管理密钥".to_string()).into_response()
}

pub async fn handle_health() -> &'static str {
    "ok"
}

// ===== 代理 =====

#[derive(Debug, Default, Deserialize)]
pub struct StartBody {
    #[serde(default)]
    port: Option<u16>,
}

pub async fn handle_proxy_start(
    State(engine): State<Arc<Engine>>,
    body: Option<Json<StartBody>>,
) -> AdminResult<serde_json::Value> {
    let port = body.and_then(|Json(b)| b.port);
    let started = engine.proxy_start(port).await?;
    Ok(Json(json!({ "success": started })))
}

pub async fn handle_proxy_stop(State(engine): State<Arc<Engine>>) -> Json<serde_json::Value> {
    Json(json!({ "success": engine.proxy_stop().await }))
}

pub async fn handle_proxy_status(State(engine): State<Arc<Engine>>) -> Response {
    Json(engine.proxy_status().await).into_response()
}

pub async fn handle_statistics(State(engine): State<Arc<Engine>>) -> Response {
    Json(engine.statistics().await).into_response()
}

pub async fn handle_statistics_clear(State(engine): State<Arc<Engine>>) -> StatusCode {
    engine.clear_statistics().await;
    StatusCode::NO_CONTENT
}

// ===== Provider =====

pub async fn handle_providers_list(State(engine): State<Arc<Engine>>) -> Response {
    Json(engine.list_providers().await).into_response()
}

pub async fn handle_provider_create(
    State(engine): State<Arc<Engine>>,
    Json(provider): Json<Provider>,
) -> Result<(StatusCode, Json<Provider>), GatewayError> {
    let p = engine.add_provider(provider).await?;
    Ok((StatusCode::CREATED, Json(p)))
}

pub async fn handle_provider_update(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
    Json(patch): Json<ProviderPatch>,
) -> AdminResult<Provider> {
    Ok(Json(engine.update_provider(&id, patch).await?))
}

pub async fn handle_provider_delete(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> AdminResult<Provider> {
    Ok(Json(engine.remove_provider(&id).await?))
}

// ===== 账号 =====

pub async fn handle_accounts_list(State(engine): State<Arc<Engine>>) -> Response {
    Json(engine.list_accounts().await).into_response()
}

pub async fn handle_account_create(
    State(engine): State<Arc<Engine>>,
    Json(req): Json<CreateAccount>,
) -> Result<Response, GatewayError> {
    let view = engine.create_account(req).await?;
    Ok((StatusCode::CREATED, Json(view)).into_response())
}

pub async fn handle_account_update(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
    Json(req): Json<UpdateAccount>,
) -> Result<Response, GatewayError> {
    Ok(Json(engine.update_account(&id, req).await?).into_response())
}

pub async fn handle_account_delete(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> Result<Response, GatewayError> {
    Ok(Json(engine.delete_account(&id).await?).into_response())
}

pub async fn handle_account_check(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> Result<Response, GatewayError> {
    Ok(Json(engine.check_status(&id).await?).into_response())
}

pub async fn handle_account_validate(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> Result<Response, GatewayError> {
    Ok(Json(engine.validate_token(&id).await?).into_response())
}

pub async fn handle_account_credits(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> Result<Response, GatewayError> {
    Ok(Json(engine.get_credits(&id).await?).into_response())
}

// ===== OAuth =====

pub async fn handle_oauth_login(
    State(engine): State<Arc<Engine>>,
    Path(provider_id): Path<String>,
) -> Result<Response, GatewayError> {
    Ok(Json(engine.start_login(&provider_id).await?).into_response())
}

pub async fn handle_oauth_callback(
    State(engine): State<Arc<Engine>>,
    Path(provider_id): Path<String>,
    Json(req): Json<CompleteLogin>,
) -> Result<Response, GatewayError> {
    let view = engine.complete_login(&provider_id, req).await?;
    Ok((StatusCode::CREATED, Json(view)).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenLogin {
    refresh_token: String,
    #[serde(default)]
    name: String,
}

pub async fn handle_oauth_token(
    State(engine): State<Arc<Engine>>,
    Path(provider_id): Path<String>,
    Json(req): Json<TokenLogin>,
) -> Result<Response, GatewayError> {
    let view = engine
        .login_with_token(&provider_id, &req.refresh_token, &req.name)
        .await?;
    Ok((StatusCode::CREATED, Json(view)).into_response())
}

pub async fn handle_oauth_refresh(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> Result<Response, GatewayError> {
    Ok(Json(engine.refresh_token(&id).await?).into_response())
}

// ===== 日志 =====

pub async fn handle_logs(
    State(engine): State<Arc<Engine>>,
    Query(filter): Query<LogFilter>,
) -> Response {
    Json(engine.logs(&filter).await).into_response()
}

pub async fn handle_log_stats(State(engine): State<Arc<Engine>>) -> Response {
    Json(engine.log_stats().await).into_response()
}

#[derive(Debug, Deserialize)]
pub struct TrendQuery {
    #[serde(default = "default_trend_days")]
    days: u32,
}

fn default_trend_days() -> u32 {
    7
}

pub async fn handle_log_trend(
    State(engine): State<Arc<Engine>>,
    Query(q): Query<TrendQuery>,
) -> Response {
    Json(engine.trend(q.days).await).into_response()
}

pub async fn handle_logs_clear(State(engine): State<Arc<Engine>>) -> StatusCode {
    engine.clear_logs().await;
    StatusCode::NO_CONTENT
}

#[derive(Debug, Deserialize)]
pub struct ExportQuery {
    #[serde(default)]
    format: ExportFormat,
}

pub async fn handle_logs_export(
    State(engine): State<Arc<Engine>>,
    Query(q): Query<ExportQuery>,
) -> Result<Response, GatewayError> {
    let format = q.format;
    let body = engine.export_logs(format).await?;
    let ext = match format {
        ExportFormat::Json => "json",
        ExportFormat::Csv => "csv",
    };
    Ok((
        [
            (header::CONTENT_TYPE, format.content_type().to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"logs.{ext}\""),
            ),
        ],
        body,
    )
        .into_response())
}

/// 推送新日志与 OAuth 进度；慢消费者丢失的消息直接跳过。
pub async fn handle_events(
    State(engine): State<Arc<Engine>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut logs = engine.subscribe_logs();
    let mut oauth = engine.subscribe_oauth();

    let stream = async_stream::stream! {
        loop {
            let event = tokio::select! {
                r = logs.recv() => match r {
                    Ok(entry) => Event::default().event("log").json_data(&entry).ok(),
                    Err(RecvError::Lagged(n)) => {
                        tracing::debug!("日志推送落后，跳过 {n} 条");
                        None
                    }
                    Err(RecvError::Closed) => break,
                },
                r = oauth.recv() => match r {
                    Ok(ev) => Event::default().event("oauth").json_data(&ev).ok(),
                    Err(RecvError::Lagged(_)) => None,
                    Err(RecvError::Closed) => break,
                },
            };
            if let Some(event) = event {
                yield Ok(event);
            }
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}

// ===== 配置 =====

pub async fn handle_config_get(State(engine): State<Arc<Engine>>) -> Response {
    Json(engine.config_view().await).into_response()
}

pub async fn handle_config_update(
    State(engine): State<Arc<Engine>>,
    Json(patch): Json<SettingsPatch>,
) -> Result<Response, GatewayError> {
    Ok(Json(engine.update_config(patch).await?).into_response())
}
