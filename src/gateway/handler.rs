//! 代理监听器的 HTTP 入口（OpenAI 兼容）。

use crate::gateway::router::Gateway;
use crate::runtime_config::RuntimeConfig;
use crate::upstream::{UpstreamBody, UpstreamResponse};
use crate::util::id;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderName, HeaderValue, Method, StatusCode, header, request::Parts};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{AllowOrigin, CorsLayer};

const REQUEST_ID_HEADER: &str = "x-request-id";

pub fn router(gateway: Arc<Gateway>) -> Router {
    let cors = cors_layer(gateway.settings.clone());
    Router::new()
        .route("/v1/models", get(handle_list_models))
        .route("/v1/chat/completions", post(handle_chat_completions))
        // 兼容尾随斜杠
        .route("/v1/chat/completions/", post(handle_chat_completions))
        .layer(cors)
        .with_state(gateway)
}

/// 跨域策略：每个请求都读取最新的 `cors_origins`，更新配置后无需重启；`*` 放行所有来源。
pub fn cors_layer(settings: Arc<RuntimeConfig>) -> CorsLayer {
    CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static("x-api-key"),
        ])
        .expose_headers([HeaderName::from_static(REQUEST_ID_HEADER)])
        .allow_credentials(false)
        .max_age(Duration::from_secs(3600))
        .allow_origin(AllowOrigin::predicate(
            move |origin: &HeaderValue, _parts: &Parts| {
                let live = settings.live();
                live.cors_origins
                    .iter()
                    .any(|o| o == "*" || o.as_bytes() == origin.as_bytes())
            },
        ))
}

async fn handle_list_models(State(gateway): State<Arc<Gateway>>) -> Response {
    Json(gateway.models()).into_response()
}

async fn handle_chat_completions(State(gateway): State<Arc<Gateway>>, body: Bytes) -> Response {
    let request_id = id::request_id();
    let mut resp = match gateway.dispatch(&request_id, &body).await {
        Ok(upstream) => into_response(upstream),
        Err(e) => e.into_response(),
    };
    if let Ok(v) = HeaderValue::from_str(&request_id) {
        resp.headers_mut().insert(REQUEST_ID_HEADER, v);
    }
    resp
}

/// 上游响应原样回写：状态码、Content-Type 与字节流都不做改动。
fn into_response(upstream: UpstreamResponse) -> Response {
    let status = StatusCode::from_u16(upstream.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let body = match upstream.body {
        UpstreamBody::Full(bytes) => Body::from(bytes),
        UpstreamBody::Stream(stream) => Body::from_stream(stream),
    };
    let mut builder = Response::builder().status(status);
    if let Some(ct) = upstream
        .content_type
        .as_deref()
        .and_then(|ct| HeaderValue::from_str(ct).ok())
    {
        builder = builder.header(header::CONTENT_TYPE, ct);
    }
    builder
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::router::tests::{GPT, harness};
    use crate::runtime_config::SettingsPatch;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn read_json(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn chat_completion_round_trip() {
        let h = harness("round-robin", 3, false).await;
        h.api_key_account("a", 10, 0).await;
        let app = router(Arc::new(h.gateway));

        let resp = app
            .oneshot(
                Request::post("/v1/chat/completions")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(GPT))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers().contains_key(REQUEST_ID_HEADER));
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
        assert_eq!(read_json(resp).await["id"], "chatcmpl-1");
    }

    #[tokio::test]
    async fn unmapped_model_is_openai_error() {
        let h = harness("round-robin", 3, false).await;
        let app = router(Arc::new(h.gateway));

        let resp = app
            .oneshot(
                Request::post("/v1/chat/completions")
                    .body(Body::from(r#"{"model":"nope"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            read_json(resp).await["error"]["type"],
            "model_not_supported"
        );
    }

    #[tokio::test]
    async fn cors_follows_live_settings() {
        let h = harness("round-robin", 3, false).await;
        let settings = h.gateway.settings.clone();
        let providers = h.gateway.pool.provider_ids().await;
        let app = router(Arc::new(h.gateway));

        let preflight = |origin: &'static str| {
            Request::builder()
                .method(Method::OPTIONS)
                .uri("/v1/models")
                .header(header::ORIGIN, origin)
                .header(header::ACCESS_CONTROL_REQUEST_METHOD, "GET")
                .body(Body::empty())
                .unwrap()
        };

        let resp = app.clone().oneshot(preflight("http://a.test")).await.unwrap();
        assert!(
            !resp
                .headers()
                .contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN)
        );

        settings
            .update(
                SettingsPatch {
                    cors_origins: Some(vec!["http://a.test".to_string()]),
                    ..Default::default()
                },
                &providers,
            )
            .await
            .unwrap();

        let resp = app.clone().oneshot(preflight("http://a.test")).await.unwrap();
        assert_eq!(
            resp.headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .unwrap(),
            "http://a.test"
        );
        let resp = app.oneshot(preflight("http://b.test")).await.unwrap();
        assert!(
            !resp
                .headers()
                .contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN)
        );
    }
}
