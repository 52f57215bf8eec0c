//! 控制面：代理启停、provider/账号管理、OAuth、日志与配置。

pub mod handler;

use crate::engine::Engine;
use axum::routing::{get, post, put};
use axum::{Router, middleware};
use handler::*;
use std::sync::Arc;

pub fn router(engine: Arc<Engine>) -> Router {
    let admin = Router::new()
        .route("/admin/proxy/start", post(handle_proxy_start))
        .route("/admin/proxy/stop", post(handle_proxy_stop))
        .route("/admin/proxy/status", get(handle_proxy_status))
        .route(
            "/admin/proxy/statistics",
            get(handle_statistics).delete(handle_statistics_clear),
        )
        .route(
            "/admin/providers",
            get(handle_providers_list).post(handle_provider_create),
        )
        .route(
            "/admin/providers/{id}",
            put(handle_provider_update).delete(handle_provider_delete),
        )
        .route(
            "/admin/accounts",
            get(handle_accounts_list).post(handle_account_create),
        )
        .route(
            "/admin/accounts/{id}",
            put(handle_account_update).delete(handle_account_delete),
        )
        .route("/admin/accounts/{id}/check", post(handle_account_check))
        .route("/admin/accounts/{id}/validate", post(handle_account_validate))
        .route("/admin/accounts/{id}/credits", get(handle_account_credits))
        .route("/admin/oauth/{provider}/login", post(handle_oauth_login))
        .route("/admin/oauth/{provider}/callback", post(handle_oauth_callback))
        .route("/admin/oauth/{provider}/token", post(handle_oauth_token))
        .route(
            "/admin/oauth/accounts/{id}/validate",
            post(handle_account_validate),
        )
        .route(
            "/admin/oauth/accounts/{id}/refresh",
            post(handle_oauth_refresh),
        )
        .route("/admin/logs", get(handle_logs).delete(handle_logs_clear))
        .route("/admin/logs/stats", get(handle_log_stats))
        .route("/admin/logs/trend", get(handle_log_trend))
        .route("/admin/logs/export", get(handle_logs_export))
        .route("/admin/events", get(handle_events))
        .route(
            "/admin/config",
            get(handle_config_get).patch(handle_config_update),
        )
        .layer(middleware::from_fn_with_state(
            engine.clone(),
            admin_auth_middleware,
        ))
        .with_state(engine);

    Router::new()
        .route("/health", get(handle_health))
        .merge(admin)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::credential::token_manager::tests::MockEndpoint;
    use crate::gateway::router::tests::ScriptedUpstream;
    use crate::pool::types::REDACTED_SECRET;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use tower::ServiceExt;

    fn app(admin_key: &str) -> Router {
        let mut cfg = Config::default();
        cfg.admin_key = admin_key.to_string();
        let engine = Engine::with_parts(
            cfg,
            Arc::new(ScriptedUpstream::default()),
            Arc::new(MockEndpoint::new(false)),
        );
        router(Arc::new(engine))
    }

    async fn call(app: &Router, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    fn json_req(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn admin_key_is_enforced() {
        let app = app("secret");
        let get = |auth: Option<&str>| {
            let mut b = Request::get("/admin/providers");
            if let Some(a) = auth {
                b = b.header(header::AUTHORIZATION, a);
            }
            b.body(Body::empty()).unwrap()
        };

        let (status, body) = call(&app, get(None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["type"], "unauthorized");

        let (status, _) = call(&app, get(Some("Bearer wrong"))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) = call(&app, get(Some("Bearer secret"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 3);

        // 健康检查不需要鉴权。
        let resp = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn account_crud_and_config_over_http() {
        let app = app("");

        let (status, created) = call(
            &app,
            json_req(
                "POST",
                "/admin/accounts",
                serde_json::json!({
                    "providerId": "openai",
                    "name": "main",
                    "dailyQuota": 50,
                    "credentials": {"api_key": "sk-main"}
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["credentialType"], "api_key");
        assert!(created.get("apiKey").is_none());
        let id = created["id"].as_str().unwrap().to_string();

        let (status, updated) = call(
            &app,
            json_req(
                "PUT",
                &format!("/admin/accounts/{id}"),
                serde_json::json!({"dailyQuota": 10}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["dailyQuota"], 10);

        let (status, body) = call(
            &app,
            json_req(
                "PATCH",
                "/admin/config",
                serde_json::json!({"retryCount": 0}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["type"], "config");

        let mut weights = serde_json::Map::new();
        weights.insert(id.clone(), 3.into());
        let (status, body) = call(
            &app,
            json_req(
                "PATCH",
                "/admin/config",
                serde_json::json!({
                    "strategy": "weighted",
                    "weights": weights,
                    "upsertMappings": [
                        {"requestModel": "chat", "providerId": "openai", "upstreamModel": "gpt-4o"}
                    ]
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["live"]["strategy"], "weighted");
        assert_eq!(body["live"]["weights"][&id], 3);

        let (status, _) = call(
            &app,
            Request::delete(format!("/admin/accounts/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (_, list) = call(
            &app,
            Request::get("/admin/accounts").body(Body::empty()).unwrap(),
        )
        .await;
        assert!(list.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn provider_client_secret_is_masked() {
        let engine = Arc::new(Engine::with_parts(
            Config::default(),
            Arc::new(ScriptedUpstream::default()),
            Arc::new(MockEndpoint::new(false)),
        ));
        let app = router(engine.clone());
        let oauth = serde_json::json!({
            "authUrl": "https://auth.corp.test/authorize",
            "tokenUrl": "https://auth.corp.test/token",
            "clientId": "cid",
            "clientSecret": "cs-top-secret",
        });

        let (status, created) = call(
            &app,
            json_req(
                "POST",
                "/admin/providers",
                serde_json::json!({
                    "id": "corp",
                    "name": "Corp",
                    "authType": "oauth",
                    "baseUrl": "https://llm.corp.test/v1",
                    "oauth": oauth,
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["oauth"]["clientSecret"], REDACTED_SECRET);

        let (status, list) = call(
            &app,
            Request::get("/admin/providers").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(!list.to_string().contains("cs-top-secret"));

        // 原样回传掩码不会覆盖真实的 secret。
        let mut masked = oauth.clone();
        masked["clientSecret"] = serde_json::json!(REDACTED_SECRET);
        masked["clientId"] = serde_json::json!("cid-2");
        let (status, updated) = call(
            &app,
            json_req(
                "PUT",
                "/admin/providers/corp",
                serde_json::json!({"oauth": masked}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(!updated.to_string().contains("cs-top-secret"));

        let stored = engine.pool.get_provider("corp").await.unwrap();
        let settings = stored.oauth.unwrap();
        assert_eq!(settings.client_id, "cid-2");
        assert_eq!(settings.client_secret, "cs-top-secret");
    }

    #[tokio::test]
    async fn logs_export_as_csv() {
        let app = app("");
        let (status, _) = call(
            &app,
            json_req(
                "PATCH",
                "/admin/config",
                serde_json::json!({"timeoutMs": 5000}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let resp = app
            .clone()
            .oneshot(
                Request::get("/admin/logs/export?format=csv")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(
            resp.headers()[header::CONTENT_TYPE]
                .to_str()
                .unwrap()
                .starts_with("text/csv")
        );
        let bytes = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.starts_with("timestamp,level,message,account,provider,request_id\r\n"));
        assert!(text.contains("config_updated") || text.contains("配置已更新"));

        let (status, stats) = call(
            &app,
            Request::get("/admin/logs/stats").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stats["total"], 1);
        assert_eq!(stats["info"], 1);
    }
}
