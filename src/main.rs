pub mod balancer;
pub mod config;
pub mod credential;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod pool;
pub mod runtime_config;
pub mod server;
pub mod stats;
pub mod upstream;
pub mod util;

use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::Config::load();
    logging::init_tracing(cfg.log_level(), cfg.log_json);

    let engine = Arc::new(engine::Engine::new(cfg.clone()).context("初始化引擎失败")?);
    engine.load().await.context("加载持久化数据失败")?;

    let accounts = engine.pool.list_accounts().await.len();
    let providers = engine.pool.list_providers().await.len();
    tracing::info!("已加载 {providers} 个 provider、{accounts} 个账号");

    // 后台任务：滚动窗口配额重置、OAuth 令牌主动刷新。
    pool::refresher::spawn_quota_reset_task(engine.pool.clone());
    credential::refresh_task::spawn_token_refresh_task(
        engine.vault.clone(),
        engine.pool.clone(),
        engine.tokens.clone(),
    );

    // 代理端口被占用时不阻塞控制面，可稍后通过 /admin/proxy/start 重试。
    if cfg.autostart
        && let Err(e) = engine.proxy_start(None).await
    {
        tracing::error!("代理服务启动失败：{e:#}");
    }

    let addr: SocketAddr = format!("{}:{}", cfg.admin_host, cfg.admin_port)
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], cfg.admin_port)));
    if cfg.admin_key.trim().is_empty() {
        tracing::warn!("未设置 ADMIN_KEY，控制面接口无需鉴权");
    }
    tracing::info!("控制面监听 http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("绑定控制面端口失败")?;
    axum::serve(listener, gateway::manager::router(engine.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("控制面服务异常退出")?;

    engine.proxy_stop().await;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("收到退出信号，准备关闭服务...");
}
