//! 代理监听器的生命周期：start / stop / status。
//!
//! 监听地址取自启动时刻的 `BindingSettings`；修改 host/port 需要一次 stop/start 才生效。

use crate::error::GatewayError;
use crate::gateway::Gateway;
use crate::gateway::handler;
use crate::runtime_config::BindingSettings;
use anyhow::Context;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyStatus {
    pub running: bool,
    pub port: Option<u16>,
    /// 运行时长（秒）。
    pub uptime: u64,
}

struct Running {
    binding: BindingSettings,
    started_at: Instant,
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

pub struct ProxyServer {
    gateway: Arc<Gateway>,
    running: Mutex<Option<Running>>,
}

impl ProxyServer {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self {
            gateway,
            running: Mutex::new(None),
        }
    }

    /// 启动代理监听；已在运行时返回 `Ok(false)`。
    pub async fn start(&self, port: Option<u16>) -> Result<bool, GatewayError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(false);
        }

        let mut binding = (*self.gateway.settings.binding()).clone();
        if let Some(port) = port {
            binding.port = port;
        }
        let addr = binding.socket_addr()?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("绑定代理端口 {addr} 失败"))?;
        // 端口为 0 时以实际分配的端口为准。
        if let Ok(local) = listener.local_addr() {
            binding.port = local.port();
        }

        let app = handler::router(self.gateway.clone());
        let (tx, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let shutdown = async {
                let _ = rx.await;
            };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                tracing::error!("代理服务异常退出: {e}");
            }
        });

        tracing::info!("代理服务已启动：http://{}:{}", binding.host, binding.port);
        *running = Some(Running {
            binding,
            started_at: Instant::now(),
            shutdown: tx,
            handle,
        });
        Ok(true)
    }

    /// 停止代理监听并等待在途连接处理完毕；未运行时返回 false。
    pub async fn stop(&self) -> bool {
        let Some(r) = self.running.lock().await.take() else {
            return false;
        };
        let _ = r.shutdown.send(());
        if let Err(e) = r.handle.await {
            tracing::warn!("等待代理服务退出失败: {e}");
        }
        tracing::info!("代理服务已停止（端口 {}）", r.binding.port);
        true
    }

    pub async fn status(&self) -> ProxyStatus {
        match self.running.lock().await.as_ref() {
            Some(r) => ProxyStatus {
                running: true,
                port: Some(r.binding.port),
                uptime: r.started_at.elapsed().as_secs(),
            },
            None => ProxyStatus {
                running: false,
                port: None,
                uptime: 0,
            },
        }
    }

    /// 当前生效的监听设置（未运行时为 None）。
    pub async fn running_binding(&self) -> Option<BindingSettings> {
        self.running.lock().await.as_ref().map(|r| r.binding.clone())
    }
}
