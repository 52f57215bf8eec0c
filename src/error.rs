use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// 网关对外暴露的错误分类。
///
/// `NoEligibleAccount` 与 `UpstreamExhausted` 必须保持区分：前者表示“没有可用账号”，
/// 后者表示“所有候选账号都试过且失败”。
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("模型不受支持: {0}")]
    ModelNotSupported(String),

    #[error("没有可用的账号（provider: {0}）")]
    NoEligibleAccount(String),

    #[error("账号 {0} 的凭证已过期")]
    CredentialExpired(String),

    #[error("账号 {account_id} 刷新凭证失败: {message}")]
    RefreshFailed { account_id: String, message: String },

    #[error("上游传输错误: {0}")]
    UpstreamTransport(String),

    #[error("所有候选账号均请求失败（已尝试: {}）: {last_error}", .attempted.join(", "))]
    UpstreamExhausted {
        attempted: Vec<String>,
        last_error: String,
    },

    #[error("配置错误: {0}")]
    Config(String),

    #[error("未找到: {0}")]
    NotFound(String),

    #[error("参数错误: {0}")]
    BadRequest(String),

    #[error("未授权: {0}")]
    Unauthorized(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorBodyInner,
}

#[derive(Debug, Serialize)]
struct ErrorBodyInner {
    message: String,
    r#type: &'static str,
}

impl GatewayError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    /// 稳定的机器可读类型名（用于响应体与日志检索）。
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ModelNotSupported(_) => "model_not_supported",
            Self::NoEligibleAccount(_) => "no_eligible_account",
            Self::CredentialExpired(_) => "credential_expired",
            Self::RefreshFailed { .. } => "refresh_failed",
            Self::UpstreamTransport(_) => "upstream_transport_error",
            Self::UpstreamExhausted { .. } => "upstream_exhausted",
            Self::Config(_) => "config",
            Self::NotFound(_) => "not_found",
            Self::BadRequest(_) => "bad_request",
            Self::Unauthorized(_) => "unauthorized",
            Self::Internal(_) => "internal",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::ModelNotSupported(_) | Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::NoEligibleAccount(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::CredentialExpired(_) | Self::RefreshFailed { .. } | Self::Unauthorized(_) => {
                StatusCode::UNAUTHORIZED
            }
            Self::UpstreamTransport(_) | Self::UpstreamExhausted { .. } => StatusCode::BAD_GATEWAY,
            Self::Config(_) | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorBody {
            error: ErrorBodyInner {
                message: format!("{self:#}"),
                r#type: self.kind(),
            },
        };
        (status, Json(body)).into_response()
    }
}
