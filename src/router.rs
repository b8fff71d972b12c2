use axum::{
    Router,
    routing::{get, post},
};
use http::{HeaderValue, Method, header};
use tower_http::cors::CorsLayer;

use crate::error::AppError;
use crate::handlers;
use crate::state::AppState;

/// Router の構築
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(handlers::health_check))
        // 認証コード
        .route("/api/otp/issue", post(handlers::issue_challenge))
        .route("/api/otp/resend", post(handlers::resend_challenge))
        .route("/api/otp/validate", post(handlers::validate_challenge))
        .route("/api/otp/status", get(handlers::challenge_status))
        // ユーザー管理
        .route("/api/register", post(handlers::register))
        .route("/api/password/reset", post(handlers::reset_password))
        .with_state(state)
}

/// フロントエンドのオリジンを許可する CORS レイヤー
pub fn cors_layer(allowed_origin: &str) -> Result<CorsLayer, AppError> {
    let origin = allowed_origin.parse::<HeaderValue>().map_err(|e| {
        tracing::error!(error = ?e, origin = %allowed_origin, "CORSオリジンのパースに失敗");
        AppError::Internal(anyhow::anyhow!("invalid cors origin"))
    })?;

    Ok(CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]))
}
