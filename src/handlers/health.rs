use axum::{Json, extract::State};
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    /// クライアントのカウントダウン初期値の目安
    pub otp_ttl_seconds: i64,
    pub otp_max_resends: i32,
}

/// GET /api/health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let policy = state.challenge_manager.policy();
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        otp_ttl_seconds: policy.ttl.whole_seconds(),
        otp_max_resends: policy.max_resends,
    })
}
