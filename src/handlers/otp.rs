use axum::{
    Json,
    extract::{Query, State},
};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::models::Purpose;
use crate::services::{ChallengeStatus, IssuedChallenge, ResentChallenge};
use crate::state::AppState;

// === 発行・再送 ===

#[derive(Debug, Deserialize)]
pub struct ChallengeRequest {
    pub identity: String,
    pub purpose: Purpose,
}

/// POST /api/otp/issue
///
/// 認証コードを発行してメール送信する
///
/// # Security
/// - コード平文はレスポンスに含めない
pub async fn issue_challenge(
    State(state): State<AppState>,
    Json(request): Json<ChallengeRequest>,
) -> Result<Json<IssuedChallenge>, AppError> {
    validate_identity(&request.identity)?;

    let issued = state
        .challenge_manager
        .issue(&request.identity, request.purpose)
        .await?;

    Ok(Json(issued))
}

/// POST /api/otp/resend
///
/// 認証コードを再送する（再送回数の上限まで）
pub async fn resend_challenge(
    State(state): State<AppState>,
    Json(request): Json<ChallengeRequest>,
) -> Result<Json<ResentChallenge>, AppError> {
    validate_identity(&request.identity)?;

    let resent = state
        .challenge_manager
        .resend(&request.identity, request.purpose)
        .await?;

    Ok(Json(resent))
}

// === 検証 ===

#[derive(Debug, Deserialize)]
pub struct ValidateRequest {
    pub identity: String,
    pub purpose: Purpose,
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct ValidateResponse {
    pub verified: bool,
}

/// POST /api/otp/validate
///
/// # Security
/// - コードはログ出力禁止
/// - コード形式の検証は期限切れ判定の後に行うため、ここでは行わない
pub async fn validate_challenge(
    State(state): State<AppState>,
    Json(request): Json<ValidateRequest>,
) -> Result<Json<ValidateResponse>, AppError> {
    validate_identity(&request.identity)?;

    state
        .challenge_manager
        .validate(&request.identity, request.purpose, &request.code)
        .await?;

    Ok(Json(ValidateResponse { verified: true }))
}

// === 状態取得 ===

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub identity: String,
    pub purpose: Purpose,
}

/// GET /api/otp/status
///
/// クライアントのカウントダウン再同期用
pub async fn challenge_status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<ChallengeStatus>, AppError> {
    validate_identity(&query.identity)?;

    let status = state
        .challenge_manager
        .status(&query.identity, query.purpose)
        .await?;

    Ok(Json(status))
}

/// メールアドレスの必須チェック（形式は ChallengeManager で検証）
fn validate_identity(identity: &str) -> Result<(), AppError> {
    if identity.trim().is_empty() {
        return Err(AppError::Validation("メールアドレスは必須です".to_string()));
    }
    Ok(())
}
