use axum::{Json, extract::State};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::models::Purpose;
use crate::services::auth::hash_password;
use crate::services::normalize_identity;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetPasswordRequest {
    pub email: String,
    pub code: String,
    pub new_password: String,
}

#[derive(Debug, Serialize)]
pub struct ResetPasswordResponse {
    pub message: String,
}

/// POST /api/password/reset
///
/// パスワードリセット用の認証コードを検証し、パスワードを更新する。
/// コードの発行・再送は /api/otp/issue, /api/otp/resend（purpose = password_reset）で行う。
///
/// # Security
/// - code, new_password はログに出力しない
pub async fn reset_password(
    State(state): State<AppState>,
    Json(request): Json<ResetPasswordRequest>,
) -> Result<Json<ResetPasswordResponse>, AppError> {
    // バリデーション
    validate_reset_password_request(&request)?;
    let email = normalize_identity(&request.email)?;

    // 先にハッシュ化しておき、コード消費後に失敗しないようにする
    let password_hash = hash_password(&request.new_password)?;

    // 認証コード検証（成功時にチャレンジは使用済みになる）
    state
        .challenge_manager
        .validate(&email, Purpose::PasswordReset, &request.code)
        .await?;

    // パスワードを更新
    state.store.update_password(&email, &password_hash).await?;

    tracing::info!(email = %email, "パスワードリセット完了");

    Ok(Json(ResetPasswordResponse {
        message: "パスワードが更新されました".to_string(),
    }))
}

/// リセットパスワードリクエストのバリデーション
fn validate_reset_password_request(request: &ResetPasswordRequest) -> Result<(), AppError> {
    if request.email.trim().is_empty() {
        return Err(AppError::Validation("メールアドレスは必須です".to_string()));
    }
    if request.new_password.len() < 8 {
        return Err(AppError::Validation(
            "パスワードは8文字以上で入力してください".to_string(),
        ));
    }
    Ok(())
}
