use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("バリデーションエラー: {0}")]
    Validation(String),

    #[error("データベースエラー")]
    Database(#[from] sqlx::Error),

    #[error("内部エラー")]
    Internal(#[from] anyhow::Error),

    #[error("このメールアドレスは既に使用されています")]
    EmailAlreadyExists,

    #[error("アカウントが見つかりません")]
    IdentityNotFound,

    #[error("このメールアドレスは既に認証済みです")]
    AlreadyVerified,

    #[error("認証チャレンジが見つかりません")]
    NoChallenge,

    #[error("有効な認証チャレンジがありません")]
    NoActiveChallenge,

    #[error("認証コードの有効期限が切れています")]
    Expired,

    #[error("認証コードが一致しません")]
    Mismatch,

    #[error("認証コードの形式が不正です")]
    MalformedInput,

    #[error("再送回数の上限に達しました")]
    ResendLimitExceeded,

    #[error("認証コードの送信に失敗しました: {0}")]
    NotifierFailure(String),

    #[error("同時更新が競合しました")]
    StoreConflict,
}

impl AppError {
    /// クライアントが分岐に使う機械可読なエラーコード
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Database(_) | Self::Internal(_) => "internal",
            Self::EmailAlreadyExists => "email_already_exists",
            Self::IdentityNotFound => "identity_not_found",
            Self::AlreadyVerified => "already_verified",
            Self::NoChallenge => "no_challenge",
            Self::NoActiveChallenge => "no_active_challenge",
            Self::Expired => "expired",
            Self::Mismatch => "mismatch",
            Self::MalformedInput => "malformed_input",
            Self::ResendLimitExceeded => "resend_limit_exceeded",
            Self::NotifierFailure(_) => "notifier_failure",
            Self::StoreConflict => "store_conflict",
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: &'static str,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Self::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            Self::Database(e) => {
                tracing::error!(error = ?e, "データベースエラー");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "内部エラーが発生しました".to_string(),
                )
            }
            Self::Internal(e) => {
                tracing::error!(error = ?e, "内部エラー");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "内部エラーが発生しました".to_string(),
                )
            }
            Self::EmailAlreadyExists => (
                StatusCode::CONFLICT,
                "このメールアドレスは既に使用されています".to_string(),
            ),
            Self::IdentityNotFound => (
                StatusCode::NOT_FOUND,
                "このメールアドレスのアカウントは登録されていません".to_string(),
            ),
            Self::AlreadyVerified => (
                StatusCode::CONFLICT,
                "このメールアドレスは既に認証済みです。ログインしてください".to_string(),
            ),
            Self::NoChallenge => (
                StatusCode::NOT_FOUND,
                "有効な認証コードがありません。認証コードを再発行してください".to_string(),
            ),
            Self::NoActiveChallenge => (
                StatusCode::NOT_FOUND,
                "再送できる認証コードがありません。最初からやり直してください".to_string(),
            ),
            Self::Expired => (
                StatusCode::GONE,
                "認証コードの有効期限が切れました。再送してください".to_string(),
            ),
            Self::Mismatch => (
                StatusCode::UNAUTHORIZED,
                "認証コードが正しくありません。もう一度入力してください".to_string(),
            ),
            Self::MalformedInput => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "認証コードは数字で入力してください".to_string(),
            ),
            Self::ResendLimitExceeded => (
                StatusCode::TOO_MANY_REQUESTS,
                "再送回数の上限に達しました。最初からやり直してください".to_string(),
            ),
            Self::NotifierFailure(e) => {
                tracing::error!(error = %e, "認証コード送信エラー");
                (
                    StatusCode::BAD_GATEWAY,
                    "認証コードを送信できませんでした。時間をおいて再度お試しください".to_string(),
                )
            }
            Self::StoreConflict => (
                StatusCode::CONFLICT,
                "リクエストが競合しました。もう一度お試しください".to_string(),
            ),
        };

        let code = self.code();
        (
            status,
            Json(ErrorResponse {
                error: message,
                code,
            }),
        )
            .into_response()
    }
}
