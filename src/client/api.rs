use std::time::Duration;

use reqwest::{Response, Url};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;

use crate::models::Purpose;
use crate::services::{ChallengeStatus, IssuedChallenge, ResentChallenge};

/// サーバーが返すエラーコード（`AppError::code` と対応）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Validation,
    Internal,
    EmailAlreadyExists,
    IdentityNotFound,
    AlreadyVerified,
    NoChallenge,
    NoActiveChallenge,
    Expired,
    Mismatch,
    MalformedInput,
    ResendLimitExceeded,
    NotifierFailure,
    StoreConflict,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Error)]
pub enum ClientError {
    /// 応答が時間内に返らなかった（サーバー側で処理済みの可能性がある）
    #[error("request timed out, outcome unknown")]
    Timeout,

    #[error("server returned {status} ({code:?}): {message}")]
    Server {
        status: u16,
        code: ErrorCode,
        message: String,
    },

    #[error("transport error: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("invalid url: {0}")]
    InvalidUrl(String),
}

impl ClientError {
    /// サーバーが返したエラーコード
    pub fn server_code(&self) -> Option<ErrorCode> {
        match self {
            Self::Server { code, .. } => Some(*code),
            _ => None,
        }
    }

    fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else {
            Self::Transport(e)
        }
    }
}

#[derive(Debug, Serialize)]
struct ChallengeBody<'a> {
    identity: &'a str,
    purpose: Purpose,
}

#[derive(Debug, Serialize)]
struct ValidateBody<'a> {
    identity: &'a str,
    purpose: Purpose,
    code: &'a str,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    code: ErrorCode,
}

/// 認証コード API クライアント
///
/// すべての呼び出しで呼び出し側がタイムアウトを指定する。
/// タイムアウトは成功とも失敗とも扱わず `ClientError::Timeout` を返す。
#[derive(Clone)]
pub struct VerificationClient {
    client: reqwest::Client,
    base_url: String,
}

impl VerificationClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub async fn issue(
        &self,
        identity: &str,
        purpose: Purpose,
        timeout: Duration,
    ) -> Result<IssuedChallenge, ClientError> {
        let response = self
            .client
            .post(format!("{}/api/otp/issue", self.base_url))
            .json(&ChallengeBody { identity, purpose })
            .timeout(timeout)
            .send()
            .await
            .map_err(ClientError::from_reqwest)?;

        parse(response).await
    }

    pub async fn resend(
        &self,
        identity: &str,
        purpose: Purpose,
        timeout: Duration,
    ) -> Result<ResentChallenge, ClientError> {
        let response = self
            .client
            .post(format!("{}/api/otp/resend", self.base_url))
            .json(&ChallengeBody { identity, purpose })
            .timeout(timeout)
            .send()
            .await
            .map_err(ClientError::from_reqwest)?;

        parse(response).await
    }

    /// コードを検証（成功時のみ Ok）
    pub async fn validate(
        &self,
        identity: &str,
        purpose: Purpose,
        code: &str,
        timeout: Duration,
    ) -> Result<(), ClientError> {
        let response = self
            .client
            .post(format!("{}/api/otp/validate", self.base_url))
            .json(&ValidateBody {
                identity,
                purpose,
                code,
            })
            .timeout(timeout)
            .send()
            .await
            .map_err(ClientError::from_reqwest)?;

        #[derive(Deserialize)]
        struct Verified {
            verified: bool,
        }

        let body: Verified = parse(response).await?;
        if !body.verified {
            tracing::warn!("検証レスポンスが verified=false");
        }
        Ok(())
    }

    pub async fn status(
        &self,
        identity: &str,
        purpose: Purpose,
        timeout: Duration,
    ) -> Result<ChallengeStatus, ClientError> {
        let url = Url::parse_with_params(
            &format!("{}/api/otp/status", self.base_url),
            &[("identity", identity), ("purpose", purpose.as_str())],
        )
        .map_err(|e| ClientError::InvalidUrl(e.to_string()))?;

        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(ClientError::from_reqwest)?;

        parse(response).await
    }
}

/// 成功レスポンスを T として、失敗レスポンスを `ClientError::Server` として読む
async fn parse<T: DeserializeOwned>(response: Response) -> Result<T, ClientError> {
    let status = response.status();

    if !status.is_success() {
        let (code, message) = match response.json::<ErrorBody>().await {
            Ok(body) => (body.code, body.error),
            Err(e) if e.is_timeout() => return Err(ClientError::Timeout),
            Err(e) => {
                tracing::debug!(error = ?e, status = %status, "エラーレスポンスのパースに失敗");
                (ErrorCode::Unknown, String::new())
            }
        };
        return Err(ClientError::Server {
            status: status.as_u16(),
            code,
            message,
        });
    }

    response.json().await.map_err(ClientError::from_reqwest)
}
