use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::client::api::{ClientError, ErrorCode, VerificationClient};
use crate::client::countdown::{Countdown, CountdownSnapshot, CountdownTimer};
use crate::models::Purpose;

const TICK_PERIOD: Duration = Duration::from_secs(1);

/// 1つの (identity, purpose) に対する認証フロー
///
/// API 呼び出しの結果をカウントダウンへ反映する。発行・再送・検証が
/// タイムアウトした場合は結果が不明なので、状態 API で読み直してから
/// `ClientError::Timeout` を返す。
pub struct VerificationSession {
    client: VerificationClient,
    identity: String,
    purpose: Purpose,
    timeout: Duration,
    timer: CountdownTimer,
}

impl VerificationSession {
    pub fn new(
        client: VerificationClient,
        identity: impl Into<String>,
        purpose: Purpose,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            identity: identity.into(),
            purpose,
            timeout,
            timer: CountdownTimer::start(Countdown::new(), TICK_PERIOD),
        }
    }

    pub async fn issue(&self) -> Result<CountdownSnapshot, ClientError> {
        match self
            .client
            .issue(&self.identity, self.purpose, self.timeout)
            .await
        {
            Ok(issued) => Ok(self
                .timer
                .update(|c| {
                    c.on_issued(
                        issued.ttl_seconds,
                        issued.resend_count,
                        issued.max_resends,
                        Instant::now(),
                    )
                })
                .await),
            Err(ClientError::Timeout) => self.recover_from_timeout("issue").await,
            Err(e) => Err(e),
        }
    }

    pub async fn resend(&self) -> Result<CountdownSnapshot, ClientError> {
        match self
            .client
            .resend(&self.identity, self.purpose, self.timeout)
            .await
        {
            Ok(resent) => Ok(self
                .timer
                .update(|c| {
                    c.on_resent(
                        resent.ttl_seconds,
                        resent.resend_count,
                        resent.max_resends,
                        Instant::now(),
                    )
                })
                .await),
            Err(ClientError::Timeout) => self.recover_from_timeout("resend").await,
            Err(e) => {
                if e.server_code() == Some(ErrorCode::ResendLimitExceeded) {
                    self.timer.update(|c| c.on_resend_limit()).await;
                }
                Err(e)
            }
        }
    }

    /// コードを検証
    ///
    /// ローカルのカウントダウンが0秒でも必ずサーバーに問い合わせる。
    pub async fn validate(&self, code: &str) -> Result<CountdownSnapshot, ClientError> {
        match self
            .client
            .validate(&self.identity, self.purpose, code, self.timeout)
            .await
        {
            Ok(()) => Ok(self.timer.update(|c| c.on_verified()).await),
            Err(ClientError::Timeout) => self.recover_from_timeout("validate").await,
            Err(e) => {
                let Some(code) = e.server_code() else {
                    return Err(e);
                };
                let mut stale = false;
                self.timer.update(|c| stale = c.on_validate_error(code)).await;
                if stale {
                    // ローカルでは0秒だがサーバー側ではまだ有効
                    if let Err(resync) = self.resync().await {
                        tracing::warn!(
                            error = %resync,
                            identity = %self.identity,
                            "状態の再取得に失敗"
                        );
                    }
                }
                Err(e)
            }
        }
    }

    /// サーバーの状態でカウントダウンを合わせ直す
    pub async fn resync(&self) -> Result<CountdownSnapshot, ClientError> {
        let status = self
            .client
            .status(&self.identity, self.purpose, self.timeout)
            .await?;
        Ok(self
            .timer
            .update(|c| c.resync(&status, Instant::now()))
            .await)
    }

    /// 画面の表示状態が変わった
    ///
    /// 前面に戻ったときは経過 tick を信用せず、まず期限時刻から、
    /// 続けてサーバーの状態から残り秒数を計算し直す。
    pub async fn on_visibility_change(&self, visible: bool) -> CountdownSnapshot {
        if !visible {
            return self.timer.snapshot().await;
        }

        let local = self
            .timer
            .update(|c| c.resync_with_deadline(Instant::now()))
            .await;
        match self.resync().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    identity = %self.identity,
                    "状態の再取得に失敗（ローカルの期限で継続）"
                );
                local
            }
        }
    }

    pub async fn snapshot(&self) -> CountdownSnapshot {
        self.timer.snapshot().await
    }

    pub fn subscribe(&self) -> watch::Receiver<CountdownSnapshot> {
        self.timer.subscribe()
    }

    /// フローを閉じる（タイマー停止）
    pub fn close(self) {
        self.timer.cancel();
    }

    async fn recover_from_timeout(
        &self,
        operation: &str,
    ) -> Result<CountdownSnapshot, ClientError> {
        tracing::warn!(
            operation = %operation,
            identity = %self.identity,
            "タイムアウト（状態を再取得）"
        );
        if let Err(e) = self.resync().await {
            tracing::warn!(error = %e, operation = %operation, "状態の再取得に失敗");
        }
        Err(ClientError::Timeout)
    }
}
