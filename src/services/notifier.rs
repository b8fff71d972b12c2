use async_trait::async_trait;

use crate::models::Purpose;

/// 認証コードの配送に失敗した
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct NotifierError(pub String);

/// 認証コードの配送手段（メール・SMS など）
///
/// コード平文を受け取る唯一の経路。戻り値が Ok でも到達は保証されない。
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, identity: &str, purpose: Purpose, code: &str)
    -> Result<(), NotifierError>;
}

/// ログ出力のみの通知（開発環境用）
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(
        &self,
        identity: &str,
        purpose: Purpose,
        code: &str,
    ) -> Result<(), NotifierError> {
        tracing::info!(identity = %identity, purpose = %purpose, "認証コード送信（開発モード）");
        tracing::debug!("認証コード: {}", code);
        Ok(())
    }
}

/// 送信内容を記録する通知（テスト用）
#[cfg(test)]
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: std::sync::Mutex<Vec<(String, Purpose, String)>>,
    fail: std::sync::atomic::AtomicBool,
    delay_ms: std::sync::atomic::AtomicU64,
}

#[cfg(test)]
impl RecordingNotifier {
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    /// 送信完了までの遅延（遅いメールサーバーの再現）
    pub fn set_delay(&self, delay: std::time::Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.delay_ms.store(millis, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn last_code(&self) -> Option<String> {
        self.sent.lock().unwrap().last().map(|(_, _, c)| c.clone())
    }

    pub fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[cfg(test)]
#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(
        &self,
        identity: &str,
        purpose: Purpose,
        code: &str,
    ) -> Result<(), NotifierError> {
        let delay_ms = self.delay_ms.load(std::sync::atomic::Ordering::SeqCst);
        if delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
        }
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(NotifierError("mail server unavailable".to_string()));
        }
        self.sent
            .lock()
            .unwrap()
            .push((identity.to_string(), purpose, code.to_string()));
        Ok(())
    }
}
