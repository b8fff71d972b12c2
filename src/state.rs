use std::sync::Arc;

use secrecy::ExposeSecret;

use crate::config::Config;
use crate::error::AppError;
use crate::repositories::IdentityStore;
use crate::services::{
    ChallengeManager, CodeHasher, LogNotifier, Notifier, OsRngCodeGenerator, SystemClock,
};

/// アプリケーション共有状態
///
/// axum の State として全ハンドラーで共有される。
/// Clone は必須（axum が内部で clone するため）。
#[derive(Clone)]
pub struct AppState {
    /// アカウント・チャレンジの永続化
    pub store: Arc<dyn IdentityStore>,
    /// 認証コードの発行・再送・検証
    pub challenge_manager: ChallengeManager,
}

impl AppState {
    /// ストアと設定から AppState を作成
    pub fn new(store: Arc<dyn IdentityStore>, config: &Config) -> Result<Self, AppError> {
        let notifier = build_notifier(config)?;
        let hasher = CodeHasher::from_base64(config.otp_hash_key.expose_secret())?;

        let challenge_manager = ChallengeManager::new(
            store.clone(),
            notifier,
            Arc::new(SystemClock),
            Arc::new(OsRngCodeGenerator),
            hasher,
            config.otp_policy(),
        );

        Ok(Self::from_parts(store, challenge_manager))
    }

    /// 構築済みの部品から作成
    pub fn from_parts(store: Arc<dyn IdentityStore>, challenge_manager: ChallengeManager) -> Self {
        Self {
            store,
            challenge_manager,
        }
    }
}

/// 通知手段を選択（SMTP設定があればメール、なければログ出力）
#[cfg(feature = "email")]
fn build_notifier(config: &Config) -> Result<Arc<dyn Notifier>, AppError> {
    match crate::services::SmtpNotifier::from_config(config)? {
        Some(smtp) => {
            tracing::info!("SMTP 通知を初期化");
            Ok(Arc::new(smtp))
        }
        None => {
            tracing::info!("SMTP 未設定（ログ出力で代替）");
            Ok(Arc::new(LogNotifier))
        }
    }
}

#[cfg(not(feature = "email"))]
fn build_notifier(config: &Config) -> Result<Arc<dyn Notifier>, AppError> {
    if config.smtp_host.is_some() {
        tracing::warn!("SMTP 設定がありますが email 機能が無効です（ログ出力で代替）");
    }
    Ok(Arc::new(LogNotifier))
}
