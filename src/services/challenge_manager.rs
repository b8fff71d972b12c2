use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::config::OtpPolicy;
use crate::error::AppError;
use crate::models::{ChallengeState, Purpose, VerificationChallenge};
use crate::repositories::IdentityStore;
use crate::services::clock::Clock;
use crate::services::code::{CodeGenerator, CodeHasher};
use crate::services::notifier::Notifier;

/// 競合時の最大試行回数（初回 + 再試行1回）
const MAX_WRITE_ATTEMPTS: usize = 2;

/// 発行結果（コード平文は含まない）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedChallenge {
    pub challenge_ref: Uuid,
    pub ttl_seconds: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    pub resend_count: i32,
    pub max_resends: i32,
}

/// 再送結果
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResentChallenge {
    pub ttl_seconds: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    pub resend_count: i32,
    pub max_resends: i32,
}

/// チャレンジの現在状態
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeStatus {
    pub state: ChallengeState,
    pub expires_in_seconds: i64,
    pub resend_count: i32,
    pub max_resends: i32,
}

/// 認証コードの発行・再送・検証を行う
///
/// チャレンジの書き込みはすべてここを通る。発行以外の書き込みは
/// version 条件付きで行い、競合した場合は1回だけ読み直して再試行する。
#[derive(Clone)]
pub struct ChallengeManager {
    store: Arc<dyn IdentityStore>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    generator: Arc<dyn CodeGenerator>,
    hasher: CodeHasher,
    policy: OtpPolicy,
}

impl ChallengeManager {
    pub fn new(
        store: Arc<dyn IdentityStore>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        generator: Arc<dyn CodeGenerator>,
        hasher: CodeHasher,
        policy: OtpPolicy,
    ) -> Self {
        Self {
            store,
            notifier,
            clock,
            generator,
            hasher,
            policy,
        }
    }

    pub fn policy(&self) -> &OtpPolicy {
        &self.policy
    }

    /// 認証コードを発行
    ///
    /// 既存のチャレンジは（使用済みも含めて）置き換えられ、再送回数は 0 に戻る。
    ///
    /// # Errors
    /// - `IdentityNotFound`: パスワードリセットで認証済みアカウントがない
    /// - `AlreadyVerified`: サインアップ認証で既に認証済み
    /// - `NotifierFailure`: 送信失敗（発行前のチャレンジに戻す）
    pub async fn issue(
        &self,
        identity: &str,
        purpose: Purpose,
    ) -> Result<IssuedChallenge, AppError> {
        let identity = normalize_identity(identity)?;
        self.check_eligibility(&identity, purpose).await?;

        let previous = self.store.find_challenge(&identity, purpose).await?;
        let code = self.generator.generate(self.policy.code_length);
        let challenge = VerificationChallenge::issue(
            &identity,
            purpose,
            self.hasher.hash(&identity, purpose, &code),
            self.clock.now(),
            self.policy.ttl,
            self.policy.max_resends,
        );
        let stored = self.store.put_challenge(&challenge).await?;

        if let Err(e) = self.notifier.send(&identity, purpose, &code).await {
            tracing::error!(
                error = %e,
                identity = %identity,
                purpose = %purpose,
                "認証コード送信失敗（発行を取り消し）"
            );
            self.rollback_issue(&identity, purpose, previous, &stored).await;
            return Err(AppError::NotifierFailure(e.to_string()));
        }

        tracing::info!(identity = %identity, purpose = %purpose, "認証コード発行");

        Ok(IssuedChallenge {
            challenge_ref: stored.id,
            ttl_seconds: self.policy.ttl.whole_seconds(),
            expires_at: stored.expires_at,
            resend_count: stored.resend_count,
            max_resends: stored.max_resends,
        })
    }

    /// 認証コードを再送
    ///
    /// 現在のコードが有効期限内でも再送できる。旧コードは即座に無効になる。
    ///
    /// # Errors
    /// - `NoActiveChallenge`: チャレンジがない、または使用済み
    /// - `ResendLimitExceeded`: 再送回数の上限（状態は変更しない）
    /// - `NotifierFailure`: 送信失敗（再送前の状態に戻す）
    pub async fn resend(
        &self,
        identity: &str,
        purpose: Purpose,
    ) -> Result<ResentChallenge, AppError> {
        let identity = normalize_identity(identity)?;
        let identity = identity.as_str();

        retry_on_conflict("resend", move || self.try_resend(identity, purpose)).await
    }

    /// 認証コードを検証
    ///
    /// 成功時はチャレンジを使用済みにする。サインアップ認証ではアカウントも認証済みにする。
    /// 検証で有効期限が延びることはなく、再送回数も変わらない。
    pub async fn validate(
        &self,
        identity: &str,
        purpose: Purpose,
        code: &str,
    ) -> Result<(), AppError> {
        let identity = normalize_identity(identity)?;
        let identity = identity.as_str();

        retry_on_conflict("validate", move || self.try_validate(identity, purpose, code)).await?;

        if purpose == Purpose::SignupVerification {
            self.store.mark_email_verified(identity).await?;
        }

        Ok(())
    }

    /// チャレンジの状態を取得（クライアントの再同期用）
    pub async fn status(
        &self,
        identity: &str,
        purpose: Purpose,
    ) -> Result<ChallengeStatus, AppError> {
        let identity = normalize_identity(identity)?;
        let challenge = self
            .store
            .find_challenge(&identity, purpose)
            .await?
            .ok_or(AppError::NoChallenge)?;

        let now = self.clock.now();
        Ok(ChallengeStatus {
            state: challenge.state(now),
            expires_in_seconds: if challenge.is_usable(now) {
                challenge.expires_in(now)
            } else {
                0
            },
            resend_count: challenge.resend_count,
            max_resends: challenge.max_resends,
        })
    }

    /// 発行前の状態に戻す
    ///
    /// 以前のチャレンジがあればそれを書き戻し（旧コードはその期限まで有効）、
    /// なければ今回のレコードを削除する。どちらも version 条件付き。
    async fn rollback_issue(
        &self,
        identity: &str,
        purpose: Purpose,
        previous: Option<VerificationChallenge>,
        stored: &VerificationChallenge,
    ) {
        let result = match previous {
            Some(previous) => {
                let restored = VerificationChallenge {
                    version: stored.version + 1,
                    ..previous
                };
                self.store.swap_challenge(&restored, stored.version).await
            }
            None => {
                self.store
                    .delete_challenge(identity, purpose, stored.version)
                    .await
            }
        };

        match result {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(identity = %identity, "発行取り消し時に競合（他の書き込みを優先）")
            }
            Err(rollback) => {
                tracing::error!(error = ?rollback, identity = %identity, "発行取り消し失敗")
            }
        }
    }

    async fn check_eligibility(&self, identity: &str, purpose: Purpose) -> Result<(), AppError> {
        let user = self.store.find_user(identity).await?;

        match purpose {
            Purpose::PasswordReset => match user {
                Some(user) if user.email_verified => Ok(()),
                _ => {
                    tracing::warn!(identity = %identity, "パスワードリセット: 認証済みアカウントなし");
                    Err(AppError::IdentityNotFound)
                }
            },
            Purpose::SignupVerification => match user {
                Some(user) if user.email_verified => {
                    tracing::warn!(identity = %identity, "サインアップ認証: 既に認証済み");
                    Err(AppError::AlreadyVerified)
                }
                _ => Ok(()),
            },
        }
    }

    async fn try_resend(
        &self,
        identity: &str,
        purpose: Purpose,
    ) -> Result<ResentChallenge, AppError> {
        let current = self
            .store
            .find_challenge(identity, purpose)
            .await?
            .ok_or(AppError::NoActiveChallenge)?;

        if let Err(e) = current.ensure_resendable() {
            tracing::warn!(
                identity = %identity,
                purpose = %purpose,
                resend_count = current.resend_count,
                reason = e.code(),
                "再送拒否"
            );
            return Err(e);
        }

        let code = self.generator.generate(self.policy.code_length);
        let next = current.reissue(
            self.hasher.hash(identity, purpose, &code),
            self.clock.now(),
            self.policy.ttl,
        )?;

        if !self.store.swap_challenge(&next, current.version).await? {
            return Err(AppError::StoreConflict);
        }

        if let Err(e) = self.notifier.send(identity, purpose, &code).await {
            tracing::error!(
                error = %e,
                identity = %identity,
                purpose = %purpose,
                "認証コード再送失敗（再送前に戻す）"
            );
            let restored = VerificationChallenge {
                version: next.version + 1,
                ..current
            };
            match self.store.swap_challenge(&restored, next.version).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(identity = %identity, "再送取り消し時に競合（他の書き込みを優先）")
                }
                Err(rollback) => {
                    tracing::error!(error = ?rollback, identity = %identity, "再送取り消し失敗")
                }
            }
            return Err(AppError::NotifierFailure(e.to_string()));
        }

        tracing::info!(
            identity = %identity,
            purpose = %purpose,
            resend_count = next.resend_count,
            "認証コード再送"
        );

        Ok(ResentChallenge {
            ttl_seconds: self.policy.ttl.whole_seconds(),
            expires_at: next.expires_at,
            resend_count: next.resend_count,
            max_resends: next.max_resends,
        })
    }

    async fn try_validate(
        &self,
        identity: &str,
        purpose: Purpose,
        code: &str,
    ) -> Result<(), AppError> {
        let Some(challenge) = self.store.find_challenge(identity, purpose).await? else {
            tracing::warn!(
                identity = %identity,
                purpose = %purpose,
                reason = "no_challenge",
                "認証コード検証失敗"
            );
            return Err(AppError::NoChallenge);
        };

        if let Err(e) = challenge.verify(
            self.clock.now(),
            code,
            self.policy.code_length,
            &self.hasher,
        ) {
            tracing::warn!(
                identity = %identity,
                purpose = %purpose,
                reason = e.code(),
                "認証コード検証失敗"
            );
            return Err(e);
        }

        if !self
            .store
            .swap_challenge(&challenge.consume(), challenge.version)
            .await?
        {
            return Err(AppError::StoreConflict);
        }

        tracing::info!(identity = %identity, purpose = %purpose, "認証コード検証成功");

        Ok(())
    }
}

/// StoreConflict の場合のみ1回再試行する
async fn retry_on_conflict<T, F, Fut>(
    operation: &'static str,
    mut attempt: F,
) -> Result<T, AppError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
{
    let mut tries = 0;
    loop {
        tries += 1;
        match attempt().await {
            Err(AppError::StoreConflict) if tries < MAX_WRITE_ATTEMPTS => {
                tracing::warn!(operation, tries, "チャレンジ更新が競合（再試行）");
            }
            result => return result,
        }
    }
}

/// メールアドレスを正規化して検証
///
/// 前後の空白を除去し小文字化する
pub fn normalize_identity(raw: &str) -> Result<String, AppError> {
    let identity = raw.trim().to_lowercase();

    let valid = match identity.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !domain.contains('@')
                && !identity.chars().any(char::is_whitespace)
        }
        None => false,
    };

    if !valid {
        return Err(AppError::Validation(
            "有効なメールアドレスを入力してください".to_string(),
        ));
    }
    Ok(identity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use time::Duration;

    use crate::models::User;
    use crate::repositories::InMemoryIdentityStore;
    use crate::services::clock::ManualClock;
    use crate::services::code::{OsRngCodeGenerator, SequenceCodeGenerator};
    use crate::services::notifier::RecordingNotifier;

    const EMAIL: &str = "traveler@example.com";

    struct Harness {
        manager: ChallengeManager,
        store: Arc<InMemoryIdentityStore>,
        clock: Arc<ManualClock>,
        notifier: Arc<RecordingNotifier>,
    }

    fn harness_with(generator: Arc<dyn CodeGenerator>, policy: OtpPolicy) -> Harness {
        let store = Arc::new(InMemoryIdentityStore::new());
        let clock = Arc::new(ManualClock::new(OffsetDateTime::UNIX_EPOCH));
        let notifier = Arc::new(RecordingNotifier::default());
        let manager = ChallengeManager::new(
            store.clone(),
            notifier.clone(),
            clock.clone(),
            generator,
            CodeHasher::new(&[3u8; 32]).unwrap(),
            policy,
        );
        Harness {
            manager,
            store,
            clock,
            notifier,
        }
    }

    fn harness() -> Harness {
        harness_with(Arc::new(OsRngCodeGenerator), OtpPolicy::default())
    }

    #[tokio::test]
    async fn test_scenario_a_verify_within_ttl() {
        let h = harness();
        h.manager.issue(EMAIL, Purpose::SignupVerification).await.unwrap();
        let code = h.notifier.last_code().unwrap();

        h.clock.advance(Duration::seconds(1));
        let result = h.manager.validate(EMAIL, Purpose::SignupVerification, &code).await;

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_scenario_b_correct_code_after_ttl_is_expired() {
        let h = harness();
        let issued = h.manager.issue(EMAIL, Purpose::SignupVerification).await.unwrap();
        assert_eq!(issued.ttl_seconds, 120);
        let code = h.notifier.last_code().unwrap();

        h.clock.advance(Duration::seconds(121));
        let result = h.manager.validate(EMAIL, Purpose::SignupVerification, &code).await;

        assert!(matches!(result, Err(AppError::Expired)));
    }

    #[tokio::test]
    async fn test_expiry_boundary_is_exclusive() {
        let h = harness();
        h.manager.issue(EMAIL, Purpose::SignupVerification).await.unwrap();
        let code = h.notifier.last_code().unwrap();

        h.clock.advance(Duration::seconds(120));
        let result = h.manager.validate(EMAIL, Purpose::SignupVerification, &code).await;

        assert!(matches!(result, Err(AppError::Expired)));
    }

    #[tokio::test]
    async fn test_scenario_c_resend_limit() {
        let h = harness();
        h.manager.issue(EMAIL, Purpose::SignupVerification).await.unwrap();

        let first = h.manager.resend(EMAIL, Purpose::SignupVerification).await.unwrap();
        let second = h.manager.resend(EMAIL, Purpose::SignupVerification).await.unwrap();
        let second_code = h.notifier.last_code().unwrap();
        assert_eq!(first.resend_count, 1);
        assert_eq!(second.resend_count, 2);
        assert_eq!(second.max_resends, 2);

        let third = h.manager.resend(EMAIL, Purpose::SignupVerification).await;
        assert!(matches!(third, Err(AppError::ResendLimitExceeded)));
        // 上限超過時は送信しない
        assert_eq!(h.notifier.count(), 3);

        let result = h
            .manager
            .validate(EMAIL, Purpose::SignupVerification, &second_code)
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_scenario_d_old_code_superseded() {
        let h = harness_with(
            Arc::new(SequenceCodeGenerator::new(&["123456", "654321"])),
            OtpPolicy::default(),
        );
        h.manager.issue(EMAIL, Purpose::PasswordReset).await.unwrap_err();

        h.store.insert_verified_user(EMAIL, "hash").await;
        h.manager.issue(EMAIL, Purpose::PasswordReset).await.unwrap();
        h.manager.resend(EMAIL, Purpose::PasswordReset).await.unwrap();

        let old = h.manager.validate(EMAIL, Purpose::PasswordReset, "123456").await;
        assert!(matches!(old, Err(AppError::Mismatch)));

        let new = h.manager.validate(EMAIL, Purpose::PasswordReset, "654321").await;
        assert!(new.is_ok());
    }

    #[tokio::test]
    async fn test_single_use() {
        let h = harness();
        h.manager.issue(EMAIL, Purpose::SignupVerification).await.unwrap();
        let code = h.notifier.last_code().unwrap();

        h.manager
            .validate(EMAIL, Purpose::SignupVerification, &code)
            .await
            .unwrap();

        let again = h.manager.validate(EMAIL, Purpose::SignupVerification, &code).await;
        assert!(matches!(again, Err(AppError::NoChallenge)));
        let other = h
            .manager
            .validate(EMAIL, Purpose::SignupVerification, "000000")
            .await;
        assert!(matches!(other, Err(AppError::NoChallenge)));
    }

    #[tokio::test]
    async fn test_resend_after_consume_is_rejected() {
        let h = harness();
        h.store.insert_verified_user(EMAIL, "hash").await;
        h.manager.issue(EMAIL, Purpose::PasswordReset).await.unwrap();
        let code = h.notifier.last_code().unwrap();
        h.manager
            .validate(EMAIL, Purpose::PasswordReset, &code)
            .await
            .unwrap();

        let result = h.manager.resend(EMAIL, Purpose::PasswordReset).await;
        assert!(matches!(result, Err(AppError::NoActiveChallenge)));
    }

    #[tokio::test]
    async fn test_resend_without_issue() {
        let h = harness();
        let result = h.manager.resend(EMAIL, Purpose::SignupVerification).await;
        assert!(matches!(result, Err(AppError::NoActiveChallenge)));
    }

    #[tokio::test]
    async fn test_validate_without_issue() {
        let h = harness();
        let result = h
            .manager
            .validate(EMAIL, Purpose::SignupVerification, "123456")
            .await;
        assert!(matches!(result, Err(AppError::NoChallenge)));
    }

    #[tokio::test]
    async fn test_resend_limit_does_not_mutate() {
        let h = harness();
        h.manager.issue(EMAIL, Purpose::SignupVerification).await.unwrap();
        h.manager.resend(EMAIL, Purpose::SignupVerification).await.unwrap();
        h.manager.resend(EMAIL, Purpose::SignupVerification).await.unwrap();
        let before = h
            .store
            .find_challenge(EMAIL, Purpose::SignupVerification)
            .await
            .unwrap()
            .unwrap();

        for _ in 0..3 {
            let result = h.manager.resend(EMAIL, Purpose::SignupVerification).await;
            assert!(matches!(result, Err(AppError::ResendLimitExceeded)));
        }

        let after = h
            .store
            .find_challenge(EMAIL, Purpose::SignupVerification)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_resend_allowed_while_code_is_live() {
        let h = harness();
        let issued = h.manager.issue(EMAIL, Purpose::SignupVerification).await.unwrap();

        h.clock.advance(Duration::seconds(10));
        let resent = h.manager.resend(EMAIL, Purpose::SignupVerification).await.unwrap();

        assert_eq!(resent.expires_at, issued.expires_at + Duration::seconds(10));
    }

    #[tokio::test]
    async fn test_resend_after_expiry_gives_fresh_window() {
        let h = harness();
        h.manager.issue(EMAIL, Purpose::SignupVerification).await.unwrap();

        h.clock.advance(Duration::seconds(300));
        h.manager.resend(EMAIL, Purpose::SignupVerification).await.unwrap();
        let code = h.notifier.last_code().unwrap();

        h.clock.advance(Duration::seconds(119));
        assert!(h
            .manager
            .validate(EMAIL, Purpose::SignupVerification, &code)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_at_most_one_code_validates() {
        let h = harness();
        h.manager.issue(EMAIL, Purpose::SignupVerification).await.unwrap();
        let mut codes = vec![h.notifier.last_code().unwrap()];
        for _ in 0..2 {
            h.manager.resend(EMAIL, Purpose::SignupVerification).await.unwrap();
            codes.push(h.notifier.last_code().unwrap());
        }
        let current = codes.last().unwrap().clone();

        for code in codes.iter().filter(|c| **c != current) {
            let result = h.manager.validate(EMAIL, Purpose::SignupVerification, code).await;
            assert!(matches!(result, Err(AppError::Mismatch)));
        }
        assert!(h
            .manager
            .validate(EMAIL, Purpose::SignupVerification, &current)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_validation_does_not_extend_or_reset() {
        let h = harness();
        h.manager.issue(EMAIL, Purpose::SignupVerification).await.unwrap();
        h.manager.resend(EMAIL, Purpose::SignupVerification).await.unwrap();
        let before = h
            .store
            .find_challenge(EMAIL, Purpose::SignupVerification)
            .await
            .unwrap()
            .unwrap();

        let _ = h
            .manager
            .validate(EMAIL, Purpose::SignupVerification, "abc")
            .await;
        let _ = h
            .manager
            .validate(EMAIL, Purpose::SignupVerification, "999999")
            .await;

        let after = h
            .store
            .find_challenge(EMAIL, Purpose::SignupVerification)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_malformed_input() {
        let h = harness();
        h.manager.issue(EMAIL, Purpose::SignupVerification).await.unwrap();

        for input in ["", "12345", "1234567", "12 456", "abcdef"] {
            let result = h.manager.validate(EMAIL, Purpose::SignupVerification, input).await;
            assert!(matches!(result, Err(AppError::MalformedInput)), "{input}");
        }
    }

    #[tokio::test]
    async fn test_purposes_do_not_cross() {
        let h = harness();
        h.store.insert_verified_user(EMAIL, "hash").await;
        h.manager.issue(EMAIL, Purpose::PasswordReset).await.unwrap();
        let code = h.notifier.last_code().unwrap();

        let result = h
            .manager
            .validate(EMAIL, Purpose::SignupVerification, &code)
            .await;
        assert!(matches!(result, Err(AppError::NoChallenge)));
    }

    #[tokio::test]
    async fn test_reset_requires_verified_account() {
        let h = harness();
        let missing = h.manager.issue(EMAIL, Purpose::PasswordReset).await;
        assert!(matches!(missing, Err(AppError::IdentityNotFound)));

        h.store.create_user(EMAIL, "hash").await.unwrap();
        let unverified = h.manager.issue(EMAIL, Purpose::PasswordReset).await;
        assert!(matches!(unverified, Err(AppError::IdentityNotFound)));
        assert_eq!(h.notifier.count(), 0);
    }

    #[tokio::test]
    async fn test_signup_marks_account_verified() {
        let h = harness();
        h.store.create_user(EMAIL, "hash").await.unwrap();
        h.manager.issue(EMAIL, Purpose::SignupVerification).await.unwrap();
        let code = h.notifier.last_code().unwrap();

        h.manager
            .validate(EMAIL, Purpose::SignupVerification, &code)
            .await
            .unwrap();

        let user = h.store.find_user(EMAIL).await.unwrap().unwrap();
        assert!(user.email_verified);
        let again = h.manager.issue(EMAIL, Purpose::SignupVerification).await;
        assert!(matches!(again, Err(AppError::AlreadyVerified)));
    }

    #[tokio::test]
    async fn test_new_issue_resets_resend_count() {
        let h = harness();
        h.manager.issue(EMAIL, Purpose::SignupVerification).await.unwrap();
        h.manager.resend(EMAIL, Purpose::SignupVerification).await.unwrap();
        h.manager.resend(EMAIL, Purpose::SignupVerification).await.unwrap();
        let old_code = h.notifier.last_code().unwrap();

        let issued = h.manager.issue(EMAIL, Purpose::SignupVerification).await.unwrap();
        assert_eq!(issued.resend_count, 0);
        assert!(h.manager.resend(EMAIL, Purpose::SignupVerification).await.is_ok());

        let result = h
            .manager
            .validate(EMAIL, Purpose::SignupVerification, &old_code)
            .await;
        assert!(matches!(result, Err(AppError::Mismatch)));
    }

    #[tokio::test]
    async fn test_identity_is_normalized() {
        let h = harness();
        h.manager
            .issue("  Traveler@Example.COM ", Purpose::SignupVerification)
            .await
            .unwrap();
        let code = h.notifier.last_code().unwrap();

        assert!(h
            .manager
            .validate(EMAIL, Purpose::SignupVerification, &code)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_issue_rolls_back_on_notifier_failure() {
        let h = harness();
        h.notifier.set_failing(true);

        let result = h.manager.issue(EMAIL, Purpose::SignupVerification).await;
        assert!(matches!(result, Err(AppError::NotifierFailure(_))));
        assert!(h
            .store
            .find_challenge(EMAIL, Purpose::SignupVerification)
            .await
            .unwrap()
            .is_none());

        // 後続の発行は妨げない
        h.notifier.set_failing(false);
        assert!(h.manager.issue(EMAIL, Purpose::SignupVerification).await.is_ok());
    }

    #[tokio::test]
    async fn test_resend_rolls_back_on_notifier_failure() {
        let h = harness();
        h.manager.issue(EMAIL, Purpose::SignupVerification).await.unwrap();
        let code = h.notifier.last_code().unwrap();

        h.notifier.set_failing(true);
        let result = h.manager.resend(EMAIL, Purpose::SignupVerification).await;
        assert!(matches!(result, Err(AppError::NotifierFailure(_))));

        let status = h
            .manager
            .status(EMAIL, Purpose::SignupVerification)
            .await
            .unwrap();
        assert_eq!(status.resend_count, 0);
        // 再送前のコードが引き続き有効
        assert!(h
            .manager
            .validate(EMAIL, Purpose::SignupVerification, &code)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_failed_reissue_keeps_previous_code() {
        let h = harness();
        h.manager.issue(EMAIL, Purpose::SignupVerification).await.unwrap();
        h.manager.resend(EMAIL, Purpose::SignupVerification).await.unwrap();
        let code = h.notifier.last_code().unwrap();

        h.notifier.set_failing(true);
        let result = h.manager.issue(EMAIL, Purpose::SignupVerification).await;
        assert!(matches!(result, Err(AppError::NotifierFailure(_))));

        // 発行前のチャレンジ（再送回数も含む）に戻っている
        let status = h
            .manager
            .status(EMAIL, Purpose::SignupVerification)
            .await
            .unwrap();
        assert_eq!(status.state, ChallengeState::Issued);
        assert_eq!(status.resend_count, 1);
        assert!(h
            .manager
            .validate(EMAIL, Purpose::SignupVerification, &code)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_status_reports_state() {
        let h = harness();
        h.manager.issue(EMAIL, Purpose::SignupVerification).await.unwrap();
        h.clock.advance(Duration::seconds(20));

        let status = h
            .manager
            .status(EMAIL, Purpose::SignupVerification)
            .await
            .unwrap();
        assert_eq!(status.state, ChallengeState::Issued);
        assert_eq!(status.expires_in_seconds, 100);

        h.manager.resend(EMAIL, Purpose::SignupVerification).await.unwrap();
        h.manager.resend(EMAIL, Purpose::SignupVerification).await.unwrap();
        let status = h
            .manager
            .status(EMAIL, Purpose::SignupVerification)
            .await
            .unwrap();
        assert_eq!(status.state, ChallengeState::LimitReached);

        h.clock.advance(Duration::seconds(120));
        let status = h
            .manager
            .status(EMAIL, Purpose::SignupVerification)
            .await
            .unwrap();
        assert_eq!(status.state, ChallengeState::Expired);
        assert_eq!(status.expires_in_seconds, 0);
    }

    #[tokio::test]
    async fn test_invalid_identity() {
        let h = harness();
        let invalid = [
            "",
            "no-at-sign",
            "@example.com",
            "user@",
            "user@localhost",
            "a b@example.com",
        ];
        for identity in invalid {
            let result = h.manager.issue(identity, Purpose::SignupVerification).await;
            assert!(matches!(result, Err(AppError::Validation(_))), "{identity}");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_resends_respect_quota() {
        let h = harness();
        h.manager.issue(EMAIL, Purpose::SignupVerification).await.unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = h.manager.clone();
                tokio::spawn(
                    async move { manager.resend(EMAIL, Purpose::SignupVerification).await },
                )
            })
            .collect();

        let mut accepted = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => accepted += 1,
                Err(AppError::ResendLimitExceeded) | Err(AppError::StoreConflict) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }

        let stored = h
            .store
            .find_challenge(EMAIL, Purpose::SignupVerification)
            .await
            .unwrap()
            .unwrap();
        assert!(accepted <= 2);
        assert_eq!(stored.resend_count, accepted);
        assert_eq!(h.notifier.count(), 1 + accepted as usize);
    }

    /// swap を指定回数だけ競合させるストア
    struct ConflictingStore {
        inner: InMemoryIdentityStore,
        conflicts: AtomicUsize,
    }

    #[async_trait]
    impl IdentityStore for ConflictingStore {
        async fn find_user(&self, email: &str) -> Result<Option<User>, AppError> {
            self.inner.find_user(email).await
        }

        async fn create_user(&self, email: &str, password_hash: &str) -> Result<User, AppError> {
            self.inner.create_user(email, password_hash).await
        }

        async fn mark_email_verified(&self, email: &str) -> Result<(), AppError> {
            self.inner.mark_email_verified(email).await
        }

        async fn update_password(&self, email: &str, password_hash: &str) -> Result<(), AppError> {
            self.inner.update_password(email, password_hash).await
        }

        async fn find_challenge(
            &self,
            identity: &str,
            purpose: Purpose,
        ) -> Result<Option<VerificationChallenge>, AppError> {
            self.inner.find_challenge(identity, purpose).await
        }

        async fn put_challenge(
            &self,
            challenge: &VerificationChallenge,
        ) -> Result<VerificationChallenge, AppError> {
            self.inner.put_challenge(challenge).await
        }

        async fn swap_challenge(
            &self,
            next: &VerificationChallenge,
            expected_version: i64,
        ) -> Result<bool, AppError> {
            let remaining = self.conflicts.load(Ordering::SeqCst);
            if remaining > 0 {
                self.conflicts.store(remaining - 1, Ordering::SeqCst);
                return Ok(false);
            }
            self.inner.swap_challenge(next, expected_version).await
        }

        async fn delete_challenge(
            &self,
            identity: &str,
            purpose: Purpose,
            version: i64,
        ) -> Result<bool, AppError> {
            self.inner.delete_challenge(identity, purpose, version).await
        }
    }

    fn conflicting_manager(conflicts: usize) -> (ChallengeManager, Arc<RecordingNotifier>) {
        let store = Arc::new(ConflictingStore {
            inner: InMemoryIdentityStore::new(),
            conflicts: AtomicUsize::new(0),
        });
        let notifier = Arc::new(RecordingNotifier::default());
        let manager = ChallengeManager::new(
            store.clone(),
            notifier.clone(),
            Arc::new(ManualClock::new(OffsetDateTime::UNIX_EPOCH)),
            Arc::new(OsRngCodeGenerator),
            CodeHasher::new(&[3u8; 32]).unwrap(),
            OtpPolicy::default(),
        );
        store.conflicts.store(conflicts, Ordering::SeqCst);
        (manager, notifier)
    }

    #[tokio::test]
    async fn test_single_conflict_is_retried() {
        let (manager, notifier) = conflicting_manager(1);
        manager.issue(EMAIL, Purpose::SignupVerification).await.unwrap();

        let resent = manager.resend(EMAIL, Purpose::SignupVerification).await.unwrap();
        assert_eq!(resent.resend_count, 1);
        // 競合した試行では送信しない
        assert_eq!(notifier.count(), 2);
    }

    #[tokio::test]
    async fn test_repeated_conflict_surfaces() {
        let (manager, notifier) = conflicting_manager(2);
        manager.issue(EMAIL, Purpose::SignupVerification).await.unwrap();
        let code = notifier.last_code().unwrap();

        let result = manager.validate(EMAIL, Purpose::SignupVerification, &code).await;
        assert!(matches!(result, Err(AppError::StoreConflict)));

        // 競合が解消すれば同じコードで検証できる
        assert!(manager
            .validate(EMAIL, Purpose::SignupVerification, &code)
            .await
            .is_ok());
    }
}
