use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::AppError;
use crate::services::code::CodeHasher;

/// 認証コードの用途
///
/// 用途ごとにチャレンジが分かれるため、サインアップ用のコードで
/// パスワードリセットはできない
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Purpose {
    SignupVerification,
    PasswordReset,
}

impl Purpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SignupVerification => "signup_verification",
            Self::PasswordReset => "password_reset",
        }
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Purpose {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "signup_verification" => Ok(Self::SignupVerification),
            "password_reset" => Ok(Self::PasswordReset),
            other => Err(AppError::Internal(anyhow::anyhow!(
                "unknown purpose: {other}"
            ))),
        }
    }
}

/// チャレンジの状態（レコードと現在時刻から導出）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeState {
    /// 有効、再送可能
    Issued,
    /// 有効、再送上限到達（現在のコードは検証可能）
    LimitReached,
    /// 期限切れ
    Expired,
    /// 検証済み
    Consumed,
}

/// 認証チャレンジ
///
/// (identity, purpose) ごとに1レコード。コード平文は保持せず、
/// HMAC-SHA256 のハッシュ（code_hash）のみ保存する。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationChallenge {
    pub id: Uuid,
    pub identity: String,
    pub purpose: Purpose,
    pub code_hash: Vec<u8>,
    pub issued_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
    pub resend_count: i32,
    pub max_resends: i32,
    pub consumed: bool,
    /// 楽観ロック用バージョン（書き込みごとに +1）
    pub version: i64,
}

impl VerificationChallenge {
    /// 新しいチャレンジを発行
    pub fn issue(
        identity: &str,
        purpose: Purpose,
        code_hash: Vec<u8>,
        now: OffsetDateTime,
        ttl: Duration,
        max_resends: i32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            identity: identity.to_string(),
            purpose,
            code_hash,
            issued_at: now,
            expires_at: now + ttl,
            resend_count: 0,
            max_resends,
            consumed: false,
            version: initial_version(now),
        }
    }

    /// 現在の状態
    pub fn state(&self, now: OffsetDateTime) -> ChallengeState {
        if self.consumed {
            ChallengeState::Consumed
        } else if now >= self.expires_at {
            ChallengeState::Expired
        } else if self.resend_count >= self.max_resends {
            ChallengeState::LimitReached
        } else {
            ChallengeState::Issued
        }
    }

    /// 未使用かつ期限内か
    pub fn is_usable(&self, now: OffsetDateTime) -> bool {
        !self.consumed && now < self.expires_at
    }

    /// 残り有効秒数（期限切れなら 0）
    pub fn expires_in(&self, now: OffsetDateTime) -> i64 {
        (self.expires_at - now).whole_seconds().max(0)
    }

    /// 再送可能か（使用済みでなく、再送回数が上限未満）
    pub fn ensure_resendable(&self) -> Result<(), AppError> {
        if self.consumed {
            return Err(AppError::NoActiveChallenge);
        }
        if self.resend_count >= self.max_resends {
            return Err(AppError::ResendLimitExceeded);
        }
        Ok(())
    }

    /// コードを再発行（再送）
    ///
    /// 期限切れかどうかは問わない。再送回数の上限のみが制限となる。
    /// code, issued_at, expires_at はまとめて置き換わるため、旧コードは即座に無効になる。
    pub fn reissue(
        &self,
        code_hash: Vec<u8>,
        now: OffsetDateTime,
        ttl: Duration,
    ) -> Result<Self, AppError> {
        self.ensure_resendable()?;

        Ok(Self {
            code_hash,
            issued_at: now,
            expires_at: now + ttl,
            resend_count: self.resend_count + 1,
            version: self.version + 1,
            ..self.clone()
        })
    }

    /// 提出されたコードを検証
    ///
    /// チェック順序: 使用済み → 期限切れ → 形式 → 一致。
    /// 期限切れは一致判定より先に評価する（正しいコードでも期限後は Expired）。
    pub fn verify(
        &self,
        now: OffsetDateTime,
        submitted: &str,
        code_length: usize,
        hasher: &CodeHasher,
    ) -> Result<(), AppError> {
        if self.consumed {
            return Err(AppError::NoChallenge);
        }
        if now >= self.expires_at {
            return Err(AppError::Expired);
        }
        if !is_well_formed_code(submitted, code_length) {
            return Err(AppError::MalformedInput);
        }
        if !hasher.verify(&self.identity, self.purpose, submitted, &self.code_hash) {
            return Err(AppError::Mismatch);
        }
        Ok(())
    }

    /// 使用済みにする
    pub fn consume(&self) -> Self {
        Self {
            consumed: true,
            version: self.version + 1,
            ..self.clone()
        }
    }
}

/// 指定桁数の ASCII 数字のみか
pub fn is_well_formed_code(code: &str, code_length: usize) -> bool {
    code.len() == code_length && code.chars().all(|c| c.is_ascii_digit())
}

/// 新規レコードの version（発行時刻のマイクロ秒）
///
/// 削除後に同じ (identity, purpose) で作り直しても、以前の version には戻らない。
fn initial_version(now: OffsetDateTime) -> i64 {
    i64::try_from(now.unix_timestamp_nanos() / 1_000).unwrap_or(0).max(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hasher() -> CodeHasher {
        CodeHasher::new(&[7u8; 32]).unwrap()
    }

    fn issued(now: OffsetDateTime, code: &str) -> VerificationChallenge {
        let hash = hasher().hash("user@example.com", Purpose::PasswordReset, code);
        VerificationChallenge::issue(
            "user@example.com",
            Purpose::PasswordReset,
            hash,
            now,
            Duration::seconds(120),
            2,
        )
    }

    #[test]
    fn test_issue_sets_full_window() {
        let now = OffsetDateTime::UNIX_EPOCH;
        let challenge = issued(now, "123456");

        assert_eq!(challenge.expires_at - challenge.issued_at, Duration::seconds(120));
        assert_eq!(challenge.resend_count, 0);
        assert!(!challenge.consumed);
        assert_eq!(challenge.state(now), ChallengeState::Issued);
        assert_eq!(challenge.expires_in(now), 120);
    }

    #[test]
    fn test_state_transitions() {
        let now = OffsetDateTime::UNIX_EPOCH;
        let challenge = issued(now, "123456");

        assert_eq!(
            challenge.state(now + Duration::seconds(120)),
            ChallengeState::Expired
        );
        assert!(!challenge.is_usable(now + Duration::seconds(120)));

        let consumed = challenge.consume();
        assert_eq!(consumed.state(now), ChallengeState::Consumed);
        assert!(!consumed.is_usable(now));
        assert_eq!(consumed.version, challenge.version + 1);
    }

    #[test]
    fn test_reissue_increments_and_extends() {
        let now = OffsetDateTime::UNIX_EPOCH;
        let challenge = issued(now, "123456");
        let later = now + Duration::seconds(90);
        let new_hash = hasher().hash("user@example.com", Purpose::PasswordReset, "654321");

        let resent = challenge
            .reissue(new_hash, later, Duration::seconds(120))
            .unwrap();

        assert_eq!(resent.id, challenge.id);
        assert_eq!(resent.resend_count, 1);
        assert_eq!(resent.issued_at, later);
        assert_eq!(resent.expires_at, later + Duration::seconds(120));
        assert_eq!(resent.version, challenge.version + 1);
    }

    #[test]
    fn test_reissue_respects_limit() {
        let now = OffsetDateTime::UNIX_EPOCH;
        let mut challenge = issued(now, "123456");
        for _ in 0..2 {
            challenge = challenge
                .reissue(vec![1], now, Duration::seconds(120))
                .unwrap();
        }

        assert_eq!(challenge.state(now), ChallengeState::LimitReached);
        let result = challenge.reissue(vec![2], now, Duration::seconds(120));
        assert!(matches!(result, Err(AppError::ResendLimitExceeded)));
    }

    #[test]
    fn test_reissue_after_consume_is_rejected() {
        let now = OffsetDateTime::UNIX_EPOCH;
        let consumed = issued(now, "123456").consume();

        let result = consumed.reissue(vec![1], now, Duration::seconds(120));
        assert!(matches!(result, Err(AppError::NoActiveChallenge)));
    }

    #[test]
    fn test_verify_check_order() {
        let now = OffsetDateTime::UNIX_EPOCH;
        let challenge = issued(now, "123456");
        let h = hasher();

        // 期限切れは形式・一致より優先
        let late = now + Duration::seconds(121);
        assert!(matches!(
            challenge.verify(late, "123456", 6, &h),
            Err(AppError::Expired)
        ));
        assert!(matches!(
            challenge.verify(late, "abc", 6, &h),
            Err(AppError::Expired)
        ));

        assert!(matches!(
            challenge.verify(now, "12345", 6, &h),
            Err(AppError::MalformedInput)
        ));
        assert!(matches!(
            challenge.verify(now, "12345a", 6, &h),
            Err(AppError::MalformedInput)
        ));
        assert!(matches!(
            challenge.verify(now, "654321", 6, &h),
            Err(AppError::Mismatch)
        ));
        assert!(challenge.verify(now, "123456", 6, &h).is_ok());

        let consumed = challenge.consume();
        assert!(matches!(
            consumed.verify(now, "123456", 6, &h),
            Err(AppError::NoChallenge)
        ));
    }

    #[test]
    fn test_leading_zero_code() {
        let now = OffsetDateTime::UNIX_EPOCH;
        let challenge = issued(now, "000123");
        let h = hasher();

        assert!(challenge.verify(now, "000123", 6, &h).is_ok());
        assert!(matches!(
            challenge.verify(now, "123", 6, &h),
            Err(AppError::MalformedInput)
        ));
    }

    #[test]
    fn test_purpose_round_trip() {
        for purpose in [Purpose::SignupVerification, Purpose::PasswordReset] {
            assert_eq!(purpose.as_str().parse::<Purpose>().unwrap(), purpose);
        }
        assert!("login".parse::<Purpose>().is_err());
    }

    #[test]
    fn test_later_issue_starts_at_higher_version() {
        let first = issued(OffsetDateTime::UNIX_EPOCH + Duration::seconds(10), "123456");
        let reissued = first.reissue(vec![9], first.issued_at, Duration::seconds(120)).unwrap();
        let later = issued(OffsetDateTime::UNIX_EPOCH + Duration::seconds(11), "654321");

        assert!(later.version > reissued.version);
    }
}
