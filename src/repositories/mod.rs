pub mod memory;
pub mod postgres;
pub mod user;
pub mod verification_challenge;

pub use memory::InMemoryIdentityStore;
pub use postgres::PgIdentityStore;
pub use user::UserRepository;
pub use verification_challenge::VerificationChallengeRepository;

use async_trait::async_trait;

use crate::error::AppError;
use crate::models::{Purpose, User, VerificationChallenge};

/// アカウントと認証チャレンジの永続化
///
/// ChallengeManager はこのトレイト経由でのみ状態を読み書きする。
/// チャレンジは (identity, purpose) ごとに1レコード。
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// メールアドレスでユーザーを検索
    async fn find_user(&self, email: &str) -> Result<Option<User>, AppError>;

    /// 未認証ユーザーを作成
    ///
    /// # Errors
    /// - 既に存在する場合: `AppError::EmailAlreadyExists`
    async fn create_user(&self, email: &str, password_hash: &str) -> Result<User, AppError>;

    /// メール認証済みにする
    async fn mark_email_verified(&self, email: &str) -> Result<(), AppError>;

    /// パスワードを更新
    async fn update_password(&self, email: &str, password_hash: &str) -> Result<(), AppError>;

    async fn find_challenge(
        &self,
        identity: &str,
        purpose: Purpose,
    ) -> Result<Option<VerificationChallenge>, AppError>;

    /// チャレンジを無条件に上書き保存（発行時）
    ///
    /// version は既存レコードの version + 1 と `challenge.version` の大きい方になる。
    /// 削除済みのレコードの version には戻らない。
    /// 保存後のレコードを返す。
    async fn put_challenge(
        &self,
        challenge: &VerificationChallenge,
    ) -> Result<VerificationChallenge, AppError>;

    /// 保存済み version が `expected_version` の場合のみ `next` で置き換える
    ///
    /// # Returns
    /// 置き換えた場合 true、競合した場合 false
    async fn swap_challenge(
        &self,
        next: &VerificationChallenge,
        expected_version: i64,
    ) -> Result<bool, AppError>;

    /// 保存済み version が一致する場合のみ削除
    async fn delete_challenge(
        &self,
        identity: &str,
        purpose: Purpose,
        version: i64,
    ) -> Result<bool, AppError>;
}
