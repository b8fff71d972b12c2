use async_trait::async_trait;
use sqlx::PgPool;

use crate::error::AppError;
use crate::models::{Purpose, User, VerificationChallenge};
use crate::repositories::{IdentityStore, UserRepository, VerificationChallengeRepository};

/// PostgreSQL 実装
#[derive(Clone)]
pub struct PgIdentityStore {
    users: UserRepository,
    challenges: VerificationChallengeRepository,
}

impl PgIdentityStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            users: UserRepository::new(pool.clone()),
            challenges: VerificationChallengeRepository::new(pool),
        }
    }
}

#[async_trait]
impl IdentityStore for PgIdentityStore {
    async fn find_user(&self, email: &str) -> Result<Option<User>, AppError> {
        Ok(self.users.find_by_email(email).await?)
    }

    async fn create_user(&self, email: &str, password_hash: &str) -> Result<User, AppError> {
        self.users
            .create_user(email, password_hash)
            .await
            .map_err(|e| {
                // UNIQUE制約違反チェック
                if let sqlx::Error::Database(db_err) = &e
                    && db_err.constraint() == Some("users_email_key")
                {
                    return AppError::EmailAlreadyExists;
                }
                AppError::Database(e)
            })
    }

    async fn mark_email_verified(&self, email: &str) -> Result<(), AppError> {
        Ok(self.users.mark_email_verified(email).await?)
    }

    async fn update_password(&self, email: &str, password_hash: &str) -> Result<(), AppError> {
        Ok(self.users.update_password(email, password_hash).await?)
    }

    async fn find_challenge(
        &self,
        identity: &str,
        purpose: Purpose,
    ) -> Result<Option<VerificationChallenge>, AppError> {
        self.challenges.find(identity, purpose).await
    }

    async fn put_challenge(
        &self,
        challenge: &VerificationChallenge,
    ) -> Result<VerificationChallenge, AppError> {
        self.challenges.upsert(challenge).await
    }

    async fn swap_challenge(
        &self,
        next: &VerificationChallenge,
        expected_version: i64,
    ) -> Result<bool, AppError> {
        Ok(self.challenges.compare_and_swap(next, expected_version).await?)
    }

    async fn delete_challenge(
        &self,
        identity: &str,
        purpose: Purpose,
        version: i64,
    ) -> Result<bool, AppError> {
        Ok(self.challenges.delete(identity, purpose, version).await?)
    }
}
