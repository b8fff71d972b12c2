use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{Purpose, User, VerificationChallenge};
use crate::repositories::IdentityStore;

/// インメモリ実装（テスト・DBなしのローカル起動用）
///
/// 各操作は Mutex を保持したまま読み書きするため、version 比較と更新はアトミック
#[derive(Default)]
pub struct InMemoryIdentityStore {
    users: Mutex<HashMap<String, User>>,
    challenges: Mutex<Challenges>,
}

type ChallengeKey = (String, Purpose);

#[derive(Default)]
struct Challenges {
    live: HashMap<ChallengeKey, VerificationChallenge>,
    /// 削除したレコードの最終 version（作り直しても巻き戻さない）
    retired: HashMap<ChallengeKey, i64>,
}

impl InMemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 認証済みユーザーを直接登録
    pub async fn insert_verified_user(&self, email: &str, password_hash: &str) -> User {
        let now = OffsetDateTime::now_utc();
        let user = User {
            id: Uuid::new_v4(),
            email: email.to_string(),
            password_hash: Some(password_hash.to_string()),
            email_verified: true,
            created_at: now,
            updated_at: now,
        };
        self.users
            .lock()
            .await
            .insert(email.to_string(), user.clone());
        user
    }
}

#[async_trait]
impl IdentityStore for InMemoryIdentityStore {
    async fn find_user(&self, email: &str) -> Result<Option<User>, AppError> {
        Ok(self.users.lock().await.get(email).cloned())
    }

    async fn create_user(&self, email: &str, password_hash: &str) -> Result<User, AppError> {
        let mut users = self.users.lock().await;
        if users.contains_key(email) {
            return Err(AppError::EmailAlreadyExists);
        }

        let now = OffsetDateTime::now_utc();
        let user = User {
            id: Uuid::new_v4(),
            email: email.to_string(),
            password_hash: Some(password_hash.to_string()),
            email_verified: false,
            created_at: now,
            updated_at: now,
        };
        users.insert(email.to_string(), user.clone());
        Ok(user)
    }

    async fn mark_email_verified(&self, email: &str) -> Result<(), AppError> {
        if let Some(user) = self.users.lock().await.get_mut(email) {
            user.email_verified = true;
            user.updated_at = OffsetDateTime::now_utc();
        }
        Ok(())
    }

    async fn update_password(&self, email: &str, password_hash: &str) -> Result<(), AppError> {
        if let Some(user) = self.users.lock().await.get_mut(email) {
            user.password_hash = Some(password_hash.to_string());
            user.updated_at = OffsetDateTime::now_utc();
        }
        Ok(())
    }

    async fn find_challenge(
        &self,
        identity: &str,
        purpose: Purpose,
    ) -> Result<Option<VerificationChallenge>, AppError> {
        Ok(self
            .challenges
            .lock()
            .await
            .live
            .get(&(identity.to_string(), purpose))
            .cloned())
    }

    async fn put_challenge(
        &self,
        challenge: &VerificationChallenge,
    ) -> Result<VerificationChallenge, AppError> {
        let mut challenges = self.challenges.lock().await;
        let key = (challenge.identity.clone(), challenge.purpose);
        let floor = match challenges.live.get(&key) {
            Some(current) => Some(current.version),
            None => challenges.retired.get(&key).copied(),
        };
        let version = floor.map_or(challenge.version, |v| challenge.version.max(v + 1));

        let stored = VerificationChallenge {
            version,
            ..challenge.clone()
        };
        challenges.live.insert(key, stored.clone());
        Ok(stored)
    }

    async fn swap_challenge(
        &self,
        next: &VerificationChallenge,
        expected_version: i64,
    ) -> Result<bool, AppError> {
        let mut challenges = self.challenges.lock().await;
        let key = (next.identity.clone(), next.purpose);

        if challenges.live.get(&key).map(|c| c.version) != Some(expected_version) {
            return Ok(false);
        }
        challenges.live.insert(key, next.clone());
        Ok(true)
    }

    async fn delete_challenge(
        &self,
        identity: &str,
        purpose: Purpose,
        version: i64,
    ) -> Result<bool, AppError> {
        let mut challenges = self.challenges.lock().await;
        let key = (identity.to_string(), purpose);

        if challenges.live.get(&key).map(|c| c.version) != Some(version) {
            return Ok(false);
        }
        challenges.live.remove(&key);
        challenges.retired.insert(key, version);
        Ok(true)
    }
}
