use sqlx::PgPool;

use crate::models::User;

#[derive(Clone)]
pub struct UserRepository {
    pool: PgPool,
}

impl UserRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// メールアドレスでユーザーを検索
    ///
    /// # Note
    /// DB セットアップ後は `query_as!` マクロに変更してコンパイル時SQL検証を有効にすること
    pub async fn find_by_email(&self, email: &str) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as::<_, User>(
            r#"
            SELECT id, email, password_hash, email_verified, created_at, updated_at
            FROM users
            WHERE email = $1
            "#,
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await
    }

    /// 新しいユーザーを作成（email_verified = false）
    ///
    /// # Errors
    /// - UNIQUE制約違反時: `sqlx::Error::Database` (constraint = "users_email_key")
    ///   呼び出し側で `AppError::EmailAlreadyExists` に変換すること
    pub async fn create_user(&self, email: &str, password_hash: &str) -> Result<User, sqlx::Error> {
        sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (email, password_hash)
            VALUES ($1, $2)
            RETURNING id, email, password_hash, email_verified, created_at, updated_at
            "#,
        )
        .bind(email)
        .bind(password_hash)
        .fetch_one(&self.pool)
        .await
    }

    /// メール認証済みにする
    pub async fn mark_email_verified(&self, email: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE users
            SET email_verified = true, updated_at = NOW()
            WHERE email = $1
            "#,
        )
        .bind(email)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// ユーザーのパスワードを更新
    ///
    /// # Note
    /// password_hash はログに出力しないこと
    pub async fn update_password(
        &self,
        email: &str,
        new_password_hash: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE users
            SET password_hash = $2, updated_at = NOW()
            WHERE email = $1
            "#,
        )
        .bind(email)
        .bind(new_password_hash)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
