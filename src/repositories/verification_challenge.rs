use sqlx::{FromRow, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{Purpose, VerificationChallenge};

/// verification_challenges テーブルの行
#[derive(Debug, FromRow)]
struct ChallengeRow {
    id: Uuid,
    identity: String,
    purpose: String,
    code_hash: Vec<u8>,
    issued_at: OffsetDateTime,
    expires_at: OffsetDateTime,
    resend_count: i32,
    max_resends: i32,
    consumed: bool,
    version: i64,
}

impl TryFrom<ChallengeRow> for VerificationChallenge {
    type Error = AppError;

    fn try_from(row: ChallengeRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            identity: row.identity,
            purpose: row.purpose.parse()?,
            code_hash: row.code_hash,
            issued_at: row.issued_at,
            expires_at: row.expires_at,
            resend_count: row.resend_count,
            max_resends: row.max_resends,
            consumed: row.consumed,
            version: row.version,
        })
    }
}

#[derive(Clone)]
pub struct VerificationChallengeRepository {
    pool: PgPool,
}

impl VerificationChallengeRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// (identity, purpose) でチャレンジを検索
    ///
    /// # Note
    /// 有効期限や使用済みフラグの検証は呼び出し側で行う
    pub async fn find(
        &self,
        identity: &str,
        purpose: Purpose,
    ) -> Result<Option<VerificationChallenge>, AppError> {
        let row = sqlx::query_as::<_, ChallengeRow>(
            r#"
            SELECT id, identity, purpose, code_hash, issued_at, expires_at,
                   resend_count, max_resends, consumed, version
            FROM verification_challenges
            WHERE identity = $1 AND purpose = $2
            "#,
        )
        .bind(identity)
        .bind(purpose.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(VerificationChallenge::try_from).transpose()
    }

    /// チャレンジを上書き保存
    ///
    /// 既存行があれば全カラムを置き換え、version を +1 する
    /// （新しいレコードの version の方が大きければそちらを使う）
    pub async fn upsert(
        &self,
        challenge: &VerificationChallenge,
    ) -> Result<VerificationChallenge, AppError> {
        let row = sqlx::query_as::<_, ChallengeRow>(
            r#"
            INSERT INTO verification_challenges
                (identity, purpose, id, code_hash, issued_at, expires_at,
                 resend_count, max_resends, consumed, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (identity, purpose) DO UPDATE SET
                id = EXCLUDED.id,
                code_hash = EXCLUDED.code_hash,
                issued_at = EXCLUDED.issued_at,
                expires_at = EXCLUDED.expires_at,
                resend_count = EXCLUDED.resend_count,
                max_resends = EXCLUDED.max_resends,
                consumed = EXCLUDED.consumed,
                version = GREATEST(verification_challenges.version + 1, EXCLUDED.version)
            RETURNING id, identity, purpose, code_hash, issued_at, expires_at,
                      resend_count, max_resends, consumed, version
            "#,
        )
        .bind(&challenge.identity)
        .bind(challenge.purpose.as_str())
        .bind(challenge.id)
        .bind(&challenge.code_hash)
        .bind(challenge.issued_at)
        .bind(challenge.expires_at)
        .bind(challenge.resend_count)
        .bind(challenge.max_resends)
        .bind(challenge.consumed)
        .bind(challenge.version)
        .fetch_one(&self.pool)
        .await?;

        VerificationChallenge::try_from(row)
    }

    /// version が一致する場合のみ更新（楽観ロック）
    ///
    /// # Returns
    /// 更新できた場合 true
    pub async fn compare_and_swap(
        &self,
        next: &VerificationChallenge,
        expected_version: i64,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE verification_challenges
            SET id = $3,
                code_hash = $4,
                issued_at = $5,
                expires_at = $6,
                resend_count = $7,
                max_resends = $8,
                consumed = $9,
                version = $10
            WHERE identity = $1 AND purpose = $2 AND version = $11
            "#,
        )
        .bind(&next.identity)
        .bind(next.purpose.as_str())
        .bind(next.id)
        .bind(&next.code_hash)
        .bind(next.issued_at)
        .bind(next.expires_at)
        .bind(next.resend_count)
        .bind(next.max_resends)
        .bind(next.consumed)
        .bind(next.version)
        .bind(expected_version)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// version が一致する場合のみ削除
    pub async fn delete(
        &self,
        identity: &str,
        purpose: Purpose,
        version: i64,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            DELETE FROM verification_challenges
            WHERE identity = $1 AND purpose = $2 AND version = $3
            "#,
        )
        .bind(identity)
        .bind(purpose.as_str())
        .bind(version)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
