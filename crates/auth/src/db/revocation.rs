use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::auth::{RevocationStore, RevocationStoreError};

/// Revocation list shared by every server instance pointed at the same
/// database.
#[derive(Clone)]
pub struct PgRevocationStore {
    pool: PgPool,
}

impl PgRevocationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RevocationStore for PgRevocationStore {
    async fn add(
        &self,
        jti: &str,
        retain_until: DateTime<Utc>,
    ) -> Result<(), RevocationStoreError> {
        sqlx::query(
            r#"
            INSERT INTO revoked_session_tokens (jti, retain_until)
            VALUES ($1, $2)
            ON CONFLICT (jti) DO UPDATE
            SET retain_until = GREATEST(revoked_session_tokens.retain_until, EXCLUDED.retain_until)
            "#,
        )
        .bind(jti)
        .bind(retain_until)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn contains(&self, jti: &str) -> Result<bool, RevocationStoreError> {
        let row: (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS (
                SELECT 1
                FROM revoked_session_tokens
                WHERE jti = $1
                  AND retain_until > NOW()
            )
            "#,
        )
        .bind(jti)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    async fn clear(&self) -> Result<(), RevocationStoreError> {
        sqlx::query("DELETE FROM revoked_session_tokens")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64, RevocationStoreError> {
        let result = sqlx::query("DELETE FROM revoked_session_tokens WHERE retain_until <= NOW()")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
