use sqlx::FromRow;
use time::OffsetDateTime;

use crate::database::models::KeyUser;
use crate::database::Database;

/// An opaque 256-bit nonce the admin hands out to seed a key-user
/// without interactive approval.
///
/// Redeemable iff never redeemed, not expired, and its policy still
/// exists. Redemption is atomic: the key-user upsert, the derived
/// signing conditions, and the redeemed marker land together or not at
/// all.
#[derive(Debug, Clone, FromRow)]
pub struct Token {
    pub id: i64,
    pub token: String,
    pub key_name: String,
    pub client_name: String,
    pub policy_id: i64,
    pub created_by: Option<String>,
    pub created_at: OffsetDateTime,
    pub expires_at: Option<OffsetDateTime>,
    pub redeemed_at: Option<OffsetDateTime>,
    pub key_user_id: Option<i64>,
}

#[derive(Debug, thiserror::Error)]
pub enum TokenRedemptionError {
    #[error("token not found")]
    TokenNotFound,
    #[error("token already redeemed")]
    AlreadyRedeemed,
    #[error("token expired")]
    Expired,
    #[error("policy no longer exists")]
    PolicyMissing,
    #[error("database error during redemption: {0}")]
    Database(#[from] sqlx::Error),
}

const SELECT_COLUMNS: &str = "id, token, key_name, client_name, policy_id, created_by, \
                              created_at, expires_at, redeemed_at, key_user_id";

impl Token {
    /// Mint a token. The nonce is generated by the caller (256 random
    /// bits, hex encoded) so it can be handed back verbatim.
    pub async fn create(
        token: &str,
        key_name: &str,
        client_name: &str,
        policy_id: i64,
        created_by: Option<&str>,
        expires_at: Option<OffsetDateTime>,
        db: &Database,
    ) -> Result<Token, sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO tokens (token, key_name, client_name, policy_id, created_by,
                                created_at, expires_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(token)
        .bind(key_name)
        .bind(client_name)
        .bind(policy_id)
        .bind(created_by)
        .bind(OffsetDateTime::now_utc())
        .bind(expires_at)
        .execute(&**db)
        .await?;

        Self::find(token, db).await?.ok_or(sqlx::Error::RowNotFound)
    }

    pub async fn find(token: &str, db: &Database) -> Result<Option<Token>, sqlx::Error> {
        sqlx::query_as::<_, Token>(&format!(
            "SELECT {SELECT_COLUMNS} FROM tokens WHERE token = ?1",
        ))
        .bind(token)
        .fetch_optional(&**db)
        .await
    }

    pub async fn list_for_key(key_name: &str, db: &Database) -> Result<Vec<Token>, sqlx::Error> {
        sqlx::query_as::<_, Token>(&format!(
            "SELECT {SELECT_COLUMNS} FROM tokens WHERE key_name = ?1 ORDER BY created_at DESC",
        ))
        .bind(key_name)
        .fetch_all(&**db)
        .await
    }

    /// Redeem `token` for `client_pubkey`.
    ///
    /// On success the key-user exists, carries a `connect` grant plus
    /// one grant per policy rule, and the token is marked redeemed. Any
    /// failure rolls the whole transaction back.
    pub async fn redeem(
        token: &str,
        client_pubkey: &str,
        db: &Database,
    ) -> Result<KeyUser, TokenRedemptionError> {
        let now = OffsetDateTime::now_utc();
        let mut tx = db.begin().await?;

        let row = sqlx::query_as::<_, Token>(&format!(
            "SELECT {SELECT_COLUMNS} FROM tokens WHERE token = ?1",
        ))
        .bind(token)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(TokenRedemptionError::TokenNotFound)?;

        if row.redeemed_at.is_some() {
            return Err(TokenRedemptionError::AlreadyRedeemed);
        }
        if let Some(expires_at) = row.expires_at {
            if expires_at < now {
                return Err(TokenRedemptionError::Expired);
            }
        }

        let policy_exists: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM policies WHERE id = ?1")
                .bind(row.policy_id)
                .fetch_optional(&mut *tx)
                .await?;
        if policy_exists.is_none() {
            return Err(TokenRedemptionError::PolicyMissing);
        }

        sqlx::query(
            r#"
            INSERT INTO key_users (key_name, user_pubkey, description, created_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (key_name, user_pubkey) DO UPDATE SET revoked_at = NULL
            "#,
        )
        .bind(&row.key_name)
        .bind(client_pubkey)
        .bind(&row.client_name)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let (key_user_id,): (i64,) = sqlx::query_as(
            "SELECT id FROM key_users WHERE key_name = ?1 AND user_pubkey = ?2",
        )
        .bind(&row.key_name)
        .bind(client_pubkey)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO signing_conditions (key_user_id, method, allowed, created_at)
            VALUES (?1, 'connect', 1, ?2)
            "#,
        )
        .bind(key_user_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let rules: Vec<(String, Option<String>)> =
            sqlx::query_as("SELECT method, kind FROM policy_rules WHERE policy_id = ?1")
                .bind(row.policy_id)
                .fetch_all(&mut *tx)
                .await?;
        for (method, kind) in rules {
            sqlx::query(
                r#"
                INSERT INTO signing_conditions (key_user_id, method, kind, allowed, created_at)
                VALUES (?1, ?2, ?3, 1, ?4)
                "#,
            )
            .bind(key_user_id)
            .bind(&method)
            .bind(&kind)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("UPDATE tokens SET redeemed_at = ?1, key_user_id = ?2 WHERE id = ?3")
            .bind(now)
            .bind(key_user_id)
            .bind(row.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        KeyUser::get(key_user_id, db)
            .await?
            .ok_or(TokenRedemptionError::Database(sqlx::Error::RowNotFound))
    }
}
