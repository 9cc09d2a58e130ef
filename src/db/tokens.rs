//! Token hashing and operator token storage.

use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use subtle::ConstantTimeEq;

use super::models::OperatorToken;
use super::{from_db_time, to_db_time, Database};

/// Hash a token using SHA-256.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Generate a new random token.
pub fn generate_token() -> String {
    use base64::Engine;
    use rand::Rng;
    let bytes: [u8; 32] = rand::thread_rng().gen();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Check a presented token against a stored hash in constant time.
pub fn token_matches(presented: &str, stored_hash: &str) -> bool {
    let presented = hash_token(presented);
    presented.as_bytes().ct_eq(stored_hash.as_bytes()).into()
}

const TOKEN_COLUMNS: &str = "id, token_hash, name, created_at, expires_at, revoked";

impl Database {
    /// Create a new operator token. The plaintext is only returned here.
    pub async fn create_operator_token(
        &self,
        name: Option<&str>,
    ) -> Result<(String, OperatorToken), sqlx::Error> {
        let token = generate_token();
        let token_hash = hash_token(&token);
        let now = Utc::now();

        let id = sqlx::query(
            "INSERT INTO operator_tokens (token_hash, name, created_at) VALUES (?, ?, ?)",
        )
        .bind(&token_hash)
        .bind(name)
        .bind(to_db_time(now))
        .execute(self.pool())
        .await?
        .last_insert_rowid();

        Ok((
            token,
            OperatorToken {
                id,
                token_hash,
                name: name.map(String::from),
                created_at: now,
                expires_at: None,
                revoked: false,
            },
        ))
    }

    /// Get an operator token by hash.
    pub async fn get_operator_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<OperatorToken>, sqlx::Error> {
        let row = sqlx::query(&format!(
            "SELECT {TOKEN_COLUMNS} FROM operator_tokens WHERE token_hash = ?"
        ))
        .bind(token_hash)
        .fetch_optional(self.pool())
        .await?;

        Ok(row.as_ref().map(row_to_token))
    }

    /// List all operator tokens.
    pub async fn list_operator_tokens(&self) -> Result<Vec<OperatorToken>, sqlx::Error> {
        let rows = sqlx::query(&format!(
            "SELECT {TOKEN_COLUMNS} FROM operator_tokens ORDER BY id"
        ))
        .fetch_all(self.pool())
        .await?;

        Ok(rows.iter().map(row_to_token).collect())
    }

    /// Revoke a token by id. Returns false if no such token exists.
    pub async fn revoke_operator_token(&self, id: i64) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE operator_tokens SET revoked = TRUE WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Validate a plaintext token and return it if valid.
    pub async fn validate_operator_token(
        &self,
        token: &str,
    ) -> Result<Option<OperatorToken>, sqlx::Error> {
        let token_hash = hash_token(token);
        let token_opt = self.get_operator_token(&token_hash).await?;

        Ok(token_opt.filter(|t| t.is_valid()))
    }
}

fn row_to_token(row: &SqliteRow) -> OperatorToken {
    let created_at: String = row.get("created_at");
    let expires_at: Option<String> = row.get("expires_at");

    OperatorToken {
        id: row.get("id"),
        token_hash: row.get("token_hash"),
        name: row.get("name"),
        created_at: from_db_time(&created_at).unwrap_or_else(Utc::now),
        expires_at: expires_at.as_deref().and_then(from_db_time),
        revoked: row.get("revoked"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testutil::temp_database;

    #[test]
    fn test_generated_tokens_are_distinct() {
        let a = generate_token();
        let b = generate_token();
        assert_ne!(a, b);
        // 32 bytes, unpadded base64
        assert_eq!(a.len(), 43);
        assert!(!a.contains('='));
    }

    #[test]
    fn test_token_matches() {
        let token = generate_token();
        let stored = hash_token(&token);
        assert_eq!(stored.len(), 64);
        assert!(token_matches(&token, &stored));
        assert!(!token_matches("wrong", &stored));
        assert!(!token_matches(&token, ""));
    }

    #[tokio::test]
    async fn test_operator_token_lifecycle() {
        let (db, _dir) = temp_database().await;

        let (plain, token) = db.create_operator_token(Some("noc")).await.unwrap();
        assert_eq!(token.name.as_deref(), Some("noc"));
        assert_ne!(token.token_hash, plain);

        let valid = db.validate_operator_token(&plain).await.unwrap();
        assert_eq!(valid.map(|t| t.id), Some(token.id));
        assert!(db.validate_operator_token("bogus").await.unwrap().is_none());

        assert!(db.revoke_operator_token(token.id).await.unwrap());
        assert!(db.validate_operator_token(&plain).await.unwrap().is_none());
        assert!(!db.revoke_operator_token(9999).await.unwrap());

        let all = db.list_operator_tokens().await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].revoked);
    }
}
