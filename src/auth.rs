//! Identity Verifier
//! Bearer トークン → ユーザー識別子の解決（外部コラボレータの受け口）

use axum::http::{header, HeaderMap};
use thiserror::Error;

use crate::db::DbPool;

/// 検証済みの呼び出し主体
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: String,
    pub email: Option<String>,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Authorization header missing")]
    MissingToken,
    #[error("Invalid or expired token")]
    InvalidToken,
    #[error(transparent)]
    Store(#[from] sqlx::Error),
}

/// Authorization ヘッダの Bearer トークンを検証して Identity を返す
pub async fn verify_bearer(db: &DbPool, headers: &HeaderMap) -> Result<Identity, AuthError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(AuthError::MissingToken)?;

    let token = value.strip_prefix("Bearer ").ok_or(AuthError::MissingToken)?;

    let row: Option<(String, Option<String>)> =
        sqlx::query_as("SELECT user_id, email FROM auth_tokens WHERE token = ?")
            .bind(token)
            .fetch_optional(db)
            .await?;

    match row {
        Some((user_id, email)) => Ok(Identity { user_id, email }),
        None => Err(AuthError::InvalidToken),
    }
}
