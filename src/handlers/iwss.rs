//! IWSS API Handlers
//! /api/pin /api/iwss エンドポイント - PIN 検証と残高照会

use axum::{extract::State, http::HeaderMap, http::StatusCode, response::Json};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{info, warn};

use crate::auth::{self, AuthError};
use crate::models::{BalanceResponse, IwssAccount, VerifyPinRequest, VerifyPinResponse};
use crate::rate_limit::PinDecision;
use crate::AppState;

#[derive(Serialize, Debug)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked_until_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<i64>,
}

/// PIN の SHA256 ダイジェスト（hex）
pub fn pin_digest(pin: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(pin.as_bytes());
    hex::encode(hasher.finalize())
}

/// POST /api/pin/verify - IWSS PIN 検証
pub async fn verify_pin(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<VerifyPinRequest>,
) -> Result<Json<VerifyPinResponse>, (StatusCode, Json<ErrorResponse>)> {
    // Bearer 検証
    let identity = auth::verify_bearer(&state.db, &headers).await.map_err(|e| match e {
        AuthError::Store(_) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        _ => error_response(StatusCode::UNAUTHORIZED, e.to_string()),
    })?;

    // PIN フォーマットチェック（4桁の数字）
    let pin = req.pin.ok_or_else(|| {
        error_response(StatusCode::BAD_REQUEST, "pin is required".to_string())
    })?;
    if pin.len() != 4 || !pin.bytes().all(|b| b.is_ascii_digit()) {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "PIN must be exactly 4 digits".to_string(),
        ));
    }

    // レートリミッタ判定
    if let PinDecision::Denied { locked_until_ms } = state.pin_limiter.check(&identity.user_id) {
        let now = chrono::Utc::now().timestamp_millis();
        let retry_after_secs = ((locked_until_ms - now).max(0) + 999) / 1000;
        warn!(
            "PIN verification rate limited: user_id={}, locked_until_ms={}",
            identity.user_id, locked_until_ms
        );
        return Err((
            StatusCode::TOO_MANY_REQUESTS,
            Json(ErrorResponse {
                success: false,
                error: "Too many PIN attempts, try again later".to_string(),
                locked_until_ms: Some(locked_until_ms),
                retry_after_secs: Some(retry_after_secs),
            }),
        ));
    }

    let account = fetch_account(&state, &identity.user_id).await?;

    let stored = account.pin_sha256.ok_or_else(|| {
        error_response(
            StatusCode::BAD_REQUEST,
            "PIN is not set for this account".to_string(),
        )
    })?;

    if pin_digest(&pin) != stored {
        return Err(error_response(
            StatusCode::UNAUTHORIZED,
            "Incorrect PIN".to_string(),
        ));
    }

    // 成功したら試行履歴を破棄
    state.pin_limiter.clear(&identity.user_id);

    info!("PIN verified: user_id={}", identity.user_id);

    Ok(Json(VerifyPinResponse {
        success: true,
        message: "PIN verified".to_string(),
    }))
}

/// GET /api/iwss/balance - 残高照会（決済コアからは読み取りのみ）
pub async fn get_balance(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<BalanceResponse>, (StatusCode, Json<ErrorResponse>)> {
    let identity = auth::verify_bearer(&state.db, &headers).await.map_err(|e| match e {
        AuthError::Store(_) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        _ => error_response(StatusCode::UNAUTHORIZED, e.to_string()),
    })?;

    let account = fetch_account(&state, &identity.user_id).await?;

    Ok(Json(BalanceResponse {
        success: true,
        active: account.active != 0,
        balance: account.balance,
        deactivation_reason: account.deactivation_reason,
    }))
}

async fn fetch_account(
    state: &Arc<AppState>,
    user_id: &str,
) -> Result<IwssAccount, (StatusCode, Json<ErrorResponse>)> {
    let account: Option<IwssAccount> =
        sqlx::query_as("SELECT * FROM iwss_accounts WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&state.db)
            .await
            .map_err(|e| {
                error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("DB error: {}", e))
            })?;

    account.ok_or_else(|| {
        error_response(
            StatusCode::NOT_FOUND,
            format!("IWSS account not found: {}", user_id),
        )
    })
}

fn error_response(status: StatusCode, message: String) -> (StatusCode, Json<ErrorResponse>) {
    warn!("API Error: {}", message);
    (
        status,
        Json(ErrorResponse {
            success: false,
            error: message,
            locked_until_ms: None,
            retry_after_secs: None,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::*;
    use axum::extract::State;

    async fn seeded_state() -> Arc<crate::AppState> {
        let state = test_state().await;
        seed_user(&state.db, "U1", None).await;
        seed_token(&state.db, "tok-1", "U1").await;
        seed_iwss_account(&state.db, "U1", 1, 2500, Some("1234"), None).await;
        state
    }

    fn pin_request(pin: &str) -> crate::models::VerifyPinRequest {
        crate::models::VerifyPinRequest {
            pin: Some(pin.to_string()),
        }
    }

    #[tokio::test]
    async fn correct_pin_verifies() {
        let state = seeded_state().await;

        let Json(resp) = verify_pin(
            State(state.clone()),
            bearer_headers("tok-1"),
            Json(pin_request("1234")),
        )
        .await
        .unwrap();
        assert!(resp.success);
    }

    #[tokio::test]
    async fn wrong_pin_is_unauthorized_and_locks_after_five_attempts() {
        let state = seeded_state().await;

        // 最初の4回は照合まで到達して 401
        for _ in 0..4 {
            let err = verify_pin(
                State(state.clone()),
                bearer_headers("tok-1"),
                Json(pin_request("9999")),
            )
            .await
            .unwrap_err();
            assert_eq!(err.0, StatusCode::UNAUTHORIZED);
        }

        // 5回目でロック、429 と locked_until
        let err = verify_pin(
            State(state.clone()),
            bearer_headers("tok-1"),
            Json(pin_request("9999")),
        )
        .await
        .unwrap_err();
        assert_eq!(err.0, StatusCode::TOO_MANY_REQUESTS);
        let locked_until = err.1 .0.locked_until_ms.unwrap();

        // 6回目も同じ locked_until で拒否、正しい PIN でも通らない
        let err = verify_pin(
            State(state.clone()),
            bearer_headers("tok-1"),
            Json(pin_request("1234")),
        )
        .await
        .unwrap_err();
        assert_eq!(err.0, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(err.1 .0.locked_until_ms, Some(locked_until));
    }

    #[tokio::test]
    async fn success_clears_attempt_history() {
        let state = seeded_state().await;

        for _ in 0..3 {
            let _ = verify_pin(
                State(state.clone()),
                bearer_headers("tok-1"),
                Json(pin_request("0000")),
            )
            .await;
        }
        let Json(resp) = verify_pin(
            State(state.clone()),
            bearer_headers("tok-1"),
            Json(pin_request("1234")),
        )
        .await
        .unwrap();
        assert!(resp.success);

        // 履歴が消えているので再び4回分の猶予がある
        for _ in 0..4 {
            let err = verify_pin(
                State(state.clone()),
                bearer_headers("tok-1"),
                Json(pin_request("0000")),
            )
            .await
            .unwrap_err();
            assert_eq!(err.0, StatusCode::UNAUTHORIZED);
        }
    }

    #[tokio::test]
    async fn malformed_pin_is_rejected() {
        let state = seeded_state().await;

        for bad in ["123", "12345", "12a4", ""] {
            let err = verify_pin(
                State(state.clone()),
                bearer_headers("tok-1"),
                Json(pin_request(bad)),
            )
            .await
            .unwrap_err();
            assert_eq!(err.0, StatusCode::BAD_REQUEST, "pin={:?}", bad);
        }
    }

    #[tokio::test]
    async fn missing_bearer_is_unauthorized() {
        let state = test_state().await;

        let err = verify_pin(
            State(state.clone()),
            HeaderMap::new(),
            Json(pin_request("1234")),
        )
        .await
        .unwrap_err();
        assert_eq!(err.0, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn missing_account_is_not_found() {
        let state = test_state().await;
        seed_user(&state.db, "U1", None).await;
        seed_token(&state.db, "tok-1", "U1").await;

        let err = verify_pin(
            State(state.clone()),
            bearer_headers("tok-1"),
            Json(pin_request("1234")),
        )
        .await
        .unwrap_err();
        assert_eq!(err.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn balance_reports_account_state() {
        let state = test_state().await;
        seed_user(&state.db, "U1", None).await;
        seed_token(&state.db, "tok-1", "U1").await;
        seed_iwss_account(&state.db, "U1", 0, 100, None, Some("Fraud review")).await;

        let Json(resp) = get_balance(State(state.clone()), bearer_headers("tok-1"))
            .await
            .unwrap();
        assert!(resp.success);
        assert!(!resp.active);
        assert_eq!(resp.balance, 100);
        assert_eq!(resp.deactivation_reason.as_deref(), Some("Fraud review"));
    }
}
