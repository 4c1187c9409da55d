//! Referral API Handlers
//! /api/referrals エンドポイント - 紹介コードの発行

use axum::{extract::State, http::StatusCode, response::Json};
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::db::DbPool;
use crate::models::{GenerateReferralRequest, GenerateReferralResponse, Referral, User};
use crate::AppState;

/// 紹介コードの桁数
const REFERRAL_CODE_LEN: usize = 8;
/// 衝突時の再生成上限
const MAX_GENERATION_ATTEMPTS: u32 = 10;

const REFERRAL_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

#[derive(Serialize, Debug)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

/// 8文字の大文字英数字候補を生成する
fn generate_referral_candidate() -> String {
    let mut rng = rand::thread_rng();
    (0..REFERRAL_CODE_LEN)
        .map(|_| {
            let idx = rng.gen_range(0..REFERRAL_CHARSET.len());
            REFERRAL_CHARSET[idx] as char
        })
        .collect()
}

/// settled な紹介に対してカウンタを1加算する（ベストエフォート）
pub async fn bump_referral(db: &DbPool, code: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE referrals SET total_referrals = total_referrals + 1 WHERE code = ? AND active = 1",
    )
    .bind(code)
    .execute(db)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// POST /api/referrals - 紹介コード発行
///
/// 既存コードがインデックスに残っていればそのまま返す（冪等）。
/// 無ければ最大10回まで候補生成と存在チェックを繰り返す。
pub async fn generate_referral_code(
    State(state): State<Arc<AppState>>,
    Json(req): Json<GenerateReferralRequest>,
) -> Result<Json<GenerateReferralResponse>, (StatusCode, Json<ErrorResponse>)> {
    let user_id = req.user_id.filter(|u| !u.is_empty()).ok_or_else(|| {
        error_response(StatusCode::BAD_REQUEST, "user_id is required".to_string())
    })?;

    let user: Option<User> = sqlx::query_as("SELECT * FROM users WHERE user_id = ?")
        .bind(&user_id)
        .fetch_optional(&state.db)
        .await
        .map_err(|e| {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("DB error: {}", e))
        })?;

    let user = user.ok_or_else(|| {
        error_response(StatusCode::NOT_FOUND, format!("User not found: {}", user_id))
    })?;

    // 既存コードがインデックスに残っていればそれを返す
    if let Some(code) = &user.referral_code {
        let existing: Option<Referral> =
            sqlx::query_as("SELECT * FROM referrals WHERE code = ?")
                .bind(code)
                .fetch_optional(&state.db)
                .await
                .map_err(|e| {
                    error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("DB error: {}", e))
                })?;

        if let Some(referral) = existing {
            return Ok(Json(GenerateReferralResponse {
                success: true,
                referral_code: referral.code,
            }));
        }
        warn!(
            "Profile had referral code missing from index, regenerating: user_id={}",
            user_id
        );
    }

    let now = chrono::Utc::now().timestamp_millis();

    for _ in 0..MAX_GENERATION_ATTEMPTS {
        let candidate = generate_referral_candidate();

        let taken: Option<(String,)> =
            sqlx::query_as("SELECT code FROM referrals WHERE code = ?")
                .bind(&candidate)
                .fetch_optional(&state.db)
                .await
                .map_err(|e| {
                    error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("DB error: {}", e))
                })?;

        if taken.is_some() {
            continue;
        }

        // インデックス登録とプロフィール更新は別書き込み
        // （間で落ちると孤児インデックスが残りうるが、紹介コードは追加的なので許容）
        sqlx::query(
            "INSERT INTO referrals (code, owner_id, total_referrals, active, created_at_ms) VALUES (?, ?, 0, 1, ?)",
        )
        .bind(&candidate)
        .bind(&user_id)
        .bind(now)
        .execute(&state.db)
        .await
        .map_err(|e| {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("DB error: {}", e))
        })?;

        sqlx::query("UPDATE users SET referral_code = ? WHERE user_id = ?")
            .bind(&candidate)
            .bind(&user_id)
            .execute(&state.db)
            .await
            .map_err(|e| {
                error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("DB error: {}", e))
            })?;

        info!("Referral code issued: user_id={}, code={}", user_id, candidate);

        return Ok(Json(GenerateReferralResponse {
            success: true,
            referral_code: candidate,
        }));
    }

    Err(error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "Failed to generate a unique referral code".to_string(),
    ))
}

fn error_response(status: StatusCode, message: String) -> (StatusCode, Json<ErrorResponse>) {
    warn!("API Error: {}", message);
    (status, Json(ErrorResponse { success: false, error: message }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::*;
    use axum::extract::State;
    use std::collections::HashSet;

    #[test]
    fn candidates_are_eight_uppercase_alphanumerics() {
        for _ in 0..100 {
            let code = generate_referral_candidate();
            assert_eq!(code.len(), REFERRAL_CODE_LEN);
            assert!(code
                .bytes()
                .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit()));
        }
    }

    #[tokio::test]
    async fn issued_codes_are_unique_across_many_users() {
        let state = test_state().await;
        let mut seen = HashSet::new();

        for i in 0..1000 {
            let user_id = format!("U{}", i);
            seed_user(&state.db, &user_id, None).await;

            let req = crate::models::GenerateReferralRequest {
                user_id: Some(user_id),
            };
            let Json(resp) = generate_referral_code(State(state.clone()), Json(req))
                .await
                .unwrap();
            assert!(seen.insert(resp.referral_code), "duplicate code issued");
        }
    }

    #[tokio::test]
    async fn same_user_gets_same_code_twice() {
        let state = test_state().await;
        seed_user(&state.db, "U1", None).await;

        let req = crate::models::GenerateReferralRequest {
            user_id: Some("U1".to_string()),
        };
        let Json(first) = generate_referral_code(State(state.clone()), Json(req))
            .await
            .unwrap();

        let req = crate::models::GenerateReferralRequest {
            user_id: Some("U1".to_string()),
        };
        let Json(second) = generate_referral_code(State(state.clone()), Json(req))
            .await
            .unwrap();

        assert_eq!(first.referral_code, second.referral_code);
    }

    #[tokio::test]
    async fn stale_profile_code_is_regenerated() {
        let state = test_state().await;
        // プロフィールにはコードがあるがインデックスに無い
        seed_user(&state.db, "U1", Some("GONE1234")).await;

        let req = crate::models::GenerateReferralRequest {
            user_id: Some("U1".to_string()),
        };
        let Json(resp) = generate_referral_code(State(state.clone()), Json(req))
            .await
            .unwrap();
        assert_ne!(resp.referral_code, "GONE1234");

        let referral = get_referral(&state.db, &resp.referral_code).await;
        assert_eq!(referral.owner_id, "U1");
    }

    #[tokio::test]
    async fn unknown_user_is_not_found() {
        let state = test_state().await;

        let req = crate::models::GenerateReferralRequest {
            user_id: Some("NOPE".to_string()),
        };
        let err = generate_referral_code(State(state.clone()), Json(req))
            .await
            .unwrap_err();
        assert_eq!(err.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn bump_referral_increments_active_codes_only() {
        let state = test_state().await;
        seed_user(&state.db, "U1", None).await;
        seed_referral(&state.db, "ABCD1234", "U1", 1).await;
        seed_referral(&state.db, "WXYZ0000", "U1", 0).await;

        assert!(bump_referral(&state.db, "ABCD1234").await.unwrap());
        assert!(!bump_referral(&state.db, "WXYZ0000").await.unwrap());

        let referral = get_referral(&state.db, "ABCD1234").await;
        assert_eq!(referral.total_referrals, 2);
        assert_eq!(get_referral(&state.db, "WXYZ0000").await.total_referrals, 1);
    }
}
