//! Discount API Handlers
//! /api/discounts エンドポイント - 割引コードの検証と消化

use axum::{extract::State, http::HeaderMap, http::StatusCode, response::Json};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::auth::{self, AuthError};
use crate::db::DbPool;
use crate::models::{discount_kind, Discount, ValidateDiscountRequest, ValidateDiscountResponse};
use crate::AppState;

#[derive(Serialize, Debug)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

#[derive(Debug, Error)]
pub enum DiscountError {
    #[error("Discount code not found")]
    NotFound,
    #[error("Discount code is inactive")]
    Inactive,
    #[error("Discount code usage limit reached")]
    LimitReached,
    #[error(transparent)]
    Store(#[from] sqlx::Error),
}

/// 割引コードの適用可否を検証する。
/// NotFound → Inactive → LimitReached の順で判定。
pub async fn validate_discount_code(
    db: &DbPool,
    event_id: &str,
    code: &str,
) -> Result<Discount, DiscountError> {
    let discount: Option<Discount> =
        sqlx::query_as("SELECT * FROM discounts WHERE event_id = ? AND code = ?")
            .bind(event_id)
            .bind(code)
            .fetch_optional(db)
            .await?;

    let discount = discount.ok_or(DiscountError::NotFound)?;

    if discount.active == 0 {
        return Err(DiscountError::Inactive);
    }
    if discount.used_count >= discount.max_uses {
        return Err(DiscountError::LimitReached);
    }

    Ok(discount)
}

/// 割引額を計算する。percentage は 100% でキャップ。
pub fn discount_amount(discount: &Discount, amount: Option<i64>) -> Option<i64> {
    let amount = amount?;
    match discount.kind.as_str() {
        discount_kind::PERCENTAGE => {
            let pct = discount.value.min(100);
            Some(amount * pct / 100)
        }
        _ => Some(discount.value),
    }
}

/// used_count を無条件にインクリメントする（消化）。
///
/// 在庫トランザクションの外で呼ばれるベストエフォート処理。
/// max_uses の再チェックは行わないため、上限付近の並行消化は超過しうる。
/// 戻り値はコードが存在したかどうか。
pub async fn redeem_discount(db: &DbPool, event_id: &str, code: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE discounts SET used_count = used_count + 1 WHERE event_id = ? AND code = ?",
    )
    .bind(event_id)
    .bind(code)
    .execute(db)
    .await?;

    let redeemed = result.rows_affected() > 0;
    if redeemed {
        info!("Discount redeemed: event_id={}, code={}", event_id, code);
    }
    Ok(redeemed)
}

/// POST /api/discounts/validate - 割引コード検証
pub async fn validate_discount(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ValidateDiscountRequest>,
) -> Result<Json<ValidateDiscountResponse>, (StatusCode, Json<ErrorResponse>)> {
    // Bearer 検証
    auth::verify_bearer(&state.db, &headers).await.map_err(|e| match e {
        AuthError::Store(_) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        _ => error_response(StatusCode::UNAUTHORIZED, e.to_string()),
    })?;

    // 必須フィールドチェック
    let code = req.code.filter(|c| !c.is_empty()).ok_or_else(|| {
        error_response(StatusCode::BAD_REQUEST, "code is required".to_string())
    })?;
    let event_id = req.event_id.ok_or_else(|| {
        error_response(StatusCode::BAD_REQUEST, "event_id is required".to_string())
    })?;
    let _event_creator_id = req.event_creator_id.ok_or_else(|| {
        error_response(StatusCode::BAD_REQUEST, "event_creator_id is required".to_string())
    })?;

    let discount = validate_discount_code(&state.db, &event_id, &code)
        .await
        .map_err(|e| match e {
            DiscountError::NotFound => error_response(StatusCode::NOT_FOUND, e.to_string()),
            DiscountError::Inactive | DiscountError::LimitReached => {
                error_response(StatusCode::BAD_REQUEST, e.to_string())
            }
            DiscountError::Store(_) => {
                error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        })?;

    let computed = discount_amount(&discount, req.amount);

    Ok(Json(ValidateDiscountResponse {
        success: true,
        code: discount.code.clone(),
        discount_type: discount.kind.clone(),
        // percentage は 100 でキャップした値を返す
        value: if discount.kind == discount_kind::PERCENTAGE {
            discount.value.min(100)
        } else {
            discount.value
        },
        max_uses: discount.max_uses,
        used_count: discount.used_count,
        discount_amount: computed,
    }))
}

fn error_response(status: StatusCode, message: String) -> (StatusCode, Json<ErrorResponse>) {
    warn!("API Error: {}", message);
    (status, Json(ErrorResponse { success: false, error: message }))
}
