//! Reference Ledger API Handlers
//! /api/references エンドポイント - 決済 Reference の作成とゲートウェイ照合

use axum::{extract::State, http::StatusCode, response::Json};
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::db;
use crate::models::{
    reference_kind, reference_status, CreateFreeReferenceRequest, CreateReferenceRequest,
    PaymentReference, ReferenceCreateResponse, VerifyReferenceRequest, VerifyReferenceResponse,
};
use crate::AppState;

#[derive(Serialize, Debug)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

/// Reference ID を生成する（10バイトの乱数 → Crockford Base32 で16文字）。
/// 主キー挿入が put-if-absent を保証する。
pub fn generate_reference_id(prefix: &str) -> String {
    let random_bytes: [u8; 10] = rand::thread_rng().gen();
    let encoded = base32::encode(base32::Alphabet::Crockford, &random_bytes);
    format!("{}-{}", prefix, encoded)
}

/// POST /api/references - 有料チケット Reference 作成
pub async fn create_reference(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateReferenceRequest>,
) -> Result<(StatusCode, Json<ReferenceCreateResponse>), (StatusCode, Json<ErrorResponse>)> {
    // 必須フィールドチェック
    let event_id = req.event_id.ok_or_else(|| {
        error_response(StatusCode::BAD_REQUEST, "event_id is required".to_string())
    })?;
    let creator_id = req.creator_id.ok_or_else(|| {
        error_response(StatusCode::BAD_REQUEST, "creator_id is required".to_string())
    })?;
    let ticket_type = req.ticket_type.ok_or_else(|| {
        error_response(StatusCode::BAD_REQUEST, "ticket_type is required".to_string())
    })?;
    let ticket_price = req.ticket_price.ok_or_else(|| {
        error_response(StatusCode::BAD_REQUEST, "ticket_price is required".to_string())
    })?;
    let total_amount = req.total_amount.ok_or_else(|| {
        error_response(StatusCode::BAD_REQUEST, "total_amount is required".to_string())
    })?;

    let quantity = req.quantity.unwrap_or(1);
    if quantity < 1 {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "quantity must be positive".to_string(),
        ));
    }

    let reference_id = generate_reference_id("TKT");
    let now = chrono::Utc::now().timestamp_millis();
    let vendor = req.vendor.unwrap_or_else(|| "paystack".to_string());

    sqlx::query(
        r#"
        INSERT INTO payment_references (
            reference_id, kind, subject_id, buyer_email, event_id, creator_id,
            ticket_type, unit_price, quantity, total_amount,
            discount_code, referral_code, vendor, status, created_at_ms
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&reference_id)
    .bind(reference_kind::TICKET)
    .bind(&req.user_id)
    .bind(&req.buyer_email)
    .bind(&event_id)
    .bind(&creator_id)
    .bind(&ticket_type)
    .bind(ticket_price)
    .bind(quantity)
    .bind(total_amount)
    .bind(&req.discount_code)
    .bind(&req.referral_code)
    .bind(&vendor)
    .bind(reference_status::PENDING)
    .bind(now)
    .execute(&state.db)
    .await
    .map_err(|e| {
        error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("DB error: {}", e))
    })?;

    let reference = fetch_reference(&state, &reference_id).await?;

    info!(
        "Payment reference created: reference_id={}, event_id={}, amount={}",
        reference_id, event_id, total_amount
    );

    Ok((
        StatusCode::CREATED,
        Json(ReferenceCreateResponse {
            success: true,
            reference,
        }),
    ))
}

/// POST /api/references/free - 無料チケット Reference 作成
/// ゲートウェイ確認が無いので settled で直接作成する
pub async fn create_free_reference(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateFreeReferenceRequest>,
) -> Result<(StatusCode, Json<ReferenceCreateResponse>), (StatusCode, Json<ErrorResponse>)> {
    let event_id = req.event_id.ok_or_else(|| {
        error_response(StatusCode::BAD_REQUEST, "event_id is required".to_string())
    })?;
    let creator_id = req.creator_id.ok_or_else(|| {
        error_response(StatusCode::BAD_REQUEST, "creator_id is required".to_string())
    })?;
    let ticket_type = req.ticket_type.ok_or_else(|| {
        error_response(StatusCode::BAD_REQUEST, "ticket_type is required".to_string())
    })?;

    let reference_id = generate_reference_id("TKT");
    let now = chrono::Utc::now().timestamp_millis();

    sqlx::query(
        r#"
        INSERT INTO payment_references (
            reference_id, kind, subject_id, buyer_email, event_id, creator_id,
            ticket_type, unit_price, quantity, total_amount, vendor, status,
            created_at_ms, completed_at_ms
        ) VALUES (?, ?, ?, ?, ?, ?, ?, 0, 1, 0, 'free', ?, ?, ?)
        "#,
    )
    .bind(&reference_id)
    .bind(reference_kind::TICKET)
    .bind(&req.user_id)
    .bind(&req.buyer_email)
    .bind(&event_id)
    .bind(&creator_id)
    .bind(&ticket_type)
    .bind(reference_status::SETTLED)
    .bind(now)
    .bind(now)
    .execute(&state.db)
    .await
    .map_err(|e| {
        error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("DB error: {}", e))
    })?;

    let reference = fetch_reference(&state, &reference_id).await?;

    info!(
        "Free reference created: reference_id={}, event_id={}",
        reference_id, event_id
    );

    Ok((
        StatusCode::CREATED,
        Json(ReferenceCreateResponse {
            success: true,
            reference,
        }),
    ))
}

/// POST /api/references/verify - ゲートウェイ確認の照合と決済確定
///
/// Reference のステータス更新 → 集約更新（投票 or 在庫/売上）→
/// Analytics → 割引/紹介の順に実行する。各ステップは独立した障害境界を
/// 持ち、後段の失敗は dead_letters に記録するだけで前段を巻き戻さない。
pub async fn verify_reference(
    State(state): State<Arc<AppState>>,
    Json(req): Json<VerifyReferenceRequest>,
) -> Result<Json<VerifyReferenceResponse>, (StatusCode, Json<ErrorResponse>)> {
    // 必須フィールドチェック
    let reference_id = req.reference.ok_or_else(|| {
        error_response(StatusCode::BAD_REQUEST, "reference is required".to_string())
    })?;
    let status = req.status.ok_or_else(|| {
        error_response(StatusCode::BAD_REQUEST, "status is required".to_string())
    })?;
    let transaction_reference = req.transaction_reference.ok_or_else(|| {
        error_response(
            StatusCode::BAD_REQUEST,
            "transaction_reference is required".to_string(),
        )
    })?;

    if status != reference_status::SUCCESS && status != reference_status::FAILED {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "status must be 'success' or 'failed'".to_string(),
        ));
    }

    let reference: Option<PaymentReference> =
        sqlx::query_as("SELECT * FROM payment_references WHERE reference_id = ?")
            .bind(&reference_id)
            .fetch_optional(&state.db)
            .await
            .map_err(|e| {
                error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("DB error: {}", e))
            })?;

    let reference = reference.ok_or_else(|| {
        error_response(
            StatusCode::NOT_FOUND,
            format!("Reference not found: {}", reference_id),
        )
    })?;

    // 再配信は保存済みの結果を返す（効果は再適用しない）
    if reference.status != reference_status::PENDING {
        info!(
            "Reference already finalized, skipping: reference_id={}, status={}",
            reference_id, reference.status
        );
        return Ok(Json(VerifyReferenceResponse {
            success: true,
            reference_id,
            status: reference.status,
            already_processed: true,
            message: "Reference already processed".to_string(),
        }));
    }

    let now = chrono::Utc::now().timestamp_millis();

    if status == reference_status::FAILED {
        let reason = req
            .failure_reason
            .unwrap_or_else(|| "Payment failed".to_string());
        sqlx::query(
            "UPDATE payment_references SET status = ?, gateway_tx_ref = ?, failure_reason = ?, completed_at_ms = ? WHERE reference_id = ?",
        )
        .bind(reference_status::FAILED)
        .bind(&transaction_reference)
        .bind(&reason)
        .bind(now)
        .bind(&reference_id)
        .execute(&state.db)
        .await
        .map_err(|e| {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("DB error: {}", e))
        })?;

        info!(
            "Payment failure recorded: reference_id={}, reason={}",
            reference_id, reason
        );

        return Ok(Json(VerifyReferenceResponse {
            success: true,
            reference_id,
            status: reference_status::FAILED.to_string(),
            already_processed: false,
            message: "Payment failure recorded".to_string(),
        }));
    }

    // Reference ステータスの確定（最初の障害境界）
    sqlx::query(
        "UPDATE payment_references SET status = ?, gateway_tx_ref = ?, completed_at_ms = ? WHERE reference_id = ?",
    )
    .bind(reference_status::SUCCESS)
    .bind(&transaction_reference)
    .bind(now)
    .bind(&reference_id)
    .execute(&state.db)
    .await
    .map_err(|e| {
        error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("DB error: {}", e))
    })?;

    info!("Payment confirmed: reference_id={}", reference_id);

    settle_downstream(&state, &reference).await;

    Ok(Json(VerifyReferenceResponse {
        success: true,
        reference_id,
        status: reference_status::SUCCESS.to_string(),
        already_processed: false,
        message: "Payment settled".to_string(),
    }))
}

/// 確定済み Reference の後続集約更新。
/// 各ステップの失敗はログと dead_letters への記録に留め、決済応答は成功のまま。
async fn settle_downstream(state: &Arc<AppState>, reference: &PaymentReference) {
    match reference.kind.as_str() {
        reference_kind::VOTE => {
            let contestant_id = reference.contestant_id.clone().unwrap_or_default();
            let entry = super::votes::VoteAuditEntry {
                buyer: reference
                    .subject_id
                    .clone()
                    .or_else(|| reference.buyer_email.clone()),
                price: reference.unit_price,
                reference_id: reference.reference_id.clone(),
            };
            if let Err(e) = super::votes::apply_vote(
                &state.db,
                &reference.event_id,
                &contestant_id,
                reference.quantity,
                reference.total_amount,
                &entry,
            )
            .await
            {
                warn!(
                    "Vote tally step failed: reference_id={}, error={}",
                    reference.reference_id, e
                );
                db::record_dead_letter(&state.db, "vote", &reference.reference_id, &e.to_string())
                    .await;
            }
        }
        _ => {
            let ticket_type = reference.ticket_type.clone().unwrap_or_default();

            for i in 1..=reference.quantity {
                let ticket_id = format!("{}-{}", reference.reference_id, i);

                if let Err(e) = super::sales::apply_ticket_sale(
                    &state.db,
                    &reference.event_id,
                    &ticket_type,
                    reference.unit_price,
                    &ticket_id,
                )
                .await
                {
                    warn!(
                        "Sale step failed: ticket_id={}, error={}",
                        ticket_id, e
                    );
                    db::record_dead_letter(&state.db, "sale", &ticket_id, &e.to_string()).await;
                }

                if let Err(e) = super::analytics::record_ticket_sale(
                    &state.db,
                    &ticket_id,
                    reference.unit_price,
                    Some(&reference.event_id),
                    chrono::Utc::now().timestamp_millis(),
                )
                .await
                {
                    warn!(
                        "Analytics step failed: ticket_id={}, error={}",
                        ticket_id, e
                    );
                    db::record_dead_letter(&state.db, "analytics", &ticket_id, &e.to_string())
                        .await;
                }
            }

            if let Some(code) = &reference.discount_code {
                match super::discounts::redeem_discount(&state.db, &reference.event_id, code).await
                {
                    Ok(true) => {}
                    Ok(false) => warn!(
                        "Discount code missing at redemption: reference_id={}, code={}",
                        reference.reference_id, code
                    ),
                    Err(e) => {
                        warn!("Discount step failed: code={}, error={}", code, e);
                        db::record_dead_letter(
                            &state.db,
                            "discount",
                            &reference.reference_id,
                            &e.to_string(),
                        )
                        .await;
                    }
                }
            }

            if let Some(code) = &reference.referral_code {
                match super::referrals::bump_referral(&state.db, code).await {
                    Ok(true) => {}
                    Ok(false) => warn!(
                        "Referral code missing or inactive at settlement: reference_id={}, code={}",
                        reference.reference_id, code
                    ),
                    Err(e) => {
                        warn!("Referral step failed: code={}, error={}", code, e);
                        db::record_dead_letter(
                            &state.db,
                            "referral",
                            &reference.reference_id,
                            &e.to_string(),
                        )
                        .await;
                    }
                }
            }
        }
    }
}

async fn fetch_reference(
    state: &Arc<AppState>,
    reference_id: &str,
) -> Result<PaymentReference, (StatusCode, Json<ErrorResponse>)> {
    sqlx::query_as("SELECT * FROM payment_references WHERE reference_id = ?")
        .bind(reference_id)
        .fetch_one(&state.db)
        .await
        .map_err(|e| {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("DB error: {}", e))
        })
}

fn error_response(status: StatusCode, message: String) -> (StatusCode, Json<ErrorResponse>) {
    warn!("API Error: {}", message);
    (status, Json(ErrorResponse { success: false, error: message }))
}
