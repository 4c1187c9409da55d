//! Vote API Handlers
//! /api/references/vote エンドポイント - 投票決済 Reference と得票集計

use axum::{extract::State, http::HeaderMap, http::StatusCode, response::Json};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::{self, AuthError};
use crate::db::DbPool;
use crate::models::{
    reference_kind, reference_status, Contestant, CreateVoteReferenceRequest, PaymentReference,
    Poll, ReferenceCreateResponse,
};
use crate::AppState;

#[derive(Serialize, Debug)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

#[derive(Debug, Error)]
pub enum VoteError {
    #[error("Poll not found: {0}")]
    PollNotFound(String),
    #[error(transparent)]
    Store(#[from] sqlx::Error),
}

/// 監査ログ1件分の入力
#[derive(Debug, Clone)]
pub struct VoteAuditEntry {
    pub buyer: Option<String>,
    pub price: i64,
    pub reference_id: String,
}

/// 決済確認済みの投票を Poll 集約へ反映する。
///
/// 対象者の得票加算・Poll カウンタ加算・監査エントリ追加の3つは
/// 独立した書き込みで、単一トランザクションにはしない。呼び出し元の
/// 照合ステップが Reference ステータス遷移1回につき1回だけ呼ぶ前提。
pub async fn apply_vote(
    db: &DbPool,
    poll_id: &str,
    contestant_id: &str,
    vote_count: i64,
    amount: i64,
    entry: &VoteAuditEntry,
) -> Result<(), VoteError> {
    let now = chrono::Utc::now().timestamp_millis();

    // Poll 集約の読み取り
    let poll: Option<Poll> = sqlx::query_as("SELECT * FROM polls WHERE poll_id = ?")
        .bind(poll_id)
        .fetch_optional(db)
        .await?;

    if poll.is_none() {
        return Err(VoteError::PollNotFound(poll_id.to_string()));
    }

    // 対象者を探して得票を書き戻す（見つからない場合は一覧を変えない）
    let contestant: Option<Contestant> = sqlx::query_as(
        "SELECT * FROM contestants WHERE poll_id = ? AND contestant_id = ?",
    )
    .bind(poll_id)
    .bind(contestant_id)
    .fetch_optional(db)
    .await?;

    match contestant {
        Some(c) => {
            sqlx::query("UPDATE contestants SET votes = ? WHERE id = ?")
                .bind(c.votes + vote_count)
                .bind(c.id)
                .execute(db)
                .await?;
        }
        None => {
            warn!(
                "Contestant not found, tally unchanged: poll_id={}, contestant_id={}",
                poll_id, contestant_id
            );
        }
    }

    // Poll レベルのカウンタはアトミック加算
    sqlx::query(
        "UPDATE polls SET poll_count = poll_count + ?, amount_collected = amount_collected + ? WHERE poll_id = ?",
    )
    .bind(vote_count)
    .bind(amount)
    .bind(poll_id)
    .execute(db)
    .await?;

    // 監査エントリ追加
    sqlx::query(
        r#"
        INSERT INTO poll_entries (entry_id, poll_id, buyer, vote_count, price, contestant_id, reference_id, created_at_ms)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(poll_id)
    .bind(&entry.buyer)
    .bind(vote_count)
    .bind(entry.price)
    .bind(contestant_id)
    .bind(&entry.reference_id)
    .bind(now)
    .execute(db)
    .await?;

    info!(
        "Vote applied: poll_id={}, contestant_id={}, votes={}, reference={}",
        poll_id, contestant_id, vote_count, entry.reference_id
    );

    Ok(())
}

/// POST /api/references/vote - 投票決済 Reference 作成
pub async fn create_vote_reference(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateVoteReferenceRequest>,
) -> Result<(StatusCode, Json<ReferenceCreateResponse>), (StatusCode, Json<ErrorResponse>)> {
    // 必須フィールドチェック
    let poll_id = req.poll_id.ok_or_else(|| {
        error_response(StatusCode::BAD_REQUEST, "poll_id is required".to_string())
    })?;
    let creator_id = req.creator_id.ok_or_else(|| {
        error_response(StatusCode::BAD_REQUEST, "creator_id is required".to_string())
    })?;
    let contestant_id = req.contestant_id.ok_or_else(|| {
        error_response(StatusCode::BAD_REQUEST, "contestant_id is required".to_string())
    })?;
    let poll_price = req.poll_price.ok_or_else(|| {
        error_response(StatusCode::BAD_REQUEST, "poll_price is required".to_string())
    })?;
    let vote_count = req.vote_count.ok_or_else(|| {
        error_response(StatusCode::BAD_REQUEST, "vote_count is required".to_string())
    })?;
    let total_amount = req.total_amount.ok_or_else(|| {
        error_response(StatusCode::BAD_REQUEST, "total_amount is required".to_string())
    })?;

    // Bearer があれば本人、無ければゲスト識別が必要
    let (subject_id, buyer_email) = if headers.contains_key(axum::http::header::AUTHORIZATION) {
        let identity = auth::verify_bearer(&state.db, &headers).await.map_err(|e| match e {
            AuthError::Store(_) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            _ => error_response(StatusCode::UNAUTHORIZED, e.to_string()),
        })?;
        (Some(identity.user_id), identity.email)
    } else {
        let guest_email = req.guest_email.filter(|e| !e.is_empty()).ok_or_else(|| {
            error_response(
                StatusCode::BAD_REQUEST,
                "guest_email or bearer identity is required".to_string(),
            )
        })?;
        (None, Some(guest_email))
    };

    let reference_id = super::references::generate_reference_id("VOTE");
    let now = chrono::Utc::now().timestamp_millis();
    let vendor = req.vendor.unwrap_or_else(|| "paystack".to_string());

    sqlx::query(
        r#"
        INSERT INTO payment_references (
            reference_id, kind, subject_id, buyer_email, event_id, creator_id,
            contestant_id, unit_price, quantity, total_amount, vendor, status, created_at_ms
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&reference_id)
    .bind(reference_kind::VOTE)
    .bind(&subject_id)
    .bind(&buyer_email)
    .bind(&poll_id)
    .bind(&creator_id)
    .bind(&contestant_id)
    .bind(poll_price)
    .bind(vote_count)
    .bind(total_amount)
    .bind(&vendor)
    .bind(reference_status::PENDING)
    .bind(now)
    .execute(&state.db)
    .await
    .map_err(|e| {
        error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("DB error: {}", e))
    })?;

    let reference: PaymentReference =
        sqlx::query_as("SELECT * FROM payment_references WHERE reference_id = ?")
            .bind(&reference_id)
            .fetch_one(&state.db)
            .await
            .map_err(|e| {
                error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("DB error: {}", e))
            })?;

    info!(
        "Vote reference created: reference_id={}, poll_id={}, votes={}",
        reference_id, poll_id, vote_count
    );

    Ok((
        StatusCode::CREATED,
        Json(ReferenceCreateResponse {
            success: true,
            reference,
        }),
    ))
}

fn error_response(status: StatusCode, message: String) -> (StatusCode, Json<ErrorResponse>) {
    warn!("API Error: {}", message);
    (status, Json(ErrorResponse { success: false, error: message }))
}
