//! Atomic Sale API Handlers
//! /api/sales エンドポイント - 在庫・売上の原子的更新

use axum::{extract::State, http::StatusCode, response::Json};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::db::{self, DbPool};
use crate::models::{
    op_scope, ApplySaleRequest, ApplySaleResponse, Event, OperationsPerformed, TicketPrice,
};
use crate::AppState;

#[derive(Serialize, Debug)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

#[derive(Debug, Error)]
pub enum SaleError {
    #[error("Event not found: {0}")]
    EventNotFound(String),
    #[error(transparent)]
    Store(#[from] sqlx::Error),
}

/// 1チケット分の適用結果
#[derive(Debug)]
pub struct SaleOutcome {
    pub already_processed: bool,
    pub operations: OperationsPerformed,
}

/// チケット1枚の販売をイベント集約へ原子的に適用する。
///
/// マーカー確認・在庫減算・販売数/売上加算・マーカー書き込みを
/// 1つのトランザクションで行う。同じ ticket_id の再適用は no-op。
pub async fn apply_ticket_sale(
    db: &DbPool,
    event_id: &str,
    ticket_type: &str,
    unit_price: i64,
    ticket_id: &str,
) -> Result<SaleOutcome, SaleError> {
    let mut tx = db.begin().await?;

    // 冪等性マーカー確認（同一トランザクション内）
    if db::is_processed(&mut *tx, op_scope::SALE, ticket_id).await? {
        info!("Ticket already processed, skipping: ticket_id={}", ticket_id);
        return Ok(SaleOutcome {
            already_processed: true,
            operations: OperationsPerformed::default(),
        });
    }

    // イベント集約の読み取り
    let event: Option<Event> = sqlx::query_as("SELECT * FROM events WHERE event_id = ?")
        .bind(event_id)
        .fetch_optional(&mut *tx)
        .await?;

    let event = event.ok_or_else(|| SaleError::EventNotFound(event_id.to_string()))?;

    // 在庫チェック
    // available_tickets が NULL なら無制限。0 のときは減算しないが販売自体は通す
    // （在庫は Reference 作成時点で概念的に確保済みのため advisory 扱い）。
    let price_row: Option<TicketPrice> = sqlx::query_as(
        "SELECT * FROM ticket_prices WHERE event_id = ? AND ticket_type = ?",
    )
    .bind(event_id)
    .bind(ticket_type)
    .fetch_optional(&mut *tx)
    .await?;

    let mut inventory_decremented = false;
    match price_row {
        Some(tp) => {
            if let Some(available) = tp.available_tickets {
                if available > 0 {
                    sqlx::query(
                        "UPDATE ticket_prices SET available_tickets = available_tickets - 1 WHERE id = ?",
                    )
                    .bind(tp.id)
                    .execute(&mut *tx)
                    .await?;
                    inventory_decremented = true;
                } else {
                    warn!(
                        "Ticket type exhausted, sale proceeds without decrement: event_id={}, ticket_type={}",
                        event_id, ticket_type
                    );
                }
            }
        }
        None => {
            warn!(
                "Unknown ticket type, treated as unlimited: event_id={}, ticket_type={}",
                event_id, ticket_type
            );
        }
    }

    // 販売数・売上カウンタは無条件に加算
    sqlx::query(
        "UPDATE events SET tickets_sold = ?, total_revenue = ? WHERE event_id = ?",
    )
    .bind(event.tickets_sold + 1)
    .bind(event.total_revenue + unit_price)
    .bind(event_id)
    .execute(&mut *tx)
    .await?;

    // マーカー書き込み（同一トランザクション内）
    let payload = serde_json::json!({
        "event_id": event_id,
        "ticket_type": ticket_type,
        "unit_price": unit_price,
    })
    .to_string();
    db::mark_processed(&mut *tx, op_scope::SALE, ticket_id, &payload).await?;

    tx.commit().await?;

    info!(
        "Ticket sale applied: event_id={}, ticket_id={}, price={}, inventory_decremented={}",
        event_id, ticket_id, unit_price, inventory_decremented
    );

    Ok(SaleOutcome {
        already_processed: false,
        operations: OperationsPerformed {
            sold_incremented: true,
            revenue_updated: true,
            inventory_decremented,
            discount_updated: false,
        },
    })
}

/// POST /api/sales - チケット販売の原子的適用
pub async fn apply_sale(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ApplySaleRequest>,
) -> Result<Json<ApplySaleResponse>, (StatusCode, Json<ErrorResponse>)> {
    // 必須フィールドチェック
    let _creator_id = req.creator_id.ok_or_else(|| {
        error_response(StatusCode::BAD_REQUEST, "creator_id is required".to_string())
    })?;
    let event_id = req.event_id.ok_or_else(|| {
        error_response(StatusCode::BAD_REQUEST, "event_id is required".to_string())
    })?;
    let ticket_type = req.ticket_type.ok_or_else(|| {
        error_response(StatusCode::BAD_REQUEST, "ticket_type is required".to_string())
    })?;
    let ticket_price = req.ticket_price.ok_or_else(|| {
        error_response(StatusCode::BAD_REQUEST, "ticket_price is required".to_string())
    })?;
    let ticket_id = req.ticket_id.ok_or_else(|| {
        error_response(StatusCode::BAD_REQUEST, "ticket_id is required".to_string())
    })?;

    let outcome = apply_ticket_sale(&state.db, &event_id, &ticket_type, ticket_price, &ticket_id)
        .await
        .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    let mut operations = outcome.operations;

    // 割引の消化はトランザクション外のベストエフォート
    if !outcome.already_processed {
        if let Some(code) = &req.discount_code {
            match super::discounts::redeem_discount(&state.db, &event_id, code).await {
                Ok(true) => operations.discount_updated = true,
                Ok(false) => {
                    warn!("Discount code not found at redemption: event_id={}, code={}", event_id, code);
                }
                Err(e) => {
                    warn!("Discount redemption failed: code={}, error={}", code, e);
                    db::record_dead_letter(&state.db, "discount", &ticket_id, &e.to_string()).await;
                }
            }
        }
    }

    Ok(Json(ApplySaleResponse {
        success: true,
        already_processed: outcome.already_processed,
        operations_performed: operations,
    }))
}

fn error_response(status: StatusCode, message: String) -> (StatusCode, Json<ErrorResponse>) {
    warn!("API Error: {}", message);
    (status, Json(ErrorResponse { success: false, error: message }))
}
