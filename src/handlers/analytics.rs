//! Analytics API Handlers
//! /api/analytics エンドポイント - 日/月/年バケットへの売上計上

use axum::{extract::State, http::StatusCode, response::Json};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::db::DbPool;
use crate::models::{op_scope, RecordAnalyticsRequest, RecordAnalyticsResponse};
use crate::AppState;

/// バケット境界は固定 UTC+1 オフセットで計算する（DST 非対応）
const BUCKET_OFFSET_HOURS: i64 = 1;

#[derive(Serialize, Debug)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

#[derive(Debug, Error)]
pub enum AnalyticsError {
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(i64),
    #[error(transparent)]
    Store(#[from] sqlx::Error),
}

/// 日/月/年のバケットキー
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketKeys {
    pub day: String,
    pub month: String,
    pub year: String,
}

/// 計上結果
#[derive(Debug)]
pub struct AnalyticsOutcome {
    pub already_processed: bool,
    pub keys: Option<BucketKeys>,
}

/// UTC タイムスタンプから固定オフセットのバケットキーを導出する
pub fn bucket_keys(timestamp_ms: i64) -> Option<BucketKeys> {
    let instant: DateTime<Utc> = DateTime::from_timestamp_millis(timestamp_ms)?;
    let shifted = instant + Duration::hours(BUCKET_OFFSET_HOURS);
    Some(BucketKeys {
        day: shifted.format("%Y-%m-%d").to_string(),
        month: shifted.format("%Y-%m").to_string(),
        year: shifted.format("%Y").to_string(),
    })
}

/// チケット1枚の売上を3レベルのバケットへ冪等に計上する。
///
/// 3つの merge-increment は1バッチ（トランザクション）で確定し、
/// マーカーはバッチコミット後に別書き込みとして残す。
pub async fn record_ticket_sale(
    db: &DbPool,
    ticket_id: &str,
    ticket_price: i64,
    event_id: Option<&str>,
    timestamp_ms: i64,
) -> Result<AnalyticsOutcome, AnalyticsError> {
    // 冪等性チェック（専用コレクション）
    let marker: Option<(Option<String>,)> =
        sqlx::query_as("SELECT payload FROM processed_ops WHERE scope = ? AND op_key = ?")
            .bind(op_scope::ANALYTICS)
            .bind(ticket_id)
            .fetch_optional(db)
            .await?;

    if let Some((payload,)) = marker {
        info!("Analytics already recorded, skipping: ticket_id={}", ticket_id);
        // 初回計上時のキーをマーカーから復元して返す
        let keys = payload
            .and_then(|p| serde_json::from_str::<serde_json::Value>(&p).ok())
            .and_then(|v| {
                Some(BucketKeys {
                    day: v.get("day")?.as_str()?.to_string(),
                    month: v.get("month")?.as_str()?.to_string(),
                    year: v.get("year")?.as_str()?.to_string(),
                })
            });
        return Ok(AnalyticsOutcome {
            already_processed: true,
            keys,
        });
    }

    let keys =
        bucket_keys(timestamp_ms).ok_or(AnalyticsError::InvalidTimestamp(timestamp_ms))?;
    let now = chrono::Utc::now().timestamp_millis();

    // 3バケットの merge-increment を1バッチで確定
    let mut tx = db.begin().await?;
    for (level, key) in [
        ("day", &keys.day),
        ("month", &keys.month),
        ("year", &keys.year),
    ] {
        sqlx::query(
            r#"
            INSERT INTO analytics_buckets (level, bucket_key, tickets_sold, total_revenue, updated_at_ms)
            VALUES (?, ?, 1, ?, ?)
            ON CONFLICT(level, bucket_key) DO UPDATE SET
                tickets_sold = tickets_sold + 1,
                total_revenue = total_revenue + excluded.total_revenue,
                updated_at_ms = excluded.updated_at_ms
            "#,
        )
        .bind(level)
        .bind(key)
        .bind(ticket_price)
        .bind(now)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;

    // マーカーはコミット後に書く。コミットとマーカーの間で落ちた場合、
    // 再配信でバケットが二重加算される（at-least-once の既知ギャップ）。
    let payload = serde_json::json!({
        "ticket_price": ticket_price,
        "event_id": event_id,
        "day": keys.day,
        "month": keys.month,
        "year": keys.year,
    })
    .to_string();
    crate::db::mark_processed(db, op_scope::ANALYTICS, ticket_id, &payload).await?;

    info!(
        "Analytics recorded: ticket_id={}, price={}, day={}",
        ticket_id, ticket_price, keys.day
    );

    Ok(AnalyticsOutcome {
        already_processed: false,
        keys: Some(keys),
    })
}

/// POST /api/analytics - 売上の計上
pub async fn record_analytics(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RecordAnalyticsRequest>,
) -> Result<Json<RecordAnalyticsResponse>, (StatusCode, Json<ErrorResponse>)> {
    // 必須フィールドチェック
    let ticket_id = req.ticket_id.filter(|t| !t.is_empty()).ok_or_else(|| {
        error_response(StatusCode::BAD_REQUEST, "ticket_id is required".to_string())
    })?;

    // ticket_price は数値・文字列のどちらでも受ける
    let ticket_price = req
        .ticket_price
        .as_ref()
        .and_then(parse_price)
        .ok_or_else(|| {
            error_response(
                StatusCode::BAD_REQUEST,
                "ticket_price must be a non-negative number".to_string(),
            )
        })?;

    let timestamp_ms = req
        .timestamp_ms
        .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());

    let outcome = record_ticket_sale(
        &state.db,
        &ticket_id,
        ticket_price,
        req.event_id.as_deref(),
        timestamp_ms,
    )
    .await
    .map_err(|e| match e {
        AnalyticsError::InvalidTimestamp(_) => {
            error_response(StatusCode::BAD_REQUEST, e.to_string())
        }
        AnalyticsError::Store(_) => {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    })?;

    let (day, month, year) = match outcome.keys {
        Some(keys) => (Some(keys.day), Some(keys.month), Some(keys.year)),
        None => (None, None, None),
    };

    Ok(Json(RecordAnalyticsResponse {
        success: true,
        already_processed: outcome.already_processed,
        day,
        month,
        year,
    }))
}

/// 数値または数値文字列から非負の金額を取り出す
fn parse_price(value: &serde_json::Value) -> Option<i64> {
    let price = match value {
        serde_json::Value::Number(n) => n.as_i64()?,
        serde_json::Value::String(s) => s.trim().parse::<i64>().ok()?,
        _ => return None,
    };
    if price < 0 {
        return None;
    }
    Some(price)
}

fn error_response(status: StatusCode, message: String) -> (StatusCode, Json<ErrorResponse>) {
    warn!("API Error: {}", message);
    (status, Json(ErrorResponse { success: false, error: message }))
}
