//! テスト用フィクスチャ
//! インメモリ SQLite と各テーブルのシード/取得ヘルパ

use axum::http::{header, HeaderMap};
use sqlx::sqlite::SqlitePoolOptions;
use std::sync::Arc;

use crate::db::DbPool;
use crate::models::{
    AnalyticsBucket, Contestant, DeadLetter, Discount, Event, PaymentReference, Poll, PollEntry,
    Referral, TicketPrice,
};
use crate::rate_limit::PinRateLimiter;
use crate::AppState;

/// インメモリ DB を持つ AppState を作る。
/// 接続ごとに別メモリにならないよう max_connections は 1 にする。
pub async fn test_state() -> Arc<AppState> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("failed to open in-memory database");
    crate::db::create_schema(&pool)
        .await
        .expect("failed to create schema");

    Arc::new(AppState {
        db: pool,
        pin_limiter: PinRateLimiter::new(),
    })
}

pub fn bearer_headers(token: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::AUTHORIZATION,
        format!("Bearer {}", token).parse().expect("valid header"),
    );
    headers
}

// ========================================
// Seed Helpers
// ========================================

pub async fn seed_event(db: &DbPool, event_id: &str, creator_id: &str) {
    sqlx::query(
        "INSERT INTO events (event_id, creator_id, title, created_at_ms) VALUES (?, ?, 'Test Event', 0)",
    )
    .bind(event_id)
    .bind(creator_id)
    .execute(db)
    .await
    .expect("seed event");
}

pub async fn seed_ticket_price(
    db: &DbPool,
    event_id: &str,
    ticket_type: &str,
    unit_price: i64,
    available_tickets: Option<i64>,
) {
    sqlx::query(
        "INSERT INTO ticket_prices (event_id, ticket_type, unit_price, available_tickets) VALUES (?, ?, ?, ?)",
    )
    .bind(event_id)
    .bind(ticket_type)
    .bind(unit_price)
    .bind(available_tickets)
    .execute(db)
    .await
    .expect("seed ticket price");
}

#[allow(clippy::too_many_arguments)]
pub async fn seed_discount(
    db: &DbPool,
    event_id: &str,
    code: &str,
    kind: &str,
    value: i64,
    max_uses: i64,
    used_count: i64,
    active: i32,
) {
    sqlx::query(
        "INSERT INTO discounts (event_id, creator_id, code, kind, value, max_uses, used_count, active) VALUES (?, 'C1', ?, ?, ?, ?, ?, ?)",
    )
    .bind(event_id)
    .bind(code)
    .bind(kind)
    .bind(value)
    .bind(max_uses)
    .bind(used_count)
    .bind(active)
    .execute(db)
    .await
    .expect("seed discount");
}

pub async fn seed_user(db: &DbPool, user_id: &str, referral_code: Option<&str>) {
    sqlx::query(
        "INSERT INTO users (user_id, email, referral_code, created_at_ms) VALUES (?, ?, ?, 0)",
    )
    .bind(user_id)
    .bind(format!("{}@example.com", user_id))
    .bind(referral_code)
    .execute(db)
    .await
    .expect("seed user");
}

pub async fn seed_token(db: &DbPool, token: &str, user_id: &str) {
    sqlx::query("INSERT INTO auth_tokens (token, user_id, email) VALUES (?, ?, ?)")
        .bind(token)
        .bind(user_id)
        .bind(format!("{}@example.com", user_id))
        .execute(db)
        .await
        .expect("seed token");
}

pub async fn seed_referral(db: &DbPool, code: &str, owner_id: &str, active: i32) {
    sqlx::query(
        "INSERT INTO referrals (code, owner_id, total_referrals, active, created_at_ms) VALUES (?, ?, 1, ?, 0)",
    )
    .bind(code)
    .bind(owner_id)
    .bind(active)
    .execute(db)
    .await
    .expect("seed referral");
}

pub async fn seed_iwss_account(
    db: &DbPool,
    user_id: &str,
    active: i32,
    balance: i64,
    pin: Option<&str>,
    deactivation_reason: Option<&str>,
) {
    let pin_sha256 = pin.map(crate::handlers::iwss::pin_digest);
    sqlx::query(
        "INSERT INTO iwss_accounts (user_id, active, balance, pin_sha256, deactivation_reason, created_at_ms, updated_at_ms) VALUES (?, ?, ?, ?, ?, 0, 0)",
    )
    .bind(user_id)
    .bind(active)
    .bind(balance)
    .bind(pin_sha256)
    .bind(deactivation_reason)
    .execute(db)
    .await
    .expect("seed iwss account");
}

pub async fn seed_poll(db: &DbPool, poll_id: &str, creator_id: &str) {
    sqlx::query(
        "INSERT INTO polls (poll_id, creator_id, title, created_at_ms) VALUES (?, ?, 'Test Poll', 0)",
    )
    .bind(poll_id)
    .bind(creator_id)
    .execute(db)
    .await
    .expect("seed poll");
}

pub async fn seed_contestant(db: &DbPool, poll_id: &str, contestant_id: &str, votes: i64) {
    sqlx::query(
        "INSERT INTO contestants (poll_id, contestant_id, name, votes) VALUES (?, ?, 'Contestant', ?)",
    )
    .bind(poll_id)
    .bind(contestant_id)
    .bind(votes)
    .execute(db)
    .await
    .expect("seed contestant");
}

// ========================================
// Fetch Helpers
// ========================================

pub async fn get_event(db: &DbPool, event_id: &str) -> Event {
    sqlx::query_as("SELECT * FROM events WHERE event_id = ?")
        .bind(event_id)
        .fetch_one(db)
        .await
        .expect("event row")
}

pub async fn get_ticket_price(db: &DbPool, event_id: &str, ticket_type: &str) -> TicketPrice {
    sqlx::query_as("SELECT * FROM ticket_prices WHERE event_id = ? AND ticket_type = ?")
        .bind(event_id)
        .bind(ticket_type)
        .fetch_one(db)
        .await
        .expect("ticket price row")
}

pub async fn get_discount(db: &DbPool, event_id: &str, code: &str) -> Discount {
    sqlx::query_as("SELECT * FROM discounts WHERE event_id = ? AND code = ?")
        .bind(event_id)
        .bind(code)
        .fetch_one(db)
        .await
        .expect("discount row")
}

pub async fn get_referral(db: &DbPool, code: &str) -> Referral {
    sqlx::query_as("SELECT * FROM referrals WHERE code = ?")
        .bind(code)
        .fetch_one(db)
        .await
        .expect("referral row")
}

pub async fn get_reference(db: &DbPool, reference_id: &str) -> PaymentReference {
    sqlx::query_as("SELECT * FROM payment_references WHERE reference_id = ?")
        .bind(reference_id)
        .fetch_one(db)
        .await
        .expect("reference row")
}

pub async fn get_poll(db: &DbPool, poll_id: &str) -> Poll {
    sqlx::query_as("SELECT * FROM polls WHERE poll_id = ?")
        .bind(poll_id)
        .fetch_one(db)
        .await
        .expect("poll row")
}

pub async fn get_contestant(db: &DbPool, poll_id: &str, contestant_id: &str) -> Contestant {
    sqlx::query_as("SELECT * FROM contestants WHERE poll_id = ? AND contestant_id = ?")
        .bind(poll_id)
        .bind(contestant_id)
        .fetch_one(db)
        .await
        .expect("contestant row")
}

pub async fn get_bucket(db: &DbPool, level: &str, bucket_key: &str) -> Option<AnalyticsBucket> {
    sqlx::query_as("SELECT * FROM analytics_buckets WHERE level = ? AND bucket_key = ?")
        .bind(level)
        .bind(bucket_key)
        .fetch_optional(db)
        .await
        .expect("bucket query")
}

pub async fn marker_exists(db: &DbPool, scope: &str, op_key: &str) -> bool {
    let row: Option<(i64,)> =
        sqlx::query_as("SELECT 1 FROM processed_ops WHERE scope = ? AND op_key = ?")
            .bind(scope)
            .bind(op_key)
            .fetch_optional(db)
            .await
            .expect("marker query");
    row.is_some()
}

pub async fn get_poll_entries(db: &DbPool, poll_id: &str) -> Vec<PollEntry> {
    sqlx::query_as("SELECT * FROM poll_entries WHERE poll_id = ? ORDER BY created_at_ms")
        .bind(poll_id)
        .fetch_all(db)
        .await
        .expect("poll entries")
}

pub async fn get_dead_letters(db: &DbPool, step: &str) -> Vec<DeadLetter> {
    sqlx::query_as("SELECT * FROM dead_letters WHERE step = ? ORDER BY id")
        .bind(step)
        .fetch_all(db)
        .await
        .expect("dead letters")
}
