//! Data Models
//! Reference, Event, Poll などのデータ構造定義

use serde::{Deserialize, Serialize};

// ========================================
// Status Constants
// ========================================

/// Payment Reference ステータス
/// pending → success | failed の単調遷移。無料チケットは settled で直接作成。
pub mod reference_status {
    pub const PENDING: &str = "pending";
    pub const SUCCESS: &str = "success";
    pub const FAILED: &str = "failed";
    pub const SETTLED: &str = "settled";
}

/// Payment Reference 種別
pub mod reference_kind {
    pub const TICKET: &str = "ticket";
    pub const VOTE: &str = "vote";
}

/// 割引コード種別
pub mod discount_kind {
    pub const PERCENTAGE: &str = "percentage";
    pub const FLAT: &str = "flat";
}

/// 冪等性マーカーのスコープ
pub mod op_scope {
    pub const SALE: &str = "sale";
    pub const ANALYTICS: &str = "analytics";
}

// ========================================
// Event
// ========================================

/// Event (DB row)
/// 販売数と売上のカウンタを持つ集約
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Event {
    pub event_id: String,
    pub creator_id: String,
    pub title: Option<String>,
    pub tickets_sold: i64,
    pub total_revenue: i64,
    pub created_at_ms: i64,
}

/// Ticket Price (DB row)
/// available_tickets = NULL は無制限
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TicketPrice {
    pub id: i64,
    pub event_id: String,
    pub ticket_type: String,
    pub unit_price: i64,
    pub available_tickets: Option<i64>,
}

// ========================================
// Payment Reference
// ========================================

/// Payment Reference (DB row)
/// チェックアウト試行ごとに1件。作成後に reference_id は変わらない。
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PaymentReference {
    pub reference_id: String,
    pub kind: String,
    pub subject_id: Option<String>,
    pub buyer_email: Option<String>,
    pub event_id: String,
    pub creator_id: String,
    pub ticket_type: Option<String>,
    pub contestant_id: Option<String>,
    pub unit_price: i64,
    pub quantity: i64,
    pub total_amount: i64,
    pub discount_code: Option<String>,
    pub referral_code: Option<String>,
    pub vendor: String,
    pub status: String,
    pub gateway_tx_ref: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at_ms: i64,
    pub completed_at_ms: Option<i64>,
}

/// 有料チケット Reference 作成リクエスト
#[derive(Debug, Deserialize)]
pub struct CreateReferenceRequest {
    pub event_id: Option<String>,
    pub creator_id: Option<String>,
    pub ticket_type: Option<String>,
    pub ticket_price: Option<i64>,
    pub total_amount: Option<i64>,
    pub quantity: Option<i64>,
    pub user_id: Option<String>,
    pub buyer_email: Option<String>,
    pub discount_code: Option<String>,
    pub referral_code: Option<String>,
    pub vendor: Option<String>,
}

/// 無料チケット Reference 作成リクエスト
#[derive(Debug, Deserialize)]
pub struct CreateFreeReferenceRequest {
    pub event_id: Option<String>,
    pub creator_id: Option<String>,
    pub ticket_type: Option<String>,
    pub user_id: Option<String>,
    pub buyer_email: Option<String>,
}

/// 投票 Reference 作成リクエスト
#[derive(Debug, Deserialize)]
pub struct CreateVoteReferenceRequest {
    pub poll_id: Option<String>,
    pub creator_id: Option<String>,
    pub contestant_id: Option<String>,
    pub poll_price: Option<i64>,
    pub vote_count: Option<i64>,
    pub total_amount: Option<i64>,
    pub guest_email: Option<String>,
    pub vendor: Option<String>,
}

/// Reference 作成レスポンス
#[derive(Debug, Serialize)]
pub struct ReferenceCreateResponse {
    pub success: bool,
    pub reference: PaymentReference,
}

/// 決済照合リクエスト（ゲートウェイ確認の受け口）
#[derive(Debug, Deserialize)]
pub struct VerifyReferenceRequest {
    pub reference: Option<String>,
    pub status: Option<String>,
    pub transaction_reference: Option<String>,
    pub failure_reason: Option<String>,
}

/// 決済照合レスポンス
/// リトライ配信は already_processed = true の成功として返す
#[derive(Debug, Serialize)]
pub struct VerifyReferenceResponse {
    pub success: bool,
    pub reference_id: String,
    pub status: String,
    pub already_processed: bool,
    pub message: String,
}

// ========================================
// Atomic Sale
// ========================================

/// チケット販売リクエスト
#[derive(Debug, Deserialize)]
pub struct ApplySaleRequest {
    pub creator_id: Option<String>,
    pub event_id: Option<String>,
    pub ticket_type: Option<String>,
    pub ticket_price: Option<i64>,
    pub ticket_id: Option<String>,
    pub discount_code: Option<String>,
}

/// 実行されたサブ操作の記録（観測用）
#[derive(Debug, Clone, Default, Serialize)]
pub struct OperationsPerformed {
    pub sold_incremented: bool,
    pub revenue_updated: bool,
    pub inventory_decremented: bool,
    pub discount_updated: bool,
}

/// チケット販売レスポンス
#[derive(Debug, Serialize)]
pub struct ApplySaleResponse {
    pub success: bool,
    pub already_processed: bool,
    pub operations_performed: OperationsPerformed,
}

// ========================================
// Analytics
// ========================================

/// 売上計上リクエスト
/// ticket_price は数値・文字列のどちらでも受け付ける（ゲートウェイ都合）
#[derive(Debug, Deserialize)]
pub struct RecordAnalyticsRequest {
    pub ticket_id: Option<String>,
    pub ticket_price: Option<serde_json::Value>,
    pub event_id: Option<String>,
    pub timestamp_ms: Option<i64>,
}

/// 売上計上レスポンス
#[derive(Debug, Serialize)]
pub struct RecordAnalyticsResponse {
    pub success: bool,
    pub already_processed: bool,
    pub day: Option<String>,
    pub month: Option<String>,
    pub year: Option<String>,
}

/// Analytics Bucket (DB row)
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AnalyticsBucket {
    pub level: String,
    pub bucket_key: String,
    pub tickets_sold: i64,
    pub total_revenue: i64,
    pub updated_at_ms: i64,
}

// ========================================
// Discount
// ========================================

/// Discount (DB row)
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Discount {
    pub id: i64,
    pub event_id: String,
    pub creator_id: String,
    pub code: String,
    pub kind: String,
    pub value: i64,
    pub max_uses: i64,
    pub used_count: i64,
    pub active: i32,
}

/// 割引コード検証リクエスト
#[derive(Debug, Deserialize)]
pub struct ValidateDiscountRequest {
    pub code: Option<String>,
    pub event_id: Option<String>,
    pub event_creator_id: Option<String>,
    pub amount: Option<i64>,
}

/// 割引コード検証レスポンス
#[derive(Debug, Serialize)]
pub struct ValidateDiscountResponse {
    pub success: bool,
    pub code: String,
    pub discount_type: String,
    pub value: i64,
    pub max_uses: i64,
    pub used_count: i64,
    pub discount_amount: Option<i64>,
}

// ========================================
// Referral
// ========================================

/// Referral (DB row)
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Referral {
    pub code: String,
    pub owner_id: String,
    pub total_referrals: i64,
    pub active: i32,
    pub created_at_ms: i64,
}

/// 紹介コード発行リクエスト
#[derive(Debug, Deserialize)]
pub struct GenerateReferralRequest {
    pub user_id: Option<String>,
}

/// 紹介コード発行レスポンス
#[derive(Debug, Serialize)]
pub struct GenerateReferralResponse {
    pub success: bool,
    pub referral_code: String,
}

/// User (DB row)
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub user_id: String,
    pub email: Option<String>,
    pub referral_code: Option<String>,
    pub created_at_ms: i64,
}

// ========================================
// Poll / Vote
// ========================================

/// Poll (DB row)
/// poll_count は settled な投票の合計
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Poll {
    pub poll_id: String,
    pub creator_id: String,
    pub title: Option<String>,
    pub poll_count: i64,
    pub amount_collected: i64,
    pub created_at_ms: i64,
}

/// Contestant (DB row)
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Contestant {
    pub id: i64,
    pub poll_id: String,
    pub contestant_id: String,
    pub name: Option<String>,
    pub votes: i64,
}

/// Poll Entry (DB row) 投票の監査ログ1件
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PollEntry {
    pub entry_id: String,
    pub poll_id: String,
    pub buyer: Option<String>,
    pub vote_count: i64,
    pub price: i64,
    pub contestant_id: String,
    pub reference_id: String,
    pub created_at_ms: i64,
}

// ========================================
// IWSS Account
// ========================================

/// IWSS Account (DB row)
/// 決済コアからは読み取りのみ
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct IwssAccount {
    pub user_id: String,
    pub active: i32,
    pub balance: i64,
    pub pin_sha256: Option<String>,
    pub deactivation_reason: Option<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

/// PIN 検証リクエスト
#[derive(Debug, Deserialize)]
pub struct VerifyPinRequest {
    pub pin: Option<String>,
}

/// PIN 検証レスポンス
#[derive(Debug, Serialize)]
pub struct VerifyPinResponse {
    pub success: bool,
    pub message: String,
}

/// 残高照会レスポンス
#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub success: bool,
    pub active: bool,
    pub balance: i64,
    pub deactivation_reason: Option<String>,
}

// ========================================
// Dead Letter
// ========================================

/// Dead Letter (DB row) 失敗した後続ステップの記録
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeadLetter {
    pub id: i64,
    pub step: String,
    pub op_key: String,
    pub detail: String,
    pub created_at_ms: i64,
}
