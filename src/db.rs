//! Database Module
//! SQLite を使用した events/references/polls/analytics の管理

use anyhow::Result;
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use tracing::{info, warn};

/// データベース接続プール
pub type DbPool = Pool<Sqlite>;

/// データベースを初期化
pub async fn init_db(db_path: &str) -> Result<DbPool> {
    // SQLite接続文字列
    let db_url = format!("sqlite:{}?mode=rwc", db_path);

    info!("Initializing database: {}", db_path);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&db_url)
        .await?;

    // スキーマ作成
    create_schema(&pool).await?;

    info!("Database initialized successfully");
    Ok(pool)
}

/// スキーマ作成
pub async fn create_schema(pool: &DbPool) -> Result<()> {
    // events テーブル（イベント集約：販売数・売上カウンタ）
    sqlx::query(r#"
        CREATE TABLE IF NOT EXISTS events (
            event_id TEXT PRIMARY KEY,
            creator_id TEXT NOT NULL,
            title TEXT,
            tickets_sold INTEGER NOT NULL DEFAULT 0,
            total_revenue INTEGER NOT NULL DEFAULT 0,
            created_at_ms INTEGER NOT NULL
        )
    "#)
    .execute(pool)
    .await?;

    // ticket_prices テーブル（イベント配下のチケット種別・在庫）
    // available_tickets が NULL の場合は無制限
    sqlx::query(r#"
        CREATE TABLE IF NOT EXISTS ticket_prices (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT NOT NULL,
            ticket_type TEXT NOT NULL,
            unit_price INTEGER NOT NULL,
            available_tickets INTEGER,
            FOREIGN KEY (event_id) REFERENCES events(event_id),
            UNIQUE(event_id, ticket_type)
        )
    "#)
    .execute(pool)
    .await?;

    // payment_references テーブル（チェックアウト試行ごとに1件、削除しない）
    sqlx::query(r#"
        CREATE TABLE IF NOT EXISTS payment_references (
            reference_id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            subject_id TEXT,
            buyer_email TEXT,
            event_id TEXT NOT NULL,
            creator_id TEXT NOT NULL,
            ticket_type TEXT,
            contestant_id TEXT,
            unit_price INTEGER NOT NULL,
            quantity INTEGER NOT NULL DEFAULT 1,
            total_amount INTEGER NOT NULL,
            discount_code TEXT,
            referral_code TEXT,
            vendor TEXT NOT NULL DEFAULT 'paystack',
            status TEXT NOT NULL,
            gateway_tx_ref TEXT,
            failure_reason TEXT,
            created_at_ms INTEGER NOT NULL,
            completed_at_ms INTEGER
        )
    "#)
    .execute(pool)
    .await?;

    // processed_ops テーブル（冪等性マーカー）
    // マーカーが存在する＝該当キーの副作用は適用済み
    sqlx::query(r#"
        CREATE TABLE IF NOT EXISTS processed_ops (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            scope TEXT NOT NULL,
            op_key TEXT NOT NULL,
            payload TEXT,
            processed_at_ms INTEGER NOT NULL,
            UNIQUE(scope, op_key)
        )
    "#)
    .execute(pool)
    .await?;

    // analytics_buckets テーブル（日/月/年の売上バケット）
    sqlx::query(r#"
        CREATE TABLE IF NOT EXISTS analytics_buckets (
            level TEXT NOT NULL,
            bucket_key TEXT NOT NULL,
            tickets_sold INTEGER NOT NULL DEFAULT 0,
            total_revenue INTEGER NOT NULL DEFAULT 0,
            updated_at_ms INTEGER NOT NULL,
            PRIMARY KEY (level, bucket_key)
        )
    "#)
    .execute(pool)
    .await?;

    // discounts テーブル（イベント配下の割引コード）
    sqlx::query(r#"
        CREATE TABLE IF NOT EXISTS discounts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT NOT NULL,
            creator_id TEXT NOT NULL,
            code TEXT NOT NULL,
            kind TEXT NOT NULL,
            value INTEGER NOT NULL,
            max_uses INTEGER NOT NULL,
            used_count INTEGER NOT NULL DEFAULT 0,
            active INTEGER NOT NULL DEFAULT 1,
            UNIQUE(event_id, code)
        )
    "#)
    .execute(pool)
    .await?;

    // referrals テーブル（紹介コードインデックス）
    sqlx::query(r#"
        CREATE TABLE IF NOT EXISTS referrals (
            code TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            total_referrals INTEGER NOT NULL DEFAULT 0,
            active INTEGER NOT NULL DEFAULT 1,
            created_at_ms INTEGER NOT NULL
        )
    "#)
    .execute(pool)
    .await?;

    // users テーブル（プロフィール：紹介コード保持）
    sqlx::query(r#"
        CREATE TABLE IF NOT EXISTS users (
            user_id TEXT PRIMARY KEY,
            email TEXT,
            referral_code TEXT,
            created_at_ms INTEGER NOT NULL
        )
    "#)
    .execute(pool)
    .await?;

    // iwss_accounts テーブル（ウォレット残高・PIN）
    sqlx::query(r#"
        CREATE TABLE IF NOT EXISTS iwss_accounts (
            user_id TEXT PRIMARY KEY,
            active INTEGER NOT NULL DEFAULT 1,
            balance INTEGER NOT NULL DEFAULT 0,
            pin_sha256 TEXT,
            deactivation_reason TEXT,
            created_at_ms INTEGER NOT NULL,
            updated_at_ms INTEGER NOT NULL
        )
    "#)
    .execute(pool)
    .await?;

    // auth_tokens テーブル（Identity Verifier のバッキングストア）
    sqlx::query(r#"
        CREATE TABLE IF NOT EXISTS auth_tokens (
            token TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            email TEXT
        )
    "#)
    .execute(pool)
    .await?;

    // polls テーブル（投票集約）
    sqlx::query(r#"
        CREATE TABLE IF NOT EXISTS polls (
            poll_id TEXT PRIMARY KEY,
            creator_id TEXT NOT NULL,
            title TEXT,
            poll_count INTEGER NOT NULL DEFAULT 0,
            amount_collected INTEGER NOT NULL DEFAULT 0,
            created_at_ms INTEGER NOT NULL
        )
    "#)
    .execute(pool)
    .await?;

    // contestants テーブル（投票対象者と得票数）
    sqlx::query(r#"
        CREATE TABLE IF NOT EXISTS contestants (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            poll_id TEXT NOT NULL,
            contestant_id TEXT NOT NULL,
            name TEXT,
            votes INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY (poll_id) REFERENCES polls(poll_id),
            UNIQUE(poll_id, contestant_id)
        )
    "#)
    .execute(pool)
    .await?;

    // poll_entries テーブル（投票の監査ログ）
    sqlx::query(r#"
        CREATE TABLE IF NOT EXISTS poll_entries (
            entry_id TEXT PRIMARY KEY,
            poll_id TEXT NOT NULL,
            buyer TEXT,
            vote_count INTEGER NOT NULL,
            price INTEGER NOT NULL,
            contestant_id TEXT NOT NULL,
            reference_id TEXT NOT NULL,
            created_at_ms INTEGER NOT NULL
        )
    "#)
    .execute(pool)
    .await?;

    // dead_letters テーブル（失敗した後続ステップの記録、手動照合用）
    sqlx::query(r#"
        CREATE TABLE IF NOT EXISTS dead_letters (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            step TEXT NOT NULL,
            op_key TEXT NOT NULL,
            detail TEXT NOT NULL,
            created_at_ms INTEGER NOT NULL
        )
    "#)
    .execute(pool)
    .await?;

    // インデックス作成
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_ticket_prices_event ON ticket_prices(event_id)")
        .execute(pool).await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_references_event ON payment_references(event_id)")
        .execute(pool).await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_references_status ON payment_references(status)")
        .execute(pool).await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_discounts_event ON discounts(event_id)")
        .execute(pool).await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_contestants_poll ON contestants(poll_id)")
        .execute(pool).await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_poll_entries_poll ON poll_entries(poll_id)")
        .execute(pool).await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_dead_letters_step ON dead_letters(step)")
        .execute(pool).await?;

    Ok(())
}

/// 冪等性マーカーの存在確認。
/// Executor を取るので、在庫トランザクションの内側からも呼べる。
pub async fn is_processed<'e, E>(executor: E, scope: &str, op_key: &str) -> Result<bool, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let row: Option<(i64,)> =
        sqlx::query_as("SELECT 1 FROM processed_ops WHERE scope = ? AND op_key = ?")
            .bind(scope)
            .bind(op_key)
            .fetch_optional(executor)
            .await?;
    Ok(row.is_some())
}

/// 冪等性マーカーの書き込み。payload には入力のエコーを残す。
pub async fn mark_processed<'e, E>(
    executor: E,
    scope: &str,
    op_key: &str,
    payload: &str,
) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let now = chrono::Utc::now().timestamp_millis();
    sqlx::query(
        "INSERT INTO processed_ops (scope, op_key, payload, processed_at_ms) VALUES (?, ?, ?, ?)",
    )
    .bind(scope)
    .bind(op_key)
    .bind(payload)
    .bind(now)
    .execute(executor)
    .await?;
    Ok(())
}

/// 失敗した後続ステップを dead_letters に記録する。
/// 記録自体の失敗は警告ログのみ（決済応答には影響させない）。
pub async fn record_dead_letter(pool: &DbPool, step: &str, op_key: &str, detail: &str) {
    let now = chrono::Utc::now().timestamp_millis();
    let result = sqlx::query(
        "INSERT INTO dead_letters (step, op_key, detail, created_at_ms) VALUES (?, ?, ?, ?)",
    )
    .bind(step)
    .bind(op_key)
    .bind(detail)
    .bind(now)
    .execute(pool)
    .await;

    if let Err(e) = result {
        warn!("Failed to record dead letter: step={}, op_key={}, error={}", step, op_key, e);
    }
}
