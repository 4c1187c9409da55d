use axum::{
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

mod auth;
mod db;
mod handlers;
mod models;
mod rate_limit;
#[cfg(test)]
mod test_util;

use db::DbPool;
use rate_limit::PinRateLimiter;

// ========================================
// 設定
// ========================================

#[derive(Clone)]
struct AppConfig {
    db_path: String,
    bind_addr: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: "/data/settlement/settlement.db".to_string(),
            bind_addr: "0.0.0.0:3000".to_string(),
        }
    }
}

impl AppConfig {
    /// 環境変数で上書き可能
    fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(path) = std::env::var("SETTLEMENT_DB_PATH") {
            config.db_path = path;
        }
        if let Ok(addr) = std::env::var("SETTLEMENT_BIND_ADDR") {
            config.bind_addr = addr;
        }
        config
    }
}

// ========================================
// 共有状態
// ========================================

/// アプリケーション全体の共有状態
/// pin_limiter はプロセス起動時に1個だけ構築する
pub struct AppState {
    pub db: DbPool,
    pub pin_limiter: PinRateLimiter,
}

// ========================================
// ヘルスチェック
// ========================================

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    service: String,
    version: String,
}

/// GET /api/health
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "ticket-settlement-api".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ========================================
// メイン
// ========================================

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/references", post(handlers::references::create_reference))
        .route("/api/references/free", post(handlers::references::create_free_reference))
        .route("/api/references/vote", post(handlers::votes::create_vote_reference))
        .route("/api/references/verify", post(handlers::references::verify_reference))
        .route("/api/sales", post(handlers::sales::apply_sale))
        .route("/api/analytics", post(handlers::analytics::record_analytics))
        .route("/api/discounts/validate", post(handlers::discounts::validate_discount))
        .route("/api/referrals", post(handlers::referrals::generate_referral_code))
        .route("/api/pin/verify", post(handlers::iwss::verify_pin))
        .route("/api/iwss/balance", get(handlers::iwss::get_balance))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ログ初期化
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = AppConfig::from_env();

    let pool = db::init_db(&config.db_path).await?;

    let state = Arc::new(AppState {
        db: pool,
        pin_limiter: PinRateLimiter::new(),
    });

    let app = build_router(state);

    info!("Settlement API Server listening on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
