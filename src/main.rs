//! # Autopilot — Automated Trade Lifecycle Backend
//!
//! ## Architecture Overview
//!
//! ```text
//!  ┌──────────────┐  WSS chart ticks   ┌─────────────────────────────────┐
//!  │  Provider    │ ─────────────────▶ │ LightStream → IngestAdapter     │
//!  │  stream feed │                    │       │ TS.ADD samples          │
//!  └──────────────┘                    │       ▼                         │
//!        ▲ reconnect w/ fresh creds    │  Price Store (Redis + TS)       │
//!  ┌──────────────┐                    │       │ keyspace notifications  │
//!  │  Renewal     │  login every 23h   │       ▼                         │
//!  │  Coordinator │ ─────────────────▶ │  TradeTracker (1 per trade)     │──▶ close:
//!  └──────────────┘                    │   timeout ⟂ take-profit ⟂ stop  │    registry DEL
//!                                      └─────────────────────────────────┘    + unsubscribe
//!  ┌──────────────┐  POST/DELETE/GET /api/trade          ▲
//!  │  Caller      │ ─────────────────────────────────────┘
//!  └──────────────┘  GET /api/market · GET /api/health
//! ```
//!
//! ## Environment Variables
//!
//! | Variable         | Default                 | Description                    |
//! |------------------|-------------------------|--------------------------------|
//! | `BIND_ADDR`      | `0.0.0.0:3000`          | Address Axum listens on        |
//! | `REDIS_HOST`     | `cache`                 | Price store host               |
//! | `REDIS_PASSWORD` | *(empty)*               | Price store password           |
//! | `IG_BASE_URL`    | `api.ig.com/gateway/deal` | Provider REST host           |
//! | `IG_IS_DEMO`     | `false`                 | Prefix `demo-` on the REST host|
//! | `IG_EPICS`       | *(empty)*               | Newline-separated instruments  |
//! | `RUST_LOG`       | `autopilot=info`        | Tracing filter                 |

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    routing::{delete, get, post},
    Router,
};
use tokio::sync::mpsc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod auth;
mod engine;
mod error;
mod models;
mod routes;
mod session;
mod state;
mod store;

use auth::require_api_key;
use engine::{IngestAdapter, TradeTracker};
use routes::{
    market::search_markets,
    trade::{close_trade, health_check, list_trades, open_trade},
};
use session::{
    LightStream, RenewalConfig, RenewalCoordinator, SessionConfig, SessionManager,
    SessionProvider, StreamConfig, StreamTransport,
};
use state::build_state;
use store::redis::{RedisStore, StoreConfig};
use store::Store;

// ─── Entry Point ──────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Load .env ──────────────────────────────────────────────────────────
    dotenvy::dotenv().ok();

    // ── 2. Structured logging ─────────────────────────────────────────────────
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::from_default_env()
                .add_directive("autopilot=debug".parse()?)
                .add_directive("tower_http=info".parse()?),
        )
        .init();

    info!(r#"

  ╔═══════════════════════════════════════════════════════╗
  ║            AUTOPILOT — Trade Lifecycle                ║
  ║         Tracker · Ingest · Session Renewal            ║
  ╚═══════════════════════════════════════════════════════╝"#);

    // ── 3. Price store ────────────────────────────────────────────────────────
    let store_config = StoreConfig::from_env();
    let store: Arc<dyn Store> = Arc::new(RedisStore::connect(&store_config).await?);

    // ── 4. Provider session (initial login) ───────────────────────────────────
    let session_config = SessionConfig::from_env();
    let renewal_config = RenewalConfig {
        period:         session_config.renew_period,
        status_timeout: session_config.status_timeout,
    };
    // reqwest Client เดียว share ทั้ง login / market metadata (connection pooling)
    let session = Arc::new(SessionManager::new(session_config, reqwest::Client::new()));
    let login = session.authenticate().await?;
    let account = login
        .spreadbet_account()
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("no SPREADBET account found in login session"))?;

    // ── 5. Streaming transport + ingest loop ──────────────────────────────────
    let (ticks_tx, mut ticks_rx) = mpsc::unbounded_channel();
    let transport = LightStream::new(
        StreamConfig {
            // login ให้ endpoint มาเป็น https — transport ต่อด้วย wss
            endpoint:   login.lightstreamer_endpoint.replacen("http", "ws", 1),
            account_id: account.account_id.clone(),
        },
        ticks_tx,
    );

    let epics: Vec<String> = std::env::var("IG_EPICS")
        .unwrap_or_default()
        .split('\n')
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.trim().to_string())
        .collect();
    transport.subscribe(&epics).await;

    let shared = build_state(store.clone(), session.clone());

    let ingest = IngestAdapter::new(store.clone(), shared.tick_count.clone());
    tokio::spawn(async move {
        while let Some(tick) = ticks_rx.recv().await {
            ingest.ingest(&tick).await;
        }
        warn!("tick channel closed — ingest loop stopped");
    });

    if let Err(e) = transport.connect(&login.credentials).await {
        // ไม่ fatal — renewal cycle ถัดไปจะ reconnect ให้
        warn!(error = %e, "initial stream connect failed — renewal will retry");
    }

    // ── 6. Session renewal coordinator ────────────────────────────────────────
    let coordinator = RenewalCoordinator::new(
        transport.clone() as Arc<dyn StreamTransport>,
        session.clone() as Arc<dyn SessionProvider>,
        store.clone(),
        epics.clone(),
        renewal_config,
    );
    coordinator.refresh_market_info().await;
    coordinator.spawn();

    // ── 7. Rehydrate persisted trades ─────────────────────────────────────────
    // created_at เดิมถูกเก็บไว้ใน record — remaining timeout จึงถูกต้องเสมอ
    for record in shared.registry.reconstruct_all().await? {
        let identity = record.identity();
        match TradeTracker::resume(
            store.clone(),
            shared.registry.clone(),
            record,
            shared.on_close_callback(identity.clone()),
        )
        .await
        {
            Ok(handle) if !handle.is_closed() => {
                shared.trades.write().await.insert(identity, handle);
            }
            Ok(_) => {} // หมดเวลาไประหว่าง restart — ปิดเรียบร้อยแล้ว
            Err(e) => warn!(trade = %identity, error = %e, "trade rehydration failed"),
        }
    }
    info!(open = shared.open_trade_count().await, "trade rehydration complete");

    // ── 8. CORS ───────────────────────────────────────────────────────────────
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // ── 9. Router ─────────────────────────────────────────────────────────────
    let app = Router::new()
        // ── Trade lifecycle ───────────────────────────────────────────────────
        .route("/api/trade",  post(open_trade))
        .route("/api/trade",  delete(close_trade))
        .route("/api/trade",  get(list_trades))
        // ── Market metadata ───────────────────────────────────────────────────
        .route("/api/market", get(search_markets))
        // ── Health ────────────────────────────────────────────────────────────
        .route("/api/health", get(health_check))
        // ── Middleware ────────────────────────────────────────────────────────
        .layer(axum::middleware::from_fn(require_api_key))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(shared);

    // ── 10. Bind & Serve ──────────────────────────────────────────────────────
    let addr: SocketAddr = std::env::var("BIND_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:3000".to_string())
        .parse()?;

    info!(?addr, "🚀 Autopilot server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
