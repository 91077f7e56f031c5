//! # session::renewal
//!
//! **Session Renewal Coordinator** — ทุกๆ credential lifetime (23 ชม.) ต้อง
//! ต่ออายุ session แล้ว reconnect streaming transport โดยไม่เสีย subscription
//! และไม่ให้เกิดช่องว่างใน monitoring เกิน cycle เดียว
//!
//! ## ลำดับต่อ cycle
//! ```text
//! 1. disconnect transport
//! 2. รอสถานะ DISCONNECTED   (bounded — เกินเวลา = cycle fail)
//! 3. authenticate ใหม่        (bounded retry ภายใน provider)
//! 4. connect ด้วย credentials ใหม่
//! 5. รอสถานะ CONNECTED       (bounded เท่าเดิม)
//! 6. refresh market metadata  (best-effort)
//! ```
//!
//! Cycle ที่ fail = report แล้วรอรอบถัดไป ไม่มี intra-cycle retry และห้ามมี
//! cycle ซ้อนกัน (trigger ที่มาซ้อนถูก drop)

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::store::Store;

use super::stream::{wait_for_status, StreamTransport, TransportStatus};
use super::{SessionError, SessionProvider};

// ─── Config / outcome ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RenewalConfig {
    pub period:         Duration,
    pub status_timeout: Duration,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RenewalOutcome {
    Renewed,
    /// Another cycle was already running — this trigger was dropped.
    Skipped,
}

// ─── Coordinator ──────────────────────────────────────────────────────────────

pub struct RenewalCoordinator {
    transport: Arc<dyn StreamTransport>,
    provider:  Arc<dyn SessionProvider>,
    store:     Arc<dyn Store>,
    epics:     Vec<String>,
    config:    RenewalConfig,
    /// Serializes cycles — เอาไว้กัน manual + scheduled trigger ชนกัน
    cycle:     Mutex<()>,
}

impl RenewalCoordinator {
    pub fn new(
        transport: Arc<dyn StreamTransport>,
        provider: Arc<dyn SessionProvider>,
        store: Arc<dyn Store>,
        epics: Vec<String>,
        config: RenewalConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            provider,
            store,
            epics,
            config,
            cycle: Mutex::new(()),
        })
    }

    /// Spawns the periodic renewal task.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await; // first tick fires immediately — consume it

            loop {
                ticker.tick().await;
                if let Err(e) = self.renew().await {
                    // Reported, not fatal: tick ingestion stalls until the
                    // next cycle succeeds.
                    warn!(error = %e, "❌ session renewal cycle failed — retrying next cycle");
                }
            }
        })
    }

    /// One renewal cycle. Overlapping invocations are dropped, not queued.
    pub async fn renew(&self) -> Result<RenewalOutcome, SessionError> {
        let Ok(_guard) = self.cycle.try_lock() else {
            warn!("renewal already in progress — overlapping trigger dropped");
            return Ok(RenewalOutcome::Skipped);
        };

        info!("🔁 session renewal cycle started");
        let mut status = self.transport.status();

        // ── 1–2. Tear the old connection down, bounded ───────────────────────
        self.transport.disconnect().await;
        wait_for_status(&mut status, TransportStatus::Disconnected, self.config.status_timeout)
            .await?;

        // ── 3. Fresh credentials ─────────────────────────────────────────────
        let session = self.provider.authenticate().await?;

        // ── 4–5. Reconnect with the new identity, bounded ────────────────────
        // Subscriptions survive: the transport replays its retained set.
        self.transport.connect(&session.credentials).await?;
        wait_for_status(&mut status, TransportStatus::Connected, self.config.status_timeout)
            .await?;

        // ── 6. Market metadata refresh (best-effort) ─────────────────────────
        self.refresh_market_info().await;

        info!("✅ session renewal cycle complete");
        Ok(RenewalOutcome::Renewed)
    }

    /// Re-fetches per-instrument static metadata into the store under
    /// `{epic}:MARKETINFO`. Failures are logged per epic and do not fail
    /// the cycle. Also called once at bootstrap.
    pub async fn refresh_market_info(&self) {
        for epic in &self.epics {
            match self.provider.market_info(epic).await {
                Ok(payload) => {
                    let key = format!("{epic}:MARKETINFO");
                    if let Err(e) = self.store.set(&key, &payload).await {
                        warn!(key, error = %e, "market info write failed");
                    }
                }
                Err(e) => warn!(epic, error = %e, "market info fetch failed"),
            }
        }
        if !self.epics.is_empty() {
            info!(count = self.epics.len(), "market info refreshed");
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
