//! # store::redis — Redis / RedisTimeSeries Store
//!
//! ใช้ connection 2 เส้นแยกกันเหมือน client library ทั่วไปบังคับ:
//! 1. **Command connection** (multiplexed) — SET/GET/DEL/MGET/SCAN/TS.*
//! 2. **Subscriber connection** — psubscribe keyspace notifications
//!
//! ## Change notification bus
//! Tick sample ทุกตัวเขียนลง key `{epic}:{metric}:TICK` — Redis ยิง keyspace
//! event `__keyspace@0__:{key}` ให้เอง เมื่อตั้ง `notify-keyspace-events`
//! Subscriber task เดียว psubscribe pattern กว้าง (`__keyspace*__:*:TICK`)
//! แล้ว dispatch เข้า channel ของ tracker ที่ลงทะเบียนไว้ต่อ key
//!
//! ## Duplicate timestamps
//! Series ถูกสร้างด้วย `DUPLICATE_POLICY BLOCK` — เขียน timestamp ซ้ำจะ
//! error แทนที่จะ overwrite แล้วถูก map เป็น `StoreError::DuplicateTimestamp`

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::AsyncCommands;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use super::{KeyEvent, PriceSample, Store, StoreError};

/// Keyspace pattern covering every tick series key.
const KEYSPACE_TICK_PATTERN: &str = "__keyspace*__:*:TICK";

/// Sample retention, 24 h — matches the scraper side of the pipeline.
const RETENTION_MS: u64 = 86_400_000;

// ─── Config ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub url: String,
}

impl StoreConfig {
    pub fn from_env() -> Self {
        let password = std::env::var("REDIS_PASSWORD").unwrap_or_default();
        let host     = std::env::var("REDIS_HOST").unwrap_or_else(|_| "cache".to_string());
        Self {
            url: format!("redis://default:{password}@{host}:6379"),
        }
    }
}

// ─── RedisStore ───────────────────────────────────────────────────────────────

type SubscriberMap = Arc<RwLock<HashMap<String, mpsc::UnboundedSender<KeyEvent>>>>;

pub struct RedisStore {
    con:  redis::aio::MultiplexedConnection,
    subs: SubscriberMap,
}

impl RedisStore {
    /// Connects both the command and subscriber connections and spawns the
    /// notification dispatch task.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let client = redis::Client::open(config.url.as_str()).map_err(io_err)?;

        let mut con = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(io_err)?;
        info!("Redis command connection ready");

        // Keyspace notifications ต้องเปิดฝั่ง server — best effort เผื่อ
        // server config ไม่ได้ตั้งไว้ (ถ้า CONFIG ถูก disable ก็แค่ log)
        let config_set: Result<(), _> = redis::cmd("CONFIG")
            .arg("SET")
            .arg("notify-keyspace-events")
            .arg("KEA")
            .query_async(&mut con)
            .await;
        if let Err(e) = config_set {
            debug!(error = %e, "could not enable keyspace notifications (assuming server config)");
        }

        let mut pubsub = client.get_async_pubsub().await.map_err(io_err)?;
        pubsub
            .psubscribe(KEYSPACE_TICK_PATTERN)
            .await
            .map_err(io_err)?;
        info!(pattern = KEYSPACE_TICK_PATTERN, "Redis subscriber connection ready");

        let subs: SubscriberMap = Arc::new(RwLock::new(HashMap::new()));

        // ── Dispatch task: keyspace event → tracker channel ──────────────────
        let dispatch_subs = subs.clone();
        tokio::spawn(async move {
            let mut stream = pubsub.into_on_message();
            while let Some(msg) = stream.next().await {
                let channel = msg.get_channel_name().to_string();
                let payload: String = msg.get_payload().unwrap_or_default();

                // `__keyspace@0__:CS.D.X.CFD.IP:BID:TICK` → key หลัง `__:`
                let Some(key) = channel.split_once("__:").map(|(_, k)| k.to_string()) else {
                    continue;
                };

                let mut subs = dispatch_subs.write().await;
                let receiver_gone = match subs.get(&key) {
                    Some(tx) => tx.send((channel, payload)).is_err(),
                    None => false,
                };
                // Receiver หายไปแล้ว (tracker ปิด) → เก็บกวาด entry
                if receiver_gone {
                    subs.remove(&key);
                }
            }
            warn!("keyspace notification stream ended");
        });

        Ok(Self { con, subs })
    }
}

fn io_err(e: redis::RedisError) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

#[async_trait]
impl Store for RedisStore {
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut con = self.con.clone();
        con.set(key, value).await.map_err(io_err)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut con = self.con.clone();
        con.get(key).await.map_err(io_err)
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut con = self.con.clone();
        con.del(key).await.map_err(io_err)
    }

    async fn set_nx(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        let mut con = self.con.clone();
        // SET ... NX — atomic existence check + write in one round trip
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .query_async(&mut con)
            .await
            .map_err(io_err)?;
        Ok(reply.is_some())
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut con = self.con.clone();
        let mut cmd = redis::cmd("MGET");
        for key in keys {
            cmd.arg(key);
        }
        cmd.query_async(&mut con).await.map_err(io_err)
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut con = self.con.clone();
        let mut keys = Vec::new();
        let mut iter: redis::AsyncIter<String> =
            con.scan_match(pattern).await.map_err(io_err)?;
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }

    async fn ts_add(&self, key: &str, timestamp: u64, value: f64) -> Result<(), StoreError> {
        let mut con = self.con.clone();
        let reply: Result<u64, redis::RedisError> = redis::cmd("TS.ADD")
            .arg(key)
            .arg(timestamp)
            .arg(value)
            .arg("RETENTION")
            .arg(RETENTION_MS)
            .arg("DUPLICATE_POLICY")
            .arg("BLOCK")
            .query_async(&mut con)
            .await;

        match reply {
            Ok(_) => Ok(()),
            // "TSDB: Error at upsert, update is not supported when
            //  DUPLICATE_POLICY is set to BLOCK mode"
            Err(e) if e.to_string().contains("DUPLICATE_POLICY") => {
                Err(StoreError::DuplicateTimestamp { key: key.to_string(), timestamp })
            }
            Err(e) => Err(io_err(e)),
        }
    }

    async fn ts_latest(&self, key: &str) -> Result<Option<PriceSample>, StoreError> {
        let mut con = self.con.clone();
        let reply: Result<redis::Value, redis::RedisError> = redis::cmd("TS.GET")
            .arg(key)
            .query_async(&mut con)
            .await;

        match reply {
            Ok(value) => Ok(parse_ts_get(&value)),
            Err(e) if e.to_string().contains("does not exist") => Ok(None),
            Err(e) => Err(io_err(e)),
        }
    }

    async fn subscribe(&self, key: &str) -> Result<mpsc::UnboundedReceiver<KeyEvent>, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        debug!(key, "listening for keyspace events");
        self.subs.write().await.insert(key.to_string(), tx);
        Ok(rx)
    }

    async fn unsubscribe(&self, key: &str) -> Result<(), StoreError> {
        debug!(key, "unsubscribing keyspace events");
        self.subs.write().await.remove(key);
        Ok(())
    }
}

/// TS.GET reply: `[timestamp, value]`, or an empty array for an empty series.
fn parse_ts_get(value: &redis::Value) -> Option<PriceSample> {
    let redis::Value::Bulk(items) = value else { return None };
    if items.len() != 2 {
        return None;
    }
    let timestamp = match &items[0] {
        redis::Value::Int(ts) => *ts as u64,
        _ => return None,
    };
    let value = match &items[1] {
        redis::Value::Data(bytes) => String::from_utf8_lossy(bytes).parse().ok()?,
        redis::Value::Status(s) => s.parse().ok()?,
        redis::Value::Int(i) => *i as f64,
        _ => return None,
    };
    Some(PriceSample { timestamp, value })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ts_get_pair() {
        let reply = redis::Value::Bulk(vec![
            redis::Value::Int(1711111111111),
            redis::Value::Data(b"185.5".to_vec()),
        ]);
        assert_eq!(
            parse_ts_get(&reply),
            Some(PriceSample { timestamp: 1_711_111_111_111, value: 185.5 })
        );
    }

    #[test]
    fn test_parse_ts_get_empty_series() {
        assert_eq!(parse_ts_get(&redis::Value::Bulk(vec![])), None);
    }
}
