//! # store::memory
//!
//! In-memory [`Store`] double for lifecycle tests. Mirrors the semantics the
//! trackers rely on: atomic SET NX, duplicate-timestamp rejection and a
//! keyspace-style notification per sample write.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use super::{KeyEvent, PriceSample, Store, StoreError};

#[derive(Default)]
pub struct MemoryStore {
    kv:     Mutex<HashMap<String, String>>,
    series: Mutex<HashMap<String, Vec<PriceSample>>>,
    subs:   Mutex<HashMap<String, mpsc::UnboundedSender<KeyEvent>>>,
    /// จำนวนครั้งที่ subscribe ถูกเรียก — ใช้ assert ว่า immediate-timeout
    /// trade ไม่เคย subscribe เลย
    subscribe_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn subscribe_count(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    pub async fn is_subscribed(&self, key: &str) -> bool {
        self.subs.lock().await.contains_key(key)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.kv.lock().await.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.kv.lock().await.get(key).cloned())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.kv.lock().await.remove(key);
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        let mut kv = self.kv.lock().await;
        if kv.contains_key(key) {
            return Ok(false);
        }
        kv.insert(key.to_string(), value.to_string());
        Ok(true)
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        let kv = self.kv.lock().await;
        Ok(keys.iter().map(|k| kv.get(k).cloned()).collect())
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        // Glob เท่าที่ test ใช้: `*:TRADE:*` และ pattern แบบ prefix/suffix
        let kv = self.kv.lock().await;
        let needle = pattern.trim_matches('*');
        Ok(kv.keys().filter(|k| k.contains(needle)).cloned().collect())
    }

    async fn ts_add(&self, key: &str, timestamp: u64, value: f64) -> Result<(), StoreError> {
        {
            let mut series = self.series.lock().await;
            let samples = series.entry(key.to_string()).or_default();
            if samples.iter().any(|s| s.timestamp == timestamp) {
                return Err(StoreError::DuplicateTimestamp {
                    key: key.to_string(),
                    timestamp,
                });
            }
            samples.push(PriceSample { timestamp, value });
        }

        // เลียนแบบ keyspace notification ของ Redis
        let mut subs = self.subs.lock().await;
        let receiver_gone = match subs.get(key) {
            Some(tx) => {
                let channel = format!("__keyspace@0__:{key}");
                tx.send((channel, "ts.add".to_string())).is_err()
            }
            None => false,
        };
        if receiver_gone {
            subs.remove(key);
        }
        Ok(())
    }

    async fn ts_latest(&self, key: &str) -> Result<Option<PriceSample>, StoreError> {
        let series = self.series.lock().await;
        Ok(series
            .get(key)
            .and_then(|samples| samples.iter().max_by_key(|s| s.timestamp))
            .copied())
    }

    async fn subscribe(&self, key: &str) -> Result<mpsc::UnboundedReceiver<KeyEvent>, StoreError> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.subs.lock().await.insert(key.to_string(), tx);
        Ok(rx)
    }

    async fn unsubscribe(&self, key: &str) -> Result<(), StoreError> {
        self.subs.lock().await.remove(key);
        Ok(())
    }
}
