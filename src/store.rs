use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{Result, TalonError};

/// How many optimistic retries a read-modify-write gets before we give up
/// and report contention instead of spinning forever.
const CAS_RETRY_LIMIT: usize = 32;

/// Byte-level contract every backend has to satisfy. Values are opaque
/// blobs; atomicity exists only per key, so every cross-worker invariant
/// in this crate is funneled through `compare_and_swap`.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    /// Writes `next` only if the current value equals `expected`
    /// (`None` meaning absent). `next = None` deletes the key.
    /// Returns false when the comparison failed and nothing was written.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        next: Option<Vec<u8>>,
    ) -> Result<bool>;
    async fn flush(&self) -> Result<()>;
}

pub struct SledKv {
    db: sled::Db,
}

impl SledKv {
    pub fn open(path: &str) -> Result<Self> {
        let db = sled::open(path).map_err(|e| TalonError::Store(e.to_string()))?;
        Ok(Self { db })
    }
}

#[async_trait]
impl KvStore for SledKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let value = self
            .db
            .get(key.as_bytes())
            .map_err(|e| TalonError::Store(e.to_string()))?;
        Ok(value.map(|ivec| ivec.to_vec()))
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.db
            .insert(key.as_bytes(), value)
            .map_err(|e| TalonError::Store(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.db
            .remove(key.as_bytes())
            .map_err(|e| TalonError::Store(e.to_string()))?;
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        next: Option<Vec<u8>>,
    ) -> Result<bool> {
        let outcome = self
            .db
            .compare_and_swap(key.as_bytes(), expected, next)
            .map_err(|e| TalonError::Store(e.to_string()))?;
        Ok(outcome.is_ok())
    }

    async fn flush(&self) -> Result<()> {
        self.db
            .flush_async()
            .await
            .map_err(|e| TalonError::Store(e.to_string()))?;
        Ok(())
    }
}

/// In-process backend with the same per-key atomicity guarantees.
/// Used by the test suite and handy for ephemeral deployments.
pub struct MemoryKv {
    map: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>>> {
        self.map
            .lock()
            .map_err(|_| TalonError::Store("memory store poisoned".to_string()))
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.lock()?.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.lock()?.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.lock()?.remove(key);
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        next: Option<Vec<u8>>,
    ) -> Result<bool> {
        let mut map = self.lock()?;
        let current = map.get(key).map(|v| v.as_slice());
        if current != expected {
            return Ok(false);
        }
        match next {
            Some(value) => {
                map.insert(key.to_string(), value);
            }
            None => {
                map.remove(key);
            }
        }
        Ok(true)
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Typed facade over the raw store. Every record goes through bincode,
/// engines never touch bytes directly.
#[derive(Clone)]
pub struct LedgerStore {
    kv: Arc<dyn KvStore>,
}

impl LedgerStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub fn open(path: &str) -> Result<Self> {
        Ok(Self::new(Arc::new(SledKv::open(path)?)))
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryKv::new()))
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.kv.get(key).await? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.kv.set(key, encode(value)?).await
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.kv.delete(key).await
    }

    /// Typed conditional write. `expected = None` claims an absent key,
    /// which is how one-shot markers (payment intents, IP bindings) are won.
    pub async fn compare_and_swap<T: Serialize>(
        &self,
        key: &str,
        expected: Option<&T>,
        next: Option<&T>,
    ) -> Result<bool> {
        let expected_raw = match expected {
            Some(value) => Some(encode(value)?),
            None => None,
        };
        let next_raw = match next {
            Some(value) => Some(encode(value)?),
            None => None,
        };
        self.kv
            .compare_and_swap(key, expected_raw.as_deref(), next_raw)
            .await
    }

    /// Optimistic read-modify-write. `apply` sees the current value and
    /// returns the replacement (`None` deletes); on interleaved writers the
    /// closure re-runs against a fresh read, so all validation belongs
    /// inside it. Returns the value that was actually written.
    pub async fn update<T, F>(&self, key: &str, mut apply: F) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut(Option<T>) -> Result<Option<T>>,
    {
        for _ in 0..CAS_RETRY_LIMIT {
            let current_raw = self.kv.get(key).await?;
            let current = match &current_raw {
                Some(bytes) => Some(decode::<T>(bytes)?),
                None => None,
            };
            let next = apply(current)?;
            let next_raw = match &next {
                Some(value) => Some(encode(value)?),
                None => None,
            };
            if next_raw == current_raw {
                return Ok(next);
            }
            let swapped = self
                .kv
                .compare_and_swap(key, current_raw.as_deref(), next_raw)
                .await?;
            if swapped {
                return Ok(next);
            }
        }
        Err(TalonError::Store(format!(
            "write contention on `{}` exceeded {} retries",
            key, CAS_RETRY_LIMIT
        )))
    }

    pub async fn flush(&self) -> Result<()> {
        self.kv.flush().await
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| TalonError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| TalonError::Serialization(e.to_string()))
}

/// Key layout of the shared store. Other tenants of the same database read
/// these records by name, so the strings are load-bearing.
pub mod keys {
    pub fn coins(account: &str) -> String {
        format!("coins-{}", account)
    }

    pub fn resources(account: &str) -> String {
        format!("extra-{}", account)
    }

    pub fn plan(account: &str) -> String {
        format!("package-{}", account)
    }

    pub fn staked(account: &str) -> String {
        format!("staked-{}", account)
    }

    pub fn stake_anchor(account: &str) -> String {
        format!("lastStakeTime-{}", account)
    }

    pub fn coupon(code: &str) -> String {
        format!("coupon-{}", code)
    }

    pub fn used_coupons(account: &str) -> String {
        format!("used-coupons-{}", account)
    }

    pub fn queue() -> String {
        "queuedServers".to_string()
    }

    pub fn queue_for(account: &str) -> String {
        format!("{}-queued", account)
    }

    pub fn dead_letters() -> String {
        "queuedServersDead".to_string()
    }

    pub fn ip_binding(ip: &str) -> String {
        format!("ipuser-{}", ip)
    }

    pub fn alt_bypass(account: &str) -> String {
        format!("antialt-bypass-{}", account)
    }

    pub fn daily_claim(account: &str) -> String {
        format!("dailycoins1-{}", account)
    }

    pub fn earn_token(account: &str) -> String {
        format!("earntoken-{}", account)
    }

    pub fn afk_session(account: &str) -> String {
        format!("afk-{}", account)
    }

    pub fn create_limit(addr: &str) -> String {
        format!("createLimit-{}", addr)
    }

    pub fn earn_quota(addr: &str) -> String {
        format!("earnQuota-{}", addr)
    }

    pub fn processed_intent(intent_id: &str) -> String {
        format!("processed-{}", intent_id)
    }

    pub fn tx_history(account: &str) -> String {
        format!("transactions-{}", account)
    }

    pub fn notifications(account: &str) -> String {
        format!("notifications-{}", account)
    }

    pub fn referral_code(code: &str) -> String {
        format!("refcode-{}", code)
    }

    pub fn referral_claimed(account: &str) -> String {
        format!("referral-{}", account)
    }

    pub fn transfer_journal() -> String {
        "transferJournal".to_string()
    }

    pub fn transfer_stuck() -> String {
        "transferStuck".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_typed_round_trip() {
        let store = LedgerStore::in_memory();
        store.set("coins-alice", &rust_decimal::Decimal::from(42)).await.unwrap();
        let balance: Option<rust_decimal::Decimal> = store.get("coins-alice").await.unwrap();
        assert_eq!(balance, Some(rust_decimal::Decimal::from(42)));

        store.delete("coins-alice").await.unwrap();
        let gone: Option<rust_decimal::Decimal> = store.get("coins-alice").await.unwrap();
        assert_eq!(gone, None);
    }

    #[tokio::test]
    async fn test_cas_claims_absent_key_once() {
        let store = LedgerStore::in_memory();
        let first = store
            .compare_and_swap("ipuser-1.2.3.4", None::<&String>, Some(&"alice".to_string()))
            .await
            .unwrap();
        let second = store
            .compare_and_swap("ipuser-1.2.3.4", None::<&String>, Some(&"bob".to_string()))
            .await
            .unwrap();
        assert!(first);
        assert!(!second);
        let bound: Option<String> = store.get("ipuser-1.2.3.4").await.unwrap();
        assert_eq!(bound, Some("alice".to_string()));
    }

    #[tokio::test]
    async fn test_update_survives_interleaved_writers() {
        let store = LedgerStore::in_memory();
        store.set("counter", &0u64).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..25 {
                    store
                        .update::<u64, _>("counter", |current| {
                            Ok(Some(current.unwrap_or(0) + 1))
                        })
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let total: Option<u64> = store.get("counter").await.unwrap();
        assert_eq!(total, Some(200));
    }

    #[tokio::test]
    async fn test_update_can_delete() {
        let store = LedgerStore::in_memory();
        store.set("staked-alice", &rust_decimal::Decimal::from(10)).await.unwrap();
        store
            .update::<rust_decimal::Decimal, _>("staked-alice", |_| Ok(None))
            .await
            .unwrap();
        let gone: Option<rust_decimal::Decimal> = store.get("staked-alice").await.unwrap();
        assert_eq!(gone, None);
    }
}
