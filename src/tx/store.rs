//! Pending transaction store with crash-recovery checkpointing
//!
//! The authoritative map from nonce to its fee-bump variant chain. Every
//! mutation is checkpointed to a JSON document in the account's data
//! directory so in-flight transactions and their fee history survive a
//! restart. Writes go through a temp file plus rename, and a save
//! generation counter drops a superseded snapshot instead of letting it
//! clobber a newer one.

use crate::chain::{FeeComponents, TxId, UnsignedTx};
use crate::error::KeeperResult;

use alloy_primitives::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, warn};

const STATE_FILE: &str = "pending_txs.json";

fn now_instant() -> Instant {
    Instant::now()
}

/// One signed snapshot of a nonce's transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxVariant {
    pub id: TxId,
    pub raw: Bytes,
    pub fees: FeeComponents,
}

/// One outstanding nonce and its ordered variant chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingRecord {
    pub nonce: u64,
    /// The prepared body, kept so replacements can be re-signed
    pub tx: UnsignedTx,
    /// Oldest first; only the last variant is broadcast and tracked
    pub variants: Vec<TxVariant>,
    /// Wall-clock timestamp of the last bump or rebroadcast attempt
    pub last_bumped_at: DateTime<Utc>,
    /// Monotonic counterpart of `last_bumped_at`, drives bump scheduling.
    /// Reset on load, which gives recovered records a full quiet period
    /// before the first bump instead of an immediate rebroadcast.
    #[serde(skip, default = "now_instant")]
    pub bumped_at: Instant,
    /// True while a broadcast for this nonce is in progress
    #[serde(skip)]
    pub in_flight: bool,
}

impl PendingRecord {
    /// A freshly created record is in flight until its first broadcast
    /// resolves
    pub fn new(nonce: u64, tx: UnsignedTx, variant: TxVariant) -> Self {
        Self {
            nonce,
            tx,
            variants: vec![variant],
            last_bumped_at: Utc::now(),
            bumped_at: Instant::now(),
            in_flight: true,
        }
    }

    /// The variant currently broadcast for this nonce
    pub fn active(&self) -> &TxVariant {
        self.variants.last().expect("record has no variants")
    }
}

pub struct PendingStore {
    path: PathBuf,
    records: Mutex<BTreeMap<u64, PendingRecord>>,
    /// Variant id to nonce, covering every historical variant
    by_id: DashMap<TxId, u64>,
    save_seq: AtomicU64,
    /// Highest generation actually written; a snapshot below it is stale
    save_gate: Mutex<u64>,
}

impl PendingStore {
    /// Open the store for an account data directory, loading any
    /// checkpoint left by a previous process
    pub async fn open(dir: &Path) -> KeeperResult<Self> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(STATE_FILE);

        let mut records: BTreeMap<u64, PendingRecord> = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        // A record without variants cannot be tracked or bumped
        records.retain(|nonce, record| {
            if record.variants.is_empty() {
                warn!(nonce, "dropping checkpointed record with no variants");
                false
            } else {
                true
            }
        });

        let by_id = DashMap::new();
        for (nonce, record) in &records {
            for variant in &record.variants {
                by_id.insert(variant.id, *nonce);
            }
        }

        if !records.is_empty() {
            debug!(
                count = records.len(),
                path = %path.display(),
                "recovered pending transactions from checkpoint"
            );
        }

        Ok(Self {
            path,
            records: Mutex::new(records),
            by_id,
            save_seq: AtomicU64::new(0),
            save_gate: Mutex::new(0),
        })
    }

    /// Insert a freshly submitted record
    pub async fn insert(&self, record: PendingRecord) {
        {
            let mut records = self.records.lock().await;
            for variant in &record.variants {
                self.by_id.insert(variant.id, record.nonce);
            }
            if records.insert(record.nonce, record).is_some() {
                warn!("replaced existing record during insert");
            }
        }
        self.save_or_log().await;
    }

    /// Append a replacement variant and touch the bump timestamp
    pub async fn append_variant(&self, nonce: u64, variant: TxVariant) {
        {
            let mut records = self.records.lock().await;
            let Some(record) = records.get_mut(&nonce) else {
                warn!(nonce, "append for unknown nonce dropped");
                return;
            };
            self.by_id.insert(variant.id, nonce);
            record.variants.push(variant);
            record.last_bumped_at = Utc::now();
            record.bumped_at = Instant::now();
        }
        self.save_or_log().await;
    }

    /// Touch the bump timestamp after a rebroadcast attempt
    pub async fn touch(&self, nonce: u64) {
        {
            let mut records = self.records.lock().await;
            let Some(record) = records.get_mut(&nonce) else {
                return;
            };
            record.last_bumped_at = Utc::now();
            record.bumped_at = Instant::now();
        }
        self.save_or_log().await;
    }

    /// Remove a record on terminal resolution
    pub async fn remove(&self, nonce: u64) -> Option<PendingRecord> {
        let removed = {
            let mut records = self.records.lock().await;
            records.remove(&nonce)
        };
        if let Some(record) = &removed {
            for variant in &record.variants {
                self.by_id.remove(&variant.id);
            }
            self.save_or_log().await;
        }
        removed
    }

    /// Drop every record whose nonce the chain has confirmed, returning
    /// the reaped nonces
    pub async fn reap_confirmed(&self, chain_nonce: u64) -> Vec<u64> {
        let reaped: Vec<PendingRecord> = {
            let mut records = self.records.lock().await;
            let keep = records.split_off(&chain_nonce);
            let reaped = std::mem::replace(&mut *records, keep);
            reaped.into_values().collect()
        };

        if reaped.is_empty() {
            return Vec::new();
        }

        let mut nonces = Vec::with_capacity(reaped.len());
        for record in &reaped {
            for variant in &record.variants {
                self.by_id.remove(&variant.id);
            }
            nonces.push(record.nonce);
        }
        self.save_or_log().await;
        nonces
    }

    /// Claim a record for an exclusive broadcast cycle
    pub async fn claim_in_flight(&self, nonce: u64) -> bool {
        let mut records = self.records.lock().await;
        match records.get_mut(&nonce) {
            Some(record) if !record.in_flight => {
                record.in_flight = true;
                true
            }
            _ => false,
        }
    }

    pub async fn release_in_flight(&self, nonce: u64) {
        let mut records = self.records.lock().await;
        if let Some(record) = records.get_mut(&nonce) {
            record.in_flight = false;
        }
    }

    /// Records eligible for a bump cycle: not in flight and quiet for at
    /// least `threshold`
    pub async fn due_records(&self, threshold: Duration) -> Vec<PendingRecord> {
        let records = self.records.lock().await;
        records
            .values()
            .filter(|r| !r.in_flight && r.bumped_at.elapsed() >= threshold)
            .cloned()
            .collect()
    }

    pub async fn get(&self, nonce: u64) -> Option<PendingRecord> {
        self.records.lock().await.get(&nonce).cloned()
    }

    /// Resolve the nonce a variant id belongs to, covering historical
    /// variants
    pub fn nonce_of(&self, id: TxId) -> Option<u64> {
        self.by_id.get(&id).map(|entry| *entry.value())
    }

    /// All variant ids ever recorded for a nonce, oldest first
    pub async fn variant_ids(&self, nonce: u64) -> Vec<TxId> {
        self.records
            .lock()
            .await
            .get(&nonce)
            .map(|r| r.variants.iter().map(|v| v.id).collect())
            .unwrap_or_default()
    }

    pub async fn highest_nonce(&self) -> Option<u64> {
        self.records.lock().await.keys().next_back().copied()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }

    pub async fn total_variants(&self) -> usize {
        self.records
            .lock()
            .await
            .values()
            .map(|r| r.variants.len())
            .sum()
    }

    /// Checkpoint the current record set to disk
    ///
    /// The snapshot and its generation are taken atomically under the
    /// record lock; by the time the file write happens a newer snapshot
    /// may already be on disk, in which case this one is dropped.
    pub async fn persist(&self) -> KeeperResult<()> {
        let (seq, json) = {
            let records = self.records.lock().await;
            let seq = self.save_seq.fetch_add(1, Ordering::SeqCst) + 1;
            (seq, serde_json::to_vec_pretty(&*records)?)
        };

        let mut gate = self.save_gate.lock().await;
        if seq <= *gate {
            debug!(seq, written = *gate, "checkpoint superseded, dropping");
            return Ok(());
        }

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        *gate = seq;
        Ok(())
    }

    /// The in-memory map stays authoritative when a checkpoint fails;
    /// losing crash-recovery state is logged loudly instead
    async fn save_or_log(&self) {
        if let Err(e) = self.persist().await {
            error!(
                path = %self.path.display(),
                error = %e,
                "failed to checkpoint pending transactions"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{Address, U256};

    fn unsigned(gas_limit: u64) -> UnsignedTx {
        UnsignedTx {
            to: Address::repeat_byte(0x22),
            value: U256::from(1_000_000_000_000u64),
            input: Bytes::from(vec![0xde, 0xad]),
            gas_limit,
            nonce: None,
        }
    }

    fn variant(tag: u8, max_fee: u64) -> TxVariant {
        TxVariant {
            id: TxId::repeat_byte(tag),
            raw: Bytes::from(vec![tag; 16]),
            fees: FeeComponents {
                max_fee_per_gas: U256::from(max_fee),
                max_priority_fee_per_gas: U256::from(max_fee / 10),
            },
        }
    }

    #[tokio::test]
    async fn checkpoint_round_trips_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let store = PendingStore::open(dir.path()).await.unwrap();

        let mut record = PendingRecord::new(5, unsigned(21_000), variant(0x0a, 100));
        record.in_flight = false;
        store.insert(record).await;
        store.append_variant(5, variant(0x0b, 200)).await;
        store
            .insert(PendingRecord::new(7, unsigned(90_000), variant(0x0c, 150)))
            .await;

        let reloaded = PendingStore::open(dir.path()).await.unwrap();
        assert_eq!(reloaded.len().await, 2);

        let rec = reloaded.get(5).await.unwrap();
        assert_eq!(rec.nonce, 5);
        assert_eq!(rec.tx, unsigned(21_000));
        assert_eq!(rec.variants, vec![variant(0x0a, 100), variant(0x0b, 200)]);
        assert_eq!(rec.active().id, TxId::repeat_byte(0x0b));
        // runtime flags never survive a restart
        assert!(!rec.in_flight);

        let original = store.get(5).await.unwrap();
        assert_eq!(original.last_bumped_at, rec.last_bumped_at);

        // large fee values survive without precision loss
        let big = U256::from_str_radix("fffffffffffffffffffffffffff", 16).unwrap();
        let mut v = variant(0x0d, 1);
        v.fees.max_fee_per_gas = big;
        reloaded.append_variant(7, v).await;
        let again = PendingStore::open(dir.path()).await.unwrap();
        assert_eq!(again.get(7).await.unwrap().active().fees.max_fee_per_gas, big);
    }

    #[tokio::test]
    async fn variant_index_follows_mutations() {
        let dir = tempfile::tempdir().unwrap();
        let store = PendingStore::open(dir.path()).await.unwrap();

        store
            .insert(PendingRecord::new(3, unsigned(21_000), variant(0x0a, 100)))
            .await;
        store.append_variant(3, variant(0x0b, 120)).await;

        assert_eq!(store.nonce_of(TxId::repeat_byte(0x0a)), Some(3));
        assert_eq!(store.nonce_of(TxId::repeat_byte(0x0b)), Some(3));
        assert_eq!(
            store.variant_ids(3).await,
            vec![TxId::repeat_byte(0x0a), TxId::repeat_byte(0x0b)]
        );

        store.remove(3).await;
        assert_eq!(store.nonce_of(TxId::repeat_byte(0x0a)), None);
        assert_eq!(store.nonce_of(TxId::repeat_byte(0x0b)), None);
    }

    #[tokio::test]
    async fn reap_drops_only_confirmed_nonces() {
        let dir = tempfile::tempdir().unwrap();
        let store = PendingStore::open(dir.path()).await.unwrap();

        for nonce in [4u64, 5, 6, 8] {
            store
                .insert(PendingRecord::new(
                    nonce,
                    unsigned(21_000),
                    variant(nonce as u8, 100),
                ))
                .await;
        }

        let reaped = store.reap_confirmed(6).await;
        assert_eq!(reaped, vec![4, 5]);
        assert_eq!(store.len().await, 2);
        assert_eq!(store.highest_nonce().await, Some(8));
        assert_eq!(store.nonce_of(TxId::repeat_byte(4)), None);

        // reloading reflects the reap
        let reloaded = PendingStore::open(dir.path()).await.unwrap();
        assert_eq!(reloaded.len().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn due_records_respect_quiet_period_and_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let store = PendingStore::open(dir.path()).await.unwrap();

        store
            .insert(PendingRecord::new(1, unsigned(21_000), variant(1, 100)))
            .await;
        store.release_in_flight(1).await;

        assert!(store.due_records(Duration::from_secs(15)).await.is_empty());

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(store.due_records(Duration::from_secs(15)).await.len(), 1);

        // a touch resets the quiet period
        store.touch(1).await;
        assert!(store.due_records(Duration::from_secs(15)).await.is_empty());

        // in-flight records are never due
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(store.claim_in_flight(1).await);
        assert!(!store.claim_in_flight(1).await);
        assert!(store.due_records(Duration::from_secs(15)).await.is_empty());
        store.release_in_flight(1).await;
        assert_eq!(store.due_records(Duration::from_secs(15)).await.len(), 1);
    }
}
