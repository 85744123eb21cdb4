//! Selection of API keys for a job.
//!
//! Keys are consumed in ascending code order. A key is usable while its usage in the current
//! cycle is below the per-key capacity. Calls planned by jobs that have not committed yet are
//! held as in-process reservations, so two jobs started close together in the same process do
//! not plan on the same remaining capacity.

use super::{ApiKeyRecord, QuotaError, QuotaStore, Result, UsageMap};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

/// A key chosen for a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatedKey {
    pub code: String,
    pub secret: String,
    /// Usage at selection time, including calls reserved by other in-flight jobs
    pub usage: u32,
    /// Calls this job is expected to make with the key
    pub planned: u32,
}

/// The keys a job may use, in the order it should use them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    capacity: u32,
    keys: Vec<AllocatedKey>,
}

impl Allocation {
    pub fn new(capacity: u32, keys: Vec<AllocatedKey>) -> Self {
        Self { capacity, keys }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn keys(&self) -> &[AllocatedKey] {
        &self.keys
    }
}

/// Pick keys, lowest code first, until their remaining capacity covers `required` calls.
///
/// Keys at or above `capacity` are skipped. Fails with [`QuotaError::InsufficientQuota`] when
/// the whole pool cannot cover the request.
pub fn select_keys(keys: &[ApiKeyRecord], capacity: u32, required: u32) -> Result<Vec<AllocatedKey>> {
    if keys.is_empty() {
        return Err(QuotaError::NoCredentialsAvailable);
    }

    let mut usable: Vec<&ApiKeyRecord> = keys.iter().filter(|key| key.active && key.usage_count < capacity).collect();
    usable.sort_by(|a, b| a.code.cmp(&b.code));

    let remaining: u64 = usable.iter().map(|key| u64::from(capacity - key.usage_count)).sum();
    if remaining < u64::from(required) {
        return Err(QuotaError::InsufficientQuota { required, remaining });
    }

    let mut left = required;
    let mut selected = Vec::new();
    for key in usable {
        if left == 0 {
            break;
        }
        let planned = (capacity - key.usage_count).min(left);
        left -= planned;
        selected.push(AllocatedKey {
            code: key.code.clone(),
            secret: key.secret.clone(),
            usage: key.usage_count,
            planned,
        });
    }

    Ok(selected)
}

/// Hands out keys from a [`QuotaStore`] and tracks what in-flight jobs have planned.
pub struct KeyAllocator {
    store: Arc<dyn QuotaStore>,
    capacity: u32,
    reservations: Mutex<HashMap<String, u32>>,
}

impl KeyAllocator {
    pub fn new(store: Arc<dyn QuotaStore>, capacity: u32) -> Self {
        Self {
            store,
            capacity,
            reservations: Mutex::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn store(&self) -> &Arc<dyn QuotaStore> {
        &self.store
    }

    /// Reserve keys for `required` calls. The reservation holds until [`commit`](Self::commit)
    /// or [`release`](Self::release).
    #[instrument(skip(self), err)]
    pub async fn allocate(&self, required: u32) -> Result<Allocation> {
        if required == 0 {
            return Ok(Allocation::new(self.capacity, Vec::new()));
        }

        // Held across the store read so concurrent allocations see each other's reservations.
        let mut reservations = self.reservations.lock().await;

        let keys: Vec<ApiKeyRecord> = self
            .store
            .list_active_keys()
            .await?
            .into_iter()
            .map(|mut key| {
                let reserved = reservations.get(&key.secret).copied().unwrap_or(0);
                key.usage_count = key.usage_count.saturating_add(reserved);
                key
            })
            .collect();

        let selected = select_keys(&keys, self.capacity, required)?;
        for key in &selected {
            *reservations.entry(key.secret.clone()).or_default() += key.planned;
        }

        debug!(
            keys = ?selected.iter().map(|k| k.code.as_str()).collect::<Vec<_>>(),
            "Allocated API keys"
        );
        Ok(Allocation::new(self.capacity, selected))
    }

    /// Persist the calls actually made, then drop the allocation's reservation. The reservation is
    /// dropped even when the store rejects the commit.
    #[instrument(skip(self, allocation, usage), fields(calls = usage.total()), err)]
    pub async fn commit(&self, allocation: &Allocation, usage: &UsageMap) -> Result<()> {
        let result = self.store.commit_usage(usage).await;
        if let Err(e) = &result {
            warn!(error = %e, "Failed to commit API key usage");
        }
        self.release(allocation).await;
        result
    }

    /// Drop an allocation's reservation without recording usage.
    pub async fn release(&self, allocation: &Allocation) {
        let mut reservations = self.reservations.lock().await;
        for key in allocation.keys() {
            if let Some(reserved) = reservations.get_mut(&key.secret) {
                *reserved = reserved.saturating_sub(key.planned);
                if *reserved == 0 {
                    reservations.remove(&key.secret);
                }
            }
        }
    }

    /// Calls currently reserved per key secret.
    pub async fn reserved(&self) -> HashMap<String, u32> {
        self.reservations.lock().await.clone()
    }

    /// Allocate a single call and commit it immediately, handing the key to the caller.
    #[instrument(skip(self), err)]
    pub async fn checkout(&self) -> Result<AllocatedKey> {
        let allocation = self.allocate(1).await?;
        let key = match allocation.keys().first() {
            Some(key) => key.clone(),
            None => return Err(QuotaError::NoCredentialsAvailable),
        };

        let mut usage = UsageMap::new();
        usage.record(&key.secret, 1);
        self.commit(&allocation, &usage).await?;
        Ok(key)
    }
}
