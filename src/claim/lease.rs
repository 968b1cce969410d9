use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::claim::model::WorkItemId;
use crate::config::LockConfig;
use crate::error::{ClaimError, ClaimResult};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Lease {
    pub resource: WorkItemId,
    pub holder: String,
    pub token: u64,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(30));
    now + ttl
}

/// Per-resource lease store. Tokens handed out by one backend strictly increase.
#[async_trait]
pub trait LeaseBackend: Send + Sync {
    /// Returns `None` while another holder's lease is still live.
    async fn try_acquire(
        &self,
        resource: &WorkItemId,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> ClaimResult<Option<Lease>>;

    /// Returns false once the lease expired or the token was superseded.
    async fn renew(&self, lease: &Lease, ttl: Duration, now: DateTime<Utc>) -> ClaimResult<bool>;

    /// Token compare-and-delete. Returns false when the lease had already expired.
    async fn release(&self, lease: &Lease, now: DateTime<Utc>) -> ClaimResult<bool>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LeaseTable {
    next_token: u64,
    leases: BTreeMap<String, Lease>,
}

impl LeaseTable {
    fn try_acquire(
        &mut self,
        resource: &WorkItemId,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Option<Lease> {
        if let Some(current) = self.leases.get(resource.as_str()) {
            if !current.is_expired(now) {
                return None;
            }
        }
        self.next_token += 1;
        let lease = Lease {
            resource: resource.clone(),
            holder: holder.to_string(),
            token: self.next_token,
            expires_at: expiry(now, ttl),
        };
        self.leases
            .insert(resource.as_str().to_string(), lease.clone());
        Some(lease)
    }

    fn renew(&mut self, lease: &Lease, ttl: Duration, now: DateTime<Utc>) -> bool {
        match self.leases.get_mut(lease.resource.as_str()) {
            Some(current) if current.token == lease.token && !current.is_expired(now) => {
                current.expires_at = expiry(now, ttl);
                true
            }
            _ => false,
        }
    }

    fn release(&mut self, lease: &Lease, now: DateTime<Utc>) -> bool {
        match self.leases.get(lease.resource.as_str()) {
            Some(current) if current.token == lease.token => {
                let live = !current.is_expired(now);
                self.leases.remove(lease.resource.as_str());
                live
            }
            _ => false,
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryLeaseBackend {
    table: Mutex<LeaseTable>,
}

impl MemoryLeaseBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_table<T>(&self, f: impl FnOnce(&mut LeaseTable) -> T) -> ClaimResult<T> {
        let mut table = self
            .table
            .lock()
            .map_err(|_| ClaimError::Backend("lease table mutex poisoned".to_string()))?;
        Ok(f(&mut table))
    }
}

#[async_trait]
impl LeaseBackend for MemoryLeaseBackend {
    async fn try_acquire(
        &self,
        resource: &WorkItemId,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> ClaimResult<Option<Lease>> {
        self.with_table(|table| table.try_acquire(resource, holder, ttl, now))
    }

    async fn renew(&self, lease: &Lease, ttl: Duration, now: DateTime<Utc>) -> ClaimResult<bool> {
        self.with_table(|table| table.renew(lease, ttl, now))
    }

    async fn release(&self, lease: &Lease, now: DateTime<Utc>) -> ClaimResult<bool> {
        self.with_table(|table| table.release(lease, now))
    }
}

/// Lease table shared through the filesystem; an exclusive `fs2` lock guards each read-modify-write.
#[derive(Debug, Clone)]
pub struct FileLeaseBackend {
    dir: PathBuf,
}

impl FileLeaseBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    async fn with_table<T, F>(&self, f: F) -> ClaimResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut LeaseTable) -> T + Send + 'static,
    {
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || locked_table(&dir, f))
            .await
            .map_err(|err| ClaimError::Backend(format!("lease task failed: {err}")))?
    }
}

fn locked_table<T>(dir: &Path, f: impl FnOnce(&mut LeaseTable) -> T) -> ClaimResult<T> {
    crate::warden_io::ensure_dir(dir).map_err(|err| ClaimError::Backend(err.to_string()))?;
    let lock_file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(dir.join("leases.lock"))?;
    lock_file.lock_exclusive()?;

    let table_path = dir.join("leases.json");
    let mut table: LeaseTable = match std::fs::read(&table_path) {
        Ok(bytes) => serde_json::from_slice(&bytes)?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => LeaseTable::default(),
        Err(err) => return Err(err.into()),
    };

    let out = f(&mut table);
    let written = crate::warden_io::write_json_atomic(&table_path, &table)
        .map_err(|err| ClaimError::Backend(err.to_string()));
    if let Err(err) = lock_file.unlock() {
        warn!(path = %dir.display(), error = %err, "lease table unlock failed");
    }
    written?;
    Ok(out)
}

#[async_trait]
impl LeaseBackend for FileLeaseBackend {
    async fn try_acquire(
        &self,
        resource: &WorkItemId,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> ClaimResult<Option<Lease>> {
        let resource = resource.clone();
        let holder = holder.to_string();
        self.with_table(move |table| table.try_acquire(&resource, &holder, ttl, now))
            .await
    }

    async fn renew(&self, lease: &Lease, ttl: Duration, now: DateTime<Utc>) -> ClaimResult<bool> {
        let lease = lease.clone();
        self.with_table(move |table| table.renew(&lease, ttl, now)).await
    }

    async fn release(&self, lease: &Lease, now: DateTime<Utc>) -> ClaimResult<bool> {
        let lease = lease.clone();
        self.with_table(move |table| table.release(&lease, now)).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Exponential delay before retry number `attempt` (0-based), without jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.min(16);
        let raw = self.base_delay.saturating_mul(1u32 << shift);
        raw.min(self.max_delay)
    }

    fn jittered(&self, attempt: u32) -> Duration {
        let delay = self.delay_for(attempt);
        let spread = (delay.as_millis() as u64) / 2;
        let jitter = if spread == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=spread)
        };
        delay + Duration::from_millis(jitter)
    }
}

impl From<&LockConfig> for RetryPolicy {
    fn from(cfg: &LockConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms.max(cfg.base_delay_ms)),
        }
    }
}

/// Retrying front end over a [`LeaseBackend`].
#[derive(Clone)]
pub struct LeaseLock {
    backend: Arc<dyn LeaseBackend>,
    holder: String,
    ttl: Duration,
    policy: RetryPolicy,
}

impl LeaseLock {
    pub fn new(backend: Arc<dyn LeaseBackend>, ttl: Duration, policy: RetryPolicy) -> Self {
        Self {
            backend,
            holder: format!("warden-{}", uuid::Uuid::new_v4()),
            ttl,
            policy,
        }
    }

    pub fn from_config(backend: Arc<dyn LeaseBackend>, cfg: &LockConfig) -> Self {
        Self::new(backend, cfg.ttl(), RetryPolicy::from(cfg))
    }

    pub async fn acquire(&self, resource: &WorkItemId) -> ClaimResult<LeaseGuard> {
        for attempt in 0..self.policy.max_attempts {
            let acquired = self
                .backend
                .try_acquire(resource, &self.holder, self.ttl, Utc::now())
                .await?;
            if let Some(lease) = acquired {
                debug!(work_item = %resource, token = lease.token, attempt, "lease acquired");
                return Ok(LeaseGuard {
                    backend: Arc::clone(&self.backend),
                    lease,
                    ttl: self.ttl,
                    released: false,
                });
            }
            if attempt + 1 < self.policy.max_attempts {
                let delay = self.policy.jittered(attempt);
                debug!(work_item = %resource, attempt, delay_ms = delay.as_millis() as u64, "lease busy, backing off");
                tokio::time::sleep(delay).await;
            }
        }

        warn!(work_item = %resource, attempts = self.policy.max_attempts, "lease unavailable");
        Err(ClaimError::LockUnavailable {
            resource: resource.clone(),
            attempts: self.policy.max_attempts,
        })
    }
}

/// Held lease. Released on drop if the holder did not release it explicitly.
pub struct LeaseGuard {
    backend: Arc<dyn LeaseBackend>,
    lease: Lease,
    ttl: Duration,
    released: bool,
}

impl LeaseGuard {
    pub fn token(&self) -> u64 {
        self.lease.token
    }

    pub async fn renew(&mut self) -> ClaimResult<bool> {
        let now = Utc::now();
        let renewed = self.backend.renew(&self.lease, self.ttl, now).await?;
        if renewed {
            self.lease.expires_at = expiry(now, self.ttl);
        }
        Ok(renewed)
    }

    /// Renews when less than half the ttl is left. The file backend stamps expiry before it
    /// waits on the OS lock, so a contended acquire can hand back a mostly spent lease.
    pub async fn ensure_fresh(&mut self) -> ClaimResult<()> {
        let half_left = expiry(Utc::now(), self.ttl / 2);
        if self.lease.expires_at > half_left {
            return Ok(());
        }
        if self.renew().await? {
            debug!(work_item = %self.lease.resource, token = self.lease.token, "lease renewed");
            Ok(())
        } else {
            Err(ClaimError::LockUnavailable {
                resource: self.lease.resource.clone(),
                attempts: 1,
            })
        }
    }

    pub async fn release(mut self) -> ClaimResult<bool> {
        self.released = true;
        self.backend.release(&self.lease, Utc::now()).await
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let backend = Arc::clone(&self.backend);
        let lease = self.lease.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(err) = backend.release(&lease, Utc::now()).await {
                    warn!(work_item = %lease.resource, token = lease.token, error = %err, "lease release failed");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::tempdir;

    const TTL: Duration = Duration::from_secs(30);

    fn item() -> WorkItemId {
        WorkItemId::new("acme/widgets#1")
    }

    fn quick_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[tokio::test]
    async fn live_lease_blocks_second_holder() {
        let backend = MemoryLeaseBackend::new();
        let now = Utc::now();

        let first = backend.try_acquire(&item(), "a", TTL, now).await.unwrap();
        let second = backend.try_acquire(&item(), "b", TTL, now).await.unwrap();

        assert!(first.is_some());
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn expired_lease_is_taken_over_with_higher_token() {
        let backend = MemoryLeaseBackend::new();
        let now = Utc::now();

        let first = backend
            .try_acquire(&item(), "a", TTL, now)
            .await
            .unwrap()
            .unwrap();
        let later = now + chrono::Duration::seconds(31);
        let second = backend
            .try_acquire(&item(), "b", TTL, later)
            .await
            .unwrap()
            .unwrap();

        assert!(second.token > first.token);
        assert!(!backend.renew(&first, TTL, later).await.unwrap());
        assert!(!backend.release(&first, later).await.unwrap());
        assert!(backend.release(&second, later).await.unwrap());
    }

    #[tokio::test]
    async fn release_after_expiry_reports_expired() {
        let backend = MemoryLeaseBackend::new();
        let now = Utc::now();
        let lease = backend
            .try_acquire(&item(), "a", TTL, now)
            .await
            .unwrap()
            .unwrap();

        let late = now + chrono::Duration::seconds(60);
        assert!(!backend.release(&lease, late).await.unwrap());
        assert!(backend
            .try_acquire(&item(), "b", TTL, late)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn tokens_increase_across_resources() {
        let backend = MemoryLeaseBackend::new();
        let now = Utc::now();
        let mut last = 0;
        for n in 0..5 {
            let resource = WorkItemId::new(format!("acme/widgets#{n}"));
            let lease = backend
                .try_acquire(&resource, "a", TTL, now)
                .await
                .unwrap()
                .unwrap();
            assert!(lease.token > last);
            last = lease.token;
        }
    }

    #[tokio::test]
    async fn lock_gives_up_with_lock_unavailable() {
        let backend: Arc<dyn LeaseBackend> = Arc::new(MemoryLeaseBackend::new());
        let holder = LeaseLock::new(Arc::clone(&backend), TTL, quick_policy(3));
        let contender = LeaseLock::new(backend, TTL, quick_policy(3));

        let guard = holder.acquire(&item()).await.unwrap();
        let err = contender.acquire(&item()).await.err().unwrap();
        assert!(matches!(err, ClaimError::LockUnavailable { attempts: 3, .. }));

        assert!(guard.release().await.unwrap());
        let next = contender.acquire(&item()).await.unwrap();
        assert!(next.token() > 1);
        next.release().await.unwrap();
    }

    #[tokio::test]
    async fn dropped_guard_frees_the_resource() {
        let backend: Arc<dyn LeaseBackend> = Arc::new(MemoryLeaseBackend::new());
        let lock = LeaseLock::new(backend, TTL, quick_policy(20));

        {
            let _guard = lock.acquire(&item()).await.unwrap();
        }

        let guard = lock.acquire(&item()).await.unwrap();
        assert!(guard.release().await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_acquire_admits_exactly_one() {
        let backend = Arc::new(MemoryLeaseBackend::new());
        let now = Utc::now();
        let mut tasks = Vec::new();
        for n in 0..16 {
            let backend = Arc::clone(&backend);
            tasks.push(tokio::spawn(async move {
                backend
                    .try_acquire(&item(), &format!("holder-{n}"), TTL, now)
                    .await
                    .unwrap()
            }));
        }

        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn file_backend_is_shared_between_instances() {
        let dir = tempdir().unwrap();
        let first = FileLeaseBackend::new(dir.path());
        let second = FileLeaseBackend::new(dir.path());
        let now = Utc::now();

        let lease = first
            .try_acquire(&item(), "a", TTL, now)
            .await
            .unwrap()
            .unwrap();
        assert!(second
            .try_acquire(&item(), "b", TTL, now)
            .await
            .unwrap()
            .is_none());

        assert!(second.renew(&lease, TTL, now).await.unwrap());
        assert!(first.release(&lease, now).await.unwrap());

        let next = second
            .try_acquire(&item(), "b", TTL, now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.token, lease.token + 1);
    }

    fn guard_for(backend: &Arc<dyn LeaseBackend>, lease: Lease) -> LeaseGuard {
        LeaseGuard {
            backend: Arc::clone(backend),
            lease,
            ttl: TTL,
            released: false,
        }
    }

    #[tokio::test]
    async fn mostly_spent_lease_is_renewed_before_use() {
        let backend: Arc<dyn LeaseBackend> = Arc::new(MemoryLeaseBackend::new());
        let stamped = Utc::now() - chrono::Duration::seconds(25);
        let lease = backend
            .try_acquire(&item(), "a", TTL, stamped)
            .await
            .unwrap()
            .unwrap();
        let mut guard = guard_for(&backend, lease);

        guard.ensure_fresh().await.unwrap();

        assert!(guard.lease.expires_at > Utc::now() + chrono::Duration::seconds(20));
        let token = guard.token();
        assert!(guard.release().await.unwrap());
        assert_eq!(token, 1);
    }

    #[tokio::test]
    async fn superseded_lease_cannot_be_freshened() {
        let backend: Arc<dyn LeaseBackend> = Arc::new(MemoryLeaseBackend::new());
        let stamped = Utc::now() - chrono::Duration::seconds(40);
        let lease = backend
            .try_acquire(&item(), "a", TTL, stamped)
            .await
            .unwrap()
            .unwrap();
        let taken_over = backend
            .try_acquire(&item(), "b", TTL, Utc::now())
            .await
            .unwrap()
            .unwrap();
        let mut guard = guard_for(&backend, lease);

        let err = guard.ensure_fresh().await.unwrap_err();

        assert!(matches!(err, ClaimError::LockUnavailable { .. }));
        assert!(err.is_retryable());
        guard.released = true;
        assert!(backend.release(&taken_over, Utc::now()).await.unwrap());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 8,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(300),
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(50));
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(300));
        assert_eq!(policy.delay_for(30), Duration::from_millis(300));
    }
}
