//! Sandbox lease pool - one remote sandbox per session id.
//!
//! Each lease goes through `Provisioning -> Active -> (Released | Reclaimed)`.
//! A lease never returns to `Active` once it has left it; the session gets a
//! brand new sandbox instead.
//!
//! Leases are retired well before the provider's own hard timeout (hard
//! timeout minus a safety margin) and after an idle threshold. The sweep
//! runs on a background timer owned by a [`ReaperHandle`], and is also
//! triggered on demand when the pool is full.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::{ExecutionOutput, ProvisionError, SandboxError, SandboxHandle, SandboxProvider};
use crate::config::SandboxConfig;
use crate::credentials::{CredentialPool, FailureReason};

/// Lifecycle state of a lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseState {
    /// Remote sandbox is being created
    Provisioning,
    /// Lease is usable by its session
    Active,
    /// Torn down by an explicit release
    Released,
    /// Torn down by the reclamation sweep
    Reclaimed,
}

impl LeaseState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Released | Self::Reclaimed)
    }
}

/// A session's claim on one sandbox.
#[derive(Debug, Clone)]
pub struct SandboxLease {
    /// Owning session id (lease key)
    pub session_id: String,
    pub handle: SandboxHandle,
    pub credential_id: String,
    pub created_at: Instant,
    pub last_used_at: Instant,
    pub state: LeaseState,
}

impl SandboxLease {
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    pub fn idle(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_used_at)
    }
}

/// Statistics about the pool state
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    /// Number of leases currently held by sessions
    pub active_leases: usize,
    /// Sessions whose sandbox is still being created
    pub provisioning: usize,
    /// Maximum number of concurrent leases
    pub capacity: usize,
    /// Active leases grouped by the credential that provisioned them
    pub leases_by_credential: HashMap<String, usize>,
}

/// Outcome of trying to reserve a provisioning slot.
enum Slot<'a> {
    /// Caller owns provisioning for the session
    Reserved(Reservation<'a>),
    /// Another caller is provisioning; wait on its guard
    Pending(Arc<Mutex<()>>),
    /// A lease appeared in the meantime
    Leased,
    Full,
}

/// A capacity slot held while a sandbox is created.
///
/// Dropping it (on failure or cancellation) frees the slot before waiters
/// are woken.
struct Reservation<'a> {
    pool: &'a SandboxPool,
    session_id: String,
    guard: Arc<Mutex<()>>,
    _held: OwnedMutexGuard<()>,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        let mut provisioning = self.pool.provisioning();
        if provisioning
            .get(&self.session_id)
            .is_some_and(|owner| Arc::ptr_eq(owner, &self.guard))
        {
            provisioning.remove(&self.session_id);
        }
    }
}

/// Pool of leased remote sandboxes, keyed by session id.
pub struct SandboxPool {
    provider: Arc<dyn SandboxProvider>,
    credentials: Arc<CredentialPool>,
    /// Active leases by session id
    leases: Mutex<HashMap<String, SandboxLease>>,
    /// Sessions currently being provisioned, each held by its owner's guard
    provisioning: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    capacity: usize,
    /// Lifetime requested from the provider
    hard_timeout: Duration,
    /// Oldest a lease may get (hard timeout minus safety margin)
    max_age: Duration,
    idle_timeout: Duration,
}

impl SandboxPool {
    /// Create a new sandbox pool
    ///
    /// # Arguments
    /// * `provider` - remote sandbox service
    /// * `credentials` - credential rotation for provisioning
    /// * `config` - capacity and lease lifetime limits
    pub fn new(
        provider: Arc<dyn SandboxProvider>,
        credentials: Arc<CredentialPool>,
        config: &SandboxConfig,
    ) -> Self {
        Self {
            provider,
            credentials,
            leases: Mutex::new(HashMap::new()),
            provisioning: StdMutex::new(HashMap::new()),
            capacity: config.capacity,
            hard_timeout: config.hard_timeout,
            max_age: config.max_lease_age(),
            idle_timeout: config.idle_timeout,
        }
    }

    pub fn provider(&self) -> &Arc<dyn SandboxProvider> {
        &self.provider
    }

    /// Return the session's sandbox, provisioning one if it has none.
    ///
    /// An existing lease is refreshed and reused. A lease past its maximum
    /// age is retired first so the session never holds a sandbox the provider
    /// may already have expired.
    ///
    /// A session being provisioned counts toward capacity, and only one
    /// caller provisions for a given session; the others wait for it.
    pub async fn get_or_create(&self, session_id: &str) -> Result<SandboxHandle, SandboxError> {
        let mut swept = false;
        loop {
            if let Some(handle) = self.reuse(session_id).await {
                return Ok(handle);
            }

            match self.reserve(session_id).await {
                Slot::Reserved(reservation) => return self.provision_for(reservation).await,
                Slot::Pending(guard) => {
                    // Wait for the owner to finish, then look again.
                    drop(guard.lock().await);
                }
                Slot::Leased => {}
                Slot::Full if swept => return Err(SandboxError::AtCapacity(self.capacity)),
                Slot::Full => {
                    let reclaimed = self.reclaim_expired().await;
                    tracing::info!(reclaimed, "Sandbox pool at capacity, ran reclamation sweep");
                    swept = true;
                }
            }
        }
    }

    /// Claim the right to provision for `session_id`.
    async fn reserve(&self, session_id: &str) -> Slot<'_> {
        let guard = Arc::new(Mutex::new(()));
        let held = Arc::clone(&guard).lock_owned().await;

        let leases = self.leases.lock().await;
        let mut provisioning = self.provisioning();
        if let Some(owner) = provisioning.get(session_id) {
            return Slot::Pending(Arc::clone(owner));
        }
        if leases.contains_key(session_id) {
            return Slot::Leased;
        }
        if leases.len() + provisioning.len() >= self.capacity {
            return Slot::Full;
        }

        provisioning.insert(session_id.to_string(), Arc::clone(&guard));
        Slot::Reserved(Reservation {
            pool: self,
            session_id: session_id.to_string(),
            guard,
            _held: held,
        })
    }

    fn provisioning(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Mutex<()>>>> {
        self.provisioning.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn provision_for(&self, reservation: Reservation<'_>) -> Result<SandboxHandle, SandboxError> {
        let session_id = reservation.session_id.clone();
        tracing::debug!(session_id = %session_id, state = ?LeaseState::Provisioning, "Provisioning sandbox");
        let handle = self.provision().await?;

        let now = Instant::now();
        let lease = SandboxLease {
            session_id: session_id.clone(),
            handle: handle.clone(),
            credential_id: handle.credential_id.clone(),
            created_at: now,
            last_used_at: now,
            state: LeaseState::Active,
        };
        {
            let mut leases = self.leases.lock().await;
            leases.insert(session_id.clone(), lease);
            // The reservation turns into the lease inside one critical section.
            drop(reservation);
        }

        tracing::info!(
            session_id = %session_id,
            sandbox_id = %handle.id,
            credential_id = %handle.credential_id,
            "Sandbox lease created"
        );
        Ok(handle)
    }

    /// Refresh and return a live lease; retire it if it has aged out.
    async fn reuse(&self, session_id: &str) -> Option<SandboxHandle> {
        let now = Instant::now();
        let stale = {
            let mut leases = self.leases.lock().await;
            let lease = leases.get_mut(session_id)?;
            if lease.age(now) <= self.max_age {
                lease.last_used_at = now;
                return Some(lease.handle.clone());
            }
            leases.remove(session_id)
        };

        if let Some(mut lease) = stale {
            lease.state = LeaseState::Reclaimed;
            tracing::info!(
                session_id,
                sandbox_id = %lease.handle.id,
                age_secs = lease.age(now).as_secs(),
                "Retiring aged sandbox lease before reuse"
            );
            self.teardown(&lease).await;
        }
        None
    }

    /// Try each credential (bounded by pool size) until one provisions.
    async fn provision(&self) -> Result<SandboxHandle, SandboxError> {
        let attempts = self.credentials.len().await;
        if attempts == 0 {
            return Err(SandboxError::NoCredentials);
        }

        let mut last_error = String::new();
        for attempt in 1..=attempts {
            let credential = self
                .credentials
                .acquire()
                .await
                .ok_or(SandboxError::NoCredentials)?;

            match self.provider.create(&credential, self.hard_timeout).await {
                Ok(handle) => {
                    self.credentials.report_success(&credential.id).await;
                    return Ok(handle);
                }
                Err(ProvisionError::Quota(message)) => {
                    tracing::warn!(
                        credential_id = %credential.id,
                        attempt,
                        attempts,
                        "Sandbox quota exhausted, rotating credential: {}",
                        message
                    );
                    self.credentials
                        .report_failure(&credential.id, FailureReason::QuotaExhausted)
                        .await;
                    last_error = message;
                }
                Err(ProvisionError::Other(message)) => {
                    tracing::error!(
                        credential_id = %credential.id,
                        "Sandbox provisioning failed: {}",
                        message
                    );
                    self.credentials
                        .report_failure(&credential.id, FailureReason::Transient)
                        .await;
                    return Err(SandboxError::Provisioning(message));
                }
            }
        }

        Err(SandboxError::QuotaExhausted {
            attempts,
            last_error,
        })
    }

    /// Tear down the session's sandbox. Returns whether a lease existed.
    pub async fn release(&self, session_id: &str) -> bool {
        let removed = self.leases.lock().await.remove(session_id);
        match removed {
            Some(mut lease) => {
                lease.state = LeaseState::Released;
                self.teardown(&lease).await;
                tracing::info!(session_id, sandbox_id = %lease.handle.id, "Sandbox lease released");
                true
            }
            None => false,
        }
    }

    /// Destroy every lease past its maximum age or idle threshold.
    pub async fn reclaim_expired(&self) -> usize {
        self.reclaim_expired_at(Instant::now()).await
    }

    pub(crate) async fn reclaim_expired_at(&self, now: Instant) -> usize {
        let expired: Vec<SandboxLease> = {
            let mut leases = self.leases.lock().await;
            let keys: Vec<String> = leases
                .iter()
                .filter(|(_, l)| l.age(now) > self.max_age || l.idle(now) > self.idle_timeout)
                .map(|(k, _)| k.clone())
                .collect();
            keys.iter().filter_map(|k| leases.remove(k)).collect()
        };

        for mut lease in expired.iter().cloned() {
            lease.state = LeaseState::Reclaimed;
            tracing::info!(
                session_id = %lease.session_id,
                sandbox_id = %lease.handle.id,
                age_secs = lease.age(now).as_secs(),
                idle_secs = lease.idle(now).as_secs(),
                "Reclaiming sandbox lease"
            );
            self.teardown(&lease).await;
        }
        expired.len()
    }

    /// Destroy the remote sandbox; failures are logged, never propagated.
    async fn teardown(&self, lease: &SandboxLease) {
        if let Err(e) = self.provider.destroy(&lease.handle).await {
            tracing::warn!(
                session_id = %lease.session_id,
                sandbox_id = %lease.handle.id,
                "Failed to destroy sandbox: {}",
                e
            );
        }
    }

    /// Run code in the session's sandbox, leasing one if needed.
    pub async fn run_code(
        &self,
        session_id: &str,
        code: &str,
        language: &str,
    ) -> Result<ExecutionOutput, SandboxError> {
        let handle = self.get_or_create(session_id).await?;
        let output = self
            .provider
            .run_code(&handle, code, language)
            .await
            .map_err(|e| SandboxError::Execution(e.to_string()))?;
        self.touch(session_id).await;
        Ok(output)
    }

    /// Bump a lease's last-used time.
    pub async fn touch(&self, session_id: &str) {
        if let Some(lease) = self.leases.lock().await.get_mut(session_id) {
            lease.last_used_at = Instant::now();
        }
    }

    /// Copy of the session's current lease.
    pub async fn lease(&self, session_id: &str) -> Option<SandboxLease> {
        self.leases.lock().await.get(session_id).cloned()
    }

    pub async fn active_count(&self) -> usize {
        self.leases.lock().await.len()
    }

    /// Get current pool statistics
    pub async fn stats(&self) -> PoolStats {
        let leases = self.leases.lock().await;
        let mut leases_by_credential = HashMap::new();
        for lease in leases.values() {
            *leases_by_credential
                .entry(lease.credential_id.clone())
                .or_insert(0) += 1;
        }
        PoolStats {
            active_leases: leases.len(),
            provisioning: self.provisioning().len(),
            capacity: self.capacity,
            leases_by_credential,
        }
    }

    /// Graceful shutdown: destroy every leased sandbox
    pub async fn shutdown(&self) {
        let drained: Vec<SandboxLease> = self.leases.lock().await.drain().map(|(_, l)| l).collect();
        tracing::info!(count = drained.len(), "Shutting down sandbox pool");
        for mut lease in drained {
            lease.state = LeaseState::Released;
            self.teardown(&lease).await;
        }
    }

    /// Start the background reclamation sweep.
    ///
    /// The first sweep happens one `period` after start.
    pub fn start_reaper(pool: Arc<SandboxPool>, period: Duration) -> ReaperHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let join = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tracing::info!(period_secs = period.as_secs(), "Sandbox reaper started");

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let reclaimed = pool.reclaim_expired().await;
                        if reclaimed > 0 {
                            tracing::info!(reclaimed, "Reaper reclaimed sandbox leases");
                        }
                    }
                }
            }
            tracing::info!("Sandbox reaper stopped");
        });
        ReaperHandle { cancel, join }
    }
}

/// Owns the background sweep; dropping it without `stop` leaves the task running.
pub struct ReaperHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl ReaperHandle {
    /// Stop the sweep and wait for it to exit.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.join.await {
            tracing::warn!("Sandbox reaper task ended abnormally: {}", e);
        }
    }
}

/// Shared pool type.
pub type SharedSandboxPool = Arc<SandboxPool>;
