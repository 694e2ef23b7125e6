//! Credential pool for the sandbox provider.
//!
//! Holds every configured credential, rotates across them round-robin and
//! disables a credential for a cooldown window after a quota failure.
//! Transient failures never disable a credential.
//!
//! Shared by every sandbox lease attempt; all mutations happen under one
//! write lock so acquire/report are single-writer critical sections.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// One set of access keys for the sandbox provider.
#[derive(Clone)]
pub struct Credential {
    /// Stable identifier (used in logs and lease bookkeeping).
    pub id: String,
    /// Secret token sent to the provider.
    pub token: String,
    /// Whether the credential is eligible for rotation.
    pub active: bool,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Monotonic time of the last failure (drives the cooldown).
    pub last_failure_at: Option<Instant>,
    /// Wall-clock time of the last failure (for snapshots).
    pub last_failure_wallclock: Option<chrono::DateTime<chrono::Utc>>,
    /// Successful uses over the process lifetime.
    pub usage_count: u64,
}

impl Credential {
    pub fn new(id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            token: token.into(),
            active: true,
            consecutive_failures: 0,
            last_failure_at: None,
            last_failure_wallclock: None,
            usage_count: 0,
        }
    }

    /// Parse a configured entry: either `id=token` or a bare token.
    ///
    /// Bare tokens get a positional id (`key-1`, `key-2`, ...).
    pub fn from_entry(entry: &str, position: usize) -> Self {
        match entry.split_once('=') {
            Some((id, token)) if !id.trim().is_empty() => Self::new(id.trim(), token.trim()),
            _ => Self::new(format!("key-{}", position + 1), entry.trim()),
        }
    }

    fn cooldown_elapsed(&self, now: Instant, cooldown: Duration) -> bool {
        self.last_failure_at
            .map(|at| now.saturating_duration_since(at) >= cooldown)
            .unwrap_or(true)
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("token", &"<redacted>")
            .field("active", &self.active)
            .field("consecutive_failures", &self.consecutive_failures)
            .field("usage_count", &self.usage_count)
            .finish()
    }
}

/// Provider error phrases that mean the credential has run out.
const QUOTA_PHRASES: &[&str] = &[
    "quota",
    "rate limit",
    "rate-limit",
    "ratelimit",
    "too many requests",
    "usage limit",
    "credit limit",
    "insufficient credits",
    "out of credits",
];

/// Why a lease attempt with a credential failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Quota or usage limit exhausted for this credential
    QuotaExhausted,
    /// Anything else (network, provider error, bad request)
    Transient,
}

impl FailureReason {
    /// Classify a provider error message.
    ///
    /// Only phrases that name a quota or rate limit count; a bare "limit"
    /// (memory limit, unlimited) does not. `429` must be a standalone number.
    pub fn from_message(message: &str) -> Self {
        let lower = message.to_lowercase();
        let has_phrase = QUOTA_PHRASES.iter().any(|p| lower.contains(p));
        let has_status = lower
            .split(|c: char| !c.is_ascii_alphanumeric())
            .any(|token| token == "429");
        if has_phrase || has_status {
            Self::QuotaExhausted
        } else {
            Self::Transient
        }
    }

    pub fn is_quota(&self) -> bool {
        matches!(self, Self::QuotaExhausted)
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::QuotaExhausted => write!(f, "quota_exhausted"),
            Self::Transient => write!(f, "transient"),
        }
    }
}

/// Serializable view of one credential (secret omitted).
#[derive(Debug, Clone, Serialize)]
pub struct CredentialSnapshot {
    pub id: String,
    pub active: bool,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<chrono::DateTime<chrono::Utc>>,
    pub usage_count: u64,
    /// Seconds until an inactive credential becomes eligible again.
    pub cooldown_remaining_secs: Option<f64>,
}

#[derive(Debug)]
struct PoolState {
    credentials: Vec<Credential>,
    /// Index of the credential returned by the previous `acquire`.
    last_index: Option<usize>,
}

/// Round-robin pool of sandbox credentials with quota cooldown.
#[derive(Debug, Clone)]
pub struct CredentialPool {
    state: Arc<Mutex<PoolState>>,
    cooldown: Duration,
}

impl CredentialPool {
    pub fn new(credentials: Vec<Credential>, cooldown: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(PoolState {
                credentials,
                last_index: None,
            })),
            cooldown,
        }
    }

    /// Build a pool from configured `id=token` / `token` entries.
    pub fn from_entries(entries: &[String], cooldown: Duration) -> Self {
        let credentials = entries
            .iter()
            .enumerate()
            .map(|(i, e)| Credential::from_entry(e, i))
            .collect();
        Self::new(credentials, cooldown)
    }

    /// Number of configured credentials.
    pub async fn len(&self) -> usize {
        self.state.lock().await.credentials.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Return the next active credential, round-robin after the last one returned.
    ///
    /// Credentials whose cooldown has elapsed are re-activated during the scan.
    /// When nothing is active, the least recently failed credential is
    /// re-activated and returned anyway. `None` only when the pool is empty.
    pub async fn acquire(&self) -> Option<Credential> {
        self.acquire_at(Instant::now()).await
    }

    pub(crate) async fn acquire_at(&self, now: Instant) -> Option<Credential> {
        let mut state = self.state.lock().await;
        let len = state.credentials.len();
        if len == 0 {
            return None;
        }

        let start = state.last_index.map(|i| (i + 1) % len).unwrap_or(0);
        for offset in 0..len {
            let idx = (start + offset) % len;
            let cred = &mut state.credentials[idx];
            if !cred.active && cred.cooldown_elapsed(now, self.cooldown) {
                tracing::info!(credential_id = %cred.id, "Credential cooldown elapsed, re-activating");
                cred.active = true;
            }
            if cred.active {
                let picked = cred.clone();
                state.last_index = Some(idx);
                return Some(picked);
            }
        }

        // Everything is cooling down: try the one that failed longest ago.
        let idx = state
            .credentials
            .iter()
            .enumerate()
            .min_by_key(|(_, c)| c.last_failure_at)
            .map(|(i, _)| i)?;
        let cred = &mut state.credentials[idx];
        tracing::warn!(
            credential_id = %cred.id,
            "All credentials inactive, forcing re-activation of least recently failed"
        );
        cred.active = true;
        let picked = cred.clone();
        state.last_index = Some(idx);
        Some(picked)
    }

    /// Record a failed lease attempt.
    ///
    /// Only quota-class failures disable the credential.
    pub async fn report_failure(&self, credential_id: &str, reason: FailureReason) {
        self.report_failure_at(credential_id, reason, Instant::now())
            .await
    }

    pub(crate) async fn report_failure_at(
        &self,
        credential_id: &str,
        reason: FailureReason,
        now: Instant,
    ) {
        let mut state = self.state.lock().await;
        let Some(cred) = state.credentials.iter_mut().find(|c| c.id == credential_id) else {
            tracing::warn!(credential_id, "Failure reported for unknown credential");
            return;
        };

        cred.consecutive_failures = cred.consecutive_failures.saturating_add(1);
        if reason.is_quota() {
            cred.active = false;
            cred.last_failure_at = Some(now);
            cred.last_failure_wallclock = Some(chrono::Utc::now());
            tracing::warn!(
                credential_id,
                consecutive_failures = cred.consecutive_failures,
                cooldown_secs = self.cooldown.as_secs_f64(),
                "Credential quota exhausted, disabled for cooldown"
            );
        } else {
            tracing::info!(
                credential_id,
                consecutive_failures = cred.consecutive_failures,
                "Transient failure on credential, keeping it active"
            );
        }
    }

    /// Record a successful use.
    pub async fn report_success(&self, credential_id: &str) {
        let mut state = self.state.lock().await;
        if let Some(cred) = state.credentials.iter_mut().find(|c| c.id == credential_id) {
            cred.usage_count += 1;
            cred.consecutive_failures = 0;
        }
    }

    /// Health view of every credential, for logs and status endpoints.
    pub async fn snapshot(&self) -> Vec<CredentialSnapshot> {
        let now = Instant::now();
        let state = self.state.lock().await;
        state
            .credentials
            .iter()
            .map(|c| CredentialSnapshot {
                id: c.id.clone(),
                active: c.active,
                consecutive_failures: c.consecutive_failures,
                last_failure_at: c.last_failure_wallclock,
                usage_count: c.usage_count,
                cooldown_remaining_secs: match (c.active, c.last_failure_at) {
                    (false, Some(at)) => Some(
                        self.cooldown
                            .saturating_sub(now.saturating_duration_since(at))
                            .as_secs_f64(),
                    ),
                    _ => None,
                },
            })
            .collect()
    }
}

/// Shared pool type.
pub type SharedCredentialPool = Arc<CredentialPool>;

#[cfg(test)]
mod tests {
    use super::*;

    const COOLDOWN: Duration = Duration::from_secs(300);

    fn pool(n: usize) -> CredentialPool {
        let creds = (0..n)
            .map(|i| Credential::new(format!("c{}", i), format!("t{}", i)))
            .collect();
        CredentialPool::new(creds, COOLDOWN)
    }

    #[tokio::test]
    async fn test_round_robin_order() {
        let pool = pool(3);
        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(pool.acquire().await.unwrap().id);
        }
        assert_eq!(seen, vec!["c0", "c1", "c2", "c0"]);
    }

    #[tokio::test]
    async fn test_empty_pool_returns_none() {
        let pool = pool(0);
        assert!(pool.acquire().await.is_none());
        assert!(pool.is_empty().await);
    }

    #[tokio::test]
    async fn test_transient_failure_keeps_credential_active() {
        let pool = pool(2);
        pool.report_failure("c0", FailureReason::Transient).await;
        let snap = pool.snapshot().await;
        assert!(snap[0].active);
        assert_eq!(snap[0].consecutive_failures, 1);
        assert!(snap[0].last_failure_at.is_none());
    }

    #[tokio::test]
    async fn test_quota_failure_skips_credential_during_cooldown() {
        let pool = pool(3);
        let start = Instant::now();
        pool.report_failure_at("c1", FailureReason::QuotaExhausted, start)
            .await;

        // While other credentials are healthy, c1 never comes back inside the window.
        for step in 0..10u64 {
            let now = start + Duration::from_secs(step * 20);
            let cred = pool.acquire_at(now).await.unwrap();
            assert_ne!(cred.id, "c1");
        }

        let later = start + COOLDOWN;
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(pool.acquire_at(later).await.unwrap().id);
        }
        assert!(ids.contains(&"c1".to_string()));
    }

    #[tokio::test]
    async fn test_all_inactive_reactivates_least_recently_failed() {
        let pool = pool(2);
        let start = Instant::now();
        pool.report_failure_at("c1", FailureReason::QuotaExhausted, start)
            .await;
        pool.report_failure_at(
            "c0",
            FailureReason::QuotaExhausted,
            start + Duration::from_secs(10),
        )
        .await;

        let cred = pool
            .acquire_at(start + Duration::from_secs(20))
            .await
            .unwrap();
        assert_eq!(cred.id, "c1");
        assert!(cred.active);
    }

    #[tokio::test]
    async fn test_single_credential_is_always_returned() {
        let pool = pool(1);
        pool.report_failure("c0", FailureReason::QuotaExhausted).await;
        assert_eq!(pool.acquire().await.unwrap().id, "c0");
    }

    #[tokio::test]
    async fn test_success_bumps_usage_and_resets_failures() {
        let pool = pool(1);
        pool.report_failure("c0", FailureReason::Transient).await;
        pool.report_success("c0").await;
        pool.report_success("c0").await;
        let snap = pool.snapshot().await;
        assert_eq!(snap[0].usage_count, 2);
        assert_eq!(snap[0].consecutive_failures, 0);
        assert!(snap[0].active);
    }

    #[test]
    fn test_failure_reason_classification() {
        assert!(FailureReason::from_message("Monthly quota exceeded").is_quota());
        assert!(FailureReason::from_message("HTTP 429 Too Many Requests").is_quota());
        assert!(!FailureReason::from_message("connection reset by peer").is_quota());
        assert!(FailureReason::from_message("Rate limit reached, retry later").is_quota());
    }

    #[test]
    fn test_unrelated_limits_are_transient() {
        for message in [
            "memory limit exceeded",
            "plan: unlimited",
            "sandbox 4291 not found",
            "request body exceeded 1MB",
        ] {
            assert_eq!(
                FailureReason::from_message(message),
                FailureReason::Transient,
                "{}",
                message
            );
        }
    }

    #[test]
    fn test_entry_parsing_and_redaction() {
        let named = Credential::from_entry("primary=secret", 0);
        assert_eq!(named.id, "primary");
        assert_eq!(named.token, "secret");

        let bare = Credential::from_entry("secret2", 1);
        assert_eq!(bare.id, "key-2");
        assert!(!format!("{:?}", bare).contains("secret2"));
    }
}
