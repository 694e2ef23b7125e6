//! Remote sandbox leasing.
//!
//! Sandboxes are scarce, quota-limited and time-bounded. The [`SandboxPool`]
//! leases them to sessions (one lease per session id), provisions through the
//! [`CredentialPool`](crate::credentials::CredentialPool) with rotation, and
//! reclaims idle or aged leases on a timer.
//!
//! ```text
//! session tool call ──► SandboxPool::get_or_create(session_id)
//!                              │
//!            existing lease? ──┴── no ──► CredentialPool::acquire()
//!                  │                              │
//!              refresh                  SandboxProvider::create()
//!                  │                              │
//!                  ▼                     quota? next credential
//!             SandboxHandle ◄──────────── register lease
//! ```

mod http;
mod pool;

pub use http::HttpSandboxProvider;
pub use pool::{LeaseState, PoolStats, ReaperHandle, SandboxLease, SandboxPool, SharedSandboxPool};

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::credentials::Credential;

/// Handle to one remotely provisioned sandbox.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxHandle {
    /// Provider-assigned sandbox id
    pub id: String,
    /// Credential the sandbox was provisioned with
    pub credential_id: String,
    /// Token used for follow-up calls on this sandbox
    #[serde(skip_serializing)]
    pub token: String,
}

impl std::fmt::Debug for SandboxHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxHandle")
            .field("id", &self.id)
            .field("credential_id", &self.credential_id)
            .finish()
    }
}

/// Output of running code inside a sandbox.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionOutput {
    pub stdout: String,
    pub stderr: String,
    /// Runtime error reported by the sandbox (exception, non-zero exit)
    #[serde(default)]
    pub error: Option<String>,
}

/// Failure talking to the sandbox provider.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProvisionError {
    /// Credential exhausted its quota or rate limit
    #[error("quota exhausted: {0}")]
    Quota(String),

    /// Any other provider failure
    #[error("{0}")]
    Other(String),
}

impl ProvisionError {
    pub fn is_quota(&self) -> bool {
        matches!(self, Self::Quota(_))
    }
}

/// Errors surfaced by the sandbox pool.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SandboxError {
    #[error("no sandbox credentials configured")]
    NoCredentials,

    #[error("sandbox pool at capacity ({0} leases)")]
    AtCapacity(usize),

    #[error("all {attempts} sandbox credentials exhausted their quota: {last_error}")]
    QuotaExhausted { attempts: usize, last_error: String },

    #[error("sandbox provisioning failed: {0}")]
    Provisioning(String),

    #[error("sandbox execution failed: {0}")]
    Execution(String),
}

/// Remote sandbox provisioning service.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Provision a sandbox that the provider keeps alive for at most `timeout`.
    async fn create(
        &self,
        credential: &Credential,
        timeout: Duration,
    ) -> Result<SandboxHandle, ProvisionError>;

    /// Tear a sandbox down.
    async fn destroy(&self, handle: &SandboxHandle) -> Result<(), ProvisionError>;

    /// Run code inside a sandbox.
    async fn run_code(
        &self,
        handle: &SandboxHandle,
        code: &str,
        language: &str,
    ) -> Result<ExecutionOutput, ProvisionError>;
}
