//! Coordination store contract.
//!
//! A coordination store keeps re-entrant, leased, exclusive locks outside the
//! process so that every application instance sees the same owners. Each key
//! records the holder that owns it and how many times that holder has
//! acquired it. A holder that acquires a key it already owns is granted
//! immediately and its hold count goes up; the key is removed only when the
//! count returns to zero or the lease runs out.
//!
//! # Implementations
//!
//! - `RedisCoordinationStore` (crate `storefront-redis`) - production
//! - `InMemoryCoordinationStore` (crate `storefront-testing`) - tests and
//!   single-process runs

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by a coordination store.
#[derive(Error, Debug, Clone)]
pub enum CoordinationError {
    /// The store could not be reached.
    #[error("Coordination store connection failed: {0}")]
    ConnectionFailed(String),

    /// A server-side script or command failed.
    #[error("Coordination store command failed on '{key}': {reason}")]
    CommandFailed {
        /// Key the command targeted
        key: String,
        /// Failure description
        reason: String,
    },

    /// Any other failure.
    #[error("Coordination store error: {0}")]
    Other(String),
}

/// Identity of a lock holder.
///
/// Holders are formatted `"{instance}:{call chain}"` so that two instances
/// never share an identity and nested calls in one call chain do.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct HolderId(String);

impl HolderId {
    /// Compose a holder id from an instance id and a call-chain id.
    #[must_use]
    pub fn new(instance: impl fmt::Display, call_chain: impl fmt::Display) -> Self {
        Self(format!("{instance}:{call_chain}"))
    }

    /// Raw holder string as stored.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Proof that a holder owns a key.
///
/// Returned by [`CoordinationStore::try_acquire`] and required to release or
/// extend the lock.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockToken {
    key: String,
    holder: HolderId,
}

impl LockToken {
    /// Create a token for `key` owned by `holder`.
    #[must_use]
    pub const fn new(key: String, holder: HolderId) -> Self {
        Self { key, holder }
    }

    /// Locked key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Owning holder.
    #[must_use]
    pub const fn holder(&self) -> &HolderId {
        &self.holder
    }
}

/// Boxed future returned by [`CoordinationStore`] methods.
pub type CoordinationFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, CoordinationError>> + Send + 'a>>;

/// Re-entrant leased lock store.
///
/// Methods return boxed futures so the store can be shared as
/// `Arc<dyn CoordinationStore>`.
pub trait CoordinationStore: Send + Sync {
    /// Acquire `key` for `holder`, waiting up to `wait`.
    ///
    /// Returns `Ok(None)` when the key is still owned by another holder once
    /// `wait` has elapsed. A successful acquisition sets the key's lease to
    /// `lease`; re-acquisition by the current owner increments its hold count
    /// and never shortens the remaining lease, so a nested hold with a short
    /// lease cannot cut into the outer hold's lease.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinationError`] if the store cannot be reached.
    fn try_acquire(
        &self,
        key: &str,
        holder: &HolderId,
        wait: Duration,
        lease: Duration,
    ) -> CoordinationFuture<'_, Option<LockToken>>;

    /// Decrement the hold count behind `token`.
    ///
    /// Returns the remaining hold count. Zero means the key was removed.
    /// Releasing a key the holder does not own is a no-op returning zero.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinationError`] if the store cannot be reached.
    fn release(&self, token: &LockToken) -> CoordinationFuture<'_, u32>;

    /// Reset the lease of a key the holder still owns.
    ///
    /// Returns `false` if the holder no longer owns the key.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinationError`] if the store cannot be reached.
    fn extend_lease(&self, token: &LockToken, lease: Duration) -> CoordinationFuture<'_, bool>;

    /// Current hold count of `holder` on `key` (zero if not owned).
    ///
    /// # Errors
    ///
    /// Returns [`CoordinationError`] if the store cannot be reached.
    fn hold_count(&self, key: &str, holder: &HolderId) -> CoordinationFuture<'_, u32>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn holder_id_joins_instance_and_chain() {
        let holder = HolderId::new("node-a", 17);
        assert_eq!(holder.as_str(), "node-a:17");
        assert_eq!(holder.to_string(), "node-a:17");
    }

    #[test]
    fn token_exposes_key_and_holder() {
        let holder = HolderId::new("node-a", "chain");
        let token = LockToken::new("lock:product:1".to_string(), holder.clone());
        assert_eq!(token.key(), "lock:product:1");
        assert_eq!(token.holder(), &holder);
    }

    #[test]
    fn command_failure_names_key() {
        let err = CoordinationError::CommandFailed {
            key: "lock:point:user:3".to_string(),
            reason: "NOSCRIPT".to_string(),
        };
        assert!(err.to_string().contains("lock:point:user:3"));
    }
}
