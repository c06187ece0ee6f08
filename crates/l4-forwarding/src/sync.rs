//! Sync status and error types reported by the orchestrator.

use crate::address::AddressError;
use crate::ports::StepError;
use crate::rule::{EqualityError, NetworkTier, StoreError};
use lb_compute::ComputeError;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// What the caller should do with the resource after a sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncStatus {
    /// Nothing changed in the cloud; a periodic resync found it up to date.
    ResourceResync,
    /// The cloud resource was created, patched or recreated.
    ResourceUpdate,
}

impl SyncStatus {
    /// Combines statuses of several resources; any update wins.
    pub fn merge(self, other: SyncStatus) -> SyncStatus {
        if self == SyncStatus::ResourceUpdate || other == SyncStatus::ResourceUpdate {
            SyncStatus::ResourceUpdate
        } else {
            SyncStatus::ResourceResync
        }
    }
}

/// Kind of resource a sync failed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    ForwardingRule,
    Address,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::ForwardingRule => write!(f, "forwarding rule"),
            ResourceKind::Address => write!(f, "address"),
        }
    }
}

/// Whether the rule's address is managed by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IpAddressType {
    #[default]
    Undefined,
    /// Reserved by the controller for this Service.
    Managed,
    /// Reserved by the user.
    Unmanaged,
}

/// Error type for ensure operations.
#[derive(Debug, Clone, Error)]
pub enum EnsureError {
    /// Existing rule has a tier other than the one wanted.
    #[error("Network tier mismatch for resource {resource}, existing tier: {existing}, want: {wanted}")]
    NetworkTierMismatch {
        resource: String,
        existing: NetworkTier,
        wanted: NetworkTier,
    },

    /// Rule was not readable right after it was written.
    #[error("Forwarding rule {name} not found")]
    RuleNotFound { name: String },

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Equality(#[from] EqualityError),

    #[error(transparent)]
    Step(#[from] StepError),

    #[error(transparent)]
    Address(#[from] AddressError),

    #[error("Failed to compute description for forwarding rule {name}: {message}")]
    Description { name: String, message: String },

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: String,
        timeout: Duration,
    },

    /// Several independent operations failed.
    #[error("{}", join_errors(.0))]
    Multiple(Vec<EnsureError>),
}

fn join_errors(errors: &[EnsureError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<StoreError> for EnsureError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Compute(ComputeError::Timeout { operation, timeout }) => {
                EnsureError::Timeout { operation, timeout }
            }
            other => EnsureError::Store(other),
        }
    }
}

impl EnsureError {
    pub fn tier_mismatch(
        resource: impl Into<String>,
        existing: NetworkTier,
        wanted: NetworkTier,
    ) -> Self {
        EnsureError::NetworkTierMismatch {
            resource: resource.into(),
            existing,
            wanted,
        }
    }

    pub fn rule_not_found(name: impl Into<String>) -> Self {
        EnsureError::RuleNotFound { name: name.into() }
    }

    /// Folds a list of errors into one, `None` if the list is empty.
    pub fn from_many(mut errors: Vec<EnsureError>) -> Option<Self> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(EnsureError::Multiple(errors)),
        }
    }

    /// Errors the Service owner has to fix; retrying alone will not help.
    pub fn is_user_error(&self) -> bool {
        match self {
            EnsureError::NetworkTierMismatch { .. } => true,
            EnsureError::Store(StoreError::IpConfiguration { .. }) => true,
            EnsureError::Multiple(errors) => errors.iter().any(EnsureError::is_user_error),
            _ => false,
        }
    }

    /// Attaches the resync status and the failing resource.
    pub fn resync(self, resource: ResourceKind) -> SyncError {
        SyncError::new(SyncStatus::ResourceResync, resource, self)
    }

    /// Attaches the update status and the failing resource.
    pub fn update(self, resource: ResourceKind) -> SyncError {
        SyncError::new(SyncStatus::ResourceUpdate, resource, self)
    }
}

/// A failed sync: the error, the resource it failed on and the status to
/// report.
#[derive(Debug, Clone, Error)]
#[error("failed to sync {resource}: {error}")]
pub struct SyncError {
    pub status: SyncStatus,
    pub resource: ResourceKind,
    #[source]
    pub error: EnsureError,
}

impl SyncError {
    pub fn new(status: SyncStatus, resource: ResourceKind, error: EnsureError) -> Self {
        Self {
            status,
            resource,
            error,
        }
    }

    pub fn is_user_error(&self) -> bool {
        self.error.is_user_error()
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

/// Extension trait for reading the status out of a sync result.
pub trait SyncResultExt {
    fn status(&self) -> SyncStatus;
}

/// Results whose success value knows its status.
pub trait HasSyncStatus {
    fn sync_status(&self) -> SyncStatus;
}

impl<T: HasSyncStatus> SyncResultExt for SyncResult<T> {
    fn status(&self) -> SyncStatus {
        match self {
            Ok(value) => value.sync_status(),
            Err(e) => e.status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_merge() {
        use SyncStatus::*;
        assert_eq!(ResourceResync.merge(ResourceResync), ResourceResync);
        assert_eq!(ResourceResync.merge(ResourceUpdate), ResourceUpdate);
        assert_eq!(ResourceUpdate.merge(ResourceResync), ResourceUpdate);
    }

    #[test]
    fn test_store_timeout_maps_to_timeout() {
        let err: EnsureError =
            StoreError::Compute(ComputeError::timeout("get forwarding rule", Duration::from_secs(1)))
                .into();
        assert!(matches!(err, EnsureError::Timeout { .. }));

        let err: EnsureError = StoreError::Compute(ComputeError::http(500, "boom")).into();
        assert!(matches!(err, EnsureError::Store(_)));
    }

    #[test]
    fn test_user_errors() {
        assert!(
            EnsureError::tier_mismatch("fr", NetworkTier::Premium, NetworkTier::Standard)
                .is_user_error()
        );
        let in_use: EnsureError = StoreError::IpConfiguration {
            address: "1.2.3.4".to_string(),
            message: "in use".to_string(),
        }
        .into();
        assert!(in_use.is_user_error());
        assert!(!EnsureError::rule_not_found("fr").is_user_error());

        let many = EnsureError::from_many(vec![EnsureError::rule_not_found("a"), in_use]).unwrap();
        assert!(many.is_user_error());
        assert!(many.to_string().contains("; "));
    }

    #[test]
    fn test_from_many() {
        assert!(EnsureError::from_many(Vec::new()).is_none());
        let single = EnsureError::from_many(vec![EnsureError::rule_not_found("a")]).unwrap();
        assert!(matches!(single, EnsureError::RuleNotFound { .. }));
    }

    #[test]
    fn test_sync_error_status() {
        let err = EnsureError::rule_not_found("fr").update(ResourceKind::ForwardingRule);
        assert_eq!(err.status, SyncStatus::ResourceUpdate);
        assert_eq!(err.resource, ResourceKind::ForwardingRule);
        assert_eq!(err.to_string(), "failed to sync forwarding rule: Forwarding rule fr not found");

        let result: SyncResult<()> = Err(EnsureError::rule_not_found("fr").resync(ResourceKind::Address));
        assert!(result.is_err());
    }
}
