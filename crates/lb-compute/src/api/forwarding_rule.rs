//! Forwarding rule API.
//!
//! [`ForwardingRuleApi`] is the capability a client must provide for one
//! `(version, scope)` surface. [`ForwardingRuleSurfaces`] is the strategy table
//! a caller selects from once, so no call site ever branches on the version.

use crate::error::{ComputeError, ComputeResult};
use crate::filter::Filter;
use crate::types::{ApiVersion, KeyScope, ResourceKey};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Forwarding rule operations against a single API surface.
#[async_trait]
pub trait ForwardingRuleApi: Send + Sync {
    /// API version served by this surface.
    fn version(&self) -> ApiVersion;

    /// Scope served by this surface.
    fn scope(&self) -> KeyScope;

    /// Fetches a rule. Missing rules fail with a 404 error.
    async fn get(&self, key: &ResourceKey) -> ComputeResult<Value>;

    /// Creates a rule.
    async fn insert(&self, key: &ResourceKey, rule: Value) -> ComputeResult<()>;

    /// Updates the fields present in `rule` in place.
    async fn patch(&self, key: &ResourceKey, rule: Value) -> ComputeResult<()>;

    /// Deletes a rule. Missing rules fail with a 404 error.
    async fn delete(&self, key: &ResourceKey) -> ComputeResult<()>;

    /// Lists rules in the region (or globally) that match the filter.
    async fn list(&self, region: Option<&str>, filter: &Filter) -> ComputeResult<Vec<Value>>;
}

/// Strategy table mapping `(version, scope)` to a concrete surface.
#[derive(Clone, Default)]
pub struct ForwardingRuleSurfaces {
    table: HashMap<(ApiVersion, KeyScope), Arc<dyn ForwardingRuleApi>>,
}

impl ForwardingRuleSurfaces {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a surface under its own version and scope, replacing any
    /// earlier registration.
    pub fn register(&mut self, api: Arc<dyn ForwardingRuleApi>) {
        self.table.insert((api.version(), api.scope()), api);
    }

    pub fn with(mut self, api: Arc<dyn ForwardingRuleApi>) -> Self {
        self.register(api);
        self
    }

    /// Selects the surface for the pair.
    pub fn select(
        &self,
        version: ApiVersion,
        scope: KeyScope,
    ) -> ComputeResult<Arc<dyn ForwardingRuleApi>> {
        self.table
            .get(&(version, scope))
            .cloned()
            .ok_or_else(|| ComputeError::Unsupported {
                resource: "forwardingRules".to_string(),
                version: version.to_string(),
                scope: scope.to_string(),
            })
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

impl fmt::Debug for ForwardingRuleSurfaces {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<String> = self
            .table
            .keys()
            .map(|(v, s)| format!("{}/{}", v, s))
            .collect();
        keys.sort();
        f.debug_struct("ForwardingRuleSurfaces")
            .field("surfaces", &keys)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullApi {
        version: ApiVersion,
        scope: KeyScope,
    }

    #[async_trait]
    impl ForwardingRuleApi for NullApi {
        fn version(&self) -> ApiVersion {
            self.version
        }

        fn scope(&self) -> KeyScope {
            self.scope
        }

        async fn get(&self, key: &ResourceKey) -> ComputeResult<Value> {
            Err(ComputeError::not_found(&key.name))
        }

        async fn insert(&self, _key: &ResourceKey, _rule: Value) -> ComputeResult<()> {
            Ok(())
        }

        async fn patch(&self, _key: &ResourceKey, _rule: Value) -> ComputeResult<()> {
            Ok(())
        }

        async fn delete(&self, key: &ResourceKey) -> ComputeResult<()> {
            Err(ComputeError::not_found(&key.name))
        }

        async fn list(&self, _region: Option<&str>, _filter: &Filter) -> ComputeResult<Vec<Value>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_select_registered_surface() {
        let surfaces = ForwardingRuleSurfaces::new()
            .with(Arc::new(NullApi {
                version: ApiVersion::Ga,
                scope: KeyScope::Regional,
            }))
            .with(Arc::new(NullApi {
                version: ApiVersion::Beta,
                scope: KeyScope::Global,
            }));

        assert_eq!(surfaces.len(), 2);
        let api = surfaces.select(ApiVersion::Beta, KeyScope::Global).unwrap();
        assert_eq!(api.version(), ApiVersion::Beta);
        assert_eq!(api.scope(), KeyScope::Global);
    }

    #[test]
    fn test_select_missing_surface() {
        let surfaces = ForwardingRuleSurfaces::new();
        let err = surfaces
            .select(ApiVersion::Alpha, KeyScope::Regional)
            .err()
            .unwrap();
        assert!(matches!(err, ComputeError::Unsupported { .. }));
        assert!(surfaces.is_empty());
    }

    #[tokio::test]
    async fn test_surface_is_usable_through_table() {
        let surfaces = ForwardingRuleSurfaces::new().with(Arc::new(NullApi {
            version: ApiVersion::Ga,
            scope: KeyScope::Regional,
        }));
        let api = surfaces.select(ApiVersion::Ga, KeyScope::Regional).unwrap();
        let err = api
            .get(&ResourceKey::regional("fr", "us-central1"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
