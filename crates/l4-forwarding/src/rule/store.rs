//! Forwarding rule store.
//!
//! A thin pass-through to one compute API surface. The surface is picked
//! from the strategy table once, when the store is built; every call after
//! that is bounded by the configured per-call timeout. Nothing is cached.

use super::types::ForwardingRule;
use lb_compute::{
    ApiVersion, ComputeError, Filter, ForwardingRuleApi, ForwardingRuleSurfaces, KeyScope,
    ResourceKey,
};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Message returned when an external rule asks for an address in use.
pub const ADDRESS_IN_USE_MESSAGE_EXTERNAL: &str =
    "Specified IP address is in-use and would result in a conflict.";
/// Message returned when an internal rule asks for an address in use.
pub const ADDRESS_IN_USE_MESSAGE_INTERNAL: &str = "IP_IN_USE_BY_ANOTHER_RESOURCE";

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error(transparent)]
    Compute(#[from] ComputeError),

    /// The requested address is held by another resource.
    #[error("IP address {address:?} is already in use: {message}")]
    IpConfiguration { address: String, message: String },

    #[error("failed to convert forwarding rule {name:?}: {message}")]
    Normalize { name: String, message: String },
}

impl StoreError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, StoreError::Compute(ComputeError::Timeout { .. }))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::Compute(e) if e.is_not_found())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Returns true for the responses the API uses to reject an address that
/// is in use: 400 for external rules, 409 for internal ones.
pub fn is_address_already_in_use(err: &ComputeError) -> bool {
    let message = err.http_message().unwrap_or_default();
    (err.is_http_code(400) && message.contains(ADDRESS_IN_USE_MESSAGE_EXTERNAL))
        || (err.is_http_code(409) && message.contains(ADDRESS_IN_USE_MESSAGE_INTERNAL))
}

/// CRUD and filtered listing of forwarding rules for one version and scope.
#[derive(Clone)]
pub struct RuleStore {
    api: Arc<dyn ForwardingRuleApi>,
    region: String,
    call_timeout: Duration,
}

impl RuleStore {
    pub fn new(
        surfaces: &ForwardingRuleSurfaces,
        version: ApiVersion,
        scope: KeyScope,
        region: impl Into<String>,
        call_timeout: Duration,
    ) -> StoreResult<Self> {
        Ok(Self {
            api: surfaces.select(version, scope)?,
            region: region.into(),
            call_timeout,
        })
    }

    pub fn version(&self) -> ApiVersion {
        self.api.version()
    }

    pub fn scope(&self) -> KeyScope {
        self.api.scope()
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    fn key(&self, name: &str) -> ResourceKey {
        match self.scope() {
            KeyScope::Regional => ResourceKey::regional(name, &self.region),
            KeyScope::Global => ResourceKey::global(name),
        }
    }

    async fn bounded<T, F>(&self, operation: &str, call: F) -> Result<T, ComputeError>
    where
        F: Future<Output = Result<T, ComputeError>>,
    {
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ComputeError::timeout(operation, self.call_timeout)),
        }
    }

    fn normalize(&self, value: Value) -> StoreResult<ForwardingRule> {
        let name = value
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let mut rule: ForwardingRule =
            serde_json::from_value(value).map_err(|e| StoreError::Normalize {
                name,
                message: e.to_string(),
            })?;
        rule.version = self.version();
        rule.scope = self.scope();
        Ok(rule)
    }

    fn encode(rule: &ForwardingRule) -> StoreResult<Value> {
        serde_json::to_value(rule).map_err(|e| StoreError::Normalize {
            name: rule.name.clone(),
            message: e.to_string(),
        })
    }

    fn translate(rule: &ForwardingRule, err: ComputeError) -> StoreError {
        if is_address_already_in_use(&err) {
            return StoreError::IpConfiguration {
                address: rule.ip_address.clone(),
                message: err.http_message().unwrap_or_default().to_string(),
            };
        }
        StoreError::Compute(err)
    }

    /// Fetches a rule by name. A missing rule is `Ok(None)`.
    pub async fn get(&self, name: &str) -> StoreResult<Option<ForwardingRule>> {
        let key = self.key(name);
        match self.bounded("get forwarding rule", self.api.get(&key)).await {
            Ok(value) => self.normalize(value).map(Some),
            Err(e) if e.is_not_found() => {
                debug!(name = %name, "Forwarding rule does not exist");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn create(&self, rule: &ForwardingRule) -> StoreResult<()> {
        let key = self.key(&rule.name);
        let body = Self::encode(rule)?;
        info!(
            name = %rule.name,
            version = %self.version(),
            scope = %self.scope(),
            "Creating forwarding rule {}",
            rule
        );
        self.bounded("create forwarding rule", self.api.insert(&key, body))
            .await
            .map_err(|e| Self::translate(rule, e))
    }

    /// Patches a rule in place. `allowGlobalAccess` is always sent, even
    /// when false.
    pub async fn patch(&self, rule: &ForwardingRule) -> StoreResult<()> {
        let key = self.key(&rule.name);
        let mut body = Self::encode(rule)?;
        if let Value::Object(fields) = &mut body {
            fields.insert(
                "allowGlobalAccess".to_string(),
                Value::Bool(rule.allow_global_access),
            );
        }
        info!(
            name = %rule.name,
            allow_global_access = rule.allow_global_access,
            network_tier = %rule.network_tier,
            "Patching forwarding rule"
        );
        self.bounded("patch forwarding rule", self.api.patch(&key, body))
            .await
            .map_err(|e| Self::translate(rule, e))
    }

    /// Deletes a rule by name. Deleting a missing rule succeeds.
    pub async fn delete(&self, name: &str) -> StoreResult<()> {
        let key = self.key(name);
        info!(name = %name, "Deleting forwarding rule");
        match self.bounded("delete forwarding rule", self.api.delete(&key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                debug!(name = %name, "Forwarding rule already deleted");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Lists the rules matching `filter` in the store's region or globally.
    pub async fn list(&self, filter: &Filter) -> StoreResult<Vec<ForwardingRule>> {
        let region = match self.scope() {
            KeyScope::Regional => Some(self.region.as_str()),
            KeyScope::Global => None,
        };
        debug!(filter = %filter, region = ?region, "Listing forwarding rules");
        let values = self
            .bounded("list forwarding rules", self.api.list(region, filter))
            .await?;
        values.into_iter().map(|v| self.normalize(v)).collect()
    }
}

impl std::fmt::Debug for RuleStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleStore")
            .field("version", &self.version())
            .field("scope", &self.scope())
            .field("region", &self.region)
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::{IpProtocol, NetworkTier};
    use lb_compute::fake::{FakeCompute, FakeOp};
    use lb_compute::{BACKEND_SERVICE_FIELD, NAME_FIELD};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const REGION: &str = "us-central1";

    fn store(fake: &FakeCompute, version: ApiVersion) -> RuleStore {
        RuleStore::new(
            &fake.forwarding_rule_surfaces(),
            version,
            KeyScope::Regional,
            REGION,
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn rule(name: &str, ports: &[&str]) -> ForwardingRule {
        ForwardingRule {
            name: name.to_string(),
            ip_address: "10.0.0.5".to_string(),
            ip_protocol: IpProtocol::Tcp,
            ports: ports.iter().map(|p| p.to_string()).collect(),
            backend_service: "projects/p/regions/us-central1/backendServices/bs1".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_get_missing_is_none() {
        let fake = FakeCompute::new("p");
        assert_eq!(store(&fake, ApiVersion::Ga).get("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_create_get_tags_version() {
        let fake = FakeCompute::new("p");
        let store = store(&fake, ApiVersion::Beta);
        store.create(&rule("fr-1", &["80"])).await.unwrap();

        let got = store.get("fr-1").await.unwrap().unwrap();
        assert_eq!(got.version, ApiVersion::Beta);
        assert_eq!(got.scope, KeyScope::Regional);
        assert_eq!(got.ports, vec!["80"]);
        assert!(got.id > 0);
        assert!(!got.self_link.is_empty());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let fake = FakeCompute::new("p");
        let store = store(&fake, ApiVersion::Ga);
        store.create(&rule("fr-1", &["80"])).await.unwrap();
        store.delete("fr-1").await.unwrap();
        store.delete("fr-1").await.unwrap();
        assert!(fake.rule(Some(REGION), "fr-1").is_none());
    }

    #[tokio::test]
    async fn test_patch_force_sends_global_access() {
        let fake = FakeCompute::new("p");
        fake.seed_rule(
            Some(REGION),
            json!({"name": "fr-1", "IPProtocol": "TCP", "ports": ["80"], "allowGlobalAccess": true}),
        );
        let store = store(&fake, ApiVersion::Ga);
        let patch = ForwardingRule {
            name: "fr-1".to_string(),
            network_tier: NetworkTier::Standard,
            ..Default::default()
        };
        store.patch(&patch).await.unwrap();

        let got = store.get("fr-1").await.unwrap().unwrap();
        assert!(!got.allow_global_access);
        assert_eq!(got.network_tier, NetworkTier::Standard);
        assert_eq!(got.ports, vec!["80"]);
    }

    #[tokio::test]
    async fn test_address_in_use_translation() {
        let fake = FakeCompute::new("p");
        let store = store(&fake, ApiVersion::Ga);

        fake.inject_error(
            FakeOp::Insert,
            None,
            ComputeError::http(400, ADDRESS_IN_USE_MESSAGE_EXTERNAL),
        );
        let err = store.create(&rule("fr-1", &["80"])).await.unwrap_err();
        assert!(
            matches!(&err, StoreError::IpConfiguration { address, .. } if address == "10.0.0.5"),
            "{:?}",
            err
        );

        fake.inject_error(
            FakeOp::Insert,
            None,
            ComputeError::http(409, format!("The resource is {}", ADDRESS_IN_USE_MESSAGE_INTERNAL)),
        );
        let err = store.create(&rule("fr-1", &["80"])).await.unwrap_err();
        assert!(matches!(err, StoreError::IpConfiguration { .. }));

        // A 409 for a duplicate name is not an address problem.
        store.create(&rule("fr-1", &["80"])).await.unwrap();
        let err = store.create(&rule("fr-1", &["80"])).await.unwrap_err();
        assert!(matches!(err, StoreError::Compute(ref e) if e.is_http_code(409)));
    }

    #[tokio::test]
    async fn test_errors_pass_through() {
        let fake = FakeCompute::new("p");
        let store = store(&fake, ApiVersion::Ga);
        fake.inject_error(FakeOp::Get, None, ComputeError::http(503, "backend error"));
        let err = store.get("fr-1").await.unwrap_err();
        assert!(matches!(err, StoreError::Compute(ref e) if e.is_retryable()));

        fake.inject_error(FakeOp::Delete, None, ComputeError::http(500, "boom"));
        assert!(store.delete("fr-1").await.is_err());
    }

    #[tokio::test]
    async fn test_call_timeout() {
        let fake = FakeCompute::new("p");
        fake.set_delay(FakeOp::Get, Duration::from_millis(200));
        let store = RuleStore::new(
            &fake.forwarding_rule_surfaces(),
            ApiVersion::Ga,
            KeyScope::Regional,
            REGION,
            Duration::from_millis(10),
        )
        .unwrap();
        let err = store.get("fr-1").await.unwrap_err();
        assert!(err.is_timeout(), "{:?}", err);
    }

    #[tokio::test]
    async fn test_list_with_filters() {
        let fake = FakeCompute::new("p");
        let store = store(&fake, ApiVersion::Ga);
        let mut other = rule("other-1", &["53"]);
        other.backend_service = "projects/p/regions/us-central1/backendServices/bs2".to_string();
        for r in [rule("fr-1", &["80"]), rule("fr-2", &["81"]), other] {
            store.create(&r).await.unwrap();
        }

        let by_backend = Filter::regexp(BACKEND_SERVICE_FIELD, ".*/backendServices/bs1")
            .unwrap();
        let mut names: Vec<String> = store
            .list(&by_backend)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["fr-1", "fr-2"]);

        let by_name = by_backend.and_regexp(NAME_FIELD, "fr-2").unwrap();
        let listed = store.list(&by_name).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].version, ApiVersion::Ga);
    }

    #[tokio::test]
    async fn test_global_scope_uses_global_keys() {
        let fake = FakeCompute::new("p");
        let store = RuleStore::new(
            &fake.forwarding_rule_surfaces(),
            ApiVersion::Alpha,
            KeyScope::Global,
            REGION,
            Duration::from_secs(5),
        )
        .unwrap();
        store.create(&rule("fr-g", &["80"])).await.unwrap();
        assert!(fake.rule(None, "fr-g").is_some());
        assert!(fake.rule(Some(REGION), "fr-g").is_none());
        assert_eq!(store.list(&Filter::none()).await.unwrap().len(), 1);
    }

    #[test]
    fn test_unsupported_surface() {
        let surfaces = ForwardingRuleSurfaces::new();
        let err = RuleStore::new(
            &surfaces,
            ApiVersion::Ga,
            KeyScope::Regional,
            REGION,
            Duration::from_secs(1),
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::Compute(ComputeError::Unsupported { .. })));
    }
}
