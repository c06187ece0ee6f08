//! In-memory compute backend.
//!
//! [`FakeCompute`] keeps forwarding rules in a shared map and serves every
//! `(version, scope)` surface from it, like the real API where the alpha,
//! beta and GA endpoints are views over the same resources. Every call is
//! recorded so tests can assert on the exact mutations a reconciliation
//! issued, and errors or delays can be injected per operation.

use crate::api::{ForwardingRuleApi, ForwardingRuleSurfaces};
use crate::error::{ComputeError, ComputeResult};
use crate::filter::Filter;
use crate::types::{ApiVersion, KeyScope, Location, ResourceId, ResourceKey};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

/// Ceiling the fake enforces on discrete ports per rule.
const MAX_PORTS_PER_RULE: usize = 5;

/// Operation kinds recorded by the fake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeOp {
    Get,
    Insert,
    Patch,
    Delete,
    List,
}

impl FakeOp {
    pub fn is_mutation(&self) -> bool {
        matches!(self, FakeOp::Insert | FakeOp::Patch | FakeOp::Delete)
    }
}

/// One recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeCall {
    pub op: FakeOp,
    pub version: ApiVersion,
    pub scope: KeyScope,
    pub name: Option<String>,
}

#[derive(Debug)]
struct Injection {
    op: FakeOp,
    name: Option<String>,
    error: ComputeError,
}

#[derive(Debug, Default)]
struct FakeState {
    rules: BTreeMap<(Option<String>, String), Value>,
    next_id: u64,
    next_address: u32,
    calls: Vec<FakeCall>,
    injections: Vec<Injection>,
    delays: HashMap<FakeOp, Duration>,
}

impl FakeState {
    /// Next ephemeral address, handed out like the provider does for rules
    /// inserted without one.
    fn ephemeral_address(&mut self) -> String {
        let host = self.next_address % 254 + 1;
        self.next_address += 1;
        format!("192.0.2.{}", host)
    }

    /// Pops the first injected error matching the call.
    fn take_injection(&mut self, op: FakeOp, name: Option<&str>) -> Option<ComputeError> {
        let idx = self.injections.iter().position(|inj| {
            inj.op == op
                && match (&inj.name, name) {
                    (None, _) => true,
                    (Some(want), Some(got)) => want == got,
                    (Some(_), None) => false,
                }
        })?;
        Some(self.injections.remove(idx).error)
    }
}

/// Shared in-memory compute backend.
#[derive(Debug, Clone)]
pub struct FakeCompute {
    project: String,
    state: Arc<Mutex<FakeState>>,
}

impl FakeCompute {
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            state: Arc::new(Mutex::new(FakeState {
                next_id: 1000,
                ..FakeState::default()
            })),
        }
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Strategy table with all six forwarding rule surfaces.
    pub fn forwarding_rule_surfaces(&self) -> ForwardingRuleSurfaces {
        let mut surfaces = ForwardingRuleSurfaces::new();
        for version in ApiVersion::ALL {
            for scope in KeyScope::ALL {
                surfaces.register(Arc::new(FakeForwardingRules {
                    version,
                    scope,
                    project: self.project.clone(),
                    state: Arc::clone(&self.state),
                }));
            }
        }
        surfaces
    }

    /// Stores a rule directly, bypassing call recording and validation.
    pub fn seed_rule(&self, region: Option<&str>, rule: Value) {
        let name = rule
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let mut state = self.state();
        let rule = decorate(&self.project, region, &name, rule, &mut state.next_id);
        state.rules.insert((region.map(str::to_string), name), rule);
    }

    /// Returns the stored rule, if any.
    pub fn rule(&self, region: Option<&str>, name: &str) -> Option<Value> {
        self.state()
            .rules
            .get(&(region.map(str::to_string), name.to_string()))
            .cloned()
    }

    /// Names of all stored rules in the region (or global).
    pub fn rule_names(&self, region: Option<&str>) -> Vec<String> {
        let region = region.map(str::to_string);
        self.state()
            .rules
            .keys()
            .filter(|(r, _)| *r == region)
            .map(|(_, name)| name.clone())
            .collect()
    }

    /// Queues an error returned by the next matching call. `name` of `None`
    /// matches any resource.
    pub fn inject_error(&self, op: FakeOp, name: Option<&str>, error: ComputeError) {
        self.state().injections.push(Injection {
            op,
            name: name.map(str::to_string),
            error,
        });
    }

    /// Makes every call of the given kind sleep before completing.
    pub fn set_delay(&self, op: FakeOp, delay: Duration) {
        self.state().delays.insert(op, delay);
    }

    pub fn calls(&self) -> Vec<FakeCall> {
        self.state().calls.clone()
    }

    /// Recorded insert/patch/delete calls.
    pub fn mutations(&self) -> Vec<FakeCall> {
        self.state()
            .calls
            .iter()
            .filter(|c| c.op.is_mutation())
            .cloned()
            .collect()
    }

    pub fn mutation_count(&self) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| c.op.is_mutation())
            .count()
    }

    pub fn count(&self, op: FakeOp) -> usize {
        self.state().calls.iter().filter(|c| c.op == op).count()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }
}

/// Adds the server-assigned fields to a stored rule.
fn decorate(
    project: &str,
    region: Option<&str>,
    name: &str,
    mut rule: Value,
    next_id: &mut u64,
) -> Value {
    let location = match region {
        Some(r) => Location::Region(r.to_string()),
        None => Location::Global,
    };
    let id = ResourceId {
        project: project.to_string(),
        resource: "forwardingRules".to_string(),
        location,
        name: name.to_string(),
    };
    if let Value::Object(obj) = &mut rule {
        if !obj.contains_key("id") {
            *next_id += 1;
            obj.insert("id".to_string(), Value::String(next_id.to_string()));
        }
        obj.insert(
            "selfLink".to_string(),
            Value::String(id.self_link(ApiVersion::Ga)),
        );
        if let Some(r) = region {
            obj.insert(
                "region".to_string(),
                Value::String(format!(
                    "https://www.googleapis.com/compute/v1/projects/{}/regions/{}",
                    project, r
                )),
            );
        }
    }
    rule
}

/// Rejects rule shapes the real API refuses.
fn validate_rule(name: &str, rule: &Map<String, Value>) -> ComputeResult<()> {
    let ports = rule
        .get("ports")
        .and_then(Value::as_array)
        .map(Vec::len)
        .unwrap_or(0);
    let has_range = rule
        .get("portRange")
        .and_then(Value::as_str)
        .is_some_and(|r| !r.is_empty());
    let all_ports = rule
        .get("allPorts")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    if ports > MAX_PORTS_PER_RULE {
        return Err(ComputeError::http(
            400,
            format!(
                "Invalid value for field 'resource.ports': forwarding rule {} has {} ports, at most {} allowed",
                name, ports, MAX_PORTS_PER_RULE
            ),
        ));
    }
    let specs = [ports > 0, has_range, all_ports]
        .iter()
        .filter(|set| **set)
        .count();
    if specs > 1 {
        return Err(ComputeError::http(
            400,
            format!(
                "Invalid value for forwarding rule {}: only one of ports, portRange and allPorts may be set",
                name
            ),
        ));
    }
    Ok(())
}

struct FakeForwardingRules {
    version: ApiVersion,
    scope: KeyScope,
    project: String,
    state: Arc<Mutex<FakeState>>,
}

impl FakeForwardingRules {
    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records the call and returns the delay and any injected error.
    fn begin(&self, op: FakeOp, name: Option<&str>) -> (Option<Duration>, Option<ComputeError>) {
        let mut state = self.state();
        state.calls.push(FakeCall {
            op,
            version: self.version,
            scope: self.scope,
            name: name.map(str::to_string),
        });
        let delay = state.delays.get(&op).copied();
        (delay, state.take_injection(op, name))
    }

    async fn enter(&self, op: FakeOp, name: Option<&str>) -> ComputeResult<()> {
        let (delay, injected) = self.begin(op, name);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match injected {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn map_key(key: &ResourceKey) -> (Option<String>, String) {
        (key.region.clone(), key.name.clone())
    }
}

#[async_trait]
impl ForwardingRuleApi for FakeForwardingRules {
    fn version(&self) -> ApiVersion {
        self.version
    }

    fn scope(&self) -> KeyScope {
        self.scope
    }

    async fn get(&self, key: &ResourceKey) -> ComputeResult<Value> {
        self.enter(FakeOp::Get, Some(&key.name)).await?;
        key.validate(self.scope)?;
        self.state()
            .rules
            .get(&Self::map_key(key))
            .cloned()
            .ok_or_else(|| ComputeError::not_found(&key.name))
    }

    async fn insert(&self, key: &ResourceKey, rule: Value) -> ComputeResult<()> {
        self.enter(FakeOp::Insert, Some(&key.name)).await?;
        key.validate(self.scope)?;
        let mut obj = match rule {
            Value::Object(obj) => obj,
            other => {
                return Err(ComputeError::http(
                    400,
                    format!("Invalid forwarding rule body: {}", other),
                ))
            }
        };
        validate_rule(&key.name, &obj)?;
        obj.insert("name".to_string(), Value::String(key.name.clone()));
        obj.remove("id");

        let mut state = self.state();
        let map_key = Self::map_key(key);
        if state.rules.contains_key(&map_key) {
            return Err(ComputeError::already_exists(&key.name));
        }
        let has_address = obj
            .get("IPAddress")
            .and_then(Value::as_str)
            .is_some_and(|ip| !ip.is_empty());
        if !has_address {
            obj.insert(
                "IPAddress".to_string(),
                Value::String(state.ephemeral_address()),
            );
        }
        let stored = decorate(
            &self.project,
            key.region.as_deref(),
            &key.name,
            Value::Object(obj),
            &mut state.next_id,
        );
        state.rules.insert(map_key, stored);
        debug!(name = %key.name, version = %self.version, "fake: inserted forwarding rule");
        Ok(())
    }

    async fn patch(&self, key: &ResourceKey, rule: Value) -> ComputeResult<()> {
        self.enter(FakeOp::Patch, Some(&key.name)).await?;
        key.validate(self.scope)?;
        let fields = match rule {
            Value::Object(obj) => obj,
            other => {
                return Err(ComputeError::http(
                    400,
                    format!("Invalid forwarding rule patch: {}", other),
                ))
            }
        };

        let mut state = self.state();
        let existing = state
            .rules
            .get_mut(&Self::map_key(key))
            .ok_or_else(|| ComputeError::not_found(&key.name))?;
        if let Value::Object(existing) = existing {
            for (field, value) in fields {
                if field == "id" || field == "name" {
                    continue;
                }
                existing.insert(field, value);
            }
            validate_rule(&key.name, existing)?;
        }
        debug!(name = %key.name, version = %self.version, "fake: patched forwarding rule");
        Ok(())
    }

    async fn delete(&self, key: &ResourceKey) -> ComputeResult<()> {
        self.enter(FakeOp::Delete, Some(&key.name)).await?;
        key.validate(self.scope)?;
        self.state()
            .rules
            .remove(&Self::map_key(key))
            .ok_or_else(|| ComputeError::not_found(&key.name))?;
        debug!(name = %key.name, version = %self.version, "fake: deleted forwarding rule");
        Ok(())
    }

    async fn list(&self, region: Option<&str>, filter: &Filter) -> ComputeResult<Vec<Value>> {
        self.enter(FakeOp::List, None).await?;
        let region = match (self.scope, region) {
            (KeyScope::Regional, Some(r)) => Some(r.to_string()),
            (KeyScope::Regional, None) => {
                return Err(ComputeError::invalid_key("regional list without region"))
            }
            (KeyScope::Global, _) => None,
        };
        Ok(self
            .state()
            .rules
            .iter()
            .filter(|((r, _), rule)| *r == region && filter.matches(rule))
            .map(|(_, rule)| rule.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const REGION: &str = "us-central1";

    fn regional(compute: &FakeCompute) -> Arc<dyn ForwardingRuleApi> {
        compute
            .forwarding_rule_surfaces()
            .select(ApiVersion::Ga, KeyScope::Regional)
            .unwrap()
    }

    #[tokio::test]
    async fn test_insert_get_delete() {
        let compute = FakeCompute::new("test");
        let api = regional(&compute);
        let key = ResourceKey::regional("fr-1", REGION);

        api.insert(&key, json!({"IPProtocol": "TCP", "ports": ["80"]}))
            .await
            .unwrap();
        let got = api.get(&key).await.unwrap();
        assert_eq!(got["name"], "fr-1");
        assert_eq!(got["IPProtocol"], "TCP");
        assert!(got["id"].as_str().is_some());
        assert!(got["selfLink"].as_str().unwrap().ends_with("/forwardingRules/fr-1"));

        api.delete(&key).await.unwrap();
        assert!(api.get(&key).await.unwrap_err().is_not_found());
        assert!(api.delete(&key).await.unwrap_err().is_not_found());
        assert_eq!(compute.mutation_count(), 3);
    }

    #[tokio::test]
    async fn test_insert_assigns_ephemeral_address() {
        let compute = FakeCompute::new("test");
        let api = regional(&compute);
        let first = ResourceKey::regional("fr-1", REGION);
        let second = ResourceKey::regional("fr-2", REGION);
        let fixed = ResourceKey::regional("fr-3", REGION);

        api.insert(&first, json!({})).await.unwrap();
        api.insert(&second, json!({"IPAddress": ""})).await.unwrap();
        api.insert(&fixed, json!({"IPAddress": "203.0.113.9"}))
            .await
            .unwrap();

        assert_eq!(api.get(&first).await.unwrap()["IPAddress"], "192.0.2.1");
        assert_eq!(api.get(&second).await.unwrap()["IPAddress"], "192.0.2.2");
        assert_eq!(api.get(&fixed).await.unwrap()["IPAddress"], "203.0.113.9");
    }

    #[tokio::test]
    async fn test_duplicate_insert_conflicts() {
        let compute = FakeCompute::new("test");
        let api = regional(&compute);
        let key = ResourceKey::regional("fr-1", REGION);
        api.insert(&key, json!({})).await.unwrap();
        let err = api.insert(&key, json!({})).await.unwrap_err();
        assert_eq!(err.http_code(), Some(409));
    }

    #[tokio::test]
    async fn test_versions_share_storage() {
        let compute = FakeCompute::new("test");
        let surfaces = compute.forwarding_rule_surfaces();
        assert_eq!(surfaces.len(), 6);
        let key = ResourceKey::regional("fr-1", REGION);
        surfaces
            .select(ApiVersion::Alpha, KeyScope::Regional)
            .unwrap()
            .insert(&key, json!({}))
            .await
            .unwrap();
        assert!(surfaces
            .select(ApiVersion::Ga, KeyScope::Regional)
            .unwrap()
            .get(&key)
            .await
            .is_ok());
        assert!(surfaces
            .select(ApiVersion::Ga, KeyScope::Global)
            .unwrap()
            .get(&ResourceKey::global("fr-1"))
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_rejects_invalid_shapes() {
        let compute = FakeCompute::new("test");
        let api = regional(&compute);
        let err = api
            .insert(
                &ResourceKey::regional("fr-1", REGION),
                json!({"ports": ["1", "2", "3", "4", "5", "6"]}),
            )
            .await
            .unwrap_err();
        assert_eq!(err.http_code(), Some(400));

        let err = api
            .insert(
                &ResourceKey::regional("fr-2", REGION),
                json!({"ports": ["1"], "portRange": "1-1"}),
            )
            .await
            .unwrap_err();
        assert_eq!(err.http_code(), Some(400));
        assert!(compute.rule_names(Some(REGION)).is_empty());
    }

    #[tokio::test]
    async fn test_patch_merges_fields() {
        let compute = FakeCompute::new("test");
        let api = regional(&compute);
        let key = ResourceKey::regional("fr-1", REGION);
        api.insert(&key, json!({"allowGlobalAccess": false, "networkTier": "PREMIUM"}))
            .await
            .unwrap();
        api.patch(&key, json!({"name": "ignored", "allowGlobalAccess": true}))
            .await
            .unwrap();
        let got = compute.rule(Some(REGION), "fr-1").unwrap();
        assert_eq!(got["allowGlobalAccess"], true);
        assert_eq!(got["networkTier"], "PREMIUM");
        assert_eq!(got["name"], "fr-1");

        let err = api
            .patch(&ResourceKey::regional("missing", REGION), json!({}))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_list_with_filter() {
        let compute = FakeCompute::new("test");
        compute.seed_rule(Some(REGION), json!({"name": "a", "backendService": "bs1"}));
        compute.seed_rule(Some(REGION), json!({"name": "b", "backendService": "bs2"}));
        compute.seed_rule(Some("europe-west1"), json!({"name": "c", "backendService": "bs1"}));

        let api = regional(&compute);
        let filter = Filter::equals("backendService", "bs1").unwrap();
        let got = api.list(Some(REGION), &filter).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0]["name"], "a");
        assert!(api.list(None, &filter).await.is_err());
    }

    #[tokio::test]
    async fn test_injected_error_is_one_shot() {
        let compute = FakeCompute::new("test");
        let api = regional(&compute);
        let key = ResourceKey::regional("fr-1", REGION);
        compute.inject_error(FakeOp::Insert, Some("fr-1"), ComputeError::http(503, "busy"));

        let err = api.insert(&key, json!({})).await.unwrap_err();
        assert_eq!(err.http_code(), Some(503));
        api.insert(&key, json!({})).await.unwrap();
        assert_eq!(compute.count(FakeOp::Insert), 2);
    }

    #[tokio::test]
    async fn test_key_scope_mismatch() {
        let compute = FakeCompute::new("test");
        let api = regional(&compute);
        let err = api.get(&ResourceKey::global("fr-1")).await.unwrap_err();
        assert!(matches!(err, ComputeError::InvalidKey { .. }));
    }
}
