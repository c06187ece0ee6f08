//! ForwardingRuleOrch implementation.
//!
//! One ensure call runs a strictly sequential series of compute calls for a
//! single Service. The orch keeps no state between calls apart from its
//! counters, so the same Service must not be ensured from two tasks at once.

use std::sync::Arc;

use tracing::{debug, error, info, instrument};

use crate::address::{ipv4_address_to_use, AddressHold, AddressManager, AddressRequest};
use crate::config::ForwardingConfig;
use crate::events::{emit, EventRecorder, EventType, TracingEventRecorder, REASON_SYNC_LOAD_BALANCER};
use crate::naming::{rule_protocol_for_backend, service_protocol, L4Namer, Namer, RuleNames};
use crate::ports::{service_port_range, service_port_strings};
use crate::rule::{
    classify, ForwardingRule, IpProtocol, IpVersion, LoadBalancingScheme, NetworkTier, RuleDiff,
    RuleStore, StoreError, MAX_DISCRETE_PORTS,
};
use crate::service::{Service, ServiceDescription};
use crate::sync::{
    EnsureError, HasSyncStatus, IpAddressType, ResourceKind, SyncError, SyncResult, SyncStatus,
};
use lb_compute::ForwardingRuleSurfaces;

/// Configuration for ForwardingRuleOrch.
#[derive(Debug, Clone, Default)]
pub struct ForwardingRuleOrchConfig {
    /// Discrete port forwarding feature flag.
    pub discrete_port_forwarding: bool,
    pub region: String,
    /// Network URL of internal rules.
    pub network: String,
    /// Subnetwork used by internal rules that do not ask for one.
    pub subnetwork: String,
}

impl From<&ForwardingConfig> for ForwardingRuleOrchConfig {
    fn from(config: &ForwardingConfig) -> Self {
        Self {
            discrete_port_forwarding: config.discrete_port_forwarding,
            region: config.region.clone(),
            network: config.network.clone(),
            subnetwork: config.subnetwork.clone(),
        }
    }
}

/// Statistics for ForwardingRuleOrch operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardingRuleOrchStats {
    pub rules_created: u64,
    pub rules_patched: u64,
    pub rules_recreated: u64,
    pub rules_deleted: u64,
    pub rules_unchanged: u64,
    pub l3_migrations: u64,
    pub sync_errors: u64,
}

/// Parameters of an internal (ILB) rule.
#[derive(Debug, Clone, Default)]
pub struct InternalRuleParams {
    pub backend_service_link: String,
    /// Subnetwork of the rule; empty means the configured default.
    pub subnetwork: String,
    pub allow_global_access: bool,
    /// Protocol of the backend service before this sync, if it existed.
    pub previous_backend_protocol: Option<String>,
}

/// Parameters of an external (NetLB) rule.
#[derive(Debug, Clone, Default)]
pub struct ExternalRuleParams {
    pub backend_service_link: String,
    /// Protocol of the backend service before this sync, if it existed.
    pub previous_backend_protocol: Option<String>,
}

/// A reconciled forwarding rule.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleSync {
    pub rule: ForwardingRule,
    pub status: SyncStatus,
    pub ip_managed: IpAddressType,
}

impl HasSyncStatus for RuleSync {
    fn sync_status(&self) -> SyncStatus {
        self.status
    }
}

/// ForwardingRuleOrch - reconciles the forwarding rules of L4 Services.
pub struct ForwardingRuleOrch {
    pub(super) config: ForwardingRuleOrchConfig,
    pub(super) store: RuleStore,
    pub(super) namer: Arc<dyn Namer>,
    pub(super) recorder: Arc<dyn EventRecorder>,
    pub(super) address_manager: Option<Arc<dyn AddressManager>>,
    pub(super) stats: ForwardingRuleOrchStats,
}

impl std::fmt::Debug for ForwardingRuleOrch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardingRuleOrch")
            .field("config", &self.config)
            .field("store", &self.store)
            .field("has_address_manager", &self.address_manager.is_some())
            .field("stats", &self.stats)
            .finish()
    }
}

impl ForwardingRuleOrch {
    pub fn new(config: ForwardingRuleOrchConfig, store: RuleStore, namer: Arc<dyn Namer>) -> Self {
        Self {
            config,
            store,
            namer,
            recorder: Arc::new(TracingEventRecorder),
            address_manager: None,
            stats: ForwardingRuleOrchStats::default(),
        }
    }

    /// Builds the orch, its store and namer from the file configuration.
    pub fn from_config(
        config: &ForwardingConfig,
        surfaces: &ForwardingRuleSurfaces,
    ) -> Result<Self, StoreError> {
        let store = RuleStore::new(
            surfaces,
            config.api_version,
            config.scope,
            &config.region,
            config.call_timeout(),
        )?;
        Ok(Self::new(
            config.into(),
            store,
            Arc::new(L4Namer::new(&config.cluster_uid)),
        ))
    }

    pub fn set_recorder(&mut self, recorder: Arc<dyn EventRecorder>) {
        self.recorder = recorder;
    }

    pub fn set_address_manager(&mut self, manager: Arc<dyn AddressManager>) {
        self.address_manager = Some(manager);
    }

    pub fn config(&self) -> &ForwardingRuleOrchConfig {
        &self.config
    }

    pub fn stats(&self) -> &ForwardingRuleOrchStats {
        &self.stats
    }

    pub fn store(&self) -> &RuleStore {
        &self.store
    }

    pub fn rule_names(&self, service: &Service) -> RuleNames {
        RuleNames::new(Arc::clone(&self.namer), service)
    }

    pub(super) fn event(&self, service: &Service, message: String) {
        emit(
            self.recorder.as_ref(),
            service,
            EventType::Normal,
            REASON_SYNC_LOAD_BALANCER,
            &message,
        );
    }

    pub(super) fn fail(&mut self, err: SyncError) -> SyncError {
        self.stats.sync_errors += 1;
        error!(resource = %err.resource, status = ?err.status, error = %err.error, "Forwarding rule sync failed");
        err
    }

    pub(super) fn description(
        &self,
        service: &Service,
        rule_name: &str,
        ip: &str,
    ) -> Result<String, EnsureError> {
        ServiceDescription::new(service, ip, self.store.version())
            .to_json()
            .map_err(|e| EnsureError::Description {
                name: rule_name.to_string(),
                message: e.to_string(),
            })
    }

    /// Finds the rule currently serving the Service.
    ///
    /// Rule names carry the protocol, so when the backend protocol changed
    /// the rule under the old protocol's name is the one to replace. If
    /// both names exist, the old rule is removed and the new one kept.
    pub(super) async fn lookup_existing(
        &mut self,
        service: &Service,
        names: &RuleNames,
        name: &str,
        protocol: &IpProtocol,
        previous_backend_protocol: Option<&str>,
    ) -> Result<Option<ForwardingRule>, EnsureError> {
        let current = self.store.get(name).await?;

        let Some(previous) = previous_backend_protocol else {
            return Ok(current);
        };
        let old_protocol = rule_protocol_for_backend(previous);
        if old_protocol == *protocol {
            return Ok(current);
        }
        let old_name = names.base(&old_protocol, &IpVersion::Ipv4);
        let Some(old) = self.store.get(&old_name).await? else {
            return Ok(current);
        };

        if current.is_some() {
            self.store.delete(&old_name).await?;
            self.stats.rules_deleted += 1;
            self.event(service, format!("ForwardingRule {} deleted", old_name));
            return Ok(current);
        }
        info!(old = %old_name, new = %name, "Backend protocol changed, replacing forwarding rule");
        Ok(Some(old))
    }

    /// Brings one rule to `desired`: keep it, patch it, or delete and
    /// re-create it, then read it back.
    pub(super) async fn apply_rule(
        &mut self,
        service: &Service,
        existing: Option<&ForwardingRule>,
        desired: &ForwardingRule,
    ) -> SyncResult<(ForwardingRule, SyncStatus)> {
        let discrete = self.config.discrete_port_forwarding;

        match existing {
            Some(existing) => {
                let diff = if existing.name != desired.name {
                    RuleDiff::Recreate
                } else {
                    classify(existing, desired, discrete)
                        .map_err(|e| EnsureError::from(e).resync(ResourceKind::ForwardingRule))?
                };
                match diff {
                    RuleDiff::Equal => {
                        debug!(name = %existing.name, "Skipping update of unchanged forwarding rule");
                        self.stats.rules_unchanged += 1;
                        return Ok((existing.clone(), SyncStatus::ResourceResync));
                    }
                    RuleDiff::Patchable(patch) => {
                        debug!(existing = %existing, desired = %desired, "Forwarding rule changed, patching");
                        self.store
                            .patch(&patch)
                            .await
                            .map_err(|e| EnsureError::from(e).update(ResourceKind::ForwardingRule))?;
                        self.stats.rules_patched += 1;
                        self.event(service, format!("ForwardingRule {} patched", existing.name));
                    }
                    RuleDiff::Recreate => {
                        debug!(existing = %existing, desired = %desired, "Forwarding rule changed, re-creating");
                        self.recreate(service, existing, desired)
                            .await
                            .map_err(|e| e.update(ResourceKind::ForwardingRule))?;
                    }
                }
            }
            None => {
                self.store
                    .create(desired)
                    .await
                    .map_err(|e| EnsureError::from(e).update(ResourceKind::ForwardingRule))?;
                self.stats.rules_created += 1;
                self.event(service, format!("ForwardingRule {} created", desired.name));
            }
        }

        let read = self
            .store
            .get(&desired.name)
            .await
            .map_err(|e| EnsureError::from(e).update(ResourceKind::ForwardingRule))?
            .ok_or_else(|| {
                EnsureError::rule_not_found(&desired.name).update(ResourceKind::ForwardingRule)
            })?;
        Ok((read, SyncStatus::ResourceUpdate))
    }

    /// Deletes `existing` before creating `desired`; both may share a name.
    async fn recreate(
        &mut self,
        service: &Service,
        existing: &ForwardingRule,
        desired: &ForwardingRule,
    ) -> Result<(), EnsureError> {
        self.store.delete(&existing.name).await?;
        self.stats.rules_deleted += 1;
        self.event(service, format!("ForwardingRule {} deleted", existing.name));

        self.store.create(desired).await?;
        self.stats.rules_recreated += 1;
        self.event(service, format!("ForwardingRule {} re-created", desired.name));
        Ok(())
    }

    /// Deletes existing rules whose tier differs from `tier` and asks the
    /// address manager to drop a mismatched reservation. Rule deletion
    /// failures are logged only; the tier check reports them later.
    pub(super) async fn tear_down_wrong_tier(
        &mut self,
        existing: &mut Vec<ForwardingRule>,
        tier: &NetworkTier,
        manager: &Arc<dyn AddressManager>,
        request: &AddressRequest,
    ) -> Result<(), EnsureError> {
        let mut kept = Vec::with_capacity(existing.len());
        for rule in existing.drain(..) {
            if rule.network_tier == *tier {
                kept.push(rule);
                continue;
            }
            info!(name = %rule.name, existing = %rule.network_tier, wanted = %tier, "Deleting forwarding rule with wrong network tier");
            match self.store.delete(&rule.name).await {
                Ok(()) => self.stats.rules_deleted += 1,
                Err(e) => {
                    error!(name = %rule.name, error = %e, "Failed to delete forwarding rule with wrong network tier");
                    kept.push(rule);
                }
            }
        }
        *existing = kept;
        manager.tear_down_address_if_tier_mismatch(request).await?;
        Ok(())
    }

    /// Tier teardown and address hold shared by external rules.
    pub(super) async fn hold_external_address(
        &mut self,
        service: &Service,
        name: &str,
        ip: String,
        existing: &mut Vec<ForwardingRule>,
    ) -> SyncResult<Option<AddressHold>> {
        let Some(manager) = self.address_manager.clone() else {
            return Ok(None);
        };
        let (tier, from_annotation) = service.network_tier();
        let request = AddressRequest {
            service: service.key(),
            region: self.config.region.clone(),
            subnetwork: String::new(),
            name: name.to_string(),
            requested_ip: ip,
            scheme: LoadBalancingScheme::External,
            network_tier: tier.clone(),
            ip_version: IpVersion::Ipv4,
        };
        if from_annotation {
            self.tear_down_wrong_tier(existing, &tier, &manager, &request)
                .await
                .map_err(|e| e.resync(ResourceKind::Address))?;
        }
        let hold = AddressHold::acquire(manager, request)
            .await
            .map_err(|e| EnsureError::from(e).resync(ResourceKind::Address))?;
        Ok(Some(hold))
    }

    /// Ensures the internal (ILB) IPv4 rule of the Service.
    #[instrument(skip(self, service, params), fields(service = %service))]
    pub async fn ensure_internal(
        &mut self,
        service: &Service,
        params: &InternalRuleParams,
    ) -> SyncResult<RuleSync> {
        let result = self.ensure_internal_inner(service, params).await;
        result.map_err(|e| self.fail(e))
    }

    async fn ensure_internal_inner(
        &mut self,
        service: &Service,
        params: &InternalRuleParams,
    ) -> SyncResult<RuleSync> {
        let names = self.rule_names(service);
        let protocol = service_protocol(&service.ports);
        let name = names.base(&protocol, &IpVersion::Ipv4);
        info!(name = %name, backend = %params.backend_service_link, "Ensuring internal forwarding rule");

        let existing = self
            .lookup_existing(
                service,
                &names,
                &name,
                &protocol,
                params.previous_backend_protocol.as_deref(),
            )
            .await
            .map_err(|e| e.resync(ResourceKind::ForwardingRule))?;

        let subnetwork = if params.subnetwork.is_empty() {
            self.config.subnetwork.clone()
        } else {
            params.subnetwork.clone()
        };
        let mut ip = ipv4_address_to_use(
            service,
            existing.as_ref(),
            &subnetwork,
            self.recorder.as_ref(),
        );

        let hold = match self.address_manager.clone() {
            Some(manager) => {
                let request = AddressRequest {
                    service: service.key(),
                    region: self.config.region.clone(),
                    subnetwork: subnetwork.clone(),
                    name: name.clone(),
                    requested_ip: ip.clone(),
                    scheme: LoadBalancingScheme::Internal,
                    network_tier: NetworkTier::default_tier(),
                    ip_version: IpVersion::Ipv4,
                };
                let hold = AddressHold::acquire(manager, request)
                    .await
                    .map_err(|e| EnsureError::from(e).resync(ResourceKind::Address))?;
                ip = hold.address().to_string();
                Some(hold)
            }
            None => None,
        };
        let ip_managed = hold.as_ref().map(AddressHold::ip_type).unwrap_or_default();

        let result = self
            .ensure_internal_rule(service, params, existing, &name, &protocol, &subnetwork, &ip)
            .await;
        if let Some(hold) = hold {
            hold.release().await;
        }
        let (rule, status) = result?;
        Ok(RuleSync {
            rule,
            status,
            ip_managed,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn ensure_internal_rule(
        &mut self,
        service: &Service,
        params: &InternalRuleParams,
        existing: Option<ForwardingRule>,
        name: &str,
        protocol: &IpProtocol,
        subnetwork: &str,
        ip: &str,
    ) -> SyncResult<(ForwardingRule, SyncStatus)> {
        let description = self
            .description(service, name, ip)
            .map_err(|e| e.resync(ResourceKind::ForwardingRule))?;
        let mut desired = ForwardingRule {
            name: name.to_string(),
            ip_address: ip.to_string(),
            ip_protocol: protocol.clone(),
            ports: service_port_strings(&service.ports),
            load_balancing_scheme: LoadBalancingScheme::Internal,
            backend_service: params.backend_service_link.clone(),
            network: self.config.network.clone(),
            subnetwork: subnetwork.to_string(),
            network_tier: NetworkTier::default_tier(),
            allow_global_access: params.allow_global_access,
            description,
            version: self.store.version(),
            scope: self.store.scope(),
            ..Default::default()
        };
        if desired.ports.len() > MAX_DISCRETE_PORTS {
            desired.ports.clear();
            desired.all_ports = true;
        }
        self.apply_rule(service, existing.as_ref(), &desired).await
    }

    /// Ensures the external (NetLB) IPv4 rule of the Service.
    #[instrument(skip(self, service, params), fields(service = %service))]
    pub async fn ensure_external(
        &mut self,
        service: &Service,
        params: &ExternalRuleParams,
    ) -> SyncResult<RuleSync> {
        let result = self.ensure_external_inner(service, params).await;
        result.map_err(|e| self.fail(e))
    }

    async fn ensure_external_inner(
        &mut self,
        service: &Service,
        params: &ExternalRuleParams,
    ) -> SyncResult<RuleSync> {
        let names = self.rule_names(service);
        let protocol = service_protocol(&service.ports);
        let name = names.base(&protocol, &IpVersion::Ipv4);
        info!(name = %name, backend = %params.backend_service_link, "Ensuring external forwarding rule");

        let existing = self
            .lookup_existing(
                service,
                &names,
                &name,
                &protocol,
                params.previous_backend_protocol.as_deref(),
            )
            .await
            .map_err(|e| e.resync(ResourceKind::ForwardingRule))?;
        let mut ip = ipv4_address_to_use(service, existing.as_ref(), "", self.recorder.as_ref());

        let mut existing: Vec<ForwardingRule> = existing.into_iter().collect();
        let hold = self
            .hold_external_address(service, &name, ip.clone(), &mut existing)
            .await?;
        if let Some(hold) = &hold {
            ip = hold.address().to_string();
        }
        let ip_managed = hold.as_ref().map(AddressHold::ip_type).unwrap_or_default();

        let result = self
            .ensure_external_rule(service, params, existing.pop(), &name, &protocol, &ip)
            .await;
        if let Some(hold) = hold {
            hold.release().await;
        }
        let (rule, status) = result?;
        Ok(RuleSync {
            rule,
            status,
            ip_managed,
        })
    }

    async fn ensure_external_rule(
        &mut self,
        service: &Service,
        params: &ExternalRuleParams,
        existing: Option<ForwardingRule>,
        name: &str,
        protocol: &IpProtocol,
        ip: &str,
    ) -> SyncResult<(ForwardingRule, SyncStatus)> {
        let (tier, _) = service.network_tier();
        let description = self
            .description(service, name, ip)
            .map_err(|e| e.resync(ResourceKind::ForwardingRule))?;
        let ports = service_port_strings(&service.ports);

        let mut desired = ForwardingRule {
            name: name.to_string(),
            description,
            ip_address: ip.to_string(),
            ip_protocol: protocol.clone(),
            port_range: service_port_range(&service.ports),
            load_balancing_scheme: LoadBalancingScheme::External,
            backend_service: params.backend_service_link.clone(),
            network_tier: tier,
            version: self.store.version(),
            scope: self.store.scope(),
            ..Default::default()
        };
        if self.config.discrete_port_forwarding && ports.len() <= MAX_DISCRETE_PORTS {
            desired.ports = ports;
            desired.port_range.clear();
        }

        if let Some(existing) = &existing {
            check_network_tier(existing, &desired)?;
        }
        self.apply_rule(service, existing.as_ref(), &desired).await
    }

    /// Deletes the TCP, UDP, L3 and temporary L3 IPv4 rules of the Service.
    /// Missing rules are fine; every name is tried even if one fails.
    #[instrument(skip(self, service), fields(service = %service))]
    pub async fn delete_all_ipv4_rules(&mut self, service: &Service) -> Result<(), EnsureError> {
        let names = self.rule_names(service);
        let mut to_delete: Vec<String> = [IpProtocol::Tcp, IpProtocol::Udp, IpProtocol::L3Default]
            .iter()
            .map(|p| names.base(p, &IpVersion::Ipv4))
            .collect();
        to_delete.push(names.l3_temporary());

        let mut errors = Vec::new();
        for name in to_delete {
            match self.store.delete(&name).await {
                Ok(()) => self.stats.rules_deleted += 1,
                Err(e) => {
                    error!(name = %name, error = %e, "Failed to delete forwarding rule");
                    errors.push(EnsureError::from(e));
                }
            }
        }
        match EnsureError::from_many(errors) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// External rules never change tier in place; the address has to move
/// tiers too.
pub(super) fn check_network_tier(
    existing: &ForwardingRule,
    desired: &ForwardingRule,
) -> SyncResult<()> {
    if existing.network_tier != desired.network_tier {
        return Err(EnsureError::tier_mismatch(
            format!("Forwarding rule ({})", existing.name),
            existing.network_tier.clone(),
            desired.network_tier.clone(),
        )
        .update(ResourceKind::ForwardingRule));
    }
    Ok(())
}
