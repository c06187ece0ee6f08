//! Rule-set reconciliation for external Services.
//!
//! With discrete port forwarding a Service may need several rules per
//! protocol. The set is found by its backend service, rebuilt through the
//! port pipeline, and every desired rule runs through the single-rule state
//! machine. Rules no longer needed are deleted last, so the ports they
//! carried are served by their replacements first.

use std::collections::BTreeSet;

use tracing::{debug, info, instrument, warn};

use super::orch::{check_network_tier, ForwardingRuleOrch};
use crate::address::{ipv4_address_to_use, AddressHold};
use crate::migration::{L3MigrationStrategy, L3Release};
use crate::naming::{service_protocol, RuleNames};
use crate::plan::desired_rule_shapes;
use crate::rule::{ForwardingRule, IpVersion, LoadBalancingScheme, StoreError};
use crate::service::Service;
use crate::sync::{EnsureError, HasSyncStatus, IpAddressType, ResourceKind, SyncResult, SyncStatus};
use lb_compute::{Filter, ResourceId, BACKEND_SERVICE_FIELD};

/// A reconciled rule set.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleSetSync {
    /// Rules serving the Service, as read back after the sync.
    pub rules: Vec<ForwardingRule>,
    pub status: SyncStatus,
    pub ip_managed: IpAddressType,
}

impl HasSyncStatus for RuleSetSync {
    fn sync_status(&self) -> SyncStatus {
        self.status
    }
}

/// Existing rules split into the permanent set and a temporary L3 rule.
struct Existing {
    rules: Vec<ForwardingRule>,
    temporary: Option<ForwardingRule>,
}

impl ForwardingRuleOrch {
    /// IPv4 rules pointing at the backend service, the temporary L3 rule
    /// included.
    pub async fn list_ipv4_rule_set(
        &self,
        backend_service_link: &str,
    ) -> Result<Vec<ForwardingRule>, EnsureError> {
        // Absolute and relative references both end with the relative path.
        let reference = ResourceId::parse(backend_service_link)
            .map(|id| id.relative_path())
            .unwrap_or_else(|_| backend_service_link.to_string());
        let filter = Filter::suffix(BACKEND_SERVICE_FIELD, &reference).map_err(StoreError::from)?;

        let rules = self.store.list(&filter).await?;
        Ok(rules
            .into_iter()
            .filter(|r| r.ip_version.or_ipv4() == IpVersion::Ipv4)
            .collect())
    }

    async fn load_existing(
        &self,
        names: &RuleNames,
        backend_service_link: &str,
    ) -> Result<Existing, EnsureError> {
        let temporary_name = names.l3_temporary();
        let (temporary, rules): (Vec<_>, Vec<_>) = self
            .list_ipv4_rule_set(backend_service_link)
            .await?
            .into_iter()
            .partition(|r| r.name == temporary_name);
        Ok(Existing {
            rules,
            temporary: temporary.into_iter().next(),
        })
    }

    /// Reconciles all IPv4 rules of an external Service.
    ///
    /// In discrete mode a range rule that has to be split is bracketed by a
    /// temporary all-ports L3 rule, deleted again once the set converged.
    /// On failure the temporary rule is kept; a later pass removes it.
    #[instrument(skip(self, service), fields(service = %service))]
    pub async fn ensure_ipv4_rule_set(
        &mut self,
        service: &Service,
        backend_service_link: &str,
    ) -> SyncResult<RuleSetSync> {
        let result = self.ensure_rule_set_inner(service, backend_service_link).await;
        result.map_err(|e| self.fail(e))
    }

    async fn ensure_rule_set_inner(
        &mut self,
        service: &Service,
        backend_service_link: &str,
    ) -> SyncResult<RuleSetSync> {
        let names = self.rule_names(service);
        let base_name = names.base(&service_protocol(&service.ports), &IpVersion::Ipv4);
        info!(backend = %backend_service_link, discrete = self.config.discrete_port_forwarding, "Ensuring forwarding rule set");

        let Existing {
            mut rules,
            temporary,
        } = self
            .load_existing(&names, backend_service_link)
            .await
            .map_err(|e| e.resync(ResourceKind::ForwardingRule))?;

        let current = rules.iter().find(|r| !r.ip_address.is_empty());
        let mut ip = ipv4_address_to_use(service, current, "", self.recorder.as_ref());

        let hold = self
            .hold_external_address(service, &base_name, ip.clone(), &mut rules)
            .await?;
        if let Some(hold) = &hold {
            ip = hold.address().to_string();
        }
        let ip_managed = hold.as_ref().map(AddressHold::ip_type).unwrap_or_default();

        let result = self
            .converge_rule_set(
                service,
                &names,
                backend_service_link,
                &base_name,
                &ip,
                rules,
                temporary,
            )
            .await;
        if let Some(hold) = hold {
            hold.release().await;
        }
        let (rules, status) = result?;
        Ok(RuleSetSync {
            rules,
            status,
            ip_managed,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn converge_rule_set(
        &mut self,
        service: &Service,
        names: &RuleNames,
        backend_service_link: &str,
        base_name: &str,
        ip: &str,
        existing: Vec<ForwardingRule>,
        temporary: Option<ForwardingRule>,
    ) -> SyncResult<(Vec<ForwardingRule>, SyncStatus)> {
        let (tier, _) = service.network_tier();
        let description = self
            .description(service, base_name, ip)
            .map_err(|e| e.resync(ResourceKind::ForwardingRule))?;
        let template = ForwardingRule {
            description,
            ip_address: ip.to_string(),
            load_balancing_scheme: LoadBalancingScheme::External,
            backend_service: backend_service_link.to_string(),
            network_tier: tier,
            version: self.store.version(),
            scope: self.store.scope(),
            ..Default::default()
        };
        for rule in &existing {
            check_network_tier(rule, &template)?;
        }

        let discrete = self.config.discrete_port_forwarding;
        let desired = self.desired_rules(service, names, &template, &existing)?;
        let mut status = SyncStatus::ResourceResync;

        let mut migration: Option<L3Release> = None;
        if discrete && temporary.is_none() {
            let strategy = L3MigrationStrategy::new(backend_service_link, service, &existing);
            if strategy.matches(&desired) {
                let release = strategy
                    .apply(&self.store, names)
                    .await
                    .map_err(|e| EnsureError::from(e).update(ResourceKind::ForwardingRule))?;
                self.stats.l3_migrations += 1;
                status = SyncStatus::ResourceUpdate;
                migration = Some(release);
            }
        }

        let result = self.apply_rule_set(service, desired, &existing).await;
        let rule_status = match result {
            Ok(s) => s,
            Err(e) => {
                if let Some(release) = migration {
                    warn!(name = %release.name(), "Keeping temporary L3 forwarding rule until the rule set converges");
                }
                return Err(e);
            }
        };
        status = status.merge(rule_status);

        if let Some(release) = migration {
            release
                .release()
                .await
                .map_err(|e| EnsureError::from(e).update(ResourceKind::ForwardingRule))?;
        } else if let Some(leaked) = temporary {
            info!(name = %leaked.name, "Deleting leftover temporary L3 forwarding rule");
            self.store
                .delete(&leaked.name)
                .await
                .map_err(|e| EnsureError::from(e).update(ResourceKind::ForwardingRule))?;
            status = SyncStatus::ResourceUpdate;
        }

        let temporary_name = names.l3_temporary();
        let rules = self
            .list_ipv4_rule_set(backend_service_link)
            .await
            .map_err(|e| e.update(ResourceKind::ForwardingRule))?
            .into_iter()
            .filter(|r| r.name != temporary_name)
            .collect();
        Ok((rules, status))
    }

    /// Full desired rules: the shapes from the port pipeline on top of
    /// `template`.
    fn desired_rules(
        &self,
        service: &Service,
        names: &RuleNames,
        template: &ForwardingRule,
        existing: &[ForwardingRule],
    ) -> SyncResult<Vec<ForwardingRule>> {
        let shapes = desired_rule_shapes(
            service,
            names,
            existing,
            self.config.discrete_port_forwarding,
        )
        .map_err(|e| EnsureError::from(e).resync(ResourceKind::ForwardingRule))?;

        let desired: Vec<ForwardingRule> = shapes
            .into_iter()
            .map(|shape| ForwardingRule {
                ip_protocol: shape.protocol(),
                name: shape.name,
                ports: shape.ports,
                port_range: shape.port_range,
                all_ports: shape.all_ports,
                ..template.clone()
            })
            .collect();
        debug!(desired = ?desired.iter().map(ToString::to_string).collect::<Vec<_>>(), "Computed desired forwarding rules");
        Ok(desired)
    }

    /// Applies each desired rule, then deletes the existing rules left over.
    ///
    /// Without an address to use, the first rule created gets an ephemeral
    /// one and every later rule of the set is sent with that address.
    async fn apply_rule_set(
        &mut self,
        service: &Service,
        desired: Vec<ForwardingRule>,
        existing: &[ForwardingRule],
    ) -> SyncResult<SyncStatus> {
        let keep: BTreeSet<String> = desired.iter().map(|r| r.name.clone()).collect();
        let mut ip = String::new();

        let mut status = SyncStatus::ResourceResync;
        for mut rule in desired {
            if rule.ip_address.is_empty() && !ip.is_empty() {
                rule.description = self
                    .description(service, &rule.name, &ip)
                    .map_err(|e| e.resync(ResourceKind::ForwardingRule))?;
                rule.ip_address = ip.clone();
            }
            let current = existing.iter().find(|r| r.name == rule.name);
            let (applied, rule_status) = self.apply_rule(service, current, &rule).await?;
            if ip.is_empty() && !applied.ip_address.is_empty() {
                debug!(name = %applied.name, ip = %applied.ip_address, "Using the address of the first rule for the rule set");
                ip = applied.ip_address;
            }
            status = status.merge(rule_status);
        }

        for stale in existing.iter().filter(|r| !keep.contains(r.name.as_str())) {
            info!(name = %stale.name, "Deleting forwarding rule no longer needed");
            self.store
                .delete(&stale.name)
                .await
                .map_err(|e| EnsureError::from(e).update(ResourceKind::ForwardingRule))?;
            self.stats.rules_deleted += 1;
            self.event(service, format!("ForwardingRule {} deleted", stale.name));
            status = SyncStatus::ResourceUpdate;
        }
        Ok(status)
    }
}
