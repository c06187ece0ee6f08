//! Temporary L3 rule bridging a move from a port range to discrete ports.
//!
//! A range rule for a protocol with more than [`MAX_DISCRETE_PORTS`] ports
//! has to be replaced by several discrete rules. The range rule must go
//! before its name can be reused, which would drop traffic for the ports
//! not yet covered. An all-ports `L3_DEFAULT` rule pointing at the same
//! backend keeps traffic flowing until the discrete rules exist.
//!
//! The temporary rule carries no address of its own. The provider accepts
//! it next to the Service's rules because it points at the same backend.

use crate::naming::RuleNames;
use crate::ports::port_counts;
use crate::rule::{
    equal_ports, ForwardingRule, IpProtocol, RuleStore, StoreResult, MAX_DISCRETE_PORTS,
};
use crate::service::Service;
use tracing::{info, warn};

pub struct L3MigrationStrategy<'a> {
    backend_service_link: &'a str,
    service: &'a Service,
    rules: &'a [ForwardingRule],
}

impl<'a> L3MigrationStrategy<'a> {
    pub fn new(
        backend_service_link: &'a str,
        service: &'a Service,
        rules: &'a [ForwardingRule],
    ) -> Self {
        Self {
            backend_service_link,
            service,
            rules,
        }
    }

    /// True if a range rule for a protocol that wants more ports than one
    /// discrete rule can carry is about to go away: `desired` either drops
    /// its name or gives it other ports. A range rule still covering the
    /// ports wanted under its name is kept and needs no bridge.
    pub fn matches(&self, desired: &[ForwardingRule]) -> bool {
        let counts = port_counts(&self.service.ports);
        self.rules
            .iter()
            .filter(|r| r.has_port_range())
            .filter(|r| {
                counts
                    .get(&r.protocol())
                    .is_some_and(|&count| count > MAX_DISCRETE_PORTS)
            })
            .any(|r| match desired.iter().find(|d| d.name == r.name) {
                Some(wanted) => !equal_ports(r, wanted, true),
                None => true,
            })
    }

    /// The temporary rule this strategy creates.
    pub fn temporary_rule(&self, names: &RuleNames) -> ForwardingRule {
        ForwardingRule {
            name: names.l3_temporary(),
            ip_protocol: IpProtocol::L3Default,
            all_ports: true,
            backend_service: self.backend_service_link.to_string(),
            ..Default::default()
        }
    }

    /// Creates the temporary rule. The returned handle deletes it again.
    pub async fn apply(&self, store: &RuleStore, names: &RuleNames) -> StoreResult<L3Release> {
        let mut rule = self.temporary_rule(names);
        rule.version = store.version();
        rule.scope = store.scope();
        info!(service = %self.service, name = %rule.name, "Creating temporary L3 forwarding rule");
        store.create(&rule).await?;
        Ok(L3Release {
            store: store.clone(),
            name: rule.name,
        })
    }
}

/// Deletes the temporary L3 rule once the discrete rules are in place.
#[must_use = "the temporary L3 rule leaks unless released"]
#[derive(Debug)]
pub struct L3Release {
    store: RuleStore,
    name: String,
}

impl L3Release {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn release(self) -> StoreResult<()> {
        info!(name = %self.name, "Deleting temporary L3 forwarding rule");
        self.store.delete(&self.name).await.inspect_err(|e| {
            warn!(name = %self.name, error = %e, "Failed to delete temporary L3 forwarding rule");
        })
    }
}
