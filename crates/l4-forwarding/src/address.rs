//! IP address selection and reservation.
//!
//! Address reservation itself belongs to an external [`AddressManager`].
//! The orchestrator holds the address while the forwarding rule is written
//! and releases it on every exit path through [`AddressHold::release`].

use crate::events::{emit, EventRecorder, EventType, REASON_MIXED_STATIC_IP};
use crate::rule::{ForwardingRule, IpVersion, LoadBalancingScheme, NetworkTier};
use crate::service::Service;
use crate::sync::IpAddressType;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, error};

#[derive(Debug, Clone, Error)]
pub enum AddressError {
    #[error("failed to hold address {address:?} for {name}: {message}")]
    Hold {
        name: String,
        address: String,
        message: String,
    },
    #[error("failed to release address for {name}: {message}")]
    Release { name: String, message: String },
    #[error("failed to tear down address for {name}: {message}")]
    TearDown { name: String, message: String },
}

/// Everything the address manager needs to reserve an address for a rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRequest {
    /// `namespace/name` of the owning Service.
    pub service: String,
    pub region: String,
    pub subnetwork: String,
    /// Name of the reservation, the same as the forwarding rule's.
    pub name: String,
    /// Address asked for; empty means any.
    pub requested_ip: String,
    pub scheme: LoadBalancingScheme,
    pub network_tier: NetworkTier,
    pub ip_version: IpVersion,
}

/// An address held by the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeldAddress {
    pub address: String,
    pub ip_type: IpAddressType,
}

#[async_trait]
pub trait AddressManager: Send + Sync {
    /// Reserves the requested address, or a new one if none was requested.
    async fn hold_address(&self, request: &AddressRequest) -> Result<HeldAddress, AddressError>;

    /// Drops a reservation made by [`AddressManager::hold_address`] if the
    /// controller made it.
    async fn release_address(&self, request: &AddressRequest) -> Result<(), AddressError>;

    /// Deletes a controller reserved address whose tier differs from the
    /// request's.
    async fn tear_down_address_if_tier_mismatch(
        &self,
        request: &AddressRequest,
    ) -> Result<(), AddressError>;
}

/// An address held for the duration of one ensure call.
#[must_use = "a held address must be released"]
pub struct AddressHold {
    manager: Arc<dyn AddressManager>,
    request: AddressRequest,
    held: HeldAddress,
}

impl AddressHold {
    pub async fn acquire(
        manager: Arc<dyn AddressManager>,
        request: AddressRequest,
    ) -> Result<Self, AddressError> {
        let held = manager.hold_address(&request).await?;
        debug!(name = %request.name, address = %held.address, "Holding address for forwarding rule");
        Ok(Self {
            manager,
            request,
            held,
        })
    }

    pub fn address(&self) -> &str {
        &self.held.address
    }

    pub fn ip_type(&self) -> IpAddressType {
        self.held.ip_type
    }

    /// Releases the reservation. Failures are logged only: the rule, if
    /// created, keeps the address in use anyway.
    pub async fn release(self) {
        if let Err(e) = self.manager.release_address(&self.request).await {
            error!(
                name = %self.request.name,
                error = %e,
                "Failed to release address reservation, possibly causing an orphan"
            );
        }
    }
}

impl fmt::Debug for AddressHold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressHold")
            .field("request", &self.request)
            .field("held", &self.held)
            .finish()
    }
}

/// Picks the IPv4 address for a rule.
///
/// In order: the static addresses annotation, the legacy `loadBalancerIP`
/// field, then the existing rule's address. The existing address is dropped
/// when the rule moves to another subnetwork.
pub fn ipv4_address_to_use(
    service: &Service,
    existing: Option<&ForwardingRule>,
    requested_subnet: &str,
    recorder: &dyn EventRecorder,
) -> String {
    if let Some(address) = service.ipv4_address_annotation() {
        if !service.load_balancer_ip.is_empty() {
            emit(
                recorder,
                service,
                EventType::Normal,
                REASON_MIXED_STATIC_IP,
                "Found both .Spec.LoadBalancerIP and \"networking.gke.io/load-balancer-ip-addresses\" annotation. Consider using annotation only.",
            );
        }
        return address;
    }
    if !service.load_balancer_ip.is_empty() {
        return service.load_balancer_ip.clone();
    }
    match existing {
        Some(rule) if rule.subnetwork == requested_subnet => rule.ip_address.clone(),
        _ => String::new(),
    }
}

#[derive(Debug, Clone)]
struct Reservation {
    address: String,
    tier: NetworkTier,
}

#[derive(Debug, Default)]
struct MemoryAddressState {
    reserved: HashMap<String, Reservation>,
    next_host: u8,
    holds: usize,
    releases: usize,
    tear_downs: usize,
}

/// Address manager keeping reservations in memory.
///
/// Requested addresses are treated as user owned and never reserved.
/// Otherwise an address from `203.0.113.0/24` is reserved under the rule
/// name and kept until released.
#[derive(Debug, Default)]
pub struct MemoryAddressManager {
    state: Mutex<MemoryAddressState>,
}

impl MemoryAddressManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryAddressState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn reserved(&self, name: &str) -> Option<String> {
        self.state().reserved.get(name).map(|r| r.address.clone())
    }

    /// Number of hold, release and tear down calls.
    pub fn call_counts(&self) -> (usize, usize, usize) {
        let state = self.state();
        (state.holds, state.releases, state.tear_downs)
    }
}

#[async_trait]
impl AddressManager for MemoryAddressManager {
    async fn hold_address(&self, request: &AddressRequest) -> Result<HeldAddress, AddressError> {
        let mut state = self.state();
        state.holds += 1;
        if !request.requested_ip.is_empty() {
            return Ok(HeldAddress {
                address: request.requested_ip.clone(),
                ip_type: IpAddressType::Unmanaged,
            });
        }
        if let Some(existing) = state.reserved.get(&request.name) {
            return Ok(HeldAddress {
                address: existing.address.clone(),
                ip_type: IpAddressType::Managed,
            });
        }
        if state.next_host == u8::MAX {
            return Err(AddressError::Hold {
                name: request.name.clone(),
                address: String::new(),
                message: "address pool exhausted".to_string(),
            });
        }
        state.next_host += 1;
        let address = format!("203.0.113.{}", state.next_host);
        state.reserved.insert(
            request.name.clone(),
            Reservation {
                address: address.clone(),
                tier: request.network_tier.clone(),
            },
        );
        Ok(HeldAddress {
            address,
            ip_type: IpAddressType::Managed,
        })
    }

    async fn release_address(&self, request: &AddressRequest) -> Result<(), AddressError> {
        let mut state = self.state();
        state.releases += 1;
        state.reserved.remove(&request.name);
        Ok(())
    }

    async fn tear_down_address_if_tier_mismatch(
        &self,
        request: &AddressRequest,
    ) -> Result<(), AddressError> {
        let mut state = self.state();
        state.tear_downs += 1;
        let mismatched = state
            .reserved
            .get(&request.name)
            .is_some_and(|r| r.tier != request.network_tier);
        if mismatched {
            state.reserved.remove(&request.name);
        }
        Ok(())
    }
}
