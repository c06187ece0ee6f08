//! Forwarding rule reconciliation.
//!
//! [`ForwardingRuleOrch`] drives one rule (internal or external) or a whole
//! discrete-port rule set to the state a Service asks for:
//!
//! ```text
//! no rule ──create──────────────────────────────┐
//! equal ───────────────────────────────(resync)─┤
//! patchable ──patch─────────────────────────────┼──> read back (update)
//! immutable change ──delete──create─────────────┘
//! ```

mod orch;
mod rule_set;

pub use orch::{
    ExternalRuleParams, ForwardingRuleOrch, ForwardingRuleOrchConfig, ForwardingRuleOrchStats,
    InternalRuleParams, RuleSync,
};
pub use rule_set::RuleSetSync;
