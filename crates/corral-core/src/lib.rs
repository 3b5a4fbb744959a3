//! Lifecycle and optimistic-transaction layer for cluster orchestration state.
//!
//! Units, machines, applications, relations, settings, and cross-model offers
//! are documents in a shared [`DocumentStore`](corral_store::DocumentStore).
//! Every change is expressed as a builder `attempt -> Vec<Op>` and submitted
//! by the [`TxnRunner`] as one atomic conditional batch; on abort the builder
//! re-reads current state and tries again, up to a bounded number of attempts.
//! Entities share the [`Life`] state machine (Alive -> Dying -> Dead ->
//! removed) and refuse to die while they still have dependents.

pub mod application;
pub mod assign;
pub mod collections;
pub mod lifecycle;
pub mod machine;
pub mod offers;
pub mod refcount;
pub mod registry;
pub mod relation;
pub mod relation_networks;
pub mod settings;
pub mod state;
pub mod status;
pub mod txn;
pub mod unit;

pub use application::{AddApplicationArgs, Application, ApplicationDoc, StorageDirective};
pub use assign::AssignmentPolicy;
pub use lifecycle::{advance_life, validate_transition, AgentLiving, Life, Living};
pub use machine::{Machine, MachineDoc, MachineJob, MachineTemplate};
pub use offers::{
    AddOfferArgs, AddOfferConnectionArgs, ApplicationOffer, ApplicationOffers, OfferConnection,
    OfferFilter,
};
pub use refcount::Refcounts;
pub use registry::{InstanceInfo, InstanceRegistry};
pub use relation::{Endpoint, Relation, RelationDoc, RelationRole, RelationScope, RelationUnit};
pub use relation_networks::{NetworkDirection, RelationNetwork, RelationNetworks};
pub use settings::{
    create_settings, read_settings, remove_settings, replace_settings, ItemChange,
    ItemChangeKind, Settings,
};
pub use state::{State, StateBuilder, Versioned};
pub use status::{NeverReported, RemovalPolicy, Status, StatusDoc};
pub use txn::{Hook, RetryConfig, TxnRunner};
pub use unit::{Unit, UnitDoc};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Config(#[from] corral_schema::ConfigError),
    #[error("store error: {0}")]
    Store(#[from] corral_store::StoreError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("{0}")]
    Name(#[from] corral_schema::NameError),
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
    #[error("{kind} {id} is not alive")]
    NotAlive { kind: &'static str, id: String },
    #[error("{kind} {id} is not dead")]
    NotDead { kind: &'static str, id: String },
    #[error("{kind} {id} already exists")]
    AlreadyExists { kind: &'static str, id: String },
    #[error("{kind} {id} has dependents: {reason}")]
    HasDependents {
        kind: &'static str,
        id: String,
        reason: String,
    },
    #[error("state changing too quickly; try again soon")]
    Contention,
    #[error("cannot {subject}: {reason}")]
    PolicyViolation { subject: String, reason: String },
    #[error("unit {0} is not assigned to a machine")]
    NotAssigned(String),
    #[error("invalid life transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("state has been closed")]
    StateClosed,
}

impl CoreError {
    pub(crate) fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub(crate) fn not_alive(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotAlive {
            kind,
            id: id.into(),
        }
    }

    pub(crate) fn has_dependents(
        kind: &'static str,
        id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::HasDependents {
            kind,
            id: id.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn policy(subject: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PolicyViolation {
            subject: subject.into(),
            reason: reason.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_not_alive(&self) -> bool {
        matches!(self, Self::NotAlive { .. })
    }

    pub fn is_not_dead(&self) -> bool {
        matches!(self, Self::NotDead { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    pub fn is_has_dependents(&self) -> bool {
        matches!(self, Self::HasDependents { .. })
    }

    pub fn is_contention(&self) -> bool {
        matches!(self, Self::Contention)
    }

    pub fn is_policy_violation(&self) -> bool {
        matches!(self, Self::PolicyViolation { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contention_message() {
        assert_eq!(
            CoreError::Contention.to_string(),
            "state changing too quickly; try again soon"
        );
    }

    #[test]
    fn predicates_match_variants() {
        assert!(CoreError::not_found("unit", "a/0").is_not_found());
        assert!(CoreError::not_alive("unit", "a/0").is_not_alive());
        assert!(CoreError::has_dependents("unit", "a/0", "subordinates").is_has_dependents());
        assert!(CoreError::policy("assign", "series mismatch").is_policy_violation());
        assert!(!CoreError::Contention.is_not_found());
    }

    #[test]
    fn error_messages_name_the_entity() {
        let e = CoreError::has_dependents("unit", "wordpress/0", "unit has subordinates");
        let msg = e.to_string();
        assert!(msg.contains("wordpress/0"));
        assert!(msg.contains("subordinates"));
        assert_eq!(
            CoreError::not_found("machine", "3").to_string(),
            "machine 3 not found"
        );
    }
}
