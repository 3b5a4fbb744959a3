//! Identifiers, name validation, and configuration for corral.
//!
//! This crate defines the schema layer shared by the store and the core:
//! string newtypes for entity identifiers (`UnitName`, `MachineId`, ...),
//! name validation rules, and the TOML `StateConfig` that tunes the
//! transaction runner, lifecycle policy, and store backend.

pub mod config;
pub mod names;
pub mod types;

pub use config::{
    parse_config_file, parse_config_str, ConfigError, LifecycleSection, StateConfig,
    StoreSection, TxnSection,
};
pub use names::{
    validate_application_name, validate_machine_id, validate_offer_name, validate_unit_name,
    NameError,
};
pub use types::{ApplicationName, MachineId, ModelUuid, OfferName, RelationKey, UnitName};
