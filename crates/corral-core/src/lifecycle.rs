use crate::CoreError;
use corral_store::{Condition, Update};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Life of a long-lived entity. Only ever moves forward:
/// Alive -> Dying -> Dead, or Alive -> Dead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Life {
    Alive,
    Dying,
    Dead,
}

impl Life {
    pub fn as_str(self) -> &'static str {
        match self {
            Life::Alive => "alive",
            Life::Dying => "dying",
            Life::Dead => "dead",
        }
    }
}

impl fmt::Display for Life {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Life> for Value {
    fn from(life: Life) -> Self {
        Value::String(life.as_str().to_owned())
    }
}

pub fn validate_transition(from: Life, to: Life) -> Result<(), CoreError> {
    let valid = matches!(
        (from, to),
        (Life::Alive, Life::Alive | Life::Dying | Life::Dead)
            | (Life::Dying, Life::Dying | Life::Dead)
            | (Life::Dead, Life::Dead)
    );

    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

pub const LIFE_FIELD: &str = "life";

/// The document update moving an entity from `from` to `to`, refused for
/// backward moves.
pub fn advance_life(from: Life, to: Life) -> Result<Update, CoreError> {
    validate_transition(from, to)?;
    Ok(Update::set(LIFE_FIELD, to))
}

pub fn is_alive() -> Condition {
    Condition::eq(LIFE_FIELD, Life::Alive)
}

pub fn is_dying() -> Condition {
    Condition::eq(LIFE_FIELD, Life::Dying)
}

pub fn is_dead() -> Condition {
    Condition::eq(LIFE_FIELD, Life::Dead)
}

pub fn not_dead() -> Condition {
    Condition::ne(LIFE_FIELD, Life::Dead)
}

/// Shared surface of every lifecycle-bearing entity.
pub trait Living {
    fn life(&self) -> Life;

    /// Start the entity's death. Succeeds without effect when the entity is
    /// already dying, dead, or removed.
    fn destroy(&mut self) -> Result<(), CoreError>;

    /// Reload from the store; NotFound once the entity has been removed.
    fn refresh(&mut self) -> Result<(), CoreError>;
}

/// Entities whose agent finishes their death: units and machines.
pub trait AgentLiving: Living {
    /// Move to Dead. Fails with HasDependents while live dependents exist.
    fn ensure_dead(&mut self) -> Result<(), CoreError>;

    /// Delete a Dead entity and release what it held. Succeeds when the
    /// entity is already gone.
    fn remove(&mut self) -> Result<(), CoreError>;
}
