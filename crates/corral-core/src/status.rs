use crate::collections::STATUSES;
use crate::state::{State, Versioned, MODEL_UUID_FIELD};
use crate::unit::UnitDoc;
use crate::CoreError;
use corral_schema::UnitName;
use corral_store::{Assert, Op, Update};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// The agent has not started yet.
    Allocating,
    Idle,
    Executing,
    Error,
    Lost,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Allocating => "allocating",
            Status::Idle => "idle",
            Status::Executing => "executing",
            Status::Error => "error",
            Status::Lost => "lost",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusDoc {
    pub model_uuid: String,
    pub status: Status,
    pub message: String,
    pub since: String,
}

impl StatusDoc {
    pub fn new(model_uuid: &str, status: Status, message: impl Into<String>) -> Self {
        Self {
            model_uuid: model_uuid.to_owned(),
            status,
            message: message.into(),
            since: chrono::Utc::now().to_rfc3339(),
        }
    }
}

pub fn agent_status_key(unit: &UnitName) -> String {
    format!("u#{unit}")
}

pub(crate) fn read_status(
    st: &State,
    key: &str,
) -> Result<Option<Versioned<StatusDoc>>, CoreError> {
    st.get(STATUSES, key)
}

pub(crate) fn create_status_op(st: &State, key: &str, doc: &StatusDoc) -> Result<Op, CoreError> {
    Ok(Op::insert(STATUSES, st.doc_id(key), State::to_body(doc)?))
}

pub(crate) fn remove_status_op(st: &State, key: &str) -> Op {
    Op::remove(STATUSES, st.doc_id(key))
}

pub(crate) fn set_status_op(st: &State, key: &str, doc: &StatusDoc) -> Op {
    Op::update(
        STATUSES,
        st.doc_id(key),
        vec![
            Update::set("status", doc.status.to_string()),
            Update::set("message", doc.message.clone()),
            Update::set("since", doc.since.clone()),
            Update::set(MODEL_UUID_FIELD, doc.model_uuid.clone()),
        ],
    )
    .with_assert(Assert::Exists)
}

/// Decides whether destroying a unit may remove it in one step.
///
/// Only consulted for units without subordinates, and only when
/// `lifecycle.short_circuit_destroy` is enabled.
pub trait RemovalPolicy: Send + Sync {
    fn can_short_circuit(&self, unit: &UnitDoc, agent_status: Option<&StatusDoc>) -> bool;
}

/// Short-circuit units whose agent never reported: status still
/// `allocating`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverReported;

impl RemovalPolicy for NeverReported {
    fn can_short_circuit(&self, _unit: &UnitDoc, agent_status: Option<&StatusDoc>) -> bool {
        agent_status.is_some_and(|s| s.status == Status::Allocating)
    }
}
