//! Pure batch planning shared by every backend.
//!
//! A backend loads the documents a batch touches, hands them to
//! [`plan_batch`], and either writes the planned final states or reports the
//! abort. Operations are evaluated in order against a working copy, so a later
//! operation sees the effect of an earlier one in the same batch. Each
//! document touched by a mutation has its revno bumped exactly once.

use crate::document::{Assert, BatchOutcome, Document, Mutation, Op, Update};
use crate::StoreError;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Final state of one document after a batch; `None` means deleted.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedWrite {
    pub collection: String,
    pub id: String,
    pub previous: Option<Document>,
    pub next: Option<Document>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BatchPlan {
    Apply(Vec<PlannedWrite>),
    Abort { op_index: usize, reason: String },
}

impl BatchPlan {
    pub fn outcome(&self) -> BatchOutcome {
        match self {
            BatchPlan::Apply(_) => BatchOutcome::Applied,
            BatchPlan::Abort { op_index, reason } => BatchOutcome::Aborted {
                op_index: *op_index,
                reason: reason.clone(),
            },
        }
    }
}

struct Slot {
    original: Option<Document>,
    current: Option<Value>,
    dirty: bool,
}

/// Evaluate `ops` against the documents returned by `read`.
pub fn plan_batch<F>(ops: &[Op], mut read: F) -> Result<BatchPlan, StoreError>
where
    F: FnMut(&str, &str) -> Result<Option<Document>, StoreError>,
{
    let mut slots: BTreeMap<(String, String), Slot> = BTreeMap::new();

    for (op_index, op) in ops.iter().enumerate() {
        let key = (op.collection.clone(), op.id.clone());
        if !slots.contains_key(&key) {
            let original = read(&op.collection, &op.id)?;
            let current = original.as_ref().map(|d| d.body.clone());
            slots.insert(
                key.clone(),
                Slot {
                    original,
                    current,
                    dirty: false,
                },
            );
        }
        let Some(slot) = slots.get_mut(&key) else {
            continue;
        };

        let view = slot.current.as_ref().map(|body| Document {
            id: op.id.clone(),
            revno: slot.original.as_ref().map_or(0, |d| d.revno),
            body: body.clone(),
        });
        if !op.assert.holds(view.as_ref()) {
            return Ok(BatchPlan::Abort {
                op_index,
                reason: describe_failure(op),
            });
        }

        match &op.mutation {
            Mutation::None => {}
            Mutation::Insert(body) => {
                if slot.current.is_some() {
                    return Ok(BatchPlan::Abort {
                        op_index,
                        reason: format!("{}/{} already exists", op.collection, op.id),
                    });
                }
                slot.current = Some(body.clone());
                slot.dirty = true;
            }
            Mutation::Update(updates) => {
                let Some(body) = slot.current.as_mut() else {
                    return Ok(BatchPlan::Abort {
                        op_index,
                        reason: format!("{}/{} not found for update", op.collection, op.id),
                    });
                };
                for update in updates {
                    apply_update(body, update).map_err(|reason| StoreError::InvalidUpdate {
                        collection: op.collection.clone(),
                        id: op.id.clone(),
                        reason,
                    })?;
                }
                slot.dirty = true;
            }
            Mutation::Remove => {
                if slot.current.is_none() {
                    return Ok(BatchPlan::Abort {
                        op_index,
                        reason: format!("{}/{} not found for remove", op.collection, op.id),
                    });
                }
                slot.current = None;
                slot.dirty = true;
            }
        }
    }

    let writes = slots
        .into_iter()
        .filter(|(_, slot)| slot.dirty)
        .map(|((collection, id), slot)| {
            let revno = slot.original.as_ref().map_or(1, |d| d.revno + 1);
            let next = slot.current.map(|body| Document {
                id: id.clone(),
                revno,
                body,
            });
            PlannedWrite {
                collection,
                id,
                previous: slot.original,
                next,
            }
        })
        .collect();
    Ok(BatchPlan::Apply(writes))
}

fn describe_failure(op: &Op) -> String {
    let what = match &op.assert {
        Assert::Always => "always",
        Assert::Exists => "exists",
        Assert::Missing => "missing",
        Assert::Revno(_) => "revno",
        Assert::Matches(_) => "conditions",
    };
    format!("{}/{}: assertion '{what}' failed", op.collection, op.id)
}

fn apply_update(body: &mut Value, update: &Update) -> Result<(), String> {
    match update {
        Update::Set(path, value) => {
            *field_mut(body, path)? = value.clone();
        }
        Update::Unset(path) => {
            let (parent, leaf) = match path.rsplit_once('.') {
                Some((parent, leaf)) => (lookup_mut(body, parent), leaf),
                None => (Some(body), path.as_str()),
            };
            if let Some(Value::Object(map)) = parent {
                map.remove(leaf);
            }
        }
        Update::Inc(path, n) => {
            let field = field_mut(body, path)?;
            let current = match field {
                Value::Null => 0,
                Value::Number(num) => num
                    .as_i64()
                    .ok_or_else(|| format!("field '{path}' is not an integer"))?,
                _ => return Err(format!("field '{path}' is not a number")),
            };
            *field = Value::from(current + n);
        }
        Update::AddToSet(path, value) => {
            let items = array_mut(body, path)?;
            if !items.contains(value) {
                items.push(value.clone());
            }
        }
        Update::Pull(path, value) => {
            let items = array_mut(body, path)?;
            items.retain(|item| item != value);
        }
    }
    Ok(())
}

fn lookup_mut<'a>(body: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    let mut current = body;
    for segment in path.split('.') {
        current = current.as_object_mut()?.get_mut(segment)?;
    }
    Some(current)
}

/// The field at `path`, creating intermediate objects and a null leaf.
fn field_mut<'a>(body: &'a mut Value, path: &str) -> Result<&'a mut Value, String> {
    let mut current = body;
    for segment in path.split('.') {
        if current.is_null() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else {
            return Err(format!("path '{path}' crosses a non-object value"));
        };
        current = map.entry(segment.to_owned()).or_insert(Value::Null);
    }
    Ok(current)
}

fn array_mut<'a>(body: &'a mut Value, path: &str) -> Result<&'a mut Vec<Value>, String> {
    let field = field_mut(body, path)?;
    if field.is_null() {
        *field = Value::Array(Vec::new());
    }
    field
        .as_array_mut()
        .ok_or_else(|| format!("field '{path}' is not an array"))
}
