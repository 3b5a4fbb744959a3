use crate::application::{application_release_ops, ApplicationDoc, StorageDirective};
use crate::collections::{APPLICATIONS, MACHINES, STATUSES, UNITS};
use crate::lifecycle::{advance_life, is_alive, is_dead, not_dead, AgentLiving, Life, Living};
use crate::machine::{MachineDoc, MachineJob, CONTAINERS_FIELD, HAS_VOTE_FIELD, PRINCIPALS_FIELD};
use crate::relation::scopes_of_unit;
use crate::state::{State, Versioned};
use crate::status::{
    agent_status_key, read_status, remove_status_op, set_status_op, Status, StatusDoc,
};
use crate::CoreError;
use corral_schema::{ApplicationName, MachineId, UnitName};
use corral_store::{Assert, Condition, Op, Update};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

pub const SUBORDINATES_FIELD: &str = "subordinates";
pub const MACHINE_ID_FIELD: &str = "machine_id";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitDoc {
    pub model_uuid: String,
    pub name: UnitName,
    pub application: ApplicationName,
    pub series: String,
    /// Empty for principal units.
    pub principal: String,
    pub subordinates: Vec<String>,
    /// Empty while unassigned.
    pub machine_id: String,
    pub life: Life,
    pub storage: Vec<StorageDirective>,
}

#[derive(Debug)]
pub struct Unit {
    pub(crate) st: Arc<State>,
    pub(crate) doc: UnitDoc,
    pub(crate) revno: u64,
}

impl State {
    pub fn unit(self: &Arc<Self>, name: &str) -> Result<Unit, CoreError> {
        let v = self
            .get::<UnitDoc>(UNITS, name)?
            .ok_or_else(|| CoreError::not_found("unit", name))?;
        Ok(Unit::from_versioned(Arc::clone(self), v))
    }

    pub fn all_units(self: &Arc<Self>) -> Result<Vec<Unit>, CoreError> {
        Ok(self
            .find::<UnitDoc>(UNITS, Vec::new())?
            .into_iter()
            .map(|v| Unit::from_versioned(Arc::clone(self), v))
            .collect())
    }
}

impl Unit {
    pub(crate) fn from_versioned(st: Arc<State>, v: Versioned<UnitDoc>) -> Self {
        Self {
            st,
            doc: v.doc,
            revno: v.revno,
        }
    }

    pub fn name(&self) -> &UnitName {
        &self.doc.name
    }

    pub fn application_name(&self) -> &ApplicationName {
        &self.doc.application
    }

    pub fn series(&self) -> &str {
        &self.doc.series
    }

    pub fn is_principal(&self) -> bool {
        self.doc.principal.is_empty()
    }

    pub fn principal_name(&self) -> Option<UnitName> {
        (!self.doc.principal.is_empty()).then(|| UnitName::new(self.doc.principal.clone()))
    }

    pub fn subordinate_names(&self) -> &[String] {
        &self.doc.subordinates
    }

    /// The machine recorded on the unit document, if any.
    pub fn machine_id(&self) -> Option<MachineId> {
        (!self.doc.machine_id.is_empty()).then(|| MachineId::new(self.doc.machine_id.clone()))
    }

    pub fn storage(&self) -> &[StorageDirective] {
        &self.doc.storage
    }

    pub fn revno(&self) -> u64 {
        self.revno
    }

    pub fn doc(&self) -> &UnitDoc {
        &self.doc
    }

    pub fn agent_status(&self) -> Result<StatusDoc, CoreError> {
        read_status(&self.st, &agent_status_key(&self.doc.name))?
            .map(|v| v.doc)
            .ok_or_else(|| CoreError::not_found("status", agent_status_key(&self.doc.name)))
    }

    /// Record what the unit agent reports. Refused once the unit is Dead.
    pub fn set_agent_status(&self, status: Status, message: &str) -> Result<(), CoreError> {
        let key = agent_status_key(&self.doc.name);
        let doc = StatusDoc::new(self.st.model_uuid(), status, message);
        self.st.run(|attempt| {
            if attempt > 0 {
                match self.st.get::<UnitDoc>(UNITS, &self.doc.name)? {
                    None => return Err(CoreError::not_found("unit", self.doc.name.as_str())),
                    Some(v) if v.doc.life == Life::Dead => {
                        return Err(CoreError::not_alive("unit", self.doc.name.as_str()))
                    }
                    Some(_) => {}
                }
            }
            Ok(vec![
                Op::check(
                    UNITS,
                    self.st.doc_id(&self.doc.name),
                    Assert::Matches(vec![not_dead()]),
                ),
                set_status_op(&self.st, &key, &doc),
            ])
        })
    }

    fn refresh_or_gone(&mut self) -> Result<bool, CoreError> {
        match self.refresh() {
            Ok(()) => Ok(false),
            Err(e) if e.is_not_found() => Ok(true),
            Err(e) => Err(e),
        }
    }

    fn destroy_ops(&self) -> Result<Vec<Op>, CoreError> {
        let config = &self.st.config().lifecycle;
        if config.short_circuit_destroy
            && self.doc.subordinates.is_empty()
            && scopes_of_unit(&self.st, &self.doc.name)?.is_empty()
        {
            let key = agent_status_key(&self.doc.name);
            let status = read_status(&self.st, &key)?;
            let policy = self.st.removal_policy();
            if policy.can_short_circuit(&self.doc, status.as_ref().map(|v| &v.doc)) {
                // Entering a relation scope bumps the unit's revno.
                let mut ops = vec![Op::check(
                    UNITS,
                    self.st.doc_id(&self.doc.name),
                    Assert::Revno(self.revno),
                )];
                if let Some(status) = &status {
                    // Any report from the agent bumps the revno and aborts.
                    ops.push(Op::check(
                        STATUSES,
                        self.st.doc_id(&key),
                        Assert::Revno(status.revno),
                    ));
                }
                ops.extend(self.remove_ops(vec![
                    is_alive(),
                    Condition::size(SUBORDINATES_FIELD, 0),
                ])?);
                return Ok(ops);
            }
        }
        Ok(vec![Op::update(
            UNITS,
            self.st.doc_id(&self.doc.name),
            vec![advance_life(self.doc.life, Life::Dying)?],
        )
        .with_assert(Assert::Matches(vec![is_alive()]))])
    }

    /// Everything that must happen in the batch deleting this unit. The
    /// unit must still match `conditions` and sit where this handle last
    /// saw it, since the machine and principal cleanup depend on that.
    fn remove_ops(&self, mut conditions: Vec<Condition>) -> Result<Vec<Op>, CoreError> {
        let st = &self.st;
        let name = self.doc.name.as_str();
        conditions.push(Condition::eq(MACHINE_ID_FIELD, self.doc.machine_id.as_str()));
        conditions.push(Condition::eq("principal", self.doc.principal.as_str()));
        let mut ops =
            vec![Op::remove(UNITS, st.doc_id(name)).with_assert(Assert::Matches(conditions))];

        let status_key = agent_status_key(&self.doc.name);
        if read_status(st, &status_key)?.is_some() {
            ops.push(remove_status_op(st, &status_key));
        }

        if !self.doc.principal.is_empty() {
            if st.get::<UnitDoc>(UNITS, &self.doc.principal)?.is_some() {
                ops.push(Op::update(
                    UNITS,
                    st.doc_id(&self.doc.principal),
                    vec![Update::pull(SUBORDINATES_FIELD, name)],
                ));
            }
        } else if !self.doc.machine_id.is_empty() {
            if let Some(machine) = st.get::<MachineDoc>(MACHINES, &self.doc.machine_id)? {
                ops.push(host_release_op(st, &machine.doc, name)?);
            }
        }

        let app = st
            .get::<ApplicationDoc>(APPLICATIONS, &self.doc.application)?
            .ok_or_else(|| CoreError::not_found("application", self.doc.application.as_str()))?;
        ops.extend(application_release_ops(st, &app, 1, 0)?);
        Ok(ops)
    }
}

/// Pull a departing principal off its machine. A standalone host-units
/// machine whose only principal this was goes Dying with it.
fn host_release_op(st: &State, machine: &MachineDoc, unit: &str) -> Result<Op, CoreError> {
    let id = st.doc_id(&machine.id);
    let cascade = machine.life == Life::Alive
        && machine.principals.len() == 1
        && machine.principals[0] == unit
        && machine.containers.is_empty()
        && !machine.has_vote
        && machine.jobs == [MachineJob::HostUnits];
    if cascade {
        info!("machine {} loses its last unit {unit}; destroying it", machine.id);
        Ok(Op::update(
            MACHINES,
            id,
            vec![
                Update::pull(PRINCIPALS_FIELD, unit),
                advance_life(machine.life, Life::Dying)?,
            ],
        )
        .with_assert(Assert::Matches(vec![
            is_alive(),
            Condition::size(PRINCIPALS_FIELD, 1),
            Condition::contains(PRINCIPALS_FIELD, unit),
            Condition::size(CONTAINERS_FIELD, 0),
            Condition::eq(HAS_VOTE_FIELD, false),
        ])))
    } else {
        // Keep the decision honest: if the machine could now cascade, abort.
        let mut conditions = vec![Condition::contains(PRINCIPALS_FIELD, unit)];
        if machine.principals.len() > 1 {
            conditions.push(Condition::size(PRINCIPALS_FIELD, machine.principals.len()));
        }
        Ok(Op::update(MACHINES, id, vec![Update::pull(PRINCIPALS_FIELD, unit)])
            .with_assert(Assert::Matches(conditions)))
    }
}

impl Living for Unit {
    fn life(&self) -> Life {
        self.doc.life
    }

    /// Alive -> Dying, or removal in one step when the unit has no
    /// subordinates and the removal policy allows it.
    fn destroy(&mut self) -> Result<(), CoreError> {
        let st = Arc::clone(&self.st);
        st.run(|_| {
            if self.refresh_or_gone()? {
                return Ok(Vec::new());
            }
            if self.doc.life != Life::Alive {
                return Ok(Vec::new());
            }
            self.destroy_ops()
        })?;
        if self.doc.life == Life::Alive {
            info!("destroyed unit {}", self.doc.name);
            self.doc.life = Life::Dying;
        }
        Ok(())
    }

    fn refresh(&mut self) -> Result<(), CoreError> {
        let v = self
            .st
            .get::<UnitDoc>(UNITS, &self.doc.name)?
            .ok_or_else(|| CoreError::not_found("unit", self.doc.name.as_str()))?;
        self.doc = v.doc;
        self.revno = v.revno;
        Ok(())
    }
}

impl AgentLiving for Unit {
    fn ensure_dead(&mut self) -> Result<(), CoreError> {
        let st = Arc::clone(&self.st);
        st.run(|_| {
            if self.refresh_or_gone()? {
                return Ok(Vec::new());
            }
            if self.doc.life == Life::Dead {
                return Ok(Vec::new());
            }
            if !self.doc.subordinates.is_empty() {
                return Err(CoreError::has_dependents(
                    "unit",
                    self.doc.name.as_str(),
                    format!("unit has subordinates: {}", self.doc.subordinates.join(", ")),
                ));
            }
            let scopes = scopes_of_unit(&self.st, &self.doc.name)?;
            if !scopes.is_empty() {
                return Err(CoreError::has_dependents(
                    "unit",
                    self.doc.name.as_str(),
                    format!("unit is in scope of relations: {}", scopes.join(", ")),
                ));
            }
            let id = self.st.doc_id(&self.doc.name);
            Ok(vec![
                Op::check(UNITS, id.clone(), Assert::Revno(self.revno)),
                Op::update(UNITS, id, vec![advance_life(self.doc.life, Life::Dead)?])
                    .with_assert(Assert::Matches(vec![
                        not_dead(),
                        Condition::size(SUBORDINATES_FIELD, 0),
                    ])),
            ])
        })?;
        if self.doc.life != Life::Dead {
            info!("unit {} is dead", self.doc.name);
        }
        self.doc.life = Life::Dead;
        Ok(())
    }

    fn remove(&mut self) -> Result<(), CoreError> {
        let st = Arc::clone(&self.st);
        let mut removed = false;
        st.run(|_| {
            if self.refresh_or_gone()? {
                return Ok(Vec::new());
            }
            if self.doc.life != Life::Dead {
                return Err(CoreError::NotDead {
                    kind: "unit",
                    id: self.doc.name.to_string(),
                });
            }
            removed = true;
            self.remove_ops(vec![is_dead()])
        })?;
        if removed {
            info!("removed unit {}", self.doc.name);
        }
        Ok(())
    }
}
