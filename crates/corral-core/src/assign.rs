//! Placing principal units on machines.
//!
//! Every assignment writes both sides in one batch: the unit records the
//! machine id and the machine lists the unit among its principals. The
//! batch asserts the unit is alive and unassigned and the machine alive, so
//! two concurrent assignments of one unit cannot both land.

use crate::collections::{MACHINES, UNITS};
use crate::lifecycle::{is_alive, Life, Living};
use crate::machine::{
    attach_container_op, check_container_type, new_machine_doc, next_container_id,
    next_machine_id, Machine, MachineDoc, MachineJob, MachineTemplate, CLEAN_FIELD,
    CONTAINERS_FIELD, JOBS_FIELD, PRINCIPALS_FIELD,
};
use crate::state::State;
use crate::unit::{Unit, UnitDoc, MACHINE_ID_FIELD};
use crate::CoreError;
use corral_schema::MachineId;
use corral_store::{Assert, BatchOutcome, Condition, Op, Update};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignmentPolicy {
    /// Machine `0`.
    AssignLocal,
    /// A machine that never hosted a unit, or a new one.
    AssignClean,
    /// A clean machine without containers, or a new one.
    AssignCleanEmpty,
    AssignNew,
}

impl State {
    pub fn assign_unit(
        self: &Arc<Self>,
        unit: &mut Unit,
        policy: AssignmentPolicy,
    ) -> Result<(), CoreError> {
        if !unit.is_principal() {
            return Err(CoreError::policy(
                format!("assign unit {}", unit.name()),
                "unit is a subordinate",
            ));
        }
        match policy {
            AssignmentPolicy::AssignLocal => {
                let mut machine = self.machine("0")?;
                unit.assign_to_machine(&mut machine)
            }
            AssignmentPolicy::AssignNew => unit.assign_to_new_machine().map(|_| ()),
            AssignmentPolicy::AssignClean => unit.assign_to_clean_machine(false),
            AssignmentPolicy::AssignCleanEmpty => unit.assign_to_clean_machine(true),
        }
    }
}

/// Reasons `unit` may not go on `machine`.
fn check_assignable(unit: &UnitDoc, machine: &MachineDoc) -> Result<(), CoreError> {
    let subject = || format!("assign unit {} to machine {}", unit.name, machine.id);
    if !unit.principal.is_empty() {
        return Err(CoreError::policy(subject(), "unit is a subordinate"));
    }
    if unit.life != Life::Alive {
        return Err(CoreError::not_alive("unit", unit.name.as_str()));
    }
    if machine.life != Life::Alive {
        return Err(CoreError::not_alive("machine", machine.id.as_str()));
    }
    if !unit.machine_id.is_empty() && unit.machine_id != machine.id {
        return Err(CoreError::policy(
            subject(),
            format!("unit is already assigned to machine {}", unit.machine_id),
        ));
    }
    if unit.series != machine.series {
        return Err(CoreError::policy(
            subject(),
            format!("series does not match ({} != {})", unit.series, machine.series),
        ));
    }
    if !machine.jobs.contains(&MachineJob::HostUnits) {
        return Err(CoreError::policy(subject(), "machine cannot host units"));
    }
    if !machine.instance_id.is_empty() {
        if let Some(s) = unit.storage.iter().find(|s| !s.dynamic) {
            return Err(CoreError::policy(
                subject(),
                format!("static storage {} cannot be attached to a provisioned machine", s.name),
            ));
        }
    }
    Ok(())
}

/// Unit half of an assignment: record the machine on an alive, unassigned unit.
fn unit_assign_op(st: &State, unit: &UnitDoc, machine: &MachineId) -> Op {
    Op::update(
        UNITS,
        st.doc_id(&unit.name),
        vec![Update::set(MACHINE_ID_FIELD, machine.as_str())],
    )
    .with_assert(Assert::Matches(vec![
        is_alive(),
        Condition::eq(MACHINE_ID_FIELD, ""),
    ]))
}

/// Machine half of an assignment to an existing machine.
fn machine_assign_op(
    st: &State,
    unit: &UnitDoc,
    machine: &MachineDoc,
    extra: Vec<Condition>,
) -> Op {
    let mut conditions = vec![
        is_alive(),
        Condition::eq("series", machine.series.as_str()),
        Condition::contains(JOBS_FIELD, MachineJob::HostUnits.as_str()),
    ];
    if !machine.instance_id.is_empty() || unit.storage.iter().any(|s| !s.dynamic) {
        conditions.push(Condition::eq("instance_id", machine.instance_id.as_str()));
    }
    conditions.extend(extra);
    Op::update(
        MACHINES,
        st.doc_id(&machine.id),
        vec![
            Update::add_to_set(PRINCIPALS_FIELD, unit.name.as_str()),
            Update::set(CLEAN_FIELD, false),
        ],
    )
    .with_assert(Assert::Matches(conditions))
}

impl Unit {
    /// The machine this unit runs on. Subordinates report their
    /// principal's machine.
    pub fn assigned_machine_id(&self) -> Result<MachineId, CoreError> {
        if self.is_principal() {
            return self
                .machine_id()
                .ok_or_else(|| CoreError::NotAssigned(self.name().to_string()));
        }
        let principal = self
            .st
            .get::<UnitDoc>(UNITS, &self.doc.principal)?
            .ok_or_else(|| CoreError::not_found("unit", self.doc.principal.as_str()))?;
        if principal.doc.machine_id.is_empty() {
            return Err(CoreError::NotAssigned(self.name().to_string()));
        }
        Ok(MachineId::new(principal.doc.machine_id))
    }

    pub fn assign_to_machine(&mut self, machine: &mut Machine) -> Result<(), CoreError> {
        let st = Arc::clone(&self.st);
        st.run(|attempt| {
            if attempt > 0 {
                self.refresh()?;
                machine.refresh()?;
            }
            check_assignable(&self.doc, &machine.doc)?;
            if self.doc.machine_id == machine.doc.id {
                return Ok(Vec::new());
            }
            Ok(vec![
                unit_assign_op(&self.st, &self.doc, &machine.doc.id),
                machine_assign_op(&self.st, &self.doc, &machine.doc, Vec::new()),
            ])
        })?;
        self.refresh()?;
        machine.refresh()?;
        info!("assigned unit {} to machine {}", self.doc.name, machine.doc.id);
        Ok(())
    }

    /// Create a machine and assign the unit to it in one batch.
    pub fn assign_to_new_machine(&mut self) -> Result<MachineId, CoreError> {
        let st = Arc::clone(&self.st);
        let id = next_machine_id(&st)?;
        let template = MachineTemplate::host(self.doc.series.clone());
        st.run(|attempt| {
            if attempt > 0 {
                self.refresh()?;
            }
            self.check_unassigned()?;
            let mut doc = new_machine_doc(&self.st, id.clone(), &template)?;
            doc.principals.push(self.doc.name.to_string());
            doc.clean = false;
            Ok(vec![
                unit_assign_op(&self.st, &self.doc, &id),
                Op::insert(MACHINES, self.st.doc_id(&id), State::to_body(&doc)?),
            ])
        })?;
        self.refresh()?;
        info!("assigned unit {} to new machine {id}", self.doc.name);
        Ok(id)
    }

    /// Create a container inside `parent` and assign the unit to it.
    pub fn assign_to_new_container(
        &mut self,
        parent: &str,
        container_type: &str,
    ) -> Result<MachineId, CoreError> {
        let st = Arc::clone(&self.st);
        let parent = st.machine(parent)?;
        check_container_type(&parent.doc, container_type)?;
        let id = next_container_id(&st, &parent.doc.id, container_type)?;
        let template = MachineTemplate::host(self.doc.series.clone());
        st.run(|attempt| {
            if attempt > 0 {
                self.refresh()?;
                let parent = self
                    .st
                    .get::<MachineDoc>(MACHINES, &parent.doc.id)?
                    .ok_or_else(|| CoreError::not_found("machine", parent.doc.id.as_str()))?;
                if parent.doc.life != Life::Alive {
                    return Err(CoreError::not_alive("machine", parent.doc.id.as_str()));
                }
            }
            self.check_unassigned()?;
            let mut doc = new_machine_doc(&self.st, id.clone(), &template)?;
            doc.principals.push(self.doc.name.to_string());
            doc.clean = false;
            Ok(vec![
                unit_assign_op(&self.st, &self.doc, &id),
                Op::insert(MACHINES, self.st.doc_id(&id), State::to_body(&doc)?),
                attach_container_op(&self.st, &parent.doc.id, &id),
            ])
        })?;
        self.refresh()?;
        info!("assigned unit {} to new container {id}", self.doc.name);
        Ok(id)
    }

    /// Clear the unit's machine and drop it from the machine's principals.
    /// Unassigned units are left alone.
    pub fn unassign_from_machine(&mut self) -> Result<(), CoreError> {
        let st = Arc::clone(&self.st);
        st.run(|attempt| {
            if attempt > 0 {
                self.refresh()?;
            }
            if self.doc.machine_id.is_empty() {
                return Ok(Vec::new());
            }
            let machine_id = self.doc.machine_id.as_str();
            let mut ops = vec![Op::update(
                UNITS,
                self.st.doc_id(&self.doc.name),
                vec![Update::set(MACHINE_ID_FIELD, "")],
            )
            .with_assert(Assert::Matches(vec![Condition::eq(MACHINE_ID_FIELD, machine_id)]))];
            if self.st.get::<MachineDoc>(MACHINES, machine_id)?.is_some() {
                ops.push(Op::update(
                    MACHINES,
                    self.st.doc_id(machine_id),
                    vec![Update::pull(PRINCIPALS_FIELD, self.doc.name.as_str())],
                ));
            }
            Ok(ops)
        })?;
        self.refresh()
    }

    fn check_unassigned(&self) -> Result<(), CoreError> {
        if !self.is_principal() {
            return Err(CoreError::policy(
                format!("assign unit {}", self.doc.name),
                "unit is a subordinate",
            ));
        }
        if self.doc.life != Life::Alive {
            return Err(CoreError::not_alive("unit", self.doc.name.as_str()));
        }
        if !self.doc.machine_id.is_empty() {
            return Err(CoreError::policy(
                format!("assign unit {}", self.doc.name),
                format!("unit is already assigned to machine {}", self.doc.machine_id),
            ));
        }
        Ok(())
    }

    fn clean_candidates(&self, empty: bool) -> Result<Vec<MachineDoc>, CoreError> {
        let mut conditions = vec![
            is_alive(),
            Condition::eq(CLEAN_FIELD, true),
            Condition::eq("series", self.doc.series.as_str()),
            Condition::contains(JOBS_FIELD, MachineJob::HostUnits.as_str()),
            Condition::not_contains(JOBS_FIELD, MachineJob::ManageModel.as_str()),
        ];
        if empty {
            conditions.push(Condition::size(CONTAINERS_FIELD, 0));
        }
        Ok(self
            .st
            .find::<MachineDoc>(MACHINES, conditions)?
            .into_iter()
            .map(|v| v.doc)
            .collect())
    }

    /// Try each clean candidate with a single batch; a losing race just
    /// moves on. The pool is re-queried when exhausted, and a new machine
    /// is created once no candidates remain.
    fn assign_to_clean_machine(&mut self, empty: bool) -> Result<(), CoreError> {
        let rounds = self.st.runner().retry_config().max_attempts;
        for round in 0..rounds {
            self.refresh()?;
            self.check_unassigned()?;
            let candidates = self.clean_candidates(empty)?;
            if candidates.is_empty() {
                break;
            }
            debug!(
                "round {round}: {} clean machine(s) for unit {}",
                candidates.len(),
                self.doc.name
            );
            for machine in candidates {
                if check_assignable(&self.doc, &machine).is_err() {
                    continue;
                }
                let mut extra = vec![Condition::eq(CLEAN_FIELD, true)];
                if empty {
                    extra.push(Condition::size(CONTAINERS_FIELD, 0));
                }
                let ops = [
                    unit_assign_op(&self.st, &self.doc, &machine.id),
                    machine_assign_op(&self.st, &self.doc, &machine, extra),
                ];
                match self.st.run_raw(&ops)? {
                    BatchOutcome::Applied => {
                        self.refresh()?;
                        info!("assigned unit {} to clean machine {}", self.doc.name, machine.id);
                        return Ok(());
                    }
                    BatchOutcome::Aborted { reason, .. } => {
                        debug!("machine {} taken: {reason}", machine.id);
                        self.refresh()?;
                        self.check_unassigned()?;
                    }
                }
            }
        }
        self.assign_to_new_machine().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::{AddApplicationArgs, StorageDirective};
    use crate::lifecycle::AgentLiving;

    fn setup(storage: Vec<StorageDirective>) -> (Arc<State>, Unit) {
        let st = State::builder("m").open().unwrap();
        let mut app = st
            .add_application(AddApplicationArgs {
                name: "wordpress".to_owned(),
                series: "jammy".to_owned(),
                storage,
                ..Default::default()
            })
            .unwrap();
        let unit = app.add_unit().unwrap();
        (st, unit)
    }

    #[test]
    fn assign_records_both_sides() {
        let (st, mut unit) = setup(Vec::new());
        let mut m = st.add_machine(MachineTemplate::host("jammy")).unwrap();
        assert!(matches!(unit.assigned_machine_id(), Err(CoreError::NotAssigned(_))));

        unit.assign_to_machine(&mut m).unwrap();
        assert_eq!(unit.assigned_machine_id().unwrap(), "0");
        assert_eq!(m.principals(), ["wordpress/0"]);
        assert!(!m.is_clean());

        // Same machine again is a no-op; another machine is refused.
        unit.assign_to_machine(&mut m).unwrap();
        let mut other = st.add_machine(MachineTemplate::host("jammy")).unwrap();
        assert!(unit.assign_to_machine(&mut other).unwrap_err().is_policy_violation());
    }

    #[test]
    fn policy_checks() {
        let (st, mut unit) = setup(Vec::new());
        let mut focal = st.add_machine(MachineTemplate::host("focal")).unwrap();
        assert!(unit.assign_to_machine(&mut focal).unwrap_err().is_policy_violation());

        let mut manager = st
            .add_machine(MachineTemplate {
                series: "jammy".to_owned(),
                jobs: vec![MachineJob::ManageModel],
                ..Default::default()
            })
            .unwrap();
        assert!(unit.assign_to_machine(&mut manager).unwrap_err().is_policy_violation());

        let mut dying = st.add_machine(MachineTemplate::host("jammy")).unwrap();
        dying.destroy().unwrap();
        assert!(unit.assign_to_machine(&mut dying).unwrap_err().is_not_alive());
    }

    #[test]
    fn static_storage_needs_unprovisioned_machine() {
        let (st, mut unit) = setup(vec![StorageDirective {
            name: "data".to_owned(),
            dynamic: false,
        }]);
        let mut m = st.add_machine(MachineTemplate::host("jammy")).unwrap();
        m.set_provisioned("i-1").unwrap();
        assert!(unit.assign_to_machine(&mut m).unwrap_err().is_policy_violation());
        let mut fresh = st.add_machine(MachineTemplate::host("jammy")).unwrap();
        unit.assign_to_machine(&mut fresh).unwrap();
    }

    #[test]
    fn assign_local_uses_machine_zero() {
        let (st, mut unit) = setup(Vec::new());
        st.add_machine(MachineTemplate::host("jammy")).unwrap();
        st.assign_unit(&mut unit, AssignmentPolicy::AssignLocal).unwrap();
        assert_eq!(unit.assigned_machine_id().unwrap(), "0");
    }

    #[test]
    fn assign_new_creates_dirty_machine() {
        let (st, mut unit) = setup(Vec::new());
        st.assign_unit(&mut unit, AssignmentPolicy::AssignNew).unwrap();
        let id = unit.assigned_machine_id().unwrap();
        let m = st.machine(&id).unwrap();
        assert_eq!(m.principals(), ["wordpress/0"]);
        assert_eq!(m.series(), "jammy");
        assert!(!m.is_clean());
    }

    #[test]
    fn assign_clean_prefers_existing_clean_machine() {
        let (st, mut unit) = setup(Vec::new());
        let mut used = st.add_machine(MachineTemplate::host("jammy")).unwrap();
        let clean = st.add_machine(MachineTemplate::host("jammy")).unwrap();
        let mut app = st.application("wordpress").unwrap();
        let mut first = app.add_unit().unwrap();
        first.assign_to_machine(&mut used).unwrap();

        st.assign_unit(&mut unit, AssignmentPolicy::AssignClean).unwrap();
        assert_eq!(unit.assigned_machine_id().unwrap(), clean.id().as_str());
    }

    #[test]
    fn assign_clean_empty_skips_container_hosts() {
        let (st, mut unit) = setup(Vec::new());
        st.add_machine(MachineTemplate::host("jammy")).unwrap();
        st.add_container("0", "lxd", MachineTemplate::default()).unwrap();
        st.assign_unit(&mut unit, AssignmentPolicy::AssignCleanEmpty).unwrap();
        // Machine 0 hosts a container, the container itself is clean and empty.
        assert_eq!(unit.assigned_machine_id().unwrap(), "0/lxd/0");
    }

    #[test]
    fn assign_clean_falls_back_to_new_machine() {
        let (st, mut unit) = setup(Vec::new());
        st.assign_unit(&mut unit, AssignmentPolicy::AssignClean).unwrap();
        assert_eq!(unit.assigned_machine_id().unwrap(), "0");
        assert_eq!(st.all_machines().unwrap().len(), 1);
    }

    #[test]
    fn container_assignment_and_unassign() {
        let (st, mut unit) = setup(Vec::new());
        st.add_machine(MachineTemplate::host("jammy")).unwrap();
        let id = unit.assign_to_new_container("0", "lxd").unwrap();
        assert_eq!(id, "0/lxd/0");
        assert_eq!(st.machine("0").unwrap().containers(), ["0/lxd/0"]);

        unit.unassign_from_machine().unwrap();
        assert!(matches!(unit.assigned_machine_id(), Err(CoreError::NotAssigned(_))));
        assert!(st.machine("0/lxd/0").unwrap().principals().is_empty());
        unit.unassign_from_machine().unwrap();
    }

    #[test]
    fn subordinates_follow_their_principal() {
        let (st, mut unit) = setup(Vec::new());
        let mut logging = st
            .add_application(AddApplicationArgs {
                name: "logging".to_owned(),
                series: "jammy".to_owned(),
                subordinate: true,
                ..Default::default()
            })
            .unwrap();
        let mut sub = logging.add_subordinate_unit(&mut unit).unwrap();
        assert!(matches!(sub.assigned_machine_id(), Err(CoreError::NotAssigned(_))));
        assert!(st
            .assign_unit(&mut sub, AssignmentPolicy::AssignNew)
            .unwrap_err()
            .is_policy_violation());

        st.assign_unit(&mut unit, AssignmentPolicy::AssignNew).unwrap();
        assert_eq!(sub.assigned_machine_id().unwrap(), "0");
    }

    #[test]
    fn removing_last_unit_cascades_host_machine() {
        let (st, mut unit) = setup(Vec::new());
        st.assign_unit(&mut unit, AssignmentPolicy::AssignNew).unwrap();
        unit.set_agent_status(crate::Status::Idle, "").unwrap();
        unit.destroy().unwrap();
        unit.ensure_dead().unwrap();
        unit.remove().unwrap();

        let m = st.machine("0").unwrap();
        assert_eq!(m.life(), Life::Dying);
        assert!(m.principals().is_empty());
    }

    #[test]
    fn shared_host_is_left_alone() {
        let (st, mut unit) = setup(Vec::new());
        let mut m = st.add_machine(MachineTemplate::host("jammy")).unwrap();
        let mut app = st.application("wordpress").unwrap();
        let mut second = app.add_unit().unwrap();
        unit.assign_to_machine(&mut m).unwrap();
        second.assign_to_machine(&mut m).unwrap();

        unit.destroy().unwrap();
        m.refresh().unwrap();
        assert_eq!(m.life(), Life::Alive);
        assert_eq!(m.principals(), ["wordpress/1"]);
    }
}
