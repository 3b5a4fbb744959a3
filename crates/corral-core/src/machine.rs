use crate::collections::{MACHINES, UNITS};
use crate::lifecycle::{advance_life, is_alive, is_dead, not_dead, AgentLiving, Life, Living};
use crate::state::{State, Versioned};
use crate::unit::{UnitDoc, MACHINE_ID_FIELD};
use crate::CoreError;
use corral_schema::MachineId;
use corral_store::{Assert, Condition, Op, Update};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

pub const PRINCIPALS_FIELD: &str = "principals";
pub const CONTAINERS_FIELD: &str = "containers";
pub const CLEAN_FIELD: &str = "clean";
pub const HAS_VOTE_FIELD: &str = "has_vote";
pub const JOBS_FIELD: &str = "jobs";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MachineJob {
    HostUnits,
    ManageModel,
}

impl MachineJob {
    pub fn as_str(self) -> &'static str {
        match self {
            MachineJob::HostUnits => "host-units",
            MachineJob::ManageModel => "manage-model",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineDoc {
    pub model_uuid: String,
    pub id: MachineId,
    pub series: String,
    pub jobs: Vec<MachineJob>,
    pub life: Life,
    pub principals: Vec<String>,
    pub containers: Vec<String>,
    /// True until the machine first hosts a unit.
    pub clean: bool,
    pub has_vote: bool,
    /// Empty until provisioned.
    pub instance_id: String,
    /// `None` when not yet known; any container type is then accepted.
    pub supported_containers: Option<Vec<String>>,
}

/// What a new machine looks like. Empty `jobs` means `host-units` only.
#[derive(Debug, Clone, Default)]
pub struct MachineTemplate {
    pub series: String,
    pub jobs: Vec<MachineJob>,
    pub instance_id: String,
    pub supported_containers: Option<Vec<String>>,
}

impl MachineTemplate {
    pub fn host(series: impl Into<String>) -> Self {
        Self {
            series: series.into(),
            ..Default::default()
        }
    }
}

pub(crate) fn new_machine_doc(
    st: &State,
    id: MachineId,
    template: &MachineTemplate,
) -> Result<MachineDoc, CoreError> {
    if template.series.is_empty() {
        return Err(CoreError::InvalidArgument(format!("machine {id} has no series")));
    }
    let mut jobs = template.jobs.clone();
    if jobs.is_empty() {
        jobs.push(MachineJob::HostUnits);
    }
    jobs.dedup();
    Ok(MachineDoc {
        model_uuid: st.model_uuid().to_string(),
        has_vote: jobs.contains(&MachineJob::ManageModel),
        id,
        series: template.series.clone(),
        jobs,
        life: Life::Alive,
        principals: Vec::new(),
        containers: Vec::new(),
        clean: true,
        instance_id: template.instance_id.clone(),
        supported_containers: template.supported_containers.clone(),
    })
}

pub(crate) fn check_container_type(
    parent: &MachineDoc,
    container_type: &str,
) -> Result<(), CoreError> {
    if container_type.is_empty() || !container_type.bytes().all(|b| b.is_ascii_lowercase()) {
        return Err(CoreError::InvalidArgument(format!(
            "invalid container type '{container_type}'"
        )));
    }
    if let Some(supported) = &parent.supported_containers {
        if !supported.iter().any(|c| c == container_type) {
            return Err(CoreError::policy(
                format!("add {container_type} container to machine {}", parent.id),
                format!("machine does not support {container_type} containers"),
            ));
        }
    }
    Ok(())
}

pub(crate) fn next_container_id(
    st: &State,
    parent: &MachineId,
    container_type: &str,
) -> Result<MachineId, CoreError> {
    let n = st.sequence(&format!("machine{parent}{container_type}"))?;
    Ok(MachineId::new(format!("{parent}/{container_type}/{n}")))
}

pub(crate) fn next_machine_id(st: &State) -> Result<MachineId, CoreError> {
    Ok(MachineId::new(st.sequence("machine")?.to_string()))
}

/// Add `container` to an alive parent's container list.
pub(crate) fn attach_container_op(st: &State, parent: &MachineId, container: &MachineId) -> Op {
    Op::update(
        MACHINES,
        st.doc_id(parent),
        vec![Update::add_to_set(CONTAINERS_FIELD, container.as_str())],
    )
    .with_assert(Assert::Matches(vec![is_alive()]))
}

#[derive(Debug)]
pub struct Machine {
    pub(crate) st: Arc<State>,
    pub(crate) doc: MachineDoc,
    pub(crate) revno: u64,
}

impl State {
    pub fn add_machine(self: &Arc<Self>, template: MachineTemplate) -> Result<Machine, CoreError> {
        let id = next_machine_id(self)?;
        let doc = new_machine_doc(self, id.clone(), &template)?;
        self.run(|_| Ok(vec![Op::insert(MACHINES, self.doc_id(&id), State::to_body(&doc)?)]))?;
        info!("added machine {id}");
        self.machine(&id)
    }

    /// Add a container of `container_type` inside `parent`.
    pub fn add_container(
        self: &Arc<Self>,
        parent: &str,
        container_type: &str,
        mut template: MachineTemplate,
    ) -> Result<Machine, CoreError> {
        let parent = self.machine(parent)?;
        check_container_type(&parent.doc, container_type)?;
        if template.series.is_empty() {
            template.series.clone_from(&parent.doc.series);
        }
        let id = next_container_id(self, &parent.doc.id, container_type)?;
        let doc = new_machine_doc(self, id.clone(), &template)?;
        self.run(|attempt| {
            if attempt > 0 {
                let parent = self
                    .get::<MachineDoc>(MACHINES, &parent.doc.id)?
                    .ok_or_else(|| CoreError::not_found("machine", parent.doc.id.as_str()))?;
                if parent.doc.life != Life::Alive {
                    return Err(CoreError::not_alive("machine", parent.doc.id.as_str()));
                }
            }
            Ok(vec![
                Op::insert(MACHINES, self.doc_id(&id), State::to_body(&doc)?),
                attach_container_op(self, &parent.doc.id, &id),
            ])
        })?;
        info!("added container {id}");
        self.machine(&id)
    }

    pub fn machine(self: &Arc<Self>, id: &str) -> Result<Machine, CoreError> {
        let v = self
            .get::<MachineDoc>(MACHINES, id)?
            .ok_or_else(|| CoreError::not_found("machine", id))?;
        Ok(Machine::from_versioned(Arc::clone(self), v))
    }

    pub fn all_machines(self: &Arc<Self>) -> Result<Vec<Machine>, CoreError> {
        Ok(self
            .find::<MachineDoc>(MACHINES, Vec::new())?
            .into_iter()
            .map(|v| Machine::from_versioned(Arc::clone(self), v))
            .collect())
    }
}

impl Machine {
    pub(crate) fn from_versioned(st: Arc<State>, v: Versioned<MachineDoc>) -> Self {
        Self {
            st,
            doc: v.doc,
            revno: v.revno,
        }
    }

    pub fn id(&self) -> &MachineId {
        &self.doc.id
    }

    pub fn series(&self) -> &str {
        &self.doc.series
    }

    pub fn jobs(&self) -> &[MachineJob] {
        &self.doc.jobs
    }

    pub fn principals(&self) -> &[String] {
        &self.doc.principals
    }

    pub fn containers(&self) -> &[String] {
        &self.doc.containers
    }

    pub fn is_clean(&self) -> bool {
        self.doc.clean
    }

    pub fn has_vote(&self) -> bool {
        self.doc.has_vote
    }

    pub fn instance_id(&self) -> Option<&str> {
        (!self.doc.instance_id.is_empty()).then_some(self.doc.instance_id.as_str())
    }

    pub fn supported_containers(&self) -> Option<&[String]> {
        self.doc.supported_containers.as_deref()
    }

    pub fn parent_id(&self) -> Option<MachineId> {
        self.doc.id.parent()
    }

    pub fn revno(&self) -> u64 {
        self.revno
    }

    pub fn doc(&self) -> &MachineDoc {
        &self.doc
    }

    /// Record the provider instance. Fails with AlreadyExists when the
    /// machine was provisioned before.
    pub fn set_provisioned(&mut self, instance_id: &str) -> Result<(), CoreError> {
        if instance_id.is_empty() {
            return Err(CoreError::InvalidArgument("empty instance id".to_owned()));
        }
        let st = Arc::clone(&self.st);
        st.run(|attempt| {
            if attempt > 0 {
                self.refresh()?;
            }
            if self.doc.life == Life::Dead {
                return Err(CoreError::not_alive("machine", self.doc.id.as_str()));
            }
            if !self.doc.instance_id.is_empty() {
                return Err(CoreError::AlreadyExists {
                    kind: "instance of machine",
                    id: self.doc.id.to_string(),
                });
            }
            Ok(vec![Op::update(
                MACHINES,
                self.st.doc_id(&self.doc.id),
                vec![Update::set("instance_id", instance_id)],
            )
            .with_assert(Assert::Matches(vec![
                not_dead(),
                Condition::eq("instance_id", ""),
            ]))])
        })?;
        self.refresh()
    }

    pub fn set_has_vote(&mut self, vote: bool) -> Result<(), CoreError> {
        self.set_field(HAS_VOTE_FIELD, vote.into())
    }

    pub fn set_supported_containers(&mut self, types: Vec<String>) -> Result<(), CoreError> {
        self.set_field("supported_containers", types.into())
    }

    fn set_field(&mut self, field: &str, value: serde_json::Value) -> Result<(), CoreError> {
        let st = Arc::clone(&self.st);
        st.run(|attempt| {
            if attempt > 0 {
                self.refresh()?;
            }
            if self.doc.life == Life::Dead {
                return Err(CoreError::not_alive("machine", self.doc.id.as_str()));
            }
            Ok(vec![Op::update(
                MACHINES,
                self.st.doc_id(&self.doc.id),
                vec![Update::set(field, value.clone())],
            )
            .with_assert(Assert::Matches(vec![not_dead()]))])
        })?;
        self.refresh()
    }

    fn refresh_or_gone(&mut self) -> Result<bool, CoreError> {
        match self.refresh() {
            Ok(()) => Ok(false),
            Err(e) if e.is_not_found() => Ok(true),
            Err(e) => Err(e),
        }
    }

    fn ensure_dead_ops(&self) -> Result<Vec<Op>, CoreError> {
        let id = self.doc.id.as_str();
        if self.doc.has_vote {
            return Err(CoreError::policy(
                format!("make machine {id} dead"),
                "machine still has a vote",
            ));
        }
        if !self.doc.containers.is_empty() {
            return Err(CoreError::has_dependents(
                "machine",
                id,
                format!("machine hosts containers: {}", self.doc.containers.join(", ")),
            ));
        }
        let mut ops = Vec::new();
        let mut updates = vec![advance_life(self.doc.life, Life::Dead)?];
        for principal in &self.doc.principals {
            match self.st.get::<UnitDoc>(UNITS, principal)? {
                Some(unit) if unit.doc.life != Life::Dead => {
                    return Err(CoreError::has_dependents(
                        "machine",
                        id,
                        format!("unit {principal} is {}", unit.doc.life),
                    ));
                }
                Some(_) => ops.push(
                    Op::update(
                        UNITS,
                        self.st.doc_id(principal),
                        vec![Update::set(MACHINE_ID_FIELD, "")],
                    )
                    .with_assert(Assert::Matches(vec![
                        is_dead(),
                        Condition::eq(MACHINE_ID_FIELD, id),
                    ])),
                ),
                None => {}
            }
            updates.push(Update::pull(PRINCIPALS_FIELD, principal.as_str()));
        }
        ops.push(
            Op::update(MACHINES, self.st.doc_id(id), updates).with_assert(Assert::Matches(vec![
                not_dead(),
                Condition::eq(HAS_VOTE_FIELD, false),
                Condition::size(CONTAINERS_FIELD, 0),
                Condition::size(PRINCIPALS_FIELD, self.doc.principals.len()),
            ])),
        );
        Ok(ops)
    }
}

impl Living for Machine {
    fn life(&self) -> Life {
        self.doc.life
    }

    /// Alive -> Dying. Refused for model managers and for machines that
    /// still host units or containers.
    fn destroy(&mut self) -> Result<(), CoreError> {
        let st = Arc::clone(&self.st);
        st.run(|attempt| {
            if attempt > 0 && self.refresh_or_gone()? {
                return Ok(Vec::new());
            }
            let id = self.doc.id.as_str();
            if self.doc.jobs.contains(&MachineJob::ManageModel) {
                return Err(CoreError::policy(
                    format!("destroy machine {id}"),
                    "machine is required by the model",
                ));
            }
            if self.doc.life != Life::Alive {
                return Ok(Vec::new());
            }
            if !self.doc.principals.is_empty() {
                return Err(CoreError::has_dependents(
                    "machine",
                    id,
                    format!("machine hosts units: {}", self.doc.principals.join(", ")),
                ));
            }
            if !self.doc.containers.is_empty() {
                return Err(CoreError::has_dependents(
                    "machine",
                    id,
                    format!("machine hosts containers: {}", self.doc.containers.join(", ")),
                ));
            }
            Ok(vec![Op::update(
                MACHINES,
                self.st.doc_id(id),
                vec![advance_life(self.doc.life, Life::Dying)?],
            )
            .with_assert(Assert::Matches(vec![
                is_alive(),
                Condition::size(PRINCIPALS_FIELD, 0),
                Condition::size(CONTAINERS_FIELD, 0),
            ]))])
        })?;
        if self.doc.life == Life::Alive {
            info!("destroyed machine {}", self.doc.id);
            self.doc.life = Life::Dying;
        }
        Ok(())
    }

    fn refresh(&mut self) -> Result<(), CoreError> {
        let v = self
            .st
            .get::<MachineDoc>(MACHINES, &self.doc.id)?
            .ok_or_else(|| CoreError::not_found("machine", self.doc.id.as_str()))?;
        self.doc = v.doc;
        self.revno = v.revno;
        Ok(())
    }
}

impl AgentLiving for Machine {
    /// Dead principals are unassigned in the same batch.
    fn ensure_dead(&mut self) -> Result<(), CoreError> {
        let st = Arc::clone(&self.st);
        st.run(|attempt| {
            if attempt > 0 && self.refresh_or_gone()? {
                return Ok(Vec::new());
            }
            if self.doc.life == Life::Dead {
                return Ok(Vec::new());
            }
            self.ensure_dead_ops()
        })?;
        if self.doc.life != Life::Dead {
            info!("machine {} is dead", self.doc.id);
        }
        self.doc.life = Life::Dead;
        Ok(())
    }

    fn remove(&mut self) -> Result<(), CoreError> {
        let st = Arc::clone(&self.st);
        st.run(|attempt| {
            // A stale handle may still say Alive for an entity already gone.
            if (attempt > 0 || self.doc.life != Life::Dead) && self.refresh_or_gone()? {
                return Ok(Vec::new());
            }
            if self.doc.life != Life::Dead {
                return Err(CoreError::NotDead {
                    kind: "machine",
                    id: self.doc.id.to_string(),
                });
            }
            let mut ops = vec![Op::remove(MACHINES, self.st.doc_id(&self.doc.id))
                .with_assert(Assert::Matches(vec![is_dead()]))];
            if let Some(parent) = self.doc.id.parent() {
                if self.st.get::<MachineDoc>(MACHINES, &parent)?.is_some() {
                    ops.push(Op::update(
                        MACHINES,
                        self.st.doc_id(&parent),
                        vec![Update::pull(CONTAINERS_FIELD, self.doc.id.as_str())],
                    ));
                }
            }
            Ok(ops)
        })?;
        info!("removed machine {}", self.doc.id);
        Ok(())
    }
}
