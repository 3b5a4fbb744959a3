use crate::collections::{APPLICATIONS, UNITS};
use crate::lifecycle::{advance_life, is_alive, is_dying, Life, Living};
use crate::refcount::Refcounts;
use crate::relation::Relation;
use crate::settings::{create_settings_op, remove_settings_op};
use crate::state::{State, Versioned};
use crate::status::{agent_status_key, create_status_op, Status, StatusDoc};
use crate::unit::{Unit, UnitDoc};
use crate::CoreError;
use corral_schema::{validate_application_name, ApplicationName, UnitName};
use corral_store::{Assert, Condition, Op, Update};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

pub const UNIT_COUNT_FIELD: &str = "unit_count";
pub const RELATION_COUNT_FIELD: &str = "relation_count";

/// A storage requirement. Dynamic storage can be attached to an
/// already-provisioned machine; static storage cannot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageDirective {
    pub name: String,
    pub dynamic: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationDoc {
    pub model_uuid: String,
    pub name: ApplicationName,
    pub series: String,
    pub subordinate: bool,
    pub charm_url: String,
    pub life: Life,
    pub unit_count: i64,
    pub relation_count: i64,
    pub storage: Vec<StorageDirective>,
}

#[derive(Debug, Clone, Default)]
pub struct AddApplicationArgs {
    pub name: String,
    pub series: String,
    pub subordinate: bool,
    pub charm_url: String,
    pub storage: Vec<StorageDirective>,
}

pub(crate) fn config_settings_key(name: &ApplicationName) -> String {
    format!("a#{name}")
}

pub(crate) fn offers_refcount_key(name: &ApplicationName) -> String {
    format!("offers#{name}")
}

#[derive(Debug)]
pub struct Application {
    st: Arc<State>,
    doc: ApplicationDoc,
    revno: u64,
}

impl State {
    pub fn add_application(
        self: &Arc<Self>,
        args: AddApplicationArgs,
    ) -> Result<Application, CoreError> {
        validate_application_name(&args.name)?;
        if args.series.is_empty() {
            return Err(CoreError::InvalidArgument(format!(
                "application {} has no series",
                args.name
            )));
        }
        let name = ApplicationName::new(args.name);
        let doc = ApplicationDoc {
            model_uuid: self.model_uuid().to_string(),
            name: name.clone(),
            series: args.series,
            subordinate: args.subordinate,
            charm_url: args.charm_url,
            life: Life::Alive,
            unit_count: 0,
            relation_count: 0,
            storage: args.storage,
        };
        self.run(|attempt| {
            if attempt > 0 && self.get::<ApplicationDoc>(APPLICATIONS, &name)?.is_some() {
                return Err(CoreError::AlreadyExists {
                    kind: "application",
                    id: name.to_string(),
                });
            }
            Ok(vec![
                Op::insert(APPLICATIONS, self.doc_id(&name), State::to_body(&doc)?),
                create_settings_op(self, &config_settings_key(&name), &BTreeMap::new())?,
            ])
        })?;
        info!("added application {name}");
        self.application(&name)
    }

    pub fn application(self: &Arc<Self>, name: &str) -> Result<Application, CoreError> {
        let v = self
            .get::<ApplicationDoc>(APPLICATIONS, name)?
            .ok_or_else(|| CoreError::not_found("application", name))?;
        Ok(Application {
            st: Arc::clone(self),
            doc: v.doc,
            revno: v.revno,
        })
    }

    pub fn all_applications(self: &Arc<Self>) -> Result<Vec<Application>, CoreError> {
        Ok(self
            .find::<ApplicationDoc>(APPLICATIONS, Vec::new())?
            .into_iter()
            .map(|v| Application {
                st: Arc::clone(self),
                doc: v.doc,
                revno: v.revno,
            })
            .collect())
    }
}

/// Operations releasing `units` unit references and `relations` relation
/// references on an application, removing it when it is Dying and these
/// were its last references.
pub(crate) fn application_release_ops(
    st: &State,
    app: &Versioned<ApplicationDoc>,
    units: i64,
    relations: i64,
) -> Result<Vec<Op>, CoreError> {
    let doc = &app.doc;
    let id = st.doc_id(&doc.name);
    let last = doc.life == Life::Dying
        && doc.unit_count - units <= 0
        && doc.relation_count - relations <= 0;
    if last {
        let mut ops = vec![Op::remove(APPLICATIONS, id).with_assert(Assert::Matches(vec![
            is_dying(),
            Condition::eq(UNIT_COUNT_FIELD, doc.unit_count),
            Condition::eq(RELATION_COUNT_FIELD, doc.relation_count),
        ]))];
        ops.extend(application_cleanup_ops(st, &doc.name)?);
        return Ok(ops);
    }

    let mut updates = Vec::new();
    if units != 0 {
        updates.push(Update::inc(UNIT_COUNT_FIELD, -units));
    }
    if relations != 0 {
        updates.push(Update::inc(RELATION_COUNT_FIELD, -relations));
    }
    if updates.is_empty() {
        return Ok(Vec::new());
    }
    let assert = if doc.life == Life::Alive {
        Assert::Matches(vec![is_alive()])
    } else {
        // A dying application must notice whichever release is the last.
        Assert::Matches(vec![
            is_dying(),
            Condition::eq(UNIT_COUNT_FIELD, doc.unit_count),
            Condition::eq(RELATION_COUNT_FIELD, doc.relation_count),
        ])
    };
    Ok(vec![Op::update(APPLICATIONS, id, updates).with_assert(assert)])
}

/// Documents owned by an application that go away with it.
fn application_cleanup_ops(st: &State, name: &ApplicationName) -> Result<Vec<Op>, CoreError> {
    let mut ops = Vec::new();
    if let Some(op) = remove_settings_op(st, &config_settings_key(name))? {
        ops.push(op);
    }
    if let Some(op) = Refcounts::remove(st, &offers_refcount_key(name))? {
        ops.push(op);
    }
    Ok(ops)
}

impl Application {
    pub fn name(&self) -> &ApplicationName {
        &self.doc.name
    }

    pub fn series(&self) -> &str {
        &self.doc.series
    }

    pub fn is_subordinate(&self) -> bool {
        self.doc.subordinate
    }

    pub fn charm_url(&self) -> &str {
        &self.doc.charm_url
    }

    pub fn unit_count(&self) -> i64 {
        self.doc.unit_count
    }

    pub fn relation_count(&self) -> i64 {
        self.doc.relation_count
    }

    pub fn storage(&self) -> &[StorageDirective] {
        &self.doc.storage
    }

    pub fn revno(&self) -> u64 {
        self.revno
    }

    pub fn all_units(&self) -> Result<Vec<Unit>, CoreError> {
        Ok(self
            .st
            .find::<UnitDoc>(
                UNITS,
                vec![Condition::eq("application", self.doc.name.as_str())],
            )?
            .into_iter()
            .map(|v| Unit::from_versioned(Arc::clone(&self.st), v))
            .collect())
    }

    pub fn relations(&self) -> Result<Vec<Relation>, CoreError> {
        Relation::for_application(&self.st, &self.doc.name)
    }

    fn new_unit_doc(&self, name: UnitName, principal: Option<&Unit>) -> UnitDoc {
        UnitDoc {
            model_uuid: self.st.model_uuid().to_string(),
            name,
            application: self.doc.name.clone(),
            series: self.doc.series.clone(),
            principal: principal.map(|p| p.name().to_string()).unwrap_or_default(),
            subordinates: Vec::new(),
            machine_id: principal
                .and_then(|p| p.machine_id().map(|m| m.to_string()))
                .unwrap_or_default(),
            life: Life::Alive,
            storage: self.doc.storage.clone(),
        }
    }

    fn next_unit_name(&self) -> Result<UnitName, CoreError> {
        let n = self.st.sequence(&format!("application-{}", self.doc.name))?;
        Ok(UnitName::new(format!("{}/{n}", self.doc.name)))
    }

    fn add_unit_ops(&self, unit: &UnitDoc) -> Result<Vec<Op>, CoreError> {
        let status = StatusDoc::new(self.st.model_uuid(), Status::Allocating, "waiting for agent");
        Ok(vec![
            Op::update(
                APPLICATIONS,
                self.st.doc_id(&self.doc.name),
                vec![Update::inc(UNIT_COUNT_FIELD, 1)],
            )
            .with_assert(Assert::Matches(vec![is_alive()])),
            Op::insert(UNITS, self.st.doc_id(&unit.name), State::to_body(unit)?),
            create_status_op(&self.st, &agent_status_key(&unit.name), &status)?,
        ])
    }

    /// Add a principal unit with an `allocating` agent status.
    pub fn add_unit(&mut self) -> Result<Unit, CoreError> {
        if self.doc.subordinate {
            return Err(CoreError::policy(
                format!("add unit to application {}", self.doc.name),
                "application is subordinate",
            ));
        }
        if self.doc.life != Life::Alive {
            return Err(CoreError::not_alive("application", self.doc.name.as_str()));
        }
        let name = self.next_unit_name()?;
        let st = Arc::clone(&self.st);
        st.run(|attempt| {
            if attempt > 0 {
                self.refresh()?;
                if self.doc.life != Life::Alive {
                    return Err(CoreError::not_alive("application", self.doc.name.as_str()));
                }
            }
            let unit = self.new_unit_doc(name.clone(), None);
            self.add_unit_ops(&unit)
        })?;
        info!("added unit {name}");
        self.refresh()?;
        st.unit(&name)
    }

    /// Add a subordinate unit of this application to `principal`.
    pub fn add_subordinate_unit(&mut self, principal: &mut Unit) -> Result<Unit, CoreError> {
        if !self.doc.subordinate {
            return Err(CoreError::policy(
                format!("add subordinate unit to application {}", self.doc.name),
                "application is not subordinate",
            ));
        }
        if !principal.is_principal() {
            return Err(CoreError::policy(
                format!("add subordinate of {} to {}", self.doc.name, principal.name()),
                "unit is itself a subordinate",
            ));
        }
        let name = self.next_unit_name()?;
        let st = Arc::clone(&self.st);
        st.run(|attempt| {
            if attempt > 0 {
                self.refresh()?;
                principal.refresh()?;
            }
            if self.doc.life != Life::Alive {
                return Err(CoreError::not_alive("application", self.doc.name.as_str()));
            }
            if principal.life() != Life::Alive {
                return Err(CoreError::not_alive("unit", principal.name().as_str()));
            }
            let app_prefix = format!("{}/", self.doc.name);
            if principal
                .subordinate_names()
                .iter()
                .any(|s| s.starts_with(&app_prefix))
            {
                return Err(CoreError::AlreadyExists {
                    kind: "subordinate",
                    id: format!("{} on {}", self.doc.name, principal.name()),
                });
            }
            let unit = self.new_unit_doc(name.clone(), Some(&*principal));
            let mut ops = self.add_unit_ops(&unit)?;
            ops.push(
                Op::update(
                    UNITS,
                    self.st.doc_id(principal.name()),
                    vec![Update::add_to_set("subordinates", name.as_str())],
                )
                .with_assert(Assert::Revno(principal.revno())),
            );
            Ok(ops)
        })?;
        info!("added subordinate unit {name} to {}", principal.name());
        self.refresh()?;
        principal.refresh()?;
        st.unit(&name)
    }

    fn destroy_ops(&self) -> Result<Vec<Op>, CoreError> {
        let (offers, offers_check) =
            Refcounts::read(&self.st, &offers_refcount_key(&self.doc.name))?;
        if offers > 0 {
            return Err(CoreError::has_dependents(
                "application",
                self.doc.name.as_str(),
                format!("application has {offers} offer(s)"),
            ));
        }
        let mut ops = vec![offers_check];
        let mut removed = 0;
        for relation in self.relations()? {
            let (relation_ops, gone) = relation.destroy_ops(Some(&self.doc.name))?;
            ops.extend(relation_ops);
            if gone {
                removed += 1;
            }
        }

        let id = self.st.doc_id(&self.doc.name);
        let counts = vec![
            is_alive(),
            Condition::eq(UNIT_COUNT_FIELD, self.doc.unit_count),
            Condition::eq(RELATION_COUNT_FIELD, self.doc.relation_count),
        ];
        if self.doc.unit_count == 0 && self.doc.relation_count == removed {
            ops.push(Op::remove(APPLICATIONS, id).with_assert(Assert::Matches(counts)));
            ops.extend(application_cleanup_ops(&self.st, &self.doc.name)?);
        } else {
            let mut updates = vec![advance_life(self.doc.life, Life::Dying)?];
            if removed > 0 {
                updates.push(Update::inc(RELATION_COUNT_FIELD, -removed));
            }
            ops.push(Op::update(APPLICATIONS, id, updates).with_assert(Assert::Matches(counts)));
        }
        Ok(ops)
    }
}

impl Living for Application {
    fn life(&self) -> Life {
        self.doc.life
    }

    /// Destroys the application's relations in the same batch; removes the
    /// application at once when no units remain and every relation went
    /// with it, otherwise leaves it Dying.
    fn destroy(&mut self) -> Result<(), CoreError> {
        let st = Arc::clone(&self.st);
        let mut gone = false;
        st.run(|attempt| {
            if attempt > 0 {
                match self.refresh() {
                    Err(e) if e.is_not_found() => {
                        gone = true;
                        return Ok(Vec::new());
                    }
                    other => other?,
                }
            }
            if self.doc.life != Life::Alive {
                return Ok(Vec::new());
            }
            self.destroy_ops()
        })?;
        if !gone {
            info!("destroyed application {}", self.doc.name);
        }
        self.doc.life = Life::Dying;
        Ok(())
    }

    fn refresh(&mut self) -> Result<(), CoreError> {
        let v = self
            .st
            .get::<ApplicationDoc>(APPLICATIONS, &self.doc.name)?
            .ok_or_else(|| CoreError::not_found("application", self.doc.name.as_str()))?;
        self.doc = v.doc;
        self.revno = v.revno;
        Ok(())
    }
}
