use crate::application::{application_release_ops, ApplicationDoc, RELATION_COUNT_FIELD};
use crate::collections::{APPLICATIONS, REFCOUNTS, RELATIONS, RELATION_SCOPES, SETTINGS, UNITS};
use crate::lifecycle::{advance_life, is_alive, is_dying, Life, Living};
use crate::offers::offer_connection_cleanup_ops;
use crate::refcount::{Refcounts, REFCOUNT_FIELD};
use crate::relation_networks::relation_networks_cleanup_ops;
use crate::settings::{create_settings_op, remove_settings_op, replace_settings_op};
use crate::state::{State, Versioned, MODEL_UUID_FIELD};
use crate::unit::{Unit, UnitDoc};
use crate::CoreError;
use corral_schema::{ApplicationName, RelationKey, UnitName};
use corral_store::{Assert, Condition, Op, Update};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationRole {
    Provider,
    Requirer,
    Peer,
}

impl RelationRole {
    fn counterpart(self) -> RelationRole {
        match self {
            RelationRole::Provider => RelationRole::Requirer,
            RelationRole::Requirer => RelationRole::Provider,
            RelationRole::Peer => RelationRole::Peer,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationScope {
    Global,
    Container,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub application: ApplicationName,
    pub name: String,
    pub role: RelationRole,
    pub scope: RelationScope,
}

impl Endpoint {
    pub fn new(application: &str, name: &str, role: RelationRole) -> Self {
        Self {
            application: ApplicationName::new(application),
            name: name.to_owned(),
            role,
            scope: RelationScope::Global,
        }
    }

    #[must_use]
    pub fn container_scoped(mut self) -> Self {
        self.scope = RelationScope::Container;
        self
    }

    fn can_relate_to(&self, other: &Endpoint) -> bool {
        self.application != other.application
            && self.role != RelationRole::Peer
            && self.role.counterpart() == other.role
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.application, self.name)
    }
}

/// Sorted `app:endpoint` parts joined by a space.
pub fn relation_key(endpoints: &[Endpoint]) -> RelationKey {
    let mut parts: Vec<String> = endpoints.iter().map(ToString::to_string).collect();
    parts.sort();
    RelationKey::new(parts.join(" "))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationDoc {
    pub model_uuid: String,
    pub key: RelationKey,
    pub id: u64,
    pub endpoints: Vec<Endpoint>,
    /// Distinct application names, for queries.
    pub applications: Vec<String>,
    pub life: Life,
}

fn scope_refcount_key(key: &RelationKey) -> String {
    format!("relation-scope#{key}")
}

/// Scope document and per-unit relation settings share this key.
fn unit_scope_key(relation_id: u64, unit: &UnitName) -> String {
    format!("r#{relation_id}#{unit}")
}

/// Keys of the relations `unit` is in scope of.
pub(crate) fn scopes_of_unit(st: &State, unit: &str) -> Result<Vec<String>, CoreError> {
    Ok(st
        .find::<Value>(RELATION_SCOPES, vec![Condition::eq("unit", unit)])?
        .into_iter()
        .filter_map(|v| v.doc["relation"].as_str().map(str::to_owned))
        .collect())
}

#[derive(Debug)]
pub struct Relation {
    st: Arc<State>,
    doc: RelationDoc,
    revno: u64,
}

impl State {
    /// Relate two compatible endpoints, or a single peer endpoint.
    pub fn add_relation(self: &Arc<Self>, endpoints: &[Endpoint]) -> Result<Relation, CoreError> {
        let mut endpoints = endpoints.to_vec();
        match endpoints.as_slice() {
            [peer] if peer.role == RelationRole::Peer => {}
            [a, b] if a.can_relate_to(b) => {}
            _ => {
                let names: Vec<String> = endpoints.iter().map(ToString::to_string).collect();
                return Err(CoreError::InvalidArgument(format!(
                    "cannot relate endpoints {}",
                    names.join(", ")
                )));
            }
        }
        if endpoints.iter().any(|e| e.scope == RelationScope::Container) {
            for e in &mut endpoints {
                e.scope = RelationScope::Container;
            }
        }
        let key = relation_key(&endpoints);
        let mut applications: Vec<String> =
            endpoints.iter().map(|e| e.application.to_string()).collect();
        applications.dedup();
        let id = self.sequence("relation")?;
        let doc = RelationDoc {
            model_uuid: self.model_uuid().to_string(),
            key: key.clone(),
            id,
            endpoints,
            applications,
            life: Life::Alive,
        };

        self.run(|attempt| {
            if attempt > 0 && self.get::<RelationDoc>(RELATIONS, &key)?.is_some() {
                return Err(CoreError::AlreadyExists {
                    kind: "relation",
                    id: key.to_string(),
                });
            }
            let mut ops = vec![
                Op::insert(RELATIONS, self.doc_id(&key), State::to_body(&doc)?),
                Refcounts::create_op(self, &scope_refcount_key(&key)),
            ];
            for app in &doc.applications {
                let current = self
                    .get::<ApplicationDoc>(APPLICATIONS, app)?
                    .ok_or_else(|| CoreError::not_found("application", app.as_str()))?;
                if current.doc.life != Life::Alive {
                    return Err(CoreError::not_alive("application", app.as_str()));
                }
                ops.push(
                    Op::update(
                        APPLICATIONS,
                        self.doc_id(app),
                        vec![Update::inc(RELATION_COUNT_FIELD, 1)],
                    )
                    .with_assert(Assert::Matches(vec![is_alive()])),
                );
            }
            Ok(ops)
        })?;
        info!("added relation {key} (id {id})");
        self.relation(&key)
    }

    pub fn relation(self: &Arc<Self>, key: &str) -> Result<Relation, CoreError> {
        let v = self
            .get::<RelationDoc>(RELATIONS, key)?
            .ok_or_else(|| CoreError::not_found("relation", key))?;
        Ok(Relation::from_versioned(Arc::clone(self), v))
    }

    pub fn relation_by_id(self: &Arc<Self>, id: u64) -> Result<Relation, CoreError> {
        self.find::<RelationDoc>(RELATIONS, vec![Condition::eq("id", id)])?
            .into_iter()
            .next()
            .map(|v| Relation::from_versioned(Arc::clone(self), v))
            .ok_or_else(|| CoreError::not_found("relation", id.to_string()))
    }

    pub fn all_relations(self: &Arc<Self>) -> Result<Vec<Relation>, CoreError> {
        Ok(self
            .find::<RelationDoc>(RELATIONS, Vec::new())?
            .into_iter()
            .map(|v| Relation::from_versioned(Arc::clone(self), v))
            .collect())
    }
}

impl Relation {
    fn from_versioned(st: Arc<State>, v: Versioned<RelationDoc>) -> Self {
        Self {
            st,
            doc: v.doc,
            revno: v.revno,
        }
    }

    pub(crate) fn for_application(
        st: &Arc<State>,
        app: &ApplicationName,
    ) -> Result<Vec<Relation>, CoreError> {
        Ok(st
            .find::<RelationDoc>(
                RELATIONS,
                vec![Condition::contains("applications", app.as_str())],
            )?
            .into_iter()
            .map(|v| Relation::from_versioned(Arc::clone(st), v))
            .collect())
    }

    pub fn key(&self) -> &RelationKey {
        &self.doc.key
    }

    pub fn id(&self) -> u64 {
        self.doc.id
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.doc.endpoints
    }

    pub fn endpoint(&self, application: &str) -> Result<&Endpoint, CoreError> {
        self.doc
            .endpoints
            .iter()
            .find(|e| e.application == application)
            .ok_or_else(|| {
                CoreError::InvalidArgument(format!(
                    "application {application} is not in relation {}",
                    self.doc.key
                ))
            })
    }

    pub fn revno(&self) -> u64 {
        self.revno
    }

    /// Units currently in scope.
    pub fn unit_count(&self) -> Result<i64, CoreError> {
        Ok(Refcounts::read(&self.st, &scope_refcount_key(&self.doc.key))?.0)
    }

    /// The relation as seen by `unit`.
    pub fn unit(&self, unit: &Unit) -> Result<RelationUnit, CoreError> {
        let endpoint = self.endpoint(unit.application_name())?.clone();
        Ok(RelationUnit {
            st: Arc::clone(&self.st),
            relation: self.doc.key.clone(),
            relation_id: self.doc.id,
            unit: unit.name().clone(),
            endpoint,
        })
    }

    /// Operations destroying the relation. Returns whether it is removed
    /// outright; otherwise it goes Dying until its last unit leaves scope.
    /// `ignore` names an application whose own batch accounts for the
    /// relation count.
    pub(crate) fn destroy_ops(
        &self,
        ignore: Option<&ApplicationName>,
    ) -> Result<(Vec<Op>, bool), CoreError> {
        if self.doc.life != Life::Alive {
            return Ok((Vec::new(), false));
        }
        let refcount_key = scope_refcount_key(&self.doc.key);
        let (in_scope, check) = Refcounts::read(&self.st, &refcount_key)?;
        let id = self.st.doc_id(&self.doc.key);
        if in_scope == 0 {
            let mut ops = vec![
                Op::remove(RELATIONS, id).with_assert(Assert::Matches(vec![is_alive()])),
                check,
            ];
            if let Some(op) = Refcounts::remove(&self.st, &refcount_key)? {
                ops.push(op);
            }
            ops.extend(self.cleanup_ops(ignore)?);
            return Ok((ops, true));
        }
        Ok((
            vec![
                Op::update(RELATIONS, id, vec![advance_life(self.doc.life, Life::Dying)?])
                    .with_assert(Assert::Matches(vec![is_alive()])),
                Op::check(
                    REFCOUNTS,
                    self.st.doc_id(&refcount_key),
                    Assert::Matches(vec![Condition::gt(REFCOUNT_FIELD, 0)]),
                ),
            ],
            false,
        ))
    }

    /// Releases everything the relation held once its document goes.
    fn cleanup_ops(&self, ignore: Option<&ApplicationName>) -> Result<Vec<Op>, CoreError> {
        let mut ops = Vec::new();
        for app in &self.doc.applications {
            if ignore.is_some_and(|i| i == app) {
                continue;
            }
            if let Some(doc) = self.st.get::<ApplicationDoc>(APPLICATIONS, app)? {
                ops.extend(application_release_ops(&self.st, &doc, 0, 1)?);
            }
        }
        ops.extend(relation_networks_cleanup_ops(&self.st, &self.doc.key)?);
        ops.extend(offer_connection_cleanup_ops(&self.st, &self.doc.key)?);
        Ok(ops)
    }

    fn refresh_or_gone(&mut self) -> Result<bool, CoreError> {
        match self.refresh() {
            Ok(()) => Ok(false),
            Err(e) if e.is_not_found() => Ok(true),
            Err(e) => Err(e),
        }
    }
}

impl Living for Relation {
    fn life(&self) -> Life {
        self.doc.life
    }

    /// Removes the relation when no unit is in scope, otherwise marks it
    /// Dying.
    fn destroy(&mut self) -> Result<(), CoreError> {
        let st = Arc::clone(&self.st);
        st.run(|attempt| {
            if attempt > 0 && self.refresh_or_gone()? {
                return Ok(Vec::new());
            }
            Ok(self.destroy_ops(None)?.0)
        })?;
        if self.doc.life == Life::Alive {
            info!("destroyed relation {}", self.doc.key);
            self.doc.life = Life::Dying;
        }
        Ok(())
    }

    fn refresh(&mut self) -> Result<(), CoreError> {
        let v = self
            .st
            .get::<RelationDoc>(RELATIONS, &self.doc.key)?
            .ok_or_else(|| CoreError::not_found("relation", self.doc.key.as_str()))?;
        self.doc = v.doc;
        self.revno = v.revno;
        Ok(())
    }
}

/// A unit's participation in a relation.
#[derive(Debug)]
pub struct RelationUnit {
    st: Arc<State>,
    relation: RelationKey,
    relation_id: u64,
    unit: UnitName,
    endpoint: Endpoint,
}

impl RelationUnit {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn unit_name(&self) -> &UnitName {
        &self.unit
    }

    fn scope_key(&self) -> String {
        unit_scope_key(self.relation_id, &self.unit)
    }

    pub fn in_scope(&self) -> Result<bool, CoreError> {
        Ok(self.st.get::<Value>(RELATION_SCOPES, &self.scope_key())?.is_some())
    }

    /// The unit's settings for this relation.
    pub fn settings(&self) -> Result<crate::Settings, CoreError> {
        crate::read_settings(&self.st, &self.scope_key())
    }

    /// Join the relation, publishing `settings`. Entering twice is a no-op.
    pub fn enter_scope(&self, settings: &BTreeMap<String, Value>) -> Result<(), CoreError> {
        let st = &self.st;
        let key = self.scope_key();
        let mut entered = false;
        st.run(|_| {
            if st.get::<Value>(RELATION_SCOPES, &key)?.is_some() {
                return Ok(Vec::new());
            }
            let relation = st
                .get::<RelationDoc>(RELATIONS, &self.relation)?
                .ok_or_else(|| CoreError::not_found("relation", self.relation.as_str()))?;
            if relation.doc.life != Life::Alive {
                return Err(CoreError::not_alive("relation", self.relation.as_str()));
            }
            let unit = st
                .get::<UnitDoc>(UNITS, &self.unit)?
                .ok_or_else(|| CoreError::not_found("unit", self.unit.as_str()))?;
            if unit.doc.life != Life::Alive {
                return Err(CoreError::not_alive("unit", self.unit.as_str()));
            }
            let settings_op = if st.get::<Value>(SETTINGS, &key)?.is_some() {
                replace_settings_op(st, &key, settings)
            } else {
                create_settings_op(st, &key, settings)?
            };
            entered = true;
            Ok(vec![
                Op::check(
                    RELATIONS,
                    st.doc_id(&self.relation),
                    Assert::Matches(vec![is_alive()]),
                ),
                // An empty update still bumps the unit's revno, which
                // a concurrent EnsureDead asserts on.
                Op::update(UNITS, st.doc_id(&self.unit), Vec::new())
                    .with_assert(Assert::Matches(vec![is_alive()])),
                Op::insert(
                    RELATION_SCOPES,
                    st.doc_id(&key),
                    json!({
                        MODEL_UUID_FIELD: st.model_uuid().as_str(),
                        "relation": self.relation.as_str(),
                        "unit": self.unit.as_str(),
                    }),
                ),
                Refcounts::strict_inc(st, &scope_refcount_key(&self.relation))?,
                settings_op,
            ])
        })?;
        if entered {
            info!("unit {} entered scope of {}", self.unit, self.relation);
        }
        Ok(())
    }

    /// Leave the relation. The last unit leaving a Dying relation removes
    /// it. Leaving twice is a no-op.
    pub fn leave_scope(&self) -> Result<(), CoreError> {
        let st = &self.st;
        let key = self.scope_key();
        let mut removed_relation = false;
        st.run(|_| {
            removed_relation = false;
            if st.get::<Value>(RELATION_SCOPES, &key)?.is_none() {
                return Ok(Vec::new());
            }
            let mut ops = vec![Op::remove(RELATION_SCOPES, st.doc_id(&key))];
            if let Some(op) = remove_settings_op(st, &key)? {
                ops.push(op);
            }
            let Some(relation) = st.get::<RelationDoc>(RELATIONS, &self.relation)? else {
                return Ok(ops);
            };
            let refcount_key = scope_refcount_key(&self.relation);
            let rel_id = st.doc_id(&self.relation);
            if relation.doc.life == Life::Alive {
                ops.push(Op::check(RELATIONS, rel_id, Assert::Matches(vec![is_alive()])));
                ops.push(Refcounts::alive_dec(st, &refcount_key)?);
                return Ok(ops);
            }
            let (dec, last) = Refcounts::dying_dec(st, &refcount_key)?;
            ops.push(dec);
            if last {
                ops.push(Op::remove(RELATIONS, rel_id).with_assert(Assert::Matches(vec![
                    is_dying(),
                ])));
                let rel = Relation::from_versioned(Arc::clone(st), relation);
                ops.extend(rel.cleanup_ops(None)?);
                removed_relation = true;
            } else {
                ops.push(Op::check(
                    RELATIONS,
                    rel_id,
                    Assert::Matches(vec![is_dying()]),
                ));
            }
            Ok(ops)
        })?;
        info!("unit {} left scope of {}", self.unit, self.relation);
        if removed_relation {
            info!("removed relation {} after its last unit left", self.relation);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::AddApplicationArgs;

    fn state_with_apps() -> Arc<State> {
        let st = State::builder("m").open().unwrap();
        for name in ["wordpress", "mysql"] {
            st.add_application(AddApplicationArgs {
                name: name.to_owned(),
                series: "jammy".to_owned(),
                ..Default::default()
            })
            .unwrap();
        }
        st
    }

    fn db_endpoints() -> [Endpoint; 2] {
        [
            Endpoint::new("wordpress", "db", RelationRole::Requirer),
            Endpoint::new("mysql", "server", RelationRole::Provider),
        ]
    }

    #[test]
    fn keys_are_sorted() {
        assert_eq!(relation_key(&db_endpoints()), "mysql:server wordpress:db");
    }

    #[test]
    fn add_relation_counts_on_both_applications() {
        let st = state_with_apps();
        let rel = st.add_relation(&db_endpoints()).unwrap();
        assert_eq!(rel.id(), 0);
        assert_eq!(rel.unit_count().unwrap(), 0);
        assert_eq!(st.application("wordpress").unwrap().relation_count(), 1);
        assert_eq!(st.application("mysql").unwrap().relation_count(), 1);
        assert_eq!(st.relation_by_id(0).unwrap().key(), rel.key());

        let err = st.add_relation(&db_endpoints()).unwrap_err();
        assert!(err.is_already_exists());
    }

    #[test]
    fn incompatible_endpoints_are_rejected() {
        let st = state_with_apps();
        let err = st
            .add_relation(&[
                Endpoint::new("wordpress", "db", RelationRole::Requirer),
                Endpoint::new("mysql", "db", RelationRole::Requirer),
            ])
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument(_)));
    }

    #[test]
    fn relating_a_dying_application_fails() {
        let st = state_with_apps();
        let mut mysql = st.application("mysql").unwrap();
        mysql.add_unit().unwrap();
        mysql.destroy().unwrap();
        assert!(st.add_relation(&db_endpoints()).unwrap_err().is_not_alive());
        assert_eq!(st.application("wordpress").unwrap().relation_count(), 0);
    }

    #[test]
    fn destroy_without_units_removes() {
        let st = state_with_apps();
        let mut rel = st.add_relation(&db_endpoints()).unwrap();
        rel.destroy().unwrap();
        assert!(rel.refresh().unwrap_err().is_not_found());
        assert_eq!(st.application("wordpress").unwrap().relation_count(), 0);
        assert!(st.all_relations().unwrap().is_empty());
        rel.destroy().unwrap();
    }

    #[test]
    fn enter_and_leave_scope() {
        let st = state_with_apps();
        let rel = st.add_relation(&db_endpoints()).unwrap();
        let unit = st.application("wordpress").unwrap().add_unit().unwrap();
        let ru = rel.unit(&unit).unwrap();
        assert_eq!(ru.endpoint().name, "db");

        let mut settings = BTreeMap::new();
        settings.insert("host".to_owned(), json!("10.0.0.1"));
        ru.enter_scope(&settings).unwrap();
        ru.enter_scope(&settings).unwrap();
        assert!(ru.in_scope().unwrap());
        assert_eq!(rel.unit_count().unwrap(), 1);
        assert_eq!(ru.settings().unwrap().get("host"), Some(&json!("10.0.0.1")));

        ru.leave_scope().unwrap();
        ru.leave_scope().unwrap();
        assert!(!ru.in_scope().unwrap());
        assert_eq!(rel.unit_count().unwrap(), 0);
        assert!(ru.settings().unwrap_err().is_not_found());
    }

    #[test]
    fn dying_relation_refuses_new_units() {
        let st = state_with_apps();
        let mut rel = st.add_relation(&db_endpoints()).unwrap();
        let mut wp = st.application("wordpress").unwrap();
        let u0 = wp.add_unit().unwrap();
        let u1 = wp.add_unit().unwrap();
        rel.unit(&u0).unwrap().enter_scope(&BTreeMap::new()).unwrap();
        rel.destroy().unwrap();
        rel.refresh().unwrap();
        assert_eq!(rel.life(), Life::Dying);
        let err = rel.unit(&u1).unwrap().enter_scope(&BTreeMap::new()).unwrap_err();
        assert!(err.is_not_alive());
    }

    #[test]
    fn unit_from_other_application_is_rejected() {
        let st = State::builder("m").open().unwrap();
        for name in ["wordpress", "mysql", "redis"] {
            st.add_application(AddApplicationArgs {
                name: name.to_owned(),
                series: "jammy".to_owned(),
                ..Default::default()
            })
            .unwrap();
        }
        let rel = st.add_relation(&db_endpoints()).unwrap();
        let unit = st.application("redis").unwrap().add_unit().unwrap();
        assert!(rel.unit(&unit).is_err());
    }
}
