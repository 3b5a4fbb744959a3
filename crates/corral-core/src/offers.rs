//! Applications offered to other models, and the connections made to them.
//!
//! Each offer holds a reference on its application (`offers#<app>`), which
//! keeps the application from being destroyed. Each connection holds a
//! reference on its offer (`offer-connections#<offer-uuid>`), which keeps
//! the offer from being removed unless forced.

use crate::application::{offers_refcount_key, ApplicationDoc};
use crate::collections::{APPLICATIONS, APPLICATION_OFFERS, OFFER_CONNECTIONS};
use crate::lifecycle::{is_alive, Life};
use crate::refcount::Refcounts;
use crate::state::State;
use crate::CoreError;
use corral_schema::{validate_offer_name, ApplicationName, OfferName, RelationKey};
use corral_store::{Assert, Condition, Op, Update};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationOffer {
    pub model_uuid: String,
    pub offer_uuid: String,
    pub offer_name: OfferName,
    pub application_name: ApplicationName,
    pub description: String,
    pub owner: String,
    /// Offered alias to application endpoint name.
    pub endpoints: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct AddOfferArgs {
    pub offer_name: String,
    pub application_name: String,
    pub description: String,
    pub owner: String,
    pub endpoints: BTreeMap<String, String>,
}

/// Matches offers by name substring and exact application. Empty fields
/// match anything.
#[derive(Debug, Clone, Default)]
pub struct OfferFilter {
    pub offer_name: Option<String>,
    pub application_name: Option<String>,
}

impl OfferFilter {
    fn matches(&self, offer: &ApplicationOffer) -> bool {
        self.offer_name
            .as_deref()
            .map_or(true, |n| offer.offer_name.contains(n))
            && self
                .application_name
                .as_deref()
                .map_or(true, |a| offer.application_name == a)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferConnection {
    pub model_uuid: String,
    pub offer_uuid: String,
    pub relation_id: u64,
    pub relation_key: RelationKey,
    pub source_model_uuid: String,
    pub username: String,
}

#[derive(Debug, Clone, Default)]
pub struct AddOfferConnectionArgs {
    pub offer_uuid: String,
    pub relation_id: u64,
    pub relation_key: String,
    pub source_model_uuid: String,
    pub username: String,
}

fn connections_refcount_key(offer_uuid: &str) -> String {
    format!("offer-connections#{offer_uuid}")
}

/// Releases the offer connection carried by a relation being removed.
pub(crate) fn offer_connection_cleanup_ops(
    st: &State,
    relation_key: &RelationKey,
) -> Result<Vec<Op>, CoreError> {
    let Some(conn) = st.get::<OfferConnection>(OFFER_CONNECTIONS, relation_key)? else {
        return Ok(Vec::new());
    };
    let mut ops = vec![Op::remove(OFFER_CONNECTIONS, st.doc_id(relation_key))];
    let refcount = connections_refcount_key(&conn.doc.offer_uuid);
    if Refcounts::read(st, &refcount)?.0 > 0 {
        ops.push(Refcounts::alive_dec(st, &refcount)?);
    }
    Ok(ops)
}

fn validate_args(args: &AddOfferArgs) -> Result<(), CoreError> {
    validate_offer_name(&args.offer_name)?;
    if args.endpoints.is_empty() {
        return Err(CoreError::InvalidArgument(format!(
            "offer {} has no endpoints",
            args.offer_name
        )));
    }
    Ok(())
}

fn alive_application(st: &State, name: &str) -> Result<Op, CoreError> {
    let app = st
        .get::<ApplicationDoc>(APPLICATIONS, name)?
        .ok_or_else(|| CoreError::not_found("application", name))?;
    if app.doc.life != Life::Alive {
        return Err(CoreError::not_alive("application", name));
    }
    Ok(Op::check(
        APPLICATIONS,
        st.doc_id(name),
        Assert::Matches(vec![is_alive()]),
    ))
}

/// Offers and connections of one model.
pub struct ApplicationOffers {
    st: Arc<State>,
}

impl State {
    pub fn application_offers(self: &Arc<Self>) -> ApplicationOffers {
        ApplicationOffers {
            st: Arc::clone(self),
        }
    }
}

impl ApplicationOffers {
    pub fn add_offer(&self, args: AddOfferArgs) -> Result<ApplicationOffer, CoreError> {
        validate_args(&args)?;
        let st = &self.st;
        let offer = ApplicationOffer {
            model_uuid: st.model_uuid().to_string(),
            offer_uuid: uuid::Uuid::new_v4().to_string(),
            offer_name: OfferName::new(args.offer_name),
            application_name: ApplicationName::new(args.application_name),
            description: args.description,
            owner: args.owner,
            endpoints: args.endpoints,
        };
        st.run(|attempt| {
            if attempt > 0
                && st
                    .get::<ApplicationOffer>(APPLICATION_OFFERS, &offer.offer_name)?
                    .is_some()
            {
                return Err(CoreError::AlreadyExists {
                    kind: "offer",
                    id: offer.offer_name.to_string(),
                });
            }
            Ok(vec![
                alive_application(st, &offer.application_name)?,
                Op::insert(
                    APPLICATION_OFFERS,
                    st.doc_id(&offer.offer_name),
                    State::to_body(&offer)?,
                ),
                Refcounts::create_or_inc(st, &offers_refcount_key(&offer.application_name))?,
            ])
        })?;
        info!(
            "offered application {} as {}",
            offer.application_name, offer.offer_name
        );
        Ok(offer)
    }

    /// Change an existing offer. Moving it to another application moves
    /// the application reference with it.
    pub fn update_offer(&self, args: AddOfferArgs) -> Result<ApplicationOffer, CoreError> {
        validate_args(&args)?;
        let st = &self.st;
        let mut updated = None;
        st.run(|_| {
            let current = st
                .get::<ApplicationOffer>(APPLICATION_OFFERS, &args.offer_name)?
                .ok_or_else(|| CoreError::not_found("offer", args.offer_name.as_str()))?;
            let offer = ApplicationOffer {
                application_name: ApplicationName::new(args.application_name.as_str()),
                description: args.description.clone(),
                owner: args.owner.clone(),
                endpoints: args.endpoints.clone(),
                ..current.doc.clone()
            };
            let mut ops = vec![
                alive_application(st, &offer.application_name)?,
                Op::update(
                    APPLICATION_OFFERS,
                    st.doc_id(&offer.offer_name),
                    vec![
                        Update::set("application_name", offer.application_name.as_str()),
                        Update::set("description", offer.description.as_str()),
                        Update::set("owner", offer.owner.as_str()),
                        Update::set("endpoints", serde_json::to_value(&offer.endpoints)?),
                    ],
                )
                .with_assert(Assert::Revno(current.revno)),
            ];
            let old_app = &current.doc.application_name;
            if *old_app != offer.application_name {
                let new_app = offers_refcount_key(&offer.application_name);
                ops.push(Refcounts::create_or_inc(st, &new_app)?);
                if Refcounts::read(st, &offers_refcount_key(old_app))?.0 > 0 {
                    ops.push(Refcounts::alive_dec(st, &offers_refcount_key(old_app))?);
                }
            }
            updated = Some(offer);
            Ok(ops)
        })?;
        updated.ok_or_else(|| CoreError::not_found("offer", args.offer_name.as_str()))
    }

    /// Remove an offer. Refused while connections exist unless `force`,
    /// which removes the connections too.
    pub fn remove_offer(&self, offer_name: &str, force: bool) -> Result<(), CoreError> {
        let st = &self.st;
        st.run(|attempt| {
            let Some(offer) = st.get::<ApplicationOffer>(APPLICATION_OFFERS, offer_name)? else {
                if attempt > 0 {
                    return Ok(Vec::new());
                }
                return Err(CoreError::not_found("offer", offer_name));
            };
            let uuid = offer.doc.offer_uuid.as_str();
            let conn_key = connections_refcount_key(uuid);
            let (connections, conn_check) = Refcounts::read(st, &conn_key)?;
            let mut ops = vec![Op::remove(APPLICATION_OFFERS, st.doc_id(offer_name))
                .with_assert(Assert::Revno(offer.revno))];
            if connections > 0 && !force {
                return Err(CoreError::has_dependents(
                    "offer",
                    offer_name,
                    format!("offer has {connections} connection(s)"),
                ));
            }
            if force {
                for conn in self.offer_connections(uuid)? {
                    warn!(
                        "force removing connection {} to offer {offer_name}",
                        conn.relation_key
                    );
                    ops.push(Op::remove(OFFER_CONNECTIONS, st.doc_id(&conn.relation_key)));
                }
                ops.extend(Refcounts::remove(st, &conn_key)?);
            } else {
                ops.push(conn_check);
                ops.extend(Refcounts::remove(st, &conn_key)?);
            }
            let app_key = offers_refcount_key(&offer.doc.application_name);
            if Refcounts::read(st, &app_key)?.0 > 0 {
                ops.push(Refcounts::alive_dec(st, &app_key)?);
            }
            Ok(ops)
        })?;
        info!("removed offer {offer_name}");
        Ok(())
    }

    pub fn application_offer(&self, offer_name: &str) -> Result<ApplicationOffer, CoreError> {
        self.st
            .get::<ApplicationOffer>(APPLICATION_OFFERS, offer_name)?
            .map(|v| v.doc)
            .ok_or_else(|| CoreError::not_found("offer", offer_name))
    }

    pub fn application_offer_by_uuid(
        &self,
        offer_uuid: &str,
    ) -> Result<ApplicationOffer, CoreError> {
        self.st
            .find::<ApplicationOffer>(
                APPLICATION_OFFERS,
                vec![Condition::eq("offer_uuid", offer_uuid)],
            )?
            .into_iter()
            .next()
            .map(|v| v.doc)
            .ok_or_else(|| CoreError::not_found("offer", offer_uuid))
    }

    /// Offers matching any of `filters`; all offers when `filters` is empty.
    pub fn list_offers(&self, filters: &[OfferFilter]) -> Result<Vec<ApplicationOffer>, CoreError> {
        Ok(self
            .st
            .find::<ApplicationOffer>(APPLICATION_OFFERS, Vec::new())?
            .into_iter()
            .map(|v| v.doc)
            .filter(|o| filters.is_empty() || filters.iter().any(|f| f.matches(o)))
            .collect())
    }

    pub fn add_offer_connection(
        &self,
        args: AddOfferConnectionArgs,
    ) -> Result<OfferConnection, CoreError> {
        let st = &self.st;
        let conn = OfferConnection {
            model_uuid: st.model_uuid().to_string(),
            offer_uuid: args.offer_uuid,
            relation_id: args.relation_id,
            relation_key: RelationKey::new(args.relation_key),
            source_model_uuid: args.source_model_uuid,
            username: args.username,
        };
        st.run(|attempt| {
            if attempt > 0
                && st
                    .get::<OfferConnection>(OFFER_CONNECTIONS, &conn.relation_key)?
                    .is_some()
            {
                return Err(CoreError::AlreadyExists {
                    kind: "offer connection",
                    id: conn.relation_key.to_string(),
                });
            }
            let offer = self.application_offer_by_uuid(&conn.offer_uuid)?;
            Ok(vec![
                Op::check(
                    APPLICATION_OFFERS,
                    st.doc_id(&offer.offer_name),
                    Assert::Matches(vec![Condition::eq("offer_uuid", conn.offer_uuid.as_str())]),
                ),
                Op::insert(
                    OFFER_CONNECTIONS,
                    st.doc_id(&conn.relation_key),
                    State::to_body(&conn)?,
                ),
                Refcounts::create_or_inc(st, &connections_refcount_key(&conn.offer_uuid))?,
            ])
        })?;
        info!(
            "connected {} from model {} to offer {}",
            conn.relation_key, conn.source_model_uuid, conn.offer_uuid
        );
        Ok(conn)
    }

    pub fn offer_connections(&self, offer_uuid: &str) -> Result<Vec<OfferConnection>, CoreError> {
        Ok(self
            .st
            .find::<OfferConnection>(
                OFFER_CONNECTIONS,
                vec![Condition::eq("offer_uuid", offer_uuid)],
            )?
            .into_iter()
            .map(|v| v.doc)
            .collect())
    }

    pub fn offer_connection_for_relation(
        &self,
        relation_key: &str,
    ) -> Result<OfferConnection, CoreError> {
        self.st
            .get::<OfferConnection>(OFFER_CONNECTIONS, relation_key)?
            .map(|v| v.doc)
            .ok_or_else(|| CoreError::not_found("offer connection", relation_key))
    }

    /// Drop the connection for `relation_key`; absent connections are fine.
    pub fn remove_offer_connection(&self, relation_key: &str) -> Result<(), CoreError> {
        let st = &self.st;
        let key = RelationKey::new(relation_key);
        st.run(|_| offer_connection_cleanup_ops(st, &key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::AddApplicationArgs;
    use crate::lifecycle::Living;

    fn state() -> Arc<State> {
        let st = State::builder("m").open().unwrap();
        for name in ["mysql", "postgresql"] {
            st.add_application(AddApplicationArgs {
                name: name.to_owned(),
                series: "jammy".to_owned(),
                ..Default::default()
            })
            .unwrap();
        }
        st
    }

    fn offer_args(name: &str, app: &str) -> AddOfferArgs {
        AddOfferArgs {
            offer_name: name.to_owned(),
            application_name: app.to_owned(),
            description: "shared database".to_owned(),
            owner: "admin".to_owned(),
            endpoints: BTreeMap::from([("db".to_owned(), "server".to_owned())]),
        }
    }

    fn connection_args(offer_uuid: &str, relation: &str) -> AddOfferConnectionArgs {
        AddOfferConnectionArgs {
            offer_uuid: offer_uuid.to_owned(),
            relation_id: 7,
            relation_key: relation.to_owned(),
            source_model_uuid: "other-model".to_owned(),
            username: "fred".to_owned(),
        }
    }

    fn offer_refs(st: &State, app: &str) -> i64 {
        Refcounts::read(st, &offers_refcount_key(&ApplicationName::new(app))).unwrap().0
    }

    #[test]
    fn add_offer_holds_application() {
        let st = state();
        let offers = st.application_offers();
        let offer = offers.add_offer(offer_args("hosted-mysql", "mysql")).unwrap();
        assert_eq!(offers.application_offer("hosted-mysql").unwrap(), offer);
        assert_eq!(offer_refs(&st, "mysql"), 1);

        let mut app = st.application("mysql").unwrap();
        assert!(app.destroy().unwrap_err().is_has_dependents());

        let err = offers.add_offer(offer_args("hosted-mysql", "mysql")).unwrap_err();
        assert!(err.is_already_exists());

        offers.remove_offer("hosted-mysql", false).unwrap();
        assert_eq!(offer_refs(&st, "mysql"), 0);
        app.destroy().unwrap();
        assert!(st.application("mysql").unwrap_err().is_not_found());
    }

    #[test]
    fn offer_needs_alive_application() {
        let st = state();
        let offers = st.application_offers();
        assert!(offers
            .add_offer(offer_args("x", "missing"))
            .unwrap_err()
            .is_not_found());
        let mut app = st.application("mysql").unwrap();
        app.add_unit().unwrap();
        app.destroy().unwrap();
        assert!(offers
            .add_offer(offer_args("x", "mysql"))
            .unwrap_err()
            .is_not_alive());
        assert!(matches!(
            offers.add_offer(offer_args("Bad Name", "postgresql")),
            Err(CoreError::Name(_))
        ));
    }

    #[test]
    fn update_offer_moves_reference() {
        let st = state();
        let offers = st.application_offers();
        offers.add_offer(offer_args("db", "mysql")).unwrap();
        let mut args = offer_args("db", "postgresql");
        args.description = "moved".to_owned();
        let updated = offers.update_offer(args).unwrap();
        assert_eq!(updated.application_name, "postgresql");
        assert_eq!(offers.application_offer("db").unwrap().description, "moved");
        assert_eq!(offer_refs(&st, "mysql"), 0);
        assert_eq!(offer_refs(&st, "postgresql"), 1);
        assert!(offers
            .update_offer(offer_args("nope", "mysql"))
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn list_offers_filters() {
        let st = state();
        let offers = st.application_offers();
        offers.add_offer(offer_args("hosted-mysql", "mysql")).unwrap();
        offers.add_offer(offer_args("hosted-pg", "postgresql")).unwrap();
        assert_eq!(offers.list_offers(&[]).unwrap().len(), 2);
        let by_app = offers
            .list_offers(&[OfferFilter {
                application_name: Some("postgresql".to_owned()),
                ..Default::default()
            }])
            .unwrap();
        assert_eq!(by_app.len(), 1);
        assert_eq!(by_app[0].offer_name, "hosted-pg");
        let by_name = offers
            .list_offers(&[OfferFilter {
                offer_name: Some("mysql".to_owned()),
                ..Default::default()
            }])
            .unwrap();
        assert_eq!(by_name[0].application_name, "mysql");
    }

    #[test]
    fn connections_block_offer_removal() {
        let st = state();
        let offers = st.application_offers();
        let offer = offers.add_offer(offer_args("hosted-mysql", "mysql")).unwrap();
        offers
            .add_offer_connection(connection_args(&offer.offer_uuid, "remote:db mysql:server"))
            .unwrap();
        assert!(offers
            .add_offer_connection(connection_args(&offer.offer_uuid, "remote:db mysql:server"))
            .unwrap_err()
            .is_already_exists());
        assert_eq!(offers.offer_connections(&offer.offer_uuid).unwrap().len(), 1);
        assert_eq!(
            offers
                .offer_connection_for_relation("remote:db mysql:server")
                .unwrap()
                .username,
            "fred"
        );

        assert!(offers
            .remove_offer("hosted-mysql", false)
            .unwrap_err()
            .is_has_dependents());

        offers.remove_offer_connection("remote:db mysql:server").unwrap();
        offers.remove_offer_connection("remote:db mysql:server").unwrap();
        offers.remove_offer("hosted-mysql", false).unwrap();
    }

    #[test]
    fn forced_removal_drops_connections() {
        let st = state();
        let offers = st.application_offers();
        let offer = offers.add_offer(offer_args("hosted-mysql", "mysql")).unwrap();
        offers
            .add_offer_connection(connection_args(&offer.offer_uuid, "a:db mysql:server"))
            .unwrap();
        offers
            .add_offer_connection(connection_args(&offer.offer_uuid, "b:db mysql:server"))
            .unwrap();
        offers.remove_offer("hosted-mysql", true).unwrap();
        assert!(offers.offer_connections(&offer.offer_uuid).unwrap().is_empty());
        assert!(offers.application_offer("hosted-mysql").unwrap_err().is_not_found());
        assert!(offers
            .remove_offer("hosted-mysql", false)
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn connection_to_unknown_offer_fails() {
        let st = state();
        let offers = st.application_offers();
        assert!(offers
            .add_offer_connection(connection_args("no-such-uuid", "a:db mysql:server"))
            .unwrap_err()
            .is_not_found());
    }
}
