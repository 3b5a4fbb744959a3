use crate::collections::{RELATIONS, RELATION_NETWORKS};
use crate::state::State;
use crate::CoreError;
use corral_schema::RelationKey;
use corral_store::{Assert, Condition, Op, Update};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkDirection {
    Ingress,
    Egress,
}

impl NetworkDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            NetworkDirection::Ingress => "ingress",
            NetworkDirection::Egress => "egress",
        }
    }
}

impl fmt::Display for NetworkDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationNetwork {
    pub model_uuid: String,
    pub relation_key: RelationKey,
    pub direction: NetworkDirection,
    pub cidrs: Vec<String>,
}

fn network_key(relation_key: &str, direction: NetworkDirection) -> String {
    format!("{relation_key}:{direction}")
}

/// Accepts `address/prefix` with an IPv4 or IPv6 address.
fn validate_cidr(cidr: &str) -> Result<(), CoreError> {
    let invalid = || CoreError::InvalidArgument(format!("invalid CIDR address: {cidr}"));
    let (addr, prefix) = cidr.split_once('/').ok_or_else(invalid)?;
    let addr: IpAddr = addr.parse().map_err(|_| invalid())?;
    let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
    let max = if addr.is_ipv4() { 32 } else { 128 };
    if prefix > max {
        return Err(invalid());
    }
    Ok(())
}

/// Removal of both directions' records for a relation.
pub(crate) fn relation_networks_cleanup_ops(
    st: &State,
    relation_key: &RelationKey,
) -> Result<Vec<Op>, CoreError> {
    let mut ops = Vec::new();
    for direction in [NetworkDirection::Ingress, NetworkDirection::Egress] {
        let key = network_key(relation_key, direction);
        if st.get::<RelationNetwork>(RELATION_NETWORKS, &key)?.is_some() {
            ops.push(Op::remove(RELATION_NETWORKS, st.doc_id(&key)));
        }
    }
    Ok(ops)
}

/// Ingress or egress CIDRs recorded per relation.
pub struct RelationNetworks {
    st: Arc<State>,
    direction: NetworkDirection,
}

impl State {
    pub fn relation_ingress_networks(self: &Arc<Self>) -> RelationNetworks {
        RelationNetworks {
            st: Arc::clone(self),
            direction: NetworkDirection::Ingress,
        }
    }

    pub fn relation_egress_networks(self: &Arc<Self>) -> RelationNetworks {
        RelationNetworks {
            st: Arc::clone(self),
            direction: NetworkDirection::Egress,
        }
    }
}

impl RelationNetworks {
    pub fn direction(&self) -> NetworkDirection {
        self.direction
    }

    /// Record `cidrs` for an existing relation, replacing any earlier set.
    pub fn save(&self, relation_key: &str, cidrs: &[String]) -> Result<RelationNetwork, CoreError> {
        for cidr in cidrs {
            validate_cidr(cidr)?;
        }
        let st = &self.st;
        let key = network_key(relation_key, self.direction);
        let doc = RelationNetwork {
            model_uuid: st.model_uuid().to_string(),
            relation_key: RelationKey::new(relation_key),
            direction: self.direction,
            cidrs: cidrs.to_vec(),
        };
        st.run(|_| {
            if st.get::<serde_json::Value>(RELATIONS, relation_key)?.is_none() {
                return Err(CoreError::not_found("relation", relation_key));
            }
            let relation_check = Op::check(RELATIONS, st.doc_id(relation_key), Assert::Exists);
            let write = if st.get::<RelationNetwork>(RELATION_NETWORKS, &key)?.is_some() {
                Op::update(
                    RELATION_NETWORKS,
                    st.doc_id(&key),
                    vec![Update::set("cidrs", doc.cidrs.clone())],
                )
                .with_assert(Assert::Exists)
            } else {
                Op::insert(RELATION_NETWORKS, st.doc_id(&key), State::to_body(&doc)?)
            };
            Ok(vec![relation_check, write])
        })?;
        info!(
            "saved {} {} network(s) for relation {relation_key}",
            cidrs.len(),
            self.direction
        );
        Ok(doc)
    }

    pub fn network(&self, relation_key: &str) -> Result<RelationNetwork, CoreError> {
        let key = network_key(relation_key, self.direction);
        self.st
            .get::<RelationNetwork>(RELATION_NETWORKS, &key)?
            .map(|v| v.doc)
            .ok_or_else(|| CoreError::not_found("relation network", key))
    }

    pub fn all_networks(&self) -> Result<Vec<RelationNetwork>, CoreError> {
        Ok(self
            .st
            .find::<RelationNetwork>(
                RELATION_NETWORKS,
                vec![Condition::eq("direction", self.direction.as_str())],
            )?
            .into_iter()
            .map(|v| v.doc)
            .collect())
    }

    /// Forget the record for `relation_key`; absent records are fine.
    pub fn remove(&self, relation_key: &str) -> Result<(), CoreError> {
        let st = &self.st;
        let key = network_key(relation_key, self.direction);
        st.run(|_| {
            if st.get::<RelationNetwork>(RELATION_NETWORKS, &key)?.is_none() {
                return Ok(Vec::new());
            }
            Ok(vec![Op::remove(RELATION_NETWORKS, st.doc_id(&key))])
        })
    }
}
