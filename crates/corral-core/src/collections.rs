//! Collection names shared by every entity module.

pub const APPLICATIONS: &str = "applications";
pub const UNITS: &str = "units";
pub const MACHINES: &str = "machines";
pub const RELATIONS: &str = "relations";
pub const RELATION_SCOPES: &str = "relationscopes";
pub const REFCOUNTS: &str = "refcounts";
pub const SETTINGS: &str = "settings";
pub const STATUSES: &str = "statuses";
pub const APPLICATION_OFFERS: &str = "applicationOffers";
pub const OFFER_CONNECTIONS: &str = "offerConnections";
pub const RELATION_NETWORKS: &str = "relationNetworks";
