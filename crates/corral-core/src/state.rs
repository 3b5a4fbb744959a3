use crate::registry::InstanceRegistry;
use crate::status::{NeverReported, RemovalPolicy};
use crate::txn::{RetryConfig, TxnRunner};
use crate::CoreError;
use corral_schema::{ModelUuid, StateConfig};
use corral_store::{open_store, BatchOutcome, Condition, DocumentStore, Op};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

/// Every document carries the uuid of its model so queries stay scoped.
pub const MODEL_UUID_FIELD: &str = "model_uuid";

/// A decoded document together with the revision it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub doc: T,
    pub revno: u64,
}

/// Handle on one model's state. Entities hold an `Arc<State>`.
pub struct State {
    model_uuid: ModelUuid,
    store: Arc<dyn DocumentStore>,
    runner: TxnRunner,
    config: StateConfig,
    removal_policy: Arc<dyn RemovalPolicy>,
    registry: Arc<InstanceRegistry>,
    instance_id: u64,
    closed: AtomicBool,
}

pub struct StateBuilder {
    model_uuid: ModelUuid,
    config: StateConfig,
    store: Option<Arc<dyn DocumentStore>>,
    registry: Option<Arc<InstanceRegistry>>,
    removal_policy: Option<Arc<dyn RemovalPolicy>>,
}

impl StateBuilder {
    pub fn new(model_uuid: impl Into<ModelUuid>) -> Self {
        Self {
            model_uuid: model_uuid.into(),
            config: StateConfig::default(),
            store: None,
            registry: None,
            removal_policy: None,
        }
    }

    #[must_use]
    pub fn config(mut self, config: StateConfig) -> Self {
        self.config = config;
        self
    }

    /// Use an existing store instead of opening the configured backend.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn registry(mut self, registry: Arc<InstanceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    #[must_use]
    pub fn removal_policy(mut self, policy: Arc<dyn RemovalPolicy>) -> Self {
        self.removal_policy = Some(policy);
        self
    }

    pub fn open(self) -> Result<Arc<State>, CoreError> {
        self.config.validate()?;
        if self.model_uuid.is_empty() {
            return Err(CoreError::InvalidArgument("empty model uuid".to_owned()));
        }
        let store = match self.store {
            Some(store) => store,
            None => open_store(&self.config.store)?,
        };
        let registry = self.registry.unwrap_or_default();
        let instance_id = registry.register(&self.model_uuid, store.name());
        let runner = TxnRunner::new(Arc::clone(&store), RetryConfig::from(&self.config.txn));
        info!(
            "opened state for model {} on {} store (instance {instance_id})",
            self.model_uuid,
            store.name()
        );
        Ok(Arc::new(State {
            model_uuid: self.model_uuid,
            store,
            runner,
            config: self.config,
            removal_policy: self
                .removal_policy
                .unwrap_or_else(|| Arc::new(NeverReported)),
            registry,
            instance_id,
            closed: AtomicBool::new(false),
        }))
    }
}

impl State {
    pub fn builder(model_uuid: impl Into<ModelUuid>) -> StateBuilder {
        StateBuilder::new(model_uuid)
    }

    /// Open a state on the configured store backend.
    pub fn open(
        model_uuid: impl Into<ModelUuid>,
        config: StateConfig,
        registry: Arc<InstanceRegistry>,
    ) -> Result<Arc<State>, CoreError> {
        StateBuilder::new(model_uuid)
            .config(config)
            .registry(registry)
            .open()
    }

    /// Unregister from the instance registry. Later operations fail with
    /// `StateClosed`. Closing twice is harmless.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.registry.unregister(self.instance_id);
            info!(
                "closed state for model {} (instance {})",
                self.model_uuid, self.instance_id
            );
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn model_uuid(&self) -> &ModelUuid {
        &self.model_uuid
    }

    pub fn config(&self) -> &StateConfig {
        &self.config
    }

    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// The runner, for installing before-hooks in tests.
    pub fn runner(&self) -> &TxnRunner {
        &self.runner
    }

    pub fn removal_policy(&self) -> &dyn RemovalPolicy {
        self.removal_policy.as_ref()
    }

    /// Global document id for a model-local id.
    pub fn doc_id(&self, local_id: &str) -> String {
        format!("{}:{local_id}", self.model_uuid)
    }

    pub fn local_id<'a>(&self, doc_id: &'a str) -> &'a str {
        doc_id
            .strip_prefix(self.model_uuid.as_str())
            .and_then(|rest| rest.strip_prefix(':'))
            .unwrap_or(doc_id)
    }

    fn ensure_open(&self) -> Result<(), CoreError> {
        if self.is_closed() {
            Err(CoreError::StateClosed)
        } else {
            Ok(())
        }
    }

    pub fn run<F>(&self, builder: F) -> Result<(), CoreError>
    where
        F: FnMut(u32) -> Result<Vec<Op>, CoreError>,
    {
        self.ensure_open()?;
        self.runner.run(builder)
    }

    pub fn run_raw(&self, ops: &[Op]) -> Result<BatchOutcome, CoreError> {
        self.ensure_open()?;
        self.runner.run_raw(ops)
    }

    /// Next value of a model-scoped sequence, starting at 0.
    pub fn sequence(&self, name: &str) -> Result<u64, CoreError> {
        self.ensure_open()?;
        Ok(self.store.next_sequence(&self.doc_id(name))?)
    }

    pub(crate) fn get<T: DeserializeOwned>(
        &self,
        collection: &str,
        local_id: &str,
    ) -> Result<Option<Versioned<T>>, CoreError> {
        self.ensure_open()?;
        let Some(doc) = self.store.find_one(collection, &self.doc_id(local_id))? else {
            return Ok(None);
        };
        Ok(Some(Versioned {
            doc: serde_json::from_value(doc.body)?,
            revno: doc.revno,
        }))
    }

    /// Documents of this model in `collection` matching `conditions`,
    /// ordered by id.
    pub(crate) fn find<T: DeserializeOwned>(
        &self,
        collection: &str,
        mut conditions: Vec<Condition>,
    ) -> Result<Vec<Versioned<T>>, CoreError> {
        self.ensure_open()?;
        conditions.push(Condition::eq(MODEL_UUID_FIELD, self.model_uuid.as_str()));
        self.store
            .find_many(collection, &conditions)?
            .into_iter()
            .map(|doc| {
                Ok(Versioned {
                    doc: serde_json::from_value(doc.body)?,
                    revno: doc.revno,
                })
            })
            .collect()
    }

    pub(crate) fn to_body<T: Serialize>(doc: &T) -> Result<Value, CoreError> {
        Ok(serde_json::to_value(doc)?)
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("model_uuid", &self.model_uuid)
            .field("store", &self.store.name())
            .field("instance_id", &self.instance_id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Drop for State {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_schema::parse_config_str;
    use corral_store::MemoryStore;
    use serde_json::json;

    #[test]
    fn open_registers_and_close_unregisters() {
        let registry = Arc::new(InstanceRegistry::new());
        let st = State::open("m1", StateConfig::default(), Arc::clone(&registry)).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.live()[0].model_uuid, "m1");

        st.close();
        assert!(registry.is_empty());
        st.close();
        assert!(st.is_closed());
    }

    #[test]
    fn dropping_the_last_handle_unregisters() {
        let registry = Arc::new(InstanceRegistry::new());
        {
            let _st = State::open("m1", StateConfig::default(), Arc::clone(&registry)).unwrap();
            assert_eq!(registry.len(), 1);
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn closed_state_refuses_operations() {
        let st = State::builder("m1").open().unwrap();
        st.close();
        assert!(matches!(st.sequence("x"), Err(CoreError::StateClosed)));
        assert!(matches!(st.run(|_| Ok(Vec::new())), Err(CoreError::StateClosed)));
        assert!(matches!(
            st.get::<Value>("units", "a/0"),
            Err(CoreError::StateClosed)
        ));
    }

    #[test]
    fn doc_ids_are_model_scoped() {
        let st = State::builder("m1").open().unwrap();
        assert_eq!(st.doc_id("wordpress/0"), "m1:wordpress/0");
        assert_eq!(st.local_id("m1:wordpress/0"), "wordpress/0");
        assert_eq!(st.local_id("other"), "other");
    }

    #[test]
    fn find_only_sees_own_model() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let a = State::builder("a").store(Arc::clone(&store)).open().unwrap();
        let b = State::builder("b").store(Arc::clone(&store)).open().unwrap();
        a.run(|_| {
            Ok(vec![
                Op::insert("things", a.doc_id("x"), json!({"model_uuid": "a", "n": 1})),
                Op::insert("things", b.doc_id("x"), json!({"model_uuid": "b", "n": 2})),
            ])
        })
        .unwrap();

        let seen: Vec<Versioned<Value>> = a.find("things", Vec::new()).unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].doc["n"], 1);
        let got: Versioned<Value> = b.get("things", "x").unwrap().unwrap();
        assert_eq!(got.doc["n"], 2);
        assert_eq!(got.revno, 1);
    }

    #[test]
    fn sequences_are_model_scoped() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let a = State::builder("a").store(Arc::clone(&store)).open().unwrap();
        let b = State::builder("b").store(store).open().unwrap();
        assert_eq!(a.sequence("machine").unwrap(), 0);
        assert_eq!(a.sequence("machine").unwrap(), 1);
        assert_eq!(b.sequence("machine").unwrap(), 0);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = parse_config_str("").unwrap();
        config.txn.max_attempts = 0;
        assert!(matches!(
            State::builder("m").config(config).open(),
            Err(CoreError::Config(_))
        ));
        assert!(matches!(
            State::builder("").open(),
            Err(CoreError::InvalidArgument(_))
        ));
    }
}
