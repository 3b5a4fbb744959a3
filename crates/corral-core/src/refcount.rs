//! Counter documents in the `refcounts` collection.
//!
//! Each helper reads the current count and returns the operation to put in
//! the same batch as the change it guards. The returned operation asserts
//! whatever the decision depended on, so a concurrent change aborts the
//! batch and the builder re-reads.

use crate::collections::REFCOUNTS;
use crate::state::{State, MODEL_UUID_FIELD};
use crate::CoreError;
use corral_store::{Assert, Condition, Op, Update};
use serde_json::json;

pub const REFCOUNT_FIELD: &str = "refcount";

pub struct Refcounts;

impl Refcounts {
    /// Current count (0 when the document is missing) and an operation
    /// asserting the count is unchanged.
    pub fn read(st: &State, key: &str) -> Result<(i64, Op), CoreError> {
        let id = st.doc_id(key);
        match Self::current(st, key)? {
            Some(count) => Ok((
                count,
                Op::check(
                    REFCOUNTS,
                    id,
                    Assert::Matches(vec![Condition::eq(REFCOUNT_FIELD, count)]),
                ),
            )),
            None => Ok((0, Op::check(REFCOUNTS, id, Assert::Missing))),
        }
    }

    /// Create the counter at 1, or increment it if it exists.
    pub fn create_or_inc(st: &State, key: &str) -> Result<Op, CoreError> {
        let id = st.doc_id(key);
        if Self::current(st, key)?.is_some() {
            Ok(Op::update(REFCOUNTS, id, vec![Update::inc(REFCOUNT_FIELD, 1)]))
        } else {
            Ok(Op::insert(REFCOUNTS, id, Self::body(st, 1)))
        }
    }

    /// Increment a counter that must already exist.
    pub fn strict_inc(st: &State, key: &str) -> Result<Op, CoreError> {
        if Self::current(st, key)?.is_none() {
            return Err(CoreError::not_found("refcount", key));
        }
        Ok(Op::update(
            REFCOUNTS,
            st.doc_id(key),
            vec![Update::inc(REFCOUNT_FIELD, 1)],
        ))
    }

    /// Decrement a counter, asserting it is positive. The document stays
    /// even at zero.
    pub fn alive_dec(st: &State, key: &str) -> Result<Op, CoreError> {
        match Self::current(st, key)? {
            None => return Err(CoreError::not_found("refcount", key)),
            Some(count) if count <= 0 => {
                return Err(CoreError::InvalidArgument(format!(
                    "refcount {key} is already zero"
                )))
            }
            Some(_) => {}
        }
        Ok(Op::update(
            REFCOUNTS,
            st.doc_id(key),
            vec![Update::inc(REFCOUNT_FIELD, -1)],
        )
        .with_assert(Assert::Matches(vec![Condition::gt(REFCOUNT_FIELD, 0)])))
    }

    /// Decrement a counter whose owner is dying. Returns `true` when this
    /// was the last reference, in which case the document is removed.
    pub fn dying_dec(st: &State, key: &str) -> Result<(Op, bool), CoreError> {
        let Some(count) = Self::current(st, key)? else {
            return Err(CoreError::not_found("refcount", key));
        };
        let id = st.doc_id(key);
        if count <= 1 {
            let op = Op::remove(REFCOUNTS, id)
                .with_assert(Assert::Matches(vec![Condition::eq(REFCOUNT_FIELD, count)]));
            Ok((op, true))
        } else {
            let op = Op::update(REFCOUNTS, id, vec![Update::inc(REFCOUNT_FIELD, -1)])
                .with_assert(Assert::Matches(vec![Condition::eq(REFCOUNT_FIELD, count)]));
            Ok((op, false))
        }
    }

    /// Remove the counter whatever its value; `None` when already gone.
    pub fn remove(st: &State, key: &str) -> Result<Option<Op>, CoreError> {
        Ok(Self::current(st, key)?.map(|_| Op::remove(REFCOUNTS, st.doc_id(key))))
    }

    pub(crate) fn create_op(st: &State, key: &str) -> Op {
        Op::insert(REFCOUNTS, st.doc_id(key), Self::body(st, 0))
    }

    fn body(st: &State, count: i64) -> serde_json::Value {
        json!({ MODEL_UUID_FIELD: st.model_uuid().as_str(), REFCOUNT_FIELD: count })
    }

    fn current(st: &State, key: &str) -> Result<Option<i64>, CoreError> {
        let doc = st.get::<serde_json::Value>(REFCOUNTS, key)?;
        Ok(doc.map(|v| v.doc[REFCOUNT_FIELD].as_i64().unwrap_or(0)))
    }
}
