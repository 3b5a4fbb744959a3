use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A stored document: its id, the revision number bumped by every committed
/// mutation, and a JSON object body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub revno: u64,
    pub body: Value,
}

impl Document {
    /// Look up a dotted path (`"a.b.c"`) in the body.
    pub fn get(&self, path: &str) -> Option<&Value> {
        lookup(&self.body, path)
    }

    pub fn matches(&self, conditions: &[Condition]) -> bool {
        conditions.iter().all(|c| c.holds(&self.body))
    }
}

pub(crate) fn lookup<'a>(body: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = body;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// A predicate over one field of a document body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Condition {
    Eq(String, Value),
    /// Holds when the field is missing or differs.
    Ne(String, Value),
    In(String, Vec<Value>),
    Gt(String, i64),
    /// Array field with exactly this many elements.
    Size(String, usize),
    Contains(String, Value),
    /// Holds when the field is missing or the array lacks the value.
    NotContains(String, Value),
}

impl Condition {
    pub fn eq(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq(path.into(), value.into())
    }

    pub fn ne(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Ne(path.into(), value.into())
    }

    pub fn is_in<V: Into<Value>>(
        path: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Self::In(path.into(), values.into_iter().map(Into::into).collect())
    }

    pub fn gt(path: impl Into<String>, n: i64) -> Self {
        Self::Gt(path.into(), n)
    }

    pub fn size(path: impl Into<String>, n: usize) -> Self {
        Self::Size(path.into(), n)
    }

    pub fn contains(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Contains(path.into(), value.into())
    }

    pub fn not_contains(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::NotContains(path.into(), value.into())
    }

    pub fn holds(&self, body: &Value) -> bool {
        match self {
            Condition::Eq(path, v) => lookup(body, path) == Some(v),
            Condition::Ne(path, v) => lookup(body, path) != Some(v),
            Condition::In(path, vs) => lookup(body, path).is_some_and(|f| vs.contains(f)),
            Condition::Gt(path, n) => lookup(body, path)
                .and_then(Value::as_i64)
                .is_some_and(|f| f > *n),
            Condition::Size(path, n) => lookup(body, path)
                .and_then(Value::as_array)
                .is_some_and(|a| a.len() == *n),
            Condition::Contains(path, v) => lookup(body, path)
                .and_then(Value::as_array)
                .is_some_and(|a| a.contains(v)),
            Condition::NotContains(path, v) => !lookup(body, path)
                .and_then(Value::as_array)
                .is_some_and(|a| a.contains(v)),
        }
    }
}

/// What must be true of a document for its batch to apply.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Assert {
    #[default]
    Always,
    Exists,
    Missing,
    /// The document exists with exactly this revision.
    Revno(u64),
    /// The document exists and every condition holds.
    Matches(Vec<Condition>),
}

impl Assert {
    pub fn holds(&self, doc: Option<&Document>) -> bool {
        match self {
            Assert::Always => true,
            Assert::Exists => doc.is_some(),
            Assert::Missing => doc.is_none(),
            Assert::Revno(revno) => doc.is_some_and(|d| d.revno == *revno),
            Assert::Matches(conditions) => doc.is_some_and(|d| d.matches(conditions)),
        }
    }
}

/// A field-level change inside an update mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Update {
    Set(String, Value),
    Unset(String),
    Inc(String, i64),
    /// Append to an array unless the value is already present.
    AddToSet(String, Value),
    /// Remove every occurrence of a value from an array.
    Pull(String, Value),
}

impl Update {
    pub fn set(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Set(path.into(), value.into())
    }

    pub fn unset(path: impl Into<String>) -> Self {
        Self::Unset(path.into())
    }

    pub fn inc(path: impl Into<String>, n: i64) -> Self {
        Self::Inc(path.into(), n)
    }

    pub fn add_to_set(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::AddToSet(path.into(), value.into())
    }

    pub fn pull(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Pull(path.into(), value.into())
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Mutation {
    /// Assertion only.
    #[default]
    None,
    /// Create the document; aborts the batch if it already exists.
    Insert(Value),
    /// Modify an existing document; aborts the batch if it is missing.
    Update(Vec<Update>),
    /// Delete an existing document; aborts the batch if it is missing.
    Remove,
}

/// One element of an atomic batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Op {
    pub collection: String,
    pub id: String,
    pub assert: Assert,
    pub mutation: Mutation,
}

impl Op {
    pub fn insert(collection: &str, id: impl Into<String>, body: Value) -> Self {
        Self {
            collection: collection.to_owned(),
            id: id.into(),
            assert: Assert::Missing,
            mutation: Mutation::Insert(body),
        }
    }

    pub fn update(collection: &str, id: impl Into<String>, updates: Vec<Update>) -> Self {
        Self {
            collection: collection.to_owned(),
            id: id.into(),
            assert: Assert::Exists,
            mutation: Mutation::Update(updates),
        }
    }

    pub fn remove(collection: &str, id: impl Into<String>) -> Self {
        Self {
            collection: collection.to_owned(),
            id: id.into(),
            assert: Assert::Exists,
            mutation: Mutation::Remove,
        }
    }

    pub fn check(collection: &str, id: impl Into<String>, assert: Assert) -> Self {
        Self {
            collection: collection.to_owned(),
            id: id.into(),
            assert,
            mutation: Mutation::None,
        }
    }

    #[must_use]
    pub fn with_assert(mut self, assert: Assert) -> Self {
        self.assert = assert;
        self
    }
}

/// Result of submitting a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    Applied,
    /// An assertion failed; nothing was written.
    Aborted { op_index: usize, reason: String },
}

impl BatchOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, BatchOutcome::Applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(body: Value) -> Document {
        Document {
            id: "m:x".to_owned(),
            revno: 4,
            body,
        }
    }

    #[test]
    fn dotted_lookup() {
        let d = doc(json!({"a": {"b": {"c": 3}}}));
        assert_eq!(d.get("a.b.c"), Some(&json!(3)));
        assert_eq!(d.get("a.x"), None);
        assert_eq!(d.get("a.b.c.d"), None);
    }

    #[test]
    fn equality_conditions() {
        let body = json!({"life": "alive", "n": 2});
        assert!(Condition::eq("life", "alive").holds(&body));
        assert!(!Condition::eq("life", "dead").holds(&body));
        assert!(Condition::ne("life", "dead").holds(&body));
        assert!(Condition::ne("missing", "dead").holds(&body));
        assert!(Condition::is_in("life", ["alive", "dying"]).holds(&body));
        assert!(!Condition::is_in("life", ["dead"]).holds(&body));
        assert!(Condition::gt("n", 1).holds(&body));
        assert!(!Condition::gt("n", 2).holds(&body));
        assert!(!Condition::gt("life", 0).holds(&body));
    }

    #[test]
    fn array_conditions() {
        let body = json!({"subs": ["a/0", "b/1"], "empty": []});
        assert!(Condition::size("subs", 2).holds(&body));
        assert!(Condition::size("empty", 0).holds(&body));
        assert!(!Condition::size("missing", 0).holds(&body));
        assert!(Condition::contains("subs", "a/0").holds(&body));
        assert!(!Condition::contains("subs", "c/0").holds(&body));
        assert!(Condition::not_contains("subs", "c/0").holds(&body));
        assert!(Condition::not_contains("missing", "c/0").holds(&body));
        assert!(!Condition::not_contains("subs", "b/1").holds(&body));
    }

    #[test]
    fn assertions() {
        let d = doc(json!({"life": "alive"}));
        assert!(Assert::Always.holds(None));
        assert!(Assert::Exists.holds(Some(&d)));
        assert!(!Assert::Exists.holds(None));
        assert!(Assert::Missing.holds(None));
        assert!(!Assert::Missing.holds(Some(&d)));
        assert!(Assert::Revno(4).holds(Some(&d)));
        assert!(!Assert::Revno(3).holds(Some(&d)));
        assert!(Assert::Matches(vec![Condition::eq("life", "alive")]).holds(Some(&d)));
        assert!(!Assert::Matches(vec![]).holds(None));
    }

    #[test]
    fn op_constructors_pick_default_assertions() {
        assert_eq!(Op::insert("c", "i", json!({})).assert, Assert::Missing);
        assert_eq!(Op::update("c", "i", vec![]).assert, Assert::Exists);
        assert_eq!(Op::remove("c", "i").assert, Assert::Exists);
        let op = Op::remove("c", "i").with_assert(Assert::Revno(2));
        assert_eq!(op.assert, Assert::Revno(2));
        assert_eq!(op.mutation, Mutation::Remove);
    }
}
