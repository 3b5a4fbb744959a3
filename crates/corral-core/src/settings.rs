//! Key/value settings documents.
//!
//! A [`Settings`] keeps the snapshot it last read from the store next to
//! the caller's edits. `write` sends only the difference as field-level
//! updates, so concurrent writers touching different keys do not clobber
//! each other.

use crate::collections::SETTINGS;
use crate::state::{State, MODEL_UUID_FIELD};
use crate::CoreError;
use corral_store::{Assert, Op, Update};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

const VERSION_FIELD: &str = "version";
const SETTINGS_FIELD: &str = "settings";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SettingsDoc {
    model_uuid: String,
    version: i64,
    settings: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemChangeKind {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ItemChange {
    pub kind: ItemChangeKind,
    pub key: String,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
}

fn escape_key(key: &str) -> String {
    key.replace('.', "\u{ff0e}").replace('$', "\u{ff04}")
}

fn unescape_key(key: &str) -> String {
    key.replace('\u{ff0e}', ".").replace('\u{ff04}', "$")
}

fn escape_map(values: &BTreeMap<String, Value>) -> BTreeMap<String, Value> {
    values
        .iter()
        .map(|(k, v)| (escape_key(k), v.clone()))
        .collect()
}

fn unescape_map(values: BTreeMap<String, Value>) -> BTreeMap<String, Value> {
    values.into_iter().map(|(k, v)| (unescape_key(&k), v)).collect()
}

pub(crate) fn create_settings_op(
    st: &State,
    key: &str,
    values: &BTreeMap<String, Value>,
) -> Result<Op, CoreError> {
    let doc = SettingsDoc {
        model_uuid: st.model_uuid().to_string(),
        version: 0,
        settings: escape_map(values),
    };
    Ok(Op::insert(SETTINGS, st.doc_id(key), State::to_body(&doc)?))
}

pub(crate) fn replace_settings_op(st: &State, key: &str, values: &BTreeMap<String, Value>) -> Op {
    Op::update(
        SETTINGS,
        st.doc_id(key),
        vec![
            Update::set(SETTINGS_FIELD, json!(escape_map(values))),
            Update::inc(VERSION_FIELD, 1),
        ],
    )
    .with_assert(Assert::Exists)
}

/// Removal of `key`, or `None` when there is nothing to remove.
pub(crate) fn remove_settings_op(st: &State, key: &str) -> Result<Option<Op>, CoreError> {
    Ok(read_doc(st, key)?.map(|_| Op::remove(SETTINGS, st.doc_id(key))))
}

fn read_doc(st: &State, key: &str) -> Result<Option<SettingsDoc>, CoreError> {
    Ok(st.get::<SettingsDoc>(SETTINGS, key)?.map(|v| v.doc))
}

pub fn create_settings(
    st: &Arc<State>,
    key: &str,
    values: BTreeMap<String, Value>,
) -> Result<Settings, CoreError> {
    st.run(|attempt| {
        if attempt > 0 && read_doc(st, key)?.is_some() {
            return Err(CoreError::AlreadyExists {
                kind: "settings",
                id: key.to_owned(),
            });
        }
        Ok(vec![create_settings_op(st, key, &values)?])
    })?;
    read_settings(st, key)
}

pub fn read_settings(st: &Arc<State>, key: &str) -> Result<Settings, CoreError> {
    let doc = read_doc(st, key)?.ok_or_else(|| CoreError::not_found("settings", key))?;
    let disk = unescape_map(doc.settings);
    Ok(Settings {
        st: Arc::clone(st),
        key: key.to_owned(),
        core: disk.clone(),
        disk,
        version: doc.version,
    })
}

/// Overwrite every value under `key`.
pub fn replace_settings(
    st: &Arc<State>,
    key: &str,
    values: BTreeMap<String, Value>,
) -> Result<(), CoreError> {
    st.run(|_| {
        if read_doc(st, key)?.is_none() {
            return Err(CoreError::not_found("settings", key));
        }
        Ok(vec![replace_settings_op(st, key, &values)])
    })
}

pub fn remove_settings(st: &Arc<State>, key: &str) -> Result<(), CoreError> {
    st.run(|_| {
        if read_doc(st, key)?.is_none() {
            return Err(CoreError::not_found("settings", key));
        }
        Ok(vec![Op::remove(SETTINGS, st.doc_id(key))])
    })
}

#[derive(Debug)]
pub struct Settings {
    st: Arc<State>,
    key: String,
    disk: BTreeMap<String, Value>,
    core: BTreeMap<String, Value>,
    version: i64,
}

impl Settings {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Number of writes the document has seen when last read.
    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn keys(&self) -> Vec<String> {
        self.core.keys().cloned().collect()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.core.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.core.insert(key.into(), value.into());
    }

    pub fn update(&mut self, values: BTreeMap<String, Value>) {
        self.core.extend(values);
    }

    pub fn delete(&mut self, key: &str) {
        self.core.remove(key);
    }

    pub fn map(&self) -> BTreeMap<String, Value> {
        self.core.clone()
    }

    /// Reload from the store, dropping unwritten edits.
    pub fn read(&mut self) -> Result<(), CoreError> {
        let doc = read_doc(&self.st, &self.key)?
            .ok_or_else(|| CoreError::not_found("settings", self.key.as_str()))?;
        self.disk = unescape_map(doc.settings);
        self.core = self.disk.clone();
        self.version = doc.version;
        Ok(())
    }

    fn changes(&self) -> Vec<ItemChange> {
        let mut changes = Vec::new();
        for (key, old) in &self.disk {
            match self.core.get(key) {
                None => changes.push(ItemChange {
                    kind: ItemChangeKind::Deleted,
                    key: key.clone(),
                    old_value: Some(old.clone()),
                    new_value: None,
                }),
                Some(new) if new != old => changes.push(ItemChange {
                    kind: ItemChangeKind::Modified,
                    key: key.clone(),
                    old_value: Some(old.clone()),
                    new_value: Some(new.clone()),
                }),
                Some(_) => {}
            }
        }
        for (key, new) in &self.core {
            if !self.disk.contains_key(key) {
                changes.push(ItemChange {
                    kind: ItemChangeKind::Added,
                    key: key.clone(),
                    old_value: None,
                    new_value: Some(new.clone()),
                });
            }
        }
        changes.sort_by(|a, b| a.key.cmp(&b.key));
        changes
    }

    /// Write the edits made since the last read or write, returning them
    /// sorted by key. Nothing is written when there are no edits.
    pub fn write(&mut self) -> Result<Vec<ItemChange>, CoreError> {
        let changes = self.changes();
        if changes.is_empty() {
            return Ok(changes);
        }
        let mut updates: Vec<Update> = changes
            .iter()
            .map(|c| {
                let path = format!("{SETTINGS_FIELD}.{}", escape_key(&c.key));
                match &c.new_value {
                    Some(v) => Update::set(path, v.clone()),
                    None => Update::unset(path),
                }
            })
            .collect();
        updates.push(Update::inc(VERSION_FIELD, 1));
        updates.push(Update::set(MODEL_UUID_FIELD, self.st.model_uuid().as_str()));

        let st = Arc::clone(&self.st);
        st.run(|attempt| {
            if attempt > 0 && read_doc(&st, &self.key)?.is_none() {
                return Err(CoreError::not_found("settings", self.key.as_str()));
            }
            Ok(vec![Op::update(SETTINGS, st.doc_id(&self.key), updates.clone())
                .with_assert(Assert::Exists)])
        })?;
        debug!("wrote {} change(s) to settings {}", changes.len(), self.key);
        self.disk = self.core.clone();
        self.version += 1;
        Ok(changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> Arc<State> {
        State::builder("m").open().unwrap()
    }

    fn map(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs.iter().map(|(k, v)| ((*k).to_owned(), v.clone())).collect()
    }

    #[test]
    fn delta_writes_report_changes() {
        let st = state();
        let mut s = create_settings(&st, "k", map(&[("a", json!(1))])).unwrap();

        s.set("b", 2);
        let changes = s.write().unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ItemChangeKind::Added);
        assert_eq!(changes[0].key, "b");

        s.delete("a");
        let changes = s.write().unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ItemChangeKind::Deleted);
        assert_eq!(changes[0].old_value, Some(json!(1)));

        let fresh = read_settings(&st, "k").unwrap();
        assert_eq!(fresh.map(), map(&[("b", json!(2))]));
        assert_eq!(fresh.version(), 2);
    }

    #[test]
    fn changes_are_sorted_by_key() {
        let st = state();
        let mut s = create_settings(&st, "k", map(&[("m", json!("x")), ("z", json!(0))])).unwrap();
        s.set("a", true);
        s.set("m", "y");
        s.delete("z");
        let kinds: Vec<(String, ItemChangeKind)> =
            s.write().unwrap().into_iter().map(|c| (c.key, c.kind)).collect();
        assert_eq!(
            kinds,
            vec![
                ("a".to_owned(), ItemChangeKind::Added),
                ("m".to_owned(), ItemChangeKind::Modified),
                ("z".to_owned(), ItemChangeKind::Deleted),
            ]
        );
    }

    #[test]
    fn empty_delta_writes_nothing() {
        let st = state();
        let mut s = create_settings(&st, "k", map(&[("a", json!(1))])).unwrap();
        let before = st.store().find_one(SETTINGS, &st.doc_id("k")).unwrap().unwrap().revno;
        s.set("a", 1);
        assert!(s.write().unwrap().is_empty());
        let after = st.store().find_one(SETTINGS, &st.doc_id("k")).unwrap().unwrap().revno;
        assert_eq!(before, after);
    }

    #[test]
    fn concurrent_writers_merge_by_key() {
        let st = state();
        create_settings(&st, "k", BTreeMap::new()).unwrap();
        let mut one = read_settings(&st, "k").unwrap();
        let mut two = read_settings(&st, "k").unwrap();
        one.set("a", 1);
        two.set("b", 2);
        one.write().unwrap();
        two.write().unwrap();
        let merged = read_settings(&st, "k").unwrap();
        assert_eq!(merged.keys(), vec!["a".to_owned(), "b".to_owned()]);
    }

    #[test]
    fn dotted_and_dollar_keys_survive() {
        let st = state();
        let mut s = create_settings(&st, "k", map(&[("a.b", json!(1))])).unwrap();
        s.set("$c", "x");
        s.write().unwrap();
        let fresh = read_settings(&st, "k").unwrap();
        assert_eq!(fresh.get("a.b"), Some(&json!(1)));
        assert_eq!(fresh.get("$c"), Some(&json!("x")));
    }

    #[test]
    fn vanished_settings_are_not_found() {
        let st = state();
        let mut s = create_settings(&st, "k", BTreeMap::new()).unwrap();
        remove_settings(&st, "k").unwrap();
        s.set("a", 1);
        assert!(s.write().unwrap_err().is_not_found());
        assert!(s.read().unwrap_err().is_not_found());
        assert!(remove_settings(&st, "k").unwrap_err().is_not_found());
        assert!(read_settings(&st, "k").err().unwrap().is_not_found());
    }

    #[test]
    fn create_twice_and_replace() {
        let st = state();
        create_settings(&st, "k", map(&[("a", json!(1))])).unwrap();
        let err = create_settings(&st, "k", BTreeMap::new()).err().unwrap();
        assert!(err.is_already_exists());

        replace_settings(&st, "k", map(&[("c", json!(3))])).unwrap();
        assert_eq!(read_settings(&st, "k").unwrap().map(), map(&[("c", json!(3))]));
        assert!(replace_settings(&st, "missing", BTreeMap::new())
            .unwrap_err()
            .is_not_found());
    }
}
