//! Aggregate documents
//!
//! A collection is stored, mutated and replicated as one aggregate: a map
//! from record id to an arbitrary JSON record. Keys are kept sorted so the
//! serialized form is stable across writes.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// How a record changed between two versions of an aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Updated,
    Removed,
}

/// The full content of one collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Aggregate {
    records: BTreeMap<String, Value>,
}

impl Aggregate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode an aggregate from its serialized form.
    pub fn from_slice(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }

    /// Serialize for storage. Pretty-printed so stored revisions diff cleanly.
    pub fn to_vec(&self) -> serde_json::Result<Vec<u8>> {
        let mut data = serde_json::to_vec_pretty(self)?;
        data.push(b'\n');
        Ok(data)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Value> {
        self.records.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Value> {
        self.records.get_mut(id)
    }

    /// Decode one record into a typed value.
    ///
    /// Returns `Ok(None)` if the record does not exist.
    pub fn get_as<T: DeserializeOwned>(&self, id: &str) -> serde_json::Result<Option<T>> {
        match self.records.get(id) {
            Some(value) => serde_json::from_value(value.clone()).map(Some),
            None => Ok(None),
        }
    }

    /// Insert or replace a record, returning the previous value.
    pub fn insert(&mut self, id: impl Into<String>, record: Value) -> Option<Value> {
        self.records.insert(id.into(), record)
    }

    /// Serialize a typed record and insert it under `id`.
    pub fn insert_record<T: Serialize>(
        &mut self,
        id: impl Into<String>,
        record: &T,
    ) -> serde_json::Result<()> {
        let value = serde_json::to_value(record)?;
        self.records.insert(id.into(), value);
        Ok(())
    }

    /// Typed read-modify-write of one existing record.
    ///
    /// Returns `Ok(None)` without touching the aggregate if `id` is absent.
    pub fn update_record<T, R, F>(&mut self, id: &str, f: F) -> anyhow::Result<Option<R>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut T) -> anyhow::Result<R>,
    {
        let Some(value) = self.records.get_mut(id) else {
            return Ok(None);
        };
        let mut record: T = serde_json::from_value(value.clone())?;
        let out = f(&mut record)?;
        *value = serde_json::to_value(&record)?;
        Ok(Some(out))
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.records.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Per-record changes that turn `self` into `after`, in id order.
    pub fn diff(&self, after: &Aggregate) -> Vec<(String, ChangeKind)> {
        let mut changes = Vec::new();
        for (id, value) in &after.records {
            match self.records.get(id) {
                None => changes.push((id.clone(), ChangeKind::Created)),
                Some(old) if old != value => changes.push((id.clone(), ChangeKind::Updated)),
                Some(_) => {}
            }
        }
        for id in self.records.keys() {
            if !after.records.contains_key(id) {
                changes.push((id.clone(), ChangeKind::Removed));
            }
        }
        changes.sort_by(|a, b| a.0.cmp(&b.0));
        changes
    }
}

impl FromIterator<(String, Value)> for Aggregate {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            records: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Counter {
        hits: u32,
    }

    #[test]
    fn test_serialized_form_is_plain_object() {
        let mut agg = Aggregate::new();
        agg.insert("b", json!({"n": 2}));
        agg.insert("a", json!({"n": 1}));

        let data = agg.to_vec().unwrap();
        let value: Value = serde_json::from_slice(&data).unwrap();
        assert_eq!(value, json!({"a": {"n": 1}, "b": {"n": 2}}));

        let decoded = Aggregate::from_slice(&data).unwrap();
        assert_eq!(decoded, agg);
    }

    #[test]
    fn test_rejects_non_object() {
        assert!(Aggregate::from_slice(b"[1, 2, 3]").is_err());
        assert!(Aggregate::from_slice(b"").is_err());
    }

    #[test]
    fn test_update_record() {
        let mut agg = Aggregate::new();
        agg.insert_record("c1", &Counter { hits: 1 }).unwrap();

        let out = agg
            .update_record::<Counter, _, _>("c1", |c| {
                c.hits += 1;
                Ok(c.hits)
            })
            .unwrap();
        assert_eq!(out, Some(2));
        assert_eq!(agg.get_as::<Counter>("c1").unwrap(), Some(Counter { hits: 2 }));

        let missing = agg
            .update_record::<Counter, _, _>("nope", |c| Ok(c.hits))
            .unwrap();
        assert_eq!(missing, None);
        assert!(!agg.contains("nope"));
    }

    #[test]
    fn test_update_record_error_leaves_record() {
        let mut agg = Aggregate::new();
        agg.insert_record("c1", &Counter { hits: 5 }).unwrap();

        let result = agg.update_record::<Counter, (), _>("c1", |c| {
            c.hits = 0;
            anyhow::bail!("refused")
        });
        assert!(result.is_err());
        assert_eq!(agg.get_as::<Counter>("c1").unwrap(), Some(Counter { hits: 5 }));
    }

    #[test]
    fn test_diff() {
        let before: Aggregate = [
            ("keep".to_string(), json!(1)),
            ("edit".to_string(), json!(1)),
            ("gone".to_string(), json!(1)),
        ]
        .into_iter()
        .collect();
        let after: Aggregate = [
            ("keep".to_string(), json!(1)),
            ("edit".to_string(), json!(2)),
            ("new".to_string(), json!(1)),
        ]
        .into_iter()
        .collect();

        assert_eq!(
            before.diff(&after),
            vec![
                ("edit".to_string(), ChangeKind::Updated),
                ("gone".to_string(), ChangeKind::Removed),
                ("new".to_string(), ChangeKind::Created),
            ]
        );
        assert!(after.diff(&after).is_empty());
    }
}
