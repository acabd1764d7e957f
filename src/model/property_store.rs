//! PropertyStore — the ordered key-value table owned by every object.
//!
//! Enumerated keys are indexed for O(1) lookup; user keys are found by a
//! linear scan. Records are kept sorted (enumerated keys by wire code, then
//! user keys alphabetically ignoring a leading `@`) so iteration by index is
//! stable within a session.
//!
//! Every record carries a `modified` flag. `take_modified()` drains the
//! published, modified records for the next outbound announcement, which is
//! what makes `push()` a no-op when nothing changed.

use std::cmp::Ordering;

use hashbrown::HashMap;

use super::{FromValue, Prop, PropKey, Property, Value};
use crate::{Error, Result};

/// Who may write a record after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadWrite,
    /// Fixed at creation (id, direction, length, type, ...).
    Static,
}

#[derive(Debug, Clone)]
struct Record {
    prop: Property,
    access: Access,
    modified: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PropertyStore {
    records: Vec<Record>,
    index: HashMap<Prop, usize>,
}

fn strip_at(s: &str) -> &str {
    s.strip_prefix('@').unwrap_or(s)
}

fn compare_keys(l: &PropKey, r: &PropKey) -> Ordering {
    match (l, r) {
        (PropKey::Known(a), PropKey::Known(b)) => a.code().cmp(&b.code()),
        (PropKey::Known(_), PropKey::Extra(_)) => Ordering::Less,
        (PropKey::Extra(_), PropKey::Known(_)) => Ordering::Greater,
        (PropKey::Extra(a), PropKey::Extra(b)) => strip_at(a).cmp(strip_at(b)),
    }
}

fn check_shape(prop: Prop, value: &Value) -> Result<()> {
    let Some((ty, len)) = prop.shape() else { return Ok(()) };
    if value.is_null() || (value.type_of() == ty && len.is_none_or(|n| value.len() == n)) {
        return Ok(());
    }
    let expected = match len {
        Some(n) => format!("{prop}: {}[{n}]", ty.name()),
        None => format!("{prop}: {}", ty.name()),
    };
    Err(Error::TypeMismatch { expected, got: format!("{}[{}]", value.type_name(), value.len()) })
}

impl PropertyStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, key: &PropKey) -> Option<usize> {
        match key {
            PropKey::Known(p) => self.index.get(p).copied(),
            PropKey::Extra(name) => {
                let name = strip_at(name);
                self.records.iter().position(|r| match &r.prop.key {
                    PropKey::Extra(other) => strip_at(other) == name,
                    PropKey::Known(_) => false,
                })
            }
        }
    }

    fn reindex(&mut self) {
        self.index.clear();
        for (i, rec) in self.records.iter().enumerate() {
            if let PropKey::Known(p) = rec.prop.key {
                self.index.insert(p, i);
            }
        }
    }

    fn insert(&mut self, rec: Record) {
        let at = self.records
            .binary_search_by(|probe| compare_keys(&probe.prop.key, &rec.prop.key))
            .unwrap_or_else(|i| i);
        self.records.insert(at, rec);
        self.reindex();
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Look up a property. Unset and empty properties are both absent.
    pub fn get(&self, key: impl Into<PropKey>) -> Option<&Property> {
        let key = key.into();
        self.position(&key)
            .map(|i| &self.records[i].prop)
            .filter(|p| !p.value.is_null())
    }

    pub fn value(&self, key: impl Into<PropKey>) -> Option<&Value> {
        self.get(key).map(|p| &p.value)
    }

    /// Typed read. A stored type that differs from `T` is an error.
    pub fn get_as<T: FromValue>(&self, key: impl Into<PropKey>) -> Result<Option<T>> {
        self.value(key).map(T::from_value).transpose()
    }

    /// Number of non-empty properties.
    pub fn len(&self) -> usize {
        self.records.iter().filter(|r| !r.prop.value.is_null()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The `index`-th non-empty property in iteration order.
    pub fn get_by_index(&self, index: usize) -> Option<&Property> {
        self.iter().nth(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Property> + '_ {
        self.records.iter().map(|r| &r.prop).filter(|p| !p.value.is_null())
    }

    /// Non-empty properties flagged for publication.
    pub fn published(&self) -> impl Iterator<Item = &Property> + '_ {
        self.iter().filter(|p| p.publish)
    }

    pub fn has_modified(&self) -> bool {
        self.records.iter().any(|r| r.modified && r.prop.publish)
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// User write. Returns whether the stored value changed.
    ///
    /// A value for an enumerated key must have that key's type and length.
    pub fn set(&mut self, key: impl Into<PropKey>, value: impl Into<Value>, publish: bool) -> Result<bool> {
        let key = key.into();
        let value = value.into().normalized();
        if let Some(i) = self.position(&key) {
            if self.records[i].access == Access::Static {
                return Err(Error::ReadOnly(format!("property '{key}' is static")));
            }
        }
        if let PropKey::Known(prop) = key {
            check_shape(prop, &value)?;
        }
        Ok(self.write(key, value, publish, Access::ReadWrite, true))
    }

    /// Write bypassing the access check, marking the record modified if it
    /// changed. Used for bookkeeping properties such as `status`.
    pub fn set_internal(&mut self, key: impl Into<PropKey>, value: impl Into<Value>) -> bool {
        let key = key.into();
        let (publish, access) = match self.position(&key) {
            Some(i) => (self.records[i].prop.publish, self.records[i].access),
            None => (true, Access::ReadWrite),
        };
        self.write(key, value.into(), publish, access, true)
    }

    /// Initial value at object creation; not marked modified.
    pub fn init(&mut self, key: impl Into<PropKey>, value: impl Into<Value>, access: Access) {
        self.write(key.into(), value.into(), true, access, false);
    }

    /// Static, unpublished bookkeeping value (e.g. this process's view of `status`).
    pub fn init_local(&mut self, key: impl Into<PropKey>, value: impl Into<Value>) {
        self.write(key.into(), value.into(), false, Access::Static, false);
    }

    fn write(&mut self, key: PropKey, value: Value, publish: bool, access: Access, mark: bool) -> bool {
        let value = value.normalized();
        match self.position(&key) {
            Some(i) => {
                let rec = &mut self.records[i];
                let changed = rec.prop.value != value || rec.prop.publish != publish;
                if changed {
                    rec.prop.value = value;
                    rec.prop.publish = publish;
                    rec.modified |= mark;
                }
                changed
            }
            None if value.is_null() => false,
            None => {
                self.insert(Record {
                    prop: Property { key, value, publish },
                    access,
                    modified: mark,
                });
                true
            }
        }
    }

    /// Remove a property. Enumerated keys are reset to empty; user keys are
    /// deleted once the removal has been published.
    pub fn remove(&mut self, key: impl Into<PropKey>) -> Result<bool> {
        let key = key.into();
        let Some(i) = self.position(&key) else { return Ok(false) };
        let rec = &mut self.records[i];
        if rec.access == Access::Static {
            return Err(Error::ReadOnly(format!("property '{key}' is static")));
        }
        if rec.prop.value.is_null() {
            return Ok(false);
        }
        rec.prop.value = Value::Null;
        rec.modified = true;
        Ok(true)
    }

    /// Drain published modifications for an announcement. Removed records
    /// are reported with a null value so peers delete them too.
    pub fn take_modified(&mut self) -> Vec<Property> {
        let mut out = Vec::new();
        for rec in &mut self.records {
            if rec.modified && rec.prop.publish {
                out.push(rec.prop.clone());
            }
            rec.modified = false;
        }
        let before = self.records.len();
        self.records.retain(|r| !(r.prop.value.is_null() && matches!(r.prop.key, PropKey::Extra(_))));
        if self.records.len() != before {
            self.reindex();
        }
        out
    }

    /// Apply properties received from the authoritative owner of a record.
    /// Returns the number of properties that changed.
    pub fn apply_remote<'a>(&mut self, props: impl IntoIterator<Item = &'a Property>) -> usize {
        let mut changed = 0;
        for p in props {
            let access = match self.position(&p.key) {
                Some(i) => self.records[i].access,
                None => Access::ReadWrite,
            };
            if p.value.is_null() {
                if let Some(i) = self.position(&p.key) {
                    if !self.records[i].prop.value.is_null() {
                        self.records[i].prop.value = Value::Null;
                        changed += 1;
                    }
                }
                continue;
            }
            if self.write(p.key.clone(), p.value.clone(), p.publish, access, false) {
                changed += 1;
            }
        }
        changed
    }
}
