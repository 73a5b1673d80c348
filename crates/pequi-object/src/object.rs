//! Distributed objects
//!
//! A distributed object is a bag of named fields, plain attributes and
//! keyed entry sets, declared in an explicit field table at construction.
//! State changes only ever happen by applying events; the owning manager's
//! event loop is the sole mutator.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::debug;

use pequi_api::event::{DEvent, EventBody};
use pequi_api::model::{EntrySet, Oid};
use pequi_api::remote::ObjectSnapshot;

/// The kind of one declared field
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldKind {
    Attribute,
    Set,
}

/// One declared field of a distributed object
#[derive(Clone, Debug)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
}

/// The field table of a distributed object, registered at construction.
///
/// Fields are not discovered at runtime; only declared fields can be read or
/// mutated, and the table is what an administrative caller enumerates.
#[derive(Clone, Debug, Default)]
pub struct ObjectSpec {
    pub class: &'static str,
    pub fields: Vec<FieldSpec>,
}

impl ObjectSpec {
    pub fn new(class: &'static str) -> Self {
        Self {
            class,
            fields: Vec::new(),
        }
    }

    pub fn attribute(mut self, name: &'static str) -> Self {
        self.fields.push(FieldSpec {
            name,
            kind: FieldKind::Attribute,
        });
        self
    }

    pub fn set(mut self, name: &'static str) -> Self {
        self.fields.push(FieldSpec {
            name,
            kind: FieldKind::Set,
        });
        self
    }
}

/// Why an event could not be applied to an object
#[derive(thiserror::Error, Debug)]
pub enum ApplyError {
    #[error("object {class} has no field '{name}'")]
    UnknownField { class: String, name: String },

    #[error("field '{name}' is not of the mutated kind")]
    KindMismatch { name: String },

    #[error("compound events cannot nest")]
    NestedCompound,
}

/// A replicated entity: named attributes plus named entry sets.
///
/// The authoritative instance is owned by its manager's event loop; mirrors
/// carry the same state and are mutated only by incoming events.
#[derive(Debug)]
pub struct DObject {
    oid: Oid,
    class: String,
    attributes: BTreeMap<String, Value>,
    sets: BTreeMap<String, EntrySet>,
}

impl DObject {
    pub fn new(oid: Oid, spec: ObjectSpec) -> Self {
        let mut attributes = BTreeMap::new();
        let mut sets = BTreeMap::new();
        for field in &spec.fields {
            match field.kind {
                FieldKind::Attribute => {
                    attributes.insert(field.name.to_string(), Value::Null);
                }
                FieldKind::Set => {
                    sets.insert(field.name.to_string(), EntrySet::new());
                }
            }
        }
        Self {
            oid,
            class: spec.class.to_string(),
            attributes,
            sets,
        }
    }

    /// Reconstructs an object from a snapshot, used to bootstrap mirrors
    pub fn from_snapshot(oid: Oid, snapshot: ObjectSnapshot) -> Self {
        Self {
            oid,
            class: snapshot.class,
            attributes: snapshot.attributes,
            sets: snapshot.sets,
        }
    }

    pub fn oid(&self) -> Oid {
        self.oid
    }

    pub fn class_name(&self) -> &str {
        &self.class
    }

    /// The current value of a declared attribute
    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    /// A declared entry set
    pub fn entry_set(&self, name: &str) -> Option<&EntrySet> {
        self.sets.get(name)
    }

    /// Enumerates the declared fields, for administrative inspection
    pub fn field_names(&self) -> Vec<(String, FieldKind)> {
        let mut fields: Vec<(String, FieldKind)> = self
            .attributes
            .keys()
            .map(|n| (n.clone(), FieldKind::Attribute))
            .collect();
        fields.extend(self.sets.keys().map(|n| (n.clone(), FieldKind::Set)));
        fields
    }

    /// Full state of this object, the bootstrap payload for new subscribers
    pub fn snapshot(&self) -> ObjectSnapshot {
        ObjectSnapshot {
            oid: self.oid,
            class: self.class.clone(),
            attributes: self.attributes.clone(),
            sets: self.sets.clone(),
        }
    }

    /// Checks that a mutation addresses a declared field of the right kind
    /// without applying anything
    pub fn validate(&self, body: &EventBody) -> Result<(), ApplyError> {
        match body {
            EventBody::AttributeChanged { name, .. } => {
                if self.attributes.contains_key(name) || self.sets.contains_key(name) {
                    Ok(())
                } else {
                    Err(self.unknown_field(name))
                }
            }
            EventBody::EntryAdded { name, .. }
            | EventBody::EntryRemoved { name, .. }
            | EventBody::EntryUpdated { name, .. } => {
                if self.sets.contains_key(name) {
                    Ok(())
                } else if self.attributes.contains_key(name) {
                    Err(ApplyError::KindMismatch { name: name.clone() })
                } else {
                    Err(self.unknown_field(name))
                }
            }
            EventBody::Compound { events } => {
                for event in events {
                    if matches!(event, EventBody::Compound { .. }) {
                        return Err(ApplyError::NestedCompound);
                    }
                    self.validate(event)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Applies one mutation.
    ///
    /// A compound batch is validated in full before any member applies, so
    /// observers never see a partial subset. Idempotent entry signals
    /// (duplicate add, absent remove, absent update) leave the object
    /// unchanged and are not errors.
    pub fn apply(&mut self, body: &EventBody) -> Result<(), ApplyError> {
        self.validate(body)?;
        self.apply_validated(body);
        Ok(())
    }

    fn apply_validated(&mut self, body: &EventBody) {
        match body {
            EventBody::AttributeChanged { name, value } => {
                if let Some(slot) = self.attributes.get_mut(name) {
                    *slot = value.clone();
                } else if let Some(set) = self.sets.get_mut(name) {
                    // wholesale replacement of an entry set
                    match serde_json::from_value::<EntrySet>(value.clone()) {
                        Ok(replacement) => *set = replacement,
                        Err(e) => debug!(
                            class = %self.class,
                            field = %name,
                            error = %e,
                            "ignoring set replacement that does not parse"
                        ),
                    }
                }
            }
            EventBody::EntryAdded { name, key, entry } => {
                if let Some(set) = self.sets.get_mut(name)
                    && set.add(key.clone(), entry.clone())
                {
                    debug!(class = %self.class, field = %name, key = %key,
                        "refusing to add duplicate entry");
                }
            }
            EventBody::EntryRemoved { name, key } => {
                if let Some(set) = self.sets.get_mut(name)
                    && set.remove(key).is_none()
                {
                    debug!(class = %self.class, field = %name, key = %key,
                        "requested to remove absent entry");
                }
            }
            EventBody::EntryUpdated { name, key, entry } => {
                if let Some(set) = self.sets.get_mut(name)
                    && set.update(key.clone(), entry.clone()).is_none()
                {
                    debug!(class = %self.class, field = %name, key = %key,
                        "requested to update absent entry");
                }
            }
            EventBody::Compound { events } => {
                for event in events {
                    self.apply_validated(event);
                }
            }
            // messages and invocations carry no object state
            EventBody::Message { .. }
            | EventBody::InvocationRequest { .. }
            | EventBody::InvocationResponse { .. } => {}
        }
    }

    fn unknown_field(&self, name: &str) -> ApplyError {
        ApplyError::UnknownField {
            class: self.class.clone(),
            name: name.to_string(),
        }
    }
}

/// A callback bound to one object, notified on the event loop after each
/// event applies, in registration order
pub trait EventListener: Send {
    fn event_applied(&mut self, object: &DObject, event: &DEvent);
}

impl<F> EventListener for F
where
    F: FnMut(&DObject, &DEvent) + Send,
{
    fn event_applied(&mut self, object: &DObject, event: &DEvent) {
        self(object, event)
    }
}

#[cfg(test)]
mod tests {
    use pequi_api::model::EntryKey;
    use serde_json::json;

    use super::*;

    fn sample_object() -> DObject {
        DObject::new(
            Oid(1),
            ObjectSpec::new("sample")
                .attribute("title")
                .set("members"),
        )
    }

    #[test]
    fn test_attribute_change_applies() {
        let mut obj = sample_object();
        obj.apply(&EventBody::AttributeChanged {
            name: "title".to_string(),
            value: json!("hello"),
        })
        .unwrap();
        assert_eq!(obj.attribute("title"), Some(&json!("hello")));
    }

    #[test]
    fn test_unknown_field_is_error() {
        let mut obj = sample_object();
        let err = obj
            .apply(&EventBody::AttributeChanged {
                name: "bogus".to_string(),
                value: json!(1),
            })
            .unwrap_err();
        assert!(matches!(err, ApplyError::UnknownField { .. }));
    }

    #[test]
    fn test_entry_mutation_on_attribute_is_kind_mismatch() {
        let mut obj = sample_object();
        let err = obj
            .apply(&EventBody::EntryRemoved {
                name: "title".to_string(),
                key: EntryKey::Int(1),
            })
            .unwrap_err();
        assert!(matches!(err, ApplyError::KindMismatch { .. }));
    }

    #[test]
    fn test_duplicate_add_leaves_object_unchanged() {
        let mut obj = sample_object();
        obj.apply(&EventBody::EntryAdded {
            name: "members".to_string(),
            key: EntryKey::from("a"),
            entry: json!({"v": 1}),
        })
        .unwrap();
        obj.apply(&EventBody::EntryAdded {
            name: "members".to_string(),
            key: EntryKey::from("a"),
            entry: json!({"v": 2}),
        })
        .unwrap();

        let set = obj.entry_set("members").unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.get(&EntryKey::from("a")), Some(&json!({"v": 1})));
    }

    #[test]
    fn test_compound_with_bad_member_applies_nothing() {
        let mut obj = sample_object();
        let err = obj
            .apply(&EventBody::Compound {
                events: vec![
                    EventBody::AttributeChanged {
                        name: "title".to_string(),
                        value: json!("set"),
                    },
                    EventBody::AttributeChanged {
                        name: "bogus".to_string(),
                        value: json!(1),
                    },
                ],
            })
            .unwrap_err();
        assert!(matches!(err, ApplyError::UnknownField { .. }));
        // first member must not have leaked through
        assert_eq!(obj.attribute("title"), Some(&Value::Null));
    }

    #[test]
    fn test_set_replacement_via_attribute_change() {
        let mut obj = sample_object();
        let mut replacement = EntrySet::new();
        replacement.add(EntryKey::from("x"), json!(1));

        obj.apply(&EventBody::AttributeChanged {
            name: "members".to_string(),
            value: serde_json::to_value(&replacement).unwrap(),
        })
        .unwrap();
        assert_eq!(obj.entry_set("members").unwrap().len(), 1);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mut obj = sample_object();
        obj.apply(&EventBody::AttributeChanged {
            name: "title".to_string(),
            value: json!("snap"),
        })
        .unwrap();
        obj.apply(&EventBody::EntryAdded {
            name: "members".to_string(),
            key: EntryKey::Int(4),
            entry: json!(4),
        })
        .unwrap();

        let mirror = DObject::from_snapshot(Oid(99), obj.snapshot());
        assert_eq!(mirror.oid(), Oid(99));
        assert_eq!(mirror.class_name(), "sample");
        assert_eq!(mirror.attribute("title"), Some(&json!("snap")));
        assert_eq!(mirror.entry_set("members").unwrap().len(), 1);
    }
}
