// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Field registry.
//!
//! Maps human field names (`device.base.first_time`) to dense numeric ids
//! and back, carries the per-field description used by the pretty
//! serializer, and owns the named serializer registry.  Ids are assigned
//! monotonically and never reused for the lifetime of the process.

use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::element::{Element, ElementError, ElementRef, ElementType, TrackedElement};
use crate::serialize::{RenameMap, Serializer};

/// Dense field id.  Zero is never assigned and doubles as "no field".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct FieldId(u32);

impl FieldId {
    pub const NONE: FieldId = FieldId(0);

    pub fn from_raw(raw: u32) -> FieldId {
        FieldId(raw)
    }

    pub fn raw(&self) -> u32 {
        self.0
    }

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

/// How to build an instance of a registered field.
#[derive(Clone)]
pub enum ElementBuilder {
    /// Default value of a wire type.
    Type(ElementType),
    /// Deep-cloned prototype, for complex sub-records.
    Prototype(ElementRef),
}

impl ElementBuilder {
    fn element_type(&self) -> ElementType {
        match self {
            ElementBuilder::Type(t) => *t,
            ElementBuilder::Prototype(p) => match p.read() {
                Ok(g) => g.value.element_type(),
                Err(poisoned) => poisoned.into_inner().value.element_type(),
            },
        }
    }

    fn build(&self, id: FieldId) -> TrackedElement {
        match self {
            ElementBuilder::Type(t) => TrackedElement::new(id, Element::default_of(*t)),
            ElementBuilder::Prototype(p) => {
                let mut e = match p.read() {
                    Ok(g) => g.deep_clone(),
                    Err(poisoned) => poisoned.into_inner().deep_clone(),
                };
                e.set_id(id);
                e
            }
        }
    }
}

struct FieldDef {
    name: String,
    description: String,
    builder: ElementBuilder,
}

#[derive(Default)]
struct Registry {
    by_name: HashMap<String, FieldId>,
    // defs[n] describes field id n+1
    defs: Vec<FieldDef>,
}

/// Process-wide field registry, constructed once and passed by reference.
#[derive(Default)]
pub struct EntryTracker {
    registry: RwLock<Registry>,
    serializers: RwLock<HashMap<String, Arc<dyn Serializer>>>,
}

impl EntryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a field, idempotent on name.  Re-registering with a
    /// different element type is an error.
    pub fn register_field(
        &self,
        name: &str,
        builder: ElementBuilder,
        description: &str,
    ) -> Result<FieldId, ElementError> {
        let mut reg = match self.registry.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(&id) = reg.by_name.get(name) {
            let existing = &reg.defs[(id.0 - 1) as usize];
            let registered = existing.builder.element_type();
            let requested = builder.element_type();
            if registered != requested {
                return Err(ElementError::FieldTypeConflict {
                    name: name.to_string(),
                    registered: registered.as_str(),
                    requested: requested.as_str(),
                });
            }
            return Ok(id);
        }

        reg.defs.push(FieldDef {
            name: name.to_string(),
            description: description.to_string(),
            builder,
        });
        let id = FieldId(reg.defs.len() as u32);
        reg.by_name.insert(name.to_string(), id);
        Ok(id)
    }

    /// Register (or look up) a field and build an instance of it.
    pub fn register_and_get_field(
        &self,
        name: &str,
        builder: ElementBuilder,
        description: &str,
    ) -> Result<ElementRef, ElementError> {
        let id = self.register_field(name, builder, description)?;
        self.new_element(id)
    }

    /// Build a fresh element for an already-registered id.
    pub fn new_element(&self, id: FieldId) -> Result<ElementRef, ElementError> {
        let reg = match self.registry.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let def = reg
            .defs
            .get((id.0.wrapping_sub(1)) as usize)
            .ok_or_else(|| ElementError::UnknownField(format!("id {}", id.0)))?;
        Ok(def.builder.build(id).into_ref())
    }

    pub fn field_id(&self, name: &str) -> Option<FieldId> {
        match self.registry.read() {
            Ok(g) => g.by_name.get(name).copied(),
            Err(poisoned) => poisoned.into_inner().by_name.get(name).copied(),
        }
    }

    pub fn field_name(&self, id: FieldId) -> Option<String> {
        let reg = match self.registry.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        reg.defs
            .get((id.0.wrapping_sub(1)) as usize)
            .map(|d| d.name.clone())
    }

    pub fn field_description(&self, id: FieldId) -> Option<String> {
        let reg = match self.registry.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        reg.defs
            .get((id.0.wrapping_sub(1)) as usize)
            .map(|d| d.description.clone())
    }

    /// Resolve `a/b/c` into field ids.  Empty segments are skipped so
    /// `/a//b/` resolves like `a/b`.
    pub fn resolve_name_path(&self, path: &str) -> Result<Vec<FieldId>, ElementError> {
        path.split('/')
            .filter(|s| !s.is_empty())
            .map(|seg| {
                self.field_id(seg)
                    .ok_or_else(|| ElementError::UnknownField(seg.to_string()))
            })
            .collect()
    }

    pub fn register_serializer(&self, type_tag: &str, serializer: Arc<dyn Serializer>) {
        let mut sers = match self.serializers.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        sers.insert(type_tag.to_string(), serializer);
    }

    pub fn serialize(
        &self,
        type_tag: &str,
        writer: &mut dyn Write,
        root: &ElementRef,
        rename_map: Option<&RenameMap>,
    ) -> Result<(), ElementError> {
        let ser = {
            let sers = match self.serializers.read() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            sers.get(type_tag)
                .cloned()
                .ok_or_else(|| ElementError::UnknownSerializer(type_tag.to_string()))?
        };
        ser.serialize(self, root, writer, rename_map)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_is_idempotent_and_dense() {
        let reg = EntryTracker::new();

        let a = reg
            .register_field("a.first", ElementBuilder::Type(ElementType::U64), "first")
            .unwrap();
        let b = reg
            .register_field("a.second", ElementBuilder::Type(ElementType::String), "second")
            .unwrap();
        let a2 = reg
            .register_field("a.first", ElementBuilder::Type(ElementType::U64), "again")
            .unwrap();

        assert_eq!(a, a2);
        assert_eq!(b.raw(), a.raw() + 1);
    }

    #[test]
    fn test_name_id_inverse() {
        let reg = EntryTracker::new();
        for n in 0..100 {
            let name = format!("test.field.{n}");
            let id = reg
                .register_field(&name, ElementBuilder::Type(ElementType::U32), "d")
                .unwrap();
            assert_eq!(reg.field_name(id).unwrap(), name);
            assert_eq!(reg.field_id(&name).unwrap(), id);
        }
    }

    #[test]
    fn test_type_conflict() {
        let reg = EntryTracker::new();
        reg.register_field("x", ElementBuilder::Type(ElementType::U64), "d")
            .unwrap();
        let err = reg
            .register_field("x", ElementBuilder::Type(ElementType::String), "d")
            .unwrap_err();
        assert!(matches!(err, ElementError::FieldTypeConflict { .. }));
    }

    #[test]
    fn test_register_and_get_builds_instance() {
        let reg = EntryTracker::new();
        let e = reg
            .register_and_get_field("y", ElementBuilder::Type(ElementType::Map), "d")
            .unwrap();
        let guard = e.read().unwrap();
        assert_eq!(guard.value.element_type(), ElementType::Map);
        assert_eq!(guard.id(), reg.field_id("y").unwrap());
    }

    #[test]
    fn test_prototype_builder() {
        let reg = EntryTracker::new();
        let proto = TrackedElement::new(FieldId::NONE, Element::String("template".into())).into_ref();
        let id = reg
            .register_field("z", ElementBuilder::Prototype(proto), "d")
            .unwrap();
        let inst = reg.new_element(id).unwrap();
        assert_eq!(
            inst.read().unwrap().value.as_string().unwrap(),
            "template"
        );
    }

    #[test]
    fn test_resolve_name_path() {
        let reg = EntryTracker::new();
        let a = reg
            .register_field("outer", ElementBuilder::Type(ElementType::Map), "d")
            .unwrap();
        let b = reg
            .register_field("inner", ElementBuilder::Type(ElementType::U8), "d")
            .unwrap();

        assert_eq!(reg.resolve_name_path("outer/inner").unwrap(), vec![a, b]);
        assert!(reg.resolve_name_path("outer/missing").is_err());
    }
}
