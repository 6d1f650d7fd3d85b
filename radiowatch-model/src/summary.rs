// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Summarization: project a subset of fields out of a record tree.
//!
//! Callers hand over `[path, rename]` pairs; the result is a summary
//! container holding the resolved elements (shared, not copied) plus a
//! rename map the serializer consults.  Paths that do not resolve become
//! named placeholders so consumers see every requested column.

use crate::element::{descend_path, Element, ElementRef, TrackedElement};
use crate::fields::{EntryTracker, FieldId};
use crate::serialize::RenameMap;

/// One requested field: a descent path plus an optional rename.
#[derive(Debug, Clone)]
pub struct SummaryField {
    pub path: Vec<FieldId>,
    pub rename: String,
}

impl SummaryField {
    pub fn new(path: Vec<FieldId>) -> Self {
        SummaryField {
            path,
            rename: String::new(),
        }
    }

    pub fn renamed(path: Vec<FieldId>, rename: impl Into<String>) -> Self {
        SummaryField {
            path,
            rename: rename.into(),
        }
    }
}

/// Build a summary of `root` containing only the requested paths.
///
/// Resolved elements are shared with the source tree.  A path that fans out
/// through a vector keeps only document order; a path that resolves to
/// nothing yields a placeholder named after its final segment (or the
/// rename, when given).
pub fn summarize(
    registry: &EntryTracker,
    root: &ElementRef,
    fields: &[SummaryField],
) -> (ElementRef, RenameMap) {
    let mut rename_map = RenameMap::new();
    let mut children: Vec<ElementRef> = Vec::with_capacity(fields.len());

    for field in fields {
        let mut resolved = descend_path(root, &field.path);

        if resolved.is_empty() {
            let name = if !field.rename.is_empty() {
                field.rename.clone()
            } else {
                field
                    .path
                    .last()
                    .and_then(|id| registry.field_name(*id))
                    .unwrap_or_default()
            };

            let id = field.path.last().copied().unwrap_or(FieldId::NONE);
            children.push(TrackedElement::new(id, Element::Placeholder(name)).into_ref());
            continue;
        }

        // A multi-element resolution flattens into the summary in document
        // order; only a single resolution can carry a rename without
        // colliding.
        if resolved.len() == 1 {
            let elem = resolved.remove(0);
            if !field.rename.is_empty() {
                rename_map.insert(&elem, field.rename.clone());
            }
            children.push(elem);
        } else {
            children.append(&mut resolved);
        }
    }

    let summary = TrackedElement::new(FieldId::NONE, Element::SummaryMap(children)).into_ref();
    (summary, rename_map)
}

/// Resolve `field1,field2/sub,...` name lists into summary fields.  Each
/// entry may be `path` or `path:rename`.
pub fn parse_summary_string(
    registry: &EntryTracker,
    fields: &str,
) -> Result<Vec<SummaryField>, crate::element::ElementError> {
    fields.split(',')
        .filter(|s| !s.is_empty())
        .map(|entry| {
            let (path, rename) = match entry.split_once(':') {
                Some((p, r)) => (p, r),
                None => (entry, ""),
            };
            Ok(SummaryField {
                path: registry.resolve_name_path(path)?,
                rename: rename.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::{scalar, KeyedMap};
    use crate::fields::ElementBuilder;
    use crate::serialize::register_default_serializers;
    use crate::ElementType;

    fn build_tree(reg: &EntryTracker) -> ElementRef {
        let root_id = reg
            .register_field("rec", ElementBuilder::Type(ElementType::Map), "record")
            .unwrap();
        let name_id = reg
            .register_field("rec.name", ElementBuilder::Type(ElementType::String), "name")
            .unwrap();
        let count_id = reg
            .register_field("rec.count", ElementBuilder::Type(ElementType::U32), "count")
            .unwrap();
        // registered but never populated
        reg.register_field("rec.ghost", ElementBuilder::Type(ElementType::U32), "ghost")
            .unwrap();

        let mut m = KeyedMap::new();
        m.entries
            .insert(name_id, scalar(name_id, Element::String("ap0".into())));
        m.entries.insert(count_id, scalar(count_id, Element::U32(4)));
        scalar(root_id, Element::Map(m))
    }

    #[test]
    fn test_summary_shares_elements() {
        let reg = EntryTracker::new();
        register_default_serializers(&reg);
        let root = build_tree(&reg);

        let fields = parse_summary_string(&reg, "rec.name,rec.count").unwrap();
        let (summary, renames) = summarize(&reg, &root, &fields);

        let mut buf = Vec::new();
        reg.serialize("json", &mut buf, &summary, Some(&renames))
            .unwrap();
        assert_eq!(
            String::from_utf8(buf).unwrap(),
            r#"{"rec.name": "ap0","rec.count": 4}"#
        );
    }

    #[test]
    fn test_summary_rename() {
        let reg = EntryTracker::new();
        register_default_serializers(&reg);
        let root = build_tree(&reg);

        let fields = parse_summary_string(&reg, "rec.name:ssid").unwrap();
        let (summary, renames) = summarize(&reg, &root, &fields);

        let mut buf = Vec::new();
        reg.serialize("json", &mut buf, &summary, Some(&renames))
            .unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), r#"{"ssid": "ap0"}"#);
    }

    #[test]
    fn test_unresolved_path_becomes_placeholder() {
        let reg = EntryTracker::new();
        register_default_serializers(&reg);
        let root = build_tree(&reg);

        let fields = parse_summary_string(&reg, "rec.ghost").unwrap();
        let (summary, renames) = summarize(&reg, &root, &fields);

        let mut buf = Vec::new();
        reg.serialize("json", &mut buf, &summary, Some(&renames))
            .unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), r#"{"rec.ghost": ""}"#);
    }
}
