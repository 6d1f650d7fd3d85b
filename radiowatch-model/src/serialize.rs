// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! JSON serialization of element trees.
//!
//! One packer, four adapters: plain JSON, pretty JSON (adds
//! `description.<name>` metadata siblings), ek-json (top-level vectors
//! stream one object per line, `.` becomes `_` in names), and it-json
//! (one object per line, names preserved).
//!
//! Output rules are part of the wire contract: non-finite numbers emit as
//! `0`, integral doubles drop their decimals, map keys are always strings,
//! and control bytes in strings are escaped.

use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::Arc;

use crate::element::{Element, ElementRef, KeyedMap, OrderedF64};
use crate::fields::{EntryTracker, FieldId};

/// Renames applied by summarization, keyed by node identity.
#[derive(Debug, Default)]
pub struct RenameMap {
    renames: HashMap<usize, String>,
}

impl RenameMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, element: &ElementRef, rename: String) {
        self.renames.insert(Arc::as_ptr(element) as usize, rename);
    }

    pub fn get(&self, element: &ElementRef) -> Option<&str> {
        self.renames
            .get(&(Arc::as_ptr(element) as usize))
            .map(|s| s.as_str())
    }
}

/// A named serializer, registered in the entry tracker.
pub trait Serializer: Send + Sync {
    fn serialize(
        &self,
        registry: &EntryTracker,
        root: &ElementRef,
        writer: &mut dyn Write,
        rename_map: Option<&RenameMap>,
    ) -> io::Result<()>;
}

/// Escape `"`, `\` and control bytes for embedding in a JSON string.
pub fn sanitize_string(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\u{8}' => out.push_str("\\b"),
            '\u{c}' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out
}

struct PackContext<'a> {
    registry: &'a EntryTracker,
    rename_map: Option<&'a RenameMap>,
    pretty: bool,
    permuter: &'a dyn Fn(&str) -> String,
}

impl PackContext<'_> {
    fn ppendl(&self) -> &'static str {
        if self.pretty {
            "\r\n"
        } else {
            ""
        }
    }

    fn indent(&self, depth: usize) -> String {
        if self.pretty {
            " ".repeat(depth)
        } else {
            String::new()
        }
    }

    /// Resolve the display name of a map child: summary rename first, then
    /// placeholder/alias self-names, then the registry.
    fn child_name(&self, key: FieldId, child: &ElementRef) -> String {
        if let Some(rm) = self.rename_map {
            if let Some(rename) = rm.get(child) {
                if !rename.is_empty() {
                    return rename.to_string();
                }
            }
        }

        let own = {
            let guard = read(child);
            match &guard.value {
                Element::Placeholder(name) => Some(name.clone()),
                Element::Alias { alias_name, .. } => Some(alias_name.clone()),
                _ => None,
            }
        };

        if let Some(name) = own {
            if !name.is_empty() {
                return name;
            }
        }

        let id = if key.is_none() { read(child).id() } else { key };
        self.registry.field_name(id).unwrap_or_default()
    }
}

fn read(e: &ElementRef) -> std::sync::RwLockReadGuard<'_, crate::element::TrackedElement> {
    match e.read() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn format_map_double_key(k: f64) -> String {
    if k.is_nan() || k.is_infinite() {
        "0".to_string()
    } else if k.floor() == k && k.abs() < 9.2e18 {
        format!("{}", k as i64)
    } else {
        format!("{k:.6}")
    }
}

/// Serialize one element tree.  `depth` only affects pretty indentation.
fn pack_json(
    w: &mut dyn Write,
    e: &ElementRef,
    ctx: &PackContext<'_>,
    depth: usize,
) -> io::Result<()> {
    // Aliases remap to their target; a dead alias serializes as nothing.
    let e = match crate::element::resolve_alias(e) {
        Some(t) => t,
        None => return Ok(()),
    };

    // Let the owner sync derived state (RRD fast-forward and friends)
    // before we look at the values.
    let hook = read(&e).hook();
    if let Some(h) = &hook {
        h.pre_serialize();
    }

    let result = pack_value(w, &e, ctx, depth);

    if let Some(h) = &hook {
        h.post_serialize();
    }

    result
}

fn pack_value(
    w: &mut dyn Write,
    e: &ElementRef,
    ctx: &PackContext<'_>,
    depth: usize,
) -> io::Result<()> {
    let guard = read(e);

    if guard.value.is_stringable() {
        let s = guard
            .value
            .as_string()
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?;
        return if guard.value.needs_quotes() {
            write!(w, "\"{}\"", sanitize_string(&s))
        } else {
            w.write_all(s.as_bytes())
        };
    }

    let ppendl = ctx.ppendl();
    let indent = ctx.indent(depth);

    match &guard.value {
        Element::Placeholder(_) => {
            // A placeholder marks a path that never resolved; there is no
            // value to write.
            write!(w, "\"\"")
        }
        Element::PairDouble(a, b) => {
            write!(
                w,
                "[{}, {}]",
                Element::format_double(*a),
                Element::format_double(*b)
            )
        }
        Element::Vector(children) => {
            let children = children.clone();
            drop(guard);
            write!(w, "{ppendl}{indent}[{ppendl}")?;
            let mut first = true;
            for child in &children {
                if !first {
                    write!(w, ",{ppendl}")?;
                }
                first = false;
                write!(w, "{indent}")?;
                pack_json(w, child, ctx, depth + 1)?;
            }
            write!(w, "{ppendl}{indent}]")
        }
        Element::VectorDouble(vals) => {
            write!(w, "{ppendl}{indent}[{ppendl}")?;
            let mut first = true;
            for v in vals {
                if !first {
                    write!(w, ",{ppendl}")?;
                }
                first = false;
                write!(w, "{indent}{}", Element::format_double(*v))?;
            }
            write!(w, "{ppendl}{indent}]")
        }
        Element::VectorString(vals) => {
            write!(w, "{ppendl}{indent}[{ppendl}")?;
            let mut first = true;
            for v in vals {
                if !first {
                    write!(w, ",{ppendl}")?;
                }
                first = false;
                write!(w, "{indent}\"{}\"", sanitize_string(v))?;
            }
            write!(w, "{ppendl}{indent}]")
        }
        Element::Map(m) => {
            let m = m.clone();
            drop(guard);
            pack_field_map(w, &m, ctx, depth)
        }
        Element::SummaryMap(children) => {
            let children = children.clone();
            drop(guard);
            pack_summary_map(w, &children, ctx, depth)
        }
        Element::IntMap(m) => {
            let m = m.clone();
            drop(guard);
            pack_keyed_map(w, &m, ctx, depth, |k| k.to_string())
        }
        Element::HashkeyMap(m) => {
            let m = m.clone();
            drop(guard);
            pack_keyed_map(w, &m, ctx, depth, |k| k.to_string())
        }
        Element::MacMap(m) => {
            let m = m.clone();
            drop(guard);
            pack_keyed_map(w, &m, ctx, depth, |k| k.to_string())
        }
        Element::UuidMap(m) => {
            let m = m.clone();
            drop(guard);
            pack_keyed_map(w, &m, ctx, depth, |k| k.to_string())
        }
        Element::KeyMap(m) => {
            let m = m.clone();
            drop(guard);
            pack_keyed_map(w, &m, ctx, depth, |k| k.to_string())
        }
        Element::DoubleMap(m) => {
            let m = m.clone();
            drop(guard);
            pack_keyed_map(w, &m, ctx, depth, |k| format_map_double_key(k.0))
        }
        Element::DoubleMapDouble {
            entries,
            as_vector,
            as_key_vector,
        } => {
            let (entries, as_vector, as_key_vector) =
                (entries.clone(), *as_vector, *as_key_vector);
            drop(guard);
            pack_double_map_double(w, &entries, as_vector, as_key_vector, ctx, depth)
        }
        // Stringables and aliases were handled above.
        _ => Ok(()),
    }
}

fn pack_field_map(
    w: &mut dyn Write,
    m: &KeyedMap<FieldId>,
    ctx: &PackContext<'_>,
    depth: usize,
) -> io::Result<()> {
    let ppendl = ctx.ppendl();
    let indent = ctx.indent(depth);
    let flat = m.as_vector || m.as_key_vector;

    write!(w, "{ppendl}{indent}{}{ppendl}", if flat { "[" } else { "{" })?;

    let mut first = true;
    for (key, child) in &m.entries {
        if !first {
            write!(w, ",{ppendl}")?;
            if ctx.pretty {
                write!(w, "{ppendl}")?;
            }
        }
        first = false;

        if !flat {
            let name = sanitize_string(&(ctx.permuter)(&ctx.child_name(*key, child)));

            if ctx.pretty {
                let type_str = read(child).value.element_type().as_str();
                let desc = ctx.registry.field_description(*key).unwrap_or_default();
                write!(
                    w,
                    "{indent}\"description.{name}\": \"{}, {}\",{ppendl}",
                    sanitize_string(type_str),
                    sanitize_string(&desc)
                )?;
            }

            write!(w, "{indent}\"{name}\": ")?;
        }

        pack_json(w, child, ctx, depth + 1)?;
    }

    write!(w, "{ppendl}{indent}{}", if flat { "]" } else { "}" })
}

fn pack_summary_map(
    w: &mut dyn Write,
    children: &[ElementRef],
    ctx: &PackContext<'_>,
    depth: usize,
) -> io::Result<()> {
    let ppendl = ctx.ppendl();
    let indent = ctx.indent(depth);

    write!(w, "{ppendl}{indent}{{{ppendl}")?;

    let mut first = true;
    for child in children {
        if !first {
            write!(w, ",{ppendl}")?;
            if ctx.pretty {
                write!(w, "{ppendl}")?;
            }
        }
        first = false;

        let name = sanitize_string(&(ctx.permuter)(&ctx.child_name(FieldId::NONE, child)));

        if ctx.pretty {
            let (type_str, id) = {
                let g = read(child);
                (g.value.element_type().as_str(), g.id())
            };
            let desc = ctx.registry.field_description(id).unwrap_or_default();
            write!(
                w,
                "{indent}\"description.{name}\": \"{}, {}\",{ppendl}",
                sanitize_string(type_str),
                sanitize_string(&desc)
            )?;
        }

        write!(w, "{indent}\"{name}\": ")?;
        pack_json(w, child, ctx, depth + 1)?;
    }

    write!(w, "{ppendl}{indent}}}")
}

fn pack_keyed_map<K: Ord>(
    w: &mut dyn Write,
    m: &KeyedMap<K>,
    ctx: &PackContext<'_>,
    depth: usize,
    key_fmt: impl Fn(&K) -> String,
) -> io::Result<()> {
    let ppendl = ctx.ppendl();
    let indent = ctx.indent(depth);
    let flat = m.as_vector || m.as_key_vector;

    write!(w, "{ppendl}{indent}{}{ppendl}", if flat { "[" } else { "{" })?;

    let mut first = true;
    for (key, child) in &m.entries {
        if !first {
            write!(w, ",{ppendl}")?;
        }
        first = false;

        if !m.as_vector {
            write!(w, "{indent}\"{}\"", sanitize_string(&key_fmt(key)))?;
            if !m.as_key_vector {
                write!(w, ": ")?;
            }
        }

        if !m.as_key_vector {
            pack_json(w, child, ctx, depth + 1)?;
        }
    }

    write!(w, "{ppendl}{indent}{}", if flat { "]" } else { "}" })
}

fn pack_double_map_double(
    w: &mut dyn Write,
    entries: &std::collections::BTreeMap<OrderedF64, f64>,
    as_vector: bool,
    as_key_vector: bool,
    ctx: &PackContext<'_>,
    depth: usize,
) -> io::Result<()> {
    let ppendl = ctx.ppendl();
    let indent = ctx.indent(depth);
    let flat = as_vector || as_key_vector;

    write!(w, "{ppendl}{indent}{}{ppendl}", if flat { "[" } else { "{" })?;

    let mut first = true;
    for (key, val) in entries {
        if !first {
            write!(w, ",{ppendl}")?;
        }
        first = false;

        if !as_vector {
            write!(w, "{indent}\"{}\"", format_map_double_key(key.0))?;
            if !as_key_vector {
                write!(w, ": ")?;
            }
        }

        if !as_key_vector {
            write!(w, "{}", Element::format_double(*val))?;
        }
    }

    write!(w, "{ppendl}{indent}{}", if flat { "]" } else { "}" })
}

fn identity(s: &str) -> String {
    s.to_string()
}

fn underscore(s: &str) -> String {
    s.replace('.', "_")
}

/// Standard JSON adapter.
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize(
        &self,
        registry: &EntryTracker,
        root: &ElementRef,
        writer: &mut dyn Write,
        rename_map: Option<&RenameMap>,
    ) -> io::Result<()> {
        let ctx = PackContext {
            registry,
            rename_map,
            pretty: false,
            permuter: &identity,
        };
        pack_json(writer, root, &ctx, 0)
    }
}

/// Pretty JSON adapter: indentation plus description metadata fields.
pub struct PrettyJsonSerializer;

impl Serializer for PrettyJsonSerializer {
    fn serialize(
        &self,
        registry: &EntryTracker,
        root: &ElementRef,
        writer: &mut dyn Write,
        rename_map: Option<&RenameMap>,
    ) -> io::Result<()> {
        let ctx = PackContext {
            registry,
            rename_map,
            pretty: true,
            permuter: &identity,
        };
        pack_json(writer, root, &ctx, 1)
    }
}

/// ELK-style streamed JSON: a top-level vector becomes one complete object
/// per line, and dots in field names become underscores.
pub struct EkJsonSerializer;

impl Serializer for EkJsonSerializer {
    fn serialize(
        &self,
        registry: &EntryTracker,
        root: &ElementRef,
        writer: &mut dyn Write,
        rename_map: Option<&RenameMap>,
    ) -> io::Result<()> {
        let ctx = PackContext {
            registry,
            rename_map,
            pretty: false,
            permuter: &underscore,
        };
        serialize_linewise(writer, root, &ctx)
    }
}

/// Iterative JSON: one object per line, field names preserved.
pub struct ItJsonSerializer;

impl Serializer for ItJsonSerializer {
    fn serialize(
        &self,
        registry: &EntryTracker,
        root: &ElementRef,
        writer: &mut dyn Write,
        rename_map: Option<&RenameMap>,
    ) -> io::Result<()> {
        let ctx = PackContext {
            registry,
            rename_map,
            pretty: false,
            permuter: &identity,
        };
        serialize_linewise(writer, root, &ctx)
    }
}

fn serialize_linewise(
    writer: &mut dyn Write,
    root: &ElementRef,
    ctx: &PackContext<'_>,
) -> io::Result<()> {
    let top_vector = {
        let guard = read(root);
        match &guard.value {
            Element::Vector(children) => Some(children.clone()),
            _ => None,
        }
    };

    match top_vector {
        Some(children) => {
            for child in &children {
                pack_json(writer, child, ctx, 0)?;
                writer.write_all(b"\n")?;
            }
            Ok(())
        }
        None => {
            pack_json(writer, root, ctx, 0)?;
            writer.write_all(b"\n")
        }
    }
}

/// Register the standard adapters under their wire names.
pub fn register_default_serializers(registry: &EntryTracker) {
    registry.register_serializer("json", Arc::new(JsonSerializer));
    registry.register_serializer("prettyjson", Arc::new(PrettyJsonSerializer));
    registry.register_serializer("ekjson", Arc::new(EkJsonSerializer));
    registry.register_serializer("itjson", Arc::new(ItJsonSerializer));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::{scalar, Element, KeyedMap, TrackedElement};
    use crate::fields::{ElementBuilder, EntryTracker};
    use crate::ElementType;

    fn to_json(reg: &EntryTracker, e: &ElementRef) -> String {
        let mut buf = Vec::new();
        reg.serialize("json", &mut buf, e, None).unwrap();
        String::from_utf8(buf).unwrap()
    }

    fn setup() -> EntryTracker {
        let reg = EntryTracker::new();
        register_default_serializers(&reg);
        reg
    }

    #[test]
    fn test_scalars() {
        let reg = setup();
        let id = reg
            .register_field("t.num", ElementBuilder::Type(ElementType::U32), "n")
            .unwrap();

        assert_eq!(to_json(&reg, &scalar(id, Element::U32(17))), "17");
        assert_eq!(to_json(&reg, &scalar(id, Element::F64(3.0))), "3");
        assert_eq!(to_json(&reg, &scalar(id, Element::F64(3.25))), "3.250000");
        assert_eq!(to_json(&reg, &scalar(id, Element::F64(f64::NAN))), "0");
        assert_eq!(
            to_json(&reg, &scalar(id, Element::String("a\"b\\c\x01".into()))),
            "\"a\\\"b\\\\c\\u0001\""
        );
    }

    #[test]
    fn test_map_object() {
        let reg = setup();
        let outer = reg
            .register_field("t.outer", ElementBuilder::Type(ElementType::Map), "outer")
            .unwrap();
        let f_a = reg
            .register_field("t.alpha", ElementBuilder::Type(ElementType::U8), "alpha")
            .unwrap();
        let f_b = reg
            .register_field("t.beta", ElementBuilder::Type(ElementType::String), "beta")
            .unwrap();

        let mut m = KeyedMap::new();
        m.entries.insert(f_a, scalar(f_a, Element::U8(7)));
        m.entries
            .insert(f_b, scalar(f_b, Element::String("x".into())));
        let root = scalar(outer, Element::Map(m));

        assert_eq!(to_json(&reg, &root), r#"{"t.alpha": 7,"t.beta": "x"}"#);
    }

    #[test]
    fn test_map_as_vector() {
        let reg = setup();
        let outer = reg
            .register_field("v.outer", ElementBuilder::Type(ElementType::Map), "outer")
            .unwrap();
        let f_a = reg
            .register_field("v.alpha", ElementBuilder::Type(ElementType::U8), "alpha")
            .unwrap();

        let mut m = KeyedMap::new().render_as_vector(true);
        m.entries.insert(f_a, scalar(f_a, Element::U8(9)));
        let root = scalar(outer, Element::Map(m));

        assert_eq!(to_json(&reg, &root), "[9]");
    }

    #[test]
    fn test_int_map_keys_are_strings() {
        let reg = setup();
        let outer = reg
            .register_field("i.outer", ElementBuilder::Type(ElementType::IntMap), "o")
            .unwrap();
        let inner = reg
            .register_field("i.val", ElementBuilder::Type(ElementType::U16), "v")
            .unwrap();

        let mut m = KeyedMap::new();
        m.entries.insert(5u64, scalar(inner, Element::U16(50)));
        m.entries.insert(6u64, scalar(inner, Element::U16(60)));
        let root = scalar(outer, Element::IntMap(m));

        assert_eq!(to_json(&reg, &root), r#"{"5": 50,"6": 60}"#);
    }

    #[test]
    fn test_double_map_key_formats() {
        let reg = setup();
        let outer = reg
            .register_field("d.outer", ElementBuilder::Type(ElementType::DoubleMapDouble), "o")
            .unwrap();

        let mut entries = std::collections::BTreeMap::new();
        entries.insert(OrderedF64(2412000.0), 4.0);
        entries.insert(OrderedF64(2.5), 1.5);
        let root = scalar(
            outer,
            Element::DoubleMapDouble {
                entries,
                as_vector: false,
                as_key_vector: false,
            },
        );

        assert_eq!(to_json(&reg, &root), r#"{"2.500000": 1.500000,"2412000": 4}"#);
    }

    #[test]
    fn test_vector_double_and_strings() {
        let reg = setup();
        let id = reg
            .register_field("vec", ElementBuilder::Type(ElementType::VectorDouble), "v")
            .unwrap();

        let root = scalar(id, Element::VectorDouble(vec![1.0, 2.5, f64::NAN]));
        assert_eq!(to_json(&reg, &root), "[1,2.500000,0]");

        let root = scalar(id, Element::VectorString(vec!["a".into(), "b\"".into()]));
        assert_eq!(to_json(&reg, &root), r#"["a","b\""]"#);
    }

    #[test]
    fn test_pair_double() {
        let reg = setup();
        let id = reg
            .register_field("pair", ElementBuilder::Type(ElementType::PairDouble), "p")
            .unwrap();
        let root = scalar(id, Element::PairDouble(1.0, -2.25));
        assert_eq!(to_json(&reg, &root), "[1, -2.250000]");
    }

    #[test]
    fn test_pretty_description_siblings() {
        let reg = setup();
        let outer = reg
            .register_field("p.outer", ElementBuilder::Type(ElementType::Map), "outer map")
            .unwrap();
        let f_a = reg
            .register_field("p.alpha", ElementBuilder::Type(ElementType::U8), "the alpha")
            .unwrap();

        let mut m = KeyedMap::new();
        m.entries.insert(f_a, scalar(f_a, Element::U8(1)));
        let root = scalar(outer, Element::Map(m));

        let mut buf = Vec::new();
        reg.serialize("prettyjson", &mut buf, &root, None).unwrap();
        let out = String::from_utf8(buf).unwrap();

        assert!(out.contains("\"description.p.alpha\": \"uint8, the alpha\""));
        assert!(out.contains("\"p.alpha\": 1"));
    }

    #[test]
    fn test_ekjson_lines_and_underscores() {
        let reg = setup();
        let vec_id = reg
            .register_field("e.vec", ElementBuilder::Type(ElementType::Vector), "v")
            .unwrap();
        let map_id = reg
            .register_field("e.map", ElementBuilder::Type(ElementType::Map), "m")
            .unwrap();
        let leaf = reg
            .register_field("e.dot.name", ElementBuilder::Type(ElementType::U8), "l")
            .unwrap();

        let mk = |v: u8| {
            let mut m = KeyedMap::new();
            m.entries.insert(leaf, scalar(leaf, Element::U8(v)));
            TrackedElement::new(map_id, Element::Map(m)).into_ref()
        };
        let root = scalar(vec_id, Element::Vector(vec![mk(1), mk(2)]));

        let mut buf = Vec::new();
        reg.serialize("ekjson", &mut buf, &root, None).unwrap();
        let out = String::from_utf8(buf).unwrap();

        let lines: Vec<&str> = out.trim_end().lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], r#"{"e_dot_name": 1}"#);
        assert_eq!(lines[1], r#"{"e_dot_name": 2}"#);

        // it-json keeps the dots
        let mut buf = Vec::new();
        reg.serialize("itjson", &mut buf, &root, None).unwrap();
        let out = String::from_utf8(buf).unwrap();
        assert!(out.starts_with(r#"{"e.dot.name": 1}"#));
    }

    #[test]
    fn test_serialize_hooks_fire_around_pack() {
        use crate::element::SerializeHook;
        use std::sync::atomic::{AtomicU64, Ordering};

        struct SyncHook {
            target: crate::element::WeakElementRef,
            pre: AtomicU64,
            post: AtomicU64,
        }

        impl SerializeHook for SyncHook {
            fn pre_serialize(&self) {
                self.pre.fetch_add(1, Ordering::SeqCst);
                // update derived state right before it is written, the way
                // an RRD fast-forwards
                if let Some(target) = self.target.upgrade() {
                    if let Ok(mut guard) = target.write() {
                        guard.value = Element::U64(42);
                    }
                }
            }

            fn post_serialize(&self) {
                self.post.fetch_add(1, Ordering::SeqCst);
            }
        }

        let reg = setup();
        let id = reg
            .register_field("h.val", ElementBuilder::Type(ElementType::U64), "v")
            .unwrap();
        let elem = scalar(id, Element::U64(0));

        let hook = std::sync::Arc::new(SyncHook {
            target: std::sync::Arc::downgrade(&elem),
            pre: AtomicU64::new(0),
            post: AtomicU64::new(0),
        });
        elem.write().unwrap().set_hook(std::sync::Arc::downgrade(
            &(hook.clone() as std::sync::Arc<dyn SerializeHook>),
        ));

        assert_eq!(to_json(&reg, &elem), "42");
        assert_eq!(hook.pre.load(Ordering::SeqCst), 1);
        assert_eq!(hook.post.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_alias_serializes_as_target() {
        let reg = setup();
        let t_id = reg
            .register_field("a.target", ElementBuilder::Type(ElementType::U32), "t")
            .unwrap();
        let a_id = reg
            .register_field("a.alias", ElementBuilder::Type(ElementType::Alias), "a")
            .unwrap();

        let target = scalar(t_id, Element::U32(99));
        let alias = scalar(
            a_id,
            Element::Alias {
                alias_name: "shortcut".into(),
                target: std::sync::Arc::downgrade(&target),
            },
        );

        assert_eq!(to_json(&reg, &alias), "99");
    }
}
