// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The element value tree.
//!
//! An [`Element`] is one typed value; a [`TrackedElement`] is an element plus
//! the field id it was registered under and an optional serialize hook.
//! Nodes are shared as `Arc<RwLock<TrackedElement>>` so records, summaries,
//! and serializers can all point into the same tree; aliases hold weak
//! references and never form cycles.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, RwLock, Weak};

use rwcommon::{DeviceKey, MacAddr};
use uuid::Uuid;

use crate::fields::FieldId;

pub type ElementRef = Arc<RwLock<TrackedElement>>;
pub type WeakElementRef = Weak<RwLock<TrackedElement>>;

#[derive(Debug, thiserror::Error)]
pub enum ElementError {
    #[error("type mismatch: expected {expected}, got {got}")]
    TypeMismatch {
        expected: &'static str,
        got: &'static str,
    },
    #[error("element type {0} has no string form")]
    NotStringable(&'static str),
    #[error("cannot coerce {value:?} into {target}")]
    CoerceFailed {
        target: &'static str,
        value: String,
    },
    #[error("field {0:?} is not registered")]
    UnknownField(String),
    #[error("field {name:?} already registered as {registered}, requested {requested}")]
    FieldTypeConflict {
        name: String,
        registered: &'static str,
        requested: &'static str,
    },
    #[error("no serializer registered for {0:?}")]
    UnknownSerializer(String),
    #[error("path does not resolve: {0}")]
    BadPath(String),
    #[error("serialization failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Pre/post serialization callbacks, used by records that must sync derived
/// state into their element tree right before it is written (RRD
/// fast-forward is the main customer).
pub trait SerializeHook: Send + Sync {
    fn pre_serialize(&self);
    fn post_serialize(&self) {}
}

/// `f64` wrapper with a total order, for double-keyed maps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrderedF64(pub f64);

impl Eq for OrderedF64 {}

impl PartialOrd for OrderedF64 {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedF64 {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Common representation for keyed aggregate elements.  `as_vector` drops
/// the keys at serialization time; `as_key_vector` drops the values and
/// emits the keys.  Neither changes in-memory semantics.
#[derive(Debug, Default, Clone)]
pub struct KeyedMap<K: Ord> {
    pub entries: BTreeMap<K, ElementRef>,
    pub as_vector: bool,
    pub as_key_vector: bool,
}

impl<K: Ord> KeyedMap<K> {
    pub fn new() -> Self {
        KeyedMap {
            entries: BTreeMap::new(),
            as_vector: false,
            as_key_vector: false,
        }
    }

    pub fn render_as_vector(mut self, v: bool) -> Self {
        self.as_vector = v;
        self
    }
}

/// Type tag for every element variant.  Registration and coercion work in
/// terms of tags; the tag set is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    String,
    ByteArray,
    Mac,
    Uuid,
    Ipv4,
    Key,
    Map,
    IntMap,
    DoubleMap,
    MacMap,
    UuidMap,
    KeyMap,
    HashkeyMap,
    DoubleMapDouble,
    Vector,
    VectorDouble,
    VectorString,
    PairDouble,
    Alias,
    Placeholder,
    SummaryMap,
}

impl ElementType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ElementType::I8 => "int8",
            ElementType::I16 => "int16",
            ElementType::I32 => "int32",
            ElementType::I64 => "int64",
            ElementType::U8 => "uint8",
            ElementType::U16 => "uint16",
            ElementType::U32 => "uint32",
            ElementType::U64 => "uint64",
            ElementType::F32 => "float",
            ElementType::F64 => "double",
            ElementType::String => "string",
            ElementType::ByteArray => "bytearray",
            ElementType::Mac => "mac_addr",
            ElementType::Uuid => "uuid",
            ElementType::Ipv4 => "ipv4",
            ElementType::Key => "device_key",
            ElementType::Map => "map[field]",
            ElementType::IntMap => "map[int]",
            ElementType::DoubleMap => "map[double]",
            ElementType::MacMap => "map[mac]",
            ElementType::UuidMap => "map[uuid]",
            ElementType::KeyMap => "map[device_key]",
            ElementType::HashkeyMap => "map[hashkey]",
            ElementType::DoubleMapDouble => "map[double,double]",
            ElementType::Vector => "vector",
            ElementType::VectorDouble => "vector[double]",
            ElementType::VectorString => "vector[string]",
            ElementType::PairDouble => "pair[double]",
            ElementType::Alias => "alias",
            ElementType::Placeholder => "placeholder",
            ElementType::SummaryMap => "summary",
        }
    }
}

#[derive(Debug, Clone)]
pub enum Element {
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    String(String),
    ByteArray(Vec<u8>),
    Mac(MacAddr),
    Uuid(Uuid),
    Ipv4(Ipv4Addr),
    Key(DeviceKey),
    Map(KeyedMap<FieldId>),
    IntMap(KeyedMap<u64>),
    DoubleMap(KeyedMap<OrderedF64>),
    MacMap(KeyedMap<MacAddr>),
    UuidMap(KeyedMap<Uuid>),
    KeyMap(KeyedMap<DeviceKey>),
    HashkeyMap(KeyedMap<u64>),
    DoubleMapDouble {
        entries: BTreeMap<OrderedF64, f64>,
        as_vector: bool,
        as_key_vector: bool,
    },
    Vector(Vec<ElementRef>),
    VectorDouble(Vec<f64>),
    VectorString(Vec<String>),
    PairDouble(f64, f64),
    Alias {
        alias_name: String,
        target: WeakElementRef,
    },
    Placeholder(String),
    /// Product of summarization: children keep their own ids/names but the
    /// container serializes as a single object.
    SummaryMap(Vec<ElementRef>),
}

impl Element {
    pub fn element_type(&self) -> ElementType {
        match self {
            Element::I8(_) => ElementType::I8,
            Element::I16(_) => ElementType::I16,
            Element::I32(_) => ElementType::I32,
            Element::I64(_) => ElementType::I64,
            Element::U8(_) => ElementType::U8,
            Element::U16(_) => ElementType::U16,
            Element::U32(_) => ElementType::U32,
            Element::U64(_) => ElementType::U64,
            Element::F32(_) => ElementType::F32,
            Element::F64(_) => ElementType::F64,
            Element::String(_) => ElementType::String,
            Element::ByteArray(_) => ElementType::ByteArray,
            Element::Mac(_) => ElementType::Mac,
            Element::Uuid(_) => ElementType::Uuid,
            Element::Ipv4(_) => ElementType::Ipv4,
            Element::Key(_) => ElementType::Key,
            Element::Map(_) => ElementType::Map,
            Element::IntMap(_) => ElementType::IntMap,
            Element::DoubleMap(_) => ElementType::DoubleMap,
            Element::MacMap(_) => ElementType::MacMap,
            Element::UuidMap(_) => ElementType::UuidMap,
            Element::KeyMap(_) => ElementType::KeyMap,
            Element::HashkeyMap(_) => ElementType::HashkeyMap,
            Element::DoubleMapDouble { .. } => ElementType::DoubleMapDouble,
            Element::Vector(_) => ElementType::Vector,
            Element::VectorDouble(_) => ElementType::VectorDouble,
            Element::VectorString(_) => ElementType::VectorString,
            Element::PairDouble(..) => ElementType::PairDouble,
            Element::Alias { .. } => ElementType::Alias,
            Element::Placeholder(_) => ElementType::Placeholder,
            Element::SummaryMap(_) => ElementType::SummaryMap,
        }
    }

    pub fn default_of(t: ElementType) -> Element {
        match t {
            ElementType::I8 => Element::I8(0),
            ElementType::I16 => Element::I16(0),
            ElementType::I32 => Element::I32(0),
            ElementType::I64 => Element::I64(0),
            ElementType::U8 => Element::U8(0),
            ElementType::U16 => Element::U16(0),
            ElementType::U32 => Element::U32(0),
            ElementType::U64 => Element::U64(0),
            ElementType::F32 => Element::F32(0.0),
            ElementType::F64 => Element::F64(0.0),
            ElementType::String => Element::String(String::new()),
            ElementType::ByteArray => Element::ByteArray(Vec::new()),
            ElementType::Mac => Element::Mac(MacAddr::ZERO),
            ElementType::Uuid => Element::Uuid(Uuid::nil()),
            ElementType::Ipv4 => Element::Ipv4(Ipv4Addr::UNSPECIFIED),
            ElementType::Key => Element::Key(DeviceKey::default()),
            ElementType::Map => Element::Map(KeyedMap::new()),
            ElementType::IntMap => Element::IntMap(KeyedMap::new()),
            ElementType::DoubleMap => Element::DoubleMap(KeyedMap::new()),
            ElementType::MacMap => Element::MacMap(KeyedMap::new()),
            ElementType::UuidMap => Element::UuidMap(KeyedMap::new()),
            ElementType::KeyMap => Element::KeyMap(KeyedMap::new()),
            ElementType::HashkeyMap => Element::HashkeyMap(KeyedMap::new()),
            ElementType::DoubleMapDouble => Element::DoubleMapDouble {
                entries: BTreeMap::new(),
                as_vector: false,
                as_key_vector: false,
            },
            ElementType::Vector => Element::Vector(Vec::new()),
            ElementType::VectorDouble => Element::VectorDouble(Vec::new()),
            ElementType::VectorString => Element::VectorString(Vec::new()),
            ElementType::PairDouble => Element::PairDouble(0.0, 0.0),
            ElementType::Alias => Element::Alias {
                alias_name: String::new(),
                target: Weak::new(),
            },
            ElementType::Placeholder => Element::Placeholder(String::new()),
            ElementType::SummaryMap => Element::SummaryMap(Vec::new()),
        }
    }

    /// Scalar types that have a canonical string form.
    pub fn is_stringable(&self) -> bool {
        matches!(
            self,
            Element::I8(_)
                | Element::I16(_)
                | Element::I32(_)
                | Element::I64(_)
                | Element::U8(_)
                | Element::U16(_)
                | Element::U32(_)
                | Element::U64(_)
                | Element::F32(_)
                | Element::F64(_)
                | Element::String(_)
                | Element::ByteArray(_)
                | Element::Mac(_)
                | Element::Uuid(_)
                | Element::Ipv4(_)
                | Element::Key(_)
        )
    }

    /// Stringable types that must be quoted when serialized.
    pub fn needs_quotes(&self) -> bool {
        matches!(
            self,
            Element::String(_)
                | Element::ByteArray(_)
                | Element::Mac(_)
                | Element::Uuid(_)
                | Element::Ipv4(_)
                | Element::Key(_)
        )
    }

    /// Render a double the way the wire format expects: integral values lose
    /// the decimals, non-finite values collapse to zero.
    pub fn format_double(v: f64) -> String {
        if v.is_nan() || v.is_infinite() {
            return "0".to_string();
        }
        if v.floor() == v && v.abs() < 9.2e18 {
            format!("{}", v as i64)
        } else {
            format!("{v:.6}")
        }
    }

    pub fn as_string(&self) -> Result<String, ElementError> {
        match self {
            Element::I8(v) => Ok(v.to_string()),
            Element::I16(v) => Ok(v.to_string()),
            Element::I32(v) => Ok(v.to_string()),
            Element::I64(v) => Ok(v.to_string()),
            Element::U8(v) => Ok(v.to_string()),
            Element::U16(v) => Ok(v.to_string()),
            Element::U32(v) => Ok(v.to_string()),
            Element::U64(v) => Ok(v.to_string()),
            Element::F32(v) => Ok(Self::format_double(*v as f64)),
            Element::F64(v) => Ok(Self::format_double(*v)),
            Element::String(s) => Ok(s.clone()),
            Element::ByteArray(b) => Ok(String::from_utf8_lossy(b).into_owned()),
            Element::Mac(m) => Ok(m.to_string()),
            Element::Uuid(u) => Ok(u.to_string()),
            Element::Ipv4(i) => Ok(i.to_string()),
            Element::Key(k) => Ok(k.to_string()),
            other => Err(ElementError::NotStringable(other.element_type().as_str())),
        }
    }

    /// Coercive set from a string.  Numeric types parse, mac/uuid/ipv4/key
    /// parse strictly, aggregates refuse.
    pub fn set_from_string(&mut self, s: &str) -> Result<(), ElementError> {
        fn num<T: std::str::FromStr>(s: &str, target: &'static str) -> Result<T, ElementError> {
            s.trim().parse().map_err(|_| ElementError::CoerceFailed {
                target,
                value: s.to_string(),
            })
        }

        match self {
            Element::I8(v) => *v = num(s, "int8")?,
            Element::I16(v) => *v = num(s, "int16")?,
            Element::I32(v) => *v = num(s, "int32")?,
            Element::I64(v) => *v = num(s, "int64")?,
            Element::U8(v) => *v = num(s, "uint8")?,
            Element::U16(v) => *v = num(s, "uint16")?,
            Element::U32(v) => *v = num(s, "uint32")?,
            Element::U64(v) => *v = num(s, "uint64")?,
            Element::F32(v) => *v = num(s, "float")?,
            Element::F64(v) => *v = num(s, "double")?,
            Element::String(v) => *v = s.to_string(),
            Element::ByteArray(v) => *v = s.as_bytes().to_vec(),
            Element::Mac(v) => {
                *v = s.parse().map_err(|_| ElementError::CoerceFailed {
                    target: "mac_addr",
                    value: s.to_string(),
                })?
            }
            Element::Uuid(v) => {
                *v = s.parse().map_err(|_| ElementError::CoerceFailed {
                    target: "uuid",
                    value: s.to_string(),
                })?
            }
            Element::Ipv4(v) => {
                *v = s.parse().map_err(|_| ElementError::CoerceFailed {
                    target: "ipv4",
                    value: s.to_string(),
                })?
            }
            Element::Key(v) => {
                *v = s.parse().map_err(|_| ElementError::CoerceFailed {
                    target: "device_key",
                    value: s.to_string(),
                })?
            }
            other => {
                return Err(ElementError::CoerceFailed {
                    target: other.element_type().as_str(),
                    value: s.to_string(),
                })
            }
        }
        Ok(())
    }

    /// Coercive set from a number, clamping into the target's range is an
    /// error rather than a silent wrap.
    pub fn set_from_f64(&mut self, n: f64) -> Result<(), ElementError> {
        fn int<T: TryFrom<i64>>(n: f64, target: &'static str) -> Result<T, ElementError> {
            let as_i = n as i64;
            if as_i as f64 != n {
                return Err(ElementError::CoerceFailed {
                    target,
                    value: n.to_string(),
                });
            }
            T::try_from(as_i).map_err(|_| ElementError::CoerceFailed {
                target,
                value: n.to_string(),
            })
        }

        match self {
            Element::I8(v) => *v = int(n, "int8")?,
            Element::I16(v) => *v = int(n, "int16")?,
            Element::I32(v) => *v = int(n, "int32")?,
            Element::I64(v) => *v = int(n, "int64")?,
            Element::U8(v) => *v = int(n, "uint8")?,
            Element::U16(v) => *v = int(n, "uint16")?,
            Element::U32(v) => *v = int(n, "uint32")?,
            Element::U64(v) => {
                if n < 0.0 {
                    return Err(ElementError::CoerceFailed {
                        target: "uint64",
                        value: n.to_string(),
                    });
                }
                *v = n as u64;
            }
            Element::F32(v) => *v = n as f32,
            Element::F64(v) => *v = n,
            other => {
                return Err(ElementError::CoerceFailed {
                    target: other.element_type().as_str(),
                    value: n.to_string(),
                })
            }
        }
        Ok(())
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Element::I8(v) => Some(*v as f64),
            Element::I16(v) => Some(*v as f64),
            Element::I32(v) => Some(*v as f64),
            Element::I64(v) => Some(*v as f64),
            Element::U8(v) => Some(*v as f64),
            Element::U16(v) => Some(*v as f64),
            Element::U32(v) => Some(*v as f64),
            Element::U64(v) => Some(*v as f64),
            Element::F32(v) => Some(*v as f64),
            Element::F64(v) => Some(*v),
            _ => None,
        }
    }

    /// Scalar ordering; strings compare alphanumerically, other stringables
    /// by string form, numbers numerically.  Aggregates do not order.
    pub fn less_than(&self, other: &Element) -> Result<bool, ElementError> {
        if let (Some(a), Some(b)) = (self.as_f64(), other.as_f64()) {
            return Ok(a < b);
        }

        if self.is_stringable() && other.is_stringable() {
            return Ok(self.as_string()? < other.as_string()?);
        }

        Err(ElementError::TypeMismatch {
            expected: self.element_type().as_str(),
            got: other.element_type().as_str(),
        })
    }
}

/// An element plus its registered field id and optional serialize hook.
pub struct TrackedElement {
    id: FieldId,
    pub value: Element,
    hook: Option<Weak<dyn SerializeHook>>,
}

impl TrackedElement {
    pub fn new(id: FieldId, value: Element) -> Self {
        TrackedElement {
            id,
            value,
            hook: None,
        }
    }

    pub fn into_ref(self) -> ElementRef {
        Arc::new(RwLock::new(self))
    }

    pub fn id(&self) -> FieldId {
        self.id
    }

    pub fn set_id(&mut self, id: FieldId) {
        self.id = id;
    }

    pub fn set_hook(&mut self, hook: Weak<dyn SerializeHook>) {
        self.hook = Some(hook);
    }

    pub fn hook(&self) -> Option<Arc<dyn SerializeHook>> {
        self.hook.as_ref().and_then(|w| w.upgrade())
    }

    /// Deep copy.  Children are cloned into fresh nodes; aliases keep their
    /// weak target.
    pub fn deep_clone(&self) -> TrackedElement {
        fn clone_children(v: &[ElementRef]) -> Vec<ElementRef> {
            v.iter().map(clone_ref).collect()
        }

        fn clone_map<K: Ord + Clone>(m: &KeyedMap<K>) -> KeyedMap<K> {
            KeyedMap {
                entries: m
                    .entries
                    .iter()
                    .map(|(k, v)| (k.clone(), clone_ref(v)))
                    .collect(),
                as_vector: m.as_vector,
                as_key_vector: m.as_key_vector,
            }
        }

        fn clone_ref(e: &ElementRef) -> ElementRef {
            match e.read() {
                Ok(guard) => guard.deep_clone().into_ref(),
                Err(poisoned) => poisoned.into_inner().deep_clone().into_ref(),
            }
        }

        let value = match &self.value {
            Element::Map(m) => Element::Map(clone_map(m)),
            Element::IntMap(m) => Element::IntMap(clone_map(m)),
            Element::DoubleMap(m) => Element::DoubleMap(clone_map(m)),
            Element::MacMap(m) => Element::MacMap(clone_map(m)),
            Element::UuidMap(m) => Element::UuidMap(clone_map(m)),
            Element::KeyMap(m) => Element::KeyMap(clone_map(m)),
            Element::HashkeyMap(m) => Element::HashkeyMap(clone_map(m)),
            Element::Vector(v) => Element::Vector(clone_children(v)),
            Element::SummaryMap(v) => Element::SummaryMap(clone_children(v)),
            other => other.clone(),
        };

        TrackedElement {
            id: self.id,
            value,
            hook: self.hook.clone(),
        }
    }
}

impl std::fmt::Debug for TrackedElement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedElement")
            .field("id", &self.id)
            .field("value", &self.value)
            .finish()
    }
}

/// Build a scalar node.
pub fn scalar(id: FieldId, value: Element) -> ElementRef {
    TrackedElement::new(id, value).into_ref()
}

fn read(e: &ElementRef) -> std::sync::RwLockReadGuard<'_, TrackedElement> {
    match e.read() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write(e: &ElementRef) -> std::sync::RwLockWriteGuard<'_, TrackedElement> {
    match e.write() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Insert into a field-id-keyed map node, replacing any existing child.
pub fn map_insert(map: &ElementRef, child: ElementRef) -> Result<(), ElementError> {
    let id = read(&child).id();
    let mut guard = write(map);
    match &mut guard.value {
        Element::Map(m) => {
            m.entries.insert(id, child);
            Ok(())
        }
        other => Err(ElementError::TypeMismatch {
            expected: "map[field]",
            got: other.element_type().as_str(),
        }),
    }
}

/// Fetch a child of a field-id-keyed map node.
pub fn map_get(map: &ElementRef, id: FieldId) -> Option<ElementRef> {
    match &read(map).value {
        Element::Map(m) => m.entries.get(&id).cloned(),
        _ => None,
    }
}

/// Single-step alias resolution.
pub fn resolve_alias(e: &ElementRef) -> Option<ElementRef> {
    let guard = read(e);
    match &guard.value {
        Element::Alias { target, .. } => target.upgrade(),
        _ => {
            drop(guard);
            Some(e.clone())
        }
    }
}

/// Walk a path of field ids from `root`, descending through aliases.  A
/// vector or non-field-keyed map in mid-path fans out into every child, so
/// the result is a flattened list in document order.
pub fn descend_path(root: &ElementRef, path: &[FieldId]) -> Vec<ElementRef> {
    let Some(node) = resolve_alias(root) else {
        return Vec::new();
    };

    let Some((head, rest)) = path.split_first() else {
        return vec![node];
    };

    let guard = read(&node);
    match &guard.value {
        Element::Map(m) => match m.entries.get(head) {
            Some(child) => {
                let child = child.clone();
                drop(guard);
                descend_path(&child, rest)
            }
            None => Vec::new(),
        },
        Element::Vector(children) | Element::SummaryMap(children) => {
            let children = children.clone();
            drop(guard);
            children
                .iter()
                .flat_map(|c| descend_path(c, path))
                .collect()
        }
        Element::IntMap(m) => fan_out(m, path),
        Element::DoubleMap(m) => fan_out(m, path),
        Element::MacMap(m) => fan_out(m, path),
        Element::UuidMap(m) => fan_out(m, path),
        Element::KeyMap(m) => fan_out(m, path),
        Element::HashkeyMap(m) => fan_out(m, path),
        _ => Vec::new(),
    }
}

fn fan_out<K: Ord>(m: &KeyedMap<K>, path: &[FieldId]) -> Vec<ElementRef> {
    m.entries
        .values()
        .flat_map(|c| descend_path(c, path))
        .collect()
}
