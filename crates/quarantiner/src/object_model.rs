//! Object model shared by every realm: values, property descriptors, the
//! generation-indexed object arena, and wrapper invariant checks.
//!
//! Key features:
//!
//! - **Property descriptors**: data vs accessor, configurable/enumerable/writable
//! - **Ordinary internal methods**: get-own, define-own (with non-configurable
//!   compatibility rules), delete, own-keys ordering, extensibility
//! - **Arena**: `ObjectHandle { index, generation }`; freeing a slot bumps its
//!   generation so stale handles are detected instead of aliasing new objects
//! - **Wrapper invariants**: results reported through an interception wrapper
//!   are validated against the wrapped target
//!
//! Object kinds other than `Ordinary` keep their extra state inline
//! (array elements, function metadata, wrapper slot, completion handle).
//! Operations that need to run code (getters, wrapper dispatch) live on
//! [`crate::agent::Agent`]; this module only holds the pure heap algorithms.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::completion::CompletionHandle;
use crate::interception::WrapperSlot;

/// Serialize/deserialize `BTreeMap<PropertyKey, PropertyDescriptor>` as a
/// sorted sequence of `[key, descriptor]` pairs.  serde_json requires string
/// keys for JSON maps but `PropertyKey` is an enum.
mod properties_as_seq {
    use super::{BTreeMap, PropertyDescriptor, PropertyKey};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(
        map: &BTreeMap<PropertyKey, PropertyDescriptor>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let pairs: Vec<(&PropertyKey, &PropertyDescriptor)> = map.iter().collect();
        pairs.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<PropertyKey, PropertyDescriptor>, D::Error> {
        let pairs: Vec<(PropertyKey, PropertyDescriptor)> = Vec::deserialize(deserializer)?;
        Ok(pairs.into_iter().collect())
    }
}

// ---------------------------------------------------------------------------
// PropertyKey: string or symbol
// ---------------------------------------------------------------------------

/// Unique symbol identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SymbolId(pub u32);

/// A property key: either a string or a symbol.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PropertyKey {
    /// String key.
    String(String),
    /// Symbol key.
    Symbol(SymbolId),
}

impl PropertyKey {
    /// The array index this key denotes, if it is a canonical index string.
    pub fn array_index(&self) -> Option<usize> {
        match self {
            Self::String(s) => {
                if s.is_empty() || (s.len() > 1 && s.starts_with('0')) {
                    return None;
                }
                if !s.bytes().all(|b| b.is_ascii_digit()) {
                    return None;
                }
                s.parse::<u32>().ok().map(|n| n as usize)
            }
            Self::Symbol(_) => None,
        }
    }

    /// The string name, if this is a string key.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            Self::Symbol(_) => None,
        }
    }
}

impl fmt::Display for PropertyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s}"),
            Self::Symbol(id) => write!(f, "Symbol({})", id.0),
        }
    }
}

impl From<&str> for PropertyKey {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for PropertyKey {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<usize> for PropertyKey {
    fn from(index: usize) -> Self {
        Self::String(index.to_string())
    }
}

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// Generation-indexed handle referencing an object in the [`ObjectHeap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectHandle {
    pub index: u32,
    pub generation: u32,
}

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "object#{}.{}", self.index, self.generation)
    }
}

/// Identifies a realm owned by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RealmId(pub u32);

impl fmt::Display for RealmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "realm#{}", self.0)
    }
}

/// Index into the agent's native function table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NativeId(pub u32);

// ---------------------------------------------------------------------------
// JsValue
// ---------------------------------------------------------------------------

/// Runtime value.  Objects (functions included) are referenced by handle.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum JsValue {
    Undefined,
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
    Symbol(SymbolId),
    Object(ObjectHandle),
}

impl JsValue {
    pub fn is_object(&self) -> bool {
        matches!(self, Self::Object(_))
    }

    pub fn as_object(&self) -> Option<ObjectHandle> {
        match self {
            Self::Object(h) => Some(*h),
            _ => None,
        }
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, Self::Undefined | Self::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// SameValue comparison.
    pub fn same_value(&self, other: &Self) -> bool {
        self == other
    }

    /// ToBoolean.
    pub fn truthy(&self) -> bool {
        match self {
            Self::Undefined | Self::Null => false,
            Self::Bool(b) => *b,
            Self::Int(n) => *n != 0,
            Self::Str(s) => !s.is_empty(),
            Self::Symbol(_) | Self::Object(_) => true,
        }
    }
}

impl fmt::Display for JsValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined => write!(f, "undefined"),
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(n) => write!(f, "{n}"),
            Self::Str(s) => write!(f, "{s}"),
            Self::Symbol(id) => write!(f, "Symbol({})", id.0),
            Self::Object(h) => write!(f, "[{h}]"),
        }
    }
}

impl From<bool> for JsValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for JsValue {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<&str> for JsValue {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for JsValue {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<ObjectHandle> for JsValue {
    fn from(h: ObjectHandle) -> Self {
        Self::Object(h)
    }
}

// ---------------------------------------------------------------------------
// PropertyDescriptor
// ---------------------------------------------------------------------------

/// Property descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertyDescriptor {
    /// Data descriptor: has `value` and `writable`.
    Data {
        value: JsValue,
        writable: bool,
        enumerable: bool,
        configurable: bool,
    },
    /// Accessor descriptor: has `get` and/or `set`.
    Accessor {
        get: Option<ObjectHandle>,
        set: Option<ObjectHandle>,
        enumerable: bool,
        configurable: bool,
    },
}

impl PropertyDescriptor {
    /// Create a default data descriptor (writable, enumerable, configurable).
    pub fn data(value: JsValue) -> Self {
        Self::Data {
            value,
            writable: true,
            enumerable: true,
            configurable: true,
        }
    }

    /// Writable and configurable but not enumerable, as installed methods are.
    pub fn hidden(value: JsValue) -> Self {
        Self::Data {
            value,
            writable: true,
            enumerable: false,
            configurable: true,
        }
    }

    /// Create a non-writable, non-enumerable, non-configurable data descriptor.
    pub fn data_frozen(value: JsValue) -> Self {
        Self::Data {
            value,
            writable: false,
            enumerable: false,
            configurable: false,
        }
    }

    pub fn is_configurable(&self) -> bool {
        match self {
            Self::Data { configurable, .. } | Self::Accessor { configurable, .. } => *configurable,
        }
    }

    pub fn is_enumerable(&self) -> bool {
        match self {
            Self::Data { enumerable, .. } | Self::Accessor { enumerable, .. } => *enumerable,
        }
    }

    pub fn is_data(&self) -> bool {
        matches!(self, Self::Data { .. })
    }

    pub fn is_accessor(&self) -> bool {
        matches!(self, Self::Accessor { .. })
    }

    /// Get the value if this is a data descriptor.
    pub fn value(&self) -> Option<&JsValue> {
        match self {
            Self::Data { value, .. } => Some(value),
            Self::Accessor { .. } => None,
        }
    }

    /// Is this a data descriptor with writable=true?
    pub fn is_writable(&self) -> bool {
        match self {
            Self::Data { writable, .. } => *writable,
            Self::Accessor { .. } => false,
        }
    }

    /// Non-configurable and non-writable data: the value is pinned forever.
    pub fn is_pinned(&self) -> bool {
        self.is_data() && !self.is_configurable() && !self.is_writable()
    }
}

// ---------------------------------------------------------------------------
// ObjectError
// ---------------------------------------------------------------------------

/// Errors from object model operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectError {
    /// TypeError raised by the platform.
    TypeError(String),
    /// Object not found in the heap.
    ObjectNotFound(ObjectHandle),
    /// Handle refers to a slot that has since been freed or reused.
    StaleHandle(ObjectHandle),
    /// Prototype chain cycle detected.
    PrototypeCycleDetected,
    /// Maximum prototype chain depth exceeded.
    PrototypeChainTooDeep { depth: u32, max: u32 },
    /// Value is not callable.
    NotCallable(String),
    /// Value is not a constructor.
    NotConstructor(String),
    /// A script-level exception with an error name and message.
    Thrown { name: String, message: String },
}

impl ObjectError {
    pub fn thrown(name: &str, message: impl Into<String>) -> Self {
        Self::Thrown {
            name: name.to_string(),
            message: message.into(),
        }
    }

    /// Stable error code for structured logging.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::TypeError(_) => "object_type_error",
            Self::ObjectNotFound(_) => "object_not_found",
            Self::StaleHandle(_) => "object_stale_handle",
            Self::PrototypeCycleDetected => "object_prototype_cycle",
            Self::PrototypeChainTooDeep { .. } => "object_prototype_chain_too_deep",
            Self::NotCallable(_) => "object_not_callable",
            Self::NotConstructor(_) => "object_not_constructor",
            Self::Thrown { .. } => "object_thrown",
        }
    }
}

impl fmt::Display for ObjectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TypeError(msg) => write!(f, "TypeError: {msg}"),
            Self::ObjectNotFound(h) => write!(f, "{h} not found"),
            Self::StaleHandle(h) => write!(f, "{h} is stale"),
            Self::PrototypeCycleDetected => write!(f, "TypeError: prototype chain cycle detected"),
            Self::PrototypeChainTooDeep { depth, max } => {
                write!(
                    f,
                    "TypeError: prototype chain depth {depth} exceeds max {max}"
                )
            }
            Self::NotCallable(what) => write!(f, "TypeError: {what} is not a function"),
            Self::NotConstructor(what) => write!(f, "TypeError: {what} is not a constructor"),
            Self::Thrown { name, message } => write!(f, "{name}: {message}"),
        }
    }
}

impl std::error::Error for ObjectError {}

// ---------------------------------------------------------------------------
// HeapObject
// ---------------------------------------------------------------------------

/// Maximum prototype chain depth to prevent infinite loops.
pub const MAX_PROTOTYPE_CHAIN_DEPTH: u32 = 1024;

/// Largest array length the dense element storage accepts.  Lengths above
/// it (including every length past 2^32 - 1) fail with a `RangeError`.
pub const MAX_ARRAY_LENGTH: usize = 1 << 20;

/// Check a requested array length against [`MAX_ARRAY_LENGTH`].
pub fn checked_array_length(length: i64) -> Result<usize, ObjectError> {
    usize::try_from(length)
        .ok()
        .filter(|n| *n <= MAX_ARRAY_LENGTH)
        .ok_or_else(|| ObjectError::thrown("RangeError", "Invalid array length"))
}

/// Where a function's behaviour comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FunctionOrigin {
    /// Provided by the platform (reports `[native code]`).
    Platform,
    /// Defined by a loaded script.
    Script,
}

/// Function metadata; the behaviour itself lives in the agent's native table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionData {
    pub name: String,
    pub native: NativeId,
    pub origin: FunctionOrigin,
    pub constructable: bool,
}

/// The kind-specific part of a heap object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ObjectKind {
    Ordinary,
    /// Array elements, held in place; `length` is derived.
    Array(Vec<JsValue>),
    Function(FunctionData),
    /// Interception wrapper; all operations are dispatched by the agent.
    Wrapper(WrapperSlot),
    /// Script-visible handle on a completion future.
    Completion(CompletionHandle),
}

/// An object living in exactly one realm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeapObject {
    pub realm: RealmId,
    /// `[[Prototype]]` internal slot.
    pub prototype: Option<ObjectHandle>,
    /// `[[Extensible]]` internal slot.
    pub extensible: bool,
    #[serde(with = "properties_as_seq")]
    pub properties: BTreeMap<PropertyKey, PropertyDescriptor>,
    /// Platform class name (e.g. `HTMLDivElement`) for intrinsic identification.
    pub class_tag: Option<String>,
    pub kind: ObjectKind,
}

impl HeapObject {
    pub fn new(realm: RealmId, prototype: Option<ObjectHandle>, kind: ObjectKind) -> Self {
        Self {
            realm,
            prototype,
            extensible: true,
            properties: BTreeMap::new(),
            class_tag: None,
            kind,
        }
    }

    pub fn with_class(mut self, class: &str) -> Self {
        self.class_tag = Some(class.to_string());
        self
    }

    pub fn is_wrapper(&self) -> bool {
        matches!(self.kind, ObjectKind::Wrapper(_))
    }

    pub fn is_array(&self) -> bool {
        matches!(self.kind, ObjectKind::Array(_))
    }

    pub fn function(&self) -> Option<&FunctionData> {
        match &self.kind {
            ObjectKind::Function(f) => Some(f),
            _ => None,
        }
    }

    fn array_length_descriptor(len: usize) -> PropertyDescriptor {
        PropertyDescriptor::Data {
            value: JsValue::Int(len as i64),
            writable: true,
            enumerable: false,
            configurable: false,
        }
    }

    // -- [[GetOwnProperty]] ------------------------------------------------

    /// `[[GetOwnProperty]](P)`: own descriptor for `key`.  Array elements
    /// and `length` are synthesised from the element vector.
    pub fn get_own_property(&self, key: &PropertyKey) -> Option<PropertyDescriptor> {
        if let ObjectKind::Array(elements) = &self.kind {
            if let Some(index) = key.array_index() {
                return elements.get(index).cloned().map(PropertyDescriptor::data);
            }
            if key.as_str() == Some("length") {
                return Some(Self::array_length_descriptor(elements.len()));
            }
        }
        self.properties.get(key).cloned()
    }

    pub fn has_own_property(&self, key: &PropertyKey) -> bool {
        self.get_own_property(key).is_some()
    }

    // -- [[DefineOwnProperty]] ---------------------------------------------

    /// `[[DefineOwnProperty]](P, Desc)`.
    ///
    /// Returns `Ok(true)` if the property was defined, `Ok(false)` if the
    /// existing descriptor rejects the change.
    pub fn define_own_property(
        &mut self,
        key: PropertyKey,
        desc: PropertyDescriptor,
    ) -> Result<bool, ObjectError> {
        let extensible = self.extensible;
        if let ObjectKind::Array(elements) = &mut self.kind {
            if let Some(index) = key.array_index() {
                // Elements are plain writable slots; attributed elements are rejected.
                let PropertyDescriptor::Data {
                    value,
                    writable: true,
                    enumerable: true,
                    configurable: true,
                } = desc
                else {
                    return Ok(false);
                };
                if index >= elements.len() {
                    if !extensible {
                        return Ok(false);
                    }
                    let length = checked_array_length(index as i64 + 1)?;
                    elements.resize(length, JsValue::Undefined);
                }
                elements[index] = value;
                return Ok(true);
            }
            if key.as_str() == Some("length") {
                return match desc {
                    PropertyDescriptor::Data {
                        value: JsValue::Int(n),
                        writable: true,
                        ..
                    } if n >= 0 => {
                        elements.resize(checked_array_length(n)?, JsValue::Undefined);
                        Ok(true)
                    }
                    _ => Ok(false),
                };
            }
        }

        if let Some(current) = self.properties.get(&key) {
            if !current.is_configurable() {
                if desc.is_configurable() {
                    return Ok(false);
                }
                if desc.is_enumerable() != current.is_enumerable() {
                    return Ok(false);
                }
                if current.is_data() != desc.is_data() {
                    return Ok(false);
                }
                if let (
                    PropertyDescriptor::Data {
                        writable: current_w,
                        value: current_v,
                        ..
                    },
                    PropertyDescriptor::Data {
                        writable: new_w,
                        value: new_v,
                        ..
                    },
                ) = (current, &desc)
                    && !current_w
                    && (*new_w || !current_v.same_value(new_v))
                {
                    return Ok(false);
                }
                if let (
                    PropertyDescriptor::Accessor {
                        get: cur_get,
                        set: cur_set,
                        ..
                    },
                    PropertyDescriptor::Accessor {
                        get: new_get,
                        set: new_set,
                        ..
                    },
                ) = (current, &desc)
                    && (cur_get != new_get || cur_set != new_set)
                {
                    return Ok(false);
                }
            }
            self.properties.insert(key, desc);
            Ok(true)
        } else {
            if !extensible {
                return Ok(false);
            }
            self.properties.insert(key, desc);
            Ok(true)
        }
    }

    // -- [[Delete]] ---------------------------------------------------------

    /// `[[Delete]](P)`: returns `false` if non-configurable.
    pub fn delete(&mut self, key: &PropertyKey) -> bool {
        if let ObjectKind::Array(elements) = &mut self.kind {
            if let Some(index) = key.array_index() {
                if let Some(slot) = elements.get_mut(index) {
                    *slot = JsValue::Undefined;
                }
                return true;
            }
            if key.as_str() == Some("length") {
                return false;
            }
        }
        match self.properties.get(key) {
            Some(desc) if !desc.is_configurable() => false,
            Some(_) => {
                self.properties.remove(key);
                true
            }
            None => true,
        }
    }

    // -- [[OwnPropertyKeys]] ------------------------------------------------

    /// Own keys: integer indices ascending, then strings, then symbols.
    pub fn own_property_keys(&self) -> Vec<PropertyKey> {
        let mut int_keys: Vec<(usize, PropertyKey)> = Vec::new();
        let mut str_keys: Vec<PropertyKey> = Vec::new();
        let mut sym_keys: Vec<PropertyKey> = Vec::new();

        if let ObjectKind::Array(elements) = &self.kind {
            int_keys.extend((0..elements.len()).map(|i| (i, PropertyKey::from(i))));
            str_keys.push(PropertyKey::from("length"));
        }

        for key in self.properties.keys() {
            match key {
                PropertyKey::String(_) => {
                    if let Some(n) = key.array_index() {
                        int_keys.push((n, key.clone()));
                    } else {
                        str_keys.push(key.clone());
                    }
                }
                PropertyKey::Symbol(_) => sym_keys.push(key.clone()),
            }
        }

        int_keys.sort_by_key(|(n, _)| *n);
        let mut result: Vec<PropertyKey> = int_keys.into_iter().map(|(_, k)| k).collect();
        result.extend(str_keys);
        result.extend(sym_keys);
        result
    }

    /// `[[PreventExtensions]]()`.
    pub fn prevent_extensions(&mut self) {
        self.extensible = false;
    }
}

// ---------------------------------------------------------------------------
// ObjectHeap: generation-indexed arena
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Slot {
    generation: u32,
    object: Option<HeapObject>,
}

/// The object arena.  Handles carry the generation of the slot they were
/// issued for; a freed slot is reused with a bumped generation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjectHeap {
    slots: Vec<Slot>,
    free_list: Vec<u32>,
    live: usize,
    next_symbol: u32,
}

impl ObjectHeap {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            live: 0,
            next_symbol: 1,
        }
    }

    /// Allocate an object, reusing a freed slot when one is available.
    pub fn alloc(&mut self, object: HeapObject) -> ObjectHandle {
        self.live += 1;
        if let Some(index) = self.free_list.pop() {
            let slot = &mut self.slots[index as usize];
            slot.object = Some(object);
            return ObjectHandle {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            object: Some(object),
        });
        ObjectHandle {
            index,
            generation: 0,
        }
    }

    /// Release an object.  Every outstanding handle to it becomes stale.
    pub fn free(&mut self, handle: ObjectHandle) -> Result<HeapObject, ObjectError> {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .ok_or(ObjectError::ObjectNotFound(handle))?;
        if slot.generation != handle.generation || slot.object.is_none() {
            return Err(ObjectError::StaleHandle(handle));
        }
        let object = slot.object.take().ok_or(ObjectError::StaleHandle(handle))?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_list.push(handle.index);
        self.live -= 1;
        Ok(object)
    }

    pub fn alloc_symbol(&mut self) -> SymbolId {
        let id = SymbolId(self.next_symbol);
        self.next_symbol += 1;
        id
    }

    pub fn get(&self, handle: ObjectHandle) -> Result<&HeapObject, ObjectError> {
        let slot = self
            .slots
            .get(handle.index as usize)
            .ok_or(ObjectError::ObjectNotFound(handle))?;
        if slot.generation != handle.generation {
            return Err(ObjectError::StaleHandle(handle));
        }
        slot.object.as_ref().ok_or(ObjectError::StaleHandle(handle))
    }

    pub fn get_mut(&mut self, handle: ObjectHandle) -> Result<&mut HeapObject, ObjectError> {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .ok_or(ObjectError::ObjectNotFound(handle))?;
        if slot.generation != handle.generation {
            return Err(ObjectError::StaleHandle(handle));
        }
        slot.object.as_mut().ok_or(ObjectError::StaleHandle(handle))
    }

    /// Does `handle` still refer to a live object?
    pub fn is_live(&self, handle: ObjectHandle) -> bool {
        self.get(handle).is_ok()
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Ordinary `[[GetPrototypeOf]]`; wrappers must go through the agent.
    pub fn ordinary_prototype_of(
        &self,
        handle: ObjectHandle,
    ) -> Result<Option<ObjectHandle>, ObjectError> {
        let obj = self.get(handle)?;
        if obj.is_wrapper() {
            return Err(ObjectError::TypeError(
                "wrapper getPrototypeOf must be dispatched by the agent".to_string(),
            ));
        }
        Ok(obj.prototype)
    }

    /// Walk the ordinary prototype chain of `handle` (exclusive), stopping at
    /// the first wrapper.  Guards against cycles and runaway depth.
    pub fn prototype_chain(&self, handle: ObjectHandle) -> Result<Vec<ObjectHandle>, ObjectError> {
        let mut chain = Vec::new();
        let mut visited = BTreeSet::new();
        visited.insert(handle);
        let mut current = self.get(handle)?.prototype;
        let mut depth: u32 = 0;
        while let Some(h) = current {
            if depth > MAX_PROTOTYPE_CHAIN_DEPTH {
                return Err(ObjectError::PrototypeChainTooDeep {
                    depth,
                    max: MAX_PROTOTYPE_CHAIN_DEPTH,
                });
            }
            if !visited.insert(h) {
                return Err(ObjectError::PrototypeCycleDetected);
            }
            chain.push(h);
            let obj = self.get(h)?;
            if obj.is_wrapper() {
                break;
            }
            current = obj.prototype;
            depth += 1;
        }
        Ok(chain)
    }

    /// Ordinary `[[SetPrototypeOf]]` with cycle detection.
    pub fn ordinary_set_prototype_of(
        &mut self,
        handle: ObjectHandle,
        proto: Option<ObjectHandle>,
    ) -> Result<bool, ObjectError> {
        if let Some(p) = proto {
            let mut current = Some(p);
            let mut visited = BTreeSet::new();
            visited.insert(handle);
            while let Some(h) = current {
                if !visited.insert(h) {
                    return Err(ObjectError::PrototypeCycleDetected);
                }
                let obj = self.get(h)?;
                if obj.is_wrapper() {
                    break;
                }
                current = obj.prototype;
            }
        }

        let obj = self.get_mut(handle)?;
        if !obj.extensible {
            return Ok(obj.prototype == proto);
        }
        obj.prototype = proto;
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// ProxyInvariantChecker: validates wrapper results against the target
// ---------------------------------------------------------------------------

/// Checks that what an interception wrapper reports is compatible with the
/// wrapped target's own non-configurable properties and extensibility.
pub struct ProxyInvariantChecker;

impl ProxyInvariantChecker {
    /// Validate a `get` result.
    pub fn check_get(
        target: &HeapObject,
        key: &PropertyKey,
        trap_result: &JsValue,
    ) -> Result<(), ObjectError> {
        if let Some(td) = target.get_own_property(key)
            && !td.is_configurable()
        {
            match td {
                PropertyDescriptor::Data {
                    value, writable, ..
                } if !writable => {
                    if !trap_result.same_value(&value) {
                        return Err(ObjectError::TypeError(format!(
                            "proxy get: non-configurable non-writable property '{key}' must return same value"
                        )));
                    }
                }
                PropertyDescriptor::Accessor { get: None, .. } => {
                    if *trap_result != JsValue::Undefined {
                        return Err(ObjectError::TypeError(format!(
                            "proxy get: non-configurable accessor property '{key}' with undefined getter must return undefined"
                        )));
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Validate a `getOwnPropertyDescriptor` result.
    pub fn check_get_own_property(
        target: &HeapObject,
        key: &PropertyKey,
        trap_result: &Option<PropertyDescriptor>,
    ) -> Result<(), ObjectError> {
        let target_desc = target.get_own_property(key);
        match (trap_result, &target_desc) {
            (None, Some(td)) if !td.is_configurable() => Err(ObjectError::TypeError(format!(
                "proxy getOwnPropertyDescriptor: cannot report non-configurable property '{key}' as non-existent"
            ))),
            (Some(_), None) if !target.extensible => Err(ObjectError::TypeError(format!(
                "proxy getOwnPropertyDescriptor: cannot report property '{key}' as existent on non-extensible target"
            ))),
            (Some(reported), Some(existing)) if existing.is_pinned() => {
                if reported.value() != existing.value() {
                    return Err(ObjectError::TypeError(format!(
                        "proxy getOwnPropertyDescriptor: non-configurable non-writable property '{key}' must have same value"
                    )));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Validate a `deleteProperty` result.
    pub fn check_delete(
        target: &HeapObject,
        key: &PropertyKey,
        trap_result: bool,
    ) -> Result<(), ObjectError> {
        if trap_result
            && let Some(td) = target.get_own_property(key)
            && !td.is_configurable()
        {
            return Err(ObjectError::TypeError(format!(
                "proxy deleteProperty: cannot delete non-configurable property '{key}'"
            )));
        }
        Ok(())
    }

    /// Validate a `defineProperty` result.
    pub fn check_define_own_property(
        target: &HeapObject,
        key: &PropertyKey,
        desc: &PropertyDescriptor,
        trap_result: bool,
    ) -> Result<(), ObjectError> {
        if trap_result {
            if !target.has_own_property(key) && !target.extensible {
                return Err(ObjectError::TypeError(format!(
                    "proxy defineProperty: cannot add property '{key}' to non-extensible target"
                )));
            }
            if !desc.is_configurable() {
                match target.get_own_property(key) {
                    Some(td) if !td.is_configurable() => {}
                    _ => {
                        return Err(ObjectError::TypeError(format!(
                            "proxy defineProperty: cannot define non-configurable property '{key}' when target property is configurable or absent"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Validate an `isExtensible` result.
    pub fn check_is_extensible(target: &HeapObject, trap_result: bool) -> Result<(), ObjectError> {
        if trap_result != target.extensible {
            return Err(ObjectError::TypeError(
                "proxy isExtensible: must match target extensibility".to_string(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn str_key(s: &str) -> PropertyKey {
        PropertyKey::String(s.to_string())
    }

    fn plain() -> HeapObject {
        HeapObject::new(RealmId(0), None, ObjectKind::Ordinary)
    }

    fn array(values: Vec<JsValue>) -> HeapObject {
        HeapObject::new(RealmId(0), None, ObjectKind::Array(values))
    }

    // -----------------------------------------------------------------------
    // PropertyKey
    // -----------------------------------------------------------------------

    #[test]
    fn array_index_accepts_canonical_indices_only() {
        assert_eq!(str_key("0").array_index(), Some(0));
        assert_eq!(str_key("42").array_index(), Some(42));
        assert_eq!(str_key("042").array_index(), None);
        assert_eq!(str_key("-1").array_index(), None);
        assert_eq!(str_key("length").array_index(), None);
        assert_eq!(str_key("").array_index(), None);
        assert_eq!(PropertyKey::Symbol(SymbolId(3)).array_index(), None);
    }

    #[test]
    fn property_key_display() {
        assert_eq!(str_key("foo").to_string(), "foo");
        assert_eq!(PropertyKey::Symbol(SymbolId(42)).to_string(), "Symbol(42)");
    }

    // -----------------------------------------------------------------------
    // Define / delete
    // -----------------------------------------------------------------------

    #[test]
    fn non_configurable_rejects_reconfiguration() {
        let mut obj = plain();
        let pinned = PropertyDescriptor::Data {
            value: JsValue::Int(1),
            writable: false,
            enumerable: true,
            configurable: false,
        };
        assert!(obj.define_own_property(str_key("x"), pinned.clone()).unwrap());
        assert!(
            !obj.define_own_property(str_key("x"), PropertyDescriptor::data(JsValue::Int(2)))
                .unwrap()
        );
        // Same value, same attributes: allowed.
        assert!(obj.define_own_property(str_key("x"), pinned).unwrap());
        assert!(!obj.delete(&str_key("x")));
    }

    #[test]
    fn non_extensible_rejects_new_properties() {
        let mut obj = plain();
        obj.prevent_extensions();
        assert!(
            !obj.define_own_property(str_key("x"), PropertyDescriptor::data(JsValue::Null))
                .unwrap()
        );
    }

    #[test]
    fn own_keys_order_integers_strings_symbols() {
        let mut obj = plain();
        for key in ["b", "2", "0", "a", "10"] {
            obj.define_own_property(str_key(key), PropertyDescriptor::data(JsValue::Null))
                .unwrap();
        }
        obj.define_own_property(
            PropertyKey::Symbol(SymbolId(9)),
            PropertyDescriptor::data(JsValue::Null),
        )
        .unwrap();
        let keys = obj.own_property_keys();
        assert_eq!(
            keys,
            vec![
                str_key("0"),
                str_key("2"),
                str_key("10"),
                str_key("a"),
                str_key("b"),
                PropertyKey::Symbol(SymbolId(9)),
            ]
        );
    }

    // -----------------------------------------------------------------------
    // Arrays
    // -----------------------------------------------------------------------

    #[test]
    fn array_elements_and_length_are_synthesised() {
        let obj = array(vec![JsValue::from("one"), JsValue::from("two")]);
        assert_eq!(
            obj.get_own_property(&str_key("1")).unwrap().value(),
            Some(&JsValue::from("two"))
        );
        let length = obj.get_own_property(&str_key("length")).unwrap();
        assert_eq!(length.value(), Some(&JsValue::Int(2)));
        assert!(!length.is_configurable());
        assert!(length.is_writable());
    }

    #[test]
    fn array_index_define_grows_in_place() {
        let mut obj = array(vec![]);
        assert!(
            obj.define_own_property(str_key("2"), PropertyDescriptor::data(JsValue::Int(7)))
                .unwrap()
        );
        match &obj.kind {
            ObjectKind::Array(elements) => {
                assert_eq!(elements.len(), 3);
                assert_eq!(elements[2], JsValue::Int(7));
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn array_length_beyond_dense_limit_is_a_range_error() {
        let mut obj = array(vec![JsValue::Int(1)]);
        let range_error = ObjectError::thrown("RangeError", "Invalid array length");
        assert_eq!(
            obj.define_own_property(str_key("length"), PropertyDescriptor::data(JsValue::Int(1 << 40))),
            Err(range_error.clone())
        );
        assert_eq!(
            obj.define_own_property(
                str_key("4294967294"),
                PropertyDescriptor::data(JsValue::Int(7))
            ),
            Err(range_error)
        );
        assert!(
            obj.define_own_property(str_key("length"), PropertyDescriptor::data(JsValue::Int(3)))
                .unwrap()
        );
        assert_eq!(
            obj.get_own_property(&str_key("length")).unwrap().value(),
            Some(&JsValue::Int(3))
        );
        assert_eq!(checked_array_length(-1), Err(ObjectError::thrown("RangeError", "Invalid array length")));
        assert_eq!(checked_array_length(MAX_ARRAY_LENGTH as i64), Ok(MAX_ARRAY_LENGTH));
    }

    #[test]
    fn array_named_property_can_be_pinned() {
        let mut obj = array(vec![JsValue::Int(1)]);
        let pinned = PropertyDescriptor::Data {
            value: JsValue::from("my value"),
            writable: false,
            enumerable: false,
            configurable: false,
        };
        assert!(obj.define_own_property(str_key("myProp"), pinned).unwrap());
        assert!(obj.get_own_property(&str_key("myProp")).unwrap().is_pinned());
        let keys = obj.own_property_keys();
        assert_eq!(keys, vec![str_key("0"), str_key("length"), str_key("myProp")]);
    }

    // -----------------------------------------------------------------------
    // Heap generations
    // -----------------------------------------------------------------------

    #[test]
    fn freed_handles_become_stale_and_slots_are_reused() {
        let mut heap = ObjectHeap::new();
        let a = heap.alloc(plain());
        assert_eq!(heap.len(), 1);
        heap.free(a).unwrap();
        assert!(heap.is_empty());
        assert_eq!(heap.get(a).unwrap_err(), ObjectError::StaleHandle(a));

        let b = heap.alloc(plain());
        assert_eq!(b.index, a.index);
        assert_ne!(b.generation, a.generation);
        assert!(heap.is_live(b));
        assert!(!heap.is_live(a));
        assert_eq!(heap.free(a).unwrap_err(), ObjectError::StaleHandle(a));
    }

    #[test]
    fn set_prototype_detects_cycles() {
        let mut heap = ObjectHeap::new();
        let a = heap.alloc(plain());
        let b = heap.alloc(HeapObject::new(RealmId(0), Some(a), ObjectKind::Ordinary));
        assert_eq!(
            heap.ordinary_set_prototype_of(a, Some(b)),
            Err(ObjectError::PrototypeCycleDetected)
        );
        assert_eq!(heap.prototype_chain(b).unwrap(), vec![a]);
    }

    // -----------------------------------------------------------------------
    // Invariant checker
    // -----------------------------------------------------------------------

    #[test]
    fn check_get_requires_same_value_for_pinned_properties() {
        let mut obj = plain();
        obj.define_own_property(
            str_key("x"),
            PropertyDescriptor::data_frozen(JsValue::Int(42)),
        )
        .unwrap();
        assert!(ProxyInvariantChecker::check_get(&obj, &str_key("x"), &JsValue::Int(42)).is_ok());
        assert!(ProxyInvariantChecker::check_get(&obj, &str_key("x"), &JsValue::Int(9)).is_err());
    }

    #[test]
    fn check_delete_rejects_non_configurable() {
        let mut obj = plain();
        obj.define_own_property(
            str_key("x"),
            PropertyDescriptor::data_frozen(JsValue::Int(1)),
        )
        .unwrap();
        assert!(ProxyInvariantChecker::check_delete(&obj, &str_key("x"), true).is_err());
        assert!(ProxyInvariantChecker::check_delete(&obj, &str_key("x"), false).is_ok());
    }

    #[test]
    fn object_error_display() {
        assert_eq!(
            ObjectError::thrown("DuplicateAssignmentError", "nope").to_string(),
            "DuplicateAssignmentError: nope"
        );
        assert_eq!(
            ObjectError::NotCallable("foo".into()).to_string(),
            "TypeError: foo is not a function"
        );
    }
}
