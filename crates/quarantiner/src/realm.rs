//! Realms: a global object, a document, and a private copy of every standard
//! constructor and platform class.
//!
//! Installation order matters.  `Object.prototype` and `Function.prototype`
//! exist before any function is created, the standard library is installed
//! next, then the platform classes and document (see [`crate::dom`]), and
//! finally the window-level bindings (`window`, `self`, `top`, `parent`,
//! `document`, viewport metrics).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::agent::{Agent, Invocation};
use crate::dom;
use crate::error::QuarantineError;
use crate::object_model::{
    HeapObject, JsValue, ObjectError, ObjectHandle, ObjectHeap, ObjectKind, PropertyDescriptor,
    PropertyKey, RealmId, checked_array_length,
};

/// Viewport metrics of the host window.  Isolated realms are hidden frames
/// and report zero geometry.
pub const HOST_METRICS: &[(&str, i64)] = &[
    ("innerWidth", 1280),
    ("innerHeight", 720),
    ("outerWidth", 1280),
    ("outerHeight", 800),
    ("devicePixelRatio", 1),
    ("scrollX", 0),
    ("scrollY", 0),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RealmKind {
    Host,
    Isolated,
}

/// A constructor and its prototype.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassEntry {
    pub constructor: ObjectHandle,
    pub prototype: ObjectHandle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Realm {
    pub id: RealmId,
    pub name: String,
    pub kind: RealmKind,
    pub global: ObjectHandle,
    pub document: ObjectHandle,
    pub object_prototype: ObjectHandle,
    pub function_prototype: ObjectHandle,
    pub array_prototype: ObjectHandle,
    classes: BTreeMap<String, ClassEntry>,
}

impl Realm {
    /// Allocate the bare skeleton: the root prototypes and the global.
    pub(crate) fn allocate(heap: &mut ObjectHeap, id: RealmId, name: &str, kind: RealmKind) -> Self {
        let object_prototype = heap.alloc(HeapObject::new(id, None, ObjectKind::Ordinary));
        let function_prototype =
            heap.alloc(HeapObject::new(id, Some(object_prototype), ObjectKind::Ordinary));
        let array_prototype =
            heap.alloc(HeapObject::new(id, Some(object_prototype), ObjectKind::Ordinary));
        let global = heap.alloc(
            HeapObject::new(id, Some(object_prototype), ObjectKind::Ordinary).with_class("Window"),
        );
        Self {
            id,
            name: name.to_string(),
            kind,
            global,
            // Replaced once the platform classes exist.
            document: global,
            object_prototype,
            function_prototype,
            array_prototype,
            classes: BTreeMap::new(),
        }
    }

    /// Populate a freshly allocated realm.
    pub(crate) fn install(agent: &mut Agent, id: RealmId) -> Result<(), ObjectError> {
        install_standard_library(agent, id)?;
        dom::install(agent, id)?;
        install_window_bindings(agent, id)
    }

    pub fn class(&self, name: &str) -> Option<ClassEntry> {
        self.classes.get(name).copied()
    }

    pub fn class_prototype(&self, name: &str) -> Result<ObjectHandle, ObjectError> {
        self.class(name)
            .map(|entry| entry.prototype)
            .ok_or_else(|| ObjectError::TypeError(format!("{name} is not defined in {}", self.name)))
    }

    pub fn class_names(&self) -> impl Iterator<Item = &str> {
        self.classes.keys().map(String::as_str)
    }

    /// Name of the class whose prototype is `proto`, if any.
    pub fn class_of_prototype(&self, proto: ObjectHandle) -> Option<&str> {
        self.classes
            .iter()
            .find(|(_, entry)| entry.prototype == proto)
            .map(|(name, _)| name.as_str())
    }
}

// ---------------------------------------------------------------------------
// Definition helpers
// ---------------------------------------------------------------------------

type Behaviour = fn(&mut Agent, Invocation) -> Result<JsValue, ObjectError>;

/// Define a native method on `target`.
pub(crate) fn define_method(
    agent: &mut Agent,
    realm: RealmId,
    target: ObjectHandle,
    name: &str,
    behaviour: impl Fn(&mut Agent, Invocation) -> Result<JsValue, ObjectError> + 'static,
) -> Result<ObjectHandle, ObjectError> {
    let function = agent.create_native_function(realm, name, false, behaviour)?;
    agent.define_hidden(target, name, JsValue::Object(function))?;
    Ok(function)
}

/// Define a native accessor (getter only) on `target`.
pub(crate) fn define_getter(
    agent: &mut Agent,
    realm: RealmId,
    target: ObjectHandle,
    name: &str,
    behaviour: impl Fn(&mut Agent, Invocation) -> Result<JsValue, ObjectError> + 'static,
) -> Result<(), ObjectError> {
    let getter = agent.create_native_function(realm, &format!("get {name}"), false, behaviour)?;
    agent.define_property(
        target,
        PropertyKey::from(name),
        PropertyDescriptor::Accessor {
            get: Some(getter),
            set: None,
            enumerable: true,
            configurable: true,
        },
    )?;
    Ok(())
}

/// Define class `name` around an existing prototype object and bind it on
/// the realm's global.
pub(crate) fn define_class_with_prototype(
    agent: &mut Agent,
    realm: RealmId,
    name: &str,
    prototype: ObjectHandle,
    constructable: bool,
    behaviour: impl Fn(&mut Agent, Invocation) -> Result<JsValue, ObjectError> + 'static,
) -> Result<ClassEntry, ObjectError> {
    let constructor = agent.create_native_function(realm, name, constructable, behaviour)?;
    agent.define_property(
        constructor,
        PropertyKey::from("prototype"),
        PropertyDescriptor::Data {
            value: JsValue::Object(prototype),
            writable: false,
            enumerable: false,
            configurable: false,
        },
    )?;
    agent.define_hidden(prototype, "constructor", JsValue::Object(constructor))?;
    let global = agent.realm(realm)?.global;
    agent.define_hidden(global, name, JsValue::Object(constructor))?;
    let entry = ClassEntry {
        constructor,
        prototype,
    };
    agent
        .realm_mut(realm)?
        .classes
        .insert(name.to_string(), entry);
    Ok(entry)
}

/// Define class `name` with a fresh prototype inheriting from `parent`
/// (`Object.prototype` when `None`).
pub(crate) fn define_class(
    agent: &mut Agent,
    realm: RealmId,
    name: &str,
    parent: Option<ObjectHandle>,
    constructable: bool,
    behaviour: impl Fn(&mut Agent, Invocation) -> Result<JsValue, ObjectError> + 'static,
) -> Result<ClassEntry, ObjectError> {
    let parent = match parent {
        Some(p) => p,
        None => agent.realm(realm)?.object_prototype,
    };
    let prototype = agent.create_object(realm, Some(parent));
    define_class_with_prototype(agent, realm, name, prototype, constructable, behaviour)
}

/// Behaviour of platform classes that cannot be constructed by scripts.
pub(crate) fn illegal_constructor(_: &mut Agent, _: Invocation) -> Result<JsValue, ObjectError> {
    Err(ObjectError::TypeError("Illegal constructor".to_string()))
}

// ---------------------------------------------------------------------------
// Standard library
// ---------------------------------------------------------------------------

fn install_standard_library(agent: &mut Agent, realm: RealmId) -> Result<(), ObjectError> {
    let (object_prototype, function_prototype, array_prototype) = {
        let r = agent.realm(realm)?;
        (r.object_prototype, r.function_prototype, r.array_prototype)
    };

    // Object
    let object = define_class_with_prototype(agent, realm, "Object", object_prototype, true, |agent, inv| {
        let arg = inv.arg(0);
        if arg.is_object() {
            return Ok(arg);
        }
        let realm = agent.realm_of(inv.callee)?;
        Ok(JsValue::Object(agent.create_plain_object(realm)?))
    })?;
    define_method(agent, realm, object_prototype, "hasOwnProperty", |agent, inv| {
        let this = inv.this_object("hasOwnProperty")?;
        let key = agent.to_property_key(&inv.arg(0));
        Ok(JsValue::Bool(agent.get_own_property(this, &key)?.is_some()))
    })?;
    let statics: [(&str, Behaviour); 7] = [
        ("defineProperty", object_define_property),
        ("getOwnPropertyDescriptor", object_get_own_property_descriptor),
        ("getPrototypeOf", object_get_prototype_of),
        ("setPrototypeOf", object_set_prototype_of),
        ("keys", object_keys),
        ("isExtensible", object_is_extensible),
        ("preventExtensions", object_prevent_extensions),
    ];
    for (name, behaviour) in statics {
        define_method(agent, realm, object.constructor, name, behaviour)?;
    }

    // Function
    define_class_with_prototype(agent, realm, "Function", function_prototype, false, |_, _| {
        Err(ObjectError::TypeError(
            "Function constructor is not supported".to_string(),
        ))
    })?;
    define_method(agent, realm, function_prototype, "call", |agent, inv| {
        let rest = inv.args.get(1..).map(<[JsValue]>::to_vec).unwrap_or_default();
        agent.call(&inv.this, inv.arg(0), rest)
    })?;
    define_method(agent, realm, function_prototype, "toString", |agent, inv| {
        Ok(JsValue::Str(agent.to_display_string(&inv.this)))
    })?;

    // Array
    let array = define_class_with_prototype(agent, realm, "Array", array_prototype, true, |agent, inv| {
        let realm = agent.realm_of(inv.callee)?;
        let elements = match inv.args.as_slice() {
            [JsValue::Int(n)] => vec![JsValue::Undefined; checked_array_length(*n)?],
            items => items.to_vec(),
        };
        Ok(JsValue::Object(agent.create_array(realm, elements)?))
    })?;
    define_method(agent, realm, array.constructor, "isArray", |agent, inv| {
        Ok(JsValue::Bool(agent.is_array(&inv.arg(0))))
    })?;
    define_method(agent, realm, array_prototype, "push", |agent, inv| {
        let this = inv.this_object("Array.prototype.push")?;
        let length = agent.get_named(this, "length")?;
        let mut length = agent.to_integer(&length).max(0);
        for item in inv.args {
            agent.set(this, &PropertyKey::from(length as usize), item)?;
            length += 1;
        }
        agent.set_named(this, "length", JsValue::Int(length))?;
        Ok(JsValue::Int(length))
    })?;
    define_method(agent, realm, array_prototype, "pop", |agent, inv| {
        let this = inv.this_object("Array.prototype.pop")?;
        let length = agent.get_named(this, "length")?;
        let length = agent.to_integer(&length).max(0);
        if length == 0 {
            agent.set_named(this, "length", JsValue::Int(0))?;
            return Ok(JsValue::Undefined);
        }
        let last = agent.get(this, &PropertyKey::from((length - 1) as usize))?;
        agent.set_named(this, "length", JsValue::Int(length - 1))?;
        Ok(last)
    })?;
    define_method(agent, realm, array_prototype, "indexOf", |agent, inv| {
        let needle = inv.arg(0);
        let elements = agent.list_elements(&inv.this)?;
        Ok(JsValue::Int(
            elements
                .iter()
                .position(|e| e.same_value(&needle))
                .map_or(-1, |i| i as i64),
        ))
    })?;

    // Primitive conversions (callable only)
    define_class(agent, realm, "Boolean", None, false, |_, inv| {
        Ok(JsValue::Bool(inv.arg(0).truthy()))
    })?;
    define_class(agent, realm, "Number", None, false, |agent, inv| {
        Ok(JsValue::Int(agent.to_integer(&inv.arg(0))))
    })?;
    define_class(agent, realm, "String", None, false, |agent, inv| {
        Ok(JsValue::Str(agent.to_display_string(&inv.arg(0))))
    })?;

    // Error
    let error = define_class(agent, realm, "Error", None, true, |agent, inv| {
        let target = match (inv.new_target, &inv.this) {
            (Some(_), JsValue::Object(this)) => *this,
            _ => {
                let realm = agent.realm_of(inv.callee)?;
                agent.create_instance(realm, "Error")?
            }
        };
        let message = inv.arg(0);
        if !message.is_nullish() {
            let text = agent.to_display_string(&message);
            agent.define_hidden(target, "message", JsValue::Str(text))?;
        }
        Ok(JsValue::Object(target))
    })?;
    agent.define_hidden(error.prototype, "name", JsValue::from("Error"))?;
    agent.define_hidden(error.prototype, "message", JsValue::from(""))?;

    // Completion (script-visible future)
    let completion = define_class(agent, realm, "Completion", None, false, illegal_constructor)?;
    define_method(agent, realm, completion.prototype, "then", completion_then)?;

    // Utilities
    let global = agent.realm(realm)?.global;
    define_method(agent, realm, global, "parseInt", |_, inv| {
        Ok(match inv.arg(0) {
            JsValue::Int(n) => JsValue::Int(n),
            JsValue::Str(s) => parse_int(&s).map_or(JsValue::Undefined, JsValue::Int),
            _ => JsValue::Undefined,
        })
    })?;
    define_method(agent, realm, global, "setTimeout", |agent, inv| {
        let callback = inv.arg(0);
        if !agent.is_callable(&callback) {
            return Err(ObjectError::NotCallable(agent.to_display_string(&callback)));
        }
        let delay = agent.to_integer(&inv.arg(1)).max(0) as u64;
        let id = agent.next_timer_id();
        agent.event_loop.schedule(
            delay,
            Box::new(move |agent| {
                agent.call(&callback, JsValue::Undefined, Vec::new())?;
                Ok(())
            }),
        );
        Ok(JsValue::Int(id))
    })?;
    Ok(())
}

/// Leading-integer parse; `None` stands in for `NaN`.
fn parse_int(text: &str) -> Option<i64> {
    let text = text.trim_start();
    let (sign, digits) = match text.strip_prefix('-') {
        Some(rest) => (-1, rest),
        None => (1, text.strip_prefix('+').unwrap_or(text)),
    };
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    digits[..end].parse::<i64>().ok().map(|n| sign * n)
}

fn object_argument(inv: &Invocation, method: &str) -> Result<ObjectHandle, ObjectError> {
    inv.arg(0)
        .as_object()
        .ok_or_else(|| ObjectError::TypeError(format!("Object.{method} called on non-object")))
}

/// Read a descriptor object (`{ value, writable, get, ... }`); absent
/// attributes default to `false`.
fn to_property_descriptor(agent: &mut Agent, value: &JsValue) -> Result<PropertyDescriptor, ObjectError> {
    let Some(desc) = value.as_object() else {
        return Err(ObjectError::TypeError(
            "Property description must be an object".to_string(),
        ));
    };
    let flag = |agent: &mut Agent, name: &str| -> Result<bool, ObjectError> {
        Ok(agent.get_named(desc, name)?.truthy())
    };
    let enumerable = flag(agent, "enumerable")?;
    let configurable = flag(agent, "configurable")?;
    let has_get = agent.has(desc, &PropertyKey::from("get"))?;
    let has_set = agent.has(desc, &PropertyKey::from("set"))?;
    if has_get || has_set {
        let mut accessor = |name: &str| -> Result<Option<ObjectHandle>, ObjectError> {
            let f = agent.get_named(desc, name)?;
            match &f {
                JsValue::Undefined => Ok(None),
                JsValue::Object(h) if agent.is_callable(&f) => Ok(Some(*h)),
                other => Err(ObjectError::TypeError(format!(
                    "{name} must be a function: {other}"
                ))),
            }
        };
        let get = accessor("get")?;
        let set = accessor("set")?;
        return Ok(PropertyDescriptor::Accessor {
            get,
            set,
            enumerable,
            configurable,
        });
    }
    Ok(PropertyDescriptor::Data {
        value: agent.get_named(desc, "value")?,
        writable: flag(agent, "writable")?,
        enumerable,
        configurable,
    })
}

fn from_property_descriptor(
    agent: &mut Agent,
    realm: RealmId,
    desc: PropertyDescriptor,
) -> Result<JsValue, ObjectError> {
    let object = agent.create_plain_object(realm)?;
    let fields: Vec<(&str, JsValue)> = match desc {
        PropertyDescriptor::Data {
            value,
            writable,
            enumerable,
            configurable,
        } => vec![
            ("value", value),
            ("writable", JsValue::Bool(writable)),
            ("enumerable", JsValue::Bool(enumerable)),
            ("configurable", JsValue::Bool(configurable)),
        ],
        PropertyDescriptor::Accessor {
            get,
            set,
            enumerable,
            configurable,
        } => vec![
            ("get", get.map_or(JsValue::Undefined, JsValue::Object)),
            ("set", set.map_or(JsValue::Undefined, JsValue::Object)),
            ("enumerable", JsValue::Bool(enumerable)),
            ("configurable", JsValue::Bool(configurable)),
        ],
    };
    for (name, value) in fields {
        agent.define_property(object, PropertyKey::from(name), PropertyDescriptor::data(value))?;
    }
    Ok(JsValue::Object(object))
}

fn object_define_property(agent: &mut Agent, inv: Invocation) -> Result<JsValue, ObjectError> {
    let target = object_argument(&inv, "defineProperty")?;
    let key = agent.to_property_key(&inv.arg(1));
    let desc = to_property_descriptor(agent, &inv.arg(2))?;
    if !agent.define_property(target, key.clone(), desc)? {
        return Err(ObjectError::TypeError(format!(
            "Cannot redefine property: {key}"
        )));
    }
    Ok(inv.arg(0))
}

fn object_get_own_property_descriptor(
    agent: &mut Agent,
    inv: Invocation,
) -> Result<JsValue, ObjectError> {
    let target = object_argument(&inv, "getOwnPropertyDescriptor")?;
    let key = agent.to_property_key(&inv.arg(1));
    match agent.get_own_property(target, &key)? {
        Some(desc) => {
            let realm = agent.realm_of(inv.callee)?;
            from_property_descriptor(agent, realm, desc)
        }
        None => Ok(JsValue::Undefined),
    }
}

fn object_get_prototype_of(agent: &mut Agent, inv: Invocation) -> Result<JsValue, ObjectError> {
    let target = object_argument(&inv, "getPrototypeOf")?;
    Ok(agent
        .get_prototype_of(target)?
        .map_or(JsValue::Null, JsValue::Object))
}

fn object_set_prototype_of(agent: &mut Agent, inv: Invocation) -> Result<JsValue, ObjectError> {
    let target = object_argument(&inv, "setPrototypeOf")?;
    let proto = match inv.arg(1) {
        JsValue::Null => None,
        JsValue::Object(h) => Some(h),
        other => {
            return Err(ObjectError::TypeError(format!(
                "Object prototype may only be an Object or null: {other}"
            )));
        }
    };
    if !agent.set_prototype_of(target, proto)? {
        return Err(ObjectError::TypeError(
            "cannot set prototype of non-extensible object".to_string(),
        ));
    }
    Ok(inv.arg(0))
}

fn object_keys(agent: &mut Agent, inv: Invocation) -> Result<JsValue, ObjectError> {
    let target = object_argument(&inv, "keys")?;
    let keys = agent
        .keys(target)?
        .into_iter()
        .map(JsValue::Str)
        .collect();
    let realm = agent.realm_of(inv.callee)?;
    Ok(JsValue::Object(agent.create_array(realm, keys)?))
}

fn object_is_extensible(agent: &mut Agent, inv: Invocation) -> Result<JsValue, ObjectError> {
    match inv.arg(0) {
        JsValue::Object(target) => Ok(JsValue::Bool(agent.is_extensible(target)?)),
        _ => Ok(JsValue::Bool(false)),
    }
}

fn object_prevent_extensions(agent: &mut Agent, inv: Invocation) -> Result<JsValue, ObjectError> {
    if let JsValue::Object(target) = inv.arg(0) {
        agent.prevent_extensions(target)?;
    }
    Ok(inv.arg(0))
}

/// `Completion.prototype.then(onFulfilled, onRejected)`.  A callback result
/// that is itself a completion is adopted.
fn completion_then(agent: &mut Agent, inv: Invocation) -> Result<JsValue, ObjectError> {
    let realm = agent.realm_of(inv.callee)?;
    let completion = agent.completion_of(&inv.this).ok_or_else(|| {
        ObjectError::TypeError(
            "Completion.prototype.then called on incompatible receiver".to_string(),
        )
    })?;
    let on_fulfilled = inv.arg(0);
    let on_rejected = inv.arg(1);
    let derived = agent.create_completion();
    agent.then(completion, move |agent, settlement| {
        let outcome = match settlement {
            Ok(value) if agent.is_callable(&on_fulfilled) => agent
                .call(&on_fulfilled, JsValue::Undefined, vec![value])
                .map_err(QuarantineError::from),
            Ok(value) => Ok(value),
            Err(err) if agent.is_callable(&on_rejected) => {
                let reason = agent.create_error(realm, err.error_name(), &err.to_string())?;
                agent
                    .call(&on_rejected, JsValue::Undefined, vec![JsValue::Object(reason)])
                    .map_err(QuarantineError::from)
            }
            Err(err) => Err(err),
        };
        match outcome {
            Ok(value) => match agent.completion_of(&value) {
                Some(inner) => agent.then(inner, move |agent, settlement| {
                    agent.settle(derived, settlement)?;
                    Ok(())
                })?,
                None => agent.fulfill(derived, value)?,
            },
            Err(err) => agent.reject(derived, err)?,
        }
        Ok(())
    })?;
    Ok(JsValue::Object(agent.completion_object(realm, derived)?))
}

// ---------------------------------------------------------------------------
// Window bindings
// ---------------------------------------------------------------------------

fn install_window_bindings(agent: &mut Agent, realm: RealmId) -> Result<(), ObjectError> {
    let (global, document, kind) = {
        let r = agent.realm(realm)?;
        (r.global, r.document, r.kind)
    };
    let ancestor = match kind {
        RealmKind::Host => global,
        RealmKind::Isolated => {
            let host = agent.host_realm();
            agent.realm(host)?.global
        }
    };
    agent.define_hidden(global, "window", JsValue::Object(global))?;
    agent.define_hidden(global, "self", JsValue::Object(global))?;
    agent.define_hidden(global, "document", JsValue::Object(document))?;
    agent.define_hidden(global, "top", JsValue::Object(ancestor))?;
    agent.define_hidden(global, "parent", JsValue::Object(ancestor))?;
    for (name, host_value) in HOST_METRICS {
        let value = match (kind, *name) {
            (RealmKind::Host, _) | (RealmKind::Isolated, "devicePixelRatio") => *host_value,
            (RealmKind::Isolated, _) => 0,
        };
        agent.define_property(
            global,
            PropertyKey::from(*name),
            PropertyDescriptor::data(JsValue::Int(value)),
        )?;
    }
    Ok(())
}
