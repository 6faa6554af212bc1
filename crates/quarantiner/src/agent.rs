//! The agent: one heap shared by every realm, plus everything that needs to
//! run code against it.
//!
//! All generic object operations live here.  Each one first checks whether
//! the receiver is an interception wrapper; if so it dispatches to the
//! wrapper's handler (see [`crate::interception`]) and validates the result
//! against the wrapped target, otherwise it runs the ordinary algorithm from
//! [`crate::object_model`] (invoking accessor getters and setters as needed).

use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use crate::bridge::{BridgeId, IdentityBridge};
use crate::completion::{CompletionHandle, CompletionStore, EventLoop};
use crate::dom::DomTree;
use crate::events::EventLog;
use crate::host::CurrentScript;
use crate::interception::{self, WrapperSlot};
use crate::object_model::{
    FunctionData, FunctionOrigin, HeapObject, JsValue, MAX_PROTOTYPE_CHAIN_DEPTH, NativeId,
    ObjectError, ObjectHandle, ObjectHeap, ObjectKind, PropertyDescriptor, PropertyKey,
    ProxyInvariantChecker, RealmId,
};
use crate::realm::{Realm, RealmKind};

/// Maximum nesting accepted when converting between script values and JSON.
const MAX_JSON_DEPTH: usize = 32;

/// Native behaviour behind a function object.
pub type NativeFn = Rc<dyn Fn(&mut Agent, Invocation) -> Result<JsValue, ObjectError>>;

/// Arguments of a single call or construct.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub callee: ObjectHandle,
    pub this: JsValue,
    pub args: Vec<JsValue>,
    /// Set when invoked through `construct`.
    pub new_target: Option<ObjectHandle>,
}

impl Invocation {
    /// The `index`-th argument, or `undefined`.
    pub fn arg(&self, index: usize) -> JsValue {
        self.args.get(index).cloned().unwrap_or(JsValue::Undefined)
    }

    /// `this` as an object handle, or a TypeError naming `method`.
    pub fn this_object(&self, method: &str) -> Result<ObjectHandle, ObjectError> {
        self.this.as_object().ok_or_else(|| {
            ObjectError::TypeError(format!("{method} called on non-object receiver"))
        })
    }
}

pub struct Agent {
    pub heap: ObjectHeap,
    pub completions: CompletionStore,
    pub event_loop: EventLoop,
    pub dom: DomTree,
    realms: Vec<Realm>,
    natives: Vec<NativeFn>,
    bridges: BTreeMap<BridgeId, IdentityBridge>,
    current_script: Option<CurrentScript>,
    log: EventLog,
    host_realm: RealmId,
    next_timer: i64,
}

impl Agent {
    /// A fresh agent with its host realm (`main`) installed.
    pub fn new() -> Self {
        let mut agent = Self {
            heap: ObjectHeap::new(),
            completions: CompletionStore::new(),
            event_loop: EventLoop::new(),
            dom: DomTree::default(),
            realms: Vec::new(),
            natives: Vec::new(),
            bridges: BTreeMap::new(),
            current_script: None,
            log: EventLog::new(),
            host_realm: RealmId(0),
            next_timer: 1,
        };
        // Installing into an empty heap only allocates; it cannot hit a stale
        // handle or a rejected definition.
        match agent.create_realm("main", RealmKind::Host) {
            Ok(id) => agent.host_realm = id,
            Err(err) => unreachable!("host realm installation failed: {err}"),
        }
        agent
    }

    // -----------------------------------------------------------------------
    // Realms
    // -----------------------------------------------------------------------

    pub fn host_realm(&self) -> RealmId {
        self.host_realm
    }

    pub fn realm(&self, id: RealmId) -> Result<&Realm, ObjectError> {
        self.realms
            .get(id.0 as usize)
            .ok_or_else(|| ObjectError::TypeError(format!("{id} does not exist")))
    }

    pub(crate) fn realm_mut(&mut self, id: RealmId) -> Result<&mut Realm, ObjectError> {
        self.realms
            .get_mut(id.0 as usize)
            .ok_or_else(|| ObjectError::TypeError(format!("{id} does not exist")))
    }

    pub fn realm_count(&self) -> usize {
        self.realms.len()
    }

    /// Create and fully install a new realm.
    pub fn create_realm(&mut self, name: &str, kind: RealmKind) -> Result<RealmId, ObjectError> {
        let id = RealmId(self.realms.len() as u32);
        let realm = Realm::allocate(&mut self.heap, id, name, kind);
        self.realms.push(realm);
        Realm::install(self, id)?;
        Ok(id)
    }

    /// The realm an object was allocated in.
    pub fn realm_of(&self, handle: ObjectHandle) -> Result<RealmId, ObjectError> {
        Ok(self.heap.get(handle)?.realm)
    }

    // -----------------------------------------------------------------------
    // Scripts, events, timers
    // -----------------------------------------------------------------------

    pub fn current_script(&self) -> Option<&CurrentScript> {
        self.current_script.as_ref()
    }

    /// Replace the current-script slot, returning the previous occupant.
    pub fn set_current_script(&mut self, script: Option<CurrentScript>) -> Option<CurrentScript> {
        std::mem::replace(&mut self.current_script, script)
    }

    pub fn record_event(
        &mut self,
        sandbox: &str,
        component: &str,
        event: &str,
        outcome: &str,
        error_code: Option<&str>,
    ) {
        let now = self.event_loop.now_ms();
        self.log
            .record(sandbox, component, event, outcome, error_code, now);
    }

    pub fn events(&self) -> &EventLog {
        &self.log
    }

    pub fn drain_events(&mut self) -> Vec<crate::events::QuarantineEvent> {
        self.log.drain()
    }

    pub(crate) fn next_timer_id(&mut self) -> i64 {
        let id = self.next_timer;
        self.next_timer += 1;
        id
    }

    // -----------------------------------------------------------------------
    // Bridges
    // -----------------------------------------------------------------------

    pub(crate) fn install_bridge(&mut self, bridge: IdentityBridge) -> BridgeId {
        let id = bridge.id();
        self.bridges.insert(id, bridge);
        id
    }

    pub(crate) fn next_bridge_id(&self) -> BridgeId {
        BridgeId(self.bridges.len() as u32)
    }

    pub fn bridge(&self, id: BridgeId) -> Result<&IdentityBridge, ObjectError> {
        self.bridges
            .get(&id)
            .ok_or_else(|| ObjectError::TypeError(format!("{id} does not exist")))
    }

    pub(crate) fn bridge_mut(&mut self, id: BridgeId) -> Result<&mut IdentityBridge, ObjectError> {
        self.bridges
            .get_mut(&id)
            .ok_or_else(|| ObjectError::TypeError(format!("{id} does not exist")))
    }

    pub(crate) fn bridge_ids(&self) -> Vec<BridgeId> {
        self.bridges.keys().copied().collect()
    }

    // -----------------------------------------------------------------------
    // Allocation
    // -----------------------------------------------------------------------

    pub fn create_object(
        &mut self,
        realm: RealmId,
        prototype: Option<ObjectHandle>,
    ) -> ObjectHandle {
        self.heap
            .alloc(HeapObject::new(realm, prototype, ObjectKind::Ordinary))
    }

    /// `{}` in `realm`.
    pub fn create_plain_object(&mut self, realm: RealmId) -> Result<ObjectHandle, ObjectError> {
        let proto = self.realm(realm)?.object_prototype;
        Ok(self.create_object(realm, Some(proto)))
    }

    /// `[...elements]` in `realm`.
    pub fn create_array(
        &mut self,
        realm: RealmId,
        elements: Vec<JsValue>,
    ) -> Result<ObjectHandle, ObjectError> {
        let proto = self.realm(realm)?.array_prototype;
        Ok(self
            .heap
            .alloc(HeapObject::new(realm, Some(proto), ObjectKind::Array(elements))))
    }

    /// An instance of `realm`'s platform class `class` (e.g. `Event`).
    pub fn create_instance(
        &mut self,
        realm: RealmId,
        class: &str,
    ) -> Result<ObjectHandle, ObjectError> {
        let proto = self.realm(realm)?.class_prototype(class)?;
        Ok(self.heap.alloc(
            HeapObject::new(realm, Some(proto), ObjectKind::Ordinary).with_class(class),
        ))
    }

    /// An `Error`-family object with `name` and `message`.
    pub fn create_error(
        &mut self,
        realm: RealmId,
        name: &str,
        message: &str,
    ) -> Result<ObjectHandle, ObjectError> {
        let error = self.create_instance(realm, "Error")?;
        self.define_hidden(error, "name", JsValue::from(name))?;
        self.define_hidden(error, "message", JsValue::from(message))?;
        Ok(error)
    }

    fn alloc_function(
        &mut self,
        realm: RealmId,
        name: &str,
        origin: FunctionOrigin,
        constructable: bool,
        behaviour: NativeFn,
    ) -> Result<ObjectHandle, ObjectError> {
        let proto = self.realm(realm)?.function_prototype;
        let native = NativeId(self.natives.len() as u32);
        self.natives.push(behaviour);
        let handle = self.heap.alloc(HeapObject::new(
            realm,
            Some(proto),
            ObjectKind::Function(FunctionData {
                name: name.to_string(),
                native,
                origin,
                constructable,
            }),
        ));
        self.heap.get_mut(handle)?.define_own_property(
            PropertyKey::from("name"),
            PropertyDescriptor::Data {
                value: JsValue::from(name),
                writable: false,
                enumerable: false,
                configurable: true,
            },
        )?;
        Ok(handle)
    }

    /// A platform-provided function (reports `[native code]`).
    pub fn create_native_function(
        &mut self,
        realm: RealmId,
        name: &str,
        constructable: bool,
        behaviour: impl Fn(&mut Agent, Invocation) -> Result<JsValue, ObjectError> + 'static,
    ) -> Result<ObjectHandle, ObjectError> {
        self.alloc_function(
            realm,
            name,
            FunctionOrigin::Platform,
            constructable,
            Rc::new(behaviour),
        )
    }

    /// A function defined by a loaded script.
    pub fn create_script_function(
        &mut self,
        realm: RealmId,
        name: &str,
        behaviour: impl Fn(&mut Agent, Invocation) -> Result<JsValue, ObjectError> + 'static,
    ) -> Result<ObjectHandle, ObjectError> {
        self.alloc_function(realm, name, FunctionOrigin::Script, false, Rc::new(behaviour))
    }

    /// Script-visible handle on `completion`.
    pub fn completion_object(
        &mut self,
        realm: RealmId,
        completion: CompletionHandle,
    ) -> Result<ObjectHandle, ObjectError> {
        let proto = self.realm(realm)?.class_prototype("Completion")?;
        Ok(self.heap.alloc(
            HeapObject::new(realm, Some(proto), ObjectKind::Completion(completion))
                .with_class("Completion"),
        ))
    }

    /// The completion behind a script-visible completion object.
    pub fn completion_of(&self, value: &JsValue) -> Option<CompletionHandle> {
        let handle = value.as_object()?;
        match self.heap.get(handle).ok()?.kind {
            ObjectKind::Completion(c) => Some(c),
            _ => None,
        }
    }

    /// Release an object and forget any platform bookkeeping for it.
    pub fn free_object(&mut self, handle: ObjectHandle) -> Result<(), ObjectError> {
        self.heap.free(handle)?;
        self.dom.forget(handle);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    pub fn wrapper_slot(&self, handle: ObjectHandle) -> Result<Option<WrapperSlot>, ObjectError> {
        match self.heap.get(handle)?.kind {
            ObjectKind::Wrapper(slot) => Ok(Some(slot)),
            _ => Ok(None),
        }
    }

    /// Follow wrapper targets down to the underlying object.
    pub fn innermost_target(&self, mut handle: ObjectHandle) -> Result<ObjectHandle, ObjectError> {
        let mut depth = 0;
        while let Some(slot) = self.wrapper_slot(handle)? {
            handle = slot.target;
            depth += 1;
            if depth > MAX_PROTOTYPE_CHAIN_DEPTH {
                return Err(ObjectError::TypeError("wrapper chain too deep".to_string()));
            }
        }
        Ok(handle)
    }

    pub fn is_callable(&self, value: &JsValue) -> bool {
        let Some(handle) = value.as_object() else {
            return false;
        };
        self.innermost_target(handle)
            .and_then(|h| self.heap.get(h))
            .is_ok_and(|obj| obj.function().is_some())
    }

    /// `Array.isArray`: sees through wrappers.
    pub fn is_array(&self, value: &JsValue) -> bool {
        let Some(handle) = value.as_object() else {
            return false;
        };
        self.innermost_target(handle)
            .and_then(|h| self.heap.get(h))
            .is_ok_and(HeapObject::is_array)
    }

    /// `typeof value`.
    pub fn type_of(&self, value: &JsValue) -> &'static str {
        match value {
            JsValue::Undefined => "undefined",
            JsValue::Null => "object",
            JsValue::Bool(_) => "boolean",
            JsValue::Int(_) => "number",
            JsValue::Str(_) => "string",
            JsValue::Symbol(_) => "symbol",
            JsValue::Object(handle) => {
                let target = self
                    .innermost_target(*handle)
                    .and_then(|h| self.heap.get(h));
                match target {
                    Ok(obj) if obj.class_tag.as_deref() == Some("HTMLAllCollection") => "undefined",
                    Ok(obj) if obj.function().is_some() => "function",
                    _ => "object",
                }
            }
        }
    }

    /// Convert a value to a property key.
    pub fn to_property_key(&self, value: &JsValue) -> PropertyKey {
        match value {
            JsValue::Symbol(id) => PropertyKey::Symbol(*id),
            other => PropertyKey::String(self.to_display_string(other)),
        }
    }

    /// `String(value)` for the value kinds the platform supports.
    pub fn to_display_string(&self, value: &JsValue) -> String {
        match value {
            JsValue::Object(handle) => {
                let target = self
                    .innermost_target(*handle)
                    .and_then(|h| self.heap.get(h));
                match target {
                    Ok(obj) => match obj.function() {
                        Some(f) if f.origin == FunctionOrigin::Platform => {
                            format!("function {}() {{ [native code] }}", f.name)
                        }
                        Some(f) => format!("function {}() {{ ... }}", f.name),
                        None => format!(
                            "[object {}]",
                            obj.class_tag.as_deref().unwrap_or("Object")
                        ),
                    },
                    Err(_) => "[object Object]".to_string(),
                }
            }
            other => other.to_string(),
        }
    }

    /// Integer conversion used by the standard library (`NaN` becomes 0).
    pub fn to_integer(&self, value: &JsValue) -> i64 {
        match value {
            JsValue::Int(n) => *n,
            JsValue::Bool(b) => i64::from(*b),
            JsValue::Str(s) => s.trim().parse().unwrap_or(0),
            _ => 0,
        }
    }

    // -----------------------------------------------------------------------
    // [[Get]] / [[Set]]
    // -----------------------------------------------------------------------

    pub fn get(&mut self, obj: ObjectHandle, key: &PropertyKey) -> Result<JsValue, ObjectError> {
        self.get_with_receiver(obj, key, &JsValue::Object(obj))
    }

    pub fn get_with_receiver(
        &mut self,
        obj: ObjectHandle,
        key: &PropertyKey,
        receiver: &JsValue,
    ) -> Result<JsValue, ObjectError> {
        if let Some(slot) = self.wrapper_slot(obj)? {
            let result = interception::handler_for(slot.kind).get(self, slot, key)?;
            ProxyInvariantChecker::check_get(self.heap.get(slot.target)?, key, &result)?;
            return Ok(result);
        }

        let mut current = Some(obj);
        let mut depth: u32 = 0;
        while let Some(handle) = current {
            if depth > MAX_PROTOTYPE_CHAIN_DEPTH {
                return Err(ObjectError::PrototypeChainTooDeep {
                    depth,
                    max: MAX_PROTOTYPE_CHAIN_DEPTH,
                });
            }
            let object = self.heap.get(handle)?;
            if object.is_wrapper() {
                return self.get_with_receiver(handle, key, receiver);
            }
            if let Some(desc) = object.get_own_property(key) {
                return match desc {
                    PropertyDescriptor::Data { value, .. } => Ok(value),
                    PropertyDescriptor::Accessor { get: Some(getter), .. } => {
                        self.call(&JsValue::Object(getter), receiver.clone(), Vec::new())
                    }
                    PropertyDescriptor::Accessor { get: None, .. } => Ok(JsValue::Undefined),
                };
            }
            current = object.prototype;
            depth += 1;
        }
        Ok(JsValue::Undefined)
    }

    /// `value[key]` for any value; primitives expose only `length` of strings.
    pub fn get_value(&mut self, value: &JsValue, key: &PropertyKey) -> Result<JsValue, ObjectError> {
        match value {
            JsValue::Object(handle) => self.get(*handle, key),
            JsValue::Undefined | JsValue::Null => Err(ObjectError::TypeError(format!(
                "cannot read properties of {value} (reading '{key}')"
            ))),
            JsValue::Str(s) if key.as_str() == Some("length") => Ok(JsValue::Int(s.chars().count() as i64)),
            _ => Ok(JsValue::Undefined),
        }
    }

    pub fn set(
        &mut self,
        obj: ObjectHandle,
        key: &PropertyKey,
        value: JsValue,
    ) -> Result<bool, ObjectError> {
        self.set_with_receiver(obj, key, value, JsValue::Object(obj))
    }

    pub fn set_with_receiver(
        &mut self,
        obj: ObjectHandle,
        key: &PropertyKey,
        value: JsValue,
        receiver: JsValue,
    ) -> Result<bool, ObjectError> {
        if let Some(slot) = self.wrapper_slot(obj)? {
            return interception::handler_for(slot.kind).set(self, slot, key, value);
        }

        let mut current = Some(obj);
        let mut depth: u32 = 0;
        let found = loop {
            let Some(handle) = current else {
                break None;
            };
            if depth > MAX_PROTOTYPE_CHAIN_DEPTH {
                return Err(ObjectError::PrototypeChainTooDeep {
                    depth,
                    max: MAX_PROTOTYPE_CHAIN_DEPTH,
                });
            }
            let object = self.heap.get(handle)?;
            if object.is_wrapper() {
                return self.set_with_receiver(handle, key, value, receiver);
            }
            if let Some(desc) = object.get_own_property(key) {
                break Some(desc);
            }
            current = object.prototype;
            depth += 1;
        };

        match found {
            Some(PropertyDescriptor::Accessor { set: Some(setter), .. }) => {
                self.call(&JsValue::Object(setter), receiver, vec![value])?;
                Ok(true)
            }
            Some(PropertyDescriptor::Accessor { set: None, .. }) => Ok(false),
            Some(PropertyDescriptor::Data {
                writable: false, ..
            }) => Ok(false),
            _ => {
                let JsValue::Object(target) = receiver else {
                    return Ok(false);
                };
                match self.get_own_property(target, key)? {
                    Some(PropertyDescriptor::Data {
                        writable,
                        enumerable,
                        configurable,
                        ..
                    }) => {
                        if !writable {
                            return Ok(false);
                        }
                        self.define_property(
                            target,
                            key.clone(),
                            PropertyDescriptor::Data {
                                value,
                                writable,
                                enumerable,
                                configurable,
                            },
                        )
                    }
                    Some(PropertyDescriptor::Accessor { .. }) => Ok(false),
                    None => {
                        self.define_property(target, key.clone(), PropertyDescriptor::data(value))
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Remaining internal methods
    // -----------------------------------------------------------------------

    pub fn has(&mut self, obj: ObjectHandle, key: &PropertyKey) -> Result<bool, ObjectError> {
        if let Some(slot) = self.wrapper_slot(obj)? {
            return interception::handler_for(slot.kind).has(self, slot, key);
        }
        let mut current = Some(obj);
        let mut depth: u32 = 0;
        while let Some(handle) = current {
            if depth > MAX_PROTOTYPE_CHAIN_DEPTH {
                return Err(ObjectError::PrototypeChainTooDeep {
                    depth,
                    max: MAX_PROTOTYPE_CHAIN_DEPTH,
                });
            }
            let object = self.heap.get(handle)?;
            if object.is_wrapper() {
                return self.has(handle, key);
            }
            if object.has_own_property(key) {
                return Ok(true);
            }
            current = object.prototype;
            depth += 1;
        }
        Ok(false)
    }

    pub fn delete(&mut self, obj: ObjectHandle, key: &PropertyKey) -> Result<bool, ObjectError> {
        if let Some(slot) = self.wrapper_slot(obj)? {
            let result = interception::handler_for(slot.kind).delete_property(self, slot, key)?;
            ProxyInvariantChecker::check_delete(self.heap.get(slot.target)?, key, result)?;
            return Ok(result);
        }
        Ok(self.heap.get_mut(obj)?.delete(key))
    }

    pub fn define_property(
        &mut self,
        obj: ObjectHandle,
        key: PropertyKey,
        desc: PropertyDescriptor,
    ) -> Result<bool, ObjectError> {
        if let Some(slot) = self.wrapper_slot(obj)? {
            let result =
                interception::handler_for(slot.kind).define_property(self, slot, &key, desc.clone())?;
            ProxyInvariantChecker::check_define_own_property(
                self.heap.get(slot.target)?,
                &key,
                &desc,
                result,
            )?;
            return Ok(result);
        }
        self.heap.get_mut(obj)?.define_own_property(key, desc)
    }

    /// `define_property` of a writable, configurable, non-enumerable value.
    pub fn define_hidden(
        &mut self,
        obj: ObjectHandle,
        name: &str,
        value: JsValue,
    ) -> Result<(), ObjectError> {
        if !self.define_property(obj, PropertyKey::from(name), PropertyDescriptor::hidden(value))? {
            return Err(ObjectError::TypeError(format!(
                "Cannot redefine property: {name}"
            )));
        }
        Ok(())
    }

    pub fn get_own_property(
        &mut self,
        obj: ObjectHandle,
        key: &PropertyKey,
    ) -> Result<Option<PropertyDescriptor>, ObjectError> {
        if let Some(slot) = self.wrapper_slot(obj)? {
            let result = interception::handler_for(slot.kind).get_own_property(self, slot, key)?;
            ProxyInvariantChecker::check_get_own_property(self.heap.get(slot.target)?, key, &result)?;
            return Ok(result);
        }
        Ok(self.heap.get(obj)?.get_own_property(key))
    }

    pub fn own_keys(&mut self, obj: ObjectHandle) -> Result<Vec<PropertyKey>, ObjectError> {
        if let Some(slot) = self.wrapper_slot(obj)? {
            return interception::handler_for(slot.kind).own_keys(self, slot);
        }
        Ok(self.heap.get(obj)?.own_property_keys())
    }

    /// Enumerable own string keys (`Object.keys`).
    pub fn keys(&mut self, obj: ObjectHandle) -> Result<Vec<String>, ObjectError> {
        let mut result = Vec::new();
        for key in self.own_keys(obj)? {
            let PropertyKey::String(name) = &key else {
                continue;
            };
            if self
                .get_own_property(obj, &key)?
                .is_some_and(|d| d.is_enumerable())
            {
                result.push(name.clone());
            }
        }
        Ok(result)
    }

    pub fn get_prototype_of(
        &mut self,
        obj: ObjectHandle,
    ) -> Result<Option<ObjectHandle>, ObjectError> {
        if let Some(slot) = self.wrapper_slot(obj)? {
            return interception::handler_for(slot.kind).get_prototype_of(self, slot);
        }
        self.heap.ordinary_prototype_of(obj)
    }

    pub fn set_prototype_of(
        &mut self,
        obj: ObjectHandle,
        proto: Option<ObjectHandle>,
    ) -> Result<bool, ObjectError> {
        if let Some(slot) = self.wrapper_slot(obj)? {
            return interception::handler_for(slot.kind).set_prototype_of(self, slot, proto);
        }
        self.heap.ordinary_set_prototype_of(obj, proto)
    }

    pub fn is_extensible(&mut self, obj: ObjectHandle) -> Result<bool, ObjectError> {
        if let Some(slot) = self.wrapper_slot(obj)? {
            let result = interception::handler_for(slot.kind).is_extensible(self, slot)?;
            ProxyInvariantChecker::check_is_extensible(self.heap.get(slot.target)?, result)?;
            return Ok(result);
        }
        Ok(self.heap.get(obj)?.extensible)
    }

    pub fn prevent_extensions(&mut self, obj: ObjectHandle) -> Result<bool, ObjectError> {
        if let Some(slot) = self.wrapper_slot(obj)? {
            return interception::handler_for(slot.kind).prevent_extensions(self, slot);
        }
        self.heap.get_mut(obj)?.prevent_extensions();
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // [[Call]] / [[Construct]]
    // -----------------------------------------------------------------------

    fn native_of(&self, handle: ObjectHandle) -> Result<Option<(NativeFn, FunctionData)>, ObjectError> {
        let Some(function) = self.heap.get(handle)?.function() else {
            return Ok(None);
        };
        let native = self
            .natives
            .get(function.native.0 as usize)
            .cloned()
            .ok_or_else(|| ObjectError::TypeError(format!("{} has no behaviour", function.name)))?;
        Ok(Some((native, function.clone())))
    }

    pub fn call(
        &mut self,
        callee: &JsValue,
        this: JsValue,
        args: Vec<JsValue>,
    ) -> Result<JsValue, ObjectError> {
        let Some(handle) = callee.as_object() else {
            return Err(ObjectError::NotCallable(self.to_display_string(callee)));
        };
        if let Some(slot) = self.wrapper_slot(handle)? {
            if !self.is_callable(callee) {
                return Err(ObjectError::NotCallable(self.to_display_string(callee)));
            }
            return interception::handler_for(slot.kind).apply(self, slot, this, args);
        }
        let Some((native, _)) = self.native_of(handle)? else {
            return Err(ObjectError::NotCallable(self.to_display_string(callee)));
        };
        native(
            self,
            Invocation {
                callee: handle,
                this,
                args,
                new_target: None,
            },
        )
    }

    pub fn construct(&mut self, callee: &JsValue, args: Vec<JsValue>) -> Result<JsValue, ObjectError> {
        let Some(handle) = callee.as_object() else {
            return Err(ObjectError::NotConstructor(self.to_display_string(callee)));
        };
        if let Some(slot) = self.wrapper_slot(handle)? {
            return interception::handler_for(slot.kind).construct(self, slot, args);
        }
        let Some((native, function)) = self.native_of(handle)? else {
            return Err(ObjectError::NotConstructor(self.to_display_string(callee)));
        };
        if !function.constructable {
            return Err(ObjectError::NotConstructor(function.name));
        }
        let realm = self.realm_of(handle)?;
        let proto = match self.get(handle, &PropertyKey::from("prototype"))? {
            JsValue::Object(p) => p,
            _ => self.realm(realm)?.object_prototype,
        };
        let mut instance = HeapObject::new(realm, Some(proto), ObjectKind::Ordinary);
        if function.origin == FunctionOrigin::Platform {
            instance = instance.with_class(&function.name);
        }
        let this = self.heap.alloc(instance);
        let result = native(
            self,
            Invocation {
                callee: handle,
                this: JsValue::Object(this),
                args,
                new_target: Some(handle),
            },
        )?;
        Ok(if result.is_object() {
            result
        } else {
            JsValue::Object(this)
        })
    }

    /// `value instanceof constructor`.
    pub fn instance_of(&mut self, value: &JsValue, constructor: &JsValue) -> Result<bool, ObjectError> {
        let Some(ctor) = constructor.as_object() else {
            return Err(ObjectError::TypeError(
                "right-hand side of 'instanceof' is not an object".to_string(),
            ));
        };
        if !self.is_callable(constructor) {
            return Err(ObjectError::TypeError(
                "right-hand side of 'instanceof' is not callable".to_string(),
            ));
        }
        let JsValue::Object(target) = self.get(ctor, &PropertyKey::from("prototype"))? else {
            return Err(ObjectError::TypeError(
                "function has non-object prototype in instanceof check".to_string(),
            ));
        };
        let Some(mut current) = value.as_object() else {
            return Ok(false);
        };
        for _ in 0..MAX_PROTOTYPE_CHAIN_DEPTH {
            match self.get_prototype_of(current)? {
                Some(proto) if proto == target => return Ok(true),
                Some(proto) => current = proto,
                None => return Ok(false),
            }
        }
        Err(ObjectError::PrototypeChainTooDeep {
            depth: MAX_PROTOTYPE_CHAIN_DEPTH,
            max: MAX_PROTOTYPE_CHAIN_DEPTH,
        })
    }

    // -----------------------------------------------------------------------
    // Convenience
    // -----------------------------------------------------------------------

    pub fn get_named(&mut self, obj: ObjectHandle, name: &str) -> Result<JsValue, ObjectError> {
        self.get(obj, &PropertyKey::from(name))
    }

    /// `value.name` where `value` must be an object.
    pub fn get_path(&mut self, value: &JsValue, name: &str) -> Result<JsValue, ObjectError> {
        self.get_value(value, &PropertyKey::from(name))
    }

    pub fn set_named(
        &mut self,
        obj: ObjectHandle,
        name: &str,
        value: JsValue,
    ) -> Result<bool, ObjectError> {
        self.set(obj, &PropertyKey::from(name), value)
    }

    /// `receiver.name(...args)`.
    pub fn call_method(
        &mut self,
        receiver: &JsValue,
        name: &str,
        args: Vec<JsValue>,
    ) -> Result<JsValue, ObjectError> {
        let method = self.get_path(receiver, name)?;
        if !self.is_callable(&method) {
            return Err(ObjectError::NotCallable(format!(
                "{}.{name}",
                self.to_display_string(receiver)
            )));
        }
        self.call(&method, receiver.clone(), args)
    }

    /// Array-like elements `0..length` of `value`.
    pub fn list_elements(&mut self, value: &JsValue) -> Result<Vec<JsValue>, ObjectError> {
        let length = self.get_path(value, "length")?;
        let length = self.to_integer(&length).max(0) as usize;
        let mut elements = Vec::with_capacity(length);
        for index in 0..length {
            elements.push(self.get_value(value, &PropertyKey::from(index))?);
        }
        Ok(elements)
    }

    // -----------------------------------------------------------------------
    // JSON interchange
    // -----------------------------------------------------------------------

    /// Build a script value in `realm` from JSON.
    pub fn value_from_json(
        &mut self,
        realm: RealmId,
        json: &serde_json::Value,
    ) -> Result<JsValue, ObjectError> {
        self.value_from_json_at(realm, json, 0)
    }

    fn value_from_json_at(
        &mut self,
        realm: RealmId,
        json: &serde_json::Value,
        depth: usize,
    ) -> Result<JsValue, ObjectError> {
        if depth > MAX_JSON_DEPTH {
            return Err(ObjectError::TypeError("JSON nests too deeply".to_string()));
        }
        Ok(match json {
            serde_json::Value::Null => JsValue::Null,
            serde_json::Value::Bool(b) => JsValue::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => JsValue::Int(i),
                None => JsValue::Int(n.as_f64().unwrap_or_default() as i64),
            },
            serde_json::Value::String(s) => JsValue::Str(s.clone()),
            serde_json::Value::Array(items) => {
                let mut elements = Vec::with_capacity(items.len());
                for item in items {
                    elements.push(self.value_from_json_at(realm, item, depth + 1)?);
                }
                JsValue::Object(self.create_array(realm, elements)?)
            }
            serde_json::Value::Object(map) => {
                let object = self.create_plain_object(realm)?;
                for (name, item) in map {
                    let value = self.value_from_json_at(realm, item, depth + 1)?;
                    self.define_property(object, PropertyKey::from(name.as_str()), PropertyDescriptor::data(value))?;
                }
                JsValue::Object(object)
            }
        })
    }

    /// Snapshot a script value as JSON (functions become `null`).
    pub fn value_to_json(&mut self, value: &JsValue) -> Result<serde_json::Value, ObjectError> {
        self.value_to_json_at(value, 0)
    }

    fn value_to_json_at(
        &mut self,
        value: &JsValue,
        depth: usize,
    ) -> Result<serde_json::Value, ObjectError> {
        if depth > MAX_JSON_DEPTH {
            return Err(ObjectError::TypeError("value nests too deeply".to_string()));
        }
        Ok(match value {
            JsValue::Undefined | JsValue::Null | JsValue::Symbol(_) => serde_json::Value::Null,
            JsValue::Bool(b) => serde_json::Value::Bool(*b),
            JsValue::Int(n) => serde_json::Value::from(*n),
            JsValue::Str(s) => serde_json::Value::String(s.clone()),
            JsValue::Object(handle) => {
                if self.is_callable(value) {
                    serde_json::Value::Null
                } else if self.is_array(value) {
                    let mut items = Vec::new();
                    for element in self.list_elements(value)? {
                        items.push(self.value_to_json_at(&element, depth + 1)?);
                    }
                    serde_json::Value::Array(items)
                } else {
                    let mut map = serde_json::Map::new();
                    for name in self.keys(*handle)? {
                        let item = self.get_named(*handle, &name)?;
                        map.insert(name, self.value_to_json_at(&item, depth + 1)?);
                    }
                    serde_json::Value::Object(map)
                }
            }
        })
    }
}

impl Default for Agent {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("objects", &self.heap.len())
            .field("realms", &self.realms.len())
            .field("natives", &self.natives.len())
            .field("bridges", &self.bridges.len())
            .field("completions", &self.completions)
            .field("event_loop", &self.event_loop)
            .field("current_script", &self.current_script)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
