//! Interception handlers: the per-wrapper dispatch table.
//!
//! A wrapper is a heap object of kind [`ObjectKind::Wrapper`] carrying a
//! [`WrapperSlot`].  Every generic object operation on a wrapper is routed
//! by [`crate::agent::Agent`] to the handler for the slot's
//! [`WrapperKind`]:
//!
//! | Kind               | Wraps                         | Consumed by   |
//! |--------------------|-------------------------------|---------------|
//! | `PlatformObject`   | node, collection, native fn   | isolated code |
//! | `Array`            | array (in place)              | isolated code |
//! | `Global`           | the isolated realm's global   | isolated code |
//! | `CallbackForwarder`| isolated callback             | host platform |
//!
//! The default trait methods implement the platform-object behaviour; the
//! other kinds override only what differs.
//!
//! [`ObjectKind::Wrapper`]: crate::object_model::ObjectKind::Wrapper

use serde::{Deserialize, Serialize};

use crate::agent::Agent;
use crate::bridge::BridgeId;
use crate::object_model::{JsValue, ObjectError, ObjectHandle, PropertyDescriptor, PropertyKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum WrapperKind {
    PlatformObject,
    Array,
    Global,
    CallbackForwarder,
}

/// Internal slot of a wrapper object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WrapperSlot {
    pub target: ObjectHandle,
    pub kind: WrapperKind,
    pub bridge: BridgeId,
}

/// The full structural operation set of a wrapper.
pub trait InterceptionHandler: Sync {
    fn get(&self, agent: &mut Agent, slot: WrapperSlot, key: &PropertyKey) -> Result<JsValue, ObjectError> {
        let value = agent.get(slot.target, key)?;
        agent.wrap(slot.bridge, value)
    }

    /// Writes land on the target itself so platform setters see the real
    /// receiver.
    fn set(
        &self,
        agent: &mut Agent,
        slot: WrapperSlot,
        key: &PropertyKey,
        value: JsValue,
    ) -> Result<bool, ObjectError> {
        let value = agent.unwrap_reference(slot.bridge, value)?;
        agent.set(slot.target, key, value)?;
        Ok(true)
    }

    fn has(&self, agent: &mut Agent, slot: WrapperSlot, key: &PropertyKey) -> Result<bool, ObjectError> {
        agent.has(slot.target, key)
    }

    fn delete_property(
        &self,
        agent: &mut Agent,
        slot: WrapperSlot,
        key: &PropertyKey,
    ) -> Result<bool, ObjectError> {
        agent.delete(slot.target, key)
    }

    fn define_property(
        &self,
        agent: &mut Agent,
        slot: WrapperSlot,
        key: &PropertyKey,
        desc: PropertyDescriptor,
    ) -> Result<bool, ObjectError> {
        let desc = match desc {
            PropertyDescriptor::Data {
                value,
                writable,
                enumerable,
                configurable,
            } => PropertyDescriptor::Data {
                value: agent.unwrap_reference(slot.bridge, value)?,
                writable,
                enumerable,
                configurable,
            },
            PropertyDescriptor::Accessor {
                get,
                set,
                enumerable,
                configurable,
            } => PropertyDescriptor::Accessor {
                get: unwrap_handle(agent, slot, get)?,
                set: unwrap_handle(agent, slot, set)?,
                enumerable,
                configurable,
            },
        };
        agent.define_property(slot.target, key.clone(), desc)
    }

    /// Own descriptors are reported with wrapped values, except pinned
    /// (non-configurable, non-writable) data which must match the target.
    fn get_own_property(
        &self,
        agent: &mut Agent,
        slot: WrapperSlot,
        key: &PropertyKey,
    ) -> Result<Option<PropertyDescriptor>, ObjectError> {
        let Some(desc) = agent.get_own_property(slot.target, key)? else {
            return Ok(None);
        };
        if desc.is_pinned() {
            return Ok(Some(desc));
        }
        Ok(Some(match desc {
            PropertyDescriptor::Data {
                value,
                writable,
                enumerable,
                configurable,
            } => PropertyDescriptor::Data {
                value: agent.wrap(slot.bridge, value)?,
                writable,
                enumerable,
                configurable,
            },
            PropertyDescriptor::Accessor {
                get,
                set,
                enumerable,
                configurable,
            } => PropertyDescriptor::Accessor {
                get: wrap_handle(agent, slot, get)?,
                set: wrap_handle(agent, slot, set)?,
                enumerable,
                configurable,
            },
        }))
    }

    fn own_keys(&self, agent: &mut Agent, slot: WrapperSlot) -> Result<Vec<PropertyKey>, ObjectError> {
        agent.own_keys(slot.target)
    }

    /// Prototype virtualisation: the target's prototype is replaced by the
    /// same-named class prototype of the isolated realm, so `instanceof`
    /// against isolated constructors holds.  Prototypes of classes the
    /// isolated realm lacks are wrapped instead.
    fn get_prototype_of(
        &self,
        agent: &mut Agent,
        slot: WrapperSlot,
    ) -> Result<Option<ObjectHandle>, ObjectError> {
        let Some(proto) = agent.get_prototype_of(slot.target)? else {
            return Ok(None);
        };
        let proto_realm = agent.realm_of(proto)?;
        let class = agent
            .realm(proto_realm)?
            .class_of_prototype(proto)
            .map(str::to_string);
        let isolated = agent.bridge(slot.bridge)?.isolated_realm();
        if let Some(class) = class
            && let Some(entry) = agent.realm(isolated)?.class(&class)
        {
            return Ok(Some(entry.prototype));
        }
        Ok(agent.wrap(slot.bridge, JsValue::Object(proto))?.as_object())
    }

    fn set_prototype_of(
        &self,
        agent: &mut Agent,
        slot: WrapperSlot,
        proto: Option<ObjectHandle>,
    ) -> Result<bool, ObjectError> {
        let proto = unwrap_handle(agent, slot, proto)?;
        agent.set_prototype_of(slot.target, proto)
    }

    fn is_extensible(&self, agent: &mut Agent, slot: WrapperSlot) -> Result<bool, ObjectError> {
        agent.is_extensible(slot.target)
    }

    fn prevent_extensions(&self, agent: &mut Agent, slot: WrapperSlot) -> Result<bool, ObjectError> {
        agent.prevent_extensions(slot.target)
    }

    /// `this` and every argument are resolved back to originals before the
    /// real call; the result is wrapped.
    fn apply(
        &self,
        agent: &mut Agent,
        slot: WrapperSlot,
        this: JsValue,
        args: Vec<JsValue>,
    ) -> Result<JsValue, ObjectError> {
        let this = agent.unwrap_reference(slot.bridge, this)?;
        let args = unwrap_all(agent, slot, args)?;
        let result = agent.call(&JsValue::Object(slot.target), this, args)?;
        agent.wrap(slot.bridge, result)
    }

    fn construct(
        &self,
        agent: &mut Agent,
        slot: WrapperSlot,
        args: Vec<JsValue>,
    ) -> Result<JsValue, ObjectError> {
        let args = unwrap_all(agent, slot, args)?;
        let instance = agent.construct(&JsValue::Object(slot.target), args)?;
        agent.wrap(slot.bridge, instance)
    }
}

fn unwrap_all(agent: &mut Agent, slot: WrapperSlot, args: Vec<JsValue>) -> Result<Vec<JsValue>, ObjectError> {
    args.into_iter()
        .map(|arg| agent.unwrap(slot.bridge, arg))
        .collect()
}

fn wrap_all(agent: &mut Agent, slot: WrapperSlot, args: Vec<JsValue>) -> Result<Vec<JsValue>, ObjectError> {
    args.into_iter()
        .map(|arg| agent.wrap(slot.bridge, arg))
        .collect()
}

fn wrap_handle(
    agent: &mut Agent,
    slot: WrapperSlot,
    handle: Option<ObjectHandle>,
) -> Result<Option<ObjectHandle>, ObjectError> {
    match handle {
        Some(h) => Ok(agent.wrap(slot.bridge, JsValue::Object(h))?.as_object()),
        None => Ok(None),
    }
}

fn unwrap_handle(
    agent: &mut Agent,
    slot: WrapperSlot,
    handle: Option<ObjectHandle>,
) -> Result<Option<ObjectHandle>, ObjectError> {
    match handle {
        Some(h) => Ok(agent
            .unwrap_reference(slot.bridge, JsValue::Object(h))?
            .as_object()),
        None => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// Platform objects
// ---------------------------------------------------------------------------

pub struct PlatformObjectHandler;

impl InterceptionHandler for PlatformObjectHandler {}

// ---------------------------------------------------------------------------
// Arrays
// ---------------------------------------------------------------------------

/// Arrays are wrapped in place.  Index reads skip the descriptor lookup;
/// named reads return pinned data unwrapped.
pub struct ArrayHandler;

impl InterceptionHandler for ArrayHandler {
    fn get(&self, agent: &mut Agent, slot: WrapperSlot, key: &PropertyKey) -> Result<JsValue, ObjectError> {
        if key.array_index().is_none()
            && let Some(desc) = agent.heap.get(slot.target)?.get_own_property(key)
            && desc.is_pinned()
        {
            return Ok(desc.value().cloned().unwrap_or(JsValue::Undefined));
        }
        let value = agent.get(slot.target, key)?;
        agent.wrap(slot.bridge, value)
    }
}

// ---------------------------------------------------------------------------
// The isolated global
// ---------------------------------------------------------------------------

/// Reads resolve, in order: the global override table (isolated-native
/// values), host metrics (live host values), scalars present on both
/// globals (host value, unless the isolated property is pinned), everything
/// else wrapped.
pub struct GlobalHandler;

impl InterceptionHandler for GlobalHandler {
    fn get(&self, agent: &mut Agent, slot: WrapperSlot, key: &PropertyKey) -> Result<JsValue, ObjectError> {
        let (host_realm, table_value, is_metric) = {
            let bridge = agent.bridge(slot.bridge)?;
            let name = key.as_str();
            (
                bridge.host_realm(),
                name.and_then(|n| bridge.global_override(n).cloned()),
                name.is_some_and(|n| bridge.policy().is_host_metric(n)),
            )
        };
        if let Some(value) = table_value {
            return Ok(value);
        }
        let host_global = agent.realm(host_realm)?.global;
        if is_metric {
            return agent.get(host_global, key);
        }
        let value = agent.get(slot.target, key)?;
        if !value.is_object()
            && agent
                .heap
                .get(slot.target)?
                .get_own_property(key)
                .is_some_and(|own| !own.is_pinned())
            && let Some(PropertyDescriptor::Data { value: host_value, .. }) =
                agent.heap.get(host_global)?.get_own_property(key)
            && !host_value.is_object()
        {
            return Ok(host_value);
        }
        agent.wrap(slot.bridge, value)
    }

    fn set(
        &self,
        agent: &mut Agent,
        slot: WrapperSlot,
        key: &PropertyKey,
        value: JsValue,
    ) -> Result<bool, ObjectError> {
        let value = agent.unwrap_reference(slot.bridge, value)?;
        if let Some(name) = key.as_str() {
            agent
                .bridge_mut(slot.bridge)?
                .update_global_override(name, &value);
        }
        agent.set(slot.target, key, value)?;
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Callback forwarders
// ---------------------------------------------------------------------------

/// Host-side stand-in for an isolated callback.  Invocation wraps `this`
/// and the arguments for the callback and resolves its result back to an
/// original; every other operation goes to the callback unchanged.
pub struct CallbackForwarderHandler;

impl InterceptionHandler for CallbackForwarderHandler {
    fn get(&self, agent: &mut Agent, slot: WrapperSlot, key: &PropertyKey) -> Result<JsValue, ObjectError> {
        agent.get(slot.target, key)
    }

    fn set(
        &self,
        agent: &mut Agent,
        slot: WrapperSlot,
        key: &PropertyKey,
        value: JsValue,
    ) -> Result<bool, ObjectError> {
        agent.set(slot.target, key, value)
    }

    fn get_own_property(
        &self,
        agent: &mut Agent,
        slot: WrapperSlot,
        key: &PropertyKey,
    ) -> Result<Option<PropertyDescriptor>, ObjectError> {
        agent.get_own_property(slot.target, key)
    }

    fn get_prototype_of(
        &self,
        agent: &mut Agent,
        slot: WrapperSlot,
    ) -> Result<Option<ObjectHandle>, ObjectError> {
        agent.get_prototype_of(slot.target)
    }

    fn apply(
        &self,
        agent: &mut Agent,
        slot: WrapperSlot,
        this: JsValue,
        args: Vec<JsValue>,
    ) -> Result<JsValue, ObjectError> {
        let this = agent.wrap(slot.bridge, this)?;
        let args = wrap_all(agent, slot, args)?;
        let result = agent.call(&JsValue::Object(slot.target), this, args)?;
        agent.unwrap(slot.bridge, result)
    }

    fn construct(
        &self,
        agent: &mut Agent,
        slot: WrapperSlot,
        _args: Vec<JsValue>,
    ) -> Result<JsValue, ObjectError> {
        Err(ObjectError::NotConstructor(
            agent.to_display_string(&JsValue::Object(slot.target)),
        ))
    }
}

/// The handler for a wrapper kind.
pub fn handler_for(kind: WrapperKind) -> &'static dyn InterceptionHandler {
    match kind {
        WrapperKind::PlatformObject => &PlatformObjectHandler,
        WrapperKind::Array => &ArrayHandler,
        WrapperKind::Global => &GlobalHandler,
        WrapperKind::CallbackForwarder => &CallbackForwarderHandler,
    }
}
