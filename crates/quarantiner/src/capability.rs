//! Capability classification.
//!
//! Decides, per value, whether a value crossing the realm boundary needs an
//! identity-preserving wrapper.  Platform prototypes that need interception
//! are recorded once, at realm initialisation, in an explicit
//! [`CapabilityTable`]; no marker is ever written onto a shared prototype.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::agent::Agent;
use crate::object_model::{FunctionOrigin, JsValue, ObjectHandle, ObjectKind, RealmId};

/// How a value is treated when it crosses the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ValueClass {
    /// Primitive; passed through unchanged.
    Scalar,
    /// Platform function (`[native code]`); wrapped.
    NativeFunction,
    /// Instance (or prototype) of a marked platform class; wrapped.
    PlatformObject,
    /// Array; wrapped in place.
    Array,
    /// Script-defined object or function; passed through unchanged.
    PlainData,
}

impl ValueClass {
    pub fn needs_wrapper(self) -> bool {
        matches!(self, Self::NativeFunction | Self::PlatformObject | Self::Array)
    }
}

/// Set of platform prototypes whose instances are capability objects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityTable {
    marked: BTreeSet<ObjectHandle>,
}

impl CapabilityTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the prototype of every class in `classes` in each of `realms`.
    /// Classes a realm does not define are skipped.
    pub fn build(agent: &Agent, realms: &[RealmId], classes: &[String]) -> Self {
        let mut table = Self::new();
        for realm in realms {
            let Ok(realm) = agent.realm(*realm) else {
                continue;
            };
            for class in classes {
                if let Some(entry) = realm.class(class) {
                    table.mark(entry.prototype);
                }
            }
        }
        table
    }

    pub fn mark(&mut self, prototype: ObjectHandle) {
        self.marked.insert(prototype);
    }

    pub fn is_marked(&self, prototype: ObjectHandle) -> bool {
        self.marked.contains(&prototype)
    }

    pub fn len(&self) -> usize {
        self.marked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.marked.is_empty()
    }

    /// Classify `value`.  Wrappers are classified by what they wrap.
    ///
    /// `HTMLAllCollection` instances report `typeof` `"undefined"` but are
    /// objects here, so they are wrapped like any other collection.
    pub fn classify(&self, agent: &Agent, value: &JsValue) -> ValueClass {
        let JsValue::Object(handle) = value else {
            return ValueClass::Scalar;
        };
        let Ok(target) = agent.innermost_target(*handle) else {
            return ValueClass::PlainData;
        };
        let Ok(object) = agent.heap.get(target) else {
            return ValueClass::PlainData;
        };
        match &object.kind {
            ObjectKind::Function(f) if f.origin == FunctionOrigin::Platform => {
                return ValueClass::NativeFunction;
            }
            ObjectKind::Function(_) => return ValueClass::PlainData,
            _ => {}
        }
        if self.is_marked(target) {
            return ValueClass::PlatformObject;
        }
        if let Ok(chain) = agent.heap.prototype_chain(target)
            && chain.iter().any(|p| self.is_marked(*p))
        {
            return ValueClass::PlatformObject;
        }
        if object.is_array() {
            return ValueClass::Array;
        }
        ValueClass::PlainData
    }
}
