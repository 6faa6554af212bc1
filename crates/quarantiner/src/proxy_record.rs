//! Proxy record store: original ↔ wrapper associations for one bridge.
//!
//! Forward records map an original object to the value the isolated realm
//! sees for it (its wrapper, or a redirect target such as the isolated
//! global's wrapper for the host window).  Reverse records map a wrapper
//! back to its original and exist only for wrappers this store created.
//! Callback forwarders are kept in their own table so a callback handed to
//! the host twice (e.g. add then remove of an event listener) resolves to
//! the same forwarder.
//!
//! There is no collector: records are evicted explicitly by
//! [`ProxyRecordStore::evict_stale`] once either side has been freed.

use std::collections::BTreeMap;

use crate::object_model::{JsValue, ObjectHandle, ObjectHeap};

#[derive(Debug, Clone, Default)]
pub struct ProxyRecordStore {
    forward: BTreeMap<ObjectHandle, JsValue>,
    reverse: BTreeMap<ObjectHandle, ObjectHandle>,
    forwarders: BTreeMap<ObjectHandle, ObjectHandle>,
}

impl ProxyRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `wrapper` as the one wrapper of `original`, both directions.
    /// Returns false (and records nothing) if either side is already taken.
    pub fn remember(&mut self, original: ObjectHandle, wrapper: ObjectHandle) -> bool {
        if self.forward.contains_key(&original) || self.reverse.contains_key(&wrapper) {
            return false;
        }
        self.forward.insert(original, JsValue::Object(wrapper));
        self.reverse.insert(wrapper, original);
        true
    }

    /// Forward-only record: `original` is exposed as `exposed`, but
    /// `exposed` does not unwrap back to `original`.
    pub fn redirect(&mut self, original: ObjectHandle, exposed: JsValue) {
        self.forward.insert(original, exposed);
    }

    pub fn wrapper_for(&self, original: ObjectHandle) -> Option<JsValue> {
        self.forward.get(&original).cloned()
    }

    pub fn original_for(&self, wrapper: ObjectHandle) -> Option<ObjectHandle> {
        self.reverse.get(&wrapper).copied()
    }

    /// Record `forwarder` as the host-side stand-in for `callback`.
    pub fn remember_forwarder(&mut self, callback: ObjectHandle, forwarder: ObjectHandle) {
        self.forwarders.insert(callback, forwarder);
        self.reverse.insert(forwarder, callback);
    }

    pub fn forwarder_for(&self, callback: ObjectHandle) -> Option<ObjectHandle> {
        self.forwarders.get(&callback).copied()
    }

    /// Number of forward and forwarder records.
    pub fn len(&self) -> usize {
        self.forward.len() + self.forwarders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every record with a freed side.  Returns how many forward and
    /// forwarder records were removed.
    pub fn evict_stale(&mut self, heap: &ObjectHeap) -> usize {
        let live_value = |value: &JsValue| value.as_object().is_none_or(|h| heap.is_live(h));
        let before = self.len();
        self.forward
            .retain(|original, exposed| heap.is_live(*original) && live_value(exposed));
        self.forwarders
            .retain(|callback, forwarder| heap.is_live(*callback) && heap.is_live(*forwarder));
        self.reverse
            .retain(|wrapper, original| heap.is_live(*wrapper) && heap.is_live(*original));
        before - self.len()
    }
}
