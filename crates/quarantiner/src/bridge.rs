//! Identity bridge: wrap and unwrap values crossing the realm boundary.
//!
//! One [`IdentityBridge`] exists per isolated realm.  It owns the realm's
//! [`ProxyRecordStore`], the [`CapabilityTable`] built at initialisation and
//! the snapshot of isolated-native global overrides.  The operations are
//! implemented on [`Agent`] because wrapping allocates and classification
//! inspects the heap.
//!
//! Guarantees:
//!
//! - `wrap(x) == wrap(x)` for every capability object `x` (records are
//!   consulted before anything is allocated).
//! - `unwrap(wrap(x)) == x`.
//! - A callback unwrapped twice yields the same forwarder, and wrapping that
//!   forwarder yields the callback again.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::agent::Agent;
use crate::capability::{CapabilityTable, ValueClass};
use crate::config::BridgePolicy;
use crate::interception::{WrapperKind, WrapperSlot};
use crate::object_model::{HeapObject, JsValue, ObjectError, ObjectHandle, ObjectKind, RealmId};
use crate::proxy_record::ProxyRecordStore;

/// Maximum array nesting unwrapped element-wise.
const MAX_UNWRAP_DEPTH: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BridgeId(pub u32);

impl fmt::Display for BridgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bridge#{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct IdentityBridge {
    id: BridgeId,
    host_realm: RealmId,
    isolated_realm: RealmId,
    pub(crate) records: ProxyRecordStore,
    capabilities: CapabilityTable,
    policy: BridgePolicy,
    global_wrapper: Option<ObjectHandle>,
    global_table: BTreeMap<String, JsValue>,
}

impl IdentityBridge {
    pub fn new(
        id: BridgeId,
        host_realm: RealmId,
        isolated_realm: RealmId,
        capabilities: CapabilityTable,
        policy: BridgePolicy,
    ) -> Self {
        Self {
            id,
            host_realm,
            isolated_realm,
            records: ProxyRecordStore::new(),
            capabilities,
            policy,
            global_wrapper: None,
            global_table: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> BridgeId {
        self.id
    }

    pub fn host_realm(&self) -> RealmId {
        self.host_realm
    }

    pub fn isolated_realm(&self) -> RealmId {
        self.isolated_realm
    }

    pub fn records(&self) -> &ProxyRecordStore {
        &self.records
    }

    pub fn capabilities(&self) -> &CapabilityTable {
        &self.capabilities
    }

    pub fn policy(&self) -> &BridgePolicy {
        &self.policy
    }

    /// Wrapper of the isolated realm's global, once initialised.
    pub fn global_wrapper(&self) -> Option<ObjectHandle> {
        self.global_wrapper
    }

    pub(crate) fn set_global_wrapper(&mut self, wrapper: ObjectHandle) {
        self.global_wrapper = Some(wrapper);
    }

    /// Isolated-native value served for global `name`, if it is overridden.
    pub fn global_override(&self, name: &str) -> Option<&JsValue> {
        self.global_table.get(name)
    }

    pub(crate) fn install_global_override(&mut self, name: &str, value: JsValue) {
        self.global_table.insert(name.to_string(), value);
    }

    /// Keep an overridden entry in step with a write through the global
    /// wrapper; names outside the table are ignored.
    pub(crate) fn update_global_override(&mut self, name: &str, value: &JsValue) {
        if let Some(slot) = self.global_table.get_mut(name) {
            *slot = value.clone();
        }
    }
}

impl Agent {
    /// Allocate a wrapper of `kind` around `target`.  Forwarders live in the
    /// host realm; every other wrapper lives in the isolated realm.
    pub fn create_wrapper(
        &mut self,
        bridge: BridgeId,
        target: ObjectHandle,
        kind: WrapperKind,
    ) -> Result<ObjectHandle, ObjectError> {
        let (host_realm, isolated_realm) = {
            let b = self.bridge(bridge)?;
            (b.host_realm(), b.isolated_realm())
        };
        self.heap.get(target)?;
        let realm = match kind {
            WrapperKind::CallbackForwarder => host_realm,
            _ => isolated_realm,
        };
        Ok(self.heap.alloc(HeapObject::new(
            realm,
            None,
            ObjectKind::Wrapper(WrapperSlot {
                target,
                kind,
                bridge,
            }),
        )))
    }

    /// Value the isolated realm sees for `value`.
    pub fn wrap(&mut self, bridge: BridgeId, value: JsValue) -> Result<JsValue, ObjectError> {
        let JsValue::Object(handle) = value else {
            return Ok(value);
        };
        if let Some(slot) = self.wrapper_slot(handle)? {
            if slot.kind == WrapperKind::CallbackForwarder && slot.bridge == bridge {
                return Ok(JsValue::Object(slot.target));
            }
            return Ok(value);
        }
        let class = {
            let b = self.bridge(bridge)?;
            if let Some(existing) = b.records.wrapper_for(handle) {
                return Ok(existing);
            }
            // Wrapper prototypes resolve to the isolated realm's own class
            // prototypes, so those are exposed raw.
            let isolated = b.isolated_realm();
            if self.realm_of(handle)? == isolated
                && self.realm(isolated)?.class_of_prototype(handle).is_some()
            {
                return Ok(value);
            }
            b.capabilities.classify(self, &value)
        };
        if !class.needs_wrapper() {
            return Ok(value);
        }
        let kind = match class {
            ValueClass::Array => WrapperKind::Array,
            _ => WrapperKind::PlatformObject,
        };
        let wrapper = self.create_wrapper(bridge, handle, kind)?;
        self.bridge_mut(bridge)?.records.remember(handle, wrapper);
        Ok(JsValue::Object(wrapper))
    }

    /// Resolve `value` back to an original when it is one of this bridge's
    /// wrappers; anything else is returned unchanged.
    pub fn unwrap_reference(&mut self, bridge: BridgeId, value: JsValue) -> Result<JsValue, ObjectError> {
        let JsValue::Object(handle) = value else {
            return Ok(value);
        };
        if let Some(original) = self.bridge(bridge)?.records.original_for(handle) {
            return Ok(JsValue::Object(original));
        }
        match self.wrapper_slot(handle)? {
            Some(slot) if slot.bridge == bridge => Ok(JsValue::Object(slot.target)),
            _ => Ok(value),
        }
    }

    /// Value the host platform receives for `value`: originals for
    /// wrappers, a cached forwarder for callbacks, arrays unwrapped
    /// element-wise.
    pub fn unwrap(&mut self, bridge: BridgeId, value: JsValue) -> Result<JsValue, ObjectError> {
        self.unwrap_at(bridge, value, 0)
    }

    fn unwrap_at(&mut self, bridge: BridgeId, value: JsValue, depth: usize) -> Result<JsValue, ObjectError> {
        let JsValue::Object(handle) = value else {
            return Ok(value);
        };
        if let Some(original) = self.bridge(bridge)?.records.original_for(handle) {
            return Ok(JsValue::Object(original));
        }
        if let Some(slot) = self.wrapper_slot(handle)? {
            return Ok(if slot.bridge == bridge {
                JsValue::Object(slot.target)
            } else {
                value
            });
        }
        if self.is_callable(&value) {
            if let Some(forwarder) = self.bridge(bridge)?.records.forwarder_for(handle) {
                return Ok(JsValue::Object(forwarder));
            }
            let forwarder = self.create_wrapper(bridge, handle, WrapperKind::CallbackForwarder)?;
            self.bridge_mut(bridge)?
                .records
                .remember_forwarder(handle, forwarder);
            return Ok(JsValue::Object(forwarder));
        }
        if depth < MAX_UNWRAP_DEPTH
            && let ObjectKind::Array(elements) = &self.heap.get(handle)?.kind
        {
            let elements = elements.clone();
            let mut unwrapped = Vec::with_capacity(elements.len());
            for element in &elements {
                unwrapped.push(self.unwrap_at(bridge, element.clone(), depth + 1)?);
            }
            if unwrapped == elements {
                return Ok(value);
            }
            let realm = self.realm_of(handle)?;
            return Ok(JsValue::Object(self.create_array(realm, unwrapped)?));
        }
        Ok(value)
    }

    /// Sweep every bridge's records for freed objects.  Returns the total
    /// number of records evicted.
    pub fn collect_bridge_records(&mut self) -> Result<usize, ObjectError> {
        let mut total = 0;
        for id in self.bridge_ids() {
            let mut records = std::mem::take(&mut self.bridge_mut(id)?.records);
            let evicted = records.evict_stale(&self.heap);
            self.bridge_mut(id)?.records = records;
            if evicted > 0 {
                let sandbox = {
                    let isolated = self.bridge(id)?.isolated_realm();
                    self.realm(isolated)?.name.clone()
                };
                self.record_event(&sandbox, "bridge", "records_evicted", "ok", None);
            }
            total += evicted;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_model::{PropertyDescriptor, PropertyKey};
    use crate::realm::RealmKind;

    /// A host realm plus one isolated realm joined by a bridge (no redirects).
    fn bridged() -> (Agent, BridgeId, RealmId) {
        let mut agent = Agent::new();
        let isolated = agent.create_realm("sandbox", RealmKind::Isolated).unwrap();
        let policy = BridgePolicy::default();
        let table = CapabilityTable::build(
            &agent,
            &[agent.host_realm(), isolated],
            &policy.all_capability_classes(),
        );
        let id = agent.next_bridge_id();
        let bridge = IdentityBridge::new(id, agent.host_realm(), isolated, table, policy);
        agent.install_bridge(bridge);
        (agent, id, isolated)
    }

    fn host_div(agent: &mut Agent) -> JsValue {
        let document = JsValue::Object(agent.realm(agent.host_realm()).unwrap().document);
        agent
            .call_method(&document, "createElement", vec![JsValue::from("div")])
            .unwrap()
    }

    // -----------------------------------------------------------------------
    // Identity
    // -----------------------------------------------------------------------

    #[test]
    fn wrap_is_identity_stable_and_reversible() {
        let (mut agent, id, _) = bridged();
        let div = host_div(&mut agent);
        let a = agent.wrap(id, div.clone()).unwrap();
        let b = agent.wrap(id, div.clone()).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, div);
        assert_eq!(agent.unwrap(id, a.clone()).unwrap(), div);
        // Wrapping a wrapper is the identity.
        assert_eq!(agent.wrap(id, a.clone()).unwrap(), a);
    }

    #[test]
    fn scalars_and_plain_objects_pass_through() {
        let (mut agent, id, _) = bridged();
        let realm = agent.host_realm();
        assert_eq!(agent.wrap(id, JsValue::Int(5)).unwrap(), JsValue::Int(5));
        let plain = JsValue::Object(agent.create_plain_object(realm).unwrap());
        assert_eq!(agent.wrap(id, plain.clone()).unwrap(), plain);
        assert_eq!(agent.bridge(id).unwrap().records().len(), 0);
    }

    #[test]
    fn callbacks_get_one_stable_forwarder() {
        let (mut agent, id, isolated) = bridged();
        let callback = JsValue::Object(
            agent
                .create_script_function(isolated, "listener", |_, _| Ok(JsValue::Undefined))
                .unwrap(),
        );
        let f1 = agent.unwrap(id, callback.clone()).unwrap();
        let f2 = agent.unwrap(id, callback.clone()).unwrap();
        assert_eq!(f1, f2);
        assert_ne!(f1, callback);
        assert_eq!(agent.type_of(&f1), "function");
        assert_eq!(agent.wrap(id, f1).unwrap(), callback);
    }

    #[test]
    fn forwarder_wraps_arguments_for_the_callback() {
        let (mut agent, id, isolated) = bridged();
        let div = host_div(&mut agent);
        let wrapped_div = agent.wrap(id, div.clone()).unwrap();
        let callback = JsValue::Object(
            agent
                .create_script_function(isolated, "echo", |_, inv| Ok(inv.arg(0)))
                .unwrap(),
        );
        let forwarder = agent.unwrap(id, callback).unwrap();
        let seen = agent
            .call(&forwarder, JsValue::Undefined, vec![div.clone()])
            .unwrap();
        // The callback saw the wrapper; the host gets the original back.
        assert_eq!(seen, div);
        let echo_raw = agent.create_script_function(isolated, "raw", move |_, inv| {
            assert_eq!(inv.arg(0), wrapped_div);
            Ok(JsValue::Undefined)
        });
        let forwarder = agent.unwrap(id, JsValue::Object(echo_raw.unwrap())).unwrap();
        agent.call(&forwarder, JsValue::Undefined, vec![div]).unwrap();
    }

    // -----------------------------------------------------------------------
    // Structural forwarding
    // -----------------------------------------------------------------------

    #[test]
    fn writes_through_wrapper_land_on_original() {
        let (mut agent, id, _) = bridged();
        let div = host_div(&mut agent);
        let wrapper = agent.wrap(id, div.clone()).unwrap().as_object().unwrap();
        agent.set_named(wrapper, "title", JsValue::from("hello")).unwrap();
        assert_eq!(agent.get_path(&div, "title").unwrap(), JsValue::from("hello"));
        let key = PropertyKey::from("title");
        assert!(agent.has(wrapper, &key).unwrap());
        assert!(agent.delete(wrapper, &key).unwrap());
        assert_eq!(agent.get_path(&div, "title").unwrap(), JsValue::Undefined);
        agent.prevent_extensions(wrapper).unwrap();
        assert!(!agent.is_extensible(div.as_object().unwrap()).unwrap());
    }

    #[test]
    fn prototype_is_virtualised_into_the_isolated_realm() {
        let (mut agent, id, isolated) = bridged();
        let div = host_div(&mut agent);
        let wrapper = agent.wrap(id, div.clone()).unwrap();
        let isolated_global = agent.realm(isolated).unwrap().global;
        let host_global = agent.realm(agent.host_realm()).unwrap().global;
        let isolated_div_ctor = agent.get_named(isolated_global, "HTMLDivElement").unwrap();
        let isolated_node_ctor = agent.get_named(isolated_global, "Node").unwrap();
        let host_div_ctor = agent.get_named(host_global, "HTMLDivElement").unwrap();
        assert!(agent.instance_of(&wrapper, &isolated_div_ctor).unwrap());
        assert!(agent.instance_of(&wrapper, &isolated_node_ctor).unwrap());
        assert!(!agent.instance_of(&wrapper, &host_div_ctor).unwrap());
        assert!(agent.instance_of(&div, &host_div_ctor).unwrap());
    }

    #[test]
    fn calls_unwrap_this_and_arguments() {
        let (mut agent, id, _) = bridged();
        let document = JsValue::Object(agent.realm(agent.host_realm()).unwrap().document);
        let wrapped_document = agent.wrap(id, document).unwrap();
        let body = agent.get_path(&wrapped_document, "body").unwrap();
        let div = agent
            .call_method(&wrapped_document, "createElement", vec![JsValue::from("div")])
            .unwrap();
        // Both are wrappers; appendChild receives the originals.
        agent.call_method(&body, "appendChild", vec![div.clone()]).unwrap();
        let raw_body = agent.unwrap(id, body).unwrap().as_object().unwrap();
        let raw_div = agent.unwrap(id, div).unwrap().as_object().unwrap();
        assert_eq!(agent.dom.children_of(raw_body), [raw_div]);
    }

    #[test]
    fn pinned_array_property_is_returned_raw() {
        let (mut agent, id, realm) = bridged();
        let array = agent.create_array(agent.host_realm(), vec![]).unwrap();
        let marker = agent.create_plain_object(realm).unwrap();
        let document = agent.realm(agent.host_realm()).unwrap().document;
        agent
            .define_property(
                array,
                PropertyKey::from("owner"),
                PropertyDescriptor::data_frozen(JsValue::Object(document)),
            )
            .unwrap();
        agent
            .define_property(
                array,
                PropertyKey::from("marker"),
                PropertyDescriptor::data(JsValue::Object(marker)),
            )
            .unwrap();
        let wrapper = agent.wrap(id, JsValue::Object(array)).unwrap().as_object().unwrap();
        assert_eq!(
            agent.get_named(wrapper, "owner").unwrap(),
            JsValue::Object(document)
        );
        assert_eq!(agent.get_named(wrapper, "marker").unwrap(), JsValue::Object(marker));
    }

    #[test]
    fn pinned_capability_through_generic_wrapper_is_a_type_error() {
        let (mut agent, id, _) = bridged();
        let div = host_div(&mut agent);
        let document = agent.realm(agent.host_realm()).unwrap().document;
        agent
            .define_property(
                div.as_object().unwrap(),
                PropertyKey::from("owner"),
                PropertyDescriptor::data_frozen(JsValue::Object(document)),
            )
            .unwrap();
        let wrapper = agent.wrap(id, div).unwrap().as_object().unwrap();
        assert!(matches!(
            agent.get_named(wrapper, "owner"),
            Err(ObjectError::TypeError(_))
        ));
    }

    #[test]
    fn arrays_unwrap_element_wise() {
        let (mut agent, id, isolated) = bridged();
        let div = host_div(&mut agent);
        let wrapped = agent.wrap(id, div.clone()).unwrap();
        let list = agent
            .create_array(isolated, vec![wrapped, JsValue::Int(1)])
            .unwrap();
        let unwrapped = agent.unwrap(id, JsValue::Object(list)).unwrap();
        assert_ne!(unwrapped, JsValue::Object(list));
        assert_eq!(
            agent.list_elements(&unwrapped).unwrap(),
            vec![div, JsValue::Int(1)]
        );
        let plain = agent.create_array(isolated, vec![JsValue::Int(2)]).unwrap();
        assert_eq!(
            agent.unwrap(id, JsValue::Object(plain)).unwrap(),
            JsValue::Object(plain)
        );
    }

    // -----------------------------------------------------------------------
    // Eviction
    // -----------------------------------------------------------------------

    #[test]
    fn freed_originals_are_evicted_and_logged() {
        let (mut agent, id, _) = bridged();
        let div = host_div(&mut agent);
        let wrapper = agent.wrap(id, div.clone()).unwrap();
        agent.free_object(div.as_object().unwrap()).unwrap();
        assert_eq!(agent.collect_bridge_records().unwrap(), 1);
        assert_eq!(agent.events().count("records_evicted"), 1);
        assert_eq!(agent.bridge(id).unwrap().records().original_for(wrapper.as_object().unwrap()), None);
        assert_eq!(agent.collect_bridge_records().unwrap(), 0);
    }
}
