//! Realm initializer: joins a freshly created isolated realm to the host
//! through a new identity bridge.
//!
//! Steps, in order:
//!
//! 1. Build the capability table over both realms.
//! 2. Snapshot the isolated-native global overrides, install the bridge and
//!    re-expose the BOM classes through it.
//! 3. Create the wrapper of the isolated global and the wrapper of the host
//!    document.
//! 4. Cross-register identity: the host window appears as the isolated
//!    global wrapper, host standard constructors as their isolated
//!    counterparts, and the isolated document as the host document wrapper.
//! 5. Define the isolated `quarantiner` object whose `quarantine` entrypoint
//!    hands the isolated global wrapper to the payload's wrapper function.

use crate::agent::Agent;
use crate::bridge::{BridgeId, IdentityBridge};
use crate::capability::CapabilityTable;
use crate::config::{BridgePolicy, DEFAULT_SANDBOX_NAME};
use crate::interception::WrapperKind;
use crate::object_model::{JsValue, ObjectError};
use crate::repository::SandboxRepository;
use crate::sandbox::Sandbox;

/// Number of scope references a payload's wrapper function receives
/// (`window`, `self`, `top`, `parent`).
pub const SCOPE_REFERENCE_COUNT: usize = 4;

#[derive(Debug, Clone, Default)]
pub struct RealmInitializer {
    policy: BridgePolicy,
}

impl RealmInitializer {
    pub fn new(policy: BridgePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &BridgePolicy {
        &self.policy
    }

    pub fn initialise(
        &self,
        agent: &mut Agent,
        sandbox: &Sandbox,
        repository: &SandboxRepository,
    ) -> Result<BridgeId, ObjectError> {
        let host = agent.host_realm();
        let isolated = sandbox.get_content_realm();
        let (host_global, host_document) = {
            let r = agent.realm(host)?;
            (r.global, r.document)
        };
        let (isolated_global, isolated_document) = {
            let r = agent.realm(isolated)?;
            (r.global, r.document)
        };

        // 1. Capability table.
        let table = CapabilityTable::build(
            agent,
            &[host, isolated],
            &self.policy.all_capability_classes(),
        );

        // 2. Global overrides, bridge, BOM classes.
        let id = agent.next_bridge_id();
        let mut bridge = IdentityBridge::new(id, host, isolated, table, self.policy.clone());
        for name in &self.policy.global_overrides {
            let value = agent.get_named(isolated_global, name)?;
            if value != JsValue::Undefined {
                bridge.install_global_override(name, value);
            }
        }
        agent.install_bridge(bridge);
        for class in &self.policy.bom_classes {
            let constructor = agent.get_named(isolated_global, class)?;
            if constructor.is_object() {
                let wrapped = agent.wrap(id, constructor)?;
                agent.define_hidden(isolated_global, class, wrapped)?;
            }
        }

        // 3. Global and document wrappers.
        let global_wrapper = agent.create_wrapper(id, isolated_global, WrapperKind::Global)?;
        {
            let bridge = agent.bridge_mut(id)?;
            bridge.records.remember(isolated_global, global_wrapper);
            bridge.set_global_wrapper(global_wrapper);
        }
        let host_document_wrapper = agent.wrap(id, JsValue::Object(host_document))?;

        // 4. Identity redirects.
        let mut redirects = vec![
            (host_global, JsValue::Object(global_wrapper)),
            (isolated_document, host_document_wrapper),
        ];
        for name in &self.policy.host_redirects {
            let host_constructor = agent.get_named(host_global, name)?;
            let isolated_constructor = agent.get_named(isolated_global, name)?;
            if let (Some(original), true) = (host_constructor.as_object(), isolated_constructor.is_object()) {
                redirects.push((original, isolated_constructor));
            }
        }
        {
            let bridge = agent.bridge_mut(id)?;
            for (original, exposed) in redirects {
                bridge.records.redirect(original, exposed);
            }
        }

        // 5. Isolated entrypoint.
        let api = agent.create_plain_object(isolated)?;
        let quarantine = agent.create_native_function(isolated, "quarantine", false, move |agent, inv| {
            let wrapper_fn = inv.arg(0);
            if !agent.is_callable(&wrapper_fn) {
                return Err(ObjectError::TypeError(
                    "Quarantiner :: quarantine() expects a wrapper function".to_string(),
                ));
            }
            let scope = JsValue::Object(global_wrapper);
            agent.call(&wrapper_fn, JsValue::Undefined, vec![scope; SCOPE_REFERENCE_COUNT])?;
            Ok(JsValue::Undefined)
        })?;
        let repository = repository.clone();
        let get_sandbox = agent.create_native_function(isolated, "getSandbox", false, move |agent, inv| {
            let name = match inv.arg(0) {
                value if value.is_nullish() => DEFAULT_SANDBOX_NAME.to_string(),
                value => agent.to_display_string(&value),
            };
            let pending = repository.pending_sandbox(agent, &name)?;
            let object = repository.sandbox_object_future(agent, isolated, &name, pending)?;
            Ok(JsValue::Object(object))
        })?;
        agent.define_hidden(api, "quarantine", JsValue::Object(quarantine))?;
        agent.define_hidden(api, "getSandbox", JsValue::Object(get_sandbox))?;
        agent.define_hidden(isolated_global, "quarantiner", JsValue::Object(api))?;

        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::host::SimulatedHost;

    fn initialised() -> (Agent, Sandbox, BridgeId) {
        let host = Rc::new(SimulatedHost::new());
        let repository = SandboxRepository::new(host, BridgePolicy::default());
        let mut agent = Agent::new();
        repository.declare_sandbox(&mut agent, "ads");
        agent.run_until_idle();
        let sandbox = repository.sandbox("ads").unwrap();
        let bridge = sandbox.bridge().unwrap();
        (agent, sandbox, bridge)
    }

    #[test]
    fn global_overrides_are_snapshotted_from_the_isolated_realm() {
        let (mut agent, sandbox, bridge) = initialised();
        let isolated_object = sandbox.get_global(&mut agent, "Object").unwrap();
        let b = agent.bridge(bridge).unwrap();
        assert_eq!(b.global_override("Object"), Some(&isolated_object));
        assert_eq!(b.global_override("document"), None);
    }

    #[test]
    fn bom_classes_are_re_exposed_wrapped() {
        let (mut agent, sandbox, _) = initialised();
        let observer = sandbox.get_global(&mut agent, "MutationObserver").unwrap();
        let slot = agent.wrapper_slot(observer.as_object().unwrap()).unwrap().unwrap();
        assert_eq!(agent.realm_of(slot.target).unwrap(), sandbox.get_content_realm());
        assert_eq!(agent.type_of(&observer), "function");
    }

    #[test]
    fn isolated_entrypoint_is_installed_and_validates_its_argument() {
        let (mut agent, sandbox, _) = initialised();
        let api = sandbox.get_global(&mut agent, "quarantiner").unwrap();
        let err = agent
            .call_method(&api, "quarantine", vec![JsValue::Int(1)])
            .unwrap_err();
        assert!(matches!(err, ObjectError::TypeError(_)));
    }

    #[test]
    fn isolated_quarantine_passes_the_global_wrapper_four_times() {
        let (mut agent, sandbox, bridge) = initialised();
        let realm = sandbox.get_content_realm();
        let seen = Rc::new(std::cell::RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let wrapper = agent
            .create_script_function(realm, "wrapper", move |_, inv| {
                sink.borrow_mut().push((inv.this.clone(), inv.args.clone()));
                Ok(JsValue::Undefined)
            })
            .unwrap();
        let api = sandbox.get_global(&mut agent, "quarantiner").unwrap();
        agent
            .call_method(&api, "quarantine", vec![JsValue::Object(wrapper)])
            .unwrap();

        let global_wrapper = JsValue::Object(agent.bridge(bridge).unwrap().global_wrapper().unwrap());
        let seen = seen.borrow();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, JsValue::Undefined);
        assert_eq!(seen[0].1, vec![global_wrapper; SCOPE_REFERENCE_COUNT]);
    }
}
