//! Sandbox declarations and ready sandboxes.
//!
//! A [`SandboxDeclaration`] collects scripts for a name whose realm is still
//! being created.  Once the realm is ready and initialised, a [`Sandbox`]
//! takes over: it owns the realm handle, the script sequencer and the
//! aggregate completion chain.  Both are cheap `Rc` handles; clones share
//! state.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use crate::agent::Agent;
use crate::bridge::BridgeId;
use crate::completion::CompletionHandle;
use crate::host::HostPlatform;
use crate::object_model::{JsValue, ObjectError, ObjectHandle, RealmId};
use crate::sequencer::{ScriptSequencer, ScriptSpec};

// ---------------------------------------------------------------------------
// SandboxDeclaration
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct DeclarationInner {
    name: String,
    specs: RefCell<Vec<ScriptSpec>>,
}

/// A declared sandbox name and the scripts queued before its realm exists.
#[derive(Debug, Clone)]
pub struct SandboxDeclaration {
    inner: Rc<DeclarationInner>,
}

impl SandboxDeclaration {
    pub fn new(name: &str) -> Self {
        Self {
            inner: Rc::new(DeclarationInner {
                name: name.to_string(),
                specs: RefCell::new(Vec::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn add_spec(&self, locator: &str, completion: CompletionHandle) {
        self.inner.specs.borrow_mut().push(ScriptSpec {
            locator: locator.to_string(),
            completion,
        });
    }

    /// Remove and return every queued spec, in enqueue order.
    pub fn take_specs(&self) -> Vec<ScriptSpec> {
        std::mem::take(&mut *self.inner.specs.borrow_mut())
    }

    pub fn pending_count(&self) -> usize {
        self.inner.specs.borrow().len()
    }
}

// ---------------------------------------------------------------------------
// Sandbox
// ---------------------------------------------------------------------------

struct SandboxInner {
    name: String,
    realm: RealmId,
    global: ObjectHandle,
    document: ObjectHandle,
    bridge: Cell<Option<BridgeId>>,
    sequencer: RefCell<ScriptSequencer>,
    script_objects: RefCell<BTreeMap<RealmId, ObjectHandle>>,
    host: Rc<dyn HostPlatform>,
}

/// A ready isolated realm and its script sequencer.
#[derive(Clone)]
pub struct Sandbox {
    inner: Rc<SandboxInner>,
}

impl Sandbox {
    pub fn new(
        agent: &mut Agent,
        name: &str,
        realm: RealmId,
        host: Rc<dyn HostPlatform>,
    ) -> Result<Self, ObjectError> {
        let (global, document) = {
            let r = agent.realm(realm)?;
            (r.global, r.document)
        };
        let sequencer = ScriptSequencer::new(agent)?;
        Ok(Self {
            inner: Rc::new(SandboxInner {
                name: name.to_string(),
                realm,
                global,
                document,
                bridge: Cell::new(None),
                sequencer: RefCell::new(sequencer),
                script_objects: RefCell::new(BTreeMap::new()),
                host,
            }),
        })
    }

    pub fn get_name(&self) -> &str {
        &self.inner.name
    }

    pub fn get_content_realm(&self) -> RealmId {
        self.inner.realm
    }

    /// The isolated realm's true global object.
    pub fn get_content_window(&self) -> ObjectHandle {
        self.inner.global
    }

    /// The isolated realm's true document.
    pub fn get_content_document(&self) -> ObjectHandle {
        self.inner.document
    }

    /// Raw value of the isolated global `name`; no bridging is applied.
    pub fn get_global(&self, agent: &mut Agent, name: &str) -> Result<JsValue, ObjectError> {
        agent.get_named(self.inner.global, name)
    }

    /// Completion for "every script enqueued so far has settled".  Scripts
    /// enqueued afterwards are not covered; query again after enqueuing.
    pub fn get_pending_completion_future(&self) -> CompletionHandle {
        self.inner.sequencer.borrow().chain()
    }

    pub fn bridge(&self) -> Option<BridgeId> {
        self.inner.bridge.get()
    }

    pub(crate) fn set_bridge(&self, bridge: BridgeId) {
        self.inner.bridge.set(Some(bridge));
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Queue the script at `locator`; the returned completion settles with
    /// that script's own outcome.
    pub fn load_script(&self, agent: &mut Agent, locator: &str) -> Result<CompletionHandle, ObjectError> {
        let completion = agent.create_completion();
        agent.record_event(&self.inner.name, "sequencer", "script_enqueued", "ok", None);
        self.enqueue(agent, locator, completion)?;
        Ok(completion)
    }

    pub(crate) fn enqueue(
        &self,
        agent: &mut Agent,
        locator: &str,
        completion: CompletionHandle,
    ) -> Result<(), ObjectError> {
        let spec = ScriptSpec {
            locator: locator.to_string(),
            completion,
        };
        let start = self.inner.sequencer.borrow_mut().enqueue(agent, spec)?;
        if start {
            self.dequeue(agent);
        }
        Ok(())
    }

    fn dequeue(&self, agent: &mut Agent) {
        let Some(spec) = self.inner.sequencer.borrow_mut().next() else {
            return;
        };
        let sandbox = self.clone();
        self.inner.host.load_script(
            agent,
            self.inner.realm,
            &spec.locator,
            Box::new(move |agent, outcome| {
                let name = sandbox.get_name().to_string();
                let settled = match outcome {
                    Ok(()) => {
                        agent.record_event(&name, "sequencer", "script_loaded", "ok", None);
                        agent.fulfill(spec.completion, JsValue::Undefined)
                    }
                    Err(err) => {
                        agent.record_event(
                            &name,
                            "sequencer",
                            "script_failed",
                            "error",
                            Some(err.error_code()),
                        );
                        agent.reject(spec.completion, err)
                    }
                };
                // Keep the queue moving even if this completion was already
                // settled elsewhere.
                sandbox.dequeue(agent);
                settled?;
                Ok(())
            }),
        );
    }

    /// Script-visible handle on this sandbox for code running in `realm`.
    /// One object per realm.
    pub fn script_object(&self, agent: &mut Agent, realm: RealmId) -> Result<ObjectHandle, ObjectError> {
        if let Some(existing) = self.inner.script_objects.borrow().get(&realm) {
            return Ok(*existing);
        }
        let object = agent.create_plain_object(realm)?;

        let sandbox = self.clone();
        let get_global = agent.create_native_function(realm, "getGlobal", false, move |agent, inv| {
            let name = agent.to_display_string(&inv.arg(0));
            sandbox.get_global(agent, &name)
        })?;
        let sandbox = self.clone();
        let get_name = agent.create_native_function(realm, "getName", false, move |_, _| {
            Ok(JsValue::from(sandbox.get_name()))
        })?;
        let global = self.inner.global;
        let get_window = agent.create_native_function(realm, "getContentWindow", false, move |_, _| {
            Ok(JsValue::Object(global))
        })?;
        let document = self.inner.document;
        let get_document =
            agent.create_native_function(realm, "getContentDocument", false, move |_, _| {
                Ok(JsValue::Object(document))
            })?;
        let sandbox = self.clone();
        let get_pending =
            agent.create_native_function(realm, "getPendingCompletionFuture", false, move |agent, _| {
                let chain = sandbox.get_pending_completion_future();
                let handle = sandbox.script_object(agent, realm)?;
                let derived = agent.create_completion();
                agent.then(chain, move |agent, _| {
                    agent.fulfill(derived, JsValue::Object(handle))?;
                    Ok(())
                })?;
                Ok(JsValue::Object(agent.completion_object(realm, derived)?))
            })?;

        for (name, function) in [
            ("getGlobal", get_global),
            ("getName", get_name),
            ("getContentWindow", get_window),
            ("getContentDocument", get_document),
            ("getPendingCompletionFuture", get_pending),
        ] {
            agent.define_hidden(object, name, JsValue::Object(function))?;
        }
        self.inner.script_objects.borrow_mut().insert(realm, object);
        Ok(object)
    }
}

impl fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sandbox")
            .field("name", &self.inner.name)
            .field("realm", &self.inner.realm)
            .field("bridge", &self.inner.bridge.get())
            .field("sequencer", &self.inner.sequencer.borrow())
            .finish()
    }
}
