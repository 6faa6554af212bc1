//! Sandbox repository: one declaration, one realm and one sandbox per name.
//!
//! Per-name state machine: `Undeclared → Declared → Ready`, or
//! `Declared → Failed` when initialisation is rejected.  Nothing is ever
//! torn down.  No `RefCell` borrow is held across a call into the host or
//! into the agent's event loop.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use crate::agent::Agent;
use crate::completion::CompletionHandle;
use crate::config::BridgePolicy;
use crate::error::QuarantineError;
use crate::host::HostPlatform;
use crate::initializer::RealmInitializer;
use crate::object_model::{JsValue, ObjectError, ObjectHandle, RealmId};
use crate::sandbox::{Sandbox, SandboxDeclaration};

#[derive(Default)]
struct RepositoryState {
    declarations: BTreeMap<String, SandboxDeclaration>,
    sandboxes: BTreeMap<String, Sandbox>,
    initialisations: BTreeMap<String, CompletionHandle>,
    failures: BTreeMap<String, QuarantineError>,
}

struct RepositoryInner {
    host: Rc<dyn HostPlatform>,
    initializer: RealmInitializer,
    state: RefCell<RepositoryState>,
}

#[derive(Clone)]
pub struct SandboxRepository {
    inner: Rc<RepositoryInner>,
}

impl SandboxRepository {
    pub fn new(host: Rc<dyn HostPlatform>, policy: BridgePolicy) -> Self {
        Self {
            inner: Rc::new(RepositoryInner {
                host,
                initializer: RealmInitializer::new(policy),
                state: RefCell::new(RepositoryState::default()),
            }),
        }
    }

    pub fn policy(&self) -> &BridgePolicy {
        self.inner.initializer.policy()
    }

    /// Declare `name`.  The first declaration requests a realm from the host
    /// and initialises it once ready; later ones return the same
    /// declaration.
    pub fn declare_sandbox(&self, agent: &mut Agent, name: &str) -> SandboxDeclaration {
        if let Some(existing) = self.inner.state.borrow().declarations.get(name) {
            return existing.clone();
        }
        let declaration = SandboxDeclaration::new(name);
        let initialisation = agent.create_completion();
        {
            let mut state = self.inner.state.borrow_mut();
            state
                .declarations
                .insert(name.to_string(), declaration.clone());
            state
                .initialisations
                .insert(name.to_string(), initialisation);
        }
        agent.record_event(name, "repository", "sandbox_declared", "ok", None);

        let repository = self.clone();
        let pending = declaration.clone();
        self.inner.host.create_realm(
            agent,
            name,
            Box::new(move |agent, realm| repository.on_realm_ready(agent, &pending, realm, initialisation)),
        );
        declaration
    }

    fn on_realm_ready(
        &self,
        agent: &mut Agent,
        declaration: &SandboxDeclaration,
        realm: RealmId,
        initialisation: CompletionHandle,
    ) -> Result<(), ObjectError> {
        let name = declaration.name();
        agent.record_event(name, "repository", "realm_created", "ok", None);

        let sandbox = Sandbox::new(agent, name, realm, Rc::clone(&self.inner.host))?;
        match self.inner.initializer.initialise(agent, &sandbox, self) {
            Ok(bridge) => sandbox.set_bridge(bridge),
            Err(err) => {
                let err = QuarantineError::from(err);
                agent.record_event(
                    name,
                    "initializer",
                    "realm_initialised",
                    "error",
                    Some(err.error_code()),
                );
                self.inner
                    .state
                    .borrow_mut()
                    .failures
                    .insert(name.to_string(), err.clone());
                for spec in declaration.take_specs() {
                    agent.reject(spec.completion, err.clone())?;
                }
                agent.reject(initialisation, err)?;
                return Ok(());
            }
        }
        self.inner
            .state
            .borrow_mut()
            .sandboxes
            .insert(name.to_string(), sandbox.clone());
        agent.record_event(name, "initializer", "realm_initialised", "ok", None);

        for spec in declaration.take_specs() {
            sandbox.enqueue(agent, &spec.locator, spec.completion)?;
        }
        agent.fulfill(initialisation, JsValue::Undefined)?;
        Ok(())
    }

    /// Initialisation completion of `name`; fulfils once its realm is ready.
    pub fn get_sandbox(&self, name: &str) -> Result<CompletionHandle, QuarantineError> {
        self.inner
            .state
            .borrow()
            .initialisations
            .get(name)
            .copied()
            .ok_or_else(|| QuarantineError::RealmUnavailable {
                name: name.to_string(),
            })
    }

    /// Completion that fulfils once `name` is ready and every script
    /// enqueued to it so far has settled.
    pub fn pending_sandbox(&self, agent: &mut Agent, name: &str) -> Result<CompletionHandle, QuarantineError> {
        let initialisation = self.get_sandbox(name)?;
        if let Some(sandbox) = self.sandbox(name) {
            return Ok(sandbox.get_pending_completion_future());
        }
        let pending = agent.create_completion();
        let repository = self.clone();
        let name = name.to_string();
        agent.then(initialisation, move |agent, settlement| {
            match settlement {
                Ok(_) => match repository.sandbox(&name) {
                    Some(sandbox) => {
                        let chain = sandbox.get_pending_completion_future();
                        agent.then(chain, move |agent, settlement| {
                            agent.settle(pending, settlement)?;
                            Ok(())
                        })?;
                    }
                    None => agent.reject(pending, QuarantineError::RealmUnavailable { name })?,
                },
                Err(err) => agent.reject(pending, err)?,
            }
            Ok(())
        })?;
        Ok(pending)
    }

    /// Declare `name` if needed and queue the script at `locator` in it.
    /// The returned completion settles with that script's own outcome.
    pub fn sandbox_script(
        &self,
        agent: &mut Agent,
        name: &str,
        locator: &str,
    ) -> Result<CompletionHandle, QuarantineError> {
        let declaration = self.declare_sandbox(agent, name);
        let completion = agent.create_completion();
        agent.record_event(name, "repository", "script_enqueued", "ok", None);
        let failure = self.inner.state.borrow().failures.get(name).cloned();
        match (self.sandbox(name), failure) {
            (Some(sandbox), _) => sandbox.enqueue(agent, locator, completion)?,
            (None, Some(err)) => agent.reject(completion, err)?,
            (None, None) => declaration.add_spec(locator, completion),
        }
        Ok(completion)
    }

    /// The ready sandbox called `name`, if any.
    pub fn sandbox(&self, name: &str) -> Option<Sandbox> {
        self.inner.state.borrow().sandboxes.get(name).cloned()
    }

    pub fn is_declared(&self, name: &str) -> bool {
        self.inner.state.borrow().declarations.contains_key(name)
    }

    pub fn sandbox_names(&self) -> Vec<String> {
        self.inner.state.borrow().declarations.keys().cloned().collect()
    }

    /// Script-visible completion in `realm` that fulfils with the sandbox
    /// object of `name` once `source` fulfils.
    pub(crate) fn sandbox_object_future(
        &self,
        agent: &mut Agent,
        realm: RealmId,
        name: &str,
        source: CompletionHandle,
    ) -> Result<ObjectHandle, ObjectError> {
        let derived = agent.create_completion();
        let repository = self.clone();
        let name = name.to_string();
        agent.then(source, move |agent, settlement| {
            match settlement {
                Ok(_) => match repository.sandbox(&name) {
                    Some(sandbox) => {
                        let object = sandbox.script_object(agent, realm)?;
                        agent.fulfill(derived, JsValue::Object(object))?;
                    }
                    None => agent.reject(derived, QuarantineError::RealmUnavailable { name })?,
                },
                Err(err) => agent.reject(derived, err)?,
            }
            Ok(())
        })?;
        agent.completion_object(realm, derived)
    }
}

impl fmt::Debug for SandboxRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("SandboxRepository")
            .field("declared", &state.declarations.keys().collect::<Vec<_>>())
            .field("ready", &state.sandboxes.keys().collect::<Vec<_>>())
            .field("failed", &state.failures.keys().collect::<Vec<_>>())
            .field("policy", self.policy())
            .finish()
    }
}
