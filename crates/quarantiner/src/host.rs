//! Host platform collaborator: realm creation and script loading.
//!
//! The quarantine core never creates realms or fetches code itself.  It asks
//! a [`HostPlatform`] to "create an empty isolated realm, signal when ready"
//! and to "load code with a given source locator; notify success or
//! failure".  [`SimulatedHost`] implements both on the agent's virtual-clock
//! event loop so lifecycle behaviour (latency, reordering, failures) is fully
//! deterministic.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::agent::Agent;
use crate::error::QuarantineError;
use crate::object_model::{ObjectError, RealmId};
use crate::realm::RealmKind;

/// Node name reported for script elements.
pub const SCRIPT_NODE_NAME: &str = "SCRIPT";

/// The script whose body is currently executing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentScript {
    pub locator: String,
    pub node_name: String,
    pub realm: RealmId,
}

/// Invoked once a requested realm is ready.
pub type RealmReady = Box<dyn FnOnce(&mut Agent, RealmId) -> Result<(), ObjectError>>;

/// Invoked once a requested script has loaded (or failed to).
pub type ScriptDone =
    Box<dyn FnOnce(&mut Agent, Result<(), QuarantineError>) -> Result<(), ObjectError>>;

/// Capabilities the quarantine core needs from its host environment.
pub trait HostPlatform {
    /// Create an empty isolated realm named `name`; call `ready` with its id.
    fn create_realm(&self, agent: &mut Agent, name: &str, ready: RealmReady);

    /// Load and execute the script at `locator` inside `realm`, then call
    /// `done` with the outcome.
    fn load_script(&self, agent: &mut Agent, realm: RealmId, locator: &str, done: ScriptDone);
}

/// Body of a registered script.  Runs once per load, in the realm it is
/// loaded into.
pub type ScriptBody = Rc<dyn Fn(&mut Agent, RealmId) -> Result<(), ObjectError>>;

#[derive(Clone)]
struct RegisteredScript {
    latency_ms: u64,
    body: ScriptBody,
}

/// One completed (or failed) script load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptExecution {
    pub locator: String,
    pub realm: RealmId,
    pub succeeded: bool,
    pub virtual_time_ms: u64,
}

// ---------------------------------------------------------------------------
// SimulatedHost
// ---------------------------------------------------------------------------

/// Deterministic host on the virtual clock.
pub struct SimulatedHost {
    scripts: RefCell<BTreeMap<String, RegisteredScript>>,
    realm_latency_ms: Cell<u64>,
    realms_created: Cell<usize>,
    executions: Rc<RefCell<Vec<ScriptExecution>>>,
}

impl SimulatedHost {
    pub fn new() -> Self {
        Self {
            scripts: RefCell::new(BTreeMap::new()),
            realm_latency_ms: Cell::new(10),
            realms_created: Cell::new(0),
            executions: Rc::new(RefCell::new(Vec::new())),
        }
    }

    /// Delay between a realm request and its readiness.
    pub fn set_realm_latency(&self, latency_ms: u64) {
        self.realm_latency_ms.set(latency_ms);
    }

    /// Make `locator` loadable; the body runs `latency_ms` after each load
    /// request.
    pub fn register_script(
        &self,
        locator: &str,
        latency_ms: u64,
        body: impl Fn(&mut Agent, RealmId) -> Result<(), ObjectError> + 'static,
    ) {
        self.scripts.borrow_mut().insert(
            locator.to_string(),
            RegisteredScript {
                latency_ms,
                body: Rc::new(body),
            },
        );
    }

    /// Register a prepared body (see [`crate::entrypoint::quarantined_script`]).
    pub fn register_body(&self, locator: &str, latency_ms: u64, body: ScriptBody) {
        self.scripts
            .borrow_mut()
            .insert(locator.to_string(), RegisteredScript { latency_ms, body });
    }

    /// Number of realms this host has been asked to create.
    pub fn realm_creation_count(&self) -> usize {
        self.realms_created.get()
    }

    /// Every script load so far, in completion order.
    pub fn executions(&self) -> Vec<ScriptExecution> {
        self.executions.borrow().clone()
    }

    /// Load `locator` into the host realm, the way a page's own script tag
    /// would run.
    pub fn run_host_script(&self, agent: &mut Agent, locator: &str) {
        let realm = agent.host_realm();
        self.load_script(agent, realm, locator, Box::new(|_, _| Ok(())));
    }
}

impl Default for SimulatedHost {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SimulatedHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatedHost")
            .field("scripts", &self.scripts.borrow().keys().collect::<Vec<_>>())
            .field("realm_latency_ms", &self.realm_latency_ms.get())
            .field("realms_created", &self.realms_created.get())
            .field("executions", &self.executions.borrow().len())
            .finish()
    }
}

impl HostPlatform for SimulatedHost {
    fn create_realm(&self, agent: &mut Agent, name: &str, ready: RealmReady) {
        self.realms_created.set(self.realms_created.get() + 1);
        let name = name.to_string();
        agent.event_loop.schedule(
            self.realm_latency_ms.get(),
            Box::new(move |agent| {
                let realm = agent.create_realm(&name, RealmKind::Isolated)?;
                ready(agent, realm)
            }),
        );
    }

    fn load_script(&self, agent: &mut Agent, realm: RealmId, locator: &str, done: ScriptDone) {
        let script = self.scripts.borrow().get(locator).cloned();
        let latency = script.as_ref().map_or(0, |s| s.latency_ms);
        let executions = Rc::clone(&self.executions);
        let locator = locator.to_string();
        agent.event_loop.schedule(
            latency,
            Box::new(move |agent| {
                let outcome = match script {
                    None => Err(QuarantineError::ScriptLoad {
                        locator: locator.clone(),
                    }),
                    Some(script) => {
                        let previous = agent.set_current_script(Some(CurrentScript {
                            locator: locator.clone(),
                            node_name: SCRIPT_NODE_NAME.to_string(),
                            realm,
                        }));
                        let result = (script.body)(agent, realm);
                        agent.set_current_script(previous);
                        result.map_err(|err| QuarantineError::ScriptRuntime {
                            locator: locator.clone(),
                            message: err.to_string(),
                        })
                    }
                };
                executions.borrow_mut().push(ScriptExecution {
                    locator,
                    realm,
                    succeeded: outcome.is_ok(),
                    virtual_time_ms: agent.event_loop.now_ms(),
                });
                done(agent, outcome)
            }),
        );
    }
}
