//! Entrypoint API: `quarantine()` and `getSandbox()`.
//!
//! `quarantine` runs in the host realm, synchronously from the script that is
//! currently executing.  It re-loads that script into the configured sandbox
//! and, for every declared global override, defines a host global whose
//! getter returns a stable forwarding function.  Calls made through the
//! forwarder before the sandboxed script has run are queued; they are
//! replayed in order once it has, and later calls forward directly.  Every
//! call returns a completion.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::agent::Agent;
use crate::bridge::BridgeId;
use crate::completion::{CompletionError, CompletionHandle, CompletionState};
use crate::config::{BridgePolicy, DEFAULT_SANDBOX_NAME, QuarantineConfig};
use crate::error::QuarantineError;
use crate::host::{HostPlatform, SCRIPT_NODE_NAME, ScriptBody};
use crate::object_model::{JsValue, ObjectError, ObjectHandle, PropertyDescriptor, PropertyKey, RealmId};
use crate::repository::SandboxRepository;
use crate::sandbox::Sandbox;

pub const NO_CURRENT_SCRIPT_MESSAGE: &str = "Quarantiner :: No current script";
pub const NOT_A_SCRIPT_MESSAGE: &str = "Quarantiner :: Not called from a script";

/// A call made through an override before the sandbox was ready.
#[derive(Debug, Clone)]
struct QueuedCall {
    args: Vec<JsValue>,
    completion: CompletionHandle,
}

#[derive(Debug)]
enum OverrideState {
    Pending(VecDeque<QueuedCall>),
    Ready(Sandbox),
    Failed(QuarantineError),
}

type SharedOverride = Rc<RefCell<OverrideState>>;

/// The outcome of one `quarantine()` call: fulfils once the script has run
/// in its sandbox and every queued override call has been replayed.
#[derive(Debug, Clone)]
pub struct SandboxFuture {
    completion: CompletionHandle,
    name: String,
    repository: SandboxRepository,
}

impl SandboxFuture {
    pub fn completion(&self) -> CompletionHandle {
        self.completion
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `None` while pending.
    pub fn sandbox(&self, agent: &Agent) -> Option<Result<Sandbox, QuarantineError>> {
        match agent.completion_state(self.completion) {
            Err(err) => Some(Err(err.clone().into())),
            Ok(CompletionState::Pending) => None,
            Ok(CompletionState::Rejected(err)) => Some(Err(err.clone())),
            Ok(CompletionState::Fulfilled(_)) => Some(self.repository.sandbox(&self.name).ok_or_else(|| {
                QuarantineError::RealmUnavailable {
                    name: self.name.clone(),
                }
            })),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Quarantiner {
    repository: SandboxRepository,
}

impl Quarantiner {
    pub fn new(host: Rc<dyn HostPlatform>, policy: BridgePolicy) -> Self {
        Self {
            repository: SandboxRepository::new(host, policy),
        }
    }

    pub fn repository(&self) -> &SandboxRepository {
        &self.repository
    }

    /// Quarantine the currently executing script.
    pub fn quarantine(
        &self,
        agent: &mut Agent,
        config: &QuarantineConfig,
    ) -> Result<SandboxFuture, QuarantineError> {
        let script = agent
            .current_script()
            .cloned()
            .ok_or_else(|| QuarantineError::configuration(NO_CURRENT_SCRIPT_MESSAGE))?;
        if script.node_name != SCRIPT_NODE_NAME {
            return Err(QuarantineError::configuration(NOT_A_SCRIPT_MESSAGE));
        }
        config.validate()?;

        let host_realm = agent.host_realm();
        let host_global = agent.realm(host_realm)?.global;
        for name in config.globals.keys() {
            let existing = agent.get_own_property(host_global, &PropertyKey::from(name.as_str()))?;
            if existing.is_some_and(|desc| !desc.is_configurable()) {
                return Err(QuarantineError::configuration(format!(
                    "Quarantiner :: Global {name} is already defined and cannot be overridden"
                )));
            }
        }

        let sandbox_name = config.sandbox.clone();
        let mut overrides = Vec::with_capacity(config.globals.len());
        for name in config.globals.keys() {
            let state: SharedOverride = Rc::new(RefCell::new(OverrideState::Pending(VecDeque::new())));
            self.define_override(agent, host_realm, host_global, &sandbox_name, name, &state)?;
            overrides.push((name.clone(), state));
        }

        let script_completion = match self.repository.sandbox_script(agent, &sandbox_name, &script.locator) {
            Ok(completion) => completion,
            Err(err) => {
                fail_overrides(agent, &overrides, &err)?;
                return Err(err);
            }
        };
        let completion = agent.create_completion();
        let repository = self.repository.clone();
        let name = sandbox_name.clone();
        agent.then(script_completion, move |agent, settlement| {
            match settlement {
                Ok(_) => {
                    let sandbox = repository
                        .sandbox(&name)
                        .ok_or_else(|| QuarantineError::RealmUnavailable { name: name.clone() })?;
                    for (global, state) in &overrides {
                        replay(agent, &sandbox, global, state)?;
                    }
                    agent.fulfill(completion, JsValue::Undefined)?;
                }
                Err(err) => {
                    fail_overrides(agent, &overrides, &err)?;
                    agent.reject(completion, err)?;
                }
            }
            Ok(())
        })?;

        Ok(SandboxFuture {
            completion,
            name: sandbox_name,
            repository: self.repository.clone(),
        })
    }

    fn define_override(
        &self,
        agent: &mut Agent,
        host_realm: RealmId,
        host_global: ObjectHandle,
        sandbox_name: &str,
        name: &str,
        state: &SharedOverride,
    ) -> Result<(), QuarantineError> {
        let forwarder = {
            let state = Rc::clone(state);
            let global = name.to_string();
            let sandbox_name = sandbox_name.to_string();
            agent.create_script_function(host_realm, name, move |agent, inv| {
                let completion = agent.create_completion();
                let ready = match &*state.borrow() {
                    OverrideState::Pending(_) => None,
                    OverrideState::Ready(sandbox) => Some(Ok(sandbox.clone())),
                    OverrideState::Failed(err) => Some(Err(err.clone())),
                };
                match ready {
                    None => {
                        if let OverrideState::Pending(queue) = &mut *state.borrow_mut() {
                            queue.push_back(QueuedCall {
                                args: inv.args,
                                completion,
                            });
                        }
                        agent.record_event(&sandbox_name, "entrypoint", "override_queued", "ok", None);
                    }
                    Some(Ok(sandbox)) => invoke(agent, &sandbox, &global, inv.args, completion)?,
                    Some(Err(err)) => agent.reject(completion, err)?,
                }
                Ok(JsValue::Object(agent.completion_object(host_realm, completion)?))
            })?
        };
        let getter = agent.create_native_function(host_realm, name, false, move |_, _| {
            Ok(JsValue::Object(forwarder))
        })?;
        let setter = {
            let global = name.to_string();
            let sandbox_name = sandbox_name.to_string();
            agent.create_native_function(host_realm, name, false, move |agent, _| {
                let err = QuarantineError::DuplicateAssignment {
                    name: global.clone(),
                };
                agent.record_event(
                    &sandbox_name,
                    "entrypoint",
                    "override_reassignment_rejected",
                    "error",
                    Some(err.error_code()),
                );
                Err(err.into())
            })?
        };
        let defined = agent.define_property(
            host_global,
            PropertyKey::from(name),
            PropertyDescriptor::Accessor {
                get: Some(getter),
                set: Some(setter),
                enumerable: true,
                configurable: false,
            },
        )?;
        if !defined {
            return Err(QuarantineError::configuration(format!(
                "Quarantiner :: Global {name} is already defined and cannot be overridden"
            )));
        }
        agent.record_event(sandbox_name, "entrypoint", "override_declared", "ok", None);
        Ok(())
    }

    /// Completion fulfilling once sandbox `name` is ready and every script
    /// enqueued to it so far has settled.
    pub fn get_sandbox(&self, agent: &mut Agent, name: &str) -> Result<SandboxFuture, QuarantineError> {
        let completion = self.repository.pending_sandbox(agent, name)?;
        Ok(SandboxFuture {
            completion,
            name: name.to_string(),
            repository: self.repository.clone(),
        })
    }

    /// Define the host global `quarantiner` object with `quarantine(fn,
    /// config)` and `getSandbox(name)`, both returning completion objects
    /// that fulfil with a sandbox object.
    pub fn install_global(&self, agent: &mut Agent) -> Result<ObjectHandle, ObjectError> {
        let host_realm = agent.host_realm();
        let host_global = agent.realm(host_realm)?.global;
        let api = agent.create_plain_object(host_realm)?;

        let quarantiner = self.clone();
        let quarantine = agent.create_native_function(host_realm, "quarantine", false, move |agent, inv| {
            // The wrapper function only runs inside the sandbox.
            let config = QuarantineConfig::from_script_value(agent, &inv.arg(1))?;
            let future = quarantiner.quarantine(agent, &config)?;
            let object = quarantiner.repository.sandbox_object_future(
                agent,
                host_realm,
                future.name(),
                future.completion(),
            )?;
            Ok(JsValue::Object(object))
        })?;
        let quarantiner = self.clone();
        let get_sandbox = agent.create_native_function(host_realm, "getSandbox", false, move |agent, inv| {
            let name = match inv.arg(0) {
                value if value.is_nullish() => DEFAULT_SANDBOX_NAME.to_string(),
                value => agent.to_display_string(&value),
            };
            let future = quarantiner.get_sandbox(agent, &name)?;
            let object = quarantiner.repository.sandbox_object_future(
                agent,
                host_realm,
                &name,
                future.completion(),
            )?;
            Ok(JsValue::Object(object))
        })?;
        agent.define_hidden(api, "quarantine", JsValue::Object(quarantine))?;
        agent.define_hidden(api, "getSandbox", JsValue::Object(get_sandbox))?;
        agent.define_hidden(host_global, "quarantiner", JsValue::Object(api))?;
        Ok(api)
    }
}

/// Switch every override to `Failed(err)`, rejecting the calls queued so far.
fn fail_overrides(
    agent: &mut Agent,
    overrides: &[(String, SharedOverride)],
    err: &QuarantineError,
) -> Result<(), CompletionError> {
    for (_, state) in overrides {
        let previous = std::mem::replace(&mut *state.borrow_mut(), OverrideState::Failed(err.clone()));
        if let OverrideState::Pending(queue) = previous {
            for call in queue {
                agent.reject(call.completion, err.clone())?;
            }
        }
    }
    Ok(())
}

/// Replay queued calls until the queue stays empty, then switch to direct
/// forwarding.  Calls made while replaying join the back of the queue.
fn replay(
    agent: &mut Agent,
    sandbox: &Sandbox,
    global: &str,
    state: &SharedOverride,
) -> Result<(), ObjectError> {
    loop {
        let next = match &mut *state.borrow_mut() {
            OverrideState::Pending(queue) => queue.pop_front(),
            _ => None,
        };
        let Some(call) = next else {
            break;
        };
        agent.record_event(sandbox.get_name(), "entrypoint", "override_replayed", "ok", None);
        invoke(agent, sandbox, global, call.args, call.completion)?;
    }
    *state.borrow_mut() = OverrideState::Ready(sandbox.clone());
    Ok(())
}

/// Call the isolated definition of `global` with bridged arguments and
/// settle `completion` with its (unwrapped) result.  A completion result is
/// adopted.
fn invoke(
    agent: &mut Agent,
    sandbox: &Sandbox,
    global: &str,
    args: Vec<JsValue>,
    completion: CompletionHandle,
) -> Result<(), ObjectError> {
    let Some(bridge) = sandbox.bridge() else {
        agent.reject(
            completion,
            QuarantineError::RealmUnavailable {
                name: sandbox.get_name().to_string(),
            },
        )?;
        return Ok(());
    };
    match call_isolated(agent, sandbox, bridge, global, args) {
        Ok(value) => match agent.completion_of(&value) {
            Some(inner) => agent.then(inner, move |agent, settlement| {
                let settlement = match settlement {
                    Ok(value) => Ok(agent.unwrap(bridge, value)?),
                    Err(err) => Err(err),
                };
                agent.settle(completion, settlement)?;
                Ok(())
            })?,
            None => agent.fulfill(completion, value)?,
        },
        Err(err) => agent.reject(completion, err.into())?,
    }
    Ok(())
}

fn call_isolated(
    agent: &mut Agent,
    sandbox: &Sandbox,
    bridge: BridgeId,
    global: &str,
    args: Vec<JsValue>,
) -> Result<JsValue, ObjectError> {
    let function = sandbox.get_global(agent, global)?;
    if !agent.is_callable(&function) {
        return Err(ObjectError::NotCallable(global.to_string()));
    }
    let mut bridged = Vec::with_capacity(args.len());
    for arg in args {
        bridged.push(agent.wrap(bridge, arg)?);
    }
    let result = agent.call(&function, JsValue::Undefined, bridged)?;
    agent.unwrap(bridge, result)
}

// ---------------------------------------------------------------------------
// Script helpers
// ---------------------------------------------------------------------------

/// The four scope references a quarantined wrapper function receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeRefs {
    /// Realm the wrapper function runs in.
    pub realm: RealmId,
    pub parent: JsValue,
    pub self_: JsValue,
    pub top: JsValue,
    pub window: JsValue,
}

/// A script body that calls `quarantiner.quarantine(wrapper, config)` on the
/// global of whatever realm it runs in.  `body` is the wrapper function; it
/// runs only inside the sandbox.
pub fn quarantined_script(
    config: serde_json::Value,
    body: impl Fn(&mut Agent, &ScopeRefs) -> Result<(), ObjectError> + 'static,
) -> ScriptBody {
    let body = Rc::new(body);
    Rc::new(move |agent: &mut Agent, realm: RealmId| -> Result<(), ObjectError> {
        let global = agent.realm(realm)?.global;
        let api = agent.get_named(global, "quarantiner")?;
        let config = agent.value_from_json(realm, &config)?;
        let body = Rc::clone(&body);
        let wrapper = agent.create_script_function(realm, "wrapper", move |agent, inv| {
            let scope = ScopeRefs {
                realm,
                parent: inv.arg(0),
                self_: inv.arg(1),
                top: inv.arg(2),
                window: inv.arg(3),
            };
            body(agent, &scope)?;
            Ok(JsValue::Undefined)
        })?;
        agent.call_method(&api, "quarantine", vec![JsValue::Object(wrapper), config])?;
        Ok(())
    })
}
