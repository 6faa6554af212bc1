#![forbid(unsafe_code)]
//! Entrypoint behaviour seen from page scripts: synchronous override
//! declaration, the scope handed to the wrapper function, and bridged
//! override calls.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use quarantiner::completion::CompletionState;
use quarantiner::{
    Agent, BridgePolicy, JsValue, ObjectError, ObjectHandle, QuarantineError, Quarantiner,
    SimulatedHost, quarantined_script,
};

fn setup() -> (Agent, Rc<SimulatedHost>, Quarantiner) {
    let host = Rc::new(SimulatedHost::new());
    let quarantiner = Quarantiner::new(host.clone(), BridgePolicy::default());
    let mut agent = Agent::new();
    quarantiner.install_global(&mut agent).unwrap();
    (agent, host, quarantiner)
}

fn host_global(agent: &Agent) -> ObjectHandle {
    agent.realm(agent.host_realm()).unwrap().global
}

fn config(globals: &[&str]) -> serde_json::Value {
    let globals: serde_json::Map<String, serde_json::Value> = globals
        .iter()
        .map(|name| (name.to_string(), serde_json::json!({"type": "function"})))
        .collect();
    serde_json::json!({ "globals": globals })
}

// ---------------------------------------------------------------------------
// Declaration
// ---------------------------------------------------------------------------

#[test]
fn declared_global_is_a_function_as_soon_as_quarantine_returns() {
    let (mut agent, host, _) = setup();
    let seen_type = Rc::new(RefCell::new(None));
    let sink = Rc::clone(&seen_type);
    let inner = quarantined_script(config(&["myGlobal"]), |_, _| Ok(()));
    host.register_script("/lib.js", 3, move |agent, realm| {
        inner(agent, realm)?;
        if realm == agent.host_realm() {
            let global = agent.realm(realm)?.global;
            let value = agent.get_named(global, "myGlobal")?;
            *sink.borrow_mut() = Some(agent.type_of(&value));
        }
        Ok(())
    });
    host.run_host_script(&mut agent, "/lib.js");
    agent.run_until_idle();
    assert_eq!(*seen_type.borrow(), Some("function"));
}

#[test]
fn wrapper_runs_only_in_the_sandbox_with_one_scope_reference() {
    let (mut agent, host, _) = setup();
    let calls = Rc::new(Cell::new(0));
    let scopes = Rc::new(RefCell::new(Vec::new()));
    let (counter, sink) = (Rc::clone(&calls), Rc::clone(&scopes));
    host.register_body(
        "/lib.js",
        2,
        quarantined_script(serde_json::json!({}), move |_, scope| {
            counter.set(counter.get() + 1);
            sink.borrow_mut().push(scope.clone());
            Ok(())
        }),
    );
    host.run_host_script(&mut agent, "/lib.js");
    agent.run_until_idle();

    assert_eq!(calls.get(), 1);
    let scope = scopes.borrow()[0].clone();
    assert_ne!(scope.realm, agent.host_realm());
    assert_eq!(scope.window, scope.self_);
    assert_eq!(scope.window, scope.top);
    assert_eq!(scope.window, scope.parent);
    let window = scope.window.as_object().unwrap();
    let slot = agent.wrapper_slot(window).unwrap().unwrap();
    assert_eq!(slot.target, agent.realm(scope.realm).unwrap().global);
}

#[test]
fn host_quarantine_outside_a_script_is_rejected() {
    let (mut agent, _, _) = setup();
    let global = host_global(&agent);
    let api = agent.get_named(global, "quarantiner").unwrap();
    let wrapper = agent
        .create_script_function(agent.host_realm(), "wrapper", |_, _| Ok(JsValue::Undefined))
        .unwrap();

    let err = agent
        .call_method(&api, "quarantine", vec![JsValue::Object(wrapper), JsValue::Undefined])
        .unwrap_err();
    assert_eq!(
        err,
        ObjectError::from(QuarantineError::configuration(
            "Quarantiner :: No current script"
        ))
    );
}

// ---------------------------------------------------------------------------
// The isolated scope
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Observed {
    array_realm: Option<quarantiner::RealmId>,
    document_target: Option<ObjectHandle>,
    inner_width: Option<JsValue>,
    self_is_window: Option<bool>,
}

#[test]
fn isolated_scope_mixes_own_constructors_with_shared_platform_objects() {
    let (mut agent, host, _) = setup();
    let observed = Rc::new(RefCell::new(Observed::default()));
    let sink = Rc::clone(&observed);
    host.register_body(
        "/lib.js",
        2,
        quarantined_script(serde_json::json!({}), move |agent, scope| {
            let mut seen = sink.borrow_mut();
            let array = agent.get_path(&scope.window, "Array")?;
            seen.array_realm = Some(agent.realm_of(array.as_object().unwrap())?);
            let document = agent.get_path(&scope.window, "document")?;
            let document = document.as_object().unwrap();
            seen.document_target = agent.wrapper_slot(document)?.map(|slot| slot.target);
            seen.inner_width = Some(agent.get_path(&scope.window, "innerWidth")?);
            let self_ref = agent.get_path(&scope.window, "self")?;
            seen.self_is_window = Some(self_ref == scope.window);
            Ok(())
        }),
    );
    host.run_host_script(&mut agent, "/lib.js");
    agent.run_until_idle();

    let host_realm = agent.host_realm();
    let host_document = agent.realm(host_realm).unwrap().document;
    let seen = observed.borrow();
    assert_ne!(seen.array_realm, Some(host_realm));
    assert!(seen.array_realm.is_some());
    assert_eq!(seen.document_target, Some(host_document));
    assert_eq!(seen.inner_width, Some(JsValue::Int(1280)));
    assert_eq!(seen.self_is_window, Some(true));
}

// ---------------------------------------------------------------------------
// Override calls
// ---------------------------------------------------------------------------

#[test]
fn override_calls_bridge_platform_objects_both_ways() {
    let (mut agent, host, _) = setup();
    let received_wrapper = Rc::new(Cell::new(false));
    let sink = Rc::clone(&received_wrapper);
    host.register_body(
        "/lib.js",
        20,
        quarantined_script(config(&["track"]), move |agent, scope| {
            let window = scope.window.as_object().unwrap();
            let sink = Rc::clone(&sink);
            let track = agent.create_script_function(scope.realm, "track", move |agent, inv| {
                let node = inv.arg(0);
                if let Some(handle) = node.as_object() {
                    sink.set(agent.wrapper_slot(handle)?.is_some());
                }
                Ok(node)
            })?;
            agent.set_named(window, "track", JsValue::Object(track))?;
            Ok(())
        }),
    );
    let global = host_global(&agent);
    let outcome = Rc::new(RefCell::new(None));
    let result_sink = Rc::clone(&outcome);
    host.register_script("/page.js", 21, move |agent, realm| {
        let document = JsValue::Object(agent.realm(realm)?.document);
        let div = agent.call_method(&document, "createElement", vec![JsValue::from("div")])?;
        let track = agent.get_named(global, "track")?;
        let result = agent.call(&track, JsValue::Undefined, vec![div.clone()])?;
        *result_sink.borrow_mut() = Some((div, agent.completion_of(&result)));
        Ok(())
    });
    host.run_host_script(&mut agent, "/lib.js");
    host.run_host_script(&mut agent, "/page.js");
    agent.run_until_idle();

    assert!(received_wrapper.get());
    let (div, completion) = outcome.borrow().clone().unwrap();
    assert_eq!(
        agent.completion_state(completion.unwrap()).unwrap(),
        &CompletionState::Fulfilled(div)
    );
    assert_eq!(agent.events().count("override_queued"), 1);
    assert_eq!(agent.events().count("override_replayed"), 1);
}

#[test]
fn override_reassignment_from_a_page_script_throws() {
    let (mut agent, host, _) = setup();
    host.register_body(
        "/lib.js",
        2,
        quarantined_script(config(&["track"]), |_, _| Ok(())),
    );
    let global = host_global(&agent);
    let failure = Rc::new(RefCell::new(None));
    let sink = Rc::clone(&failure);
    host.register_script("/page.js", 5, move |agent, _| {
        let replacement = agent.create_script_function(agent.host_realm(), "mine", |_, _| {
            Ok(JsValue::Undefined)
        })?;
        *sink.borrow_mut() = agent
            .set_named(global, "track", JsValue::Object(replacement))
            .err();
        Ok(())
    });
    host.run_host_script(&mut agent, "/lib.js");
    host.run_host_script(&mut agent, "/page.js");
    agent.run_until_idle();

    assert_eq!(
        failure.borrow().clone(),
        Some(ObjectError::from(QuarantineError::DuplicateAssignment {
            name: "track".to_string()
        }))
    );
    let track = agent.get_named(global, "track").unwrap();
    assert_eq!(agent.type_of(&track), "function");
}

#[test]
fn override_without_isolated_definition_rejects_its_calls() {
    let (mut agent, host, _) = setup();
    host.register_body(
        "/lib.js",
        2,
        quarantined_script(config(&["track"]), |_, _| Ok(())),
    );
    host.run_host_script(&mut agent, "/lib.js");
    agent.run_until_idle();

    let global = host_global(&agent);
    let track = agent.get_named(global, "track").unwrap();
    let result = agent.call(&track, JsValue::Undefined, vec![]).unwrap();
    let completion = agent.completion_of(&result).unwrap();
    agent.run_until_idle();
    assert!(matches!(
        agent.completion_state(completion).unwrap(),
        CompletionState::Rejected(_)
    ));
}
