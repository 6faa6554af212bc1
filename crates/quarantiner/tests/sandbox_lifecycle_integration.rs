#![forbid(unsafe_code)]
//! Sandbox lifecycle: one realm per name, FIFO script execution, failure
//! isolation and readiness futures.

use std::cell::RefCell;
use std::rc::Rc;

use quarantiner::completion::CompletionState;
use quarantiner::{
    Agent, BridgePolicy, JsValue, QuarantineError, Quarantiner, RealmId, SimulatedHost,
    quarantined_script,
};

fn setup() -> (Agent, Rc<SimulatedHost>, Quarantiner) {
    let host = Rc::new(SimulatedHost::new());
    let quarantiner = Quarantiner::new(host.clone(), BridgePolicy::default());
    let mut agent = Agent::new();
    quarantiner.install_global(&mut agent).unwrap();
    (agent, host, quarantiner)
}

fn recording_script(host: &SimulatedHost, locator: &str, latency_ms: u64, log: &Rc<RefCell<Vec<String>>>) {
    let log = Rc::clone(log);
    let name = locator.to_string();
    host.register_script(locator, latency_ms, move |_, _| {
        log.borrow_mut().push(name.clone());
        Ok(())
    });
}

// ---------------------------------------------------------------------------
// Declaration
// ---------------------------------------------------------------------------

#[test]
fn five_quarantined_scripts_share_one_realm() {
    let (mut agent, host, quarantiner) = setup();
    let realms: Rc<RefCell<Vec<RealmId>>> = Rc::new(RefCell::new(Vec::new()));
    for i in 0..5u64 {
        let sink = Rc::clone(&realms);
        host.register_body(
            &format!("/lib{i}.js"),
            i + 1,
            quarantined_script(serde_json::json!({}), move |_, scope| {
                sink.borrow_mut().push(scope.realm);
                Ok(())
            }),
        );
    }
    for i in 0..5 {
        host.run_host_script(&mut agent, &format!("/lib{i}.js"));
    }
    agent.run_until_idle();

    assert_eq!(host.realm_creation_count(), 1);
    assert_eq!(agent.events().count("sandbox_declared"), 1);
    let realms = realms.borrow();
    assert_eq!(realms.len(), 5);
    assert!(realms.iter().all(|r| *r == realms[0]));
    assert_ne!(realms[0], agent.host_realm());
    assert_eq!(quarantiner.repository().sandbox_names(), ["default"]);
}

// ---------------------------------------------------------------------------
// Sequencing
// ---------------------------------------------------------------------------

#[test]
fn scripts_run_in_enqueue_order_regardless_of_latency() {
    let (mut agent, host, quarantiner) = setup();
    let log = Rc::new(RefCell::new(Vec::new()));
    recording_script(&host, "/a.js", 30, &log);
    recording_script(&host, "/b.js", 1, &log);
    recording_script(&host, "/c.js", 12, &log);

    let repository = quarantiner.repository();
    for locator in ["/a.js", "/b.js", "/c.js"] {
        repository.sandbox_script(&mut agent, "ads", locator).unwrap();
    }
    agent.run_until_idle();

    assert_eq!(log.borrow().as_slice(), ["/a.js", "/b.js", "/c.js"]);
    let executions = host.executions();
    let times: Vec<u64> = executions.iter().map(|e| e.virtual_time_ms).collect();
    // Realm ready at 10, then each script waits for its predecessor.
    assert_eq!(times, [40, 41, 53]);
}

#[test]
fn failing_scripts_do_not_block_their_successors() {
    let (mut agent, host, quarantiner) = setup();
    let log = Rc::new(RefCell::new(Vec::new()));
    recording_script(&host, "/first.js", 2, &log);
    host.register_script("/throws.js", 2, |_, _| {
        Err(quarantiner::ObjectError::thrown("Error", "payload exploded"))
    });
    recording_script(&host, "/last.js", 2, &log);

    let repository = quarantiner.repository();
    let first = repository.sandbox_script(&mut agent, "ads", "/first.js").unwrap();
    let missing = repository.sandbox_script(&mut agent, "ads", "/missing.js").unwrap();
    let throws = repository.sandbox_script(&mut agent, "ads", "/throws.js").unwrap();
    let last = repository.sandbox_script(&mut agent, "ads", "/last.js").unwrap();
    agent.run_until_idle();

    assert_eq!(log.borrow().as_slice(), ["/first.js", "/last.js"]);
    assert_eq!(
        agent.completion_state(first).unwrap(),
        &CompletionState::Fulfilled(JsValue::Undefined)
    );
    assert_eq!(
        agent.completion_state(missing).unwrap(),
        &CompletionState::Rejected(QuarantineError::ScriptLoad {
            locator: "/missing.js".to_string()
        })
    );
    match agent.completion_state(throws).unwrap() {
        CompletionState::Rejected(QuarantineError::ScriptRuntime { locator, message }) => {
            assert_eq!(locator, "/throws.js");
            assert!(message.contains("payload exploded"));
        }
        other => panic!("unexpected state {other:?}"),
    }
    assert_eq!(
        agent.completion_state(last).unwrap(),
        &CompletionState::Fulfilled(JsValue::Undefined)
    );
    assert_eq!(agent.events().count("script_failed"), 2);
    assert_eq!(agent.events().count("script_loaded"), 2);
}

#[test]
fn sandboxes_sequence_independently() {
    let (mut agent, host, quarantiner) = setup();
    let log = Rc::new(RefCell::new(Vec::new()));
    recording_script(&host, "/slow.js", 100, &log);
    recording_script(&host, "/fast.js", 1, &log);

    let repository = quarantiner.repository();
    repository.sandbox_script(&mut agent, "ads", "/slow.js").unwrap();
    repository.sandbox_script(&mut agent, "metrics", "/fast.js").unwrap();
    agent.run_until_idle();

    assert_eq!(log.borrow().as_slice(), ["/fast.js", "/slow.js"]);
    assert_eq!(host.realm_creation_count(), 2);
}

// ---------------------------------------------------------------------------
// Readiness
// ---------------------------------------------------------------------------

#[test]
fn get_sandbox_resolves_after_enqueued_scripts_and_exposes_globals() {
    let (mut agent, host, quarantiner) = setup();
    host.register_body(
        "/lib.js",
        5,
        quarantined_script(serde_json::json!({"sandbox": "ads"}), |agent, scope| {
            let window = scope.window.as_object().unwrap();
            agent.set_named(window, "myResult", JsValue::from("from the sandbox"))?;
            Ok(())
        }),
    );
    host.run_host_script(&mut agent, "/lib.js");
    agent.run_until_idle();

    let future = quarantiner.get_sandbox(&mut agent, "ads").unwrap();
    agent.run_until_idle();
    let sandbox = future.sandbox(&agent).unwrap().unwrap();
    assert_eq!(sandbox.get_name(), "ads");
    assert_eq!(
        sandbox.get_global(&mut agent, "myResult").unwrap(),
        JsValue::from("from the sandbox")
    );
    // The host global is untouched.
    let host_global = agent.realm(agent.host_realm()).unwrap().global;
    assert_eq!(agent.get_named(host_global, "myResult").unwrap(), JsValue::Undefined);
}

#[test]
fn script_visible_get_sandbox_fulfils_with_a_sandbox_object() {
    let (mut agent, host, _) = setup();
    host.register_body(
        "/lib.js",
        5,
        quarantined_script(serde_json::json!({}), |agent, scope| {
            let window = scope.window.as_object().unwrap();
            agent.set_named(window, "answer", JsValue::Int(42))?;
            Ok(())
        }),
    );
    host.run_host_script(&mut agent, "/lib.js");
    agent.run_until_idle();

    let host_global = agent.realm(agent.host_realm()).unwrap().global;
    let api = agent.get_named(host_global, "quarantiner").unwrap();
    let result = agent.call_method(&api, "getSandbox", vec![]).unwrap();
    let completion = agent.completion_of(&result).unwrap();
    agent.run_until_idle();

    let CompletionState::Fulfilled(object) = agent.completion_state(completion).unwrap().clone() else {
        panic!("getSandbox did not fulfil");
    };
    assert_eq!(agent.call_method(&object, "getName", vec![]).unwrap(), JsValue::from("default"));
    assert_eq!(
        agent
            .call_method(&object, "getGlobal", vec![JsValue::from("answer")])
            .unwrap(),
        JsValue::Int(42)
    );
}

#[test]
fn undeclared_sandbox_is_an_error() {
    let (mut agent, _, quarantiner) = setup();
    let err = quarantiner.get_sandbox(&mut agent, "nowhere").unwrap_err();
    assert_eq!(
        err,
        QuarantineError::RealmUnavailable {
            name: "nowhere".to_string()
        }
    );
}
