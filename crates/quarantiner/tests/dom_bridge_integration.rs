#![forbid(unsafe_code)]
//! Platform objects shared across the boundary: event listeners, mutation
//! observers, live collections and identity of DOM nodes as seen from a
//! quarantined script.

use std::cell::RefCell;
use std::rc::Rc;

use quarantiner::{
    Agent, BridgePolicy, JsValue, ObjectError, Quarantiner, ScopeRefs, SimulatedHost,
    quarantined_script,
};

type Slot = Rc<RefCell<Option<JsValue>>>;

fn slot() -> Slot {
    Rc::new(RefCell::new(None))
}

fn take(slot: &Slot) -> JsValue {
    slot.borrow().clone().unwrap_or(JsValue::Undefined)
}

/// Run `body` as the wrapper function of a quarantined script loaded into
/// the default sandbox, and drain the event loop.
fn run_quarantined(
    body: impl Fn(&mut Agent, &ScopeRefs) -> Result<(), ObjectError> + 'static,
) -> (Agent, Rc<SimulatedHost>) {
    let host = Rc::new(SimulatedHost::new());
    let quarantiner = Quarantiner::new(host.clone(), BridgePolicy::default());
    let mut agent = Agent::new();
    quarantiner.install_global(&mut agent).unwrap();
    host.register_body("/payload.js", 1, quarantined_script(serde_json::json!({}), body));
    host.run_host_script(&mut agent, "/payload.js");
    agent.run_until_idle();
    (agent, host)
}

fn host_document(agent: &Agent) -> JsValue {
    JsValue::Object(agent.realm(agent.host_realm()).unwrap().document)
}

fn host_element(agent: &mut Agent, id: &str) -> JsValue {
    let document = host_document(agent);
    agent
        .call_method(&document, "getElementById", vec![JsValue::from(id)])
        .unwrap()
}

/// `window.document.body` from inside the sandbox.
fn isolated_body(agent: &mut Agent, scope: &ScopeRefs) -> Result<JsValue, ObjectError> {
    let document = agent.get_path(&scope.window, "document")?;
    agent.get_path(&document, "body")
}

fn isolated_div(agent: &mut Agent, scope: &ScopeRefs, id: &str) -> Result<JsValue, ObjectError> {
    let document = agent.get_path(&scope.window, "document")?;
    let div = agent.call_method(&document, "createElement", vec![JsValue::from("div")])?;
    agent.set_named(div.as_object().unwrap(), "id", JsValue::from(id))?;
    let body = isolated_body(agent, scope)?;
    agent.call_method(&body, "appendChild", vec![div.clone()])?;
    Ok(div)
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[test]
fn listener_sees_wrapped_event_target_and_default_view() {
    let (this_seen, target_seen, view_seen, div_seen, window_seen) = (slot(), slot(), slot(), slot(), slot());
    let sinks = (
        this_seen.clone(),
        target_seen.clone(),
        view_seen.clone(),
        div_seen.clone(),
        window_seen.clone(),
    );
    let (mut agent, _) = run_quarantined(move |agent, scope| {
        let (this_sink, target_sink, view_sink, div_sink, window_sink) = sinks.clone();
        let div = isolated_div(agent, scope, "clickable")?;
        let listener = agent.create_script_function(scope.realm, "onClick", move |agent, inv| {
            let event = inv.arg(0);
            let target = agent.get_path(&event, "target")?;
            let document = agent.get_path(&target, "ownerDocument")?;
            let view = agent.get_path(&document, "defaultView")?;
            *this_sink.borrow_mut() = Some(inv.this.clone());
            *target_sink.borrow_mut() = Some(target);
            *view_sink.borrow_mut() = Some(view);
            Ok(JsValue::Undefined)
        })?;
        agent.call_method(&div, "addEventListener", vec![JsValue::from("click"), JsValue::Object(listener)])?;
        *div_sink.borrow_mut() = Some(div);
        *window_sink.borrow_mut() = Some(scope.window.clone());
        Ok(())
    });

    let div = host_element(&mut agent, "clickable");
    agent.call_method(&div, "click", vec![]).unwrap();

    let wrapped_div = take(&div_seen);
    assert_ne!(wrapped_div, div);
    assert_eq!(take(&target_seen), wrapped_div);
    assert_eq!(take(&this_seen), wrapped_div);
    assert_eq!(take(&view_seen), take(&window_seen));
    assert_eq!(agent.events().count("listener_failed"), 0);
}

#[test]
fn add_event_listener_is_one_function_across_targets() {
    let same = slot();
    let sink = same.clone();
    run_quarantined(move |agent, scope| {
        let div = isolated_div(agent, scope, "a")?;
        let document = agent.get_path(&scope.window, "document")?;
        let from_div = agent.get_path(&div, "addEventListener")?;
        let from_document = agent.get_path(&document, "addEventListener")?;
        *sink.borrow_mut() = Some(JsValue::Bool(from_div == from_document));
        Ok(())
    });
    assert_eq!(take(&same), JsValue::Bool(true));
}

#[test]
fn remove_event_listener_finds_the_same_forwarder() {
    let (mut agent, _) = run_quarantined(|agent, scope| {
        let div = isolated_div(agent, scope, "removable")?;
        let listener = agent.create_script_function(scope.realm, "onClick", |_, _| {
            Err(ObjectError::thrown("Error", "listener should have been removed"))
        })?;
        let args = vec![JsValue::from("click"), JsValue::Object(listener)];
        agent.call_method(&div, "addEventListener", args.clone())?;
        agent.call_method(&div, "removeEventListener", args)?;
        Ok(())
    });
    let div = host_element(&mut agent, "removable");
    assert_eq!(agent.dom.listener_count(div.as_object().unwrap()), 0);
    agent.call_method(&div, "click", vec![]).unwrap();
    assert_eq!(agent.events().count("listener_failed"), 0);
}

// ---------------------------------------------------------------------------
// Mutation observers
// ---------------------------------------------------------------------------

#[test]
fn mutation_records_point_at_wrapped_host_nodes() {
    let (record_target, observed_body, observer_arg, observer_seen, is_instance) =
        (slot(), slot(), slot(), slot(), slot());
    let sinks = (
        record_target.clone(),
        observed_body.clone(),
        observer_arg.clone(),
        observer_seen.clone(),
        is_instance.clone(),
    );
    let (mut agent, _) = run_quarantined(move |agent, scope| {
        let (target_sink, body_sink, arg_sink, observer_sink, instance_sink) = sinks.clone();
        let callback = agent.create_script_function(scope.realm, "onMutation", move |agent, inv| {
            let records = inv.arg(0);
            let first = agent.get_path(&records, "0")?;
            *target_sink.borrow_mut() = Some(agent.get_path(&first, "target")?);
            *arg_sink.borrow_mut() = Some(inv.arg(1));
            Ok(JsValue::Undefined)
        })?;
        let constructor = agent.get_path(&scope.window, "MutationObserver")?;
        let observer = agent.construct(&constructor, vec![JsValue::Object(callback)])?;
        let body = isolated_body(agent, scope)?;
        let options = agent.value_from_json(scope.realm, &serde_json::json!({"childList": true}))?;
        agent.call_method(&observer, "observe", vec![body.clone(), options])?;
        *instance_sink.borrow_mut() = Some(JsValue::Bool(agent.instance_of(&observer, &constructor)?));
        *observer_sink.borrow_mut() = Some(observer);
        *body_sink.borrow_mut() = Some(body);
        Ok(())
    });

    // The page mutates its own tree.
    let document = host_document(&agent);
    let span = agent
        .call_method(&document, "createElement", vec![JsValue::from("span")])
        .unwrap();
    let body = agent.get_path(&document, "body").unwrap();
    agent.call_method(&body, "appendChild", vec![span]).unwrap();
    agent.run_until_idle();

    assert_eq!(take(&is_instance), JsValue::Bool(true));
    assert_eq!(take(&record_target), take(&observed_body));
    assert_eq!(take(&observer_arg), take(&observer_seen));
}

// ---------------------------------------------------------------------------
// Collections
// ---------------------------------------------------------------------------

#[test]
fn form_elements_and_child_nodes_yield_the_same_wrappers_as_lookups() {
    let consistent = slot();
    let sink = consistent.clone();
    let host = Rc::new(SimulatedHost::new());
    let quarantiner = Quarantiner::new(host.clone(), BridgePolicy::default());
    let mut agent = Agent::new();
    quarantiner.install_global(&mut agent).unwrap();

    // <form id="signup"><input id="email"></form> in the host page.
    let document = host_document(&agent);
    let form = agent
        .call_method(&document, "createElement", vec![JsValue::from("form")])
        .unwrap();
    agent.set_named(form.as_object().unwrap(), "id", JsValue::from("signup")).unwrap();
    let input = agent
        .call_method(&document, "createElement", vec![JsValue::from("input")])
        .unwrap();
    agent.set_named(input.as_object().unwrap(), "id", JsValue::from("email")).unwrap();
    agent.call_method(&form, "appendChild", vec![input]).unwrap();
    let body = agent.get_path(&document, "body").unwrap();
    agent.call_method(&body, "appendChild", vec![form]).unwrap();

    host.register_body(
        "/payload.js",
        1,
        quarantined_script(serde_json::json!({}), move |agent, scope| {
            let document = agent.get_path(&scope.window, "document")?;
            let form = agent.call_method(&document, "getElementById", vec![JsValue::from("signup")])?;
            let input = agent.call_method(&document, "getElementById", vec![JsValue::from("email")])?;
            let elements = agent.get_path(&form, "elements")?;
            let from_elements = agent.call_method(&elements, "item", vec![JsValue::Int(0)])?;
            let children = agent.get_path(&form, "childNodes")?;
            let from_children = agent.list_elements(&children)?;
            let parent = agent.get_path(&input, "parentNode")?;
            *sink.borrow_mut() = Some(JsValue::Bool(
                from_elements == input && from_children == [input.clone()] && parent == form,
            ));
            Ok(())
        }),
    );
    host.run_host_script(&mut agent, "/payload.js");
    agent.run_until_idle();
    assert_eq!(take(&consistent), JsValue::Bool(true));
}

#[test]
fn document_all_keeps_its_undefined_typeof_through_the_wrapper() {
    let (type_seen, first_seen) = (slot(), slot());
    let sinks = (type_seen.clone(), first_seen.clone());
    run_quarantined(move |agent, scope| {
        let (type_sink, first_sink) = sinks.clone();
        let document = agent.get_path(&scope.window, "document")?;
        let all = agent.get_path(&document, "all")?;
        *type_sink.borrow_mut() = Some(JsValue::from(agent.type_of(&all)));
        let first = agent.call_method(&all, "item", vec![JsValue::Int(0)])?;
        *first_sink.borrow_mut() = Some(agent.get_path(&first, "tagName")?);
        Ok(())
    });
    assert_eq!(take(&type_seen), JsValue::from("undefined"));
    assert_eq!(take(&first_seen), JsValue::from("HTML"));
}

#[test]
fn null_and_undefined_cross_unchanged() {
    let (missing, absent) = (slot(), slot());
    let sinks = (missing.clone(), absent.clone());
    run_quarantined(move |agent, scope| {
        let (missing_sink, absent_sink) = sinks.clone();
        let document = agent.get_path(&scope.window, "document")?;
        *missing_sink.borrow_mut() =
            Some(agent.call_method(&document, "getElementById", vec![JsValue::from("nope")])?);
        *absent_sink.borrow_mut() = Some(agent.get_path(&document, "noSuchProperty")?);
        Ok(())
    });
    assert_eq!(*missing.borrow(), Some(JsValue::Null));
    assert_eq!(*absent.borrow(), Some(JsValue::Undefined));
}
