//! Shared platform objects: a small document/event model.
//!
//! Node objects are ordinary heap objects whose prototype chain reaches
//! `Node.prototype`; their tree structure, attributes, event listeners and
//! mutation observers live in the agent-owned [`DomTree`] side table keyed by
//! object handle.  Attributes are exposed the way the platform does it: as
//! accessors on prototypes, never as own properties of instances.

use std::collections::BTreeMap;

use crate::agent::{Agent, Invocation};
use crate::object_model::{
    JsValue, ObjectError, ObjectHandle, PropertyDescriptor, PropertyKey, RealmId,
};
use crate::realm::{define_class, define_getter, define_method, illegal_constructor};

/// Form-associated element names collected by `form.elements`.
const FORM_CONTROLS: &[&str] = &["INPUT", "SELECT", "TEXTAREA", "BUTTON"];

/// Element class for a tag name.
pub fn element_class(tag: &str) -> &'static str {
    match tag.to_ascii_lowercase().as_str() {
        "html" => "HTMLHtmlElement",
        "body" => "HTMLBodyElement",
        "div" => "HTMLDivElement",
        "span" => "HTMLSpanElement",
        "script" => "HTMLScriptElement",
        "form" => "HTMLFormElement",
        "input" => "HTMLInputElement",
        _ => "HTMLElement",
    }
}

// ---------------------------------------------------------------------------
// DomTree
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
struct NodeData {
    name: String,
    document: Option<ObjectHandle>,
    parent: Option<ObjectHandle>,
    children: Vec<ObjectHandle>,
    attributes: BTreeMap<String, String>,
    child_nodes: Option<ObjectHandle>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listener {
    pub event_type: String,
    pub callback: JsValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ObserveOptions {
    child_list: bool,
    attributes: bool,
    subtree: bool,
}

#[derive(Debug, Clone)]
struct ObserverData {
    callback: JsValue,
    targets: Vec<(ObjectHandle, ObserveOptions)>,
    pending: Vec<ObjectHandle>,
    scheduled: bool,
}

/// A change observed on a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    ChildList {
        added: Vec<ObjectHandle>,
        removed: Vec<ObjectHandle>,
    },
    Attribute {
        name: String,
    },
}

/// Tree structure, listeners and observers for every node in every realm.
#[derive(Debug, Clone, Default)]
pub struct DomTree {
    nodes: BTreeMap<ObjectHandle, NodeData>,
    listeners: BTreeMap<ObjectHandle, Vec<Listener>>,
    observers: BTreeMap<ObjectHandle, ObserverData>,
}

impl DomTree {
    pub fn is_node(&self, handle: ObjectHandle) -> bool {
        self.nodes.contains_key(&handle)
    }

    pub fn node_name(&self, handle: ObjectHandle) -> Option<&str> {
        self.nodes.get(&handle).map(|n| n.name.as_str())
    }

    pub fn parent_of(&self, handle: ObjectHandle) -> Option<ObjectHandle> {
        self.nodes.get(&handle).and_then(|n| n.parent)
    }

    pub fn children_of(&self, handle: ObjectHandle) -> &[ObjectHandle] {
        self.nodes
            .get(&handle)
            .map_or(&[][..], |n| n.children.as_slice())
    }

    pub fn owner_document(&self, handle: ObjectHandle) -> Option<ObjectHandle> {
        self.nodes.get(&handle).and_then(|n| n.document)
    }

    pub fn attribute(&self, handle: ObjectHandle, name: &str) -> Option<&str> {
        self.nodes
            .get(&handle)
            .and_then(|n| n.attributes.get(name))
            .map(String::as_str)
    }

    pub fn listener_count(&self, target: ObjectHandle) -> usize {
        self.listeners.get(&target).map_or(0, Vec::len)
    }

    pub fn is_observer(&self, handle: ObjectHandle) -> bool {
        self.observers.contains_key(&handle)
    }

    /// Descendants of `root` in tree order (excluding `root`).
    pub fn descendants(&self, root: ObjectHandle) -> Vec<ObjectHandle> {
        let mut out = Vec::new();
        let mut stack: Vec<ObjectHandle> = self.children_of(root).iter().rev().copied().collect();
        while let Some(node) = stack.pop() {
            out.push(node);
            stack.extend(self.children_of(node).iter().rev().copied());
        }
        out
    }

    fn is_inclusive_ancestor(&self, ancestor: ObjectHandle, node: ObjectHandle) -> bool {
        let mut current = Some(node);
        while let Some(h) = current {
            if h == ancestor {
                return true;
            }
            current = self.parent_of(h);
        }
        false
    }

    fn register_node(&mut self, handle: ObjectHandle, name: &str, document: Option<ObjectHandle>) {
        self.nodes.insert(
            handle,
            NodeData {
                name: name.to_string(),
                document,
                ..NodeData::default()
            },
        );
    }

    fn detach(&mut self, child: ObjectHandle) -> Option<ObjectHandle> {
        let parent = self.nodes.get_mut(&child)?.parent.take()?;
        if let Some(data) = self.nodes.get_mut(&parent) {
            data.children.retain(|c| *c != child);
        }
        Some(parent)
    }

    fn attach(&mut self, parent: ObjectHandle, child: ObjectHandle) {
        if let Some(data) = self.nodes.get_mut(&child) {
            data.parent = Some(parent);
        }
        if let Some(data) = self.nodes.get_mut(&parent) {
            data.children.push(child);
        }
    }

    fn add_listener(&mut self, target: ObjectHandle, listener: Listener) {
        let list = self.listeners.entry(target).or_default();
        if !list.contains(&listener) {
            list.push(listener);
        }
    }

    fn remove_listener(&mut self, target: ObjectHandle, listener: &Listener) {
        if let Some(list) = self.listeners.get_mut(&target) {
            list.retain(|l| l != listener);
        }
    }

    fn callbacks_for(&self, target: ObjectHandle, event_type: &str) -> Vec<JsValue> {
        self.listeners
            .get(&target)
            .map(|list| {
                list.iter()
                    .filter(|l| l.event_type == event_type)
                    .map(|l| l.callback.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Observers interested in `mutation` on `target`.
    fn observers_for(&self, target: ObjectHandle, mutation: &Mutation) -> Vec<ObjectHandle> {
        self.observers
            .iter()
            .filter(|(_, data)| {
                data.targets.iter().any(|(observed, options)| {
                    let wants = match mutation {
                        Mutation::ChildList { .. } => options.child_list,
                        Mutation::Attribute { .. } => options.attributes,
                    };
                    let reaches = *observed == target
                        || (options.subtree && self.is_inclusive_ancestor(*observed, target));
                    wants && reaches
                })
            })
            .map(|(observer, _)| *observer)
            .collect()
    }

    /// Queue `record` for `observer`; true when a delivery must be scheduled.
    fn push_record(&mut self, observer: ObjectHandle, record: ObjectHandle) -> bool {
        let Some(data) = self.observers.get_mut(&observer) else {
            return false;
        };
        data.pending.push(record);
        !std::mem::replace(&mut data.scheduled, true)
    }

    fn take_records(&mut self, observer: ObjectHandle) -> Option<(JsValue, Vec<ObjectHandle>)> {
        let data = self.observers.get_mut(&observer)?;
        data.scheduled = false;
        Some((data.callback.clone(), std::mem::take(&mut data.pending)))
    }

    /// Drop all bookkeeping for a freed object.
    pub fn forget(&mut self, handle: ObjectHandle) {
        self.detach(handle);
        if let Some(data) = self.nodes.remove(&handle) {
            for child in data.children {
                if let Some(c) = self.nodes.get_mut(&child) {
                    c.parent = None;
                }
            }
        }
        self.listeners.remove(&handle);
        self.observers.remove(&handle);
        for data in self.observers.values_mut() {
            data.targets.retain(|(target, _)| *target != handle);
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn node_this(agent: &Agent, inv: &Invocation, method: &str) -> Result<ObjectHandle, ObjectError> {
    let this = inv.this_object(method)?;
    if !agent.dom.is_node(this) {
        return Err(ObjectError::TypeError(format!(
            "'{method}' called on an object that does not implement interface Node."
        )));
    }
    Ok(this)
}

fn node_argument(agent: &Agent, value: &JsValue, method: &str) -> Result<ObjectHandle, ObjectError> {
    match value.as_object() {
        Some(h) if agent.dom.is_node(h) => Ok(h),
        _ => Err(ObjectError::TypeError(format!(
            "Failed to execute '{method}' on 'Node': parameter 1 is not of type 'Node'."
        ))),
    }
}

/// Create an element owned by `document`.
pub fn create_element(
    agent: &mut Agent,
    document: ObjectHandle,
    tag: &str,
) -> Result<ObjectHandle, ObjectError> {
    let realm = agent.realm_of(document)?;
    let element = agent.create_instance(realm, element_class(tag))?;
    agent
        .dom
        .register_node(element, &tag.to_ascii_uppercase(), Some(document));
    Ok(element)
}

/// Create an array-like collection of `nodes` as an instance of `class`.
fn create_collection(
    agent: &mut Agent,
    realm: RealmId,
    class: &str,
    nodes: &[ObjectHandle],
) -> Result<ObjectHandle, ObjectError> {
    let collection = agent.create_instance(realm, class)?;
    fill_collection(agent, collection, nodes)?;
    Ok(collection)
}

fn fill_collection(
    agent: &mut Agent,
    collection: ObjectHandle,
    nodes: &[ObjectHandle],
) -> Result<(), ObjectError> {
    agent.heap.get_mut(collection)?.properties.clear();
    for (index, node) in nodes.iter().enumerate() {
        agent.define_property(
            collection,
            PropertyKey::from(index),
            PropertyDescriptor::Data {
                value: JsValue::Object(*node),
                writable: false,
                enumerable: true,
                configurable: true,
            },
        )?;
    }
    agent.define_property(
        collection,
        PropertyKey::from("length"),
        PropertyDescriptor::Data {
            value: JsValue::Int(nodes.len() as i64),
            writable: false,
            enumerable: false,
            configurable: true,
        },
    )?;
    Ok(())
}

/// Build a `NodeList` of `nodes` in `realm`.
pub fn create_node_list(
    agent: &mut Agent,
    realm: RealmId,
    nodes: &[ObjectHandle],
) -> Result<ObjectHandle, ObjectError> {
    create_collection(agent, realm, "NodeList", nodes)
}

/// The node's `childNodes` list: one object per node, refreshed on access.
fn live_child_nodes(agent: &mut Agent, node: ObjectHandle) -> Result<ObjectHandle, ObjectError> {
    let children = agent.dom.children_of(node).to_vec();
    let cached = agent
        .dom
        .nodes
        .get(&node)
        .and_then(|n| n.child_nodes)
        .filter(|h| agent.heap.is_live(*h));
    let list = match cached {
        Some(list) => {
            fill_collection(agent, list, &children)?;
            list
        }
        None => {
            let realm = agent.realm_of(node)?;
            let list = create_node_list(agent, realm, &children)?;
            if let Some(data) = agent.dom.nodes.get_mut(&node) {
                data.child_nodes = Some(list);
            }
            list
        }
    };
    Ok(list)
}

fn find_child_named(agent: &Agent, parent: ObjectHandle, name: &str) -> Option<ObjectHandle> {
    agent
        .dom
        .children_of(parent)
        .iter()
        .copied()
        .find(|c| agent.dom.node_name(*c) == Some(name))
}

fn document_body(agent: &Agent, document: ObjectHandle) -> Option<ObjectHandle> {
    let html = find_child_named(agent, document, "HTML")?;
    find_child_named(agent, html, "BODY")
}

fn element_id(agent: &Agent, node: ObjectHandle) -> Option<String> {
    let own = agent
        .heap
        .get(node)
        .ok()?
        .get_own_property(&PropertyKey::from("id"))
        .and_then(|d| d.value().and_then(JsValue::as_str).map(str::to_string));
    own.or_else(|| agent.dom.attribute(node, "id").map(str::to_string))
}

fn matches_selector(agent: &Agent, node: ObjectHandle, selector: &str) -> bool {
    let selector = selector.trim();
    if let Some(id) = selector.strip_prefix('#') {
        return element_id(agent, node).as_deref() == Some(id);
    }
    selector == "*"
        || agent
            .dom
            .node_name(node)
            .is_some_and(|name| name.eq_ignore_ascii_case(selector))
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Dispatch `event` at `target`, bubbling through ancestors, the document
/// and its window.  Listener failures are logged and do not stop dispatch.
pub fn dispatch_event(
    agent: &mut Agent,
    target: ObjectHandle,
    event: ObjectHandle,
) -> Result<(), ObjectError> {
    let event_type = agent.get_named(event, "type")?;
    let event_type = agent.to_display_string(&event_type);

    let mut path = vec![target];
    let mut current = agent.dom.parent_of(target);
    while let Some(node) = current {
        path.push(node);
        current = agent.dom.parent_of(node);
    }
    if let Some(&top) = path.last()
        && agent.dom.node_name(top) == Some("#document")
    {
        let realm = agent.realm_of(top)?;
        path.push(agent.realm(realm)?.global);
    }

    agent.define_property(
        event,
        PropertyKey::from("target"),
        PropertyDescriptor::data(JsValue::Object(target)),
    )?;
    for node in path {
        agent.define_property(
            event,
            PropertyKey::from("currentTarget"),
            PropertyDescriptor::data(JsValue::Object(node)),
        )?;
        for callback in agent.dom.callbacks_for(node, &event_type) {
            if let Err(err) = agent.call(&callback, JsValue::Object(node), vec![JsValue::Object(event)]) {
                agent.record_event("", "dom", "listener_failed", "error", Some(err.error_code()));
            }
        }
    }
    Ok(())
}

fn listener_from(agent: &Agent, inv: &Invocation) -> Option<Listener> {
    let callback = inv.arg(1);
    if !agent.is_callable(&callback) {
        return None;
    }
    Some(Listener {
        event_type: agent.to_display_string(&inv.arg(0)),
        callback,
    })
}

// ---------------------------------------------------------------------------
// Mutation observers
// ---------------------------------------------------------------------------

/// Record `mutation` on `target` for every interested observer and schedule
/// delivery as a microtask.
pub fn notify_mutation(
    agent: &mut Agent,
    target: ObjectHandle,
    mutation: Mutation,
) -> Result<(), ObjectError> {
    for observer in agent.dom.observers_for(target, &mutation) {
        let realm = agent.realm_of(observer)?;
        let record = agent.create_instance(realm, "MutationRecord")?;
        let (kind, added, removed, attribute) = match &mutation {
            Mutation::ChildList { added, removed } => {
                ("childList", added.as_slice(), removed.as_slice(), JsValue::Null)
            }
            Mutation::Attribute { name } => {
                ("attributes", &[][..], &[][..], JsValue::Str(name.clone()))
            }
        };
        let added = create_node_list(agent, realm, added)?;
        let removed = create_node_list(agent, realm, removed)?;
        let fields = [
            ("type", JsValue::from(kind)),
            ("target", JsValue::Object(target)),
            ("addedNodes", JsValue::Object(added)),
            ("removedNodes", JsValue::Object(removed)),
            ("attributeName", attribute),
        ];
        for (name, value) in fields {
            agent.define_property(
                record,
                PropertyKey::from(name),
                PropertyDescriptor::Data {
                    value,
                    writable: false,
                    enumerable: true,
                    configurable: true,
                },
            )?;
        }
        if agent.dom.push_record(observer, record) {
            agent
                .event_loop
                .queue_microtask(Box::new(move |agent| deliver_records(agent, observer)));
        }
    }
    Ok(())
}

fn deliver_records(agent: &mut Agent, observer: ObjectHandle) -> Result<(), ObjectError> {
    let Some((callback, records)) = agent.dom.take_records(observer) else {
        return Ok(());
    };
    if records.is_empty() {
        return Ok(());
    }
    let realm = agent.realm_of(observer)?;
    let list = agent.create_array(realm, records.into_iter().map(JsValue::Object).collect())?;
    agent.call(
        &callback,
        JsValue::Object(observer),
        vec![JsValue::Object(list), JsValue::Object(observer)],
    )?;
    Ok(())
}

fn observe_options(agent: &mut Agent, value: &JsValue) -> Result<ObserveOptions, ObjectError> {
    let mut flag = |name: &str| -> Result<bool, ObjectError> {
        match value {
            JsValue::Object(_) => Ok(agent.get_path(value, name)?.truthy()),
            _ => Ok(false),
        }
    };
    let options = ObserveOptions {
        child_list: flag("childList")?,
        attributes: flag("attributes")?,
        subtree: flag("subtree")?,
    };
    if !options.child_list && !options.attributes {
        return Err(ObjectError::TypeError(
            "The options object must set at least one of 'attributes' or 'childList' to true."
                .to_string(),
        ));
    }
    Ok(options)
}

// ---------------------------------------------------------------------------
// Installation
// ---------------------------------------------------------------------------

/// Install the platform classes and the realm's document.
pub(crate) fn install(agent: &mut Agent, realm: RealmId) -> Result<(), ObjectError> {
    // EventTarget
    let event_target = define_class(agent, realm, "EventTarget", None, false, illegal_constructor)?;
    define_method(agent, realm, event_target.prototype, "addEventListener", |agent, inv| {
        let this = inv.this_object("addEventListener")?;
        if let Some(listener) = listener_from(agent, &inv) {
            agent.dom.add_listener(this, listener);
        }
        Ok(JsValue::Undefined)
    })?;
    define_method(agent, realm, event_target.prototype, "removeEventListener", |agent, inv| {
        let this = inv.this_object("removeEventListener")?;
        if let Some(listener) = listener_from(agent, &inv) {
            agent.dom.remove_listener(this, &listener);
        }
        Ok(JsValue::Undefined)
    })?;
    define_method(agent, realm, event_target.prototype, "dispatchEvent", |agent, inv| {
        let this = inv.this_object("dispatchEvent")?;
        let event = inv.arg(0).as_object().ok_or_else(|| {
            ObjectError::TypeError("parameter 1 is not of type 'Event'.".to_string())
        })?;
        dispatch_event(agent, this, event)?;
        Ok(JsValue::Bool(true))
    })?;

    // Event
    define_class(agent, realm, "Event", None, true, |agent, inv| {
        if inv.new_target.is_none() {
            return Err(ObjectError::TypeError(
                "Failed to construct 'Event': Please use the 'new' operator".to_string(),
            ));
        }
        let this = inv.this_object("Event")?;
        let event_type = agent.to_display_string(&inv.arg(0));
        agent.define_property(this, PropertyKey::from("type"), PropertyDescriptor::data(JsValue::Str(event_type)))?;
        agent.define_property(this, PropertyKey::from("target"), PropertyDescriptor::data(JsValue::Null))?;
        agent.define_property(this, PropertyKey::from("currentTarget"), PropertyDescriptor::data(JsValue::Null))?;
        Ok(JsValue::Undefined)
    })?;

    // Node
    let node = define_class(agent, realm, "Node", Some(event_target.prototype), false, illegal_constructor)?;
    define_method(agent, realm, node.prototype, "appendChild", |agent, inv| {
        let parent = node_this(agent, &inv, "appendChild")?;
        let child = node_argument(agent, &inv.arg(0), "appendChild")?;
        if agent.dom.is_inclusive_ancestor(child, parent) {
            return Err(ObjectError::TypeError(
                "Failed to execute 'appendChild' on 'Node': The new child element contains the parent."
                    .to_string(),
            ));
        }
        if let Some(previous) = agent.dom.detach(child) {
            notify_mutation(
                agent,
                previous,
                Mutation::ChildList {
                    added: vec![],
                    removed: vec![child],
                },
            )?;
        }
        agent.dom.attach(parent, child);
        notify_mutation(
            agent,
            parent,
            Mutation::ChildList {
                added: vec![child],
                removed: vec![],
            },
        )?;
        Ok(JsValue::Object(child))
    })?;
    define_method(agent, realm, node.prototype, "removeChild", |agent, inv| {
        let parent = node_this(agent, &inv, "removeChild")?;
        let child = node_argument(agent, &inv.arg(0), "removeChild")?;
        if agent.dom.parent_of(child) != Some(parent) {
            return Err(ObjectError::TypeError(
                "Failed to execute 'removeChild' on 'Node': The node to be removed is not a child of this node."
                    .to_string(),
            ));
        }
        agent.dom.detach(child);
        notify_mutation(
            agent,
            parent,
            Mutation::ChildList {
                added: vec![],
                removed: vec![child],
            },
        )?;
        Ok(JsValue::Object(child))
    })?;
    define_getter(agent, realm, node.prototype, "nodeName", |agent, inv| {
        let this = node_this(agent, &inv, "nodeName")?;
        Ok(agent.dom.node_name(this).map_or(JsValue::Null, JsValue::from))
    })?;
    define_getter(agent, realm, node.prototype, "parentNode", |agent, inv| {
        let this = node_this(agent, &inv, "parentNode")?;
        Ok(agent.dom.parent_of(this).map_or(JsValue::Null, JsValue::Object))
    })?;
    define_getter(agent, realm, node.prototype, "ownerDocument", |agent, inv| {
        let this = node_this(agent, &inv, "ownerDocument")?;
        Ok(agent.dom.owner_document(this).map_or(JsValue::Null, JsValue::Object))
    })?;
    define_getter(agent, realm, node.prototype, "childNodes", |agent, inv| {
        let this = node_this(agent, &inv, "childNodes")?;
        Ok(JsValue::Object(live_child_nodes(agent, this)?))
    })?;

    // Element
    let element = define_class(agent, realm, "Element", Some(node.prototype), false, illegal_constructor)?;
    define_getter(agent, realm, element.prototype, "tagName", |agent, inv| {
        let this = node_this(agent, &inv, "tagName")?;
        Ok(agent.dom.node_name(this).map_or(JsValue::Null, JsValue::from))
    })?;
    define_getter(agent, realm, element.prototype, "children", |agent, inv| {
        let this = node_this(agent, &inv, "children")?;
        let realm = agent.realm_of(this)?;
        let children = agent.dom.children_of(this).to_vec();
        Ok(JsValue::Object(create_collection(agent, realm, "HTMLCollection", &children)?))
    })?;
    define_method(agent, realm, element.prototype, "setAttribute", |agent, inv| {
        let this = node_this(agent, &inv, "setAttribute")?;
        let name = agent.to_display_string(&inv.arg(0)).to_ascii_lowercase();
        let value = agent.to_display_string(&inv.arg(1));
        if let Some(data) = agent.dom.nodes.get_mut(&this) {
            data.attributes.insert(name.clone(), value);
        }
        notify_mutation(agent, this, Mutation::Attribute { name })?;
        Ok(JsValue::Undefined)
    })?;
    define_method(agent, realm, element.prototype, "getAttribute", |agent, inv| {
        let this = node_this(agent, &inv, "getAttribute")?;
        let name = agent.to_display_string(&inv.arg(0)).to_ascii_lowercase();
        Ok(agent.dom.attribute(this, &name).map_or(JsValue::Null, JsValue::from))
    })?;
    define_method(agent, realm, element.prototype, "querySelectorAll", query_selector_all)?;

    // HTML elements
    let html_element = define_class(agent, realm, "HTMLElement", Some(element.prototype), false, illegal_constructor)?;
    define_method(agent, realm, html_element.prototype, "click", |agent, inv| {
        let this = node_this(agent, &inv, "click")?;
        let realm = agent.realm_of(this)?;
        let event = agent.create_instance(realm, "Event")?;
        agent.define_property(event, PropertyKey::from("type"), PropertyDescriptor::data(JsValue::from("click")))?;
        dispatch_event(agent, this, event)?;
        Ok(JsValue::Undefined)
    })?;
    for class in [
        "HTMLHtmlElement",
        "HTMLBodyElement",
        "HTMLDivElement",
        "HTMLSpanElement",
        "HTMLScriptElement",
        "HTMLInputElement",
    ] {
        define_class(agent, realm, class, Some(html_element.prototype), false, illegal_constructor)?;
    }
    let form = define_class(agent, realm, "HTMLFormElement", Some(html_element.prototype), false, illegal_constructor)?;
    define_getter(agent, realm, form.prototype, "elements", |agent, inv| {
        let this = node_this(agent, &inv, "elements")?;
        let realm = agent.realm_of(this)?;
        let controls: Vec<ObjectHandle> = agent
            .dom
            .descendants(this)
            .into_iter()
            .filter(|n| agent.dom.node_name(*n).is_some_and(|name| FORM_CONTROLS.contains(&name)))
            .collect();
        Ok(JsValue::Object(create_collection(agent, realm, "HTMLFormControlsCollection", &controls)?))
    })?;

    // Document
    let document_class = define_class(agent, realm, "Document", Some(node.prototype), false, illegal_constructor)?;
    define_method(agent, realm, document_class.prototype, "createElement", |agent, inv| {
        let this = node_this(agent, &inv, "createElement")?;
        let tag = agent.to_display_string(&inv.arg(0));
        Ok(JsValue::Object(create_element(agent, this, &tag)?))
    })?;
    define_method(agent, realm, document_class.prototype, "getElementById", |agent, inv| {
        let this = node_this(agent, &inv, "getElementById")?;
        let id = agent.to_display_string(&inv.arg(0));
        let found = agent
            .dom
            .descendants(this)
            .into_iter()
            .find(|n| element_id(agent, *n).as_deref() == Some(id.as_str()));
        Ok(found.map_or(JsValue::Null, JsValue::Object))
    })?;
    define_method(agent, realm, document_class.prototype, "querySelectorAll", query_selector_all)?;
    define_getter(agent, realm, document_class.prototype, "documentElement", |agent, inv| {
        let this = node_this(agent, &inv, "documentElement")?;
        Ok(find_child_named(agent, this, "HTML").map_or(JsValue::Null, JsValue::Object))
    })?;
    define_getter(agent, realm, document_class.prototype, "body", |agent, inv| {
        let this = node_this(agent, &inv, "body")?;
        Ok(document_body(agent, this).map_or(JsValue::Null, JsValue::Object))
    })?;
    define_getter(agent, realm, document_class.prototype, "defaultView", |agent, inv| {
        let this = node_this(agent, &inv, "defaultView")?;
        let realm = agent.realm_of(this)?;
        Ok(JsValue::Object(agent.realm(realm)?.global))
    })?;
    define_getter(agent, realm, document_class.prototype, "all", |agent, inv| {
        let this = node_this(agent, &inv, "all")?;
        let realm = agent.realm_of(this)?;
        let all = agent.dom.descendants(this);
        Ok(JsValue::Object(create_collection(agent, realm, "HTMLAllCollection", &all)?))
    })?;

    // Window
    define_class(agent, realm, "Window", Some(event_target.prototype), false, illegal_constructor)?;

    // Collections
    let node_list = define_class(agent, realm, "NodeList", None, false, illegal_constructor)?;
    define_method(agent, realm, node_list.prototype, "item", collection_item)?;
    define_method(agent, realm, node_list.prototype, "forEach", |agent, inv| {
        let callback = inv.arg(0);
        for (index, node) in agent.list_elements(&inv.this)?.into_iter().enumerate() {
            agent.call(
                &callback,
                JsValue::Undefined,
                vec![node, JsValue::Int(index as i64), inv.this.clone()],
            )?;
        }
        Ok(JsValue::Undefined)
    })?;
    let html_collection = define_class(agent, realm, "HTMLCollection", None, false, illegal_constructor)?;
    define_method(agent, realm, html_collection.prototype, "item", collection_item)?;
    define_class(
        agent,
        realm,
        "HTMLFormControlsCollection",
        Some(html_collection.prototype),
        false,
        illegal_constructor,
    )?;
    let all_collection = define_class(agent, realm, "HTMLAllCollection", None, false, illegal_constructor)?;
    define_method(agent, realm, all_collection.prototype, "item", collection_item)?;

    // MutationObserver
    let observer = define_class(agent, realm, "MutationObserver", None, true, |agent, inv| {
        if inv.new_target.is_none() {
            return Err(ObjectError::TypeError(
                "Failed to construct 'MutationObserver': Please use the 'new' operator".to_string(),
            ));
        }
        let this = inv.this_object("MutationObserver")?;
        let callback = inv.arg(0);
        if !agent.is_callable(&callback) {
            return Err(ObjectError::TypeError(
                "Failed to construct 'MutationObserver': parameter 1 is not of type 'MutationCallback'."
                    .to_string(),
            ));
        }
        agent.dom.observers.insert(
            this,
            ObserverData {
                callback,
                targets: Vec::new(),
                pending: Vec::new(),
                scheduled: false,
            },
        );
        Ok(JsValue::Undefined)
    })?;
    define_method(agent, realm, observer.prototype, "observe", |agent, inv| {
        let this = inv.this_object("observe")?;
        if !agent.dom.is_observer(this) {
            return Err(ObjectError::TypeError("Illegal invocation".to_string()));
        }
        let target = node_argument(agent, &inv.arg(0), "observe")?;
        let options = observe_options(agent, &inv.arg(1))?;
        if let Some(data) = agent.dom.observers.get_mut(&this) {
            data.targets.retain(|(t, _)| *t != target);
            data.targets.push((target, options));
        }
        Ok(JsValue::Undefined)
    })?;
    define_method(agent, realm, observer.prototype, "disconnect", |agent, inv| {
        let this = inv.this_object("disconnect")?;
        if let Some(data) = agent.dom.observers.get_mut(&this) {
            data.targets.clear();
            data.pending.clear();
        }
        Ok(JsValue::Undefined)
    })?;
    define_method(agent, realm, observer.prototype, "takeRecords", |agent, inv| {
        let this = inv.this_object("takeRecords")?;
        let records = agent
            .dom
            .observers
            .get_mut(&this)
            .map(|data| std::mem::take(&mut data.pending))
            .unwrap_or_default();
        let realm = agent.realm_of(this)?;
        let list = agent.create_array(realm, records.into_iter().map(JsValue::Object).collect())?;
        Ok(JsValue::Object(list))
    })?;
    define_class(agent, realm, "MutationRecord", None, false, illegal_constructor)?;

    // The realm's document: #document > HTML > BODY.
    let document = agent.create_instance(realm, "Document")?;
    agent.dom.register_node(document, "#document", None);
    let html = create_element(agent, document, "html")?;
    let body = create_element(agent, document, "body")?;
    agent.dom.attach(document, html);
    agent.dom.attach(html, body);

    let window_proto = agent.realm(realm)?.class_prototype("Window")?;
    let global = {
        let r = agent.realm_mut(realm)?;
        r.document = document;
        r.global
    };
    agent.heap.ordinary_set_prototype_of(global, Some(window_proto))?;
    Ok(())
}

fn query_selector_all(agent: &mut Agent, inv: Invocation) -> Result<JsValue, ObjectError> {
    let this = node_this(agent, &inv, "querySelectorAll")?;
    let selector = agent.to_display_string(&inv.arg(0));
    let realm = agent.realm_of(this)?;
    let matches: Vec<ObjectHandle> = agent
        .dom
        .descendants(this)
        .into_iter()
        .filter(|n| matches_selector(agent, *n, &selector))
        .collect();
    Ok(JsValue::Object(create_node_list(agent, realm, &matches)?))
}

fn collection_item(agent: &mut Agent, inv: Invocation) -> Result<JsValue, ObjectError> {
    let index = agent.to_integer(&inv.arg(0));
    if index < 0 {
        return Ok(JsValue::Null);
    }
    match agent.get_value(&inv.this, &PropertyKey::from(index as usize))? {
        JsValue::Undefined => Ok(JsValue::Null),
        found => Ok(found),
    }
}

/// Realm-level shortcut used by tests and the host harness.
pub fn document_of(agent: &Agent, realm: RealmId) -> Result<ObjectHandle, ObjectError> {
    Ok(agent.realm(realm)?.document)
}
