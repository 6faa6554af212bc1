#![forbid(unsafe_code)]

//! Cross-realm script quarantine.
//!
//! A host page loads a third-party script; the script calls
//! `quarantiner.quarantine(wrapper, config)` and is re-executed inside an
//! isolated realm with its own globals and standard constructors.  Shared
//! platform objects (the document tree, event targets, collections, native
//! functions) stay single instances: the isolated realm reaches them through
//! identity-preserving interception wrappers built by the [`bridge`].
//!
//! Everything runs on one [`agent::Agent`]: a shared object heap, a set of
//! realms and a cooperative event loop on a virtual clock.

pub mod agent;
pub mod bridge;
pub mod capability;
pub mod completion;
pub mod config;
pub mod dom;
pub mod entrypoint;
pub mod error;
pub mod events;
pub mod host;
pub mod initializer;
pub mod interception;
pub mod object_model;
pub mod proxy_record;
pub mod realm;
pub mod repository;
pub mod sandbox;
pub mod sequencer;

pub use agent::{Agent, Invocation};
pub use bridge::{BridgeId, IdentityBridge};
pub use completion::{CompletionHandle, CompletionState};
pub use config::{BridgePolicy, GlobalDeclaration, GlobalKind, QuarantineConfig};
pub use entrypoint::{Quarantiner, SandboxFuture, ScopeRefs, quarantined_script};
pub use error::QuarantineError;
pub use host::{HostPlatform, SimulatedHost};
pub use object_model::{JsValue, ObjectError, ObjectHandle, PropertyDescriptor, PropertyKey, RealmId};
pub use realm::RealmKind;
pub use repository::SandboxRepository;
pub use sandbox::{Sandbox, SandboxDeclaration};
