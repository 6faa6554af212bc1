//! Completion futures and the cooperative event loop.
//!
//! A completion is a settle-once cell (`Pending` → `Fulfilled` | `Rejected`).
//! Reactions registered with [`Agent::then`] always run as microtasks, never
//! synchronously inside `settle`, so a settling caller never re-enters
//! arbitrary code.  Macrotasks (script loads, realm creation, timers) are
//! ordered by virtual due time, ties broken by registration order; the
//! microtask queue is drained completely before each macrotask.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::agent::Agent;
use crate::error::QuarantineError;
use crate::object_model::{JsValue, ObjectError};

/// Handle on a completion stored in the agent's [`CompletionStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CompletionHandle(pub u32);

impl fmt::Display for CompletionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "completion#{}", self.0)
    }
}

/// Outcome of a settled completion.
pub type Settlement = Result<JsValue, QuarantineError>;

/// Unit of deferred work.  Failures are logged by the event loop driver.
pub type Task = Box<dyn FnOnce(&mut Agent) -> Result<(), ObjectError>>;

/// Reaction to a completion settling.
pub type Reaction = Box<dyn FnOnce(&mut Agent, Settlement) -> Result<(), ObjectError>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionState {
    Pending,
    Fulfilled(JsValue),
    Rejected(QuarantineError),
}

impl CompletionState {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    fn settlement(&self) -> Option<Settlement> {
        match self {
            Self::Pending => None,
            Self::Fulfilled(value) => Some(Ok(value.clone())),
            Self::Rejected(err) => Some(Err(err.clone())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionError {
    InvalidHandle(CompletionHandle),
    AlreadySettled(CompletionHandle),
}

impl fmt::Display for CompletionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidHandle(h) => write!(f, "{h} does not exist"),
            Self::AlreadySettled(h) => write!(f, "{h} is already settled"),
        }
    }
}

impl std::error::Error for CompletionError {}

impl From<CompletionError> for ObjectError {
    fn from(err: CompletionError) -> Self {
        ObjectError::TypeError(err.to_string())
    }
}

impl From<CompletionError> for QuarantineError {
    fn from(err: CompletionError) -> Self {
        QuarantineError::Object(err.into())
    }
}

// ---------------------------------------------------------------------------
// CompletionStore
// ---------------------------------------------------------------------------

struct CompletionEntry {
    state: CompletionState,
    reactions: Vec<Reaction>,
}

/// Settle-once completion cells.  Entries are never removed, so every handle
/// issued by a store stays valid for the store's lifetime.
#[derive(Default)]
pub struct CompletionStore {
    entries: Vec<CompletionEntry>,
}

impl CompletionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self) -> CompletionHandle {
        let handle = CompletionHandle(self.entries.len() as u32);
        self.entries.push(CompletionEntry {
            state: CompletionState::Pending,
            reactions: Vec::new(),
        });
        handle
    }

    pub fn state(&self, handle: CompletionHandle) -> Result<&CompletionState, CompletionError> {
        self.entries
            .get(handle.0 as usize)
            .map(|entry| &entry.state)
            .ok_or(CompletionError::InvalidHandle(handle))
    }

    pub fn is_settled(&self, handle: CompletionHandle) -> bool {
        self.state(handle).is_ok_and(|state| !state.is_pending())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn settle(
        &mut self,
        handle: CompletionHandle,
        settlement: &Settlement,
    ) -> Result<Vec<Reaction>, CompletionError> {
        let entry = self
            .entries
            .get_mut(handle.0 as usize)
            .ok_or(CompletionError::InvalidHandle(handle))?;
        if !entry.state.is_pending() {
            return Err(CompletionError::AlreadySettled(handle));
        }
        entry.state = match settlement {
            Ok(value) => CompletionState::Fulfilled(value.clone()),
            Err(err) => CompletionState::Rejected(err.clone()),
        };
        Ok(std::mem::take(&mut entry.reactions))
    }

    /// Register `reaction`; if the completion already settled, the reaction
    /// is handed back together with the settlement.
    fn subscribe(
        &mut self,
        handle: CompletionHandle,
        reaction: Reaction,
    ) -> Result<Option<(Reaction, Settlement)>, CompletionError> {
        let entry = self
            .entries
            .get_mut(handle.0 as usize)
            .ok_or(CompletionError::InvalidHandle(handle))?;
        match entry.state.settlement() {
            Some(settlement) => Ok(Some((reaction, settlement))),
            None => {
                entry.reactions.push(reaction);
                Ok(None)
            }
        }
    }
}

impl fmt::Debug for CompletionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pending = self
            .entries
            .iter()
            .filter(|e| e.state.is_pending())
            .count();
        f.debug_struct("CompletionStore")
            .field("entries", &self.entries.len())
            .field("pending", &pending)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// EventLoop
// ---------------------------------------------------------------------------

/// Deterministic millisecond clock advanced only by the event loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualClock {
    now_ms: u64,
}

impl VirtualClock {
    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    fn advance_to(&mut self, ms: u64) {
        self.now_ms = self.now_ms.max(ms);
    }
}

#[derive(Default)]
pub struct EventLoop {
    clock: VirtualClock,
    microtasks: VecDeque<Task>,
    macrotasks: BTreeMap<(u64, u64), Task>,
    next_seq: u64,
}

impl EventLoop {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub fn queue_microtask(&mut self, task: Task) {
        self.microtasks.push_back(task);
    }

    /// Schedule `task` to run `delay_ms` after the current virtual time.
    pub fn schedule(&mut self, delay_ms: u64, task: Task) {
        let due = self.clock.now_ms() + delay_ms;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.macrotasks.insert((due, seq), task);
    }

    pub fn pending_microtasks(&self) -> usize {
        self.microtasks.len()
    }

    pub fn pending_macrotasks(&self) -> usize {
        self.macrotasks.len()
    }

    pub fn is_idle(&self) -> bool {
        self.microtasks.is_empty() && self.macrotasks.is_empty()
    }

    fn pop_microtask(&mut self) -> Option<Task> {
        self.microtasks.pop_front()
    }

    fn pop_macrotask(&mut self) -> Option<Task> {
        let ((due, _), task) = self.macrotasks.pop_first()?;
        self.clock.advance_to(due);
        Some(task)
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("clock", &self.clock)
            .field("microtasks", &self.microtasks.len())
            .field("macrotasks", &self.macrotasks.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Agent integration
// ---------------------------------------------------------------------------

impl Agent {
    pub fn create_completion(&mut self) -> CompletionHandle {
        self.completions.create()
    }

    pub fn completion_state(
        &self,
        handle: CompletionHandle,
    ) -> Result<&CompletionState, CompletionError> {
        self.completions.state(handle)
    }

    /// Settle `handle` and queue its reactions as microtasks.
    pub fn settle(
        &mut self,
        handle: CompletionHandle,
        settlement: Settlement,
    ) -> Result<(), CompletionError> {
        let reactions = self.completions.settle(handle, &settlement)?;
        for reaction in reactions {
            let settlement = settlement.clone();
            self.event_loop
                .queue_microtask(Box::new(move |agent| reaction(agent, settlement)));
        }
        Ok(())
    }

    pub fn fulfill(&mut self, handle: CompletionHandle, value: JsValue) -> Result<(), CompletionError> {
        self.settle(handle, Ok(value))
    }

    pub fn reject(
        &mut self,
        handle: CompletionHandle,
        err: QuarantineError,
    ) -> Result<(), CompletionError> {
        self.settle(handle, Err(err))
    }

    /// Run `reaction` once `handle` settles (as a microtask).
    pub fn then(
        &mut self,
        handle: CompletionHandle,
        reaction: impl FnOnce(&mut Agent, Settlement) -> Result<(), ObjectError> + 'static,
    ) -> Result<(), CompletionError> {
        if let Some((reaction, settlement)) = self.completions.subscribe(handle, Box::new(reaction))? {
            self.event_loop
                .queue_microtask(Box::new(move |agent| reaction(agent, settlement)));
        }
        Ok(())
    }

    /// A completion that fulfils (with `undefined`) once `first` and then
    /// `second` have both settled, whatever their outcomes.
    pub fn after_settled(
        &mut self,
        first: CompletionHandle,
        second: CompletionHandle,
    ) -> Result<CompletionHandle, CompletionError> {
        // Validate both up front so failures surface to the caller.
        self.completions.state(first)?;
        self.completions.state(second)?;
        let chained = self.completions.create();
        self.then(first, move |agent, _| {
            agent.then(second, move |agent, _| {
                agent.fulfill(chained, JsValue::Undefined)?;
                Ok(())
            })?;
            Ok(())
        })?;
        Ok(chained)
    }

    /// Drain microtasks and macrotasks until nothing is left.  Returns the
    /// number of tasks executed.  A failing task is logged and does not stop
    /// the loop.
    pub fn run_until_idle(&mut self) -> usize {
        let mut executed = 0;
        loop {
            while let Some(task) = self.event_loop.pop_microtask() {
                executed += 1;
                if let Err(err) = task(self) {
                    self.record_event("", "event_loop", "task_failed", "error", Some(err.error_code()));
                }
            }
            match self.event_loop.pop_macrotask() {
                Some(task) => {
                    executed += 1;
                    if let Err(err) = task(self) {
                        self.record_event("", "event_loop", "task_failed", "error", Some(err.error_code()));
                    }
                }
                None => break,
            }
        }
        executed
    }
}
