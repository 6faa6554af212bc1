//! Per-realm script sequencer.
//!
//! Scripts run one at a time, in enqueue order.  Each script has its own
//! completion; the sequencer additionally keeps an aggregate `chain` that is
//! extended (never replaced) on every enqueue and fulfils once every script
//! enqueued so far has settled, whatever the individual outcomes.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::agent::Agent;
use crate::completion::{CompletionError, CompletionHandle};
use crate::object_model::JsValue;

/// A script waiting to be loaded, and the completion its caller holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptSpec {
    pub locator: String,
    pub completion: CompletionHandle,
}

#[derive(Debug)]
pub struct ScriptSequencer {
    pending: VecDeque<ScriptSpec>,
    chain: CompletionHandle,
    processing: bool,
}

impl ScriptSequencer {
    /// An idle sequencer whose chain is already fulfilled.
    pub fn new(agent: &mut Agent) -> Result<Self, CompletionError> {
        let chain = agent.create_completion();
        agent.fulfill(chain, JsValue::Undefined)?;
        Ok(Self {
            pending: VecDeque::new(),
            chain,
            processing: false,
        })
    }

    /// Queue `spec` and extend the chain with its completion.  Returns true
    /// when the caller must start loading (nothing was in flight).
    pub fn enqueue(&mut self, agent: &mut Agent, spec: ScriptSpec) -> Result<bool, CompletionError> {
        self.chain = agent.after_settled(self.chain, spec.completion)?;
        self.pending.push_back(spec);
        if self.processing {
            return Ok(false);
        }
        self.processing = true;
        Ok(true)
    }

    /// Next script to load.  `None` once drained, which also marks the
    /// sequencer idle so the next enqueue restarts loading.
    pub fn next(&mut self) -> Option<ScriptSpec> {
        let next = self.pending.pop_front();
        if next.is_none() {
            self.processing = false;
        }
        next
    }

    /// Aggregate completion for everything enqueued so far.
    pub fn chain(&self) -> CompletionHandle {
        self.chain
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_processing(&self) -> bool {
        self.processing
    }
}
