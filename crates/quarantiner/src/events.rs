//! Structured lifecycle events.
//!
//! Every lifecycle step (declaration, realm creation, script load, override
//! replay, record eviction) appends a [`QuarantineEvent`] with stable keys.
//! Trace ids are derived deterministically from the sandbox name and a
//! per-log sequence number so two runs of the same scenario produce identical
//! logs.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Structured lifecycle event (stable keys for telemetry).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarantineEvent {
    pub trace_id: String,
    pub sandbox: String,
    pub component: String,
    pub event: String,
    pub outcome: String,
    pub error_code: Option<String>,
    pub virtual_time_ms: u64,
}

/// Deterministic 16-hex-digit trace id for the `seq`-th event of `sandbox`.
pub fn trace_id_for(sandbox: &str, seq: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"quarantiner-trace:");
    hasher.update(sandbox.as_bytes());
    hasher.update(seq.to_be_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

/// Append-only event log owned by the agent.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Vec<QuarantineEvent>,
    seq: u64,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &mut self,
        sandbox: &str,
        component: &str,
        event: &str,
        outcome: &str,
        error_code: Option<&str>,
        virtual_time_ms: u64,
    ) {
        let trace_id = trace_id_for(sandbox, self.seq);
        self.seq += 1;
        self.events.push(QuarantineEvent {
            trace_id,
            sandbox: sandbox.to_string(),
            component: component.to_string(),
            event: event.to_string(),
            outcome: outcome.to_string(),
            error_code: error_code.map(str::to_string),
            virtual_time_ms,
        });
    }

    pub fn events(&self) -> &[QuarantineEvent] {
        &self.events
    }

    /// Take all recorded events, leaving the log empty.
    pub fn drain(&mut self) -> Vec<QuarantineEvent> {
        std::mem::take(&mut self.events)
    }

    /// Number of recorded events named `event`.
    pub fn count(&self, event: &str) -> usize {
        self.events.iter().filter(|e| e.event == event).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_ids_are_deterministic_and_distinct() {
        let a = trace_id_for("default", 0);
        assert_eq!(a, trace_id_for("default", 0));
        assert_eq!(a.len(), 16);
        assert_ne!(a, trace_id_for("default", 1));
        assert_ne!(a, trace_id_for("ads", 0));
    }

    #[test]
    fn record_then_drain() {
        let mut log = EventLog::new();
        log.record("default", "repository", "sandbox_declared", "ok", None, 0);
        log.record(
            "default",
            "sequencer",
            "script_failed",
            "error",
            Some("QR-SCRIPT-0001"),
            250,
        );
        assert_eq!(log.count("script_failed"), 1);
        let events = log.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].error_code.as_deref(), Some("QR-SCRIPT-0001"));
        assert_eq!(events[1].virtual_time_ms, 250);
        assert_ne!(events[0].trace_id, events[1].trace_id);
        assert!(log.events().is_empty());
    }

    #[test]
    fn event_serde_uses_stable_keys() {
        let mut log = EventLog::new();
        log.record("s", "bridge", "records_evicted", "ok", None, 5);
        let json = serde_json::to_value(&log.events()[0]).unwrap();
        for key in [
            "trace_id",
            "sandbox",
            "component",
            "event",
            "outcome",
            "error_code",
            "virtual_time_ms",
        ] {
            assert!(json.get(key).is_some(), "missing key {key}");
        }
    }
}
