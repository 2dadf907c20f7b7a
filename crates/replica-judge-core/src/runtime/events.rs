// crates/replica-judge-core/src/runtime/events.rs
// ============================================================================
// Module: Evaluator Events
// Description: Structured JSON-line events emitted by the evaluator.
// Purpose: Record pass, rule, and unit outcomes without hard logging
//          dependencies.
// Dependencies: crate::core, serde, serde_json
// ============================================================================

//! ## Overview
//! Every observable evaluator decision is recorded as an [`EvaluatorEvent`]
//! and handed to an [`EvaluatorEventSink`]. Sinks are best-effort: a failed
//! write never fails a pass. Deployments route JSON lines to stderr, a file,
//! or nowhere; tests collect events in memory.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs::OpenOptions;
use std::io;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use serde::Serialize;

use crate::core::DidKey;
use crate::core::LockCounters;
use crate::core::RseId;
use crate::core::RuleId;
use crate::core::RuleState;
use crate::core::StuckReason;
use crate::core::Timestamp;
use crate::core::WorkerId;
use crate::runtime::evaluator::PassReport;

// ============================================================================
// SECTION: Types
// ============================================================================

/// Evaluator event payload.
#[derive(Debug, Clone, Serialize)]
pub struct EvaluatorEvent {
    /// Event timestamp (milliseconds since epoch).
    pub timestamp_ms: u64,
    /// Worker that produced the event.
    pub worker: WorkerId,
    /// Event-specific fields, tagged by `event`.
    #[serde(flatten)]
    pub detail: EventDetail,
}

impl EvaluatorEvent {
    /// Creates an event stamped with the current time.
    #[must_use]
    pub fn new(worker: &WorkerId, detail: EventDetail) -> Self {
        Self {
            timestamp_ms: Timestamp::now().as_millis(),
            worker: worker.clone(),
            detail,
        }
    }

    /// Returns the event label.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        self.detail.label()
    }
}

/// Event-specific payload.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventDetail {
    /// A pass began.
    PassStarted {
        /// Backlog bound for the pass.
        did_limit: usize,
    },
    /// A pass completed.
    PassFinished {
        /// Pass counters.
        report: PassReport,
    },
    /// Backlog drain gave up after retries; entries stay pending.
    BacklogDeferred {
        /// Last contention error.
        error: String,
    },
    /// A rule was evaluated and its state recomputed.
    RuleEvaluated {
        /// Evaluated rule.
        rule_id: RuleId,
        /// Resulting state.
        state: RuleState,
        /// Resulting lock counters.
        counters: LockCounters,
        /// Whether the stored state changed.
        changed: bool,
    },
    /// A rule could not be fully satisfied.
    RuleStuck {
        /// Stuck rule.
        rule_id: RuleId,
        /// First unsatisfied reason.
        reason: StuckReason,
    },
    /// Lock changes for one grouping unit were committed.
    UnitCommitted {
        /// Owning rule.
        rule_id: RuleId,
        /// Unit label.
        unit: String,
        /// Locks created.
        created: u64,
        /// Locks removed.
        removed: u64,
        /// Target resources of the unit.
        targets: Vec<RseId>,
    },
    /// Evaluating one identifier or rule failed; work was deferred.
    UnitFailed {
        /// Identifier being processed, if any.
        did: Option<DidKey>,
        /// Rule being processed, if any.
        rule_id: Option<RuleId>,
        /// Failure description.
        error: String,
    },
    /// Another worker held the rule's evaluation lease.
    RuleBusy {
        /// Skipped rule.
        rule_id: RuleId,
    },
    /// A rule and its locks were removed.
    RulePurged {
        /// Purged rule.
        rule_id: RuleId,
        /// Locks removed.
        locks_removed: u64,
    },
}

impl EventDetail {
    /// Returns the stable event label.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::PassStarted {
                ..
            } => "pass_started",
            Self::PassFinished {
                ..
            } => "pass_finished",
            Self::BacklogDeferred {
                ..
            } => "backlog_deferred",
            Self::RuleEvaluated {
                ..
            } => "rule_evaluated",
            Self::RuleStuck {
                ..
            } => "rule_stuck",
            Self::UnitCommitted {
                ..
            } => "unit_committed",
            Self::UnitFailed {
                ..
            } => "unit_failed",
            Self::RuleBusy {
                ..
            } => "rule_busy",
            Self::RulePurged {
                ..
            } => "rule_purged",
        }
    }
}

// ============================================================================
// SECTION: Trait
// ============================================================================

/// Sink for evaluator events.
pub trait EvaluatorEventSink: Send + Sync {
    /// Record an event.
    fn record(&self, event: &EvaluatorEvent);
}

/// Event sink that logs JSON lines to stderr.
pub struct StderrEventSink;

impl EvaluatorEventSink for StderrEventSink {
    fn record(&self, event: &EvaluatorEvent) {
        if let Ok(payload) = serde_json::to_string(event) {
            let _ = writeln!(std::io::stderr(), "{payload}");
        }
    }
}

/// Event sink that logs JSON lines to a file.
pub struct FileEventSink {
    /// File handle used for append-only logging.
    file: Mutex<std::fs::File>,
}

impl FileEventSink {
    /// Opens the event log file in append mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn new(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl EvaluatorEventSink for FileEventSink {
    fn record(&self, event: &EvaluatorEvent) {
        if let Ok(payload) = serde_json::to_string(event)
            && let Ok(mut file) = self.file.lock()
        {
            let _ = writeln!(file, "{payload}");
            let _ = file.flush();
        }
    }
}

/// No-op event sink.
pub struct NoopEventSink;

impl EvaluatorEventSink for NoopEventSink {
    fn record(&self, _event: &EvaluatorEvent) {}
}

/// Event sink that keeps events in memory.
#[derive(Default)]
pub struct MemoryEventSink {
    /// Recorded events in emission order.
    events: Mutex<Vec<EvaluatorEvent>>,
}

impl MemoryEventSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the recorded events.
    #[must_use]
    pub fn events(&self) -> Vec<EvaluatorEvent> {
        self.events.lock().map(|events| events.clone()).unwrap_or_default()
    }

    /// Returns the labels of the recorded events.
    #[must_use]
    pub fn labels(&self) -> Vec<&'static str> {
        self.events().iter().map(EvaluatorEvent::label).collect()
    }
}

impl EvaluatorEventSink for MemoryEventSink {
    fn record(&self, event: &EvaluatorEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
