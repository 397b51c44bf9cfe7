//! # FSM — Lifecycle State Machine and Command Router
//!
//! A small state machine governs which externally-originated event types the
//! analyze loop is allowed to dequeue. Transitions are driven by
//! engine-internal `CMD_*` events and by `LifecycleHooks` outcomes; the FSM
//! itself carries no application logic — that lives in `Analyzer::analyze`.

use std::fmt;

use crate::error::{EngineError, Result};
use crate::event::{Event, CMD_PREFIX};

/// `CMD_*` event-type constants recognized by the router.
pub const CMD_INITIALIZE: &str = "CMD_INITIALIZE";
pub const CMD_RUN: &str = "CMD_RUN";
pub const CMD_PAUSE: &str = "CMD_PAUSE";
pub const CMD_RESUME: &str = "CMD_RESUME";
pub const CMD_GRACEFUL_STOP: &str = "CMD_GRACEFUL_STOP";
pub const CMD_RESET: &str = "CMD_RESET";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FsmState {
    Stopped,
    Initializing,
    Initialized,
    Starting,
    Started,
    Pausing,
    Paused,
    Resuming,
    Stopping,
    OnError,
    Fault,
    Resetting,
}

impl fmt::Display for FsmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = serde_json::to_value(self).unwrap_or_default();
        write!(f, "{}", s.as_str().unwrap_or("UNKNOWN"))
    }
}

impl FsmState {
    /// A non-terminal state may receive `CMD_GRACEFUL_STOP` (spec §4.7).
    pub fn is_terminal_for_stop(&self) -> bool {
        matches!(self, FsmState::Stopped | FsmState::Fault)
    }

    /// Which `CMD_*` event types are legal to act on from this state.
    pub fn admitted_commands(&self) -> &'static [&'static str] {
        match self {
            FsmState::Stopped => &[CMD_INITIALIZE],
            FsmState::Initializing => &[],
            FsmState::Initialized => &[CMD_RUN],
            FsmState::Starting => &[],
            FsmState::Started => &[CMD_PAUSE, CMD_GRACEFUL_STOP],
            FsmState::Pausing => &[],
            FsmState::Paused => &[CMD_RESUME, CMD_GRACEFUL_STOP],
            FsmState::Resuming => &[],
            FsmState::Stopping => &[],
            FsmState::OnError => &[CMD_RESET],
            FsmState::Fault => &[],
            FsmState::Resetting => &[],
        }
    }

    /// Whether user (non-command) event types may be dequeued for analysis
    /// in this state. Only `STARTED` admits arbitrary application events;
    /// every other state is either mid-transition or explicitly paused.
    pub fn admits_user_events(&self) -> bool {
        matches!(self, FsmState::Started)
    }
}

/// Outcome of routing one event through the FSM.
pub enum RouteDecision {
    /// Not a command; admitted for normal analysis.
    AnalyzeAsUserEvent,
    /// Not a command, but the current state does not admit user events —
    /// caller should re-append the event to incoming unchanged (spec §4.3.2).
    Deferred,
    /// A command was recognized and the transition applied. Carries the
    /// state entered immediately (the "in-flight" state, e.g. `STARTING`);
    /// the caller is responsible for invoking the matching `on_enter` hook
    /// and then calling `complete_transition`.
    Transitioned(FsmState),
    /// A command was recognized but illegal in the current state.
    Rejected,
}

/// Owns `fsm_state` and applies the transition table from spec §4.7.
///
/// Transitions are split into two steps mirroring the spec's `on_enter`
/// hooks: `route` moves into the *in-flight* state (`INITIALIZING`,
/// `STARTING`, ...) and returns it so the caller can run the lifecycle hook;
/// `complete_transition` then moves into the settled state (`INITIALIZED`,
/// `STARTED`, ...) or, on hook failure, into `ON_ERROR`.
pub struct Fsm {
    state: FsmState,
}

impl Fsm {
    pub fn new() -> Self {
        Self {
            state: FsmState::Stopped,
        }
    }

    pub fn state(&self) -> FsmState {
        self.state
    }

    /// Route one dequeued event. Does not itself run lifecycle hooks —
    /// callers drive those between `route` and `complete_transition`.
    pub fn route(&mut self, event: &Event) -> RouteDecision {
        if !event.event_type.starts_with(CMD_PREFIX) {
            return if self.state.admits_user_events() {
                RouteDecision::AnalyzeAsUserEvent
            } else {
                RouteDecision::Deferred
            };
        }

        let cmd = event.event_type.as_str();

        // CMD_GRACEFUL_STOP is legal from any non-terminal state regardless
        // of the per-state admitted_commands table (spec: "any non-terminal").
        if cmd == CMD_GRACEFUL_STOP && !self.state.is_terminal_for_stop() {
            self.state = FsmState::Stopping;
            return RouteDecision::Transitioned(FsmState::Stopping);
        }

        if !self.state.admitted_commands().contains(&cmd) {
            return RouteDecision::Rejected;
        }

        let in_flight = match cmd {
            CMD_INITIALIZE => FsmState::Initializing,
            CMD_RUN => FsmState::Starting,
            CMD_PAUSE => FsmState::Pausing,
            CMD_RESUME => FsmState::Resuming,
            CMD_RESET => FsmState::Resetting,
            _ => return RouteDecision::Rejected,
        };
        self.state = in_flight;
        RouteDecision::Transitioned(in_flight)
    }

    /// Called after the matching lifecycle hook ran successfully; advances
    /// from an in-flight state to its settled destination.
    pub fn complete_transition(&mut self) -> Result<()> {
        self.state = match self.state {
            FsmState::Initializing => FsmState::Initialized,
            FsmState::Starting => FsmState::Started,
            FsmState::Pausing => FsmState::Paused,
            FsmState::Resuming => FsmState::Started,
            FsmState::Stopping => FsmState::Stopped,
            FsmState::Resetting => FsmState::Stopped,
            other => {
                return Err(EngineError::internal(format!(
                    "complete_transition called outside an in-flight state: {other}"
                )))
            }
        };
        Ok(())
    }

    /// Called when a lifecycle hook fails, or an unrecoverable internal
    /// error occurs anywhere in the engine (spec §7 kind 5/7).
    pub fn fail(&mut self, unresolvable: bool) {
        self.state = if unresolvable {
            FsmState::Fault
        } else {
            FsmState::OnError
        };
    }

    /// Force the deadline-exceeded STOPPING -> STOPPED transition (spec
    /// §5's "STOPPING deadline ... implementation-defined, typically 10s").
    pub fn force_stopped(&mut self) {
        self.state = FsmState::Stopped;
    }
}

impl Default for Fsm {
    fn default() -> Self {
        Self::new()
    }
}
