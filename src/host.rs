//! # Host Callback Surface
//!
//! The embedding application implements these traits to supply domain logic;
//! the engine drives them from its loops. Every method has a default no-op
//! implementation so a host only overrides what it actually uses (spec
//! §4.8: "registers at most one of each").

use async_trait::async_trait;

use crate::error::Result;
use crate::event::Event;

/// Classification callback invoked once per dequeued user event (spec §4.3).
#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Decide what happens to `event`. Returning `Ok(true)` moves the event
    /// into the processing pool; `Ok(false)` means the host already took
    /// full responsibility for it (including any reply). An `Err` is
    /// treated like a panic from the host's perspective: the engine logs it
    /// and re-appends the event to incoming, up to the per-event retry
    /// budget.
    async fn analyze(&self, event: &Event) -> Result<bool>;

    /// Optional periodic hook run once per analyze tick, after the batch is
    /// processed, letting the host poll local device state unprompted by
    /// any specific event. Default: no-op.
    async fn check_local_data(&self) -> Result<()> {
        Ok(())
    }

    /// Notification that a processing-pool entry has sat past its
    /// `maximum_processing_time` without a reply. The engine does not
    /// synthesize a failure reply itself (spec §9 open question, resolved
    /// as "notify only") — the host decides whether to `reply()` with a
    /// timeout result, re-emit, or leave it. Called at most once per
    /// overdue entry per engine lifetime. Default: no-op.
    async fn on_processing_timeout(&self, _event: &Event) -> Result<()> {
        Ok(())
    }
}

/// Lifecycle hooks run on FSM state entry. A failing hook drives the FSM to
/// `ON_ERROR` (spec §4.7/§7 kind 5). Defaults are no-ops so a host need only
/// implement the transitions it cares about.
#[async_trait]
pub trait LifecycleHooks: Send + Sync {
    async fn on_initializing(&self) -> Result<()> {
        Ok(())
    }

    async fn on_starting(&self) -> Result<()> {
        Ok(())
    }

    async fn on_pausing(&self) -> Result<()> {
        Ok(())
    }

    async fn on_resuming(&self) -> Result<()> {
        Ok(())
    }

    async fn on_stopping(&self) -> Result<()> {
        Ok(())
    }

    async fn on_resetting(&self) -> Result<()> {
        Ok(())
    }
}

/// A no-op implementation of both host traits, used by the demo binary and
/// by tests that only exercise engine mechanics.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHost;

#[async_trait]
impl Analyzer for NoopHost {
    async fn analyze(&self, _event: &Event) -> Result<bool> {
        Ok(false)
    }
}

#[async_trait]
impl LifecycleHooks for NoopHost {
    // Every hook keeps the trait's default no-op body.
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[tokio::test]
    async fn noop_host_never_moves_events_to_processing() {
        let host = NoopHost;
        let event = Event::new("a", "127.0.0.1", 1, "b", "127.0.0.1", 2, "ping", Value::Null);
        assert_eq!(host.analyze(&event).await.unwrap(), false);
    }

    #[tokio::test]
    async fn noop_host_ignores_processing_timeouts() {
        let host = NoopHost;
        let event = Event::new("a", "127.0.0.1", 1, "b", "127.0.0.1", 2, "ping", Value::Null);
        host.on_processing_timeout(&event).await.unwrap();
    }

    #[tokio::test]
    async fn noop_lifecycle_hooks_all_succeed() {
        let host = NoopHost;
        host.on_initializing().await.unwrap();
        host.on_starting().await.unwrap();
        host.on_pausing().await.unwrap();
        host.on_resuming().await.unwrap();
        host.on_stopping().await.unwrap();
        host.on_resetting().await.unwrap();
    }
}
