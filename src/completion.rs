// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Completion boundary.
//!
//! Every item outcome, every finished cycle and every engine state change is
//! reported to one injected [`CompletionSink`]. The engine never reaches for a
//! global metrics registry or event bus.
//!
//! | Sink | Use |
//! |------|-----|
//! | [`NoOpSink`] | Default; discards everything |
//! | [`MetricsSink`] | Feeds the `metrics` facade |
//! | [`ChannelSink`] | Forwards events to a tokio channel (tests, embedding) |
//!
//! Sinks are called inline from cycles and workers, so they must not block.

use crate::engine::{CycleReport, EngineState};
use crate::ledger::ItemStatus;
use crate::metrics;
use crate::queue::Operation;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

/// Outcome of one item attempt, direct or queued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionEvent {
    pub config_id: String,
    pub metadata_id: String,
    /// Source system name.
    pub source: String,
    /// Destination system name.
    pub destination: String,
    pub operation: Operation,
    pub status: ItemStatus,
    /// True when no further attempt will be made for this item: it succeeded,
    /// or it failed and reached its retry limit (or was rejected outright).
    pub terminal: bool,
    pub attempts: u32,
    pub resource_bytes: u64,
    pub metadata_bytes: u64,
}

impl CompletionEvent {
    pub fn is_success(&self) -> bool {
        self.status == ItemStatus::Success
    }

    /// Failed for good.
    pub fn is_terminal_failure(&self) -> bool {
        self.terminal && self.status == ItemStatus::Failure
    }
}

/// Receiver of replication outcomes.
pub trait CompletionSink: Send + Sync + 'static {
    fn on_completion(&self, event: &CompletionEvent);

    fn on_cycle(&self, _report: &CycleReport) {}

    fn on_engine_state(&self, _state: EngineState) {}
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpSink;

impl CompletionSink for NoOpSink {
    fn on_completion(&self, _event: &CompletionEvent) {}
}

/// Publishes outcomes through the `metrics` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsSink;

impl CompletionSink for MetricsSink {
    fn on_completion(&self, event: &CompletionEvent) {
        metrics::record_item(&event.config_id, event.operation.as_str(), event.status.as_str());
        metrics::record_bytes(&event.config_id, event.resource_bytes, event.metadata_bytes);
        if event.terminal {
            metrics::record_task_attempts(&event.config_id, event.attempts);
        }
        if event.is_terminal_failure() {
            metrics::record_item_terminal(&event.config_id);
        }
    }

    fn on_cycle(&self, report: &CycleReport) {
        let direction = match report.direction {
            crate::config::Direction::Push => "push",
            crate::config::Direction::Pull => "pull",
            crate::config::Direction::Both => "both",
        };
        metrics::record_cycle(
            &report.config_id,
            direction,
            report.status.as_str(),
            report.processed,
            report.duration,
        );
        metrics::record_enqueued(&report.config_id, report.enqueued);
        if report.status.is_success() {
            metrics::set_last_success(&report.config_id, report.started_at.timestamp());
        }
    }

    fn on_engine_state(&self, state: EngineState) {
        metrics::set_engine_state(&state.to_string());
    }
}

/// Anything a [`ChannelSink`] forwards.
#[derive(Debug, Clone)]
pub enum ReplicationEvent {
    Item(CompletionEvent),
    Cycle(CycleReport),
    Engine(EngineState),
}

/// Forwards every outcome to an unbounded tokio channel.
///
/// Sends never block; events are dropped (with a warning) once the receiver
/// is gone.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ReplicationEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ReplicationEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: ReplicationEvent) {
        if self.tx.send(event).is_err() {
            warn!("Completion receiver dropped, discarding event");
        }
    }
}

impl CompletionSink for ChannelSink {
    fn on_completion(&self, event: &CompletionEvent) {
        self.send(ReplicationEvent::Item(event.clone()));
    }

    fn on_cycle(&self, report: &CycleReport) {
        self.send(ReplicationEvent::Cycle(report.clone()));
    }

    fn on_engine_state(&self, state: EngineState) {
        self.send(ReplicationEvent::Engine(state));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Direction;

    fn event(status: ItemStatus, terminal: bool) -> CompletionEvent {
        CompletionEvent {
            config_id: "cfg".to_string(),
            metadata_id: "m1".to_string(),
            source: "A".to_string(),
            destination: "B".to_string(),
            operation: Operation::Create,
            status,
            terminal,
            attempts: 1,
            resource_bytes: 10,
            metadata_bytes: 4,
        }
    }

    #[test]
    fn test_terminal_failure_flag() {
        assert!(event(ItemStatus::Failure, true).is_terminal_failure());
        assert!(!event(ItemStatus::Failure, false).is_terminal_failure());
        assert!(!event(ItemStatus::Success, true).is_terminal_failure());
    }

    #[tokio::test]
    async fn test_channel_sink_forwards_everything() {
        let (sink, mut rx) = ChannelSink::new();
        sink.on_completion(&event(ItemStatus::Success, true));
        sink.on_cycle(&CycleReport::new("cfg", Direction::Push, "a", "b"));
        sink.on_engine_state(EngineState::Running);

        assert!(matches!(rx.recv().await, Some(ReplicationEvent::Item(e)) if e.is_success()));
        assert!(matches!(rx.recv().await, Some(ReplicationEvent::Cycle(r)) if r.config_id == "cfg"));
        assert!(matches!(rx.recv().await, Some(ReplicationEvent::Engine(EngineState::Running))));
    }

    #[test]
    fn test_channel_sink_survives_dropped_receiver() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        sink.on_completion(&event(ItemStatus::Failure, false));
    }

    #[test]
    fn test_metrics_and_noop_sinks_accept_events() {
        let report = CycleReport::new("cfg", Direction::Pull, "a", "b");
        for sink in [&MetricsSink as &dyn CompletionSink, &NoOpSink] {
            sink.on_completion(&event(ItemStatus::Failure, true));
            sink.on_cycle(&report);
            sink.on_engine_state(EngineState::Stopped);
        }
    }
}
