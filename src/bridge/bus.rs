//! Event Bus
//!
//! Two channels toward the UI collaborator: an unbounded one for status,
//! log and sink-error events that must never be lost, and a bounded one for
//! activity ticks that are dropped when the consumer falls behind.

use crate::domain::error::SinkError;
use crate::domain::models::{
    ActivitySummary, AppEvent, ConnectionState, MessageSeverity, StatusMessage,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

pub const ACTIVITY_QUEUE_DEPTH: usize = 256;

/// Publishing side, cloned into every producer.
#[derive(Clone)]
pub struct EventBus {
    events: mpsc::UnboundedSender<AppEvent>,
    activity: mpsc::Sender<ActivitySummary>,
    dropped: Arc<AtomicU64>,
}

/// Consuming side, owned by the UI collaborator.
pub struct EventStream {
    events: mpsc::UnboundedReceiver<AppEvent>,
    activity: mpsc::Receiver<ActivitySummary>,
    dropped: Arc<AtomicU64>,
}

pub fn event_bus() -> (EventBus, EventStream) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (activity_tx, activity_rx) = mpsc::channel(ACTIVITY_QUEUE_DEPTH);
    let dropped = Arc::new(AtomicU64::new(0));

    (
        EventBus {
            events: events_tx,
            activity: activity_tx,
            dropped: dropped.clone(),
        },
        EventStream {
            events: events_rx,
            activity: activity_rx,
            dropped,
        },
    )
}

impl EventBus {
    pub fn status(&self, state: ConnectionState) {
        let _ = self.events.send(AppEvent::ConnectionStatus(state));
    }

    pub fn log(&self, message: impl Into<String>, severity: MessageSeverity) {
        let _ = self.events.send(AppEvent::LogMessage(StatusMessage {
            message: message.into(),
            severity,
        }));
    }

    pub fn sink_error(&self, error: &SinkError) {
        let _ = self.events.send(AppEvent::SinkError(error.to_string()));
    }

    /// Publish an activity tick. Returns false if it was dropped.
    pub fn activity(&self, summary: ActivitySummary) -> bool {
        match self.activity.try_send(summary) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

impl EventStream {
    /// Next event, preferring status/log events over activity ticks.
    /// Returns `None` once every publisher is gone and both queues are drained.
    pub async fn recv(&mut self) -> Option<AppEvent> {
        tokio::select! {
            biased;
            Some(event) = self.events.recv() => Some(event),
            Some(summary) = self.activity.recv() => Some(AppEvent::MidiActivity(summary)),
            else => None,
        }
    }

    /// Non-blocking variant for frame-driven consumers.
    pub fn try_recv(&mut self) -> Option<AppEvent> {
        if let Ok(event) = self.events.try_recv() {
            return Some(event);
        }
        self.activity.try_recv().ok().map(AppEvent::MidiActivity)
    }

    /// Activity ticks discarded because the queue was full.
    pub fn dropped_activity(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(note: u8) -> ActivitySummary {
        ActivitySummary::NoteOn {
            channel: 0,
            note,
            velocity: 100,
        }
    }

    #[tokio::test]
    async fn test_status_events_are_never_dropped() {
        let (bus, mut stream) = event_bus();
        for _ in 0..(ACTIVITY_QUEUE_DEPTH * 2) {
            bus.activity(tick(60));
        }
        for _ in 0..1000 {
            bus.status(ConnectionState::Scanning);
        }

        let mut statuses = 0;
        let mut ticks = 0;
        while let Some(event) = stream.try_recv() {
            match event {
                AppEvent::ConnectionStatus(_) => statuses += 1,
                AppEvent::MidiActivity(_) => ticks += 1,
                _ => {}
            }
        }
        assert_eq!(statuses, 1000);
        assert_eq!(ticks, ACTIVITY_QUEUE_DEPTH);
        assert_eq!(stream.dropped_activity(), ACTIVITY_QUEUE_DEPTH as u64);
    }

    #[tokio::test]
    async fn test_status_is_preferred_over_activity() {
        let (bus, mut stream) = event_bus();
        bus.activity(tick(60));
        bus.status(ConnectionState::Streaming);

        assert_eq!(
            stream.recv().await,
            Some(AppEvent::ConnectionStatus(ConnectionState::Streaming))
        );
        assert_eq!(stream.recv().await, Some(AppEvent::MidiActivity(tick(60))));
    }

    #[tokio::test]
    async fn test_stream_ends_when_publishers_are_gone() {
        let (bus, mut stream) = event_bus();
        bus.log("hello", MessageSeverity::Info);
        drop(bus);

        assert!(matches!(
            stream.recv().await,
            Some(AppEvent::LogMessage(StatusMessage { .. }))
        ));
        assert_eq!(stream.recv().await, None);
    }
}
