//! Event/command bus coupling the proxy core to an observer.
//!
//! Two simplex unbounded FIFO queues: core→observer carries [`Event`]s,
//! observer→core carries [`Command`]s. FIFO holds within each direction;
//! nothing is guaranteed across directions.

use tokio::sync::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::rules::{Phase, RulesDoc};

/// Core→observer notification.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A flow entered the pipeline.
    FlowCreated {
        /// Flow id.
        id: u64,
    },
    /// A mutation worth re-rendering, typically post-response.
    FlowUpdated {
        /// Flow id.
        id: u64,
    },
    /// Terminal for this flow.
    FlowFinished {
        /// Flow id.
        id: u64,
    },
    /// The owning handler awaits a decision.
    FlowPaused {
        /// Flow id.
        id: u64,
        /// Phase at which the flow is paused.
        phase: Phase,
    },
    /// Free-form diagnostic string.
    LogMessage {
        /// The message.
        msg: String,
    },
}

/// Observer→core instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Toggle the global intercept flag.
    SetIntercept {
        /// New flag value.
        on: bool,
    },
    /// Resolve the pending slot for a paused flow with Forward.
    Forward {
        /// Flow id.
        flow_id: u64,
    },
    /// Resolve the pending slot for a paused flow with Drop.
    Drop {
        /// Flow id.
        flow_id: u64,
    },
    /// Reserved; resolves the pending slot like Forward.
    Repeat {
        /// Flow id.
        flow_id: u64,
    },
    /// Replace the active ruleset atomically from the given document.
    ApplyRules {
        /// The parsed rule document; compiled by the dispatcher.
        doc: RulesDoc,
    },
}

/// The two queues, shareable behind an `Arc`.
///
/// Publication never blocks and never fails; if the observer side is gone the
/// event is discarded.
#[derive(Debug)]
pub struct EventBus {
    event_tx: UnboundedSender<Event>,
    command_tx: UnboundedSender<Command>,
    event_rx: Mutex<UnboundedReceiver<Event>>,
    command_rx: Mutex<UnboundedReceiver<Command>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create a bus with empty queues.
    pub fn new() -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        Self {
            event_tx,
            command_tx,
            event_rx: Mutex::new(event_rx),
            command_rx: Mutex::new(command_rx),
        }
    }

    /// Publish an event toward the observer.
    pub fn publish(&self, event: Event) {
        let _ = self.event_tx.send(event);
    }

    /// Receive the next event, in publish order.
    pub async fn next_event(&self) -> Option<Event> {
        self.event_rx.lock().await.recv().await
    }

    /// Send a command toward the core.
    pub fn send_command(&self, command: Command) {
        let _ = self.command_tx.send(command);
    }

    /// Receive the next command, in send order.
    pub async fn next_command(&self) -> Option<Command> {
        self.command_rx.lock().await.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_arrive_in_publish_order() {
        let bus = EventBus::new();
        for id in 1..=5 {
            bus.publish(Event::FlowCreated { id });
        }
        for id in 1..=5 {
            assert_eq!(bus.next_event().await, Some(Event::FlowCreated { id }));
        }
    }

    #[tokio::test]
    async fn commands_arrive_in_send_order() {
        let bus = EventBus::new();
        bus.send_command(Command::SetIntercept { on: true });
        bus.send_command(Command::Forward { flow_id: 1 });
        assert_eq!(
            bus.next_command().await,
            Some(Command::SetIntercept { on: true })
        );
        assert_eq!(
            bus.next_command().await,
            Some(Command::Forward { flow_id: 1 })
        );
    }

    #[tokio::test]
    async fn directions_are_independent() {
        let bus = EventBus::new();
        bus.send_command(Command::SetIntercept { on: true });
        bus.publish(Event::LogMessage {
            msg: "hello".to_string(),
        });
        assert!(matches!(
            bus.next_event().await,
            Some(Event::LogMessage { .. })
        ));
        assert!(matches!(
            bus.next_command().await,
            Some(Command::SetIntercept { on: true })
        ));
    }
}
