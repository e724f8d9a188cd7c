//! Event definitions and the supervisor's publish/subscribe bus.
//!
//! Three topics: `status-change`, `output`, `hidden-change`. Handlers are
//! registered per topic and invoked sequentially by a single dispatch task
//! fed from an unbounded queue, so delivery is in-order per topic and a
//! handler may call back into the supervisor's read APIs. The bus does not
//! replay past events; late subscribers query current state instead.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::logs::StreamKind;
use crate::runnable::RunnableStatus;

/// An event published by the supervisor.
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    /// An instance changed status.
    StatusChange {
        id: String,
        status: RunnableStatus,
        error: Option<String>,
    },
    /// A line was appended to the log store.
    Output {
        id: String,
        line: String,
        stream: StreamKind,
    },
    /// The hidden flag flipped.
    HiddenChange { id: String, hidden: bool },
}

type Handler = Box<dyn Fn(&SupervisorEvent) + Send + Sync>;

#[derive(Default)]
struct Topics {
    status: Vec<Handler>,
    output: Vec<Handler>,
    hidden: Vec<Handler>,
}

/// Topic-typed event bus.
pub struct EventBus {
    tx: mpsc::UnboundedSender<SupervisorEvent>,
    topics: Arc<Mutex<Topics>>,
}

impl EventBus {
    /// Creates the bus and spawns its dispatch task on the current runtime.
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<SupervisorEvent>();
        let topics: Arc<Mutex<Topics>> = Arc::default();
        let dispatch_topics = topics.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let topics = dispatch_topics.lock().unwrap();
                let handlers = match event {
                    SupervisorEvent::StatusChange { .. } => &topics.status,
                    SupervisorEvent::Output { .. } => &topics.output,
                    SupervisorEvent::HiddenChange { .. } => &topics.hidden,
                };
                for handler in handlers {
                    // A panicking handler is isolated from the bus and from
                    // the other subscribers.
                    if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                        tracing::error!("event handler panicked");
                    }
                }
            }
        });
        Self { tx, topics }
    }

    /// Publishes an event. Never blocks; ordering follows call order.
    pub fn emit(&self, event: SupervisorEvent) {
        let _ = self.tx.send(event);
    }

    /// Registers a handler for `status-change` events.
    pub fn on_status_change(&self, handler: impl Fn(&SupervisorEvent) + Send + Sync + 'static) {
        self.topics.lock().unwrap().status.push(Box::new(handler));
    }

    /// Registers a handler for `output` events.
    pub fn on_output(&self, handler: impl Fn(&SupervisorEvent) + Send + Sync + 'static) {
        self.topics.lock().unwrap().output.push(Box::new(handler));
    }

    /// Registers a handler for `hidden-change` events.
    pub fn on_hidden_change(&self, handler: impl Fn(&SupervisorEvent) + Send + Sync + 'static) {
        self.topics.lock().unwrap().hidden.push(Box::new(handler));
    }

    /// Forwards every event of every topic into a channel.
    pub fn forward(&self, tx: mpsc::UnboundedSender<SupervisorEvent>) {
        let mut topics = self.topics.lock().unwrap();
        let topics = &mut *topics;
        for list in [&mut topics.status, &mut topics.output, &mut topics.hidden] {
            let tx = tx.clone();
            list.push(Box::new(move |event| {
                let _ = tx.send(event.clone());
            }));
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn output_event(line: &str) -> SupervisorEvent {
        SupervisorEvent::Output {
            id: "api".into(),
            line: line.into(),
            stream: StreamKind::Stdout,
        }
    }

    #[tokio::test]
    async fn delivers_in_order_per_topic() {
        let bus = EventBus::new();
        let seen: Arc<Mutex<Vec<String>>> = Arc::default();
        let sink = seen.clone();
        bus.on_output(move |event| {
            if let SupervisorEvent::Output { line, .. } = event {
                sink.lock().unwrap().push(line.clone());
            }
        });
        for i in 0..20 {
            bus.emit(output_event(&format!("line{}", i)));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        let seen = seen.lock().unwrap();
        let expected: Vec<String> = (0..20).map(|i| format!("line{}", i)).collect();
        assert_eq!(*seen, expected);
    }

    #[tokio::test]
    async fn late_subscriber_gets_no_replay() {
        let bus = EventBus::new();
        bus.emit(output_event("early"));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let seen: Arc<Mutex<Vec<String>>> = Arc::default();
        let sink = seen.clone();
        bus.on_output(move |event| {
            if let SupervisorEvent::Output { line, .. } = event {
                sink.lock().unwrap().push(line.clone());
            }
        });
        bus.emit(output_event("late"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*seen.lock().unwrap(), vec!["late"]);
    }

    #[tokio::test]
    async fn panicking_handler_does_not_break_others() {
        let bus = EventBus::new();
        bus.on_status_change(|_| panic!("boom"));
        let seen: Arc<Mutex<usize>> = Arc::default();
        let sink = seen.clone();
        bus.on_status_change(move |_| {
            *sink.lock().unwrap() += 1;
        });
        bus.emit(SupervisorEvent::StatusChange {
            id: "api".into(),
            status: RunnableStatus::Starting,
            error: None,
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn topics_are_independent() {
        let bus = EventBus::new();
        let seen: Arc<Mutex<Vec<&'static str>>> = Arc::default();
        let sink = seen.clone();
        bus.on_hidden_change(move |_| sink.lock().unwrap().push("hidden"));
        bus.emit(output_event("ignored"));
        bus.emit(SupervisorEvent::HiddenChange {
            id: "api".into(),
            hidden: false,
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*seen.lock().unwrap(), vec!["hidden"]);
    }
}
