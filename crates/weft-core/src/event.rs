use crate::types::WorkflowEvent;

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: WorkflowEvent) {
        // No receivers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<WorkflowEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LogLevel, RunId};

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let run_id = RunId::from_string("run-1");
        bus.publish(WorkflowEvent::Log {
            run_id: run_id.clone(),
            step_id: None,
            level: LogLevel::Info,
            message: "hello".into(),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.run_id(), &run_id);
    }

    #[test]
    fn test_publish_without_receivers() {
        let bus = EventBus::default();
        bus.publish(WorkflowEvent::Progress {
            run_id: RunId::new(),
            percent: 10.0,
            current_step: None,
        });
    }
}
