use tokio::sync::mpsc;

use stride_core::workflow::{DistributedTransaction, EventKind, LifecycleEvent};

/// Sends lifecycle events into the service's fan-out channel.
#[derive(Clone)]
pub struct EventEmitter {
    sender: mpsc::UnboundedSender<LifecycleEvent>,
}

impl EventEmitter {
    pub fn new(sender: mpsc::UnboundedSender<LifecycleEvent>) -> Self {
        Self { sender }
    }

    /// Emitter paired with its receiving end.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<LifecycleEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self::new(sender), receiver)
    }

    /// Announce an event about `tx`.
    pub fn emit(&self, tx: &DistributedTransaction, kind: EventKind) {
        self.send(LifecycleEvent::new(&tx.workflow_id, &tx.transaction_id, kind));
    }

    /// Announce every event held in `outbox`, oldest first.
    pub fn flush(&self, outbox: &mut Outbox) {
        for event in outbox.events.drain(..) {
            self.send(event);
        }
    }

    fn send(&self, event: LifecycleEvent) {
        tracing::trace!(
            workflow_id = %event.workflow_id,
            transaction_id = %event.transaction_id,
            event = event.kind.as_str(),
            "Lifecycle event"
        );

        if self.sender.send(event).is_err() {
            tracing::debug!("Lifecycle event dropped, fan-out channel closed");
        }
    }
}

/// Events describing transitions that are not saved yet.
///
/// Flushed through [`EventEmitter::flush`] once the checkpoint recording
/// them is stored, discarded when the save fails.
#[derive(Debug, Default)]
pub struct Outbox {
    events: Vec<LifecycleEvent>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, tx: &DistributedTransaction, kind: EventKind) {
        self.events
            .push(LifecycleEvent::new(&tx.workflow_id, &tx.transaction_id, kind));
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Drop held events.
    pub fn discard(&mut self) {
        self.events.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stride_core::workflow::{StepDefinition, WorkflowDefinition};

    #[tokio::test]
    async fn test_emit_reaches_receiver() {
        let (emitter, mut receiver) = EventEmitter::channel();
        let mut def = WorkflowDefinition::new("checkout");
        def.steps = vec![StepDefinition::new("reserve")];
        let tx = DistributedTransaction::new(&def, "tx-1", serde_json::Value::Null);

        emitter.emit(&tx, EventKind::Begin);

        let event = receiver.recv().await.unwrap();
        assert_eq!(event.workflow_id, "checkout");
        assert_eq!(event.transaction_id, "tx-1");
        assert_eq!(event.event_type(), "begin");
    }

    #[tokio::test]
    async fn test_outbox_holds_events_until_flushed() {
        let (emitter, mut receiver) = EventEmitter::channel();
        let def = WorkflowDefinition::new("checkout");
        let tx = DistributedTransaction::new(&def, "tx-1", serde_json::Value::Null);

        let mut outbox = Outbox::new();
        outbox.push(&tx, EventKind::CompensateBegin);
        outbox.push(&tx, EventKind::Resume);
        assert!(receiver.try_recv().is_err());

        emitter.flush(&mut outbox);
        assert!(outbox.is_empty());
        assert_eq!(receiver.recv().await.unwrap().event_type(), "compensateBegin");
        assert_eq!(receiver.recv().await.unwrap().event_type(), "resume");

        outbox.push(&tx, EventKind::Resume);
        outbox.discard();
        emitter.flush(&mut outbox);
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn test_emit_after_close_is_silent() {
        let (emitter, receiver) = EventEmitter::channel();
        drop(receiver);
        let def = WorkflowDefinition::new("checkout");
        let tx = DistributedTransaction::new(&def, "tx-1", serde_json::Value::Null);
        emitter.emit(&tx, EventKind::Resume);
    }
}
