//! This module provides the [`Aggregator`]'s `Event`, `EventSubscriber` and `EventPublisher`
//! types.
//!
//! [`Aggregator`]: crate::aggregator::Aggregator

use std::sync::Arc;

use tokio::sync::watch;

use crate::aggregator::PhaseName;
use fedsync_core::{ModelVersion, Weight};

/// An event emitted by the aggregator.
#[derive(Debug, Clone, PartialEq)]
pub struct Event<E> {
    /// The model version that was current when the event was emitted.
    pub version: ModelVersion,
    /// The event itself
    pub event: E,
}

/// Global model update event.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelUpdate(pub Arc<Vec<Weight>>);

/// A convenience type to emit any aggregator event.
#[derive(Debug)]
pub struct EventPublisher {
    /// Version that is attached to all the events.
    version: ModelVersion,
    phase_tx: EventBroadcaster<PhaseName>,
    model_tx: EventBroadcaster<ModelUpdate>,
    pending_tx: EventBroadcaster<usize>,
    clients_tx: EventBroadcaster<usize>,
}

/// The `EventSubscriber` hands out `EventListener`s for any aggregator event.
#[derive(Debug, Clone)]
pub struct EventSubscriber {
    phase_rx: EventListener<PhaseName>,
    model_rx: EventListener<ModelUpdate>,
    pending_rx: EventListener<usize>,
    clients_rx: EventListener<usize>,
}

impl EventPublisher {
    /// Initialize a new event publisher with the given initial events.
    pub fn init(
        version: ModelVersion,
        phase: PhaseName,
        model: ModelUpdate,
        pending: usize,
    ) -> (Self, EventSubscriber) {
        let (phase_tx, phase_rx) = watch::channel(Event {
            version: version.clone(),
            event: phase,
        });
        let (model_tx, model_rx) = watch::channel(Event {
            version: version.clone(),
            event: model,
        });
        let (pending_tx, pending_rx) = watch::channel(Event {
            version: version.clone(),
            event: pending,
        });
        let (clients_tx, clients_rx) = watch::channel(Event {
            version: version.clone(),
            event: 0,
        });

        let publisher = EventPublisher {
            version,
            phase_tx: phase_tx.into(),
            model_tx: model_tx.into(),
            pending_tx: pending_tx.into(),
            clients_tx: clients_tx.into(),
        };

        let subscriber = EventSubscriber {
            phase_rx: phase_rx.into(),
            model_rx: model_rx.into(),
            pending_rx: pending_rx.into(),
            clients_rx: clients_rx.into(),
        };

        (publisher, subscriber)
    }

    /// Set the version that is attached to the events the publisher broadcasts.
    pub fn set_version(&mut self, version: ModelVersion) {
        self.version = version;
    }

    fn event<T>(&self, event: T) -> Event<T> {
        Event {
            version: self.version.clone(),
            event,
        }
    }

    /// Emit a phase event
    pub fn broadcast_phase(&mut self, phase: PhaseName) {
        self.phase_tx.broadcast(self.event(phase));
    }

    /// Emit a model event
    pub fn broadcast_model(&mut self, update: ModelUpdate) {
        self.model_tx.broadcast(self.event(update));
    }

    /// Emit the number of pending updates of the current version
    pub fn broadcast_pending(&mut self, pending: usize) {
        self.pending_tx.broadcast(self.event(pending));
    }

    /// Emit the number of connected clients
    pub fn broadcast_clients(&mut self, clients: usize) {
        self.clients_tx.broadcast(self.event(clients));
    }
}

impl EventSubscriber {
    /// Get a listener for new phase events
    pub fn phase_listener(&self) -> EventListener<PhaseName> {
        self.phase_rx.clone()
    }

    /// Get a listener for new model events
    pub fn model_listener(&self) -> EventListener<ModelUpdate> {
        self.model_rx.clone()
    }

    /// Get a listener for the number of pending updates
    pub fn pending_listener(&self) -> EventListener<usize> {
        self.pending_rx.clone()
    }

    /// Get a listener for the number of connected clients
    pub fn clients_listener(&self) -> EventListener<usize> {
        self.clients_rx.clone()
    }
}

/// A listener for aggregator events. It can be used to either retrieve the latest `Event<E>`
/// emitted by the aggregator (with `EventListener::get_latest`) or to wait for the next one
/// (with `EventListener::changed`).
#[derive(Debug, Clone)]
pub struct EventListener<E>(watch::Receiver<Event<E>>);

impl<E> From<watch::Receiver<Event<E>>> for EventListener<E> {
    fn from(receiver: watch::Receiver<Event<E>>) -> Self {
        EventListener(receiver)
    }
}

impl<E> EventListener<E>
where
    E: Clone,
{
    pub fn get_latest(&self) -> Event<E> {
        self.0.borrow().clone()
    }

    /// Waits for an event that this listener hasn't seen yet and returns it. Returns `None` once
    /// the aggregator is gone.
    pub async fn changed(&mut self) -> Option<Event<E>> {
        self.0.changed().await.ok()?;
        Some(self.0.borrow_and_update().clone())
    }
}

/// A channel to send `Event<E>` to all the `EventListener<E>`.
#[derive(Debug)]
pub struct EventBroadcaster<E>(watch::Sender<Event<E>>);

impl<E> EventBroadcaster<E> {
    /// Send `event` to all the `EventListener<E>`
    fn broadcast(&self, event: Event<E>) {
        // the event is kept even if nobody listens yet
        self.0.send_replace(event);
    }
}

impl<E> From<watch::Sender<Event<E>>> for EventBroadcaster<E> {
    fn from(sender: watch::Sender<Event<E>>) -> Self {
        Self(sender)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_carry_the_version() {
        let (mut publisher, subscriber) = EventPublisher::init(
            ModelVersion::from(1),
            PhaseName::Collecting,
            ModelUpdate(Arc::new(Vec::new())),
            0,
        );
        let mut pending = subscriber.pending_listener();
        assert_eq!(pending.get_latest().event, 0);

        publisher.broadcast_pending(2);
        let event = pending.changed().await.unwrap();
        assert_eq!(event.event, 2);
        assert_eq!(event.version, ModelVersion::from(1));

        publisher.set_version(ModelVersion::from(2));
        publisher.broadcast_phase(PhaseName::Aggregating);
        let phase = subscriber.phase_listener().get_latest();
        assert_eq!(phase.event, PhaseName::Aggregating);
        assert_eq!(phase.version, ModelVersion::from(2));
    }

    #[tokio::test]
    async fn test_listener_ends_with_the_publisher() {
        let (publisher, subscriber) = EventPublisher::init(
            ModelVersion::from(1),
            PhaseName::Collecting,
            ModelUpdate(Arc::new(Vec::new())),
            0,
        );
        let mut clients = subscriber.clients_listener();
        drop(publisher);
        assert!(clients.changed().await.is_none());
    }
}
