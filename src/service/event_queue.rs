use super::VerificationService;
use crate::Error;
use crate::messages::InboundEvent;
use tokio::sync::mpsc;
use tracing::debug;

/// Feeds inbound events to a service one at a time, in arrival order.
///
/// The sync layer pushes events without waiting; a worker task awaits each
/// [`VerificationService::on_event`] before taking the next one.
#[derive(Clone)]
pub struct EventQueue {
    events: mpsc::UnboundedSender<InboundEvent>,
}

impl EventQueue {
    /// Spawns the worker. Must be called within a Tokio runtime.
    pub fn spawn(service: VerificationService) -> Self {
        let (events, mut receiver) = mpsc::unbounded_channel::<InboundEvent>();

        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                service.on_event(event).await;
            }
            debug!("Event queue closed");
        });

        Self { events }
    }

    pub fn push(&self, event: InboundEvent) -> Result<(), Error> {
        self.events
            .send(event)
            .map_err(|_| Error::Transport("Event queue closed".to_string()))
    }
}
