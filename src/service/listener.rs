use crate::{PendingVerificationRequest, TransactionSnapshot};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc;
use tracing::debug;

/// Observer of verification lifecycle events.
///
/// Callbacks run one at a time on a dedicated task, never while the service
/// registry is locked, so a listener may call back into the service.
pub trait VerificationListener: Send + Sync {
    fn transaction_created(&self, _transaction: &TransactionSnapshot) {}

    fn transaction_updated(&self, _transaction: &TransactionSnapshot) {}

    fn request_created(&self, _request: &PendingVerificationRequest) {}

    fn request_updated(&self, _request: &PendingVerificationRequest) {}

    fn marked_as_manually_verified(&self, _user_id: &str, _device_id: &str) {}
}

#[derive(Debug)]
pub(crate) enum Notification {
    TransactionCreated(TransactionSnapshot),
    TransactionUpdated(TransactionSnapshot),
    RequestCreated(PendingVerificationRequest),
    RequestUpdated(PendingVerificationRequest),
    ManuallyVerified { user_id: String, device_id: String },
}

type Listeners = Arc<RwLock<Vec<Arc<dyn VerificationListener>>>>;

/// Fans notifications out to listeners, in order, from a single task.
pub(crate) struct ListenerHub {
    listeners: Listeners,
    notifications: mpsc::UnboundedSender<Notification>,
}

impl ListenerHub {
    /// Spawns the dispatcher. It stops once the hub is dropped.
    pub(crate) fn spawn() -> Self {
        let listeners: Listeners = Arc::default();
        let (notifications, mut receiver) = mpsc::unbounded_channel::<Notification>();

        let shared = Arc::clone(&listeners);
        tokio::spawn(async move {
            while let Some(notification) = receiver.recv().await {
                let current = shared.read().unwrap_or_else(PoisonError::into_inner).clone();
                for listener in &current {
                    dispatch(listener.as_ref(), &notification);
                }
            }
            debug!("Listener dispatcher stopped");
        });

        Self {
            listeners,
            notifications,
        }
    }

    pub(crate) fn add(&self, listener: Arc<dyn VerificationListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    pub(crate) fn remove(&self, listener: &Arc<dyn VerificationListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub(crate) fn notify(&self, notification: Notification) {
        if self.notifications.send(notification).is_err() {
            debug!("Listener dispatcher gone, dropping notification");
        }
    }
}

fn dispatch(listener: &dyn VerificationListener, notification: &Notification) {
    match notification {
        Notification::TransactionCreated(tx) => listener.transaction_created(tx),
        Notification::TransactionUpdated(tx) => listener.transaction_updated(tx),
        Notification::RequestCreated(request) => listener.request_created(request),
        Notification::RequestUpdated(request) => listener.request_updated(request),
        Notification::ManuallyVerified { user_id, device_id } => {
            listener.marked_as_manually_verified(user_id, device_id)
        }
    }
}
