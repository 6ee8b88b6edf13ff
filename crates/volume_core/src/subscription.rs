use shared::domain::ChangeNotification;
use tokio::sync::broadcast::{self, error::RecvError};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SubscriptionEvent {
    Notification(ChangeNotification),
    /// The receiver fell behind and `skipped` older notifications were dropped.
    Lagged(u64),
    /// The stream ended without [`VolumeSubscription::unsubscribe`].
    Lost,
}

/// Once released, no notification is ever yielded again.
pub struct VolumeSubscription {
    receiver: Option<broadcast::Receiver<ChangeNotification>>,
    released: bool,
}

impl VolumeSubscription {
    pub fn new(receiver: broadcast::Receiver<ChangeNotification>) -> Self {
        Self {
            receiver: Some(receiver),
            released: false,
        }
    }

    /// A handle whose stream is already gone; it can be re-attached.
    pub fn detached() -> Self {
        Self {
            receiver: None,
            released: false,
        }
    }

    pub fn is_live(&self) -> bool {
        self.receiver.is_some()
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Returns `true` only for the call that actually released the stream.
    pub fn unsubscribe(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;
        self.receiver = None;
        true
    }

    /// Installs a fresh receiver after a loss. Refused once released.
    pub fn attach(&mut self, receiver: broadcast::Receiver<ChangeNotification>) -> bool {
        if self.released {
            return false;
        }
        self.receiver = Some(receiver);
        true
    }

    /// Cancel safe. Pends forever while detached or released.
    pub async fn next(&mut self) -> SubscriptionEvent {
        let Some(receiver) = self.receiver.as_mut() else {
            return std::future::pending().await;
        };
        match receiver.recv().await {
            Ok(notification) => SubscriptionEvent::Notification(notification),
            Err(RecvError::Lagged(skipped)) => SubscriptionEvent::Lagged(skipped),
            Err(RecvError::Closed) => {
                self.receiver = None;
                SubscriptionEvent::Lost
            }
        }
    }
}
