pub mod controller;
pub mod store;
pub mod subscription;

pub use controller::{SyncConfig, SyncController, SyncError, SyncEvent};
pub use store::VolumeStore;
pub use subscription::{SubscriptionEvent, VolumeSubscription};
