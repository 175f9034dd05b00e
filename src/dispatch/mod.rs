//! Outbound HTTP fan-out: webhooks for events, notification targets for alerts.
//!
//! Both dispatchers snapshot their targets under the read lock, POST with no
//! lock held, then take the writer lock briefly to update counters. Every
//! attempt lands in a bounded delivery history. There are no retries.

pub mod delivery;
pub mod notifications;
pub mod webhooks;

pub use delivery::{DeliveryCounters, DeliveryStatus};
pub use notifications::{
    Alert, AlertDispatch, AlertInput, NotificationDelivery, NotificationKind, NotificationRouter,
    NotificationTarget, NotificationTargetInput,
};
pub use webhooks::{WebhookDelivery, WebhookDispatcher, WebhookInput, WebhookSubscription};
