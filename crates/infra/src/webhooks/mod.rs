//! Outbound webhooks: subscriptions, HMAC-signed delivery with retry, and a
//! bounded delivery log.

pub mod delivery;
pub mod log;
pub mod notifier;
pub mod signing;
pub mod types;

pub use delivery::{
    validate_url, WebhookError, WebhookService, EVENT_HEADER, SIGNATURE_HEADER, WEBHOOK_ID_HEADER,
};
pub use log::DeliveryLog;
pub use notifier::WebhookNotifier;
pub use signing::{generate_secret, sign, verify_signature};
pub use types::{
    Delivery, DeliveryFilter, DeliveryRecord, EventType, Subscription, SubscriptionView,
    WebhookConfig, WebhookPayload, WebhookUpdate,
};
