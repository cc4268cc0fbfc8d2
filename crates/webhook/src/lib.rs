//! HMAC-SHA256 webhook authentication and signed outbound broadcasts.

pub mod auth;
pub mod broadcast;
pub mod envelope;

pub use {
    auth::{SIGNATURE_HEADER, TIMESTAMP_HEADER, WebhookAuthenticator, sign, verify},
    broadcast::{BroadcastReport, WebhookBroadcaster},
    envelope::{EnvelopeClaims, SealedEnvelope},
};
