//! Shared types, error definitions, and utilities used across all parley crates.

pub mod error;
pub mod types;

pub use {
    error::{Context, Error, FromMessage, ParleyError, Result},
    types::{DeliveryReceipt, InboundEvent, Outbound, now_ms},
};
