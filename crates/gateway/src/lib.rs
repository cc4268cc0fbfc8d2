//! Gateway: composes the session, pipeline, dispatcher, rate limiter,
//! plugins and webhook authenticator into one running service.
//!
//! Lifecycle:
//! 1. Build every component from a validated `ParleyConfig`
//! 2. Register the built-in middlewares and commands, then load plugins
//! 3. Serve `/webhook`, `/health`, `/status` and `/qr`
//! 4. Start the session and feed its events into the pipeline
//! 5. On shutdown or abandoned reconnection, unload plugins and destroy
//!    the session

pub mod builtin;
pub mod health;
pub mod middleware;
pub mod orchestrator;
pub mod server;
pub mod state;

#[cfg(test)]
mod testing;

pub use {
    orchestrator::{Exit, Gateway},
    server::build_gateway_app,
    state::{GatewayState, GatewayStats},
};
