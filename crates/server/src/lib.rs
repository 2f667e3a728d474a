//! HTTP surface and request pipeline for the gateway: configuration,
//! dependency-injected state, the auth/admit/forward/meter dispatcher,
//! the SSE token meter, and axum error/route wiring.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod meter;
pub mod routes;
pub mod state;

pub use config::{ConfigError, GatewayConfig};
pub use routes::router;
pub use state::GatewayState;
