//! Live-location gateway.
//!
//! Workers authenticate over a persistent connection and stream location
//! updates. Each update refreshes the proximity index and is published once
//! to the tracking fanout. Observers join trip rooms; the relay pushes a
//! trip's samples back out to those rooms on every gateway instance.

pub mod auth;
mod error;
pub mod listener;
pub mod protocol;
pub mod relay;
pub mod rooms;
pub mod session;

pub use auth::{CredentialVerifier, JwtVerifier, StaticTokenVerifier};
pub use error::GatewayError;
pub use listener::GatewayListener;
pub use protocol::{ClientEvent, ServerEvent};
pub use relay::{relay_subscription, TripRelay};
pub use rooms::{SessionHandle, TripRooms};
pub use session::{gateway_supervisor, GatewaySettings, LocationGateway, DEFAULT_MAX_LINE_BYTES};
