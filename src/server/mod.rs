//! HTTP surface of the broker
//!
//! The authorization state machine endpoints, dynamic client registration,
//! discovery metadata, the bearer-auth middleware, and the server wiring.

pub mod auth;
pub mod broker;
pub mod handlers;
pub mod metadata;
pub mod registration;
pub mod router;

pub use auth::AuthenticatedPrincipal;
pub use broker::Broker;
pub use metadata::{AuthorizationServerMetadata, ProtectedResourceMetadata};
pub use router::{AppState, create_router};
