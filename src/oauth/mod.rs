//! OAuth domain core
//!
//! The broker's stateful heart: secure token generation, the
//! credential/state/client store, the upstream (Google) provider adapter,
//! and the auto-refreshing credential source handed to downstream business
//! logic.

pub mod provider;
pub mod source;
pub mod store;
pub mod token;

pub use provider::{GoogleProvider, UpstreamProvider, UpstreamToken};
pub use source::RefreshingTokenSource;
pub use store::{FlowState, IssuedCredential, MemoryTokenStore, RegisteredClient, TokenStore};
pub use token::{CLIENT_ID_BYTES, TOKEN_BYTES, generate_token};
