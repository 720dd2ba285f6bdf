//! Loopback WebSocket bridge between browser pages and a local OpenPGP agent.
//!
//! A page connects to `ws://127.0.0.1:5151/`, sends JSON commands, and receives
//! a stream of JSON results. Key listing and signing are delegated to an
//! external `gpg` executable.

pub mod agent;
pub mod config;
pub mod error;
pub mod processor;
pub mod server;
pub mod session;

pub use agent::{GpgAgent, ListingFormat};
pub use config::BridgeConfig;
pub use error::AgentError;
pub use server::BridgeServer;
