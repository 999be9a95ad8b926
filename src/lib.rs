//! Embedded chat backend host.
//!
//! - [`supervisor::EmbeddedBackend`] runs a loopback HTTP backend on its own
//!   thread with readiness and shutdown signalling.
//! - [`client::ChatClient`] talks to it from a dedicated background loop and
//!   streams `data:` events back through callbacks.
//! - [`conversation::Conversation`] keeps the transcript and the
//!   single-in-flight streaming state on top of the client.

pub mod backend;
pub mod client;
pub mod config;
pub mod conversation;
pub mod environment;
pub mod error;
pub mod models;
pub mod port;
pub mod supervisor;
