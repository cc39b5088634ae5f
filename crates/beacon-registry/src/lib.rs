//! # beacon-registry
//!
//! Tracks live server-push clients (one per subscriber) and lets any number
//! of tasks add, remove, enumerate and look them up concurrently.
//!
//! - [`Client`]: one subscriber — id, bounded outbound queue, lifetime
//!   [`CancellationToken`](tokio_util::sync::CancellationToken), transport handle
//! - [`ClientRegistry`]: a single owner task holds the client map and serves
//!   requests strictly in submission order
//!
//! The HTTP streaming handshake, payload encoding and transport writes live
//! outside this crate; they consume the client handle and its outbound queue.

#![deny(unsafe_code)]

pub mod client;
pub mod errors;
pub mod manager;
pub mod metrics;
pub mod registry;

pub use client::Client;
pub use errors::{RegistryError, Result};
pub use manager::ClientManager;
pub use registry::{ClientRegistry, Registration, SharedClient};
