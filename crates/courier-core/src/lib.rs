//! # Courier Core
//!
//! Shared building blocks for the dispatch engine:
//! - [`error`] — crate-wide error enum plus the send/dispatch failure taxonomy
//! - [`config`] — TOML configuration with defaults for every field
//! - [`traits`] — the `SendChannel` / `ChannelFactory` seams implemented by
//!   `courier-channels` and consumed by `courier-scheduler`

pub mod config;
pub mod error;
pub mod traits;

pub use config::CourierConfig;
pub use error::{CourierError, DispatchFailure, Result, SendError};
pub use traits::{Account, ChannelFactory, SendChannel};
