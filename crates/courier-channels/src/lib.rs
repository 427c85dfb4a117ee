//! # Courier Channels
//! Send adapters for messaging providers.
//!
//! One adapter instance corresponds to one account's authenticated session.
//! Session material is read from the data directory and cached per account
//! by [`session::SessionCache`].

pub mod session;
pub mod telegram;

pub use session::{Session, SessionCache};
pub use telegram::{TelegramChannel, TelegramChannelFactory};
