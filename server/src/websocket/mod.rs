//! WebSocket live channel.
//!
//! Clients keep one connection per replicated (collection, owner) and are
//! told when new changes can be pulled. Data itself always travels over the
//! HTTP pull endpoint.

mod manager;
mod protocol;

pub use manager::ConnectionManager;
pub use protocol::{encode, reply_to};
