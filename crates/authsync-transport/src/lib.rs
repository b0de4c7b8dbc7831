//! Sync transport: how page agents and surfaces reach the central process.
//!
//! A [`MessageChannel`] moves one message and its reply with no delivery
//! guarantee. [`SyncTransport`] layers the per-attempt timeout and the linear
//! retry policy on top of any channel.

pub mod channel;
pub mod transport;

pub use channel::{ChannelError, HttpChannel, LocalChannel, MessageChannel};
pub use transport::{Ack, RetryPolicy, SyncTransport, TransportError};
