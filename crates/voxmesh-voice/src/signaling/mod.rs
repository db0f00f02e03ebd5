//! Control connection to the voice relay.
//!
//! One [`SignalingChannel`] per voice-channel session. It authenticates on
//! every (re)connect, decodes inbound frames into typed events, fans them
//! out to subscribers, and reconnects with exponential backoff after
//! abnormal closes.

mod backoff;
mod channel;
mod connection;
mod subscribers;
mod types;


pub use backoff::ReconnectPolicy;
pub use channel::{SignalSink, SignalingChannel};
pub use subscribers::Subscription;
pub use types::{SessionContext, SignalingConfig, SignalingEvent, SignalingSession, TransportState};
