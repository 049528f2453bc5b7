//! Actor Tunnel Protocol Definitions
//!
//! This crate defines the envelope and message kinds exchanged between a
//! runner and the gateway over the tunnel, plus the binary codec used to
//! put them on the wire. Each physical WebSocket frame carries exactly one
//! encoded [`Envelope`].

pub mod codec;
pub mod ids;
pub mod messages;

pub use codec::CodecError;
pub use ids::{MessageId, RequestId};
pub use messages::*;

/// Maximum encoded envelope size (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
