//! Transport to the remote inference service.
//!
//! This module provides the realtime wire protocol, the duplex channel
//! abstraction the flow controller drives, a WebSocket implementation of it,
//! and an in-memory link for tests and offline runs.

mod channel;
pub mod memory;
pub mod protocol;
mod ws;

pub use channel::{ChannelEvent, Connector, DuplexChannel};
pub use memory::{MemoryConnector, MemoryLink};
pub use protocol::{
    encode_frame_message, parse_reply, roi_descriptor, ConnectParams, DetectionReply, Reply,
};
pub use ws::{WsChannel, WsConnector};
