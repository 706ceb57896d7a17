use anyhow::Result;

use super::protocol::ConnectParams;

/// Something that happened on a duplex channel, observed by polling.
#[derive(Clone, Debug, PartialEq)]
pub enum ChannelEvent {
    Opened,
    Message(String),
    /// The peer closed the channel.
    Closed(Option<String>),
    /// Transport-level failure. The channel is unusable afterwards.
    Error(String),
}

/// A persistent bidirectional text channel.
///
/// Channels are polled from the scheduler tick and must never block: `poll_event`
/// returns `None` when nothing has arrived yet.
pub trait DuplexChannel {
    fn send_text(&mut self, text: String) -> Result<()>;

    fn poll_event(&mut self) -> Option<ChannelEvent>;

    /// Close the channel. Safe to call repeatedly.
    fn close(&mut self);

    fn is_open(&self) -> bool;
}

/// Opens channels for a streaming session.
pub trait Connector {
    fn connect(&mut self, params: &ConnectParams) -> Result<Box<dyn DuplexChannel>>;
}
